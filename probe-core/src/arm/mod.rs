//! ARM Debug Interface v5 (ADIv5): Debug Port + Access Port drivers
//! (spec.md §4.2, §4.3).

pub mod ap;
pub mod dp;

pub use ap::AccessPort;
pub use dp::DebugPort;

/// Which wire protocol a [`DebugPort`] is reached through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    /// JTAG, IR=DPACC/APACC, 35-bit DR shifts.
    Jtag,
    /// Serial Wire Debug, 8-bit request + 3-bit ack + 32-bit data.
    Swd,
}

/// Errors local to the ADIv5 wire protocol and AP register layer.
///
/// Folded into [`crate::Error`] via `#[from]`.
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum DapError {
    /// SWD/JTAG transaction was never acknowledged (`NoAck`/line error).
    #[error("target did not respond to request")]
    NoAcknowledge,
    /// The target responded `FAULT`.
    #[error("target responded with FAULT")]
    FaultResponse,
    /// The target kept responding `WAIT` past the retry budget.
    #[error("target responded WAIT past the retry budget")]
    WaitResponse,
    /// The parity bit on a received data phase was wrong.
    #[error("incorrect parity on data phase")]
    IncorrectParity,
    /// A DP sticky-error bit was latched; must be cleared via `error()`
    /// before the return value of subsequent operations can be trusted.
    #[error("DP sticky error is set (orun={sticky_orun}, err={sticky_err})")]
    StickyError {
        /// `CTRL/STAT.STICKYORUN`.
        sticky_orun: bool,
        /// `CTRL/STAT.STICKYERR`.
        sticky_err: bool,
    },
    /// The AP does not support the requested access width.
    #[error("AP does not support the requested access width")]
    UnsupportedAccessWidth,
}
