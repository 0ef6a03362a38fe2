//! Crate-wide error taxonomy.
//!
//! Every fallible operation in this crate eventually resolves to one of
//! these kinds. Subsystems define their own narrower error enums
//! (`DapError`, `PdiError`, `RiscvError`, `FlashError`) and fold them into
//! [`Error`] via `#[from]`/`#[source]`, mirroring the way a generic-probe
//! crate layers an architecture-specific error under one umbrella type.

use crate::arm::DapError;
use crate::avr::PdiError;
use crate::flash::FlashError;
use crate::riscv::RiscvError;

/// The overarching error type returned by target-facing operations.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// The underlying bit-shift link reported a physical failure.
    #[error("link error: {0}")]
    Link(String),

    /// A wait loop for an ACK/BSY/status bit expired before the deadline.
    #[error("transport timed out waiting for {0}")]
    TransportTimeout(&'static str),

    /// A wire-level inconsistency was observed (SWD sticky FAULT, PDI parity
    /// mismatch, DP sticky-err).
    #[error("transport protocol error: {0}")]
    TransportProtocolError(String),

    /// The transport completed but the target signalled a memory-access
    /// fault.
    #[error("target bus error at {address:#010x}")]
    TargetBusError {
        /// Address of the faulting access, if known.
        address: u32,
    },

    /// The target is in an unexpected debug state.
    #[error("target protocol error: {0}")]
    TargetProtocolError(String),

    /// The flash controller returned an error status.
    #[error("flash error: {0}")]
    Flash(#[from] FlashError),

    /// The requested operation is not supported by this target/driver.
    #[error("unsupported operation: {0}")]
    Unsupported(&'static str),

    /// Dynamic allocation failed.
    #[error("heap exhausted")]
    HeapExhaustion,

    /// The operation was interrupted by the host (e.g. link dropped).
    #[error("operation cancelled")]
    Cancelled,

    /// An ADIv5 DP/AP level error occurred.
    #[error("ADIv5 error")]
    Dap(#[from] DapError),

    /// An AVR PDI level error occurred.
    #[error("PDI error")]
    Pdi(#[from] PdiError),

    /// A RISC-V DMI/DM level error occurred.
    #[error("RISC-V debug error")]
    Riscv(#[from] RiscvError),
}

impl Error {
    /// True for errors that must cause the target to be detached
    /// (spec.md §7: `LinkError`, repeated `TransportProtocolError`).
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::Link(_) | Error::TransportProtocolError(_) | Error::Cancelled
        )
    }
}

pub type Result<T> = core::result::Result<T, Error>;
