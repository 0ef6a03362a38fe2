//! RISC-V external debug support: JTAG-DTM, the Debug Module, and hart
//! control (spec.md §4.5).

pub mod dm;
pub mod dtm;

pub use dm::DebugModule;
pub use dtm::{Dmi, JtagDtm};

/// Errors specific to the RISC-V DMI/DM transport (spec.md §4.5).
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum RiscvError {
    #[error("no RISC-V debug transport module responded")]
    NoRiscvTarget,

    #[error("unsupported debug transport module version {0}")]
    UnsupportedDtmVersion(u8),

    #[error("DMI operation still in progress")]
    DmiOperationInProgress,

    #[error("DMI access timed out")]
    Timeout,

    #[error("hart {0} does not exist")]
    HartNotFound(u32),

    #[error("abstract command error code {0}")]
    AbstractCommandError(u8),

    #[error("hart reported an unsupported register width")]
    UnsupportedRegisterWidth,
}
