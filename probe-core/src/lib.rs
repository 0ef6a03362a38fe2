//! Target-abstraction and debug-transport core for an in-circuit debug
//! probe: ADIv5 DP/AP, AVR-PDI, and RISC-V DMI/DM transports behind one
//! target vtable, a buffered flash-programming engine, and breakpoint/
//! watchpoint management.
//!
//! Physical bit-banging of JTAG/SWD, the GDB remote-serial protocol, and
//! USB/CLI bring-up are out of scope — everything here talks to the wire
//! exclusively through the [`link::Link`] trait.

pub mod arm;
pub mod avr;
pub mod commands;
pub mod devices;
pub mod error;
pub mod flash;
pub mod link;
pub mod riscv;
pub mod session;
pub mod target;

pub use error::{Error, Result};
pub use session::Session;
pub use target::{Target, TargetArena, TargetId, TargetOps};
