//! Representative device drivers (spec.md §4.9): a full-fidelity ARM
//! Cortex-M flash controller, a full-fidelity AVR XMEGA NVM controller,
//! and two lighter drivers (SAM GPNVM, LPC IAP) that round out the
//! "representative set" without per-family completeness.

pub mod avr_xmega;
pub mod cortex_m;
pub mod lpc40xx;
pub mod samx7x;
pub mod stm32f4;
