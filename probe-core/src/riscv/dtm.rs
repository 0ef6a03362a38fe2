//! JTAG Debug Transport Module: the `dtmcs`/`dmi` JTAG registers that sit
//! below the RISC-V Debug Module (spec.md §4.5).
//!
//! Like an ADIv5 AP register, a `dmi` access is pipelined: the scan that
//! issues a read only latches the target address, and the data comes back
//! on the *next* scan. [`JtagDtm`] hides that behind `dmi_read`/`dmi_write`
//! the same way [`crate::arm::dp::DebugPort`] hides the AP read pipeline.

use std::time::{Duration, Instant};

use bitfield::bitfield;

use crate::error::{Error, Result};
use crate::link::{Link, Register};
use crate::riscv::RiscvError;

const IR_DTMCS: u8 = 0x10;
const IR_DMI: u8 = 0x11;

bitfield! {
    struct Dtmcs(u32);
    impl Debug;
    u32;
    dmihardreset, set_dmihardreset: 17;
    dmireset, set_dmireset: 16;
    idle, _: 14, 12;
    dmistat, _: 11, 10;
    abits, _: 9, 4;
    version, _: 3, 0;
}

/// DMI operation result codes (riscv-debug-spec §6.1.5).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DmiOp {
    Success,
    Failed,
    Busy,
}

impl DmiOp {
    fn from_bits(bits: u8) -> Self {
        match bits & 0b11 {
            0 | 1 => DmiOp::Success,
            2 => DmiOp::Failed,
            _ => DmiOp::Busy,
        }
    }
}

/// Synchronous DMI access (spec.md §9: a single-threaded, non-deferred
/// RISC-V transport rather than a batched command queue).
pub trait Dmi {
    fn dmi_read(&mut self, link: &mut dyn Link, address: u8) -> Result<u32>;
    fn dmi_write(&mut self, link: &mut dyn Link, address: u8, data: u32) -> Result<()>;
}

/// Drives `dtmcs`/`dmi` over a plain JTAG [`Link`].
pub struct JtagDtm {
    abits: u32,
    idle_cycles: u8,
    pub timeout: Duration,
}

impl Default for JtagDtm {
    fn default() -> Self {
        Self {
            abits: 0,
            idle_cycles: 0,
            timeout: Duration::from_millis(500),
        }
    }
}

impl JtagDtm {
    /// Reads `dtmcs`, validates version 1, and records `abits`/idle cycles
    /// for later `dmi` scans (spec.md §4.5).
    pub fn init(&mut self, link: &mut dyn Link) -> Result<()> {
        let raw = self.shift_ir_dr(link, IR_DTMCS, 0, 32)?;
        if raw == 0 {
            return Err(Error::Riscv(RiscvError::NoRiscvTarget));
        }
        let dtmcs = Dtmcs(raw);
        if dtmcs.version() != 1 {
            return Err(Error::Riscv(RiscvError::UnsupportedDtmVersion(
                dtmcs.version() as u8,
            )));
        }
        self.abits = dtmcs.abits();
        self.idle_cycles = dtmcs.idle() as u8;
        Ok(())
    }

    fn clear_error(&mut self, link: &mut dyn Link) -> Result<()> {
        let mut dtmcs = Dtmcs(0);
        dtmcs.set_dmireset(true);
        self.shift_ir_dr(link, IR_DTMCS, dtmcs.0, 32)?;
        Ok(())
    }

    fn shift_ir_dr(&self, link: &mut dyn Link, ir: u8, dr: u32, dr_bits: usize) -> Result<u32> {
        let mut ir_in = [0u8; 1];
        link.shift_dr_ir(Register::Ir, &[ir], &mut ir_in, 5)?;

        let out = dr.to_le_bytes();
        let mut in_bits = [0u8; 4];
        link.shift_dr_ir(Register::Dr, &out, &mut in_bits, dr_bits)?;
        Ok(u32::from_le_bytes(in_bits))
    }

    /// One `dmi` scan: `address:abits | data:32 | op:2`, returning the
    /// value shifted back in along with its op status.
    fn dmi_scan(&mut self, link: &mut dyn Link, address: u8, data: u32, op: u8) -> Result<(u32, DmiOp)> {
        let word = ((address as u64) << 34) | ((data as u64) << 2) | (op as u64 & 0b11);
        let bits = self.abits as usize + 34;
        let byte_len = bits.div_ceil(8);

        let mut ir_in = [0u8; 1];
        link.shift_dr_ir(Register::Ir, &[IR_DMI], &mut ir_in, 5)?;

        let out = word.to_le_bytes();
        let mut in_bits = [0u8; 8];
        link.shift_dr_ir(Register::Dr, &out[..byte_len], &mut in_bits[..byte_len], bits)?;
        let raw = u64::from_le_bytes(in_bits);

        let status = DmiOp::from_bits((raw & 0b11) as u8);
        let value = ((raw >> 2) & 0xFFFF_FFFF) as u32;
        Ok((value, status))
    }

    /// Scan, retrying on `busy` (which requires a `dmireset` before the
    /// next attempt) until `timeout` elapses.
    fn dmi_scan_retrying(&mut self, link: &mut dyn Link, address: u8, data: u32, op: u8) -> Result<u32> {
        let deadline = Instant::now() + self.timeout;
        loop {
            let (value, status) = self.dmi_scan(link, address, data, op)?;
            match status {
                DmiOp::Success => return Ok(value),
                DmiOp::Failed => {
                    return Err(Error::TransportProtocolError("DMI operation failed".into()))
                }
                DmiOp::Busy => {
                    self.clear_error(link)?;
                    self.idle_cycles = self.idle_cycles.saturating_add(1);
                    if Instant::now() >= deadline {
                        return Err(Error::Riscv(RiscvError::Timeout));
                    }
                }
            }
        }
    }
}

impl Dmi for JtagDtm {
    /// Issue the read, then a follow-up no-op scan to collect the value
    /// that the first scan only latched (pipelined, like an ADIv5 AP
    /// read).
    fn dmi_read(&mut self, link: &mut dyn Link, address: u8) -> Result<u32> {
        self.dmi_scan_retrying(link, address, 0, 0b01)?;
        self.dmi_scan_retrying(link, 0, 0, 0b00)
    }

    /// Issue the write, then flush it with a no-op scan so a subsequent
    /// access doesn't observe it mid-flight.
    fn dmi_write(&mut self, link: &mut dyn Link, address: u8, data: u32) -> Result<()> {
        self.dmi_scan_retrying(link, address, data, 0b10)?;
        self.dmi_scan_retrying(link, 0, 0, 0b00)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::Ack;
    use std::collections::HashMap;

    #[derive(Default)]
    struct MockDtmLink {
        regs: HashMap<u8, u32>,
        last_address: u8,
        pending_read: Option<u32>,
        current_ir: u8,
    }

    impl Link for MockDtmLink {
        fn shift_dr_ir(
            &mut self,
            which: Register,
            out_bits: &[u8],
            in_bits: &mut [u8],
            bit_count: usize,
        ) -> Result<()> {
            match which {
                Register::Ir => {
                    self.current_ir = out_bits[0];
                    in_bits[0] = 0;
                }
                Register::Dr if self.current_ir == IR_DTMCS => {
                    let mut dtmcs = Dtmcs(0);
                    dtmcs.set_dmireset(false);
                    let reply: u32 = (1) | (7 << 4) | (1 << 12); // version=1 abits=7 idle=1
                    in_bits[..4].copy_from_slice(&reply.to_le_bytes());
                }
                Register::Dr => {
                    let mut bytes = [0u8; 8];
                    bytes[..in_bits.len().min(8)].copy_from_slice(&out_bits[..in_bits.len().min(8)]);
                    let word = u64::from_le_bytes(bytes);
                    let op = (word & 0b11) as u8;
                    let address = (word >> 34) as u8;
                    let data = ((word >> 2) & 0xFFFF_FFFF) as u32;

                    let reply_value = self.pending_read.take().unwrap_or(0);
                    match op {
                        0b01 => {
                            self.last_address = address;
                            self.pending_read = Some(*self.regs.get(&address).unwrap_or(&0));
                        }
                        0b10 => {
                            self.regs.insert(address, data);
                        }
                        _ => {}
                    }
                    let reply = (reply_value as u64) << 2;
                    in_bits[..bit_count.div_ceil(8)]
                        .copy_from_slice(&reply.to_le_bytes()[..bit_count.div_ceil(8)]);
                }
            }
            Ok(())
        }

        fn tdi_seq(&mut self, _tms_final: bool, _bit_pattern: &[u8], _count: usize) -> Result<()> {
            Ok(())
        }

        fn tdi_tdo_seq(
            &mut self,
            _tms_final: bool,
            _bit_pattern: &[u8],
            _capture: &mut [u8],
            _count: usize,
        ) -> Result<()> {
            Ok(())
        }

        fn swd_read(&mut self, _request_byte: u8) -> Result<(Ack, u32, bool)> {
            Ok((Ack::Ok, 0, false))
        }

        fn swd_write(&mut self, _request_byte: u8, _data: u32, _parity: bool) -> Result<Ack> {
            Ok(Ack::Ok)
        }

        fn return_idle(&mut self) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn dmi_write_then_read_round_trips() {
        let mut link = MockDtmLink::default();
        let mut dtm = JtagDtm::default();
        dtm.init(&mut link).unwrap();
        assert_eq!(dtm.abits, 7);

        dtm.dmi_write(&mut link, 0x10, 0xdead_beef).unwrap();
        let value = dtm.dmi_read(&mut link, 0x10).unwrap();
        assert_eq!(value, 0xdead_beef);
    }
}
