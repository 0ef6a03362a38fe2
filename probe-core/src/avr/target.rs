//! AVR XMEGA target attach/halt/resume state machine (spec.md §4.4).

use crate::avr::pdi::{csreg, PdiFeature, PdiTransport};
use crate::avr::PdiError;
use crate::error::{Error, Result};
use crate::link::Link;
use crate::target::{HaltReason, TargetOps};

/// PDI control/status register addresses used by the halt protocol
/// (spec.md §4.4; named literally after the spec's `R3`/`R4`/`RESET`).
mod reg {
    pub const R3: u8 = 0x3;
    pub const R4: u8 = 0x4;
    pub const RESET: u8 = crate::avr::pdi::csreg::RESET;
}

/// Debug-session state of an attached AVR target (spec.md §4.4 state
/// diagram).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AvrState {
    Detached,
    Reset,
    DebugEnabled,
    Halted,
    NvmReady,
}

/// An AVR XMEGA target reached over PDI.
pub struct AvrTarget {
    pub pdi: PdiTransport,
    pub state: AvrState,
}

impl Default for AvrTarget {
    fn default() -> Self {
        Self {
            pdi: PdiTransport::default(),
            state: AvrState::Detached,
        }
    }
}

impl AvrTarget {
    /// `Detached -> Reset -> DebugEnabled` (spec.md §4.4).
    pub fn attach(&mut self, link: &mut dyn Link) -> Result<()> {
        self.pdi.reg_write(link, reg::RESET, 1)?;
        self.state = AvrState::Reset;
        self.pdi.enable(link, PdiFeature::Debug)?;
        self.state = AvrState::DebugEnabled;
        Ok(())
    }

    /// Restore the normal run-time state: resume, disable debug keys
    /// (spec.md §4.6 `detach`).
    pub fn detach(&mut self, link: &mut dyn Link) -> Result<()> {
        if self.state == AvrState::NvmReady {
            self.pdi.disable(link, PdiFeature::Nvm)?;
        }
        self.pdi.disable(link, PdiFeature::Debug)?;
        self.pdi.reg_write(link, reg::RESET, 0)?;
        self.state = AvrState::Detached;
        Ok(())
    }

    /// Halt protocol (spec.md §4.4, §8 scenario 3): write `R4=1`, expect
    /// `R3==0x10`, write `RESET=0`, expect `R3==0x14`, then `R3==0x04`.
    pub fn halt_request(&mut self, link: &mut dyn Link) -> Result<HaltReason> {
        self.pdi.reg_write(link, reg::R4, 1)?;
        let r3 = self.pdi.reg_read(link, reg::R3)?;
        if r3 != 0x10 {
            return Err(Error::TargetProtocolError("incorrect state".into()));
        }

        self.pdi.reg_write(link, reg::RESET, 0)?;
        let r3 = self.pdi.reg_read(link, reg::R3)?;
        if r3 != 0x14 {
            return Err(Error::TargetProtocolError("incorrect state".into()));
        }

        let r3 = self.pdi.reg_read(link, reg::R3)?;
        if r3 != 0x04 {
            return Err(Error::TargetProtocolError("incorrect state".into()));
        }

        self.state = AvrState::Halted;
        Ok(HaltReason::Request)
    }

    /// Enable NVM programming and make sure the PDI bus is idle before
    /// erase/write operations (spec.md §4.4 `NvmReady` transition).
    ///
    /// The newer source behaviour applies here (spec.md §9): `reset`
    /// conditionally disables the NVM/DEBUG units rather than
    /// unconditionally checking `STATUS` after every write.
    pub fn ensure_nvm_ready(&mut self, link: &mut dyn Link) -> Result<()> {
        if self.state != AvrState::Halted && self.state != AvrState::NvmReady {
            return Err(Error::Pdi(PdiError::UnexpectedState(
                "target must be halted before NVM programming",
            )));
        }
        if self.state == AvrState::Halted {
            self.pdi.enable(link, PdiFeature::Nvm)?;
            self.state = AvrState::NvmReady;
        }
        Ok(())
    }
}

/// GPRs are memory-mapped at the bottom of data space on AVR XMEGA
/// (spec.md §4.4).
const GPR_BASE: u32 = 0x0000;

impl crate::target::TargetOps for AvrTarget {
    fn attach(&mut self, link: &mut dyn Link) -> Result<()> {
        AvrTarget::attach(self, link)
    }

    fn detach(&mut self, link: &mut dyn Link) -> Result<()> {
        AvrTarget::detach(self, link)
    }

    fn check_error(&mut self, _link: &mut dyn Link) -> Result<bool> {
        Ok(false)
    }

    fn mem_read(&mut self, link: &mut dyn Link, address: u32, data: &mut [u8]) -> Result<()> {
        for (i, chunk) in data.chunks_mut(4).enumerate() {
            let addr = address + (i * 4) as u32;
            let value = self.pdi.read(link, chunk.len() as u8, addr)?;
            chunk.copy_from_slice(&value.to_le_bytes()[..chunk.len()]);
        }
        Ok(())
    }

    fn mem_write(&mut self, link: &mut dyn Link, address: u32, data: &[u8]) -> Result<()> {
        for (i, chunk) in data.chunks(4).enumerate() {
            let addr = address + (i * 4) as u32;
            let mut bytes = [0u8; 4];
            bytes[..chunk.len()].copy_from_slice(chunk);
            let value = u32::from_le_bytes(bytes);
            self.pdi.write(link, chunk.len() as u8, addr, value)?;
        }
        Ok(())
    }

    fn regs_read(&mut self, link: &mut dyn Link, out: &mut [u32]) -> Result<()> {
        for (i, slot) in out.iter_mut().enumerate() {
            *slot = TargetOps::reg_read(self, link, i as u32)?;
        }
        Ok(())
    }

    fn regs_write(&mut self, link: &mut dyn Link, values: &[u32]) -> Result<()> {
        for (i, &value) in values.iter().enumerate() {
            TargetOps::reg_write(self, link, i as u32, value)?;
        }
        Ok(())
    }

    /// AVR has no separate register file access opcode: GPRs are plain
    /// data-space bytes (spec.md §4.4).
    fn reg_read(&mut self, link: &mut dyn Link, reg: u32) -> Result<u32> {
        Ok(self.pdi.read(link, 1, GPR_BASE + reg)?)
    }

    fn reg_write(&mut self, link: &mut dyn Link, reg: u32, value: u32) -> Result<()> {
        self.pdi.write(link, 1, GPR_BASE + reg, value)
    }

    fn reset(&mut self, link: &mut dyn Link) -> Result<()> {
        self.pdi.reg_write(link, reg::RESET, 1)?;
        self.pdi.reg_write(link, reg::RESET, 0)
    }

    fn halt_request(&mut self, link: &mut dyn Link) -> Result<()> {
        AvrTarget::halt_request(self, link)?;
        Ok(())
    }

    fn halt_poll(&mut self, _link: &mut dyn Link) -> Result<HaltReason> {
        Ok(match self.state {
            AvrState::Halted | AvrState::NvmReady => HaltReason::Request,
            _ => HaltReason::Running,
        })
    }

    fn halt_resume(&mut self, link: &mut dyn Link, _step: bool) -> Result<()> {
        self.pdi.reg_write(link, reg::R4, 0)?;
        self.state = AvrState::DebugEnabled;
        Ok(())
    }

    /// PDI exposes no hardware breakpoint comparators in this driver; a
    /// caller should fall back to a software breakpoint (spec.md §4.7).
    fn breakwatch_set(
        &mut self,
        _link: &mut dyn Link,
        _kind: crate::target::BreakwatchKind,
        _addr: u64,
        _size: u32,
    ) -> Result<crate::target::BreakwatchOutcome> {
        Ok(crate::target::BreakwatchOutcome::Unsupported)
    }

    fn breakwatch_clear(&mut self, _link: &mut dyn Link, _slot: u8) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::link::{Ack, Link, Register};
    use std::collections::HashMap;

    /// Interprets a stream of 9-bit PDI shifts as a command/reply protocol,
    /// enough to unit-test [`PdiTransport`] and [`AvrTarget`] without real
    /// silicon.
    #[derive(Default)]
    pub struct MockPdiLink {
        csregs: HashMap<u8, u8>,
        pending: Pending,
        /// Values `R3` advances through on successive `LDCS` reads, queued
        /// ahead of the static `csregs` entry (spec.md §8 scenario 3: the
        /// core's internal state machine moves `R3` between each read).
        r3_sequence: std::collections::VecDeque<u8>,
    }

    #[derive(Default)]
    enum Pending {
        #[default]
        None,
        Ldcs(u8),
        Stcs(u8),
        Key(Vec<u8>),
        StsAddr {
            data_bytes: u8,
            collected: Vec<u8>,
        },
        StsData {
            addr: u32,
            data_bytes: u8,
            collected: Vec<u8>,
        },
        LdsAddr {
            data_bytes: u8,
            collected: Vec<u8>,
        },
        LdsReply {
            remaining: u8,
            addr: u32,
        },
    }

    impl MockPdiLink {
        pub fn new() -> Self {
            let mut csregs = HashMap::new();
            csregs.insert(csreg::STATUS, 0);
            Self {
                csregs,
                pending: Pending::None,
                r3_sequence: std::collections::VecDeque::new(),
            }
        }

        pub fn set_csreg(&mut self, reg: u8, value: u8) {
            self.csregs.insert(reg, value);
        }

        /// Script the halt-request sequence (spec.md §8 scenario 3): `R3`
        /// reads `0x10`, then `0x14`, then `0x04` across the three `LDCS`
        /// reads `AvrTarget::halt_request` performs.
        pub fn script_halt_sequence(&mut self) {
            self.r3_sequence = std::collections::VecDeque::from([0x10, 0x14, 0x04]);
        }
    }

    impl Link for MockPdiLink {
        fn shift_dr_ir(
            &mut self,
            _which: Register,
            out_bits: &[u8],
            in_bits: &mut [u8],
            bit_count: usize,
        ) -> Result<()> {
            assert_eq!(bit_count, 9);
            let byte = out_bits[0];
            let mut reply = 0u8;

            self.pending = match std::mem::take(&mut self.pending) {
                Pending::None => {
                    let opcode = byte & 0b1110_0000;
                    match opcode {
                        0b1000_0000 => Pending::Ldcs(byte & 0xF), // LDCS
                        0b1100_0000 => Pending::Stcs(byte & 0xF), // STCS
                        0b1110_0000 => Pending::Key(Vec::new()),  // KEY
                        0b0010_0000 => {
                            // STS, address then data
                            let addr_bytes = ((byte >> 2) & 0b11) + 1;
                            let data_bytes = (byte & 0b11) + 1;
                            Pending::StsAddr {
                                data_bytes,
                                collected: Vec::with_capacity(addr_bytes as usize),
                            }
                        }
                        0b0000_0000 => {
                            let addr_bytes = ((byte >> 2) & 0b11) + 1;
                            let data_bytes = (byte & 0b11) + 1;
                            Pending::LdsAddr {
                                data_bytes,
                                collected: Vec::with_capacity(addr_bytes as usize),
                            }
                        }
                        _ => Pending::None,
                    }
                }
                Pending::Ldcs(r) => {
                    reply = if r == super::reg::R3 {
                        self.r3_sequence
                            .pop_front()
                            .unwrap_or_else(|| *self.csregs.get(&r).unwrap_or(&0))
                    } else {
                        *self.csregs.get(&r).unwrap_or(&0)
                    };
                    Pending::None
                }
                Pending::Stcs(r) => {
                    self.csregs.insert(r, byte);
                    Pending::None
                }
                Pending::Key(mut collected) => {
                    collected.push(byte);
                    if collected.len() == 8 {
                        // Either key enables both bits for simplicity; a
                        // real device distinguishes by key content.
                        let status = *self.csregs.get(&csreg::STATUS).unwrap_or(&0);
                        self.csregs.insert(csreg::STATUS, status | 0b11);
                        Pending::None
                    } else {
                        Pending::Key(collected)
                    }
                }
                Pending::StsAddr {
                    data_bytes,
                    mut collected,
                } => {
                    collected.push(byte);
                    if collected.len() == 4 {
                        let addr = u32::from_le_bytes(collected.try_into().unwrap());
                        Pending::StsData {
                            addr,
                            data_bytes,
                            collected: Vec::new(),
                        }
                    } else {
                        Pending::StsAddr {
                            data_bytes,
                            collected,
                        }
                    }
                }
                Pending::StsData {
                    addr,
                    data_bytes,
                    mut collected,
                } => {
                    collected.push(byte);
                    if collected.len() == data_bytes as usize {
                        Pending::None
                    } else {
                        Pending::StsData {
                            addr: addr + 1,
                            data_bytes,
                            collected,
                        }
                    }
                }
                Pending::LdsAddr {
                    data_bytes,
                    mut collected,
                } => {
                    collected.push(byte);
                    if collected.len() == 4 {
                        let addr = u32::from_le_bytes(collected.try_into().unwrap());
                        Pending::LdsReply {
                            remaining: data_bytes,
                            addr,
                        }
                    } else {
                        Pending::LdsAddr {
                            data_bytes,
                            collected,
                        }
                    }
                }
                Pending::LdsReply { remaining, addr } => {
                    reply = (addr & 0xFF) as u8;
                    if remaining > 1 {
                        Pending::LdsReply {
                            remaining: remaining - 1,
                            addr: addr + 1,
                        }
                    } else {
                        Pending::None
                    }
                }
            };

            in_bits[0] = reply;
            in_bits[1] = (reply.count_ones() % 2 == 0) as u8;
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
    fn halt_request_matches_scripted_sequence() {
        let mut link = MockPdiLink::new();
        link.script_halt_sequence();
        let mut target = AvrTarget {
            state: AvrState::DebugEnabled,
            ..Default::default()
        };

        let reason = target.halt_request(&mut link).unwrap();
        assert_eq!(reason, HaltReason::Request);
        assert_eq!(target.state, AvrState::Halted);
    }

    #[test]
    fn attach_moves_through_reset_to_debug_enabled() {
        let mut link = MockPdiLink::new();
        let mut target = AvrTarget::default();
        target.attach(&mut link).unwrap();
        assert_eq!(target.state, AvrState::DebugEnabled);
    }
}
