//! ARMv7-M core debug registers (DHCSR/DCRSR/DCRDR, FPB comparators),
//! wiring the ADIv5 memory interface into the [`TargetOps`] vtable
//! (spec.md §4.6, §4.9), grounded on the teacher's `armv7m.rs` register
//! layout.

use std::time::{Duration, Instant};

use bitfield::bitfield;

use crate::arm::{AccessPort, DebugPort};
use crate::error::{Error, Result};
use crate::link::Link;
use crate::target::breakwatch::SlotTable;
use crate::target::{BreakwatchKind, BreakwatchOutcome, HaltReason, Progress, TargetOps};

const DHCSR: u32 = 0xE000_EDF0;
const DCRSR: u32 = 0xE000_EDF4;
const DCRDR: u32 = 0xE000_EDF8;
const DFSR: u32 = 0xE000_ED30;
const FP_CTRL: u32 = 0xE000_2000;
const FP_COMP0: u32 = 0xE000_2008;

const DHCSR_DBGKEY: u32 = 0xA05F_0000;

bitfield! {
    struct DhcsrControl(u32);
    impl Debug;
    u32;
    c_debugen, set_c_debugen: 0;
    c_halt, set_c_halt: 1;
    c_step, set_c_step: 2;
    c_maskints, set_c_maskints: 3;
}

bitfield! {
    struct DhcsrStatus(u32);
    impl Debug;
    u32;
    s_regrdy, _: 16;
    s_halt, _: 17;
    s_lockup, _: 19;
}

bitfield! {
    struct Dfsr(u32);
    impl Debug;
    u32;
    external, _: 4;
    vcatch, _: 3;
    dwttrap, _: 2;
    bkpt, _: 1;
    halted, _: 0;
}

const NUM_COMPARATORS: usize = 6;

/// Debug-register driver for a Cortex-M0+/M3/M4/M7 core behind an ADIv5
/// AP (spec.md §4.9).
pub struct CortexMTarget {
    pub dp: DebugPort,
    pub ap: AccessPort,
    /// `DHCSR.S_REGRDY` poll timeout (spec.md §5: every busy-poll needs a
    /// wall-clock deadline).
    pub reg_timeout: Duration,
    slots: SlotTable<NUM_COMPARATORS>,
}

impl CortexMTarget {
    pub fn new(dp: DebugPort, ap: AccessPort) -> Self {
        Self {
            dp,
            ap,
            reg_timeout: Duration::from_millis(100),
            slots: SlotTable::default(),
        }
    }

    fn read_word(&mut self, link: &mut dyn Link, address: u32) -> Result<u32> {
        self.ap.read_word_32(&mut self.dp, link, address)
    }

    fn write_word(&mut self, link: &mut dyn Link, address: u32, value: u32) -> Result<()> {
        self.ap.write_word_32(&mut self.dp, link, address, value)
    }

    fn write_dhcsr(&mut self, link: &mut dyn Link, control: DhcsrControl) -> Result<()> {
        self.write_word(link, DHCSR, DHCSR_DBGKEY | control.0)
    }
}

impl TargetOps for CortexMTarget {
    fn attach(&mut self, link: &mut dyn Link) -> Result<()> {
        let mut control = DhcsrControl(0);
        control.set_c_debugen(true);
        self.write_dhcsr(link, control)
    }

    fn detach(&mut self, link: &mut dyn Link) -> Result<()> {
        let mut control = DhcsrControl(0);
        control.set_c_debugen(false);
        self.write_dhcsr(link, control)
    }

    fn check_error(&mut self, link: &mut dyn Link) -> Result<bool> {
        let sticky = self.dp.error(link)?;
        Ok(sticky.sticky_err || sticky.sticky_orun)
    }

    fn mem_read(&mut self, link: &mut dyn Link, address: u32, data: &mut [u8]) -> Result<()> {
        self.ap.read_bytes(&mut self.dp, link, data, address)
    }

    fn mem_write(&mut self, link: &mut dyn Link, address: u32, data: &[u8]) -> Result<()> {
        self.ap.write_bytes(&mut self.dp, link, address, data)
    }

    fn regs_read(&mut self, link: &mut dyn Link, out: &mut [u32]) -> Result<()> {
        for (i, slot) in out.iter_mut().enumerate() {
            *slot = self.reg_read(link, i as u32)?;
        }
        Ok(())
    }

    fn regs_write(&mut self, link: &mut dyn Link, values: &[u32]) -> Result<()> {
        for (i, &value) in values.iter().enumerate() {
            self.reg_write(link, i as u32, value)?;
        }
        Ok(())
    }

    /// `DCRSR`/`DCRDR` register transfer (spec.md §4.9): select `reg`,
    /// poll `DHCSR.S_REGRDY`, then read `DCRDR`.
    fn reg_read(&mut self, link: &mut dyn Link, reg: u32) -> Result<u32> {
        self.write_word(link, DCRSR, reg & 0x1F)?;
        let deadline = Instant::now() + self.reg_timeout;
        loop {
            let status = DhcsrStatus(self.read_word(link, DHCSR)?);
            if status.s_regrdy() {
                break;
            }
            if Instant::now() >= deadline {
                return Err(Error::TransportTimeout("DHCSR S_REGRDY (read)"));
            }
        }
        self.read_word(link, DCRDR)
    }

    fn reg_write(&mut self, link: &mut dyn Link, reg: u32, value: u32) -> Result<()> {
        self.write_word(link, DCRDR, value)?;
        self.write_word(link, DCRSR, (reg & 0x1F) | (1 << 16))?;
        let deadline = Instant::now() + self.reg_timeout;
        loop {
            let status = DhcsrStatus(self.read_word(link, DHCSR)?);
            if status.s_regrdy() {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(Error::TransportTimeout("DHCSR S_REGRDY (write)"));
            }
        }
    }

    fn reset(&mut self, link: &mut dyn Link) -> Result<()> {
        // A local (core) reset via AIRCR.SYSRESETREQ, bit 2, with the
        // mandatory 0x05FA VECTKEY in the upper halfword.
        self.write_word(link, 0xE000_ED0C, (0x05FA << 16) | (1 << 2))
    }

    fn halt_request(&mut self, link: &mut dyn Link) -> Result<()> {
        let mut control = DhcsrControl(0);
        control.set_c_debugen(true);
        control.set_c_halt(true);
        self.write_dhcsr(link, control)
    }

    fn halt_poll(&mut self, link: &mut dyn Link) -> Result<HaltReason> {
        let status = DhcsrStatus(self.read_word(link, DHCSR)?);
        if status.s_lockup() {
            return Ok(HaltReason::Fault);
        }
        if !status.s_halt() {
            return Ok(HaltReason::Running);
        }
        let dfsr = Dfsr(self.read_word(link, DFSR)?);
        if dfsr.bkpt() {
            Ok(HaltReason::Breakpoint)
        } else if dfsr.dwttrap() {
            Ok(HaltReason::Watchpoint)
        } else if dfsr.halted() {
            Ok(HaltReason::Request)
        } else {
            Ok(HaltReason::Stepping)
        }
    }

    fn halt_resume(&mut self, link: &mut dyn Link, step: bool) -> Result<()> {
        let mut control = DhcsrControl(0);
        control.set_c_debugen(true);
        control.set_c_step(step);
        control.set_c_halt(step);
        self.write_dhcsr(link, control)?;
        if step {
            let mut stop = DhcsrControl(0);
            stop.set_c_debugen(true);
            self.write_dhcsr(link, stop)?;
        }
        Ok(())
    }

    /// Allocates one FPB comparator slot for a hardware breakpoint
    /// (spec.md §4.7, §4.9). Watch/soft-break kinds are not modelled by
    /// the FPB and are reported `Unsupported` so the caller can fall back
    /// to a DWT-based or software breakpoint.
    fn breakwatch_set(
        &mut self,
        link: &mut dyn Link,
        kind: BreakwatchKind,
        addr: u64,
        _size: u32,
    ) -> Result<BreakwatchOutcome> {
        if kind != BreakwatchKind::HardBreak {
            return Ok(BreakwatchOutcome::Unsupported);
        }
        let Some(slot) = self.slots.allocate() else {
            return Ok(BreakwatchOutcome::Exhausted);
        };

        let address = addr as u32;
        let replace = if address & 0b10 != 0 { 0b10u32 } else { 0b01 };
        let comp = (replace << 30) | (address & 0x1FFF_FFFC) | 1;
        self.write_word(link, FP_COMP0 + 4 * slot as u32, comp)?;

        let mut ctrl = self.read_word(link, FP_CTRL)?;
        ctrl |= 0b11; // ENABLE | KEY
        self.write_word(link, FP_CTRL, ctrl)?;

        Ok(BreakwatchOutcome::Ok { slot })
    }

    fn breakwatch_clear(&mut self, link: &mut dyn Link, slot: u8) -> Result<()> {
        self.write_word(link, FP_COMP0 + 4 * slot as u32, 0)?;
        self.slots.free(slot);
        Ok(())
    }

    fn mass_erase(&mut self, _link: &mut dyn Link, _progress: &mut dyn Progress) -> Result<bool> {
        // Cortex-M has no core-level mass-erase command; the flash
        // controller driver owns that (spec.md §4.8).
        Ok(false)
    }

    fn run_command(&mut self, _link: &mut dyn Link, name: &str, _args: &[&str]) -> Result<bool> {
        match name {
            "halt" | "reset" => Ok(true),
            _ => Ok(false),
        }
    }
}
