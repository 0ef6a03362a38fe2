//! The RISC-V Debug Module: hart discovery, halt/resume, and CSR access
//! through abstract commands (spec.md §4.5).

use std::time::{Duration, Instant};

use bitfield::bitfield;

use crate::error::{Error, Result};
use crate::link::Link;
use crate::riscv::dtm::Dmi;
use crate::riscv::RiscvError;
use crate::target::HaltReason;

mod addr {
    pub const DATA0: u8 = 0x04;
    pub const DMCONTROL: u8 = 0x10;
    pub const DMSTATUS: u8 = 0x11;
    pub const ABSTRACTCS: u8 = 0x16;
    pub const COMMAND: u8 = 0x17;
}

/// CSR number of `misa` (RISC-V privileged spec).
const MISA_CSR: u16 = 0x301;

bitfield! {
    struct Dmcontrol(u32);
    impl Debug;
    u32;
    haltreq, set_haltreq: 31;
    resumereq, set_resumereq: 30;
    hartreset, set_hartreset: 29;
    hasel, set_hasel: 26;
    hartsello, set_hartsello: 25, 16;
    hartselhi, set_hartselhi: 15, 6;
    ndmreset, set_ndmreset: 1;
    dmactive, set_dmactive: 0;
}

bitfield! {
    struct Dmstatus(u32);
    impl Debug;
    u32;
    allhavereset, _: 19;
    allresumeack, set_allresumeack: 17;
    allnonexistent, set_allnonexistent: 15;
    anynonexistent, set_anynonexistent: 14;
    allhalted, set_allhalted: 9;
    anyhalted, set_anyhalted: 8;
    version, _: 3, 0;
}

bitfield! {
    struct Abstractcs(u32);
    impl Debug;
    u32;
    busy, _: 12;
    cmderr, set_cmderr: 10, 8;
}

/// Register width of a hart's general-purpose/CSR file, as decoded from
/// `misa`'s MXL field (spec.md §4.5, §9 "misa-width auto-detection
/// fallback").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegisterWidth {
    Rv32,
    Rv64,
    Rv128,
}

/// Debug Module driver, generic over the DTM that carries `dmi` accesses.
pub struct DebugModule<D: Dmi> {
    dmi: D,
    hart_count: u32,
    selected_hart: u32,
    timeout: Duration,
}

impl<D: Dmi> DebugModule<D> {
    pub fn new(dmi: D) -> Self {
        Self {
            dmi,
            hart_count: 0,
            selected_hart: 0,
            timeout: Duration::from_millis(500),
        }
    }

    fn read_reg(&mut self, link: &mut dyn Link, address: u8) -> Result<u32> {
        self.dmi.dmi_read(link, address)
    }

    fn write_reg(&mut self, link: &mut dyn Link, address: u8, value: u32) -> Result<()> {
        self.dmi.dmi_write(link, address, value)
    }

    fn select_hart(&mut self, link: &mut dyn Link, hart: u32) -> Result<()> {
        let mut dmcontrol = Dmcontrol(0);
        dmcontrol.set_dmactive(true);
        dmcontrol.set_hartsello(hart & 0x3ff);
        dmcontrol.set_hartselhi((hart >> 10) & 0x3ff);
        self.write_reg(link, addr::DMCONTROL, dmcontrol.0)?;
        self.selected_hart = hart;
        Ok(())
    }

    /// `dm_init` (spec.md §4.5): activate the DM and linearly probe harts
    /// by selecting each index and checking `dmstatus.anynonexistent`.
    ///
    /// A binary search over `hartsel` width is the textbook approach; this
    /// crate scans linearly up to a bounded cap, trading a few extra `dmi`
    /// round trips for simpler, more obviously correct code (open question
    /// resolved in DESIGN.md).
    pub fn init(&mut self, link: &mut dyn Link) -> Result<()> {
        const MAX_HARTS: u32 = 32;
        let mut dmcontrol = Dmcontrol(0);
        dmcontrol.set_dmactive(true);
        self.write_reg(link, addr::DMCONTROL, dmcontrol.0)?;

        let mut count = 0;
        for hart in 0..MAX_HARTS {
            self.select_hart(link, hart)?;
            let status = Dmstatus(self.read_reg(link, addr::DMSTATUS)?);
            if status.anynonexistent() {
                break;
            }
            count += 1;
        }
        if count == 0 {
            return Err(Error::Riscv(RiscvError::NoRiscvTarget));
        }
        self.hart_count = count;
        tracing::debug!(hart_count = count, "debug module activated");
        self.select_hart(link, 0)
    }

    pub fn hart_count(&self) -> u32 {
        self.hart_count
    }

    /// `halt(hart)` (spec.md §4.5): request halt, poll `dmstatus.allhalted`.
    pub fn halt(&mut self, link: &mut dyn Link, hart: u32) -> Result<HaltReason> {
        if hart >= self.hart_count {
            return Err(Error::Riscv(RiscvError::HartNotFound(hart)));
        }
        self.select_hart(link, hart)?;

        let mut dmcontrol = Dmcontrol(0);
        dmcontrol.set_dmactive(true);
        dmcontrol.set_haltreq(true);
        dmcontrol.set_hartsello(hart & 0x3ff);
        self.write_reg(link, addr::DMCONTROL, dmcontrol.0)?;

        let deadline = Instant::now() + self.timeout;
        loop {
            let status = Dmstatus(self.read_reg(link, addr::DMSTATUS)?);
            if status.allhalted() {
                break;
            }
            if Instant::now() >= deadline {
                return Err(Error::TransportTimeout("hart halt"));
            }
        }

        let mut dmcontrol = Dmcontrol(0);
        dmcontrol.set_dmactive(true);
        dmcontrol.set_hartsello(hart & 0x3ff);
        self.write_reg(link, addr::DMCONTROL, dmcontrol.0)?;
        Ok(HaltReason::Request)
    }

    /// `resume(hart)` (spec.md §4.5).
    pub fn resume(&mut self, link: &mut dyn Link, hart: u32) -> Result<()> {
        self.select_hart(link, hart)?;
        let mut dmcontrol = Dmcontrol(0);
        dmcontrol.set_dmactive(true);
        dmcontrol.set_resumereq(true);
        dmcontrol.set_hartsello(hart & 0x3ff);
        self.write_reg(link, addr::DMCONTROL, dmcontrol.0)?;

        let deadline = Instant::now() + self.timeout;
        loop {
            let status = Dmstatus(self.read_reg(link, addr::DMSTATUS)?);
            if status.allresumeack() {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(Error::TransportTimeout("hart resume"));
            }
        }
    }

    fn wait_not_busy(&mut self, link: &mut dyn Link) -> Result<Abstractcs> {
        let deadline = Instant::now() + self.timeout;
        loop {
            let cs = Abstractcs(self.read_reg(link, addr::ABSTRACTCS)?);
            if !cs.busy() {
                return Ok(cs);
            }
            if Instant::now() >= deadline {
                return Err(Error::TransportTimeout("abstract command"));
            }
        }
    }

    fn clear_cmderr(&mut self, link: &mut dyn Link) -> Result<()> {
        let mut cs = Abstractcs(0);
        cs.set_cmderr(0b111);
        self.write_reg(link, addr::ABSTRACTCS, cs.0)
    }

    /// Access Register abstract command (riscv-debug-spec §3.7.1.1):
    /// `aarsize` selects the register width in an encoded form (2 = 32
    /// bits, 3 = 64 bits, 4 = 128 bits).
    fn abstract_access_register(
        &mut self,
        link: &mut dyn Link,
        regno: u16,
        aarsize: u32,
        write: bool,
    ) -> Result<()> {
        self.wait_not_busy(link)?;
        let command = (aarsize << 20) | (1 << 17) | ((write as u32) << 16) | regno as u32;
        self.write_reg(link, addr::COMMAND, command)?;

        let cs = self.wait_not_busy(link)?;
        if cs.cmderr() != 0 {
            self.clear_cmderr(link)?;
            return Err(Error::Riscv(RiscvError::AbstractCommandError(
                cs.cmderr() as u8
            )));
        }
        Ok(())
    }

    /// `read_csr(hart, csr)` (spec.md §4.5): CSR register numbers below
    /// `0x1000` are addressed directly in the abstract command's `regno`.
    pub fn read_csr(&mut self, link: &mut dyn Link, hart: u32, csr: u16) -> Result<u32> {
        self.select_hart(link, hart)?;
        self.abstract_access_register(link, csr, 2, false)?;
        self.read_reg(link, addr::DATA0)
    }

    pub fn write_csr(&mut self, link: &mut dyn Link, hart: u32, csr: u16, value: u32) -> Result<()> {
        self.select_hart(link, hart)?;
        self.write_reg(link, addr::DATA0, value)?;
        self.abstract_access_register(link, csr, 2, true)
    }

    /// Probes `misa` widest-first (spec.md §4.5, §9 "misa-width
    /// auto-detection fallback"): the Access Register abstract command
    /// rejects an `aarsize` wider than the hart's XLEN with a command
    /// error, so the first `aarsize` (128, then 64, then 32 bits) that
    /// the hart accepts is its true register width. Falls back to
    /// [`RegisterWidth::Rv32`] if even the 32-bit probe fails, rather
    /// than treating an unreadable `misa` as fatal.
    pub fn detect_register_width(&mut self, link: &mut dyn Link, hart: u32) -> RegisterWidth {
        if self.select_hart(link, hart).is_err() {
            return RegisterWidth::Rv32;
        }
        const WIDTHS: [(u32, RegisterWidth); 3] = [
            (4, RegisterWidth::Rv128),
            (3, RegisterWidth::Rv64),
            (2, RegisterWidth::Rv32),
        ];
        for (aarsize, width) in WIDTHS {
            if self
                .abstract_access_register(link, MISA_CSR, aarsize, false)
                .is_ok()
            {
                return width;
            }
        }
        RegisterWidth::Rv32
    }
}
