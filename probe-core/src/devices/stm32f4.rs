//! STM32F4 embedded flash controller (spec.md §4.9), register layout
//! grounded on the `FLASH_KEYR`/`FLASH_SR`/`FLASH_CR` bitfields of a
//! Tock-style STM32F4 flash peripheral driver.

use bitfield::bitfield;

use crate::error::{Error, Result};
use crate::flash::{FlashError, FlashOps};
use crate::link::Link;
use crate::target::{Progress, TargetOps};

const FLASH_BASE: u32 = 0x4002_3C00;
const FLASH_KEYR: u32 = FLASH_BASE + 0x04;
const FLASH_SR: u32 = FLASH_BASE + 0x0C;
const FLASH_CR: u32 = FLASH_BASE + 0x10;

const KEY1: u32 = 0x4567_0123;
const KEY2: u32 = 0xCDEF_89AB;

bitfield! {
    struct Sr(u32);
    impl Debug;
    u32;
    bsy, _: 16;
    rderr, _: 8;
    pgserr, _: 7;
    pgperr, _: 6;
    pgaerr, _: 5;
    wrperr, _: 4;
    operr, _: 1;
    eop, set_eop: 0;
}

bitfield! {
    struct Cr(u32);
    impl Debug;
    u32;
    lock, set_lock: 31;
    strt, set_strt: 16;
    psize, set_psize: 9, 8;
    snb, set_snb: 7, 3;
    mer, set_mer: 2;
    ser, set_ser: 1;
    pg, set_pg: 0;
}

/// Program parallelism, selected by the VDD range (spec.md §4.9, §6
/// `monitor psize`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgramSize {
    Byte,
    HalfWord,
    Word,
    DoubleWord,
}

impl ProgramSize {
    fn bits(self) -> u32 {
        match self {
            ProgramSize::Byte => 0,
            ProgramSize::HalfWord => 1,
            ProgramSize::Word => 2,
            ProgramSize::DoubleWord => 3,
        }
    }

    fn bytes(self) -> u32 {
        match self {
            ProgramSize::Byte => 1,
            ProgramSize::HalfWord => 2,
            ProgramSize::Word => 4,
            ProgramSize::DoubleWord => 8,
        }
    }
}

/// Dual-bank sector numbering (spec.md §8 scenario 5): sectors 0-11 sit
/// in bank 1 contiguously, but bank 2 restarts its SNB field at 16 rather
/// than continuing at 12.
fn sector_number(sector_index: u32) -> u32 {
    if sector_index < 12 {
        sector_index
    } else {
        sector_index - 12 + 16
    }
}

/// STM32F4 NVM controller driver (spec.md §4.9 "full fidelity").
pub struct Stm32f4Flash {
    pub psize: ProgramSize,
    sector_base: Vec<u32>,
}

impl Stm32f4Flash {
    /// `sector_base` lists each sector's start address, in order; its
    /// length determines how many sectors the region covers.
    pub fn new(psize: ProgramSize, sector_base: Vec<u32>) -> Self {
        Self { psize, sector_base }
    }

    fn wait_ready(&self, target: &mut dyn TargetOps, link: &mut dyn Link) -> Result<()> {
        const MAX_POLLS: u32 = 1_000_000;
        for _ in 0..MAX_POLLS {
            let sr = Sr(read_word(target, link, FLASH_SR)?);
            if !sr.bsy() {
                if sr.wrperr() || sr.pgaerr() || sr.pgperr() || sr.pgserr() || sr.operr() {
                    return Err(Error::Flash(FlashError::WriteFailed { address: 0 }));
                }
                return Ok(());
            }
        }
        tracing::warn!("flash controller did not clear BSY in time");
        Err(Error::TransportTimeout("flash controller busy"))
    }

    fn sector_index_for(&self, address: u32) -> Option<u32> {
        self.sector_base
            .windows(2)
            .position(|pair| address >= pair[0] && address < pair[1])
            .map(|i| i as u32)
            .or_else(|| {
                if address >= *self.sector_base.last()? {
                    Some(self.sector_base.len() as u32 - 1)
                } else {
                    None
                }
            })
    }
}

fn read_word(target: &mut dyn TargetOps, link: &mut dyn Link, address: u32) -> Result<u32> {
    let mut buf = [0u8; 4];
    target.mem_read(link, address, &mut buf)?;
    Ok(u32::from_le_bytes(buf))
}

fn write_word(target: &mut dyn TargetOps, link: &mut dyn Link, address: u32, value: u32) -> Result<()> {
    target.mem_write(link, address, &value.to_le_bytes())
}

impl FlashOps for Stm32f4Flash {
    fn prepare(&mut self, target: &mut dyn TargetOps, link: &mut dyn Link) -> Result<()> {
        let sr = Sr(read_word(target, link, FLASH_SR)?);
        if sr.bsy() {
            self.wait_ready(target, link)?;
        }
        write_word(target, link, FLASH_KEYR, KEY1)?;
        write_word(target, link, FLASH_KEYR, KEY2)?;
        Ok(())
    }

    fn erase(&mut self, target: &mut dyn TargetOps, link: &mut dyn Link, address: u32, _length: u32) -> Result<()> {
        let sector = self
            .sector_index_for(address)
            .ok_or(Error::Flash(FlashError::OutOfRange { address }))?;

        let mut cr = Cr(0);
        cr.set_ser(true);
        cr.set_snb(sector_number(sector));
        cr.set_psize(self.psize.bits());
        write_word(target, link, FLASH_CR, cr.0)?;

        let mut start = Cr(cr.0);
        start.set_strt(true);
        write_word(target, link, FLASH_CR, start.0)?;

        self.wait_ready(target, link).map_err(|_| {
            Error::Flash(FlashError::EraseFailed { address })
        })?;
        write_word(target, link, FLASH_CR, 0)
    }

    fn write(&mut self, target: &mut dyn TargetOps, link: &mut dyn Link, address: u32, data: &[u8]) -> Result<()> {
        let mut cr = Cr(0);
        cr.set_pg(true);
        cr.set_psize(self.psize.bits());
        write_word(target, link, FLASH_CR, cr.0)?;

        let step = self.psize.bytes() as usize;
        for (i, chunk) in data.chunks(step).enumerate() {
            let addr = address + (i * step) as u32;
            target.mem_write(link, addr, chunk)?;
            self.wait_ready(target, link)
                .map_err(|_| Error::Flash(FlashError::WriteFailed { address: addr }))?;
        }
        write_word(target, link, FLASH_CR, 0)
    }

    fn done(&mut self, target: &mut dyn TargetOps, link: &mut dyn Link) -> Result<()> {
        let mut cr = Cr(0);
        cr.set_lock(true);
        write_word(target, link, FLASH_CR, cr.0)
    }

    fn mass_erase(
        &mut self,
        target: &mut dyn TargetOps,
        link: &mut dyn Link,
        progress: &mut dyn Progress,
    ) -> Result<bool> {
        let mut cr = Cr(0);
        cr.set_mer(true);
        write_word(target, link, FLASH_CR, cr.0)?;
        let mut start = cr;
        start.set_strt(true);
        write_word(target, link, FLASH_CR, start.0)?;
        progress.report(0, 1);
        self.wait_ready(target, link)?;
        write_word(target, link, FLASH_CR, 0)?;
        progress.report(1, 1);
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sector_numbering_jumps_at_bank_boundary() {
        assert_eq!(sector_number(11), 11);
        assert_eq!(sector_number(12), 16);
        assert_eq!(sector_number(13), 17);
    }
}
