//! ADIv5 Access Port driver: memory transactions via CSW/TAR/DRW
//! (spec.md §4.3).

use bitfield::bitfield;

use crate::arm::dp::DebugPort;
use crate::arm::DapError;
use crate::error::{Error, Result};
use crate::link::Link;

/// `CSW`/`TAR`/`DRW` all live in AP bank 0x0.
pub const CSW: u8 = 0x00;
pub const TAR: u8 = 0x04;
pub const DRW: u8 = 0x0C;

/// The 10-bit auto-increment boundary within which TAR advances on its own
/// as DRW is accessed repeatedly (spec.md §4.3).
const AUTO_INCREMENT_BOUNDARY: u32 = 0x400;

bitfield! {
    /// `CSW` register (AMBA AHB memory access port).
    #[derive(Clone, Copy, PartialEq, Eq)]
    pub struct Csw(u32);
    impl Debug;
    pub u8, prot, set_prot: 30, 24;
    pub u8, cache, set_cache: 18, 16;
    pub u8, addr_inc, set_addr_inc: 5, 4;
    pub u8, size, set_size: 2, 0;
}

/// Access width for one memory transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessWidth {
    Byte,
    Half,
    Word,
}

impl AccessWidth {
    fn csw_size(self) -> u8 {
        match self {
            AccessWidth::Byte => 0b000,
            AccessWidth::Half => 0b001,
            AccessWidth::Word => 0b010,
        }
    }

    pub fn bytes(self) -> u32 {
        match self {
            AccessWidth::Byte => 1,
            AccessWidth::Half => 2,
            AccessWidth::Word => 4,
        }
    }
}

/// One ADIv5 Access Port bound to a DP (spec.md §3).
#[derive(Debug)]
pub struct AccessPort {
    pub apsel: u8,
    pub idr: u32,
    pub cfg: u32,
    pub base: u32,
    pub partno: u8,
    /// Authoritative cache of the last CSW written (spec.md §3 invariant:
    /// "any write to CSW on wire must equal the cache, else cache is
    /// invalidated").
    csw_cache: Option<Csw>,
}

impl AccessPort {
    pub fn new(apsel: u8, idr: u32, cfg: u32, base: u32) -> Self {
        Self {
            apsel,
            idr,
            cfg,
            base,
            partno: ((idr >> 4) & 0xF) as u8,
            csw_cache: None,
        }
    }

    fn set_csw(&mut self, dp: &mut DebugPort, link: &mut dyn Link, csw: Csw) -> Result<()> {
        if self.csw_cache != Some(csw) {
            dp.ap_write(link, self.apsel, CSW, csw.0)?;
            self.csw_cache = Some(csw);
        }
        Ok(())
    }

    fn invalidate_csw(&mut self) {
        self.csw_cache = None;
    }

    fn build_csw(width: AccessWidth, auto_increment: bool) -> Csw {
        let mut csw = Csw(0);
        csw.set_prot(0b110);
        csw.set_cache(0b11);
        csw.set_size(width.csw_size());
        csw.set_addr_inc(if auto_increment { 0b01 } else { 0b00 });
        csw
    }

    /// Read `byte_len / 4` 32-bit words from `src_addr` using 32-bit
    /// auto-increment, chunked across 1 KiB boundaries (spec.md §4.3).
    pub fn read_words(
        &mut self,
        dp: &mut DebugPort,
        link: &mut dyn Link,
        dst: &mut [u32],
        src_addr: u32,
    ) -> Result<()> {
        if dst.is_empty() {
            return Ok(());
        }
        if src_addr % 4 != 0 {
            return Err(Error::Dap(DapError::UnsupportedAccessWidth));
        }

        self.set_csw(dp, link, Self::build_csw(AccessWidth::Word, true))?;
        dp.ap_write(link, self.apsel, TAR, src_addr)?;

        let mut address = src_addr;
        let mut offset = 0usize;
        while offset < dst.len() {
            let remaining_bytes = (dst.len() - offset) * 4;
            let chunk_bytes = (AUTO_INCREMENT_BOUNDARY
                - (address % AUTO_INCREMENT_BOUNDARY))
                .min(remaining_bytes as u32) as usize;
            let chunk_words = chunk_bytes / 4;

            let values = dp.ap_read_pipelined(link, self.apsel, DRW, chunk_words)?;
            dst[offset..offset + chunk_words].copy_from_slice(&values);

            offset += chunk_words;
            address += chunk_bytes as u32;
            if offset < dst.len() {
                dp.ap_write(link, self.apsel, TAR, address)?;
            }
        }
        Ok(())
    }

    /// Write `src.len()` 32-bit words to `dst_addr`, same chunking rule as
    /// [`AccessPort::read_words`].
    pub fn write_words(
        &mut self,
        dp: &mut DebugPort,
        link: &mut dyn Link,
        dst_addr: u32,
        src: &[u32],
    ) -> Result<()> {
        if src.is_empty() {
            return Ok(());
        }
        if dst_addr % 4 != 0 {
            return Err(Error::Dap(DapError::UnsupportedAccessWidth));
        }

        self.set_csw(dp, link, Self::build_csw(AccessWidth::Word, true))?;
        dp.ap_write(link, self.apsel, TAR, dst_addr)?;

        let mut address = dst_addr;
        let mut offset = 0usize;
        while offset < src.len() {
            let remaining_bytes = (src.len() - offset) * 4;
            let chunk_bytes = (AUTO_INCREMENT_BOUNDARY
                - (address % AUTO_INCREMENT_BOUNDARY))
                .min(remaining_bytes as u32) as usize;
            let chunk_words = chunk_bytes / 4;

            for &word in &src[offset..offset + chunk_words] {
                dp.ap_write(link, self.apsel, DRW, word)?;
            }

            offset += chunk_words;
            address += chunk_bytes as u32;
            if offset < src.len() {
                dp.ap_write(link, self.apsel, TAR, address)?;
            }
        }
        Ok(())
    }

    /// Read `data.len()` bytes from `addr` using 8-bit transactions. Each
    /// returned byte lies in the lane selected by `addr[1:0]` (spec.md
    /// §4.3).
    pub fn read_bytes(
        &mut self,
        dp: &mut DebugPort,
        link: &mut dyn Link,
        data: &mut [u8],
        addr: u32,
    ) -> Result<()> {
        if data.is_empty() {
            return Ok(());
        }
        self.set_csw(dp, link, Self::build_csw(AccessWidth::Byte, true))?;
        dp.ap_write(link, self.apsel, TAR, addr)?;

        let mut address = addr;
        for byte in data.iter_mut() {
            let value = dp.ap_read(link, self.apsel, DRW)?;
            let lane = (address & 0b11) as u32;
            *byte = ((value >> (lane * 8)) & 0xFF) as u8;
            address = address.wrapping_add(1);
            if address % AUTO_INCREMENT_BOUNDARY == 0 {
                dp.ap_write(link, self.apsel, TAR, address)?;
            }
        }
        Ok(())
    }

    /// Write `data` as individual 8-bit transactions starting at `addr`.
    pub fn write_bytes(
        &mut self,
        dp: &mut DebugPort,
        link: &mut dyn Link,
        addr: u32,
        data: &[u8],
    ) -> Result<()> {
        if data.is_empty() {
            return Ok(());
        }
        self.set_csw(dp, link, Self::build_csw(AccessWidth::Byte, true))?;
        dp.ap_write(link, self.apsel, TAR, addr)?;

        let mut address = addr;
        for &byte in data {
            let lane = (address & 0b11) as u32;
            let value = (byte as u32) << (lane * 8);
            dp.ap_write(link, self.apsel, DRW, value)?;
            address = address.wrapping_add(1);
            if address % AUTO_INCREMENT_BOUNDARY == 0 {
                dp.ap_write(link, self.apsel, TAR, address)?;
            }
        }
        Ok(())
    }

    /// Convenience single-word read (no auto-increment).
    pub fn read_word_32(&mut self, dp: &mut DebugPort, link: &mut dyn Link, addr: u32) -> Result<u32> {
        if addr % 4 != 0 {
            return Err(Error::Dap(DapError::UnsupportedAccessWidth));
        }
        self.set_csw(dp, link, Self::build_csw(AccessWidth::Word, false))?;
        dp.ap_write(link, self.apsel, TAR, addr)?;
        dp.ap_read(link, self.apsel, DRW)
    }

    /// Convenience single-word write (no auto-increment).
    pub fn write_word_32(
        &mut self,
        dp: &mut DebugPort,
        link: &mut dyn Link,
        addr: u32,
        value: u32,
    ) -> Result<()> {
        if addr % 4 != 0 {
            return Err(Error::Dap(DapError::UnsupportedAccessWidth));
        }
        self.set_csw(dp, link, Self::build_csw(AccessWidth::Word, false))?;
        dp.ap_write(link, self.apsel, TAR, addr)?;
        dp.ap_write(link, self.apsel, DRW, value)
    }

    /// Fold the latest DP sticky-error state into a target-level bus error
    /// (spec.md §7: `TargetBusError`).
    pub fn check_error(&mut self, dp: &mut DebugPort, link: &mut dyn Link, address: u32) -> Result<()> {
        let flags = dp.error(link)?;
        self.invalidate_csw();
        if flags.fault {
            return Err(Error::TargetBusError { address });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arm::dp::{DebugPort, DpOptions};
    use crate::arm::Protocol;
    use crate::link::tests::MockLink;

    #[test]
    fn csw_not_rewritten_when_unchanged() {
        let mut link = MockLink::new();
        let mut dp = DebugPort::new(0, Protocol::Swd, DpOptions::default());
        let mut ap = AccessPort::new(0, 0x2477_0011, 0, 0);

        ap.write_word_32(&mut dp, &mut link, 0x2000_0000, 1).unwrap();
        let writes = link.select_write_count();
        ap.write_word_32(&mut dp, &mut link, 0x2000_0004, 2).unwrap();
        // Same bank/CSW: no extra SELECT writes should be necessary beyond
        // the first transition into this AP's bank.
        assert_eq!(link.select_write_count(), writes);
    }
}
