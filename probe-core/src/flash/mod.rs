//! Buffered flash-programming engine (spec.md §4.8).
//!
//! Writes are accumulated into a page-sized buffer and only committed to
//! the target's NVM controller when a write crosses into a different
//! erase/write page, mirroring the teacher's `flashing/builder.rs` page
//! coalescing rather than performing one controller write per byte.

use crate::error::Result;
use crate::link::Link;
use crate::target::{Progress, TargetOps};

/// Errors raised by a flash controller driver (spec.md §4.8).
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum FlashError {
    #[error("flash address {address:#010x} is outside the region")]
    OutOfRange { address: u32 },

    #[error("flash controller reported a write error at {address:#010x}")]
    WriteFailed { address: u32 },

    #[error("flash controller reported an erase error at {address:#010x}")]
    EraseFailed { address: u32 },

    #[error("flash is write-protected")]
    WriteProtected,

    #[error("no region is currently in flash mode")]
    NotInFlashMode,
}

/// What the page buffer is currently accumulating toward (spec.md §4.8).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlashOperation {
    None,
    Write,
    Erase,
}

/// Per-region driver contract (spec.md §4.8): `prepare`/`erase`/`write`/
/// `done`, plus an optional single-shot `mass_erase`.
pub trait FlashOps {
    /// Called once before any erase/write in this session (unlock
    /// sequence, NVM controller enable). `target` gives the driver raw
    /// memory-mapped access to the NVM controller's registers, the same
    /// path ordinary debug reads/writes use.
    fn prepare(&mut self, target: &mut dyn TargetOps, link: &mut dyn Link) -> Result<()>;

    /// Erase one erase-block-aligned block starting at `address`.
    fn erase(
        &mut self,
        target: &mut dyn TargetOps,
        link: &mut dyn Link,
        address: u32,
        length: u32,
    ) -> Result<()>;

    /// Commit one write-block-aligned, write-block-sized page.
    fn write(
        &mut self,
        target: &mut dyn TargetOps,
        link: &mut dyn Link,
        address: u32,
        data: &[u8],
    ) -> Result<()>;

    /// Called once after the last erase/write (lock sequence).
    fn done(&mut self, target: &mut dyn TargetOps, link: &mut dyn Link) -> Result<()>;

    /// Whole-chip/whole-region erase, if the controller has a single
    /// command for it. Default: unsupported, caller falls back to the
    /// per-block `erase` loop.
    fn mass_erase(
        &mut self,
        _target: &mut dyn TargetOps,
        _link: &mut dyn Link,
        _progress: &mut dyn Progress,
    ) -> Result<bool> {
        Ok(false)
    }

    /// Driver-specific `monitor` command (spec.md §6), e.g. `gpnvm` or
    /// `sector_erase` commands that belong to the NVM controller rather
    /// than the core. Returns `false` if `name` isn't recognised, so the
    /// caller can try the next handler. Default: none recognised.
    fn run_command(
        &mut self,
        _target: &mut dyn TargetOps,
        _link: &mut dyn Link,
        _name: &str,
        _args: &[&str],
    ) -> Result<bool> {
        Ok(false)
    }
}

/// One flash region on a target (spec.md §3, §4.8).
pub struct Flash {
    pub start: u32,
    pub length: u32,
    pub erase_block_size: u32,
    pub write_block_size: u32,
    /// The controller's erased-cell value (0xFF for NOR, 0x00 for some
    /// EEPROM-style parts).
    pub erased: u8,

    buf: Vec<u8>,
    /// Address of `buf[0]`, once a page has been opened.
    buf_base: Option<u32>,

    current_operation: FlashOperation,
    ops: Box<dyn FlashOps>,
}

impl Flash {
    pub fn new(
        start: u32,
        length: u32,
        erase_block_size: u32,
        write_block_size: u32,
        erased: u8,
        ops: Box<dyn FlashOps>,
    ) -> Self {
        Self {
            start,
            length,
            erase_block_size,
            write_block_size,
            erased,
            buf: vec![erased; write_block_size as usize],
            buf_base: None,
            current_operation: FlashOperation::None,
            ops,
        }
    }

    pub fn end(&self) -> u32 {
        self.start.saturating_add(self.length)
    }

    pub fn contains(&self, address: u32) -> bool {
        address >= self.start && address < self.end()
    }

    fn page_base(&self, address: u32) -> u32 {
        address - (address % self.write_block_size)
    }

    /// `enter_flash_mode` (spec.md §4.8): runs the driver's unlock
    /// sequence exactly once per session.
    pub fn enter_flash_mode(&mut self, target: &mut dyn TargetOps, link: &mut dyn Link) -> Result<()> {
        self.ops.prepare(target, link)
    }

    /// `exit_flash_mode` (spec.md §4.8): flush any buffered page, then run
    /// the driver's lock sequence.
    pub fn exit_flash_mode(&mut self, target: &mut dyn TargetOps, link: &mut dyn Link) -> Result<()> {
        self.flush(target, link)?;
        self.current_operation = FlashOperation::None;
        self.ops.done(target, link)
    }

    /// Commit the currently-open page buffer, if any (spec.md §4.8: a page
    /// is committed when a write moves to a different page, or on
    /// `exit_flash_mode`). The whole write-block-sized, erased-byte-filled
    /// page is sent, not just the dirty extent — `write_block_size` is the
    /// smallest aligned unit the controller can program in one command.
    fn flush(&mut self, target: &mut dyn TargetOps, link: &mut dyn Link) -> Result<()> {
        let Some(base) = self.buf_base else {
            return Ok(());
        };
        tracing::debug!(address = base, len = self.buf.len(), "committing flash page");
        self.ops.write(target, link, base, &self.buf)?;
        self.buf_base = None;
        Ok(())
    }

    /// `flash_write(address, data, length)` (spec.md §4.8, §8 scenario 4):
    /// buffers `data` into write-block-sized pages, committing a page to
    /// the driver exactly when the write address crosses into a new page.
    pub fn flash_write(
        &mut self,
        target: &mut dyn TargetOps,
        link: &mut dyn Link,
        address: u32,
        data: &[u8],
    ) -> Result<()> {
        if !self.contains(address) || !self.contains(address + data.len() as u32 - 1) {
            return Err(crate::error::Error::Flash(FlashError::OutOfRange { address }));
        }
        self.current_operation = FlashOperation::Write;

        for (i, &byte) in data.iter().enumerate() {
            let addr = address + i as u32;
            let page = self.page_base(addr);

            if self.buf_base != Some(page) {
                self.flush(target, link)?;
                self.buf.iter_mut().for_each(|b| *b = self.erased);
                self.buf_base = Some(page);
            }

            let offset = (addr - page) as usize;
            self.buf[offset] = byte;
        }
        Ok(())
    }

    /// `flash_erase(address, length)` (spec.md §4.8): erase-block-aligned
    /// erase loop over the requested range.
    pub fn flash_erase(
        &mut self,
        target: &mut dyn TargetOps,
        link: &mut dyn Link,
        address: u32,
        length: u32,
    ) -> Result<()> {
        if !self.contains(address) || !self.contains(address + length.saturating_sub(1)) {
            return Err(crate::error::Error::Flash(FlashError::OutOfRange { address }));
        }
        self.current_operation = FlashOperation::Erase;

        let mut block = address - (address % self.erase_block_size);
        let end = address + length;
        while block < end {
            self.ops.erase(target, link, block, self.erase_block_size)?;
            block += self.erase_block_size;
        }
        Ok(())
    }

    /// Whole-region erase: try the driver's single-shot command, otherwise
    /// fall back to the per-block loop (spec.md §4.8).
    pub fn mass_erase(
        &mut self,
        target: &mut dyn TargetOps,
        link: &mut dyn Link,
        progress: &mut dyn Progress,
    ) -> Result<()> {
        if self.ops.mass_erase(target, link, progress)? {
            return Ok(());
        }
        self.flash_erase(target, link, self.start, self.length)
    }

    pub fn current_operation(&self) -> FlashOperation {
        self.current_operation
    }

    /// Try this region's driver-specific `monitor` command (spec.md §6).
    pub fn run_command(
        &mut self,
        target: &mut dyn TargetOps,
        link: &mut dyn Link,
        name: &str,
        args: &[&str],
    ) -> Result<bool> {
        self.ops.run_command(target, link, name, args)
    }
}
