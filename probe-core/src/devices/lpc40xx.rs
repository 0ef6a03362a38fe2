//! LPC-style in-application-programming (IAP) helper (spec.md §4.9
//! "stub-level", §9 redesign note): the vendor ROM routine takes its
//! command frame through varargs in the original source; this driver
//! replaces that with an explicit fixed-size argument array.

use crate::error::{Error, Result};
use crate::flash::FlashOps;
use crate::link::Link;
use crate::target::{Progress, TargetOps};

/// IAP command codes used by `monitor sector_erase` (spec.md §6).
mod cmd {
    pub const PREPARE_SECTORS: u32 = 50;
    pub const COPY_RAM_TO_FLASH: u32 = 51;
    pub const ERASE_SECTORS: u32 = 52;
}

const IAP_ENTRY: u32 = 0x1FFF_1FF1;
/// At most 3 command parameters (`PREPARE_SECTORS`/`ERASE_SECTORS` take a
/// start/end sector and a clock frequency; `COPY_RAM_TO_FLASH` takes a
/// destination, source and byte count) — the widest IAP call this driver
/// issues uses all three.
const MAX_IAP_ARGS: usize = 3;

/// One IAP call: a command code plus up to [`MAX_IAP_ARGS`] parameters,
/// written into the target's command/result RAM block and executed by
/// pointing the core at the ROM entry point.
#[derive(Debug, Clone, Copy)]
pub struct IapFrame {
    pub command: u32,
    pub args: [u32; MAX_IAP_ARGS],
    pub arg_count: usize,
}

impl IapFrame {
    pub fn new(command: u32, args: &[u32]) -> Self {
        assert!(args.len() <= MAX_IAP_ARGS);
        let mut frame = [0u32; MAX_IAP_ARGS];
        frame[..args.len()].copy_from_slice(args);
        Self {
            command,
            args: frame,
            arg_count: args.len(),
        }
    }
}

/// LPC40xx flash driver: RAM-resident command/result block plus the IAP
/// ROM entry point (spec.md §4.9).
pub struct Lpc40xxFlash {
    /// Scratch RAM address for the command/result block; must not overlap
    /// the code the IAP call itself is programming.
    pub cmd_ram: u32,
    pub cpu_clock_khz: u32,
    pub sector_size: u32,
}

impl Lpc40xxFlash {
    fn sector_of(&self, address: u32) -> u32 {
        address / self.sector_size
    }

    /// Runs one IAP call by register convention: `R0` points at the
    /// command block, `R1` at the result block, immediately following it
    /// (spec.md §9's explicit-argument-array redesign).
    fn call(&self, target: &mut dyn TargetOps, link: &mut dyn Link, frame: IapFrame) -> Result<u32> {
        let mut words = Vec::with_capacity(1 + frame.arg_count);
        words.push(frame.command);
        words.extend_from_slice(&frame.args[..frame.arg_count]);
        let mut bytes = Vec::with_capacity(words.len() * 4);
        for w in &words {
            bytes.extend_from_slice(&w.to_le_bytes());
        }
        target.mem_write(link, self.cmd_ram, &bytes)?;

        let result_addr = self.cmd_ram + bytes.len() as u32;
        let mut regs = [0u32; 16];
        regs[0] = self.cmd_ram;
        regs[1] = result_addr;
        regs[15] = IAP_ENTRY;
        target.regs_write(link, &regs)?;
        target.halt_resume(link, false)?;

        loop {
            if !matches!(target.halt_poll(link)?, crate::target::HaltReason::Running) {
                break;
            }
        }

        let mut status = [0u8; 4];
        target.mem_read(link, result_addr, &mut status)?;
        Ok(u32::from_le_bytes(status))
    }
}

impl FlashOps for Lpc40xxFlash {
    fn prepare(&mut self, _target: &mut dyn TargetOps, _link: &mut dyn Link) -> Result<()> {
        Ok(())
    }

    fn erase(&mut self, target: &mut dyn TargetOps, link: &mut dyn Link, address: u32, length: u32) -> Result<()> {
        let start = self.sector_of(address);
        let end = self.sector_of(address + length.saturating_sub(1));
        let status = self.call(
            target,
            link,
            IapFrame::new(cmd::PREPARE_SECTORS, &[start, end]),
        )?;
        if status != 0 {
            return Err(Error::Flash(crate::flash::FlashError::EraseFailed { address }));
        }
        let status = self.call(
            target,
            link,
            IapFrame::new(cmd::ERASE_SECTORS, &[start, end, self.cpu_clock_khz]),
        )?;
        if status == 0 {
            Ok(())
        } else {
            Err(Error::Flash(crate::flash::FlashError::EraseFailed { address }))
        }
    }

    fn write(&mut self, target: &mut dyn TargetOps, link: &mut dyn Link, address: u32, data: &[u8]) -> Result<()> {
        let sector = self.sector_of(address);
        let status = self.call(
            target,
            link,
            IapFrame::new(cmd::PREPARE_SECTORS, &[sector, sector]),
        )?;
        if status != 0 {
            return Err(Error::Flash(crate::flash::FlashError::WriteFailed { address }));
        }

        let ram_src = self.cmd_ram + 64;
        target.mem_write(link, ram_src, data)?;
        let status = self.call(
            target,
            link,
            IapFrame::new(
                cmd::COPY_RAM_TO_FLASH,
                &[address, ram_src, data.len() as u32],
            ),
        )?;
        if status == 0 {
            Ok(())
        } else {
            Err(Error::Flash(crate::flash::FlashError::WriteFailed { address }))
        }
    }

    fn done(&mut self, _target: &mut dyn TargetOps, _link: &mut dyn Link) -> Result<()> {
        Ok(())
    }

    fn mass_erase(
        &mut self,
        _target: &mut dyn TargetOps,
        _link: &mut dyn Link,
        _progress: &mut dyn Progress,
    ) -> Result<bool> {
        Ok(false)
    }

    /// `monitor sector_erase <start> <end>` (spec.md §6): erase by sector
    /// number directly, bypassing the engine's address-range erase.
    fn run_command(
        &mut self,
        target: &mut dyn TargetOps,
        link: &mut dyn Link,
        name: &str,
        args: &[&str],
    ) -> Result<bool> {
        if name != "sector_erase" {
            return Ok(false);
        }
        let [start, end] = args else {
            return Err(Error::TargetProtocolError(
                "usage: sector_erase <start> <end>".into(),
            ));
        };
        let start: u32 = start
            .parse()
            .map_err(|_| Error::TargetProtocolError("sector_erase: bad start sector".into()))?;
        let end: u32 = end
            .parse()
            .map_err(|_| Error::TargetProtocolError("sector_erase: bad end sector".into()))?;

        let status = self.call(target, link, IapFrame::new(cmd::PREPARE_SECTORS, &[start, end]))?;
        if status != 0 {
            return Err(Error::Flash(crate::flash::FlashError::EraseFailed {
                address: start * self.sector_size,
            }));
        }
        let status = self.call(
            target,
            link,
            IapFrame::new(cmd::ERASE_SECTORS, &[start, end, self.cpu_clock_khz]),
        )?;
        if status != 0 {
            return Err(Error::Flash(crate::flash::FlashError::EraseFailed {
                address: start * self.sector_size,
            }));
        }
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_packs_only_the_arguments_given() {
        let frame = IapFrame::new(cmd::PREPARE_SECTORS, &[2, 5]);
        assert_eq!(frame.arg_count, 2);
        assert_eq!(frame.args, [2, 5, 0]);
    }

    #[test]
    fn sector_of_divides_by_sector_size() {
        let flash = Lpc40xxFlash {
            cmd_ram: 0x1000_0000,
            cpu_clock_khz: 120_000,
            sector_size: 0x1000,
        };
        assert_eq!(flash.sector_of(0x0000_0000), 0);
        assert_eq!(flash.sector_of(0x0000_1000), 1);
        assert_eq!(flash.sector_of(0x0000_1FFF), 1);
    }
}
