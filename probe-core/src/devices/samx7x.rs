//! SAM-style GPNVM flash controller (spec.md §4.9 "stub-level"): a generic
//! word-access NVM controller exposing the `monitor gpnvm` command, kept
//! light rather than re-deriving the SAM3/4/E70 family in full.

use crate::error::{Error, Result};
use crate::flash::{FlashError, FlashOps};
use crate::link::Link;
use crate::target::{Progress, TargetOps};

const EEFC_FCR: u32 = 0x0000_0004;
const EEFC_FSR: u32 = 0x0000_0008;
const FSR_FRDY: u32 = 1 << 0;
const FCR_KEY: u32 = 0x5A << 24;

mod cmd {
    pub const WP: u32 = 0x01;
    pub const EPA: u32 = 0x07;
    pub const SGPB: u32 = 0x0B;
    pub const CGPB: u32 = 0x0C;
}

/// A single EEFC-style controller, parameterized by its base address so the
/// same driver covers both flash banks of a dual-bank SAM part.
pub struct SamGpnvmFlash {
    pub base: u32,
    pub page_size: u32,
}

impl SamGpnvmFlash {
    fn wait_ready(&self, target: &mut dyn TargetOps, link: &mut dyn Link) -> Result<()> {
        const MAX_POLLS: u32 = 1_000_000;
        for _ in 0..MAX_POLLS {
            let mut buf = [0u8; 4];
            target.mem_read(link, self.base + EEFC_FSR, &mut buf)?;
            if u32::from_le_bytes(buf) & FSR_FRDY != 0 {
                return Ok(());
            }
        }
        Err(Error::TransportTimeout("EEFC controller busy"))
    }

    fn command(&self, target: &mut dyn TargetOps, link: &mut dyn Link, cmd: u32, arg: u32) -> Result<()> {
        let fcr = FCR_KEY | (cmd & 0xFF) | ((arg & 0xFFFF) << 8);
        target.mem_write(link, self.base + EEFC_FCR, &fcr.to_le_bytes())
    }

    /// `monitor gpnvm set|clear <bit>` (spec.md §6).
    pub fn set_gpnvm(&self, target: &mut dyn TargetOps, link: &mut dyn Link, bit: u32, set: bool) -> Result<()> {
        let command = if set { cmd::SGPB } else { cmd::CGPB };
        self.command(target, link, command, bit)?;
        self.wait_ready(target, link)
    }
}

impl FlashOps for SamGpnvmFlash {
    fn prepare(&mut self, target: &mut dyn TargetOps, link: &mut dyn Link) -> Result<()> {
        self.wait_ready(target, link)
    }

    fn erase(&mut self, target: &mut dyn TargetOps, link: &mut dyn Link, address: u32, _length: u32) -> Result<()> {
        let page = (address - self.base) / self.page_size;
        self.command(target, link, cmd::EPA, page << 2)?;
        self.wait_ready(target, link)
            .map_err(|_| Error::Flash(FlashError::EraseFailed { address }))
    }

    fn write(&mut self, target: &mut dyn TargetOps, link: &mut dyn Link, address: u32, data: &[u8]) -> Result<()> {
        target.mem_write(link, address, data)?;
        let page = (address - self.base) / self.page_size;
        self.command(target, link, cmd::WP, page)?;
        self.wait_ready(target, link)
            .map_err(|_| Error::Flash(FlashError::WriteFailed { address }))
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
        // EEFC has no single-shot chip erase on this family; the engine
        // falls back to its per-page erase loop.
        Ok(false)
    }

    /// `monitor gpnvm set|clear <bit>` (spec.md §6).
    fn run_command(
        &mut self,
        target: &mut dyn TargetOps,
        link: &mut dyn Link,
        name: &str,
        args: &[&str],
    ) -> Result<bool> {
        if name != "gpnvm" {
            return Ok(false);
        }
        let [action, bit] = args else {
            return Err(Error::TargetProtocolError(
                "usage: gpnvm set|clear <bit>".into(),
            ));
        };
        let set = match *action {
            "set" => true,
            "clear" => false,
            _ => {
                return Err(Error::TargetProtocolError(
                    "usage: gpnvm set|clear <bit>".into(),
                ))
            }
        };
        let bit: u32 = bit
            .parse()
            .map_err(|_| Error::TargetProtocolError("gpnvm bit must be a number".into()))?;
        self.set_gpnvm(target, link, bit, set)?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_register_encodes_key_and_argument() {
        // FCR = KEY(0x5A) | ARG(page<<8) | CMD, per the EEFC register layout.
        let fcr = FCR_KEY | (cmd::EPA & 0xFF) | ((3u32 & 0xFFFF) << 8);
        assert_eq!(fcr, 0x5A00_0307);
    }
}
