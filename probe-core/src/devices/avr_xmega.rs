//! AVR XMEGA NVM controller driver (spec.md §4.9 "full fidelity"),
//! reached through the target's ordinary PDI-backed `mem_read`/`mem_write`
//! the same way the Cortex-M driver reaches ADIv5 memory.

use std::time::{Duration, Instant};

use crate::error::{Error, Result};
use crate::flash::{FlashError, FlashOps};
use crate::link::Link;
use crate::target::{Progress, TargetOps};

/// NVM controller I/O register addresses (ATxmega datasheet §NVM
/// Controller, "NVM Register Summary").
mod nvm {
    pub const ADDR0: u32 = 0x01C0;
    pub const DATA0: u32 = 0x01C4;
    pub const CMD: u32 = 0x01CA;
    pub const CTRLA: u32 = 0x01CB;
    pub const STATUS: u32 = 0x01CF;
}

mod cmd {
    pub const NO_OPERATION: u8 = 0x00;
    pub const ERASE_APP_PAGE: u8 = 0x20;
    pub const ERASE_WRITE_APP_PAGE: u8 = 0x25;
    pub const CHIP_ERASE: u8 = 0x40;
}

const STATUS_NVMBUSY: u8 = 1 << 7;
/// CTRLA.CMDEX: writing 1 here triggers the command latched in NVM.CMD
/// (ATxmega datasheet §NVM Controller).
const CTRLA_CMDEX: u8 = 1;

/// ATxmega XMEGA NVM controller driver.
pub struct AvrXmegaFlash {
    pub timeout: Duration,
}

impl Default for AvrXmegaFlash {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(1),
        }
    }
}

impl AvrXmegaFlash {
    fn wait_ready(&self, target: &mut dyn TargetOps, link: &mut dyn Link) -> Result<()> {
        let deadline = Instant::now() + self.timeout;
        loop {
            let mut status = [0u8];
            target.mem_read(link, nvm::STATUS, &mut status)?;
            if status[0] & STATUS_NVMBUSY == 0 {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(Error::TransportTimeout("AVR NVM controller busy"));
            }
        }
    }

    fn set_address(&self, target: &mut dyn TargetOps, link: &mut dyn Link, address: u32) -> Result<()> {
        target.mem_write(link, nvm::ADDR0, &address.to_le_bytes()[..3])
    }

    fn issue(&self, target: &mut dyn TargetOps, link: &mut dyn Link, command: u8) -> Result<()> {
        target.mem_write(link, nvm::CMD, &[command])?;
        target.mem_write(link, nvm::CTRLA, &[CTRLA_CMDEX])
    }
}

impl FlashOps for AvrXmegaFlash {
    fn prepare(&mut self, target: &mut dyn TargetOps, link: &mut dyn Link) -> Result<()> {
        self.wait_ready(target, link)
    }

    fn erase(&mut self, target: &mut dyn TargetOps, link: &mut dyn Link, address: u32, _length: u32) -> Result<()> {
        self.set_address(target, link, address)?;
        self.issue(target, link, cmd::ERASE_APP_PAGE)?;
        self.wait_ready(target, link)
            .map_err(|_| Error::Flash(FlashError::EraseFailed { address }))
    }

    fn write(&mut self, target: &mut dyn TargetOps, link: &mut dyn Link, address: u32, data: &[u8]) -> Result<()> {
        self.set_address(target, link, address)?;
        target.mem_write(link, nvm::DATA0, data)?;
        self.issue(target, link, cmd::ERASE_WRITE_APP_PAGE)?;
        self.wait_ready(target, link)
            .map_err(|_| Error::Flash(FlashError::WriteFailed { address }))
    }

    fn done(&mut self, target: &mut dyn TargetOps, link: &mut dyn Link) -> Result<()> {
        target.mem_write(link, nvm::CMD, &[cmd::NO_OPERATION])
    }

    fn mass_erase(
        &mut self,
        target: &mut dyn TargetOps,
        link: &mut dyn Link,
        progress: &mut dyn Progress,
    ) -> Result<bool> {
        self.issue(target, link, cmd::CHIP_ERASE)?;
        progress.report(0, 1);
        self.wait_ready(target, link)?;
        progress.report(1, 1);
        Ok(true)
    }
}
