//! `monitor` command dispatch (spec.md §6: "`target_command` dispatches to
//! driver command tables").
//!
//! A handful of commands are generic enough to live at the target-core
//! level (`erase_mass`); everything else is tried first against the
//! attached core's own table via [`TargetOps::run_command`], then against
//! each flash region's [`crate::flash::FlashOps::run_command`] — NVM
//! controller commands like `gpnvm` belong to the flash driver, not the
//! core.

use crate::error::Result;
use crate::link::Link;
use crate::target::{Progress, Target};

/// Runs one `monitor <name> <args...>` line against `target` (spec.md §6).
/// Returns `Ok(false)` if nothing — core or any attached flash driver —
/// recognised `name`.
pub fn dispatch(
    target: &mut Target,
    link: &mut dyn Link,
    progress: &mut dyn Progress,
    name: &str,
    args: &[&str],
) -> Result<bool> {
    if name == "erase_mass" {
        target.mass_erase(link, progress)?;
        return Ok(true);
    }

    if target.ops.run_command(link, name, args)? {
        return Ok(true);
    }

    for region in &mut target.flash {
        if region.run_command(&mut *target.ops, link, name, args)? {
            return Ok(true);
        }
    }

    Ok(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flash::{Flash, FlashOps};
    use crate::target::TargetOps;

    struct NullLink;
    impl Link for NullLink {
        fn shift_dr_ir(
            &mut self,
            _which: crate::link::Register,
            _out_bits: &[u8],
            _in_bits: &mut [u8],
            _bit_count: usize,
        ) -> Result<()> {
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
        fn swd_read(&mut self, _request_byte: u8) -> Result<(crate::link::Ack, u32, bool)> {
            Ok((crate::link::Ack::Ok, 0, false))
        }
        fn swd_write(&mut self, _request_byte: u8, _data: u32, _parity: bool) -> Result<crate::link::Ack> {
            Ok(crate::link::Ack::Ok)
        }
        fn return_idle(&mut self) -> Result<()> {
            Ok(())
        }
    }

    struct RunCommandOps;
    impl TargetOps for RunCommandOps {
        fn attach(&mut self, _link: &mut dyn Link) -> Result<()> {
            Ok(())
        }
        fn detach(&mut self, _link: &mut dyn Link) -> Result<()> {
            Ok(())
        }
        fn check_error(&mut self, _link: &mut dyn Link) -> Result<bool> {
            Ok(false)
        }
        fn mem_read(&mut self, _link: &mut dyn Link, _address: u32, _data: &mut [u8]) -> Result<()> {
            Ok(())
        }
        fn mem_write(&mut self, _link: &mut dyn Link, _address: u32, _data: &[u8]) -> Result<()> {
            Ok(())
        }
        fn regs_read(&mut self, _link: &mut dyn Link, _out: &mut [u32]) -> Result<()> {
            Ok(())
        }
        fn regs_write(&mut self, _link: &mut dyn Link, _values: &[u32]) -> Result<()> {
            Ok(())
        }
        fn reg_read(&mut self, _link: &mut dyn Link, _reg: u32) -> Result<u32> {
            Ok(0)
        }
        fn reg_write(&mut self, _link: &mut dyn Link, _reg: u32, _value: u32) -> Result<()> {
            Ok(())
        }
        fn reset(&mut self, _link: &mut dyn Link) -> Result<()> {
            Ok(())
        }
        fn halt_request(&mut self, _link: &mut dyn Link) -> Result<()> {
            Ok(())
        }
        fn halt_poll(&mut self, _link: &mut dyn Link) -> Result<crate::target::HaltReason> {
            Ok(crate::target::HaltReason::Running)
        }
        fn halt_resume(&mut self, _link: &mut dyn Link, _step: bool) -> Result<()> {
            Ok(())
        }
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
        fn run_command(&mut self, _link: &mut dyn Link, name: &str, _args: &[&str]) -> Result<bool> {
            Ok(name == "gpnvm")
        }
    }

    #[derive(Default)]
    struct NoopFlashOps;
    impl FlashOps for NoopFlashOps {
        fn prepare(&mut self, _target: &mut dyn TargetOps, _link: &mut dyn Link) -> Result<()> {
            Ok(())
        }
        fn erase(&mut self, _target: &mut dyn TargetOps, _link: &mut dyn Link, _address: u32, _length: u32) -> Result<()> {
            Ok(())
        }
        fn write(&mut self, _target: &mut dyn TargetOps, _link: &mut dyn Link, _address: u32, _data: &[u8]) -> Result<()> {
            Ok(())
        }
        fn done(&mut self, _target: &mut dyn TargetOps, _link: &mut dyn Link) -> Result<()> {
            Ok(())
        }
    }

    /// A flash driver whose only recognised command lives below the core,
    /// like `SamGpnvmFlash::run_command`.
    #[derive(Default)]
    struct GpnvmFlashOps;
    impl FlashOps for GpnvmFlashOps {
        fn prepare(&mut self, _target: &mut dyn TargetOps, _link: &mut dyn Link) -> Result<()> {
            Ok(())
        }
        fn erase(&mut self, _target: &mut dyn TargetOps, _link: &mut dyn Link, _address: u32, _length: u32) -> Result<()> {
            Ok(())
        }
        fn write(&mut self, _target: &mut dyn TargetOps, _link: &mut dyn Link, _address: u32, _data: &[u8]) -> Result<()> {
            Ok(())
        }
        fn done(&mut self, _target: &mut dyn TargetOps, _link: &mut dyn Link) -> Result<()> {
            Ok(())
        }
        fn run_command(
            &mut self,
            _target: &mut dyn TargetOps,
            _link: &mut dyn Link,
            name: &str,
            _args: &[&str],
        ) -> Result<bool> {
            Ok(name == "driver_only")
        }
    }

    #[test]
    fn erase_mass_is_handled_by_the_core() {
        let mut link = NullLink;
        let mut target = Target::new("test", "test-core", Box::new(RunCommandOps));
        target.add_flash(Flash::new(0, 0x1000, 0x100, 0x10, 0xFF, Box::new(NoopFlashOps)));
        let mut progress = |_done: u32, _total: u32| {};

        let handled = dispatch(&mut target, &mut link, &mut progress, "erase_mass", &[]).unwrap();
        assert!(handled);
    }

    #[test]
    fn unknown_command_falls_through_to_the_driver() {
        let mut link = NullLink;
        let mut target = Target::new("test", "test-core", Box::new(RunCommandOps));
        let mut progress = |_done: u32, _total: u32| {};

        let handled = dispatch(&mut target, &mut link, &mut progress, "gpnvm", &["get"]).unwrap();
        assert!(handled);

        let handled = dispatch(&mut target, &mut link, &mut progress, "nonsense", &[]).unwrap();
        assert!(!handled);
    }

    /// A command neither the core nor any flash region recognises falls
    /// through to `Ok(false)`; one a flash region's driver recognises
    /// (but the core doesn't) is routed to it.
    #[test]
    fn command_unknown_to_the_core_falls_through_to_a_flash_region() {
        let mut link = NullLink;
        let mut target = Target::new("test", "test-core", Box::new(RunCommandOps));
        target.add_flash(Flash::new(0, 0x1000, 0x100, 0x10, 0xFF, Box::new(GpnvmFlashOps)));
        let mut progress = |_done: u32, _total: u32| {};

        let handled = dispatch(&mut target, &mut link, &mut progress, "driver_only", &[]).unwrap();
        assert!(handled);

        let handled = dispatch(&mut target, &mut link, &mut progress, "nonsense", &[]).unwrap();
        assert!(!handled);
    }
}
