//! Target lifecycle, command dispatch and the capability vtable
//! (spec.md §4.6, §6).

pub mod breakwatch;
pub mod memory;

pub use breakwatch::{Breakwatch, BreakwatchKind, BreakwatchOutcome};
pub use memory::RamRegion;

use std::time::Duration;

use crate::error::{Error, Result};
use crate::flash::Flash;
use crate::link::Link;

/// Why a target most recently stopped (spec.md §6 `target_halt_poll`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HaltReason {
    Running,
    Request,
    Step,
    Breakpoint,
    Watchpoint,
    Fault,
    Error,
    Stepping,
}

/// Periodic callback for long-running operations (spec.md §5: 100-500 ms
/// cadence during flash erase/write).
pub trait Progress {
    fn report(&mut self, done: u32, total: u32);
}

impl<F: FnMut(u32, u32)> Progress for F {
    fn report(&mut self, done: u32, total: u32) {
        self(done, total)
    }
}

/// Minimal const-fn bitflags substitute, in the spirit of the teacher's
/// hand-rolled `bitfield!`-based register types rather than pulling in a
/// dependency for a handful of boolean flags.
macro_rules! bitflags_lite {
    (
        $(#[$meta:meta])*
        pub struct $name:ident: $repr:ty {
            $(const $flag:ident = $value:expr;)*
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
        pub struct $name($repr);

        impl $name {
            $(pub const $flag: $name = $name($value);)*

            pub const fn empty() -> Self {
                Self(0)
            }

            pub const fn contains(self, other: Self) -> bool {
                self.0 & other.0 == other.0
            }

            pub fn insert(&mut self, other: Self) {
                self.0 |= other.0;
            }

            pub fn remove(&mut self, other: Self) {
                self.0 &= !other.0;
            }
        }

        impl core::ops::BitOr for $name {
            type Output = Self;
            fn bitor(self, rhs: Self) -> Self {
                Self(self.0 | rhs.0)
            }
        }
    };
}

bitflags_lite! {
    /// `target_options` flags (spec.md §3), e.g. `INHIBIT_NRST` or AVR
    /// variant bits. Kept as a plain bitmask rather than pulling in the
    /// `bitflags` crate, since only a handful of bits are ever defined.
    pub struct TargetOptions: u32 {
        const INHIBIT_NRST = 1 << 0;
        const AVR_HAS_PDI_ENABLE_KEY_CUSTOM = 1 << 1;
        const CONNECT_UNDER_RESET = 1 << 2;
    }
}

/// Capability vtable a device driver implements (spec.md §3, §6, §9:
/// "Function-table polymorphism. ... The natural translation is a
/// trait/interface object dispatched through a vtable").
pub trait TargetOps {
    fn attach(&mut self, link: &mut dyn Link) -> Result<()>;
    fn detach(&mut self, link: &mut dyn Link) -> Result<()>;

    /// Returns true (and clears the sticky state) if a transport or driver
    /// error is pending (spec.md §4.6, §7).
    fn check_error(&mut self, link: &mut dyn Link) -> Result<bool>;

    fn mem_read(&mut self, link: &mut dyn Link, address: u32, data: &mut [u8]) -> Result<()>;
    fn mem_write(&mut self, link: &mut dyn Link, address: u32, data: &[u8]) -> Result<()>;

    fn regs_read(&mut self, link: &mut dyn Link, out: &mut [u32]) -> Result<()>;
    fn regs_write(&mut self, link: &mut dyn Link, values: &[u32]) -> Result<()>;
    fn reg_read(&mut self, link: &mut dyn Link, reg: u32) -> Result<u32>;
    fn reg_write(&mut self, link: &mut dyn Link, reg: u32, value: u32) -> Result<()>;

    fn reset(&mut self, link: &mut dyn Link) -> Result<()>;
    fn extended_reset(&mut self, link: &mut dyn Link) -> Result<()> {
        self.reset(link)
    }

    fn halt_request(&mut self, link: &mut dyn Link) -> Result<()>;
    fn halt_poll(&mut self, link: &mut dyn Link) -> Result<HaltReason>;
    fn halt_resume(&mut self, link: &mut dyn Link, step: bool) -> Result<()>;

    fn breakwatch_set(
        &mut self,
        link: &mut dyn Link,
        kind: BreakwatchKind,
        addr: u64,
        size: u32,
    ) -> Result<BreakwatchOutcome>;
    fn breakwatch_clear(&mut self, link: &mut dyn Link, slot: u8) -> Result<()>;

    /// Default no-op: most targets have no single mass-erase command and
    /// fall back to the flash engine's per-region loop (spec.md §4.8).
    fn mass_erase(&mut self, _link: &mut dyn Link, _progress: &mut dyn Progress) -> Result<bool> {
        Ok(false)
    }

    /// Run any per-driver command table entries (spec.md §4.6, §6
    /// `target_command` / monitor commands). Returns `Ok(true)` if the
    /// command name was recognised.
    fn run_command(&mut self, _link: &mut dyn Link, _name: &str, _args: &[&str]) -> Result<bool> {
        Ok(false)
    }
}

/// One debuggable processor presented to the debugger (spec.md §3).
pub struct Target {
    pub driver_name: &'static str,
    pub core_name: &'static str,
    pub cpuid: u32,
    pub partno: u32,
    pub designer: Option<jep106::JEP106Code>,
    pub attached: bool,
    pub flash_mode: bool,
    pub options: TargetOptions,
    pub ram: Vec<RamRegion>,
    pub flash: Vec<Flash>,
    pub breakwatches: Vec<Breakwatch>,
    pub ops: Box<dyn TargetOps>,
}

impl Target {
    pub fn new(driver_name: &'static str, core_name: &'static str, ops: Box<dyn TargetOps>) -> Self {
        Self {
            driver_name,
            core_name,
            cpuid: 0,
            partno: 0,
            designer: None,
            attached: false,
            flash_mode: false,
            options: TargetOptions::empty(),
            ram: Vec::new(),
            flash: Vec::new(),
            breakwatches: Vec::new(),
            ops,
        }
    }

    pub fn add_ram(&mut self, region: RamRegion) {
        self.ram.push(region);
    }

    pub fn add_flash(&mut self, flash: Flash) {
        let pos = self
            .flash
            .iter()
            .position(|f| f.start > flash.start)
            .unwrap_or(self.flash.len());
        self.flash.insert(pos, flash);
    }

    pub fn attach(&mut self, link: &mut dyn Link) -> Result<()> {
        self.ops.attach(link)?;
        self.attached = true;
        tracing::debug!(driver = self.driver_name, core = self.core_name, "target attached");
        Ok(())
    }

    pub fn detach(&mut self, link: &mut dyn Link) -> Result<()> {
        // Invariant (spec.md §4.7): all breakwatches must be cleared from
        // hardware before detach.
        let slots: Vec<u8> = self
            .breakwatches
            .iter()
            .map(|bw| bw.reserved[0] as u8)
            .collect();
        for slot in slots {
            self.ops.breakwatch_clear(link, slot)?;
        }
        self.breakwatches.clear();

        self.ops.detach(link)?;
        self.attached = false;
        self.flash_mode = false;
        Ok(())
    }

    pub fn check_error(&mut self, link: &mut dyn Link) -> Result<bool> {
        self.ops.check_error(link)
    }

    pub fn mem_read(&mut self, link: &mut dyn Link, address: u32, data: &mut [u8]) -> Result<()> {
        self.ops.mem_read(link, address, data)
    }

    pub fn mem_write(&mut self, link: &mut dyn Link, address: u32, data: &[u8]) -> Result<()> {
        self.ops.mem_write(link, address, data)
    }

    pub fn reg_read(&mut self, link: &mut dyn Link, reg: u32) -> Result<u32> {
        self.ops.reg_read(link, reg)
    }

    pub fn reg_write(&mut self, link: &mut dyn Link, reg: u32, value: u32) -> Result<()> {
        self.ops.reg_write(link, reg, value)
    }

    pub fn reset(&mut self, link: &mut dyn Link) -> Result<()> {
        self.ops.reset(link)
    }

    pub fn halt_request(&mut self, link: &mut dyn Link) -> Result<()> {
        self.ops.halt_request(link)
    }

    pub fn halt_poll(&mut self, link: &mut dyn Link) -> Result<HaltReason> {
        self.ops.halt_poll(link)
    }

    pub fn halt_resume(&mut self, link: &mut dyn Link, step: bool) -> Result<()> {
        self.ops.halt_resume(link, step)
    }

    /// Finds the flash region covering `address`, if any (spec.md §4.8).
    pub fn flash_region_for(&self, address: u32) -> Option<usize> {
        self.flash.iter().position(|f| f.contains(address))
    }

    /// `target_flash_write` (spec.md §6): routes to the region covering
    /// `address` and buffers the write there.
    pub fn flash_write(&mut self, link: &mut dyn Link, address: u32, data: &[u8]) -> Result<()> {
        let idx = self
            .flash_region_for(address)
            .ok_or(Error::Flash(crate::flash::FlashError::OutOfRange { address }))?;
        self.flash[idx].flash_write(&mut *self.ops, link, address, data)
    }

    /// `target_flash_erase` (spec.md §6).
    pub fn flash_erase(&mut self, link: &mut dyn Link, address: u32, length: u32) -> Result<()> {
        let idx = self
            .flash_region_for(address)
            .ok_or(Error::Flash(crate::flash::FlashError::OutOfRange { address }))?;
        self.flash[idx].flash_erase(&mut *self.ops, link, address, length)
    }

    /// `target_flash_mode(true)` / `(false)` (spec.md §6): enter/exit flash
    /// mode on every region at once.
    pub fn enter_flash_mode(&mut self, link: &mut dyn Link) -> Result<()> {
        self.flash_mode = true;
        for region in &mut self.flash {
            region.enter_flash_mode(&mut *self.ops, link)?;
        }
        Ok(())
    }

    pub fn exit_flash_mode(&mut self, link: &mut dyn Link) -> Result<()> {
        for region in &mut self.flash {
            region.exit_flash_mode(&mut *self.ops, link)?;
        }
        self.flash_mode = false;
        Ok(())
    }

    /// `target_mass_erase` (spec.md §6): prefer the driver's single-shot
    /// command, falling back to per-region erase loops.
    pub fn mass_erase(&mut self, link: &mut dyn Link, progress: &mut dyn Progress) -> Result<()> {
        if self.ops.mass_erase(link, progress)? {
            return Ok(());
        }
        for region in &mut self.flash {
            region.mass_erase(&mut *self.ops, link, progress)?;
        }
        Ok(())
    }

    /// A sub-300ms-per-poll upper bound used by callers that want to show a
    /// progress indicator (spec.md §7: "a progress indicator for any
    /// operation longer than ~300 ms").
    pub const PROGRESS_THRESHOLD: Duration = Duration::from_millis(300);
}

/// An arena of live targets, replacing the source's raw-pointer global
/// target list (spec.md §9).
#[derive(Default)]
pub struct TargetArena {
    targets: Vec<Target>,
    current: Option<TargetId>,
}

/// Index into a [`TargetArena`] (spec.md §9: "use an index into a target
/// arena rather than a raw pointer").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TargetId(pub usize);

impl TargetArena {
    pub fn new() -> Self {
        Self::default()
    }

    /// `target_new` (spec.md §6): allocate and register a new target.
    pub fn target_new(&mut self, target: Target) -> TargetId {
        self.targets.push(target);
        let id = TargetId(self.targets.len() - 1);
        if self.current.is_none() {
            self.current = Some(id);
        }
        id
    }

    pub fn get(&self, id: TargetId) -> Option<&Target> {
        self.targets.get(id.0)
    }

    pub fn get_mut(&mut self, id: TargetId) -> Option<&mut Target> {
        self.targets.get_mut(id.0)
    }

    /// `target_foreach` (spec.md §6).
    pub fn foreach(&self, mut f: impl FnMut(TargetId, &Target)) {
        for (i, target) in self.targets.iter().enumerate() {
            f(TargetId(i), target);
        }
    }

    pub fn current(&self) -> Option<TargetId> {
        self.current
    }

    pub fn set_current(&mut self, id: TargetId) {
        self.current = Some(id);
    }

    /// Frees all targets, e.g. on rescan (spec.md §3 lifecycle).
    pub fn clear(&mut self) {
        self.targets.clear();
        self.current = None;
    }
}
