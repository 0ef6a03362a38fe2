//! Session-wide state: the live target arena plus the options that apply
//! across every DP/target it holds (spec.md §4.6 "(ambient)"; teacher
//! precedent: `probe_rs::Session` owning a `Vec` of cores).

use crate::target::{Target, TargetArena, TargetId};

/// Owns every target discovered on this scan and hands out [`TargetId`]s
/// rather than raw pointers into the arena (spec.md §9).
#[derive(Default)]
pub struct Session {
    arena: TargetArena,
}

impl Session {
    pub fn new() -> Self {
        Self::default()
    }

    /// `target_new` (spec.md §6).
    pub fn target_new(&mut self, target: Target) -> TargetId {
        self.arena.target_new(target)
    }

    pub fn get(&self, id: TargetId) -> Option<&Target> {
        self.arena.get(id)
    }

    pub fn get_mut(&mut self, id: TargetId) -> Option<&mut Target> {
        self.arena.get_mut(id)
    }

    /// `target_foreach` (spec.md §6).
    pub fn foreach(&self, f: impl FnMut(TargetId, &Target)) {
        self.arena.foreach(f)
    }

    pub fn current(&self) -> Option<TargetId> {
        self.arena.current()
    }

    pub fn set_current(&mut self, id: TargetId) {
        self.arena.set_current(id)
    }

    /// Frees every target, e.g. on rescan (spec.md §3 lifecycle).
    pub fn rescan(&mut self) {
        self.arena.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::target::TargetOps;

    struct NullOps;
    impl TargetOps for NullOps {
        fn attach(&mut self, _link: &mut dyn crate::link::Link) -> crate::error::Result<()> {
            Ok(())
        }
        fn detach(&mut self, _link: &mut dyn crate::link::Link) -> crate::error::Result<()> {
            Ok(())
        }
        fn check_error(&mut self, _link: &mut dyn crate::link::Link) -> crate::error::Result<bool> {
            Ok(false)
        }
        fn mem_read(
            &mut self,
            _link: &mut dyn crate::link::Link,
            _address: u32,
            _data: &mut [u8],
        ) -> crate::error::Result<()> {
            Ok(())
        }
        fn mem_write(
            &mut self,
            _link: &mut dyn crate::link::Link,
            _address: u32,
            _data: &[u8],
        ) -> crate::error::Result<()> {
            Ok(())
        }
        fn regs_read(&mut self, _link: &mut dyn crate::link::Link, _out: &mut [u32]) -> crate::error::Result<()> {
            Ok(())
        }
        fn regs_write(&mut self, _link: &mut dyn crate::link::Link, _values: &[u32]) -> crate::error::Result<()> {
            Ok(())
        }
        fn reg_read(&mut self, _link: &mut dyn crate::link::Link, _reg: u32) -> crate::error::Result<u32> {
            Ok(0)
        }
        fn reg_write(&mut self, _link: &mut dyn crate::link::Link, _reg: u32, _value: u32) -> crate::error::Result<()> {
            Ok(())
        }
        fn reset(&mut self, _link: &mut dyn crate::link::Link) -> crate::error::Result<()> {
            Ok(())
        }
        fn halt_request(&mut self, _link: &mut dyn crate::link::Link) -> crate::error::Result<()> {
            Ok(())
        }
        fn halt_poll(&mut self, _link: &mut dyn crate::link::Link) -> crate::error::Result<crate::target::HaltReason> {
            Ok(crate::target::HaltReason::Running)
        }
        fn halt_resume(&mut self, _link: &mut dyn crate::link::Link, _step: bool) -> crate::error::Result<()> {
            Ok(())
        }
        fn breakwatch_set(
            &mut self,
            _link: &mut dyn crate::link::Link,
            _kind: crate::target::BreakwatchKind,
            _addr: u64,
            _size: u32,
        ) -> crate::error::Result<crate::target::BreakwatchOutcome> {
            Ok(crate::target::BreakwatchOutcome::Unsupported)
        }
        fn breakwatch_clear(&mut self, _link: &mut dyn crate::link::Link, _slot: u8) -> crate::error::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn rescan_clears_current_target() {
        let mut session = Session::new();
        let id = session.target_new(Target::new("null", "null-core", Box::new(NullOps)));
        session.set_current(id);
        assert!(session.current().is_some());
        session.rescan();
        assert!(session.current().is_none());
        assert!(session.get(id).is_none());
    }
}
