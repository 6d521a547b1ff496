//! Nested interrupt disabling.
//!
//! `push_disabled` and `pop_disabled` are like `cli` and `sti` except that
//! they are matched: it takes two `pop_disabled` to undo two
//! `push_disabled`. Also, if interrupts are off on entry to the outermost
//! `push_disabled`, the matching `pop_disabled` leaves them off.

use core::{
    marker::PhantomData,
    mem,
    sync::atomic::{AtomicBool, AtomicUsize, Ordering},
};

use crate::arch::Arch;

/// Per-CPU nesting state. Only ever touched by the CPU owning it.
#[derive(Debug)]
pub struct IntrNesting {
    depth: AtomicUsize,
    enabled_before: AtomicBool,
}

impl Default for IntrNesting {
    fn default() -> Self {
        Self::new()
    }
}

impl IntrNesting {
    pub const fn new() -> Self {
        Self {
            depth: AtomicUsize::new(0),
            enabled_before: AtomicBool::new(false),
        }
    }

    /// Returns depth of [`Self::push_disabled()`] calls.
    pub fn depth(&self) -> usize {
        self.depth.load(Ordering::Relaxed)
    }

    /// Saves the current interrupt enable state and disables interrupts.
    pub fn push_disabled<A>(&self) -> Guard<'_, A>
    where
        A: Arch,
    {
        let enabled = A::interrupts_enabled();
        A::disable_interrupts();

        let depth = self.depth.fetch_add(1, Ordering::Acquire);
        if depth == 0 {
            self.enabled_before.store(enabled, Ordering::Relaxed);
        }
        Guard {
            nesting: self,
            _arch: PhantomData,
        }
    }

    /// Restores the interrupt enable state saved by the outermost
    /// [`Self::push_disabled()`].
    ///
    /// # Safety
    ///
    /// Must match an earlier `push_disabled` whose guard was forgotten.
    pub unsafe fn pop_disabled<A>(&self)
    where
        A: Arch,
    {
        drop(Guard::<A> {
            nesting: self,
            _arch: PhantomData,
        });
    }
}

/// Guard that restores interrupt enable state when dropped.
#[must_use]
pub struct Guard<'a, A>
where
    A: Arch,
{
    nesting: &'a IntrNesting,
    _arch: PhantomData<fn() -> A>,
}

impl<A> Drop for Guard<'_, A>
where
    A: Arch,
{
    fn drop(&mut self) {
        assert!(!A::interrupts_enabled(), "pop_disabled - interruptible");
        let depth = self.nesting.depth.load(Ordering::Relaxed);
        assert!(depth > 0, "pop_disabled - unbalanced");
        let enabled = self.nesting.enabled_before.load(Ordering::Relaxed);
        if self.nesting.depth.fetch_sub(1, Ordering::Release) == 1 && enabled {
            A::enable_interrupts();
        }
    }
}

impl<A> Guard<'_, A>
where
    A: Arch,
{
    /// Keeps interrupts disabled past the end of the guard's scope.
    pub fn forget(self) {
        mem::forget(self);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::mock::MockArch;

    fn check_nesting(depth: usize, enabled: bool) {
        let nesting = IntrNesting::new();
        if enabled {
            MockArch::enable_interrupts();
        } else {
            MockArch::disable_interrupts();
        }

        for _ in 0..depth {
            nesting.push_disabled::<MockArch>().forget();
            assert!(!MockArch::interrupts_enabled());
        }
        assert_eq!(nesting.depth(), depth);
        for level in (0..depth).rev() {
            unsafe { nesting.pop_disabled::<MockArch>() };
            assert_eq!(nesting.depth(), level);
            let expected = if level == 0 { enabled } else { false };
            assert_eq!(MockArch::interrupts_enabled(), expected);
        }
    }

    #[test]
    fn test_restore_enabled() {
        for depth in 1..=3 {
            check_nesting(depth, true);
        }
    }

    #[test]
    fn test_restore_disabled() {
        for depth in 1..=3 {
            check_nesting(depth, false);
        }
    }

    #[test]
    fn test_guard_scope() {
        let nesting = IntrNesting::new();
        MockArch::enable_interrupts();
        {
            let _outer = nesting.push_disabled::<MockArch>();
            {
                let _inner = nesting.push_disabled::<MockArch>();
                assert_eq!(nesting.depth(), 2);
            }
            assert!(!MockArch::interrupts_enabled());
        }
        assert!(MockArch::interrupts_enabled());
        assert_eq!(nesting.depth(), 0);
    }

    #[test]
    #[should_panic(expected = "pop_disabled - unbalanced")]
    fn test_unbalanced_pop() {
        let nesting = IntrNesting::new();
        MockArch::disable_interrupts();
        unsafe { nesting.pop_disabled::<MockArch>() };
    }

    #[test]
    #[should_panic(expected = "pop_disabled - interruptible")]
    fn test_pop_with_interrupts_enabled() {
        let nesting = IntrNesting::new();
        nesting.push_disabled::<MockArch>().forget();
        MockArch::enable_interrupts();
        unsafe { nesting.pop_disabled::<MockArch>() };
    }
}
