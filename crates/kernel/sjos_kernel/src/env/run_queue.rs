use core::ops::Range;

use sjos_kernel_params::{NENV, NENV_PER_CPU};

use crate::sched::SchedPolicy;

/// A CPU's share of the environment table.
///
/// The first slot of the range is the CPU's idle environment.
#[derive(Debug, Clone, Copy)]
pub struct RunQueue {
    start: usize,
    len: usize,
    /// Slot running on the owning CPU.
    pub(super) current: Option<usize>,
    /// Head of the free slot list, linked through `Env::free_next`.
    pub(super) free_head: Option<usize>,
}

impl RunQueue {
    pub(super) const EMPTY: Self = Self {
        start: 0,
        len: 0,
        current: None,
        free_head: None,
    };

    /// The slots owned by CPU `cpu` under `policy`.
    pub(super) const fn for_cpu(policy: SchedPolicy, cpu: usize) -> Self {
        let (start, len) = match policy {
            SchedPolicy::Global => (0, NENV),
            SchedPolicy::PerCpu => (cpu * NENV_PER_CPU, NENV_PER_CPU),
        };
        Self {
            start,
            len,
            current: None,
            free_head: None,
        }
    }

    pub fn range(&self) -> Range<usize> {
        self.start..self.start + self.len
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Slot reserved for the idle environment.
    pub fn idle(&self) -> usize {
        self.start
    }

    pub fn current(&self) -> Option<usize> {
        self.current
    }

    /// Records `slot` as running on the owning CPU, returning the previous one.
    pub(crate) fn set_current(&mut self, slot: usize) -> Option<usize> {
        self.current.replace(slot)
    }

    /// The slot following `slot`, wrapping at the end of the range.
    pub(crate) fn next_slot(&self, slot: usize) -> usize {
        self.start + (slot - self.start + 1) % self.len
    }
}
