//! Concurrency core of a small multiprocessor exokernel.
//!
//! All kernel state lives in [`KernelState`], protected by a single big
//! kernel lock. A CPU takes the lock on every kernel entry and releases it
//! right before returning to user mode, so at most one CPU executes kernel
//! code at a time.

#![cfg_attr(not(test), no_std)]

use self::{
    arch::Arch,
    cpu::{Cpu, CpuSet},
    env::{KernelState, TrapFrame},
    memory::Memory,
    sched::Dispatch,
    sync::{SpinLock, SpinLockGuard},
    syscall::Next,
};

pub mod arch;
pub mod boot;
pub mod console;
pub mod cpu;
pub mod env;
pub mod error;
pub mod interrupt;
mod ipc;
pub mod memory;
pub mod sched;
pub mod sync;
pub mod syscall;

pub type KernelGuard<'a, A, M> = SpinLockGuard<'a, KernelState<M>, A>;

/// The kernel: its CPUs and the state shared among them.
pub struct Kernel<A, M>
where
    A: Arch,
{
    cpus: CpuSet,
    state: SpinLock<KernelState<M>, A>,
}

impl<A, M> Kernel<A, M>
where
    A: Arch,
    M: Memory,
{
    pub const fn new(memory: M) -> Self {
        Self {
            cpus: CpuSet::new(),
            state: SpinLock::new("kernel", KernelState::new(memory)),
        }
    }

    pub fn cpus(&self) -> &CpuSet {
        &self.cpus
    }

    /// Acquires the big kernel lock on behalf of `cpu`.
    pub fn lock<'a>(&'a self, cpu: &'a Cpu) -> KernelGuard<'a, A, M> {
        self.state.lock(cpu)
    }

    /// Releases the big kernel lock.
    pub fn unlock(guard: KernelGuard<'_, A, M>) {
        drop(guard);
        // Normally we wouldn't need to do this, but QEMU only runs
        // one CPU at a time and has a long time-slice.  Without the
        // pause, this CPU is likely to reacquire the lock before
        // another CPU has even been given a chance to acquire it.
        A::spin_hint();
    }

    /// Runs the next environment of the CPU holding `guard`.
    ///
    /// Drops into the kernel monitor if there is nothing left to run.
    pub fn schedule(&self, mut guard: KernelGuard<'_, A, M>) -> ! {
        let cpu = guard.cpu().index();
        match guard.schedule_next(cpu) {
            Ok(dispatch) => Self::run(guard, &dispatch),
            Err(e) => {
                log::error!("{e}: destroyed all environments - nothing more to do!");
                drop(guard);
                A::monitor()
            }
        }
    }

    fn run(guard: KernelGuard<'_, A, M>, dispatch: &Dispatch) -> ! {
        Self::unlock(guard);
        unsafe { A::env_pop_tf(&dispatch.tf, dispatch.pgdir) }
    }

    /// Enters the scheduler on `cpu` without a current context to save.
    pub fn enter_scheduler(&self, cpu: &Cpu) -> ! {
        let guard = self.lock(cpu);
        self.schedule(guard)
    }

    /// Kernel side of the system call trap taken on `cpu`.
    ///
    /// `tf` is the caller's context as pushed by the trap entry code.
    pub fn syscall_entry(&self, cpu: &Cpu, tf: &TrapFrame) -> ! {
        let mut guard = self.lock(cpu);
        let index = cpu.index();

        // Another CPU destroyed us while we were in user mode.
        if guard.reap_current(index) {
            self.schedule(guard);
        }

        match guard.syscall(index, tf) {
            Next::Resume => match guard.resume_current(index) {
                Some(dispatch) => Self::run(guard, &dispatch),
                None => self.schedule(guard),
            },
            Next::Schedule => self.schedule(guard),
        }
    }

    #[cfg(test)]
    pub(crate) fn with_ncpu(memory: M, ncpu: usize) -> Self {
        Self {
            cpus: CpuSet::with_ncpu(ncpu),
            state: SpinLock::new("kernel", KernelState::new(memory)),
        }
    }
}
