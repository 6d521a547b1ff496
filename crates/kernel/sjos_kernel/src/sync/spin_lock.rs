use core::{
    cell::UnsafeCell,
    marker::PhantomData,
    ops::{Deref, DerefMut},
    sync::atomic::{AtomicBool, AtomicUsize, Ordering},
};

use crate::{arch::Arch, cpu::Cpu};

const NO_CPU: usize = usize::MAX;

/// Mutual exclusion lock.
///
/// The owner CPU is recorded for diagnostics only: it detects a CPU
/// acquiring a lock it already holds and releasing a lock it doesn't hold.
#[derive(Debug)]
pub struct RawSpinLock {
    /// Name of lock.
    name: &'static str,
    /// Is the lock held?
    locked: AtomicBool,
    /// Index of the CPU holding the lock.
    cpu: AtomicUsize,
}

impl RawSpinLock {
    pub const fn new(name: &'static str) -> Self {
        Self {
            name,
            locked: AtomicBool::new(false),
            cpu: AtomicUsize::new(NO_CPU),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Acquires the lock.
    ///
    /// Loops (spins) until the lock is acquired.
    ///
    /// # Panics
    ///
    /// Panics if `cpu` already holds the lock.
    pub fn acquire<A>(&self, cpu: &Cpu)
    where
        A: Arch,
    {
        // disable interrupts to avoid deadlock.
        cpu.intr.push_disabled::<A>().forget(); // drop re-enables interrupts, so we must forget it here.

        assert!(
            !self.holding(cpu),
            "CPU {} is trying to acquire lock `{}` that it already holds",
            cpu.index(),
            self.name
        );

        // `Ordering::Acquire` keeps the critical section's memory references
        // strictly after the lock is acquired.
        while self.locked.swap(true, Ordering::Acquire) {
            A::spin_hint();
        }

        // Record info about lock acquisition for holding() and debugging.
        self.cpu.store(cpu.index(), Ordering::Relaxed);
    }

    /// Releases the lock.
    ///
    /// # Panics
    ///
    /// Panics if `cpu` doesn't hold the lock.
    pub fn release<A>(&self, cpu: &Cpu)
    where
        A: Arch,
    {
        assert!(
            self.holding(cpu),
            "CPU {} is trying to release lock `{}` that it doesn't hold",
            cpu.index(),
            self.name
        );

        self.cpu.store(NO_CPU, Ordering::Relaxed);

        // `Ordering::Release` makes all the stores in the critical section
        // visible to other CPUs before the lock is released.
        self.locked.store(false, Ordering::Release);

        unsafe {
            cpu.intr.pop_disabled::<A>();
        }
    }

    /// Checks whether `cpu` is holding the lock.
    pub fn holding(&self, cpu: &Cpu) -> bool {
        self.locked.load(Ordering::Relaxed) && self.cpu.load(Ordering::Relaxed) == cpu.index()
    }
}

pub struct SpinLock<T, A> {
    lock: RawSpinLock,
    value: UnsafeCell<T>,
    _arch: PhantomData<fn() -> A>,
}

unsafe impl<T, A> Sync for SpinLock<T, A> where T: Send {}

impl<T, A> SpinLock<T, A>
where
    A: Arch,
{
    pub const fn new(name: &'static str, value: T) -> Self {
        Self {
            lock: RawSpinLock::new(name),
            value: UnsafeCell::new(value),
            _arch: PhantomData,
        }
    }

    /// Acquires the lock on behalf of `cpu`.
    ///
    /// Loops (spins) until the lock is acquired.
    pub fn lock<'a>(&'a self, cpu: &'a Cpu) -> SpinLockGuard<'a, T, A> {
        self.lock.acquire::<A>(cpu);
        SpinLockGuard { lock: self, cpu }
    }

    pub fn raw(&self) -> &RawSpinLock {
        &self.lock
    }
}

pub struct SpinLockGuard<'a, T, A>
where
    A: Arch,
{
    lock: &'a SpinLock<T, A>,
    cpu: &'a Cpu,
}

unsafe impl<T, A> Sync for SpinLockGuard<'_, T, A>
where
    T: Sync,
    A: Arch,
{
}

impl<T, A> Drop for SpinLockGuard<'_, T, A>
where
    A: Arch,
{
    fn drop(&mut self) {
        self.lock.lock.release::<A>(self.cpu);
    }
}

impl<T, A> Deref for SpinLockGuard<'_, T, A>
where
    A: Arch,
{
    type Target = T;

    fn deref(&self) -> &Self::Target {
        unsafe { &*self.lock.value.get() }
    }
}

impl<T, A> DerefMut for SpinLockGuard<'_, T, A>
where
    A: Arch,
{
    fn deref_mut(&mut self) -> &mut Self::Target {
        unsafe { &mut *self.lock.value.get() }
    }
}

impl<'a, T, A> SpinLockGuard<'a, T, A>
where
    A: Arch,
{
    /// The CPU holding the lock.
    pub fn cpu(&self) -> &'a Cpu {
        self.cpu
    }
}
