//! Processor operations the concurrency core depends on.

use crate::{env::TrapFrame, memory::PageDir};

#[cfg(target_arch = "x86")]
pub mod x86;

/// Per-CPU processor primitives.
///
/// All methods act on the CPU executing the call.
pub trait Arch: 'static {
    /// Returns `true` if the processor accepts interrupts.
    fn interrupts_enabled() -> bool;

    fn enable_interrupts();

    fn disable_interrupts();

    /// Hint issued on every iteration of a spin-wait loop.
    fn spin_hint();

    /// Switches to `pgdir` and returns to user mode with the registers in `tf`.
    ///
    /// # Safety
    ///
    /// `tf` must describe a valid user-mode context and the big kernel lock
    /// must already be released.
    unsafe fn env_pop_tf(tf: &TrapFrame, pgdir: PageDir) -> !;

    /// Enters the interactive kernel monitor.
    fn monitor() -> !;
}
