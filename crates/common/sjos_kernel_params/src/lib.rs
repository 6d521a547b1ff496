#![no_std]

/// Maximum number of CPUs.
pub const NCPU: usize = 8;

/// log2 of the environment table size.
pub const LOG2NENV: usize = 9;

/// Maximum number of environments.
pub const NENV: usize = 1 << LOG2NENV;

/// Environment slots owned by each CPU in per-CPU scheduling mode.
///
/// Slot 0 of every slice is reserved for that CPU's idle environment.
pub const NENV_PER_CPU: usize = NENV / NCPU;

const _: () = assert!(NENV_PER_CPU * NCPU == NENV);
const _: () = assert!(NENV_PER_CPU >= 2);

/// Bytes per page.
pub const PAGE_SIZE: usize = 4096;

/// Top of user-accessible address space.
///
/// Addresses at or above this value are never mapped on behalf of a user environment.
pub const UTOP: usize = 0xeec0_0000;

/// Top of the user exception stack.
pub const UXSTACKTOP: usize = UTOP;

/// Top of the normal user stack.
pub const USTACKTOP: usize = UTOP - 2 * PAGE_SIZE;

/// Scratch address used by the user-level page fault handler.
pub const PFTEMP: usize = UTOP - 0x40_0000 - PAGE_SIZE;

/// First interrupt vector used for hardware IRQs.
pub const IRQ_OFFSET: u32 = 32;

/// IRQ line of the local APIC timer.
pub const IRQ_TIMER: u32 = 0;

/// IRQ line reported for spurious local APIC interrupts.
pub const IRQ_SPURIOUS: u32 = 7;

/// IRQ line of the local APIC error interrupt.
pub const IRQ_ERROR: u32 = 19;

/// Initial count of the periodic local APIC timer.
pub const LAPIC_TIMER_INITIAL_COUNT: u32 = 10_000_000;

/// Physical address where the AP boot trampoline is placed.
pub const MPENTRY_PADDR: usize = 0x7000;

/// Kernel stack size per CPU.
pub const KSTACK_SIZE: usize = 8 * PAGE_SIZE;

/// Virtual address at which all of physical memory is mapped in the kernel.
pub const KERNBASE: usize = 0xf000_0000;

/// Bytes mapped by one page table.
pub const PTSIZE: usize = 1024 * PAGE_SIZE;

/// User read-only virtual page table.
pub const UVPT: usize = 0xef40_0000;

/// User read-only view of the page directory, inside [`UVPT`].
pub const UVPD: usize = UVPT + (UVPT >> 12) * 4;
