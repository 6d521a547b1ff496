//! Local APIC and I/O APIC programming.
#![cfg_attr(not(test), no_std)]

use core::ptr::NonNull;

use vcell::VolatileCell;

pub use self::{io::IoApic, local::LocalApic};

pub mod io;
pub mod local;

/// A block of 32-bit memory-mapped registers.
pub trait Registers {
    /// Reads the register at byte offset `offset`.
    fn read(&self, offset: usize) -> u32;

    /// Writes the register at byte offset `offset`.
    fn write(&self, offset: usize, value: u32);
}

/// Memory-mapped registers accessed with volatile loads and stores.
#[derive(Debug)]
pub struct Mmio {
    base: NonNull<VolatileCell<u32>>,
}

unsafe impl Send for Mmio {}
unsafe impl Sync for Mmio {}

impl Mmio {
    /// Creates a register block at virtual address `base`.
    ///
    /// Returns `None` if `base` is 0, which means there is no controller.
    ///
    /// # Safety
    ///
    /// `base` must be the uncached mapping of the controller's register page
    /// and stay mapped for the lifetime of the returned value.
    #[must_use]
    pub unsafe fn new(base: usize) -> Option<Self> {
        let base = NonNull::new(core::ptr::with_exposed_provenance_mut(base))?;
        Some(Self { base })
    }

    fn cell(&self, offset: usize) -> &VolatileCell<u32> {
        assert_eq!(offset % size_of::<u32>(), 0);
        unsafe { self.base.add(offset / size_of::<u32>()).as_ref() }
    }
}

impl Registers for Mmio {
    fn read(&self, offset: usize) -> u32 {
        self.cell(offset).get()
    }

    fn write(&self, offset: usize, value: u32) {
        self.cell(offset).set(value);
    }
}

/// Platform services needed while starting application processors.
pub trait Platform {
    fn outb(&self, port: u16, value: u8);
    fn inb(&self, port: u16) -> u8;

    /// Writes a 16-bit word of low physical memory.
    fn write_phys_u16(&self, paddr: usize, value: u16);

    /// Spins for about `us` microseconds.
    fn micro_delay(&self, us: u32);
}

#[cfg(test)]
pub(crate) mod mock {
    use std::{cell::RefCell, collections::HashMap};

    use super::*;

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum Op {
        Write(usize, u32),
        Outb(u16, u8),
        Phys(usize, u16),
        Delay(u32),
    }

    #[derive(Default)]
    pub struct MockRegs {
        pub values: RefCell<HashMap<usize, u32>>,
        pub ops: RefCell<Vec<Op>>,
        /// Number of reads of `busy_reg` that still report the busy bit.
        pub busy: RefCell<(usize, u32, usize)>,
    }

    impl MockRegs {
        pub fn with(values: &[(usize, u32)]) -> Self {
            let regs = Self::default();
            regs.values.borrow_mut().extend(values.iter().copied());
            regs
        }

        pub fn writes(&self) -> Vec<(usize, u32)> {
            self.ops
                .borrow()
                .iter()
                .filter_map(|op| match op {
                    Op::Write(reg, value) => Some((*reg, *value)),
                    _ => None,
                })
                .collect()
        }
    }

    impl Registers for MockRegs {
        fn read(&self, offset: usize) -> u32 {
            let value = self.values.borrow().get(&offset).copied().unwrap_or(0);
            let mut busy = self.busy.borrow_mut();
            if busy.0 == offset && busy.2 > 0 {
                busy.2 -= 1;
                return value | busy.1;
            }
            value
        }

        fn write(&self, offset: usize, value: u32) {
            self.values.borrow_mut().insert(offset, value);
            self.ops.borrow_mut().push(Op::Write(offset, value));
        }
    }

    #[derive(Default)]
    pub struct MockPlatform {
        pub ops: RefCell<Vec<Op>>,
        pub ports: RefCell<HashMap<u16, u8>>,
    }

    impl Platform for MockPlatform {
        fn outb(&self, port: u16, value: u8) {
            self.ports.borrow_mut().insert(port, value);
            self.ops.borrow_mut().push(Op::Outb(port, value));
        }

        fn inb(&self, port: u16) -> u8 {
            self.ports.borrow().get(&port).copied().unwrap_or(0)
        }

        fn write_phys_u16(&self, paddr: usize, value: u16) {
            self.ops.borrow_mut().push(Op::Phys(paddr, value));
        }

        fn micro_delay(&self, us: u32) {
            self.ops.borrow_mut().push(Op::Delay(us));
        }
    }
}
