//! Interface to the virtual memory subsystem.
//!
//! Page allocation and page table management live outside the concurrency
//! core; the kernel reaches them only through [`Memory`].

use derive_more::From;
use sjos_syscall::PtePerm;

/// Physical address of a page directory.
///
/// The all-zero value is used for free environment slots.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, From)]
pub struct PageDir(usize);

impl PageDir {
    pub const NULL: Self = Self(0);

    pub const fn new(paddr: usize) -> Self {
        Self(paddr)
    }

    pub const fn paddr(self) -> usize {
        self.0
    }
}

/// Physical address of a page frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, From)]
pub struct PhysPage(usize);

impl PhysPage {
    pub const fn new(paddr: usize) -> Self {
        Self(paddr)
    }

    pub const fn paddr(self) -> usize {
        self.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum MemoryError {
    #[error("out of memory")]
    OutOfMemory,
    #[error("bad program image")]
    BadImage,
}

/// Page allocator and page table operations.
///
/// Only called with the big kernel lock held.
pub trait Memory {
    /// Creates a page directory containing the kernel mappings.
    fn create_address_space(&mut self) -> Result<PageDir, MemoryError>;

    /// Unmaps every user page and frees the page directory.
    fn destroy_address_space(&mut self, pgdir: PageDir);

    /// Allocates a zero-filled page that is not mapped anywhere yet.
    fn alloc_page(&mut self) -> Result<PhysPage, MemoryError>;

    /// Frees a page returned by [`Self::alloc_page()`] that was never mapped.
    fn free_page(&mut self, page: PhysPage);

    /// Maps `page` at `va`, replacing any existing mapping.
    fn insert(
        &mut self,
        pgdir: PageDir,
        page: PhysPage,
        va: usize,
        perm: PtePerm,
    ) -> Result<(), MemoryError>;

    /// Returns the page mapped at `va` and its permissions.
    fn lookup(&self, pgdir: PageDir, va: usize) -> Option<(PhysPage, PtePerm)>;

    /// Unmaps the page at `va`. Does nothing if nothing is mapped there.
    fn remove(&mut self, pgdir: PageDir, va: usize);

    /// Loads a program image and maps its initial stack.
    ///
    /// Returns the entry point.
    fn load_image(&mut self, pgdir: PageDir, image: &[u8]) -> Result<usize, MemoryError>;
}
