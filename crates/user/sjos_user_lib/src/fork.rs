//! Fork with copy-on-write, implemented in user space.
//!
//! The parent's pages are mapped into the child instead of copied. Pages
//! that either side may write are marked [`PtePerm::COW`] in both, and the
//! first write to one faults into [`handle_cow_fault()`], which gives the
//! writer a private copy.

use sjos_kernel_params::{PAGE_SIZE, PFTEMP, PTSIZE, USTACKTOP, UXSTACKTOP};
use sjos_syscall::{EnvStatus, PtePerm, error::SyscallError};
use sjos_types::env::EnvId;

use crate::syscall::{SyscallExt as _, Syscalls};

/// Page fault error code bit set for writes.
pub const FEC_WR: u32 = 0x2;

/// Read-only view of the calling environment's page tables.
pub trait AddressSpace {
    /// Returns `true` if a page table covers `va`.
    fn table_present(&self, va: usize) -> bool;

    /// Permission bits of the page mapped at `va`, if any.
    fn page_perm(&self, va: usize) -> Option<PtePerm>;

    /// Copies the page at `src` to the page at `dst`.
    fn copy_page(&self, src: usize, dst: usize);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum PageFaultError {
    #[error("fault is not a write: va {va:#x}, err {err:#010x}")]
    NotWrite { va: usize, err: u32 },
    #[error("fault on a non-cow page: va {va:#x}")]
    NotCow { va: usize },
    #[error(transparent)]
    Syscall(#[from] SyscallError),
}

/// Gives the faulting environment a private writable copy of a COW page.
pub fn handle_cow_fault<S, A>(sys: &S, space: &A, fault_va: usize, err: u32) -> Result<(), PageFaultError>
where
    S: Syscalls + ?Sized,
    A: AddressSpace + ?Sized,
{
    if err & FEC_WR == 0 {
        return Err(PageFaultError::NotWrite { va: fault_va, err });
    }
    let va = fault_va & !(PAGE_SIZE - 1);
    if !space
        .page_perm(va)
        .is_some_and(|perm| perm.contains(PtePerm::COW))
    {
        return Err(PageFaultError::NotCow { va: fault_va });
    }

    // Copy into a fresh page at PFTEMP, then move it over the old mapping.
    let perm = PtePerm::U | PtePerm::W | PtePerm::P;
    sys.sys_page_alloc(None, PFTEMP, perm)?;
    space.copy_page(va, PFTEMP);
    sys.sys_page_map(None, PFTEMP, None, va, perm)?;
    sys.sys_page_unmap(None, PFTEMP)?;
    Ok(())
}

/// Maps the page at `va` into `child` at the same address.
///
/// A writable or COW page is mapped COW in the child. Our own mapping is
/// then remapped COW as well, so that our next write copies the page
/// instead of showing through to the child.
fn duppage<S>(sys: &S, child: EnvId, va: usize, mapped: PtePerm) -> Result<(), SyscallError>
where
    S: Syscalls + ?Sized,
{
    let mut perm = PtePerm::U | PtePerm::P;
    if mapped.intersects(PtePerm::W | PtePerm::COW) {
        perm |= PtePerm::COW;
    }
    sys.sys_page_map(None, va, Some(child), va, perm)?;
    if perm.contains(PtePerm::COW) {
        sys.sys_page_map(None, va, None, va, perm)?;
    }
    Ok(())
}

fn copy_address_space<S, A>(sys: &S, space: &A, child: EnvId, upcall: usize) -> Result<(), SyscallError>
where
    S: Syscalls + ?Sized,
    A: AddressSpace + ?Sized,
{
    let mut va = 0;
    while va < USTACKTOP {
        if !space.table_present(va) {
            va = (va & !(PTSIZE - 1)) + PTSIZE;
            continue;
        }
        if let Some(mapped) = space.page_perm(va) {
            duppage(sys, child, va, mapped)?;
        }
        va += PAGE_SIZE;
    }

    // The exception stack is never shared.
    sys.sys_page_alloc(
        Some(child),
        UXSTACKTOP - PAGE_SIZE,
        PtePerm::U | PtePerm::W | PtePerm::P,
    )?;
    sys.sys_env_set_pgfault_upcall(Some(child), upcall)?;
    sys.sys_env_set_status(Some(child), EnvStatus::Runnable)
}

/// Creates a copy-on-write child of the calling environment.
///
/// `upcall` is the assembly entry point that calls [`handle_cow_fault()`]
/// on the exception stack. Returns the child's id in the parent and `None`
/// in the child.
pub fn fork<S, A>(sys: &S, space: &A, upcall: usize) -> Result<Option<EnvId>, SyscallError>
where
    S: Syscalls + ?Sized,
    A: AddressSpace + ?Sized,
{
    if space.page_perm(UXSTACKTOP - PAGE_SIZE).is_none() {
        sys.sys_page_alloc(
            None,
            UXSTACKTOP - PAGE_SIZE,
            PtePerm::U | PtePerm::W | PtePerm::P,
        )?;
    }
    sys.sys_env_set_pgfault_upcall(None, upcall)?;

    let Some(child) = sys.sys_exofork()? else {
        return Ok(None);
    };
    if let Err(e) = copy_address_space(sys, space, child, upcall) {
        if let Err(destroy) = sys.sys_env_destroy(Some(child)) {
            log::warn!("fork: destroying child {child} after {e}: {destroy}");
        }
        return Err(e);
    }
    Ok(Some(child))
}
