//! The i386 system call gate and the user-visible page tables.

use core::{arch::asm, ptr};

use sjos_kernel_params::{PAGE_SIZE, UVPD, UVPT};
use sjos_syscall::{IpcFields, PtePerm, SyscallCode};

use crate::{fork::AddressSpace, syscall::Syscalls};

/// Interrupt vector of the system call gate.
pub const T_SYSCALL: u8 = 48;

/// The calling environment, entering the kernel through `int 0x30`.
#[derive(Debug)]
pub struct Jos {
    ipc: *const IpcFields,
}

impl Jos {
    /// # Safety
    ///
    /// `ipc` must point to the IPC fields the kernel publishes for the
    /// calling environment.
    pub const unsafe fn new(ipc: *const IpcFields) -> Self {
        Self { ipc }
    }
}

impl Syscalls for Jos {
    fn syscall(&self, code: SyscallCode, args: [u32; 5]) -> u32 {
        let ret: u32;
        // ebx and esi can't be asm operands, so they are saved by hand.
        unsafe {
            asm!(
                "push ebx",
                "push esi",
                "mov edx, [edi]",
                "mov ecx, [edi + 4]",
                "mov ebx, [edi + 8]",
                "mov esi, [edi + 16]",
                "mov edi, [edi + 12]",
                "int 0x30",
                "pop esi",
                "pop ebx",
                inlateout("eax") code as u32 => ret,
                inlateout("edi") args.as_ptr() => _,
                lateout("edx") _,
                lateout("ecx") _,
            );
        }
        ret
    }

    fn ipc_fields(&self) -> IpcFields {
        unsafe { self.ipc.read_volatile() }
    }
}

fn entry(base: usize, index: usize) -> u32 {
    unsafe {
        ptr::with_exposed_provenance::<u32>(base)
            .add(index)
            .read_volatile()
    }
}

impl AddressSpace for Jos {
    fn table_present(&self, va: usize) -> bool {
        entry(UVPD, va >> 22) & PtePerm::P.bits() != 0
    }

    fn page_perm(&self, va: usize) -> Option<PtePerm> {
        if !self.table_present(va) {
            return None;
        }
        let perm = PtePerm::from_bits_truncate(entry(UVPT, va >> 12));
        perm.contains(PtePerm::P).then_some(perm)
    }

    fn copy_page(&self, src: usize, dst: usize) {
        unsafe {
            ptr::copy_nonoverlapping(
                ptr::with_exposed_provenance::<u8>(src),
                ptr::with_exposed_provenance_mut::<u8>(dst),
                PAGE_SIZE,
            );
        }
    }
}
