//! Typed wrappers around the raw system call interface.

use sjos_syscall::{
    EnvStatus, IpcFields, NO_PAGE, PtePerm, SyscallCode, decode_result, error::SyscallError,
};
use sjos_types::env::EnvId;

/// A way of entering the kernel.
pub trait Syscalls {
    /// Issues system call `code` and returns the raw return register.
    fn syscall(&self, code: SyscallCode, args: [u32; 5]) -> u32;

    /// IPC fields of the calling environment, as published by the kernel.
    fn ipc_fields(&self) -> IpcFields;
}

fn call<S>(sys: &S, code: SyscallCode, args: &[u32]) -> Result<u32, SyscallError>
where
    S: Syscalls + ?Sized,
{
    let mut regs = [0; 5];
    regs[..args.len()].copy_from_slice(args);
    decode_result(sys.syscall(code, regs))
}

/// `None` names the calling environment.
fn envid(id: Option<EnvId>) -> u32 {
    id.map_or(0, u32::from)
}

#[expect(clippy::cast_possible_truncation)]
fn addr(va: usize) -> u32 {
    va as u32
}

pub trait SyscallExt: Syscalls {
    fn sys_getenvid(&self) -> Result<EnvId, SyscallError> {
        let raw = call(self, SyscallCode::Getenvid, &[])?;
        EnvId::from_raw(raw).ok_or(SyscallError::Unknown)
    }

    fn sys_env_destroy(&self, env: Option<EnvId>) -> Result<(), SyscallError> {
        call(self, SyscallCode::EnvDestroy, &[envid(env)])?;
        Ok(())
    }

    fn sys_yield(&self) {
        // yield never fails
        let _ = call(self, SyscallCode::Yield, &[]);
    }

    /// Creates a blank child environment.
    ///
    /// Returns the child's id in the parent and `None` in the child.
    fn sys_exofork(&self) -> Result<Option<EnvId>, SyscallError> {
        let raw = call(self, SyscallCode::Exofork, &[])?;
        Ok(EnvId::from_raw(raw))
    }

    fn sys_env_set_status(&self, env: Option<EnvId>, status: EnvStatus) -> Result<(), SyscallError> {
        call(self, SyscallCode::EnvSetStatus, &[envid(env), status as u32])?;
        Ok(())
    }

    fn sys_env_set_pgfault_upcall(&self, env: Option<EnvId>, func: usize) -> Result<(), SyscallError> {
        call(self, SyscallCode::EnvSetPgfaultUpcall, &[envid(env), addr(func)])?;
        Ok(())
    }

    fn sys_page_alloc(&self, env: Option<EnvId>, va: usize, perm: PtePerm) -> Result<(), SyscallError> {
        call(self, SyscallCode::PageAlloc, &[envid(env), addr(va), perm.bits()])?;
        Ok(())
    }

    fn sys_page_map(
        &self,
        src: Option<EnvId>,
        srcva: usize,
        dst: Option<EnvId>,
        dstva: usize,
        perm: PtePerm,
    ) -> Result<(), SyscallError> {
        call(
            self,
            SyscallCode::PageMap,
            &[envid(src), addr(srcva), envid(dst), addr(dstva), perm.bits()],
        )?;
        Ok(())
    }

    fn sys_page_unmap(&self, env: Option<EnvId>, va: usize) -> Result<(), SyscallError> {
        call(self, SyscallCode::PageUnmap, &[envid(env), addr(va)])?;
        Ok(())
    }

    /// Sends `value`, and the page at `page` if any, if `to` is receiving.
    fn sys_ipc_try_send(
        &self,
        to: EnvId,
        value: u32,
        page: Option<usize>,
        perm: PtePerm,
    ) -> Result<(), SyscallError> {
        let srcva = addr(page.unwrap_or(NO_PAGE));
        let perm = if page.is_some() { perm.bits() } else { 0 };
        call(
            self,
            SyscallCode::IpcTrySend,
            &[u32::from(to), value, srcva, perm],
        )?;
        Ok(())
    }

    /// Blocks until a message arrives. The message is in [`Syscalls::ipc_fields`].
    fn sys_ipc_recv(&self, page: Option<usize>) -> Result<(), SyscallError> {
        call(self, SyscallCode::IpcRecv, &[addr(page.unwrap_or(NO_PAGE))])?;
        Ok(())
    }

    fn sys_get_cpu_id(&self) -> Result<usize, SyscallError> {
        let cpu = call(self, SyscallCode::GetCpuId, &[])?;
        Ok(cpu as usize)
    }
}

impl<S> SyscallExt for S where S: Syscalls + ?Sized {}
