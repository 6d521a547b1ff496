//! System call dispatch.
//!
//! The call number is in `eax` and up to five arguments are in `edx`,
//! `ecx`, `ebx`, `edi` and `esi`. The result goes back in `eax`.

use sjos_syscall::{
    EnvStatus, PtePerm, SyscallCode, encode_result, error::SyscallError, is_user_page,
};
use sjos_types::env::EnvId;

use crate::{
    env::{Destroyed, KernelState, TrapFrame},
    error::KernelError,
    memory::Memory,
};

/// What the kernel does after a system call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Next {
    /// Return to the calling environment.
    Resume,
    /// Run the scheduler.
    Schedule,
}

enum Completion {
    /// Return the value to the caller.
    Return(u32),
    /// The caller gives up the CPU; it later resumes with 0.
    Yield,
    /// The caller no longer exists.
    Exit,
}

fn user_perm(raw: u32) -> Result<PtePerm, KernelError> {
    PtePerm::from_user(raw).ok_or(KernelError::InvalidArgument)
}

fn user_page(va: u32) -> Result<usize, KernelError> {
    let va = va as usize;
    is_user_page(va)
        .then_some(va)
        .ok_or(KernelError::InvalidArgument)
}

impl<M> KernelState<M>
where
    M: Memory,
{
    /// Handles a system call made by the environment running on `cpu`.
    ///
    /// `tf` is the caller's context as saved on kernel entry.
    pub fn syscall(&mut self, cpu: usize, tf: &TrapFrame) -> Next {
        let Some(slot) = self.current(cpu) else {
            return Next::Schedule;
        };
        self.envs[slot].tf = *tf;

        let result = match SyscallCode::from_repr(tf.regs.eax) {
            Some(code) => self.dispatch_syscall(cpu, code, tf.syscall_args()),
            None => {
                log::warn!("unknown sys call {}", tf.regs.eax);
                Err(KernelError::InvalidArgument)
            }
        };

        let ret = match result {
            Ok(Completion::Return(value)) => Ok(value),
            Ok(Completion::Yield) => {
                self.envs[slot].tf.regs.eax = 0;
                return Next::Schedule;
            }
            Ok(Completion::Exit) => return Next::Schedule,
            Err(e) => Err(SyscallError::from(e)),
        };
        self.envs[slot].tf.regs.eax = encode_result(ret);
        Next::Resume
    }

    fn dispatch_syscall(
        &mut self,
        cpu: usize,
        code: SyscallCode,
        [a1, a2, a3, a4, a5]: [u32; 5],
    ) -> Result<Completion, KernelError> {
        let ret = match code {
            SyscallCode::Getenvid => self.sys_getenvid(cpu)?,
            SyscallCode::EnvDestroy => return self.sys_env_destroy(cpu, a1),
            SyscallCode::PageAlloc => self.sys_page_alloc(cpu, a1, a2, a3).map(|()| 0)?,
            SyscallCode::PageMap => self.sys_page_map(cpu, a1, a2, a3, a4, a5).map(|()| 0)?,
            SyscallCode::PageUnmap => self.sys_page_unmap(cpu, a1, a2).map(|()| 0)?,
            SyscallCode::Exofork => self.sys_exofork(cpu)?,
            SyscallCode::EnvSetStatus => self.sys_env_set_status(cpu, a1, a2).map(|()| 0)?,
            SyscallCode::EnvSetPgfaultUpcall => {
                self.sys_env_set_pgfault_upcall(cpu, a1, a2).map(|()| 0)?
            }
            SyscallCode::Yield => return Ok(Completion::Yield),
            SyscallCode::IpcTrySend => self
                .ipc_try_send(cpu, a1, a2, a3 as usize, a4)
                .map(|()| 0)?,
            SyscallCode::IpcRecv => {
                self.ipc_recv(cpu, a1 as usize)?;
                return Ok(Completion::Yield);
            }
            SyscallCode::GetCpuId => {
                #[expect(clippy::cast_possible_truncation)]
                let cpu = cpu as u32;
                cpu
            }
        };
        Ok(Completion::Return(ret))
    }

    fn caller(&self, cpu: usize) -> Result<usize, KernelError> {
        self.current(cpu).ok_or(KernelError::BadTarget)
    }

    /// Returns the current environment's envid.
    fn sys_getenvid(&self, cpu: usize) -> Result<u32, KernelError> {
        self.current_id(cpu)
            .map(u32::from)
            .ok_or(KernelError::BadTarget)
    }

    /// Destroys a given environment (possibly the currently running
    /// environment).
    fn sys_env_destroy(&mut self, cpu: usize, envid: u32) -> Result<Completion, KernelError> {
        let slot = self.envid2env(cpu, envid, true)?;
        let caller = self.current_id(cpu);
        let target = self.envs[slot].id();
        if target == caller {
            log::debug!("[{:08x}] exiting gracefully", envid_raw(caller));
        } else {
            log::debug!(
                "[{:08x}] destroying {:08x}",
                envid_raw(caller),
                envid_raw(target)
            );
        }
        match self.env_destroy(cpu, slot) {
            Destroyed::FreedCurrent => Ok(Completion::Exit),
            Destroyed::Freed | Destroyed::Deferred => Ok(Completion::Return(0)),
        }
    }

    /// Allocates a new environment as a copy of the caller.
    ///
    /// The child's register state is copied from the parent, except that
    /// it returns 0 from this call. It starts out NOT_RUNNABLE and lives on
    /// the caller's CPU.
    fn sys_exofork(&mut self, cpu: usize) -> Result<u32, KernelError> {
        let parent = self.caller(cpu)?;
        let child = self.env_alloc(self.envs[parent].id(), cpu)?;
        self.envs[child].tf = self.envs[parent].tf;
        self.envs[child].tf.regs.eax = 0;
        self.envs[child]
            .id()
            .map(u32::from)
            .ok_or(KernelError::BadTarget)
    }

    /// Sets the status of an environment to RUNNABLE or NOT_RUNNABLE.
    fn sys_env_set_status(&mut self, cpu: usize, envid: u32, status: u32) -> Result<(), KernelError> {
        let status = match EnvStatus::from_repr(status) {
            Some(status @ (EnvStatus::Runnable | EnvStatus::NotRunnable)) => status,
            _ => return Err(KernelError::InvalidArgument),
        };
        let slot = self.envid2env(cpu, envid, true)?;
        self.envs[slot].status = status;
        Ok(())
    }

    /// Sets the page fault upcall of an environment.
    fn sys_env_set_pgfault_upcall(&mut self, cpu: usize, envid: u32, func: u32) -> Result<(), KernelError> {
        let slot = self.envid2env(cpu, envid, true)?;
        self.envs[slot].pgfault_upcall = func as usize;
        Ok(())
    }

    /// Allocates a zeroed page and maps it at `va` in `envid`'s address
    /// space, replacing any existing mapping.
    fn sys_page_alloc(&mut self, cpu: usize, envid: u32, va: u32, perm: u32) -> Result<(), KernelError> {
        let slot = self.envid2env(cpu, envid, true)?;
        let va = user_page(va)?;
        let perm = user_perm(perm)?;

        let page = self.memory.alloc_page()?;
        let pgdir = self.envs[slot].pgdir;
        if let Err(e) = self.memory.insert(pgdir, page, va, perm) {
            self.memory.free_page(page);
            return Err(e.into());
        }
        Ok(())
    }

    /// Maps the page at `srcva` in `srcenvid`'s address space at `dstva`
    /// in `dstenvid`'s address space.
    fn sys_page_map(
        &mut self,
        cpu: usize,
        srcenvid: u32,
        srcva: u32,
        dstenvid: u32,
        dstva: u32,
        perm: u32,
    ) -> Result<(), KernelError> {
        let src = self.envid2env(cpu, srcenvid, true)?;
        let dst = self.envid2env(cpu, dstenvid, true)?;
        let srcva = user_page(srcva)?;
        let dstva = user_page(dstva)?;
        let perm = user_perm(perm)?;

        let (page, mapped) = self
            .memory
            .lookup(self.envs[src].pgdir, srcva)
            .ok_or(KernelError::InvalidArgument)?;
        if perm.contains(PtePerm::W) && !mapped.contains(PtePerm::W) {
            return Err(KernelError::InvalidArgument);
        }
        let pgdir = self.envs[dst].pgdir;
        self.memory.insert(pgdir, page, dstva, perm)?;
        Ok(())
    }

    /// Unmaps the page at `va` in `envid`'s address space.
    ///
    /// Succeeds silently if no page is mapped.
    fn sys_page_unmap(&mut self, cpu: usize, envid: u32, va: u32) -> Result<(), KernelError> {
        let slot = self.envid2env(cpu, envid, true)?;
        let va = user_page(va)?;
        let pgdir = self.envs[slot].pgdir;
        self.memory.remove(pgdir, va);
        Ok(())
    }
}

fn envid_raw(id: Option<EnvId>) -> u32 {
    id.map_or(0, u32::from)
}

#[cfg(test)]
mod tests {
    use sjos_kernel_params::UTOP;
    use sjos_syscall::{NO_PAGE, decode_result};

    use super::*;
    use crate::{
        env::tests::{spawn, state},
        memory::mock::MockMemory,
        sched::SchedPolicy,
    };

    const VA: u32 = 0x0080_0000;
    const URW: u32 = 0x7;
    const UR: u32 = 0x5;

    /// Issues a system call from the environment running on `cpu`.
    fn call(
        state: &mut KernelState<MockMemory>,
        cpu: usize,
        code: SyscallCode,
        args: &[u32],
    ) -> (Next, Result<u32, SyscallError>) {
        let slot = state.current(cpu).unwrap();
        let mut tf = state.envs()[slot].tf;
        tf.regs.eax = code as u32;
        let mut regs = [0; 5];
        regs[..args.len()].copy_from_slice(args);
        [tf.regs.edx, tf.regs.ecx, tf.regs.ebx, tf.regs.edi, tf.regs.esi] = regs;
        let next = state.syscall(cpu, &tf);
        (next, decode_result(state.envs()[slot].tf.regs.eax))
    }

    fn running(policy: SchedPolicy, ncpu: usize) -> (Box<KernelState<MockMemory>>, usize) {
        let mut state = state(policy, ncpu);
        spawn(&mut state, 0);
        let slot = spawn(&mut state, 0);
        state.dispatch(0, slot);
        (state, slot)
    }

    fn id_of(state: &KernelState<MockMemory>, slot: usize) -> u32 {
        u32::from(state.envs()[slot].id().unwrap())
    }

    #[test]
    fn test_getenvid() {
        let (mut state, slot) = running(SchedPolicy::Global, 1);
        let id = id_of(&state, slot);
        assert_eq!(
            call(&mut state, 0, SyscallCode::Getenvid, &[]),
            (Next::Resume, Ok(id))
        );
    }

    #[test]
    fn test_unknown_syscall() {
        let (mut state, slot) = running(SchedPolicy::Global, 1);
        let mut tf = state.envs()[slot].tf;
        tf.regs.eax = 999;
        assert_eq!(state.syscall(0, &tf), Next::Resume);
        assert_eq!(
            decode_result(state.envs()[slot].tf.regs.eax),
            Err(SyscallError::InvalidArgument)
        );
    }

    #[test]
    fn test_syscall_saves_context() {
        let (mut state, slot) = running(SchedPolicy::Global, 1);
        let mut tf = state.envs()[slot].tf;
        tf.eip = 0x0080_1234;
        tf.regs.ebp = 0xeebf_df00;
        tf.regs.eax = SyscallCode::Yield as u32;
        assert_eq!(state.syscall(0, &tf), Next::Schedule);
        let saved = state.envs()[slot].trap_frame();
        assert_eq!(saved.eip, 0x0080_1234);
        assert_eq!(saved.regs.ebp, 0xeebf_df00);
        assert_eq!(saved.regs.eax, 0);
    }

    #[test]
    fn test_exofork() {
        let (mut state, parent) = running(SchedPolicy::Global, 1);
        let (next, child) = call(&mut state, 0, SyscallCode::Exofork, &[]);
        assert_eq!(next, Next::Resume);
        let child = child.unwrap();
        let slot = child as usize & 0x1ff;
        let env = &state.envs()[slot];
        assert_eq!(env.status(), EnvStatus::NotRunnable);
        assert_eq!(env.parent(), state.envs()[parent].id());
        assert_eq!(env.cpu(), 0);
        assert_eq!(env.trap_frame().regs.eax, 0);
        assert_eq!(env.trap_frame().eip, state.envs()[parent].trap_frame().eip);
    }

    #[test]
    fn test_exofork_on_callers_cpu() {
        let mut state = state(SchedPolicy::PerCpu, 2);
        spawn(&mut state, 1);
        let worker = spawn(&mut state, 1);
        state.dispatch(1, worker);
        let (_, child) = call(&mut state, 1, SyscallCode::Exofork, &[]);
        let slot = child.unwrap() as usize & 0x1ff;
        assert!(state.runqueue(1).range().contains(&slot));
        assert_eq!(state.envs()[slot].cpu(), 1);
    }

    #[test]
    fn test_set_status() {
        let (mut state, _) = running(SchedPolicy::Global, 1);
        let (_, child) = call(&mut state, 0, SyscallCode::Exofork, &[]);
        let child = child.unwrap();
        let slot = child as usize & 0x1ff;

        let bad = [EnvStatus::Free, EnvStatus::Running, EnvStatus::Dying]
            .map(|status| call(&mut state, 0, SyscallCode::EnvSetStatus, &[child, status as u32]).1);
        assert_eq!(bad, [Err(SyscallError::InvalidArgument); 3]);
        assert_eq!(
            call(&mut state, 0, SyscallCode::EnvSetStatus, &[child, 42]).1,
            Err(SyscallError::InvalidArgument)
        );

        let runnable = EnvStatus::Runnable as u32;
        assert_eq!(
            call(&mut state, 0, SyscallCode::EnvSetStatus, &[child, runnable]).1,
            Ok(0)
        );
        assert_eq!(state.envs()[slot].status(), EnvStatus::Runnable);
    }

    #[test]
    fn test_set_status_of_stranger() {
        let (mut state, _) = running(SchedPolicy::Global, 1);
        let stranger = spawn(&mut state, 0);
        let id = id_of(&state, stranger);
        let runnable = EnvStatus::NotRunnable as u32;
        assert_eq!(
            call(&mut state, 0, SyscallCode::EnvSetStatus, &[id, runnable]).1,
            Err(SyscallError::BadTarget)
        );
    }

    #[test]
    fn test_destroy_self() {
        let (mut state, slot) = running(SchedPolicy::Global, 1);
        let (next, _) = call(&mut state, 0, SyscallCode::EnvDestroy, &[0]);
        assert_eq!(next, Next::Schedule);
        assert_eq!(state.envs()[slot].status(), EnvStatus::Free);
        assert_eq!(state.current(0), None);
    }

    #[test]
    fn test_destroy_child() {
        let (mut state, _) = running(SchedPolicy::Global, 1);
        let (_, child) = call(&mut state, 0, SyscallCode::Exofork, &[]);
        let child = child.unwrap();
        assert_eq!(
            call(&mut state, 0, SyscallCode::EnvDestroy, &[child]),
            (Next::Resume, Ok(0))
        );
        assert_eq!(
            call(&mut state, 0, SyscallCode::EnvDestroy, &[child]).1,
            Err(SyscallError::BadTarget)
        );
    }

    #[test]
    fn test_page_alloc_map_unmap() {
        let (mut state, parent) = running(SchedPolicy::Global, 1);
        let (_, child) = call(&mut state, 0, SyscallCode::Exofork, &[]);
        let child = child.unwrap();
        let child_slot = child as usize & 0x1ff;

        assert_eq!(
            call(&mut state, 0, SyscallCode::PageAlloc, &[0, VA, URW]).1,
            Ok(0)
        );
        let (page, _) = state
            .memory()
            .lookup(state.envs()[parent].pgdir(), VA as usize)
            .unwrap();

        assert_eq!(
            call(&mut state, 0, SyscallCode::PageMap, &[0, VA, child, VA, UR]).1,
            Ok(0)
        );
        let child_pgdir = state.envs()[child_slot].pgdir();
        assert_eq!(
            state.memory().lookup(child_pgdir, VA as usize),
            Some((page, PtePerm::U | PtePerm::P))
        );

        assert_eq!(
            call(&mut state, 0, SyscallCode::PageUnmap, &[child, VA]).1,
            Ok(0)
        );
        assert_eq!(state.memory().lookup(child_pgdir, VA as usize), None);
        // unmapping nothing is fine
        assert_eq!(
            call(&mut state, 0, SyscallCode::PageUnmap, &[child, VA]).1,
            Ok(0)
        );
    }

    #[test]
    fn test_page_alloc_errors() {
        let (mut state, _) = running(SchedPolicy::Global, 1);
        let utop = u32::try_from(UTOP).unwrap();
        for args in [[0, VA + 1, URW], [0, utop, URW], [0, VA, 0x3], [0, VA, 0x17]] {
            assert_eq!(
                call(&mut state, 0, SyscallCode::PageAlloc, &args).1,
                Err(SyscallError::InvalidArgument),
                "{args:x?}"
            );
        }

        state.memory_mut().alloc_budget = Some(0);
        assert_eq!(
            call(&mut state, 0, SyscallCode::PageAlloc, &[0, VA, URW]).1,
            Err(SyscallError::OutOfMemory)
        );

        state.memory_mut().alloc_budget = None;
        state.memory_mut().fail_insert = true;
        let pages = state.memory().refs.len();
        assert_eq!(
            call(&mut state, 0, SyscallCode::PageAlloc, &[0, VA, URW]).1,
            Err(SyscallError::OutOfMemory)
        );
        // the page was given back
        assert_eq!(state.memory().refs.len(), pages);
    }

    #[test]
    fn test_page_map_errors() {
        let (mut state, _) = running(SchedPolicy::Global, 1);
        call(&mut state, 0, SyscallCode::PageAlloc, &[0, VA, UR]).1.unwrap();
        let other = VA + 0x1000;
        // unmapped source
        assert_eq!(
            call(&mut state, 0, SyscallCode::PageMap, &[0, other, 0, VA, UR]).1,
            Err(SyscallError::InvalidArgument)
        );
        // write over read-only
        assert_eq!(
            call(&mut state, 0, SyscallCode::PageMap, &[0, VA, 0, other, URW]).1,
            Err(SyscallError::InvalidArgument)
        );
        // bad target
        assert_eq!(
            call(&mut state, 0, SyscallCode::PageMap, &[0, VA, 0x0000_1100, other, UR]).1,
            Err(SyscallError::BadTarget)
        );
        assert_eq!(
            call(&mut state, 0, SyscallCode::PageMap, &[0, VA, 0, other, UR]).1,
            Ok(0)
        );
    }

    #[test]
    fn test_pgfault_upcall() {
        let (mut state, slot) = running(SchedPolicy::Global, 1);
        assert_eq!(
            call(&mut state, 0, SyscallCode::EnvSetPgfaultUpcall, &[0, 0x0080_0abc]).1,
            Ok(0)
        );
        assert_eq!(state.envs()[slot].pgfault_upcall(), 0x0080_0abc);
    }

    #[test]
    fn test_yield_and_recv_reschedule() {
        let (mut state, slot) = running(SchedPolicy::Global, 1);
        assert_eq!(call(&mut state, 0, SyscallCode::Yield, &[]).0, Next::Schedule);

        let no_page = u32::try_from(NO_PAGE).unwrap();
        assert_eq!(
            call(&mut state, 0, SyscallCode::IpcRecv, &[no_page]),
            (Next::Schedule, Ok(0))
        );
        assert_eq!(state.envs()[slot].status(), EnvStatus::NotRunnable);

        // a failed receive returns immediately
        state.envs[slot].status = EnvStatus::Running;
        state.envs[slot].ipc.recving = false;
        assert_eq!(
            call(&mut state, 0, SyscallCode::IpcRecv, &[VA + 4]),
            (Next::Resume, Err(SyscallError::InvalidArgument))
        );
    }

    #[test]
    fn test_try_send_not_receiving() {
        let (mut state, _) = running(SchedPolicy::Global, 1);
        let other = spawn(&mut state, 0);
        let id = id_of(&state, other);
        let no_page = u32::try_from(NO_PAGE).unwrap();
        assert_eq!(
            call(&mut state, 0, SyscallCode::IpcTrySend, &[id, 1, no_page, 0]),
            (Next::Resume, Err(SyscallError::NotReceiving))
        );
    }

    #[test]
    fn test_get_cpu_id() {
        let mut state = state(SchedPolicy::PerCpu, 4);
        let idle = spawn(&mut state, 3);
        state.dispatch(3, idle);
        assert_eq!(call(&mut state, 3, SyscallCode::GetCpuId, &[]).1, Ok(3));
    }

    #[test]
    fn test_no_current_env() {
        let mut state = state(SchedPolicy::Global, 1);
        let tf = TrapFrame::user();
        assert_eq!(state.syscall(0, &tf), Next::Schedule);
    }
}
