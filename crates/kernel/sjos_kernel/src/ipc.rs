//! Blocking IPC rendezvous.
//!
//! A receiver parks itself as NOT_RUNNABLE with its `recving` flag set; a
//! sender delivers directly into the receiver's IPC fields and makes it
//! RUNNABLE again. There are no wait queues: the receiver is picked up by
//! the ordinary round-robin scan of its own CPU.

use sjos_kernel_params::{PAGE_SIZE, UTOP};
use sjos_syscall::{EnvStatus, PtePerm};

use crate::{
    env::KernelState,
    error::KernelError,
    memory::Memory,
};

impl<M> KernelState<M>
where
    M: Memory,
{
    /// Blocks the environment running on `cpu` until a message arrives.
    ///
    /// If `dstva` is below `UTOP` the receiver is willing to accept a page
    /// there. On success the caller must schedule; the blocked environment
    /// later resumes with 0 in its return register.
    pub fn ipc_recv(&mut self, cpu: usize, dstva: usize) -> Result<(), KernelError> {
        if dstva < UTOP && dstva % PAGE_SIZE != 0 {
            return Err(KernelError::InvalidArgument);
        }
        let slot = self.current(cpu).ok_or(KernelError::BadTarget)?;

        let env = &mut self.envs[slot];
        env.ipc.recving = true;
        env.ipc.dstva = dstva;
        env.status = EnvStatus::NotRunnable;
        env.tf.regs.eax = 0;
        Ok(())
    }

    /// Tries to send `value` to the environment `target`.
    ///
    /// If `srcva` is below `UTOP`, the page mapped there is also shared
    /// with the receiver, provided it asked for one. Nothing about the
    /// receiver changes unless the send succeeds.
    pub fn ipc_try_send(
        &mut self,
        cpu: usize,
        target: u32,
        value: u32,
        srcva: usize,
        perm: u32,
    ) -> Result<(), KernelError> {
        let sender = self.current(cpu).ok_or(KernelError::BadTarget)?;
        let receiver = self.envid2env(cpu, target, false)?;
        if !self.envs[receiver].ipc.recving {
            return Err(KernelError::NotReceiving);
        }

        let mut transferred = PtePerm::empty();
        if srcva < UTOP {
            if srcva % PAGE_SIZE != 0 {
                return Err(KernelError::InvalidArgument);
            }
            let perm = PtePerm::from_user(perm).ok_or(KernelError::InvalidArgument)?;
            let (page, mapped) = self
                .memory
                .lookup(self.envs[sender].pgdir, srcva)
                .ok_or(KernelError::InvalidArgument)?;
            if perm.contains(PtePerm::W) && !mapped.contains(PtePerm::W) {
                return Err(KernelError::InvalidArgument);
            }

            let dstva = self.envs[receiver].ipc.dstva;
            if dstva < UTOP {
                let pgdir = self.envs[receiver].pgdir;
                self.memory.insert(pgdir, page, dstva, perm)?;
                transferred = perm;
            }
        }

        let from = self.envs[sender].id();
        let env = &mut self.envs[receiver];
        env.ipc.recving = false;
        env.ipc.from = from;
        env.ipc.value = value;
        env.ipc.perm = transferred;
        env.status = EnvStatus::Runnable;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use sjos_syscall::{IpcFields, NO_PAGE};

    use super::*;
    use crate::{
        env::tests::{spawn, state},
        memory::{MemoryError, PhysPage, mock::MockMemory},
        sched::SchedPolicy,
    };

    const SRC: usize = 0x0040_0000;
    const DST: usize = 0x00a0_0000;

    struct Pair {
        state: Box<KernelState<MockMemory>>,
        sender: usize,
        receiver: usize,
        receiver_id: u32,
    }

    /// Sender running on CPU 0, receiver running on CPU 1.
    fn pair() -> Pair {
        let mut state = state(SchedPolicy::PerCpu, 2);
        spawn(&mut state, 0);
        let sender = spawn(&mut state, 0);
        spawn(&mut state, 1);
        let receiver = spawn(&mut state, 1);
        state.dispatch(0, sender);
        state.dispatch(1, receiver);
        let receiver_id = u32::from(state.envs()[receiver].id().unwrap());
        Pair {
            state,
            sender,
            receiver,
            receiver_id,
        }
    }

    fn map_src(state: &mut KernelState<MockMemory>, slot: usize, perm: PtePerm) -> PhysPage {
        let pgdir = state.envs()[slot].pgdir();
        let page = state.memory_mut().alloc_page().unwrap();
        state.memory_mut().insert(pgdir, page, SRC, perm).unwrap();
        page
    }

    #[test]
    fn test_recv_blocks() {
        let Pair {
            mut state,
            receiver,
            ..
        } = pair();
        state.envs[receiver].tf.regs.eax = 11;
        state.ipc_recv(1, DST).unwrap();
        let env = &state.envs()[receiver];
        assert!(env.is_receiving());
        assert_eq!(env.status(), EnvStatus::NotRunnable);
        assert_eq!(env.trap_frame().regs.eax, 0);
    }

    #[test]
    fn test_recv_rejects_unaligned() {
        let Pair {
            mut state,
            receiver,
            ..
        } = pair();
        assert_eq!(
            state.ipc_recv(1, DST + 1),
            Err(KernelError::InvalidArgument)
        );
        assert!(!state.envs()[receiver].is_receiving());
        assert_eq!(state.envs()[receiver].status(), EnvStatus::Running);
        // unaligned addresses above UTOP just mean "no page"
        assert_eq!(state.ipc_recv(1, UTOP + 1), Ok(()));
    }

    #[test]
    fn test_send_value_only() {
        let Pair {
            mut state,
            sender,
            receiver,
            receiver_id,
        } = pair();
        state.ipc_recv(1, NO_PAGE).unwrap();
        state.ipc_try_send(0, receiver_id, 42, NO_PAGE, 0).unwrap();

        let env = &state.envs()[receiver];
        assert!(!env.is_receiving());
        assert_eq!(env.status(), EnvStatus::Runnable);
        assert_eq!(
            env.ipc_fields(),
            IpcFields {
                from: u32::from(state.envs()[sender].id().unwrap()),
                value: 42,
                perm: 0,
            }
        );
    }

    #[test]
    fn test_send_to_non_receiver() {
        let Pair {
            mut state,
            receiver,
            receiver_id,
            ..
        } = pair();
        let before = state.envs()[receiver].ipc_fields();
        assert_eq!(
            state.ipc_try_send(0, receiver_id, 1, NO_PAGE, 0),
            Err(KernelError::NotReceiving)
        );
        assert_eq!(state.envs()[receiver].ipc_fields(), before);
        assert_eq!(state.envs()[receiver].status(), EnvStatus::Running);
    }

    #[test]
    fn test_send_to_bad_target() {
        let Pair { mut state, .. } = pair();
        assert_eq!(
            state.ipc_try_send(0, 0x1234_5067, 1, NO_PAGE, 0),
            Err(KernelError::BadTarget)
        );
    }

    #[test]
    fn test_send_needs_no_permission() {
        // IPC targets need not be descendants of the sender
        let Pair {
            mut state,
            receiver_id,
            ..
        } = pair();
        state.ipc_recv(1, NO_PAGE).unwrap();
        assert_eq!(state.ipc_try_send(0, receiver_id, 1, NO_PAGE, 0), Ok(()));
    }

    #[test]
    fn test_send_page() {
        let Pair {
            mut state,
            sender,
            receiver,
            receiver_id,
        } = pair();
        let page = map_src(&mut state, sender, PtePerm::U | PtePerm::W | PtePerm::P);
        state.ipc_recv(1, DST).unwrap();
        let perm = (PtePerm::U | PtePerm::P).bits();
        state.ipc_try_send(0, receiver_id, 7, SRC, perm).unwrap();

        let pgdir = state.envs()[receiver].pgdir();
        assert_eq!(
            state.memory().lookup(pgdir, DST),
            Some((page, PtePerm::U | PtePerm::P))
        );
        assert_eq!(state.envs()[receiver].ipc_fields().perm, perm);
        assert_eq!(state.memory().refs[&page], 2);
    }

    #[test]
    fn test_send_page_to_receiver_wanting_none() {
        let Pair {
            mut state,
            sender,
            receiver,
            receiver_id,
        } = pair();
        map_src(&mut state, sender, PtePerm::U | PtePerm::P);
        state.ipc_recv(1, NO_PAGE).unwrap();
        state
            .ipc_try_send(0, receiver_id, 9, SRC, (PtePerm::U | PtePerm::P).bits())
            .unwrap();

        let env = &state.envs()[receiver];
        assert_eq!(env.ipc_fields().value, 9);
        assert_eq!(env.ipc_fields().perm, 0);
        assert_eq!(state.memory().page_count(env.pgdir()), 1); // stack only
    }

    #[test]
    fn test_receiver_wants_page_sender_offers_none() {
        let Pair {
            mut state,
            receiver,
            receiver_id,
            ..
        } = pair();
        state.ipc_recv(1, DST).unwrap();
        state.ipc_try_send(0, receiver_id, 3, NO_PAGE, 0).unwrap();
        let env = &state.envs()[receiver];
        assert_eq!(env.ipc_fields().value, 3);
        assert_eq!(env.ipc_fields().perm, 0);
        assert_eq!(state.memory().lookup(env.pgdir(), DST), None);
    }

    #[test]
    fn test_write_over_read_only_source() {
        let Pair {
            mut state,
            sender,
            receiver,
            receiver_id,
        } = pair();
        map_src(&mut state, sender, PtePerm::U | PtePerm::P);
        state.ipc_recv(1, DST).unwrap();
        let perm = (PtePerm::U | PtePerm::W | PtePerm::P).bits();
        assert_eq!(
            state.ipc_try_send(0, receiver_id, 5, SRC, perm),
            Err(KernelError::InvalidArgument)
        );
        let env = &state.envs()[receiver];
        assert!(env.is_receiving());
        assert_eq!(env.status(), EnvStatus::NotRunnable);
        assert_eq!(env.ipc_fields(), IpcFields::default());
    }

    #[test]
    fn test_send_page_errors() {
        let Pair {
            mut state,
            sender,
            receiver,
            receiver_id,
        } = pair();
        state.ipc_recv(1, DST).unwrap();
        let perm = (PtePerm::U | PtePerm::P).bits();
        // unaligned
        assert_eq!(
            state.ipc_try_send(0, receiver_id, 5, SRC + 8, perm),
            Err(KernelError::InvalidArgument)
        );
        // not mapped
        assert_eq!(
            state.ipc_try_send(0, receiver_id, 5, SRC, perm),
            Err(KernelError::InvalidArgument)
        );
        map_src(&mut state, sender, PtePerm::U | PtePerm::P);
        // illegal permission bits
        assert_eq!(
            state.ipc_try_send(0, receiver_id, 5, SRC, perm | PtePerm::PCD.bits()),
            Err(KernelError::InvalidArgument)
        );
        // mapping failure aborts the send
        state.memory_mut().fail_insert = true;
        assert_eq!(
            state.ipc_try_send(0, receiver_id, 5, SRC, perm),
            Err(KernelError::Memory(MemoryError::OutOfMemory))
        );
        assert!(state.envs()[receiver].is_receiving());
        assert_eq!(state.envs()[receiver].ipc_fields(), IpcFields::default());
    }
}
