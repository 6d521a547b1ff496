//! Environments and the table holding them.
//!
//! Every slot of the table belongs to the run queue of exactly one CPU.
//! An environment is allocated from the free list of its CPU's run queue
//! and stays on that CPU until it is freed.

use sjos_kernel_params::{NCPU, NENV};
use sjos_syscall::{EnvStatus, IpcFields, PtePerm};
use sjos_types::env::EnvId;

pub use self::{
    run_queue::RunQueue,
    trap_frame::{FL_IF, PushRegs, TrapFrame},
};
use crate::{
    error::KernelError,
    memory::{Memory, PageDir},
    sched::SchedPolicy,
};

mod run_queue;
mod trap_frame;

#[derive(Debug, Clone, Copy)]
pub(crate) struct IpcState {
    /// Env is blocked receiving.
    pub(crate) recving: bool,
    /// VA at which to map received page.
    pub(crate) dstva: usize,
    /// Data value sent to us.
    pub(crate) value: u32,
    /// envid of the sender.
    pub(crate) from: Option<EnvId>,
    /// Perm of page mapping received.
    pub(crate) perm: PtePerm,
}

impl IpcState {
    const EMPTY: Self = Self {
        recving: false,
        dstva: 0,
        value: 0,
        from: None,
        perm: PtePerm::empty(),
    };
}

/// An environment slot.
#[derive(Debug, Clone, Copy)]
pub struct Env {
    /// Identifier of the current or most recent occupant.
    pub(crate) id: Option<EnvId>,
    pub(crate) parent: Option<EnvId>,
    pub(crate) status: EnvStatus,
    /// CPU whose run queue owns this slot.
    pub(crate) cpu: usize,
    /// Saved registers.
    pub(crate) tf: TrapFrame,
    pub(crate) pgdir: PageDir,
    /// Page fault upcall entry point.
    pub(crate) pgfault_upcall: usize,
    pub(crate) ipc: IpcState,
    free_next: Option<usize>,
}

impl Env {
    const FREE: Self = Self {
        id: None,
        parent: None,
        status: EnvStatus::Free,
        cpu: 0,
        tf: TrapFrame::EMPTY,
        pgdir: PageDir::NULL,
        pgfault_upcall: 0,
        ipc: IpcState::EMPTY,
        free_next: None,
    };

    /// Returns the identifier of the environment occupying this slot.
    pub fn id(&self) -> Option<EnvId> {
        (self.status != EnvStatus::Free).then_some(self.id).flatten()
    }

    pub fn parent(&self) -> Option<EnvId> {
        self.parent
    }

    pub fn status(&self) -> EnvStatus {
        self.status
    }

    pub fn cpu(&self) -> usize {
        self.cpu
    }

    pub fn trap_frame(&self) -> &TrapFrame {
        &self.tf
    }

    pub fn pgdir(&self) -> PageDir {
        self.pgdir
    }

    pub fn pgfault_upcall(&self) -> usize {
        self.pgfault_upcall
    }

    pub fn is_receiving(&self) -> bool {
        self.ipc.recving
    }

    /// The most recently delivered message, as user space sees it.
    pub fn ipc_fields(&self) -> IpcFields {
        IpcFields {
            from: self.ipc.from.map_or(0, u32::from),
            value: self.ipc.value,
            perm: self.ipc.perm.bits(),
        }
    }
}

/// How [`KernelState::env_destroy()`] disposed of an environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Destroyed {
    /// The slot was freed.
    Freed,
    /// The environment was running on the calling CPU and has been freed;
    /// the caller must schedule.
    FreedCurrent,
    /// The environment is running on another CPU and was marked DYING.
    Deferred,
}

/// Everything protected by the big kernel lock.
pub struct KernelState<M> {
    pub(crate) policy: SchedPolicy,
    pub(crate) envs: [Env; NENV],
    pub(crate) runqueues: [RunQueue; NCPU],
    pub(crate) memory: M,
}

impl<M> KernelState<M>
where
    M: Memory,
{
    pub const fn new(memory: M) -> Self {
        Self {
            policy: SchedPolicy::Global,
            envs: [Env::FREE; NENV],
            runqueues: [RunQueue::EMPTY; NCPU],
            memory,
        }
    }

    /// Partitions the table among `ncpu` CPUs and builds the free lists.
    ///
    /// # Panics
    ///
    /// Panics if the global policy is requested with more than one CPU.
    pub fn init(&mut self, policy: SchedPolicy, ncpu: usize) {
        assert!((1..=NCPU).contains(&ncpu));
        assert!(
            policy == SchedPolicy::PerCpu || ncpu == 1,
            "global scheduling needs a uniprocessor"
        );
        self.policy = policy;
        for (cpu, rq) in self.runqueues.iter_mut().enumerate() {
            *rq = if cpu < ncpu {
                RunQueue::for_cpu(policy, cpu)
            } else {
                RunQueue::EMPTY
            };
            // The free list is in ascending order, so the first allocation
            // from a run queue takes its idle slot.
            let mut next = None;
            for i in rq.range().rev() {
                self.envs[i] = Env::FREE;
                self.envs[i].cpu = cpu;
                self.envs[i].free_next = next;
                next = Some(i);
            }
            rq.free_head = next;
        }
        log::info!("sched: {policy} policy over {ncpu} cpu(s)");
    }

    pub fn policy(&self) -> SchedPolicy {
        self.policy
    }

    pub fn envs(&self) -> &[Env] {
        &self.envs
    }

    pub fn memory(&self) -> &M {
        &self.memory
    }

    pub fn memory_mut(&mut self) -> &mut M {
        &mut self.memory
    }

    /// The run queue scheduling CPU `cpu`.
    pub fn runqueue(&self, cpu: usize) -> &RunQueue {
        &self.runqueues[self.rq_index(cpu)]
    }

    pub(crate) fn rq_index(&self, cpu: usize) -> usize {
        match self.policy {
            SchedPolicy::Global => 0,
            SchedPolicy::PerCpu => cpu,
        }
    }

    pub(crate) fn runqueue_mut(&mut self, cpu: usize) -> &mut RunQueue {
        let rq = self.rq_index(cpu);
        &mut self.runqueues[rq]
    }

    /// Slot of the environment running on `cpu`.
    pub fn current(&self, cpu: usize) -> Option<usize> {
        self.runqueue(cpu).current
    }

    /// Identifier of the environment running on `cpu`.
    pub fn current_id(&self, cpu: usize) -> Option<EnvId> {
        self.current(cpu).and_then(|slot| self.envs[slot].id())
    }

    /// Allocates an environment from the run queue of `cpu`.
    ///
    /// The new environment is NOT_RUNNABLE, with a fresh address space and
    /// a user-mode trap frame. Returns its slot.
    pub fn env_alloc(&mut self, parent: Option<EnvId>, cpu: usize) -> Result<usize, KernelError> {
        let slot = self
            .runqueue(cpu)
            .free_head
            .ok_or(KernelError::NoFreeSlot)?;
        let pgdir = self.memory.create_address_space()?;

        let env = &mut self.envs[slot];
        let id = EnvId::next_generation(env.id, slot);
        let next = env.free_next;
        *env = Env {
            id: Some(id),
            parent,
            status: EnvStatus::NotRunnable,
            cpu: env.cpu,
                tf: TrapFrame::user(),
            pgdir,
            pgfault_upcall: 0,
            ipc: IpcState::EMPTY,
            free_next: None,
        };
        self.runqueue_mut(cpu).free_head = next;

        log::debug!(
            "[{:08x}] new env {id} on cpu {cpu}",
            parent.map_or(0, u32::from)
        );
        Ok(slot)
    }

    /// Creates a RUNNABLE environment on `cpu` running `image`.
    pub fn env_create_on(&mut self, image: &[u8], cpu: usize) -> Result<EnvId, KernelError> {
        let slot = self.env_alloc(None, cpu)?;
        let pgdir = self.envs[slot].pgdir;
        let entry = match self.memory.load_image(pgdir, image) {
            Ok(entry) => entry,
            Err(e) => {
                self.env_free(slot);
                return Err(e.into());
            }
        };
        let env = &mut self.envs[slot];
        #[expect(clippy::cast_possible_truncation)]
        let eip = entry as u32;
        env.tf.eip = eip;
        env.status = EnvStatus::Runnable;
        env.id.ok_or(KernelError::BadTarget)
    }

    /// Frees an environment and all memory it uses.
    pub fn env_free(&mut self, slot: usize) {
        let env = &mut self.envs[slot];
        let pgdir = env.pgdir;
        let cpu = env.cpu;
        log::debug!("free env {:08x}", env.id.map_or(0, u32::from));
        env.pgdir = PageDir::NULL;
        env.status = EnvStatus::Free;
        env.ipc = IpcState::EMPTY;
        env.parent = None;
        self.memory.destroy_address_space(pgdir);

        let rq = self.rq_index(cpu);
        let rq = &mut self.runqueues[rq];
        if rq.current == Some(slot) {
            rq.current = None;
        }
        self.envs[slot].free_next = rq.free_head;
        rq.free_head = Some(slot);
    }

    /// Destroys the environment in `slot` on behalf of CPU `cpu`.
    ///
    /// An environment running on another CPU can't be freed under that
    /// CPU's feet; it is marked DYING and reaped by its own CPU.
    pub fn env_destroy(&mut self, cpu: usize, slot: usize) -> Destroyed {
        let env = &mut self.envs[slot];
        if env.status == EnvStatus::Running && env.cpu != cpu {
            env.status = EnvStatus::Dying;
            return Destroyed::Deferred;
        }

        let current = self.current(cpu) == Some(slot);
        self.env_free(slot);
        if current {
            Destroyed::FreedCurrent
        } else {
            Destroyed::Freed
        }
    }

    /// Frees the environment running on `cpu` if it was marked DYING.
    ///
    /// Returns `true` if it was freed.
    pub fn reap_current(&mut self, cpu: usize) -> bool {
        match self.current(cpu) {
            Some(slot) if self.envs[slot].status == EnvStatus::Dying => {
                self.env_free(slot);
                true
            }
            _ => false,
        }
    }

    /// Resolves an environment identifier on behalf of the environment
    /// running on `cpu`.
    ///
    /// `raw` 0 names the caller itself. With `checkperm` set, the target must
    /// be the caller or one of its descendants.
    pub fn envid2env(&self, cpu: usize, raw: u32, checkperm: bool) -> Result<usize, KernelError> {
        let Some(id) = EnvId::from_raw(raw) else {
            return self.current(cpu).ok_or(KernelError::BadTarget);
        };

        // Look up the Env structure via the index part of the envid,
        // then check the env_id field in that struct Env
        // to ensure that the envid is not stale
        // (i.e., does not refer to a _previous_ environment
        // that used the same slot in the envs[] array).
        let slot = id.index();
        let env = &self.envs[slot];
        if matches!(env.status, EnvStatus::Free | EnvStatus::Dying) || env.id != Some(id) {
            return Err(KernelError::BadTarget);
        }

        if checkperm && !self.is_self_or_descendant(cpu, id) {
            return Err(KernelError::BadTarget);
        }
        Ok(slot)
    }

    fn is_self_or_descendant(&self, cpu: usize, id: EnvId) -> bool {
        let Some(caller) = self.current_id(cpu) else {
            return false;
        };
        let mut cursor = Some(id);
        // Parent links may form a cycle through reused slots; the walk is
        // bounded by the table size.
        for _ in 0..NENV {
            let Some(cur) = cursor else {
                return false;
            };
            if cur == caller {
                return true;
            }
            let env = &self.envs[cur.index()];
            if env.id() != Some(cur) {
                return false;
            }
            cursor = env.parent;
        }
        false
    }
}
