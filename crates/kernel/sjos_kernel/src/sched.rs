//! Round-robin scheduling.
//!
//! Each CPU only ever picks environments from its own run queue. Under
//! [`SchedPolicy::Global`] there is a single run queue spanning the whole
//! table, which is only valid on a uniprocessor.

use sjos_syscall::EnvStatus;
use strum::Display;

use crate::{
    env::{KernelState, TrapFrame},
    memory::{Memory, PageDir},
};

/// How the environment table is divided among CPUs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "snake_case")]
pub enum SchedPolicy {
    /// One run queue over the whole table.
    Global,
    /// Equal fixed slices, one per CPU.
    PerCpu,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("no runnable environments on CPU {cpu}")]
pub struct NothingRunnable {
    pub cpu: usize,
}

/// An environment chosen to run, with the context to switch to.
#[derive(Debug, Clone, Copy)]
pub struct Dispatch {
    pub slot: usize,
    pub tf: TrapFrame,
    pub pgdir: PageDir,
}

impl<M> KernelState<M>
where
    M: Memory,
{
    /// Chooses the next environment to run on `cpu`.
    ///
    /// Searches the run queue circularly starting just after the
    /// environment this CPU was last running, skipping the idle slot, and
    /// picks the first RUNNABLE one. If there is none, the current
    /// environment keeps running if it still can, and failing that the
    /// idle environment runs.
    pub fn select_next(&self, cpu: usize) -> Result<usize, NothingRunnable> {
        let rq = self.runqueue(cpu);
        if rq.is_empty() {
            return Err(NothingRunnable { cpu });
        }
        let idle = rq.idle();
        let cur = rq.current().unwrap_or(idle);

        let mut slot = cur;
        for _ in 0..rq.len() {
            slot = rq.next_slot(slot);
            if slot != idle && self.envs[slot].status == EnvStatus::Runnable {
                return Ok(slot);
            }
        }

        for slot in [cur, idle] {
            if matches!(
                self.envs[slot].status,
                EnvStatus::Runnable | EnvStatus::Running
            ) {
                return Ok(slot);
            }
        }
        Err(NothingRunnable { cpu })
    }

    /// Makes the environment in `slot` the one running on `cpu`.
    pub fn dispatch(&mut self, cpu: usize, slot: usize) -> Dispatch {
        let rq = self.runqueue_mut(cpu);
        let prev = rq.set_current(slot);
        debug_assert!(rq.range().contains(&slot));

        if let Some(prev) = prev {
            if prev != slot && self.envs[prev].status == EnvStatus::Running {
                self.envs[prev].status = EnvStatus::Runnable;
            }
        }

        let env = &mut self.envs[slot];
        env.status = EnvStatus::Running;
        Dispatch {
            slot,
            tf: env.tf,
            pgdir: env.pgdir,
        }
    }

    /// Picks and dispatches the next environment of `cpu`.
    pub fn schedule_next(&mut self, cpu: usize) -> Result<Dispatch, NothingRunnable> {
        let slot = self.select_next(cpu)?;
        Ok(self.dispatch(cpu, slot))
    }

    /// Re-dispatches the environment running on `cpu`, if it may continue.
    pub fn resume_current(&mut self, cpu: usize) -> Option<Dispatch> {
        let slot = self.current(cpu)?;
        (self.envs[slot].status == EnvStatus::Running).then(|| self.dispatch(cpu, slot))
    }
}

#[cfg(test)]
mod tests {
    use sjos_kernel_params::NENV_PER_CPU;

    use super::*;
    use crate::{
        env::tests::{spawn, state},
        memory::mock::MockMemory,
    };

    fn running_slots(state: &KernelState<MockMemory>, cpu: usize) -> Vec<usize> {
        state
            .runqueue(cpu)
            .range()
            .filter(|&slot| state.envs()[slot].status() == EnvStatus::Running)
            .collect()
    }

    #[test]
    fn test_round_robin() {
        let mut state = state(SchedPolicy::PerCpu, 2);
        let idle = spawn(&mut state, 0);
        let a = spawn(&mut state, 0);
        let b = spawn(&mut state, 0);
        let c = spawn(&mut state, 0);

        let order = (0..6)
            .map(|_| state.schedule_next(0).unwrap().slot)
            .collect::<Vec<_>>();
        assert_eq!(order, [a, b, c, a, b, c]);
        assert!(!order.contains(&idle));
        assert_eq!(running_slots(&state, 0), [c]);
        assert_eq!(state.current(0), Some(c));
    }

    #[test]
    fn test_scan_wraps_at_slice_end() {
        let mut state = state(SchedPolicy::PerCpu, 2);
        let base = NENV_PER_CPU;
        for _ in 0..NENV_PER_CPU {
            spawn(&mut state, 1);
        }
        let last = 2 * NENV_PER_CPU - 1;
        state.dispatch(1, last);
        // wraps past the idle slot to the first ordinary slot
        assert_eq!(state.select_next(1), Ok(base + 1));
    }

    #[test]
    fn test_idle_never_chosen_while_others_runnable() {
        let mut state = state(SchedPolicy::PerCpu, 2);
        let idle = spawn(&mut state, 1);
        let worker = spawn(&mut state, 1);
        state.dispatch(1, idle);
        assert_eq!(state.select_next(1), Ok(worker));
        state.dispatch(1, worker);
        // the idle env is RUNNABLE again, but the worker keeps the CPU
        assert_eq!(state.envs()[idle].status(), EnvStatus::Runnable);
        assert_eq!(state.select_next(1), Ok(worker));
    }

    #[test]
    fn test_current_redispatched_when_alone() {
        let mut state = state(SchedPolicy::Global, 1);
        spawn(&mut state, 0);
        let only = spawn(&mut state, 0);
        state.dispatch(0, only);
        assert_eq!(state.select_next(0), Ok(only));
        let dispatch = state.schedule_next(0).unwrap();
        assert_eq!(dispatch.slot, only);
        assert_eq!(running_slots(&state, 0), [only]);
    }

    #[test]
    fn test_only_idle_runnable() {
        let mut state = state(SchedPolicy::PerCpu, 2);
        let idle = spawn(&mut state, 1);
        let blocked = spawn(&mut state, 1);
        state.dispatch(1, blocked);
        state.envs[blocked].status = EnvStatus::NotRunnable;
        assert_eq!(state.select_next(1), Ok(idle));
        let dispatch = state.schedule_next(1).unwrap();
        assert_eq!(dispatch.slot, idle);
        assert_eq!(state.envs()[blocked].status(), EnvStatus::NotRunnable);
        assert_eq!(running_slots(&state, 1), [idle]);
    }

    #[test]
    fn test_nothing_runnable() {
        let mut state = state(SchedPolicy::PerCpu, 2);
        assert_eq!(state.select_next(1), Err(NothingRunnable { cpu: 1 }));

        let idle = spawn(&mut state, 1);
        state.envs[idle].status = EnvStatus::NotRunnable;
        assert_eq!(state.select_next(1), Err(NothingRunnable { cpu: 1 }));

        // CPUs beyond ncpu have no run queue at all
        assert_eq!(state.select_next(5), Err(NothingRunnable { cpu: 5 }));
    }

    #[test]
    fn test_dying_is_never_selected() {
        let mut state = state(SchedPolicy::PerCpu, 2);
        spawn(&mut state, 1);
        let worker = spawn(&mut state, 1);
        state.dispatch(1, worker);
        state.env_destroy(0, worker);
        assert_eq!(state.envs()[worker].status(), EnvStatus::Dying);
        assert_eq!(state.select_next(1), Ok(NENV_PER_CPU));
    }

    #[test]
    fn test_slices_are_independent() {
        let mut state = state(SchedPolicy::PerCpu, 2);
        let idle0 = spawn(&mut state, 0);
        spawn(&mut state, 1);
        let worker1 = spawn(&mut state, 1);
        assert_eq!(state.schedule_next(0).unwrap().slot, idle0);
        assert_eq!(state.schedule_next(1).unwrap().slot, worker1);
        assert_eq!(running_slots(&state, 0), [idle0]);
        assert_eq!(running_slots(&state, 1), [worker1]);
        assert_eq!(state.current(0), Some(idle0));
        assert_eq!(state.current(1), Some(worker1));
    }

    #[test]
    fn test_resume_current() {
        let mut state = state(SchedPolicy::Global, 1);
        assert!(state.resume_current(0).is_none());
        let a = spawn(&mut state, 0);
        state.dispatch(0, a);
        assert_eq!(state.resume_current(0).map(|d| d.slot), Some(a));
        state.envs[a].status = EnvStatus::NotRunnable;
        assert!(state.resume_current(0).is_none());
    }

    #[test]
    fn test_policy_names() {
        assert_eq!(SchedPolicy::PerCpu.to_string(), "per_cpu");
        assert_eq!(SchedPolicy::Global.to_string(), "global");
    }
}
