use core::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};

use mp_config::Topology;
use sjos_kernel_params::NCPU;

use crate::interrupt::IntrNesting;

/// Per-CPU state.
#[derive(Debug)]
pub struct Cpu {
    index: usize,
    /// Local APIC id.
    apic_id: AtomicU8,
    /// Set by the CPU itself once it has finished starting up.
    booted: AtomicBool,
    pub(crate) intr: IntrNesting,
}

impl Cpu {
    const fn new(index: usize) -> Self {
        Self {
            index,
            apic_id: AtomicU8::new(0),
            booted: AtomicBool::new(false),
            intr: IntrNesting::new(),
        }
    }

    /// Index of this CPU in discovery order.
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn apic_id(&self) -> u8 {
        self.apic_id.load(Ordering::Relaxed)
    }

    pub fn is_booted(&self) -> bool {
        self.booted.load(Ordering::Acquire)
    }

    /// Announces that this CPU reached its steady state.
    pub fn set_booted(&self) {
        self.booted.store(true, Ordering::Release);
    }

    pub fn intr(&self) -> &IntrNesting {
        &self.intr
    }
}

/// The CPUs found at boot.
#[derive(Debug)]
pub struct CpuSet {
    cpus: [Cpu; NCPU],
    ncpu: AtomicUsize,
    bsp: AtomicUsize,
}

impl Default for CpuSet {
    fn default() -> Self {
        Self::new()
    }
}

impl CpuSet {
    pub const fn new() -> Self {
        let mut cpus = [const { Cpu::new(0) }; NCPU];
        let mut i = 0;
        while i < NCPU {
            cpus[i].index = i;
            i += 1;
        }
        Self {
            cpus,
            ncpu: AtomicUsize::new(1),
            bsp: AtomicUsize::new(0),
        }
    }

    /// Records the processors of `topology`.
    ///
    /// Must be called by the bootstrap CPU before any other CPU starts.
    pub fn configure(&self, topology: &Topology) {
        for (cpu, entry) in self.cpus.iter().zip(&topology.cpus) {
            cpu.apic_id.store(entry.apic_id, Ordering::Relaxed);
        }
        self.ncpu.store(topology.ncpu(), Ordering::Release);
        self.bsp.store(topology.bsp, Ordering::Release);
    }

    pub fn ncpu(&self) -> usize {
        self.ncpu.load(Ordering::Acquire)
    }

    /// The bootstrap processor.
    pub fn bsp(&self) -> &Cpu {
        &self.cpus[self.bsp.load(Ordering::Acquire)]
    }

    pub fn get(&self, index: usize) -> Option<&Cpu> {
        self.cpus[..self.ncpu()].get(index)
    }

    /// Finds the CPU whose local APIC has id `apic_id`.
    pub fn by_apic_id(&self, apic_id: u8) -> Option<&Cpu> {
        self.iter().find(|cpu| cpu.apic_id() == apic_id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Cpu> {
        self.cpus[..self.ncpu()].iter()
    }

    /// `ncpu` CPUs with APIC ids equal to their indices.
    #[cfg(test)]
    pub(crate) fn with_ncpu(ncpu: usize) -> Self {
        let cpus = Self::new();
        for (i, cpu) in cpus.cpus.iter().enumerate() {
            cpu.apic_id.store(i as u8, Ordering::Relaxed);
        }
        cpus.ncpu.store(ncpu, Ordering::Release);
        cpus
    }
}
