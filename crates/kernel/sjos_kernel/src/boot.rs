//! Bringing up the processors.
//!
//! The bootstrap processor discovers the topology, programs the interrupt
//! controllers and then starts the application processors one at a time.
//! All APs share the BIOS warm reset vector and [`ApBootArgs`], so the next
//! AP is only started after the previous one reports itself booted.

use core::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

use apic::{IoApic, LocalApic, Platform, Registers};
use log::LevelFilter;
use mp_config::{PhysMemory, Topology};
use sjos_kernel_params::MPENTRY_PADDR;

use crate::{
    Kernel,
    arch::Arch,
    console,
    cpu::{Cpu, CpuSet},
    memory::Memory,
    sched::SchedPolicy,
};

/// Machine-specific services used during boot.
pub trait Board: Platform {
    type Regs: Registers;
    type Phys: PhysMemory + ?Sized;

    /// Writes `s` to the console device.
    fn put_str(s: &str);

    /// Physical memory holding the BIOS data area and the MP tables.
    fn phys(&self) -> &Self::Phys;

    /// Processors and interrupt controllers of the machine.
    fn topology(&self) -> Topology {
        mp_config::discover(self.phys())
    }

    /// Maps the register page of an APIC at physical address `paddr`.
    fn map_mmio(&self, paddr: u32) -> Option<Self::Regs>;

    /// Copies the real-mode AP entry code to [`MPENTRY_PADDR`].
    fn install_ap_entry(&self);

    /// Top of the kernel stack of CPU `cpu`.
    fn kstack_top(&self, cpu: usize) -> usize;
}

/// Values the AP entry code reads before it can call into Rust.
#[derive(Debug)]
pub struct ApBootArgs {
    stack_top: AtomicUsize,
    cpu: AtomicUsize,
    lapic_addr: AtomicU32,
}

impl Default for ApBootArgs {
    fn default() -> Self {
        Self::new()
    }
}

impl ApBootArgs {
    pub const fn new() -> Self {
        Self {
            stack_top: AtomicUsize::new(0),
            cpu: AtomicUsize::new(0),
            lapic_addr: AtomicU32::new(0),
        }
    }

    fn publish(&self, cpu: usize, stack_top: usize) {
        self.cpu.store(cpu, Ordering::Relaxed);
        self.stack_top.store(stack_top, Ordering::Release);
    }

    /// Kernel stack top of the AP being started.
    pub fn stack_top(&self) -> usize {
        self.stack_top.load(Ordering::Acquire)
    }

    /// Index of the AP being started.
    pub fn cpu(&self) -> usize {
        self.cpu.load(Ordering::Acquire)
    }

    pub fn lapic_addr(&self) -> u32 {
        self.lapic_addr.load(Ordering::Acquire)
    }
}

/// Chooses the scheduling policy once the topology is known.
pub fn select_policy(topology: &Topology) -> SchedPolicy {
    if topology.is_mp {
        SchedPolicy::PerCpu
    } else {
        SchedPolicy::Global
    }
}

/// Switches from PIC mode to symmetric I/O mode.
///
/// The IMCR connects the legacy PIC directly to the BSP in PIC mode; this
/// routes interrupts through the APICs instead.
pub fn switch_imcr<P>(platform: &P)
where
    P: Platform + ?Sized,
{
    log::info!("SMP: Setting IMCR to switch from PIC mode to symmetric I/O mode");
    platform.outb(0x22, 0x70); // Select IMCR
    let imcr = platform.inb(0x23);
    platform.outb(0x23, imcr | 0x01); // Mask external interrupts.
}

/// Starts every CPU other than `me`, strictly one at a time.
pub fn bootstrap_others<A, R, P, F>(
    cpus: &CpuSet,
    lapic: &LocalApic<R>,
    platform: &P,
    me: &Cpu,
    args: &ApBootArgs,
    kstack_top: F,
) where
    A: Arch,
    R: Registers,
    P: Platform + ?Sized,
    F: Fn(usize) -> usize,
{
    #[expect(clippy::cast_possible_truncation)]
    let entry = MPENTRY_PADDR as u32;

    for cpu in cpus.iter() {
        if cpu.index() == me.index() {
            // We've started already.
            continue;
        }

        // Tell the entry code which CPU it is and what stack to use.
        args.publish(cpu.index(), kstack_top(cpu.index()));
        lapic.start_ap(platform, cpu.apic_id(), entry);

        // Wait for the CPU to finish mp_main().
        while !cpu.is_booted() {
            A::spin_hint();
        }
        log::info!("SMP: CPU {} started", cpu.index());
    }
}

impl<A, M> Kernel<A, M>
where
    A: Arch,
    M: Memory,
{
    /// Boot sequence of the bootstrap processor.
    ///
    /// Sets up the console and the logger, then creates an idle
    /// environment for every CPU and the environments in `images`, each on
    /// the CPU given with it, before entering the scheduler.
    ///
    /// Without a usable local APIC the APs can't be started, so the machine
    /// is run as a uniprocessor.
    ///
    /// # Panics
    ///
    /// Panics if an environment can't be created.
    pub fn bsp_main<B>(&self, board: &B, args: &ApBootArgs, idle: &[u8], images: &[(&[u8], usize)]) -> !
    where
        B: Board,
    {
        console::init(B::put_str);
        if let Err(e) = console::init_logger(LevelFilter::Info) {
            log::warn!("boot: {e}");
        }

        let mut topology = board.topology();
        let mut lapic = None;
        if topology.is_mp {
            match board.map_mmio(topology.lapic_addr) {
                Some(regs) => lapic = Some(LocalApic::new(regs)),
                None => {
                    // The APs can't be started without a local APIC.
                    log::warn!(
                        "SMP: no local APIC at {:#x}, falling back to uniprocessor",
                        topology.lapic_addr
                    );
                    topology = Topology::uniprocessor();
                }
            }
        }
        self.cpus.configure(&topology);
        let bsp = self.cpus.bsp();

        if let Some(lapic) = &lapic {
            lapic.init(true);
        }
        let ioapic = topology
            .is_mp
            .then(|| board.map_mmio(topology.ioapic_addr))
            .flatten()
            .map(IoApic::new);
        if let Some(ioapic) = &ioapic {
            ioapic.init(topology.ioapic_id);
        }
        if topology.imcr {
            switch_imcr(board);
        }

        let policy = select_policy(&topology);
        let mut guard = self.lock(bsp);
        guard.init(policy, self.cpus.ncpu());

        // APs spin on the big kernel lock until the BSP enters the
        // scheduler below.
        if let Some(lapic) = &lapic {
            board.install_ap_entry();
            args.lapic_addr.store(topology.lapic_addr, Ordering::Release);
            bootstrap_others::<A, _, _, _>(&self.cpus, lapic, board, bsp, args, |cpu| {
                board.kstack_top(cpu)
            });
        }
        bsp.set_booted();

        let idle_images = self.cpus.iter().map(|cpu| (idle, cpu.index()));
        for (image, cpu) in idle_images.chain(images.iter().copied()) {
            if let Err(e) = guard.env_create_on(image, cpu) {
                panic!("env_create on CPU {cpu}: {e}");
            }
        }

        self.schedule(guard)
    }

    /// Boot sequence of an application processor.
    ///
    /// Called by the AP entry code on the stack published in `args`.
    ///
    /// # Panics
    ///
    /// Panics if `args` names no known CPU.
    pub fn ap_main<B>(&self, board: &B, args: &ApBootArgs) -> !
    where
        B: Board,
    {
        let index = args.cpu();
        let Some(cpu) = self.cpus.get(index) else {
            panic!("ap_main: unknown CPU {index}");
        };
        if let Some(regs) = board.map_mmio(args.lapic_addr()) {
            LocalApic::new(regs).init(false);
        }
        log::info!("SMP: CPU {} starting", cpu.index());
        cpu.set_booted(); // tell boot_aps() we're up

        // Now that we have finished some basic setup, call the scheduler
        // to start running processes on this CPU.
        let guard = self.lock(cpu);
        self.schedule(guard)
    }
}
