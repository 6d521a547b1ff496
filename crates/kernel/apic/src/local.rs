//! The local APIC manages internal (non-I/O) interrupts.
//!
//! See Chapter 8 & Appendix C of Intel processor manual volume 3.

use sjos_kernel_params::{
    IRQ_ERROR, IRQ_OFFSET, IRQ_SPURIOUS, IRQ_TIMER, LAPIC_TIMER_INITIAL_COUNT,
};

use crate::{Platform, Registers};

// Local APIC registers, byte offsets
pub const ID: usize = 0x020; // ID
pub const VER: usize = 0x030; // Version
pub const TPR: usize = 0x080; // Task Priority
pub const EOI: usize = 0x0b0; // EOI
pub const SVR: usize = 0x0f0; // Spurious Interrupt Vector
pub const ESR: usize = 0x280; // Error Status
pub const ICRLO: usize = 0x300; // Interrupt Command
pub const ICRHI: usize = 0x310; // Interrupt Command [63:32]
pub const TIMER: usize = 0x320; // Local Vector Table 0 (TIMER)
pub const PCINT: usize = 0x340; // Performance Counter LVT
pub const LINT0: usize = 0x350; // Local Vector Table 1 (LINT0)
pub const LINT1: usize = 0x360; // Local Vector Table 2 (LINT1)
pub const ERROR: usize = 0x370; // Local Vector Table 3 (ERROR)
pub const TICR: usize = 0x380; // Timer Initial Count
pub const TCCR: usize = 0x390; // Timer Current Count
pub const TDCR: usize = 0x3e0; // Timer Divide Configuration

// SVR bits
pub const ENABLE: u32 = 0x0000_0100; // Unit Enable

// ICR bits
pub const INIT: u32 = 0x0000_0500; // INIT/RESET
pub const STARTUP: u32 = 0x0000_0600; // Startup IPI
pub const DELIVS: u32 = 0x0000_1000; // Delivery status
pub const ASSERT: u32 = 0x0000_4000; // Assert interrupt (vs deassert)
pub const LEVEL: u32 = 0x0000_8000; // Level triggered
pub const BCAST: u32 = 0x0008_0000; // Send to all APICs, including self.

// LVT bits
pub const X1: u32 = 0x0000_000b; // divide counts by 1
pub const PERIODIC: u32 = 0x0002_0000; // Periodic
pub const MASKED: u32 = 0x0001_0000; // Interrupt masked

/// CMOS RTC ports, used to set the warm reset shutdown code.
const IO_RTC: u16 = 0x70;

/// Physical address of the warm reset vector (40:67).
const WARM_RESET_VECTOR: usize = (0x40 << 4) | 0x67;

#[derive(Debug)]
pub struct LocalApic<R> {
    regs: R,
}

impl<R> LocalApic<R>
where
    R: Registers,
{
    pub const fn new(regs: R) -> Self {
        Self { regs }
    }

    fn write(&self, reg: usize, value: u32) {
        self.regs.write(reg, value);
        // wait for write to finish, by reading
        self.regs.read(ID);
    }

    /// Initializes the local APIC of the calling CPU.
    ///
    /// The bootstrap CPU keeps LINT0 unmasked so that the 8259A PIC can still
    /// reach it through virtual wire mode.
    pub fn init(&self, is_bsp: bool) {
        // Enable local APIC; set spurious interrupt vector.
        self.write(SVR, ENABLE | (IRQ_OFFSET + IRQ_SPURIOUS));

        // The timer repeatedly counts down at bus frequency
        // from TICR and then issues an interrupt.
        // Mode and count only take effect together, so the mode goes last.
        self.write(TDCR, X1);
        self.write(TICR, LAPIC_TIMER_INITIAL_COUNT);
        self.write(TIMER, PERIODIC | (IRQ_OFFSET + IRQ_TIMER));

        if !is_bsp {
            self.write(LINT0, MASKED);
        }
        self.write(LINT1, MASKED);

        // Disable performance counter overflow interrupts
        // on machines that provide that interrupt entry.
        if ((self.regs.read(VER) >> 16) & 0xff) >= 4 {
            self.write(PCINT, MASKED);
        }

        // Map error interrupt to IRQ_ERROR.
        self.write(ERROR, IRQ_OFFSET + IRQ_ERROR);

        // Clear error status register (requires back-to-back writes).
        self.write(ESR, 0);
        self.write(ESR, 0);

        // Ack any outstanding interrupts.
        self.write(EOI, 0);

        // Send an Init Level De-Assert to synchronise arbitration ID's.
        self.write(ICRHI, 0);
        self.write(ICRLO, BCAST | INIT | LEVEL);
        while self.regs.read(ICRLO) & DELIVS != 0 {
            core::hint::spin_loop();
        }

        // Enable interrupts on the APIC (but not on the processor).
        self.write(TPR, 0);
    }

    /// Returns the APIC id of the calling CPU.
    pub fn id(&self) -> u8 {
        #[expect(clippy::cast_possible_truncation)]
        let id = (self.regs.read(ID) >> 24) as u8;
        id
    }

    /// Acknowledges the interrupt being serviced.
    pub fn eoi(&self) {
        self.write(EOI, 0);
    }

    /// Starts the application processor `apic_id` running the real-mode
    /// trampoline at physical address `addr`.
    ///
    /// This is the universal startup algorithm of the MP specification,
    /// Appendix B. The warm reset vector is global, so only one AP may be
    /// started at a time.
    pub fn start_ap<P>(&self, platform: &P, apic_id: u8, addr: u32)
    where
        P: Platform + ?Sized,
    {
        assert_eq!(addr & 0xfff, 0, "AP entry must be page aligned");
        assert!(addr < 0x10_0000, "AP entry must be below 1MiB");

        // "The BSP must initialize CMOS shutdown code to 0AH
        // and the warm reset vector (DWORD based at 40:67) to point at
        // the AP startup code prior to the [universal startup algorithm]."
        platform.outb(IO_RTC, 0x0f); // offset 0xF is shutdown code
        platform.outb(IO_RTC + 1, 0x0a);
        #[expect(clippy::cast_possible_truncation)]
        let segment = (addr >> 4) as u16;
        platform.write_phys_u16(WARM_RESET_VECTOR, 0);
        platform.write_phys_u16(WARM_RESET_VECTOR + 2, segment);

        // "Universal startup algorithm."
        // Send INIT (level-triggered) interrupt to reset other CPU.
        let dest = u32::from(apic_id) << 24;
        self.write(ICRHI, dest);
        self.write(ICRLO, INIT | LEVEL | ASSERT);
        platform.micro_delay(200);
        self.write(ICRLO, INIT | LEVEL);
        platform.micro_delay(100); // should be 10ms, but too slow in Bochs!

        // Send startup IPI (twice!) to enter bootstrap code.
        // Regular hardware is supposed to only accept a STARTUP
        // when it is in the halted state due to an INIT. So the second
        // should be ignored, but it is part of the official Intel algorithm.
        for _ in 0..2 {
            self.write(ICRHI, dest);
            self.write(ICRLO, STARTUP | (addr >> 12));
            platform.micro_delay(200);
        }
    }
}
