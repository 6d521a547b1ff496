//! The I/O APIC manages hardware interrupts for an SMP system.
//!
//! <http://www.intel.com/design/chipsets/datashts/29056601.pdf>

use sjos_kernel_params::IRQ_OFFSET;

use crate::Registers;

// Memory-mapped window, byte offsets
const IOREGSEL: usize = 0x00;
const IOWIN: usize = 0x10;

// Indirect registers
const REG_ID: u32 = 0x00; // Register index: ID
const REG_VER: u32 = 0x01; // Register index: version
const REG_TABLE: u32 = 0x10; // Redirection table base

// The redirection table starts at REG_TABLE and uses
// two registers to configure each interrupt.
// The first (low) register in a pair contains configuration bits.
// The second (high) register contains a bitmask telling which
// CPUs can serve that interrupt.
pub const INT_DISABLED: u32 = 0x0001_0000; // Interrupt disabled
pub const INT_LEVEL: u32 = 0x0000_8000; // Level-triggered (vs edge-)
pub const INT_ACTIVELOW: u32 = 0x0000_2000; // Active low (vs high)
pub const INT_LOGICAL: u32 = 0x0000_0800; // Destination is CPU id (vs APIC ID)

#[derive(Debug)]
pub struct IoApic<R> {
    regs: R,
}

impl<R> IoApic<R>
where
    R: Registers,
{
    pub const fn new(regs: R) -> Self {
        Self { regs }
    }

    fn read(&self, reg: u32) -> u32 {
        self.regs.write(IOREGSEL, reg);
        self.regs.read(IOWIN)
    }

    fn write(&self, reg: u32, value: u32) {
        self.regs.write(IOREGSEL, reg);
        self.regs.write(IOWIN, value);
    }

    /// Returns the highest redirection table entry.
    pub fn max_intr(&self) -> u32 {
        (self.read(REG_VER) >> 16) & 0xff
    }

    /// Marks every interrupt edge-triggered, active high, disabled and not
    /// routed to any CPU.
    ///
    /// `expected_id` is the id the MP table gave for this controller.
    pub fn init(&self, expected_id: u8) {
        let max_intr = self.max_intr();
        let id = self.read(REG_ID) >> 24;
        if id != u32::from(expected_id) {
            log::warn!("ioapic: id {id} isn't equal to ioapicid {expected_id}; not a MP");
        }

        for irq in 0..=max_intr {
            self.write(REG_TABLE + 2 * irq, INT_DISABLED | (IRQ_OFFSET + irq));
            self.write(REG_TABLE + 2 * irq + 1, 0);
        }
    }

    /// Routes `irq` to the CPU whose local APIC id is `apic_id` and enables it.
    ///
    /// The interrupt is edge-triggered and active high.
    pub fn route_irq(&self, irq: u32, apic_id: u8) {
        self.write(REG_TABLE + 2 * irq, IRQ_OFFSET + irq);
        self.write(REG_TABLE + 2 * irq + 1, u32::from(apic_id) << 24);
    }
}
