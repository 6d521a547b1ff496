//! On-memory layout of the MultiProcessor Specification tables.

use dataview::{Pod, PodMethods as _};

pub const FLOATING_SIGNATURE: [u8; 4] = *b"_MP_";
pub const CONFIG_SIGNATURE: [u8; 4] = *b"PCMP";

// Table entry types
pub const MP_PROC: u8 = 0x00;
pub const MP_BUS: u8 = 0x01;
pub const MP_IOAPIC: u8 = 0x02;
pub const MP_IOINTR: u8 = 0x03;
pub const MP_LINTR: u8 = 0x04;

/// Size of bus and interrupt assignment entries.
pub const SMALL_ENTRY_SIZE: usize = 8;

/// Processor entry flag: this processor is the bootstrap processor.
pub const MP_BOOT: u8 = 0x02;

/// MP floating pointer structure.
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod)]
pub struct FloatingPointer {
    /// "_MP_"
    pub signature: [u8; 4],
    /// Physical address of the configuration table.
    pub phys_addr: u32,
    /// Length in 16 byte units (1).
    pub length: u8,
    pub spec_rev: u8,
    /// All bytes must add up to 0.
    pub checksum: u8,
    /// Default configuration type, 0 if a configuration table is present.
    pub config_type: u8,
    /// Bit 7 set if the IMCR is present.
    pub imcrp: u8,
    pub reserved: [u8; 3],
}

/// Configuration table header.
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod)]
pub struct ConfigHeader {
    /// "PCMP"
    pub signature: [u8; 4],
    /// Total table length, including this header.
    pub length: u16,
    pub version: u8,
    pub checksum: u8,
    pub product: [u8; 20],
    pub oem_table: u32,
    pub oem_length: u16,
    pub entry_count: u16,
    /// Physical address of the local APIC.
    pub lapic_addr: u32,
    pub ext_length: u16,
    pub ext_checksum: u8,
    pub reserved: u8,
}

/// Processor table entry.
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod)]
pub struct ProcessorEntry {
    /// Entry type (0).
    pub ty: u8,
    pub apic_id: u8,
    pub apic_version: u8,
    pub flags: u8,
    pub signature: [u8; 4],
    pub feature: u32,
    pub reserved: [u8; 8],
}

/// I/O APIC table entry.
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod)]
pub struct IoApicEntry {
    /// Entry type (2).
    pub ty: u8,
    pub apic_id: u8,
    pub version: u8,
    pub flags: u8,
    pub addr: u32,
}

const _: () = assert!(size_of::<FloatingPointer>() == 16);
const _: () = assert!(size_of::<ConfigHeader>() == 44);
const _: () = assert!(size_of::<ProcessorEntry>() == 20);
const _: () = assert!(size_of::<IoApicEntry>() == SMALL_ENTRY_SIZE);

/// Reads a `T` from the head of `bytes`, regardless of alignment.
pub fn read<T>(bytes: &[u8]) -> Option<T>
where
    T: Pod,
{
    let src = bytes.get(..size_of::<T>())?;
    let mut value = T::zeroed();
    value.as_bytes_mut().copy_from_slice(src);
    Some(value)
}

/// Sums all bytes modulo 256.
#[must_use]
pub fn checksum(bytes: &[u8]) -> u8 {
    bytes.iter().fold(0, |sum, b| sum.wrapping_add(*b))
}
