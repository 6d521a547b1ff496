//! MultiProcessor Specification table discovery.
//!
//! Finds the MP floating pointer structure in low physical memory, validates
//! the configuration table it points to and collects the processors and the
//! I/O APIC it describes. Anything unexpected makes the whole table unusable
//! and the machine is then treated as a uniprocessor.
#![cfg_attr(not(test), no_std)]

use arrayvec::ArrayVec;
use sjos_kernel_params::NCPU;

use self::repr::{ConfigHeader, FloatingPointer, IoApicEntry, ProcessorEntry};

pub mod repr;

/// Read-only access to physical memory.
pub trait PhysMemory {
    /// Returns `len` bytes starting at physical address `paddr`.
    fn bytes(&self, paddr: usize, len: usize) -> Option<&[u8]>;
}

/// Physical memory reachable through a linear kernel mapping.
#[derive(Debug)]
pub struct DirectMap {
    offset: usize,
}

impl DirectMap {
    /// Creates a view where physical address `pa` is mapped at `pa + offset`.
    ///
    /// # Safety
    ///
    /// The low 1 MiB of physical memory must be mapped readable at `offset`
    /// for the lifetime of the returned value.
    #[must_use]
    pub const unsafe fn new(offset: usize) -> Self {
        Self { offset }
    }
}

impl PhysMemory for DirectMap {
    fn bytes(&self, paddr: usize, len: usize) -> Option<&[u8]> {
        let addr = paddr.checked_add(self.offset)?;
        addr.checked_add(len)?;
        let ptr = core::ptr::with_exposed_provenance::<u8>(addr);
        Some(unsafe { core::slice::from_raw_parts(ptr, len) })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum MpError {
    #[error("MP floating pointer structure not found")]
    NotFound,
    #[error("default MP configurations are not supported")]
    DefaultConfig,
    #[error("configuration table at {0:#x} is not readable")]
    Unreadable(usize),
    #[error("bad configuration table signature")]
    BadSignature,
    #[error("unsupported configuration table version {0}")]
    UnsupportedVersion(u8),
    #[error("configuration table checksum mismatch")]
    BadChecksum,
    #[error("configuration entry at offset {0:#x} is truncated")]
    Truncated(usize),
    #[error("unknown configuration entry type {0:#x}")]
    UnknownEntry(u8),
    #[error("processor entry #{index} has APIC id {apic_id}")]
    ApicIdMismatch { index: usize, apic_id: u8 },
}

/// A processor described by the configuration table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CpuEntry {
    pub apic_id: u8,
    pub apic_version: u8,
}

/// What discovery learned about the machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topology {
    /// Processors in discovery order.
    pub cpus: ArrayVec<CpuEntry, NCPU>,
    /// Index into `cpus` of the bootstrap processor.
    pub bsp: usize,
    pub ioapic_id: u8,
    pub ioapic_addr: u32,
    /// Physical address of the local APIC, 0 if there is none to program.
    pub lapic_addr: u32,
    /// `true` if the IMCR must be switched to leave PIC mode.
    pub imcr: bool,
    /// `false` for the single-CPU fallback configuration.
    pub is_mp: bool,
}

impl Topology {
    /// Single CPU, no APIC. Interrupts are routed through the legacy PIC.
    #[must_use]
    pub fn uniprocessor() -> Self {
        let mut cpus = ArrayVec::new();
        cpus.push(CpuEntry {
            apic_id: 0,
            apic_version: 0,
        });
        Self {
            cpus,
            bsp: 0,
            ioapic_id: 0,
            ioapic_addr: 0,
            lapic_addr: 0,
            imcr: false,
            is_mp: false,
        }
    }

    #[must_use]
    pub fn ncpu(&self) -> usize {
        self.cpus.len()
    }
}

/// Discovers the processor topology, falling back to a uniprocessor.
pub fn discover<M>(mem: &M) -> Topology
where
    M: PhysMemory + ?Sized,
{
    match parse(mem) {
        Ok(topology) => {
            log::info!(
                "mp: {} cpus, bsp #{}, ioapic {}, lapic at {:#x}",
                topology.ncpu(),
                topology.bsp,
                topology.ioapic_id,
                topology.lapic_addr
            );
            topology
        }
        Err(e) => {
            log::warn!("mp: {e}, falling back to uniprocessor");
            Topology::uniprocessor()
        }
    }
}

const BDA: usize = 0x400;
const BIOS_ROM: usize = 0xf_0000;
const BIOS_ROM_LEN: usize = 0x1_0000;

/// Searches for the MP floating pointer structure.
///
/// According to the MP specification it lives in one of:
///
/// 1. the first KiB of the EBDA;
/// 2. the last KiB of system base memory;
/// 3. the BIOS ROM between 0xF0000 and 0xFFFFF.
pub fn search<M>(mem: &M) -> Option<FloatingPointer>
where
    M: PhysMemory + ?Sized,
{
    if let Some(bda) = mem.bytes(BDA, 0x20) {
        let ebda = usize::from(u16::from_le_bytes([bda[0x0e], bda[0x0f]])) << 4;
        if ebda != 0 {
            if let Some(mp) = search_range(mem, ebda, 1024) {
                return Some(mp);
            }
        }
        let base_kib = usize::from(u16::from_le_bytes([bda[0x13], bda[0x14]]));
        if base_kib != 0 {
            if let Some(mp) = search_range(mem, base_kib * 1024 - 1024, 1024) {
                return Some(mp);
            }
        }
    }
    search_range(mem, BIOS_ROM, BIOS_ROM_LEN)
}

fn search_range<M>(mem: &M, start: usize, len: usize) -> Option<FloatingPointer>
where
    M: PhysMemory + ?Sized,
{
    let bytes = mem.bytes(start, len)?;
    bytes
        .chunks_exact(size_of::<FloatingPointer>())
        .filter(|chunk| chunk.starts_with(&repr::FLOATING_SIGNATURE) && repr::checksum(chunk) == 0)
        .find_map(repr::read::<FloatingPointer>)
}

/// Locates and validates the configuration table.
///
/// Returns the floating pointer together with the whole table, header included.
pub fn config<M>(mem: &M) -> Result<(FloatingPointer, &[u8]), MpError>
where
    M: PhysMemory + ?Sized,
{
    let mp = search(mem).ok_or(MpError::NotFound)?;
    if mp.phys_addr == 0 {
        return Err(MpError::DefaultConfig);
    }
    let addr = mp.phys_addr as usize;
    let header_bytes = mem
        .bytes(addr, size_of::<ConfigHeader>())
        .ok_or(MpError::Unreadable(addr))?;
    let header: ConfigHeader = repr::read(header_bytes).ok_or(MpError::Unreadable(addr))?;
    if header.signature != repr::CONFIG_SIGNATURE {
        return Err(MpError::BadSignature);
    }
    if header.version != 1 && header.version != 4 {
        return Err(MpError::UnsupportedVersion(header.version));
    }
    let length = usize::from(header.length);
    if length < size_of::<ConfigHeader>() {
        return Err(MpError::Truncated(0));
    }
    let table = mem.bytes(addr, length).ok_or(MpError::Unreadable(addr))?;
    if repr::checksum(table) != 0 {
        return Err(MpError::BadChecksum);
    }
    Ok((mp, table))
}

/// Parses the MP tables without falling back.
pub fn parse<M>(mem: &M) -> Result<Topology, MpError>
where
    M: PhysMemory + ?Sized,
{
    let (mp, table) = config(mem)?;
    let header: ConfigHeader = repr::read(table).ok_or(MpError::Truncated(0))?;

    let mut topology = Topology {
        cpus: ArrayVec::new(),
        bsp: 0,
        ioapic_id: 0,
        ioapic_addr: 0,
        lapic_addr: header.lapic_addr,
        imcr: (mp.imcrp & 0x80) != 0,
        is_mp: true,
    };

    let mut offset = size_of::<ConfigHeader>();
    while offset < table.len() {
        let entry = &table[offset..];
        match entry[0] {
            repr::MP_PROC => {
                let proc: ProcessorEntry = repr::read(entry).ok_or(MpError::Truncated(offset))?;
                let index = topology.cpus.len();
                if usize::from(proc.apic_id) != index {
                    return Err(MpError::ApicIdMismatch {
                        index,
                        apic_id: proc.apic_id,
                    });
                }
                if topology.cpus.is_full() {
                    log::warn!("mp: too many CPUs detected, CPU {} disabled", proc.apic_id);
                } else {
                    if proc.flags & repr::MP_BOOT != 0 {
                        topology.bsp = index;
                    }
                    topology.cpus.push(CpuEntry {
                        apic_id: proc.apic_id,
                        apic_version: proc.apic_version,
                    });
                }
                offset += size_of::<ProcessorEntry>();
            }
            repr::MP_IOAPIC => {
                let ioapic: IoApicEntry = repr::read(entry).ok_or(MpError::Truncated(offset))?;
                topology.ioapic_id = ioapic.apic_id;
                topology.ioapic_addr = ioapic.addr;
                offset += size_of::<IoApicEntry>();
            }
            repr::MP_BUS | repr::MP_IOINTR | repr::MP_LINTR => {
                if entry.len() < repr::SMALL_ENTRY_SIZE {
                    return Err(MpError::Truncated(offset));
                }
                offset += repr::SMALL_ENTRY_SIZE;
            }
            ty => return Err(MpError::UnknownEntry(ty)),
        }
    }

    if topology.cpus.is_empty() {
        return Err(MpError::Truncated(offset));
    }

    Ok(topology)
}
