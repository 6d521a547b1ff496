#![cfg_attr(not(test), no_std)]

use bitflags::bitflags;
use dataview::Pod;
use sjos_kernel_params::{PAGE_SIZE, UTOP};
use strum::{Display, EnumString, FromRepr};

use self::error::SyscallError;

pub mod error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, FromRepr, EnumString, Display)]
#[repr(u32)]
#[strum(serialize_all = "snake_case")]
#[strum(ascii_case_insensitive)]
pub enum SyscallCode {
    Getenvid = 1,
    EnvDestroy,
    PageAlloc,
    PageMap,
    PageUnmap,
    Exofork,
    EnvSetStatus,
    EnvSetPgfaultUpcall,
    Yield,
    IpcTrySend,
    IpcRecv,
    GetCpuId,
}

/// Scheduling state of an environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromRepr, Display)]
#[repr(u32)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum EnvStatus {
    /// Slot is available for allocation.
    Free = 0,
    /// Destroyed while running on another CPU; reclaimed at that CPU's next kernel entry.
    Dying,
    /// Eligible for dispatch by its owning CPU.
    Runnable,
    /// Currently executing on its owning CPU.
    Running,
    /// Blocked, e.g. waiting in `ipc_recv`.
    NotRunnable,
}

bitflags! {
    /// Page table entry permission bits visible to user environments.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    #[repr(transparent)]
    pub struct PtePerm: u32 {
        const P = 0x001;
        const W = 0x002;
        const U = 0x004;
        const PWT = 0x008;
        const PCD = 0x010;
        const A = 0x020;
        const D = 0x040;
        const PS = 0x080;
        const G = 0x100;
        /// Copy-on-write marker, one of the software-available bits.
        const COW = 0x800;
        const AVAIL = 0xe00;

        /// Bits a user environment may request.
        const USER = Self::P.bits() | Self::W.bits() | Self::U.bits() | Self::AVAIL.bits();
    }
}

impl PtePerm {
    /// Validates a permission word passed to a page mapping system call.
    ///
    /// `U` and `P` must be set and no bit outside [`PtePerm::USER`] may be set.
    #[must_use]
    pub fn from_user(raw: u32) -> Option<Self> {
        let perm = Self::from_bits(raw)?;
        (perm.contains(Self::U | Self::P) && Self::USER.contains(perm)).then_some(perm)
    }
}

/// Address passed to `ipc_recv` and `ipc_try_send` when no page is to be transferred.
///
/// Any address at or above [`UTOP`] has the same meaning.
pub const NO_PAGE: usize = UTOP;

/// Returns `true` if `va` is a page-aligned user address.
#[must_use]
pub fn is_user_page(va: usize) -> bool {
    va < UTOP && va % PAGE_SIZE == 0
}

/// IPC fields of an environment, published read-only to user space.
///
/// A successful `ipc_recv` returns 0; the delivered message is read from here.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Pod)]
pub struct IpcFields {
    /// Sending environment, 0 if none.
    pub from: u32,
    pub value: u32,
    /// Permission of the transferred page, 0 if no page was transferred.
    pub perm: u32,
}

/// Encodes a system call result into the return register.
#[must_use]
pub fn encode_result(result: Result<u32, SyscallError>) -> u32 {
    match result {
        Ok(value) => value,
        Err(e) => e.to_raw() as u32,
    }
}

/// Decodes the return register of a system call.
pub fn decode_result(raw: u32) -> Result<u32, SyscallError> {
    let signed = raw as i32;
    if signed < 0 {
        return Err(SyscallError::from_raw(signed));
    }
    Ok(raw)
}
