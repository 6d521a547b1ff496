//! User-side library of the SJOS kernel.
//!
//! Everything is written against the [`Syscalls`] trait, so the same code
//! runs on top of the `int 0x30` gate or a simulated kernel.

#![cfg_attr(not(test), no_std)]

pub use self::{
    fork::{AddressSpace, PageFaultError, fork, handle_cow_fault},
    ipc::{Message, ipc_recv, ipc_send},
    syscall::{SyscallExt, Syscalls},
};

pub mod fork;
pub mod ipc;
pub mod syscall;
#[cfg(target_arch = "x86")]
pub mod x86;
