//! User-level IPC routines.

use sjos_syscall::{PtePerm, error::SyscallError};
use sjos_types::env::EnvId;

use crate::syscall::{SyscallExt as _, Syscalls};

/// A message delivered by [`ipc_recv`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Message {
    pub value: u32,
    pub from: Option<EnvId>,
    /// Permission of the transferred page; empty if no page was transferred.
    pub perm: PtePerm,
}

/// Sends `value`, and the page at `page` with `perm` if any, to `to`.
///
/// Keeps trying, yielding the CPU in between, until `to` is receiving.
///
/// # Panics
///
/// Panics on any error other than the target not receiving.
pub fn ipc_send<S>(sys: &S, to: EnvId, value: u32, page: Option<usize>, perm: PtePerm)
where
    S: Syscalls + ?Sized,
{
    loop {
        match sys.sys_ipc_try_send(to, value, page, perm) {
            Ok(()) => return,
            Err(SyscallError::NotReceiving) => sys.sys_yield(),
            Err(e) => panic!("ipc_send: {e}"),
        }
    }
}

/// Waits for a message.
///
/// If `page` is given, a page sent along is mapped there.
pub fn ipc_recv<S>(sys: &S, page: Option<usize>) -> Result<Message, SyscallError>
where
    S: Syscalls + ?Sized,
{
    sys.sys_ipc_recv(page)?;
    let fields = sys.ipc_fields();
    Ok(Message {
        value: fields.value,
        from: EnvId::from_raw(fields.from),
        perm: PtePerm::from_bits_retain(fields.perm),
    })
}
