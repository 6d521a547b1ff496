use sjos_syscall::error::SyscallError;

use crate::memory::MemoryError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum KernelError {
    #[error("bad environment")]
    BadTarget,
    #[error("invalid argument")]
    InvalidArgument,
    #[error("no free environment")]
    NoFreeSlot,
    #[error("target is not receiving")]
    NotReceiving,
    #[error(transparent)]
    Memory(#[from] MemoryError),
}

impl From<KernelError> for SyscallError {
    fn from(error: KernelError) -> Self {
        match error {
            KernelError::BadTarget => Self::BadTarget,
            KernelError::InvalidArgument | KernelError::Memory(MemoryError::BadImage) => {
                Self::InvalidArgument
            }
            KernelError::NoFreeSlot => Self::NoFreeSlot,
            KernelError::NotReceiving => Self::NotReceiving,
            KernelError::Memory(MemoryError::OutOfMemory) => Self::OutOfMemory,
        }
    }
}
