use strum::FromRepr;

/// Errors returned to user environments by system calls.
///
/// The negated discriminant is the value placed in the return register.
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromRepr, thiserror::Error)]
#[repr(isize)]
pub enum SyscallError {
    // E_UNSPECIFIED
    #[error("unspecified or unknown problem")]
    Unspecified = 1,
    // E_BAD_ENV
    #[error("environment doesn't exist or otherwise cannot be used in requested action")]
    BadTarget = 2,
    // E_INVAL
    #[error("invalid parameter")]
    InvalidArgument = 3,
    // E_NO_MEM
    #[error("request failed due to memory shortage")]
    OutOfMemory = 4,
    // E_NO_FREE_ENV
    #[error("attempt to create a new environment beyond the maximum allowed")]
    NoFreeSlot = 5,
    // // E_FAULT
    // #[error("memory fault")]
    // Fault = 6,
    // E_IPC_NOT_RECV
    #[error("attempt to send to env that is not recving")]
    NotReceiving = 7,
    #[error("unknown error")]
    Unknown = -1,
}

impl SyscallError {
    /// Returns the (negative) value stored in the return register.
    #[must_use]
    pub const fn to_raw(self) -> i32 {
        match self {
            Self::Unknown => -(Self::Unspecified as i32),
            _ => -(self as i32),
        }
    }

    /// Decodes a negative return register value.
    #[must_use]
    pub fn from_raw(raw: i32) -> Self {
        Self::from_repr(-(raw as isize)).unwrap_or(Self::Unknown)
    }
}
