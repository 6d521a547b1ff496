pub use self::spin_lock::{RawSpinLock, SpinLock, SpinLockGuard};

mod spin_lock;
