//! Locking primitives for data that must also be scanned from signal context.

pub mod mutex;

pub use mutex::{ShareMutex, SpinNoSignalLock, new_share_mutex};
