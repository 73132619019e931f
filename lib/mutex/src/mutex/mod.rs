pub mod share_mutex;
pub mod signal_block;
pub mod spin_mutex;

pub use share_mutex::{ShareMutex, new_share_mutex};
pub use signal_block::SpinNoSignalLock;
use spin_mutex::SpinMutex;

/// Low-level support for [`SpinMutex`], hooked in before/after the critical
/// section.
pub trait MutexSupport {
    /// Guard data threaded from `before_lock` to `after_unlock`.
    type GuardData;
    /// Called before the spin loop starts.
    fn before_lock() -> Self::GuardData;
    /// Called when the guard drops, after the lock itself is released.
    fn after_unlock(_: &mut Self::GuardData);
}

/// `MutexSupport` that does nothing extra around the critical section.
#[derive(Debug)]
pub struct Spin;

impl MutexSupport for Spin {
    type GuardData = ();
    #[inline(always)]
    fn before_lock() -> Self::GuardData {}
    #[inline(always)]
    fn after_unlock(_: &mut Self::GuardData) {}
}

pub type SpinLock<T> = SpinMutex<T, Spin>;
