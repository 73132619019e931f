//! A spinlock that blocks `SIGSEGV`/`SIGBUS` delivery to the locking thread
//! for the critical section's duration.
//!
//! A plain mutex is not async-signal-safe: if the fault router fires while
//! the owning thread holds the registry lock (e.g. because an unrelated
//! fault landed on that same thread), re-entering the lock from the signal
//! handler would deadlock. Blocking the two signals we route (see
//! `fault::install`) for the lock's lifetime sidesteps the problem entirely
//! — the handler simply cannot run until the critical section ends, at
//! which point the registry is consistent again.
//!
//! The fault router itself also takes this lock (to scan the registry), so
//! the mask manipulation here must itself be safe to call from a signal
//! handler. `sigprocmask(2)` is on the POSIX async-signal-safe function
//! list; `pthread_sigmask(3)` is not, even though the two are equivalent on
//! Linux (signal masks are per-thread). We use `sigprocmask` for that
//! reason even though this is a multithreaded program.

use super::{MutexSupport, spin_mutex::SpinMutex};

/// `MutexSupport` that blocks `SIGSEGV`/`SIGBUS` around the critical section.
#[derive(Debug)]
pub struct SignalBlocking;

pub type SpinNoSignalLock<T> = SpinMutex<T, SignalBlocking>;

/// Saved signal mask, restored when the guard holding it drops.
pub struct SignalMaskGuard(libc::sigset_t);

impl MutexSupport for SignalBlocking {
    type GuardData = SignalMaskGuard;

    #[inline]
    fn before_lock() -> Self::GuardData {
        unsafe {
            let mut to_block: libc::sigset_t = std::mem::zeroed();
            libc::sigemptyset(&mut to_block);
            libc::sigaddset(&mut to_block, libc::SIGSEGV);
            libc::sigaddset(&mut to_block, libc::SIGBUS);

            let mut previous: libc::sigset_t = std::mem::zeroed();
            let rc = libc::sigprocmask(libc::SIG_BLOCK, &to_block, &mut previous);
            debug_assert_eq!(rc, 0, "sigprocmask(SIG_BLOCK) failed");
            SignalMaskGuard(previous)
        }
    }

    #[inline]
    fn after_unlock(guard: &mut Self::GuardData) {
        unsafe {
            let rc = libc::sigprocmask(libc::SIG_SETMASK, &guard.0, std::ptr::null_mut());
            debug_assert_eq!(rc, 0, "sigprocmask(SIG_SETMASK) restore failed");
        }
    }
}
