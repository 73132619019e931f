//! Memory layout

use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use lazy_static::lazy_static;

/// Number of buckets in the global registry's hash table.
///
/// Fixed at compile time, as in the reference implementation; the library
/// expects collisions and resolves them with chaining rather than growing
/// the table.
pub const REGISTRY_BUCKETS: usize = 32;

lazy_static! {
    /// Latched page size, queried from the host on first use (or injected by
    /// [`set_page_size_override`] for tests). `None` until the first call to
    /// [`page_size`].
    static ref PAGE_SIZE: Mutex<Option<usize>> = Mutex::new(None);
}

/// Lock-free mirror of [`PAGE_SIZE`], written once by whichever call to
/// [`page_size`] latches it and read thereafter by [`page_size_fast`]. Exists
/// only so the fault router can learn the page size from inside a signal
/// handler without taking a `std::sync::Mutex`.
static PAGE_SIZE_FAST: AtomicUsize = AtomicUsize::new(0);

/// Returns the page size in bytes, querying the host on first call and
/// caching the result for the remainder of the process's life.
pub fn page_size() -> usize {
    let mut latched = PAGE_SIZE.lock().unwrap();
    if let Some(size) = *latched {
        return size;
    }
    let size = query_host_page_size();
    *latched = Some(size);
    PAGE_SIZE_FAST.store(size, Ordering::Release);
    size
}

/// Async-signal-safe read of the page size latched by an earlier call to
/// [`page_size`].
///
/// Returns 0 if `page_size` has never been called in this process, which
/// cannot happen once the fault router is installed: `tls_create`'s one-time
/// init queries the page size before it installs the signal handlers.
pub fn page_size_fast() -> usize {
    PAGE_SIZE_FAST.load(Ordering::Acquire)
}

/// Overrides the page size that [`page_size`] will report, instead of
/// querying the host.
///
/// Intended for tests that want small, easy-to-reason-about page counts.
/// Must be called before the first call to [`page_size`] anywhere in the
/// process (including indirectly, through `tls_create`).
///
/// # Panics
/// Panics if the page size has already been latched.
pub fn set_page_size_override(size: usize) {
    let mut latched = PAGE_SIZE.lock().unwrap();
    assert!(
        latched.is_none(),
        "config::mm::set_page_size_override called after the page size was already latched"
    );
    *latched = Some(size);
    PAGE_SIZE_FAST.store(size, Ordering::Release);
}

fn query_host_page_size() -> usize {
    let queried = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if queried > 0 {
        queried as usize
    } else {
        // Every POSIX host we target reports a usable page size; this is a
        // defensive fallback for the sysconf failure case, not a supported
        // configuration.
        4096
    }
}

/// Rounds `size` up to the next multiple of `page_size`.
pub fn round_up_to_page(size: usize, page_size: usize) -> usize {
    size.div_ceil(page_size) * page_size
}

/// Number of pages needed to back `size` bytes.
pub fn page_count(size: usize, page_size: usize) -> usize {
    size.div_ceil(page_size)
}

/// Rounds `addr` down to the start of its containing page.
pub fn align_down(addr: usize, page_size: usize) -> usize {
    addr & !(page_size - 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_up_to_page_rounds_partial_pages() {
        assert_eq!(round_up_to_page(1, 4096), 4096);
        assert_eq!(round_up_to_page(4096, 4096), 4096);
        assert_eq!(round_up_to_page(4097, 4096), 8192);
    }

    #[test]
    fn page_count_matches_round_up() {
        assert_eq!(page_count(1, 4096), 1);
        assert_eq!(page_count(4096, 4096), 1);
        assert_eq!(page_count(4097, 4096), 2);
    }

    #[test]
    fn align_down_truncates_to_page_boundary() {
        assert_eq!(align_down(0x1000, 0x1000), 0x1000);
        assert_eq!(align_down(0x1fff, 0x1000), 0x1000);
        assert_eq!(align_down(0x2000, 0x1000), 0x2000);
    }
}
