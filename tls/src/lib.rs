//! Public API layer: the five TLS operations and the one-time process
//! initialisation that wires the registry, access control, and fault router
//! together.
//!
//! Two layers of entry point are exposed. The inner functions ([`create`],
//! [`write`], [`read`], [`destroy`], [`clone_from`]) return [`SysResult`] and
//! are the ergonomic surface for Rust callers. The outer `tls_*` functions
//! collapse that into the specification's `0`/`-1` contract, for callers
//! that want the C-shaped API verbatim.

use std::ops::Range;
use std::sync::Arc;
use std::sync::Once;
use std::thread::{self, ThreadId};

use access::Unprotected;
use config::mm::{page_count, page_size};
use page::{Page, PageHandle};
use registry::{Lsa, REGISTRY};
use systype::{SysResult, TlsError, abort_on_host_failure};

static INIT: Once = Once::new();

/// Latches the page size and installs the fault router. Safe to call many
/// times; only the first call does anything. Every public entry point below
/// calls this first, so a program never has to call it itself.
fn ensure_initialized() {
    INIT.call_once(|| {
        let ps = page_size();
        fault::install();
        log::info!("tls: initialised (page size {ps} bytes)");
    });
}

// Every public entry point below also calls `fault::poll_and_log()`: the
// fault router can only stash its event in an atomic from signal context,
// so this is where that gets turned into the actual `log::warn!` line.

fn current_thread() -> ThreadId {
    thread::current().id()
}

fn check_range(offset: u32, length: u32, size: u32) -> SysResult<()> {
    let end = offset
        .checked_add(length)
        .ok_or(TlsError::OutOfRange { offset, length, size })?;
    if end > size {
        return Err(TlsError::OutOfRange { offset, length, size });
    }
    Ok(())
}

/// Indices, within an LSA's `pages` array, that `[offset, offset+length)`
/// touches.
fn page_range(offset: u32, length: u32, page_size: usize) -> Range<usize> {
    let start = offset as usize / page_size;
    if length == 0 {
        return start..start;
    }
    let last_byte = offset as usize + length as usize - 1;
    start..(last_byte / page_size + 1)
}

/// Creates a new Local Storage Area of `size` bytes for the calling thread.
///
/// Fails if `size` is zero or the calling thread already owns an LSA.
pub fn create(size: u32) -> SysResult<()> {
    ensure_initialized();
    fault::poll_and_log();
    let tid = current_thread();
    if size == 0 {
        return Err(TlsError::ZeroSize);
    }
    if REGISTRY.exists(tid) {
        return Err(TlsError::AlreadyExists(tid));
    }

    let ps = page_size();
    let n = page_count(size as usize, ps);
    let mut pages = Vec::with_capacity(n);
    for _ in 0..n {
        pages.push(Arc::new(Page::new(ps)?));
    }

    REGISTRY.insert(
        tid,
        Lsa {
            owner: tid,
            size,
            pages,
        },
    );
    log::info!("tls_create: thread {tid:?} created a {size}-byte LSA across {n} page(s)");
    Ok(())
}

/// Writes `buf` into the calling thread's LSA starting at `offset`.
///
/// Any page touched that is still shared with another thread (because it
/// was never written to since a `tls_clone`) is copy-on-write'd into a
/// private page first, so the write is never visible to the thread that was
/// cloned from.
pub fn write(offset: u32, buf: &[u8]) -> SysResult<()> {
    ensure_initialized();
    fault::poll_and_log();
    let tid = current_thread();
    let lsa_lock = REGISTRY.fetch(tid).ok_or(TlsError::NoSuchLsa(tid))?;
    let mut lsa = lsa_lock.lock();
    check_range(offset, buf.len() as u32, lsa.size)?;
    if buf.is_empty() {
        return Ok(());
    }

    let ps = page_size();
    let range = page_range(offset, buf.len() as u32, ps);
    for idx in range {
        if page::ref_count(&lsa.pages[idx]) > 1 {
            log::debug!("tls_write: thread {tid:?} copy-on-write on page {idx}");
            let private = lsa.pages[idx].cow_copy()?;
            lsa.pages[idx] = Arc::new(private);
        }
    }

    // The access-control bracket covers every page of the LSA, not just the
    // pages the requested range touches — matching the reference
    // implementation's unprotect/reprotect loop over the whole page array.
    let all_pages: Vec<PageHandle> = lsa.pages.clone();
    drop(lsa);

    let _bracket = Unprotected::enter(&all_pages)?;
    for (i, byte) in buf.iter().copied().enumerate() {
        let absolute = offset as usize + i;
        let page_idx = absolute / ps;
        let in_page_offset = absolute % ps;
        unsafe { all_pages[page_idx].write_byte(in_page_offset, byte) };
    }
    Ok(())
}

/// Reads `buf.len()` bytes from the calling thread's LSA starting at
/// `offset` into `buf`.
pub fn read(offset: u32, buf: &mut [u8]) -> SysResult<()> {
    ensure_initialized();
    fault::poll_and_log();
    let tid = current_thread();
    let lsa_lock = REGISTRY.fetch(tid).ok_or(TlsError::NoSuchLsa(tid))?;
    let lsa = lsa_lock.lock();
    check_range(offset, buf.len() as u32, lsa.size)?;
    if buf.is_empty() {
        return Ok(());
    }

    let ps = page_size();

    // The access-control bracket covers every page of the LSA, not just the
    // pages the requested range touches — matching the reference
    // implementation's unprotect/reprotect loop over the whole page array.
    let all_pages: Vec<PageHandle> = lsa.pages.clone();
    drop(lsa);

    let _bracket = Unprotected::enter(&all_pages)?;
    for (i, slot) in buf.iter_mut().enumerate() {
        let absolute = offset as usize + i;
        let page_idx = absolute / ps;
        let in_page_offset = absolute % ps;
        *slot = unsafe { all_pages[page_idx].read_byte(in_page_offset) };
    }
    Ok(())
}

/// Destroys the calling thread's LSA, dropping its share of every page.
///
/// A page whose last reference this drops is unmapped immediately; a page
/// still shared with a clone survives until its last owner drops it too.
pub fn destroy() -> SysResult<()> {
    fault::poll_and_log();
    let tid = current_thread();
    if !REGISTRY.exists(tid) {
        return Err(TlsError::NoSuchLsa(tid));
    }
    REGISTRY.remove(tid);
    log::info!("tls_destroy: thread {tid:?} destroyed its LSA");
    Ok(())
}

/// Gives the calling thread its own LSA that shares `target`'s pages
/// copy-on-write.
///
/// `target` is checked exactly like any other thread identifier: if the
/// calling thread already owns an LSA, that is reported as
/// [`TlsError::CloneIntoExisting`] before `target` is even looked up,
/// regardless of whether `target` names the calling thread itself.
pub fn clone_from(target: ThreadId) -> SysResult<()> {
    ensure_initialized();
    fault::poll_and_log();
    let tid = current_thread();
    if REGISTRY.exists(tid) {
        return Err(TlsError::CloneIntoExisting(tid));
    }
    let source_lock = REGISTRY
        .fetch(target)
        .ok_or(TlsError::TargetHasNoLsa(target))?;
    let source = source_lock.lock();
    let cloned = Lsa {
        owner: tid,
        size: source.size,
        pages: source.pages.clone(),
    };
    drop(source);

    REGISTRY.insert(tid, cloned);
    log::info!("tls_clone: thread {tid:?} cloned thread {target:?}'s LSA");
    Ok(())
}

fn to_status(result: SysResult<()>) -> i32 {
    match result {
        Ok(()) => 0,
        Err(TlsError::HostFailure { op, .. }) => abort_on_host_failure(op),
        Err(_) => -1,
    }
}

/// Creates a `size`-byte LSA for the calling thread. Returns 0 on success,
/// -1 if `size` is zero or the thread already owns an LSA.
pub fn tls_create(size: u32) -> i32 {
    to_status(create(size))
}

/// Writes `buf` into the calling thread's LSA at `offset`. Returns 0 on
/// success, -1 on a missing LSA or an out-of-range access.
pub fn tls_write(offset: u32, buf: &[u8]) -> i32 {
    to_status(write(offset, buf))
}

/// Reads into `buf` from the calling thread's LSA at `offset`. Returns 0 on
/// success, -1 on a missing LSA or an out-of-range access.
pub fn tls_read(offset: u32, buf: &mut [u8]) -> i32 {
    to_status(read(offset, buf))
}

/// Destroys the calling thread's LSA. Returns 0 on success, -1 if it owns
/// none.
pub fn tls_destroy() -> i32 {
    to_status(destroy())
}

/// Clones `target`'s LSA into a new one owned by the calling thread. Returns
/// 0 on success, -1 if the calling thread already owns an LSA or `target`
/// owns none.
pub fn tls_clone(target: ThreadId) -> i32 {
    to_status(clone_from(target))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    // The registry is a process-wide singleton, so tests that create/destroy
    // LSAs must not run concurrently with each other.
    static SERIAL: Mutex<()> = Mutex::new(());

    fn in_fresh_thread<F: FnOnce() + Send + 'static>(f: F) {
        thread::spawn(f).join().expect("worker thread panicked");
    }

    #[test]
    fn create_write_read_round_trip() {
        let _guard = SERIAL.lock().unwrap();
        in_fresh_thread(|| {
            assert_eq!(tls_create(64), 0);
            assert_eq!(tls_write(10, b"hello"), 0);
            let mut out = [0u8; 5];
            assert_eq!(tls_read(10, &mut out), 0);
            assert_eq!(&out, b"hello");
            assert_eq!(tls_destroy(), 0);
        });
    }

    #[test]
    fn create_rejects_zero_size() {
        let _guard = SERIAL.lock().unwrap();
        in_fresh_thread(|| {
            assert_eq!(tls_create(0), -1);
        });
    }

    #[test]
    fn create_rejects_double_create() {
        let _guard = SERIAL.lock().unwrap();
        in_fresh_thread(|| {
            assert_eq!(tls_create(16), 0);
            assert_eq!(tls_create(16), -1);
            assert_eq!(tls_destroy(), 0);
        });
    }

    #[test]
    fn read_write_reject_out_of_range() {
        let _guard = SERIAL.lock().unwrap();
        in_fresh_thread(|| {
            assert_eq!(tls_create(8), 0);
            assert_eq!(tls_write(4, b"12345"), -1);
            let mut out = [0u8; 1];
            assert_eq!(tls_read(8, &mut out), -1);
            assert_eq!(tls_destroy(), 0);
        });
    }

    #[test]
    fn operations_without_an_lsa_fail() {
        let _guard = SERIAL.lock().unwrap();
        in_fresh_thread(|| {
            assert_eq!(tls_write(0, b"x"), -1);
            let mut out = [0u8; 1];
            assert_eq!(tls_read(0, &mut out), -1);
            assert_eq!(tls_destroy(), -1);
        });
    }

    #[test]
    fn clone_shares_then_diverges_on_write() {
        let _guard = SERIAL.lock().unwrap();
        let (tx, rx) = std::sync::mpsc::channel();
        let (ready_tx, ready_rx) = std::sync::mpsc::channel();

        let owner = thread::spawn(move || {
            assert_eq!(tls_create(32), 0);
            assert_eq!(tls_write(0, b"original"), 0);
            ready_tx.send(thread::current().id()).unwrap();
            // Keep the LSA alive until the cloning thread is done reading.
            rx.recv().unwrap();
            assert_eq!(tls_destroy(), 0);
        });

        let owner_id = ready_rx.recv().unwrap();
        let cloner = thread::spawn(move || {
            assert_eq!(tls_clone(owner_id), 0);
            let mut buf = [0u8; 8];
            assert_eq!(tls_read(0, &mut buf), 0);
            assert_eq!(&buf, b"original");

            // Diverge: writing through the clone must not affect the owner.
            assert_eq!(tls_write(0, b"mutated!"), 0);
            assert_eq!(tls_read(0, &mut buf), 0);
            assert_eq!(&buf, b"mutated!");
            assert_eq!(tls_destroy(), 0);
        });

        cloner.join().expect("cloner thread panicked");
        tx.send(()).unwrap();
        owner.join().expect("owner thread panicked");
    }

    #[test]
    fn clone_rejects_existing_owner_and_missing_target() {
        let _guard = SERIAL.lock().unwrap();
        let bogus_owner = thread::spawn(|| thread::current().id())
            .join()
            .unwrap();

        in_fresh_thread(move || {
            // `bogus_owner` has already exited and destroyed nothing; it
            // never owned an LSA in the registry to begin with.
            assert_eq!(tls_clone(bogus_owner), -1);

            assert_eq!(tls_create(8), 0);
            let self_id = thread::current().id();
            // Already owns an LSA, so this is rejected before `self_id` is
            // even looked up as a clone target.
            assert_eq!(tls_clone(self_id), -1);
            assert_eq!(tls_destroy(), 0);
        });
    }

    // Spawned with raw `pthread_create`/`pthread_join` rather than
    // `std::thread::spawn`: the fault router ends the worker with
    // `pthread_exit`, and routing that through Rust's unwind-catching
    // thread entry trampoline is not a combination the standard library
    // promises to support. `pthread_join` only cares that the thread ended.
    #[test]
    fn illegal_direct_page_access_kills_only_the_faulting_thread() {
        let _guard = SERIAL.lock().unwrap();

        extern "C" fn fault_in_raw_thread(_: *mut libc::c_void) -> *mut libc::c_void {
            assert_eq!(tls_create(16), 0);
            let lsa_lock = REGISTRY.fetch(current_thread()).unwrap();
            let addr = lsa_lock.lock().pages[0].addr();
            // Touching the mapping directly, outside any access bracket,
            // must route through the fault router and end this thread
            // without taking the process down with it.
            unsafe { std::ptr::read_volatile(addr as *const u8) };
            unreachable!("fault router should have ended this thread first");
        }

        unsafe {
            let mut tid: libc::pthread_t = std::mem::zeroed();
            let rc = libc::pthread_create(
                &mut tid,
                std::ptr::null(),
                fault_in_raw_thread,
                std::ptr::null_mut(),
            );
            assert_eq!(rc, 0, "pthread_create failed");
            let rc = libc::pthread_join(tid, std::ptr::null_mut());
            assert_eq!(
                rc, 0,
                "pthread_join failed — faulting thread did not terminate cleanly"
            );
        }

        // Reaching here at all means the process survived: the fault was
        // contained to the worker thread, exactly as the fault router is
        // meant to guarantee.
    }

    // Forces a small page size so an LSA spans several pages without a
    // multi-megabyte buffer. Only takes effect if nothing in this process
    // has called `config::mm::page_size` yet; if some other test already
    // latched the real host page size first, this falls back to it and the
    // scenario below still spans real pages, just with a larger buffer.
    fn force_small_pages_or_fall_back() -> usize {
        const OVERRIDE_PAGE_SIZE: usize = 64;
        let _ = std::panic::catch_unwind(|| config::mm::set_page_size_override(OVERRIDE_PAGE_SIZE));
        config::mm::page_size()
    }

    #[test]
    fn multi_page_write_read_spans_a_page_boundary() {
        let _guard = SERIAL.lock().unwrap();
        let ps = force_small_pages_or_fall_back();

        in_fresh_thread(move || {
            assert_eq!(tls_create((ps * 3) as u32), 0);

            // A buffer that starts one byte before the end of page 0 and
            // runs through all of page 1 into page 2.
            let buf: Vec<u8> = (0..(ps as u32 + 2)).map(|i| (i % 256) as u8).collect();
            let start = ps as u32 - 1;
            assert_eq!(tls_write(start, &buf), 0);

            let mut out = vec![0u8; buf.len()];
            assert_eq!(tls_read(start, &mut out), 0);
            assert_eq!(out, buf);
            assert_eq!(tls_destroy(), 0);
        });
    }

    #[test]
    fn spanning_write_through_a_clone_cows_every_page_it_touches() {
        let _guard = SERIAL.lock().unwrap();
        let ps = force_small_pages_or_fall_back();
        let (ready_tx, ready_rx) = std::sync::mpsc::channel();
        let (done_tx, done_rx) = std::sync::mpsc::channel();

        let owner = thread::spawn(move || {
            assert_eq!(tls_create((ps * 2) as u32), 0);
            let original = vec![0xAAu8; ps * 2];
            assert_eq!(tls_write(0, &original), 0);
            ready_tx.send(thread::current().id()).unwrap();
            done_rx.recv().unwrap();

            // The clone's spanning write must not have touched either of the
            // owner's pages.
            let mut out = vec![0u8; ps * 2];
            assert_eq!(tls_read(0, &mut out), 0);
            assert_eq!(out, original);
            assert_eq!(tls_destroy(), 0);
        });

        let owner_id = ready_rx.recv().unwrap();
        let cloner = thread::spawn(move || {
            assert_eq!(tls_clone(owner_id), 0);

            // This write spans the boundary between the two cloned pages,
            // so both must be copy-on-write'd before any byte is touched.
            let mutated = vec![0xBBu8; ps * 2];
            assert_eq!(tls_write(0, &mutated), 0);
            let mut out = vec![0u8; ps * 2];
            assert_eq!(tls_read(0, &mut out), 0);
            assert_eq!(out, mutated);
            assert_eq!(tls_destroy(), 0);
        });

        cloner.join().expect("cloner thread panicked");
        done_tx.send(()).unwrap();
        owner.join().expect("owner thread panicked");
    }
}
