//! The fault router: a `SIGSEGV`/`SIGBUS` handler that tells an illegal touch
//! of a protected LSA page apart from an ordinary memory fault.
//!
//! Everything this module does at fault time runs on the faulting thread,
//! inside a signal handler, with `SIGSEGV`/`SIGBUS` blocked (the access-
//! control bracket and the registry's locks both rely on that). It must not
//! allocate and must not call anything outside the async-signal-safe list —
//! no `log` macros, no `Vec`, no `std::sync::Mutex`. Diagnostics here go
//! straight to `STDERR_FILENO` via a raw `write(2)`.
//!
//! The observability layer still wants a proper `log::warn!` for both
//! outcomes, so `handle_fault` stashes the event in a pair of atomics —
//! the same lock-free-mirror idea as [`config::mm::page_size_fast`] — and
//! [`poll_and_log`], called from ordinary (non-signal) context, turns
//! whatever it finds there into the actual log line.

use std::os::raw::c_int;
use std::ptr;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};

use config::mm::{align_down, page_size_fast};
use registry::REGISTRY;
use systype::{HostOp, abort_on_host_failure};

static INSTALLED: std::sync::Once = std::sync::Once::new();

const EVENT_NONE: u8 = 0;
const EVENT_TERMINATED: u8 = 1;
const EVENT_RERAISED: u8 = 2;

/// Set by `handle_fault`, drained by [`poll_and_log`]. Never touched from
/// signal context after the swap in `poll_and_log` — only stores from
/// `handle_fault`, which never races itself (a thread can only fault once
/// at a time) and is content to let a later event overwrite an undrained
/// earlier one.
static PENDING_EVENT: AtomicU8 = AtomicU8::new(EVENT_NONE);
static PENDING_ADDR: AtomicUsize = AtomicUsize::new(0);

/// Installs the fault router's handlers for `SIGSEGV` and `SIGBUS`.
///
/// Idempotent: later calls after the first are no-ops. Must run after the
/// page size has been latched (see [`config::mm::page_size`]), since the
/// handler itself can only read it through the async-signal-safe
/// [`page_size_fast`] accessor, which reports 0 until latched.
pub fn install() {
    INSTALLED.call_once(|| unsafe {
        install_for(libc::SIGSEGV);
        install_for(libc::SIGBUS);
    });
}

unsafe fn install_for(signum: c_int) {
    let mut action: libc::sigaction = std::mem::zeroed();
    action.sa_flags = libc::SA_SIGINFO;
    libc::sigemptyset(&mut action.sa_mask);
    action.sa_sigaction = handle_fault as usize;
    if unsafe { libc::sigaction(signum, &action, ptr::null_mut()) } != 0 {
        abort_on_host_failure(HostOp::Sigaction);
    }
}

/// The installed handler. Distinguishes a fault on a live LSA page (our
/// fault, meaning some thread touched another thread's local storage, or its
/// own, outside the access-control bracket) from every other fault (not
/// ours; reinstate the default disposition and re-raise).
extern "C" fn handle_fault(signum: c_int, info: *mut libc::siginfo_t, _ctx: *mut libc::c_void) {
    let fault_addr = unsafe { (*info).si_addr() } as usize;
    let page_size = page_size_fast();

    let is_ours = page_size != 0 && {
        let page_aligned = align_down(fault_addr, page_size);
        REGISTRY.scan_for_page(page_aligned)
    };

    if is_ours {
        PENDING_ADDR.store(fault_addr, Ordering::Relaxed);
        PENDING_EVENT.store(EVENT_TERMINATED, Ordering::Release);
        write_diagnostic(b"tls: illegal access to protected local storage; terminating thread\n");
        // `pthread_exit` from a signal handler is how the specification's
        // "terminate the offending thread, not the process" requirement is
        // met: it never returns.
        unsafe { libc::pthread_exit(ptr::null_mut()) };
    }

    PENDING_ADDR.store(fault_addr, Ordering::Relaxed);
    PENDING_EVENT.store(EVENT_RERAISED, Ordering::Release);
    write_diagnostic(b"tls: fault router saw an unrelated fault; re-raising\n");
    reraise_as_default(signum);
}

/// Turns the most recent fault event the handler recorded, if any, into a
/// proper `log::warn!` line. No-op if nothing is pending.
///
/// Must be called from ordinary (non-signal) context — the handler itself
/// only ever stores into [`PENDING_EVENT`]/[`PENDING_ADDR`], since `log`
/// macros are not async-signal-safe. Callers poll this after the fact; a
/// fault that kills the whole process before anyone polls (a genuine,
/// unrelated crash re-raised with the default disposition) will still have
/// gotten the raw `STDERR_FILENO` diagnostic from `handle_fault` itself, just
/// not the `log::warn!`.
pub fn poll_and_log() {
    let event = PENDING_EVENT.swap(EVENT_NONE, Ordering::Acquire);
    let addr = PENDING_ADDR.load(Ordering::Relaxed);
    match event {
        EVENT_TERMINATED => {
            log::warn!("fault router terminated a thread for touching protected local storage at {addr:#x}");
        }
        EVENT_RERAISED => {
            log::warn!("fault router saw an unrelated fault at {addr:#x}; re-raised it with the default disposition");
        }
        _ => {}
    }
}

/// Restores the default disposition for both signals we handle and
/// re-raises `signum`, so a genuine, unrelated `SIGSEGV`/`SIGBUS` still
/// crashes the process the way it would have without this library installed.
fn reraise_as_default(signum: c_int) -> ! {
    unsafe {
        libc::signal(libc::SIGSEGV, libc::SIG_DFL);
        libc::signal(libc::SIGBUS, libc::SIG_DFL);
        libc::raise(signum);
    }
    // raise() only returns if delivery is somehow blocked; this should be
    // unreachable since we just cleared both signals' dispositions to
    // default and they are no longer masked once this handler returns.
    unsafe { libc::abort() };
}

fn write_diagnostic(msg: &'static [u8]) {
    unsafe {
        libc::write(libc::STDERR_FILENO, msg.as_ptr() as *const libc::c_void, msg.len());
    }
}
