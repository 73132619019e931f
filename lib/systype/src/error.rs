use std::thread::ThreadId;

/// Type alias for the result of a TLS core operation.
pub type SysResult<T> = Result<T, TlsError>;

/// Which host VM syscall a [`TlsError::HostFailure`] came from.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum HostOp {
    Mmap,
    Mprotect,
    Munmap,
    Sigaction,
}

impl HostOp {
    pub const fn as_str(self) -> &'static str {
        match self {
            HostOp::Mmap => "mmap",
            HostOp::Mprotect => "mprotect",
            HostOp::Munmap => "munmap",
            HostOp::Sigaction => "sigaction",
        }
    }
}

/// Errors produced by the TLS core.
///
/// Every variant except [`TlsError::HostFailure`] corresponds to a
/// precondition violation and is surfaced to callers as the public `-1`
/// return value. [`TlsError::HostFailure`] is kept as a distinct type so it
/// cannot be propagated with `?` past the point where it must instead abort
/// the process (see `tls::abort_on_host_failure`).
#[derive(Debug, thiserror::Error)]
pub enum TlsError {
    /// `tls_create` called with `size == 0`.
    #[error("tls_create: size must be non-zero")]
    ZeroSize,

    /// `tls_create` called by a thread that already owns an LSA.
    #[error("thread {0:?} already owns an LSA")]
    AlreadyExists(ThreadId),

    /// `tls_clone` called by a thread that already owns an LSA.
    #[error("thread {0:?} already owns an LSA and cannot clone into it")]
    CloneIntoExisting(ThreadId),

    /// `tls_read`, `tls_write`, or `tls_destroy` called by a thread with no LSA.
    #[error("thread {0:?} owns no LSA")]
    NoSuchLsa(ThreadId),

    /// `tls_read`/`tls_write` requested a range outside `[0, size)`.
    #[error("range [{offset}, {offset}+{length}) is out of bounds for an LSA of size {size}")]
    OutOfRange {
        offset: u32,
        length: u32,
        size: u32,
    },

    /// `tls_clone` named a thread with no LSA.
    #[error("clone target {0:?} owns no LSA")]
    TargetHasNoLsa(ThreadId),

    /// A VM syscall the library's invariants depend on failed. Never
    /// returned to a caller as `-1`; it is a signal to abort the process.
    #[error("host VM syscall {op} failed: {errno}")]
    HostFailure { op: HostOp, errno: std::io::Error },
}

impl TlsError {
    /// True for every variant that maps to the public `-1` return contract.
    pub fn is_precondition_violation(&self) -> bool {
        !matches!(self, TlsError::HostFailure { .. })
    }
}

/// Logs `op`'s failure and aborts the process.
///
/// Per the library's error handling design, a failure of a VM syscall
/// (`mmap`/`mprotect`/`munmap`) indicates a broken invariant the library
/// cannot recover from: the page table may now be inconsistent, so limping
/// on would risk granting access to memory the access-control subsystem
/// believes is still protected. This is the only place in the crate that
/// calls `std::process::abort`.
pub fn abort_on_host_failure(op: HostOp) -> ! {
    let errno = std::io::Error::last_os_error();
    log::error!("catastrophic host failure in {}: {errno}", op.as_str());
    eprintln!("tls: catastrophic host failure in {}: {errno}", op.as_str());
    std::process::abort();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn is_precondition_violation_excludes_only_host_failure() {
        let tid = std::thread::current().id();
        assert!(TlsError::ZeroSize.is_precondition_violation());
        assert!(TlsError::AlreadyExists(tid).is_precondition_violation());
        assert!(
            !TlsError::HostFailure {
                op: HostOp::Mmap,
                errno: std::io::Error::last_os_error(),
            }
            .is_precondition_violation()
        );
    }
}
