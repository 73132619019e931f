//! Access-control subsystem: brackets every sanctioned read/write with an
//! unprotect/protect pair around the whole LSA.
//!
//! At rest every page belonging to every LSA is mapped `PROT_NONE`. The
//! bracket is unconditional for both reads and writes — protection
//! granularity is a page, and after a COW a previously shared page must
//! become inaccessible to the non-writing side the instant the writer
//! finishes, so there is no cheaper "read-only" fast path to special-case.

use page::PageHandle;
use systype::{HostOp, SysResult, abort_on_host_failure};

/// RAII bracket: unprotects `pages` to read+write on construction, and
/// protects them back to no-access on drop — even on an early return via
/// `?`, matching the specification's "unconditional bracket" requirement.
pub struct Unprotected<'a> {
    pages: &'a [PageHandle],
}

impl<'a> Unprotected<'a> {
    /// Unprotects every page in `pages` to read+write.
    pub fn enter(pages: &'a [PageHandle]) -> SysResult<Self> {
        for page in pages {
            page.protect_read_write()?;
        }
        Ok(Self { pages })
    }
}

impl Drop for Unprotected<'_> {
    fn drop(&mut self) {
        for page in self.pages {
            if page.protect_none().is_err() {
                // mprotect failing to re-apply a protection we successfully
                // applied moments ago means the address space is in a state
                // we no longer understand; limping on would risk granting
                // silent read/write access to memory the rest of the
                // library believes is locked down.
                abort_on_host_failure(HostOp::Mprotect);
            }
        }
    }
}
