//! Page Objects: the reference-counted, `mmap`-backed pages an LSA's
//! contents live in.
//!
//! A [`Page`] wraps one anonymous private mapping, exactly one page in
//! size. It carries no refcount field of its own — an LSA Descriptor's
//! `pages` array stores `Arc<Page>` handles, so `Arc::strong_count` *is*
//! the reference count the specification describes: sharing a page (as
//! `tls_clone` does) is an `Arc::clone`, and dropping a Descriptor's last
//! reference to a page is an `Arc` drop, which runs [`Page`]'s `Drop` impl
//! and unmaps the page exactly when the count would otherwise reach zero.
//! This makes the "pair every increment with a decrement" discipline a
//! structural property of the type rather than a convention to maintain by
//! hand.

use std::sync::Arc;

use systype::{HostOp, SysResult, TlsError, abort_on_host_failure};

/// One page-aligned, page-sized anonymous private mapping.
///
/// Synchronising *access* to the bytes behind this mapping is the
/// access-control subsystem's job, not this type's: a `Page` only owns the
/// mapping's lifetime.
pub struct Page {
    addr: *mut u8,
    len: usize,
}

unsafe impl Send for Page {}
unsafe impl Sync for Page {}

/// Shared handle to a `Page`. Cloning one *is* incrementing its refcount.
pub type PageHandle = Arc<Page>;

impl Page {
    /// Creates a fresh page-sized anonymous private mapping, protected to
    /// no-access.
    pub fn new(page_size: usize) -> SysResult<Self> {
        let addr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                page_size,
                libc::PROT_NONE,
                libc::MAP_ANONYMOUS | libc::MAP_PRIVATE,
                -1,
                0,
            )
        };
        if addr == libc::MAP_FAILED {
            return Err(TlsError::HostFailure {
                op: HostOp::Mmap,
                errno: std::io::Error::last_os_error(),
            });
        }
        Ok(Page {
            addr: addr as *mut u8,
            len: page_size,
        })
    }

    /// Creates a fresh mapping holding a private copy of `self`'s contents,
    /// for copy-on-write.
    ///
    /// `self` may be at rest (`PROT_NONE`, the state every page not inside
    /// an access bracket is in) when this is called: it is temporarily
    /// unprotected for the read and restored to `PROT_NONE` before
    /// returning, regardless of whether the copy succeeded. The returned
    /// page is also left at `PROT_NONE`, the same rest state as any other
    /// page.
    pub fn cow_copy(&self) -> SysResult<Self> {
        let copy = Self::new(self.len)?;
        copy.mprotect(libc::PROT_READ | libc::PROT_WRITE)?;

        self.mprotect(libc::PROT_READ)?;
        unsafe { std::ptr::copy_nonoverlapping(self.addr, copy.addr, self.len) };
        self.mprotect(libc::PROT_NONE)?;

        copy.mprotect(libc::PROT_NONE)?;
        Ok(copy)
    }

    /// Base address of the mapping.
    pub fn addr(&self) -> usize {
        self.addr as usize
    }

    /// Length of the mapping in bytes (always the page size it was built
    /// with).
    pub fn len(&self) -> usize {
        self.len
    }

    /// True if `page_aligned_addr` (already rounded down to a page
    /// boundary) is this page's base address.
    pub fn matches_faulting_page(&self, page_aligned_addr: usize) -> bool {
        self.addr() == page_aligned_addr
    }

    /// Sets the mapping's protection to `PROT_NONE`.
    pub fn protect_none(&self) -> SysResult<()> {
        self.mprotect(libc::PROT_NONE)
    }

    /// Sets the mapping's protection to `PROT_READ | PROT_WRITE`.
    pub fn protect_read_write(&self) -> SysResult<()> {
        self.mprotect(libc::PROT_READ | libc::PROT_WRITE)
    }

    fn mprotect(&self, prot: libc::c_int) -> SysResult<()> {
        let rc = unsafe { libc::mprotect(self.addr as *mut libc::c_void, self.len, prot) };
        if rc != 0 {
            return Err(TlsError::HostFailure {
                op: HostOp::Mprotect,
                errno: std::io::Error::last_os_error(),
            });
        }
        Ok(())
    }

    /// Returns the byte at `offset` within the page.
    ///
    /// # Safety
    /// The caller must have unprotected the page (`protect_read_write`)
    /// before calling this, and `offset` must be within the page.
    pub unsafe fn read_byte(&self, offset: usize) -> u8 {
        debug_assert!(offset < self.len);
        unsafe { *self.addr.add(offset) }
    }

    /// Writes `value` at `offset` within the page.
    ///
    /// # Safety
    /// Same preconditions as [`Page::read_byte`].
    pub unsafe fn write_byte(&self, offset: usize, value: u8) {
        debug_assert!(offset < self.len);
        unsafe {
            *self.addr.add(offset) = value;
        }
    }
}

impl Drop for Page {
    fn drop(&mut self) {
        let rc = unsafe { libc::munmap(self.addr as *mut libc::c_void, self.len) };
        if rc != 0 {
            // The mapping leaked or the address space is now inconsistent;
            // either way we cannot trust the process to keep running.
            abort_on_host_failure(HostOp::Munmap);
        }
    }
}

impl std::fmt::Debug for Page {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Page")
            .field("addr", &format_args!("{:#x}", self.addr()))
            .field("len", &self.len)
            .finish()
    }
}

/// Number of live references to `page` — the specification's `ref_count`.
pub fn ref_count(page: &PageHandle) -> usize {
    Arc::strong_count(page)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn page_size() -> usize {
        unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize }
    }

    #[test]
    fn new_page_starts_at_rest_and_cow_copies_contents() {
        let ps = page_size();
        let original = Page::new(ps).unwrap();

        original.protect_read_write().unwrap();
        unsafe { original.write_byte(0, 0x42) };
        original.protect_none().unwrap();

        let copy = original.cow_copy().unwrap();
        assert_ne!(copy.addr(), original.addr());

        copy.protect_read_write().unwrap();
        assert_eq!(unsafe { copy.read_byte(0) }, 0x42);
        copy.protect_none().unwrap();
    }

    #[test]
    fn ref_count_tracks_clones() {
        let page: PageHandle = Arc::new(Page::new(page_size()).unwrap());
        assert_eq!(ref_count(&page), 1);
        let second = page.clone();
        assert_eq!(ref_count(&page), 2);
        drop(second);
        assert_eq!(ref_count(&page), 1);
    }
}
