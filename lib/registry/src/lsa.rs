use std::thread::ThreadId;

use page::PageHandle;

/// The per-thread Local Storage Area: a thread's private, page-backed byte
/// buffer.
///
/// Pure data. Constructed by `tls_create`/`tls_clone`, and mutated only by
/// operations running on `owner` — except for the `pages` slot a writer
/// replaces during copy-on-write, which is mutated under the registry's
/// lock (see `registry::Registry`) because it changes a refcount another
/// thread's LSA may be observing.
#[derive(Debug)]
pub struct Lsa {
    pub owner: ThreadId,
    pub size: u32,
    pub pages: Vec<PageHandle>,
}

impl Lsa {
    pub fn page_count(&self) -> usize {
        self.pages.len()
    }
}
