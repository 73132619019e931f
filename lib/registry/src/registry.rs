use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::thread::ThreadId;

use config::mm::REGISTRY_BUCKETS;
use mutex::{ShareMutex, SpinNoSignalLock, new_share_mutex};
use page::Page;

use crate::lsa::Lsa;

type Bucket = Vec<(ThreadId, ShareMutex<Lsa>)>;

/// Process-global map from thread identity to LSA, safe to scan from the
/// fault router's signal handler.
///
/// Implemented as a fixed-size hash table with separate chaining, as the
/// specification requires, rather than a growable map: the table never
/// resizes, so the bucket array the fault router walks is never
/// reallocated out from under it.
///
/// Two lock levels are in play. The outer [`SpinNoSignalLock`] around the
/// bucket array guards *structural* changes (insert/remove) and is also
/// held for the full duration of a fault-router scan, since that scan must
/// see a consistent set of LSAs. The inner [`ShareMutex`] per LSA guards
/// that one LSA's `pages` array, so a COW replacement on thread A's LSA
/// never blocks an unrelated read/write on thread B's LSA.
pub struct Registry {
    buckets: SpinNoSignalLock<[Bucket; REGISTRY_BUCKETS]>,
}

impl Registry {
    pub fn new() -> Self {
        Self {
            buckets: SpinNoSignalLock::new(std::array::from_fn(|_| Vec::new())),
        }
    }

    /// True if `tid` currently owns an LSA.
    pub fn exists(&self, tid: ThreadId) -> bool {
        let buckets = self.buckets.lock();
        buckets[bucket_index(tid)].iter().any(|(t, _)| *t == tid)
    }

    /// Returns a stable handle to `tid`'s LSA, valid until the next
    /// `remove(tid)`.
    pub fn fetch(&self, tid: ThreadId) -> Option<ShareMutex<Lsa>> {
        let buckets = self.buckets.lock();
        buckets[bucket_index(tid)]
            .iter()
            .find(|(t, _)| *t == tid)
            .map(|(_, lsa)| lsa.clone())
    }

    /// Inserts a fresh LSA for `tid`. The caller guarantees no entry for
    /// `tid` already exists.
    pub fn insert(&self, tid: ThreadId, lsa: Lsa) {
        let mut buckets = self.buckets.lock();
        debug_assert!(
            !buckets[bucket_index(tid)].iter().any(|(t, _)| *t == tid),
            "registry::insert called with an existing entry for {tid:?}"
        );
        buckets[bucket_index(tid)].push((tid, new_share_mutex(lsa)));
    }

    /// Removes `tid`'s entry, if any. A no-op if absent.
    pub fn remove(&self, tid: ThreadId) {
        let mut buckets = self.buckets.lock();
        let bucket = &mut buckets[bucket_index(tid)];
        bucket.retain(|(t, _)| *t != tid);
    }

    /// Scans every LSA's every page for one whose base address is
    /// `page_aligned_addr`, which must already be page-aligned.
    ///
    /// Called from the fault router's signal handler: holds the outer lock
    /// for the scan's duration (no allocation occurs along this path) and
    /// takes each LSA's inner lock in turn, so it can never observe a page
    /// array mid-COW-swap.
    pub fn scan_for_page(&self, page_aligned_addr: usize) -> bool {
        let buckets = self.buckets.lock();
        for bucket in buckets.iter() {
            for (_, lsa_lock) in bucket.iter() {
                let lsa = lsa_lock.lock();
                if lsa
                    .pages
                    .iter()
                    .any(|p: &page::PageHandle| page_matches(p, page_aligned_addr))
                {
                    return true;
                }
            }
        }
        false
    }
}

fn page_matches(page: &Page, page_aligned_addr: usize) -> bool {
    page.matches_faulting_page(page_aligned_addr)
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

fn bucket_index(tid: ThreadId) -> usize {
    let mut hasher = DefaultHasher::new();
    tid.hash(&mut hasher);
    (hasher.finish() as usize) % REGISTRY_BUCKETS
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lsa_for(tid: ThreadId) -> Lsa {
        Lsa {
            owner: tid,
            size: 4096,
            pages: vec![std::sync::Arc::new(Page::new(4096).unwrap())],
        }
    }

    #[test]
    fn insert_fetch_remove_round_trip() {
        let registry = Registry::new();
        let tid = std::thread::current().id();
        assert!(!registry.exists(tid));

        registry.insert(tid, lsa_for(tid));
        assert!(registry.exists(tid));
        assert!(registry.fetch(tid).is_some());

        registry.remove(tid);
        assert!(!registry.exists(tid));
        assert!(registry.fetch(tid).is_none());
    }

    #[test]
    fn remove_of_absent_thread_is_a_no_op() {
        let registry = Registry::new();
        registry.remove(std::thread::current().id());
    }

    #[test]
    fn scan_for_page_finds_inserted_pages_only() {
        let registry = Registry::new();
        let tid = std::thread::current().id();
        let lsa = lsa_for(tid);
        let tracked_addr = lsa.pages[0].addr();
        registry.insert(tid, lsa);

        assert!(registry.scan_for_page(tracked_addr));
        assert!(!registry.scan_for_page(tracked_addr.wrapping_add(0x1000_0000)));

        registry.remove(tid);
        assert!(!registry.scan_for_page(tracked_addr));
    }
}
