//! Page allocation: the free stack, bucket chains, and version counter.
//!
//! [`PageTable`] lives inside the engine-wide mutex. Page state lives
//! behind each page's own mutex. The two locks are only ever nested as
//! page-then-engine, so allocation peeks a free candidate, drops the engine
//! lock, locks the candidate page, and only then re-takes the engine lock to
//! claim it. The page is activated before either lock is released, so no
//! one can observe a linked page that is still Free.

use crate::engine::Shared;
use crate::error::{ExtstoreError, Result};
use crate::metrics;
use crate::page::{Page, PageInner, PageStatus};
use tracing::debug;

/// Maintenance runs its scan when the free page count is at or below this.
pub const LOW_WATER: usize = 2;

/// Version 0 marks a freed page.
const FIRST_VERSION: u64 = 1;

/// Free stack and bucket chains, guarded by the engine lock.
pub(crate) struct PageTable {
    /// Free page ids; the next page to hand out is at the end.
    free: Vec<u32>,
    /// Per-bucket chains of pages, oldest first. The last entry is the
    /// bucket's head.
    buckets: Vec<Vec<u32>>,
    next_version: u64,
}

impl PageTable {
    pub fn new(page_count: usize, bucket_count: usize) -> Self {
        Self {
            free: (0..page_count as u32).rev().collect(),
            buckets: vec![Vec::new(); bucket_count],
            next_version: FIRST_VERSION,
        }
    }

    /// Newest page linked into the bucket.
    pub fn head(&self, bucket: usize) -> Option<u32> {
        self.buckets.get(bucket).and_then(|chain| chain.last().copied())
    }

    /// Pages linked into the bucket, oldest first.
    #[cfg(test)]
    pub fn chain(&self, bucket: usize) -> &[u32] {
        self.buckets.get(bucket).map(Vec::as_slice).unwrap_or(&[])
    }

    /// The page the next allocation will hand out.
    pub fn peek_free(&self) -> Option<u32> {
        self.free.last().copied()
    }

    pub fn free_count(&self) -> usize {
        self.free.len()
    }

    /// Pop a free page, link it as the bucket's new head, and assign it
    /// the next version.
    pub fn take(&mut self, bucket: usize) -> Option<(u32, u64)> {
        let page_id = self.free.pop()?;
        self.buckets[bucket].push(page_id);
        let version = self.next_version;
        self.next_version += 1;
        Some((page_id, version))
    }

    /// Unlink a page from its bucket chain and push it on the free stack.
    pub fn release(&mut self, page_id: u32, bucket: usize) {
        if let Some(chain) = self.buckets.get_mut(bucket)
            && let Some(pos) = chain.iter().position(|&id| id == page_id)
        {
            chain.remove(pos);
        }
        self.free.push(page_id);
    }
}

/// Allocate a new head page for `bucket`.
///
/// `stale` is the head the caller found unusable (or `None` if the bucket
/// had no page). If another writer already replaced it with an Active page,
/// that page is returned instead of allocating a second one. A head that is
/// no longer Active is treated as stale too.
///
/// Returns `NoFreePage` after signaling maintenance if the free stack is
/// empty.
pub(crate) fn allocate(shared: &Shared, bucket: usize, stale: Option<u32>) -> Result<u32> {
    let mut stale = stale;
    loop {
        let (head, candidate) = {
            let state = shared.state.lock();
            (state.table.head(bucket), state.table.peek_free())
        };

        if let Some(head) = head
            && Some(head) != stale
        {
            if is_active_head(shared, head, bucket) {
                return Ok(head);
            }
            stale = Some(head);
            continue;
        }

        let Some(candidate) = candidate else {
            debug!(bucket, "no free page");
            shared.maint.wake();
            return Err(ExtstoreError::NoFreePage);
        };

        let page = &shared.pages[candidate as usize];
        let mut inner = page.lock();
        let mut state = shared.state.lock();

        // the bucket or the free stack changed while unlocked; look again
        if state.table.head(bucket) != head || state.table.peek_free() != Some(candidate) {
            continue;
        }

        let Some((page_id, version)) = state.table.take(bucket) else {
            continue;
        };
        let free = state.table.free_count();
        drop(state);

        inner.activate(bucket, version);
        drop(inner);

        metrics::PAGES_ALLOCATED.increment();
        metrics::PAGES_FREE.set(free as i64);
        debug!(page_id, bucket, version, free, "allocated page");

        if free <= LOW_WATER {
            shared.maint.wake();
        }

        return Ok(page_id);
    }
}

fn is_active_head(shared: &Shared, page_id: u32, bucket: usize) -> bool {
    let inner = shared.pages[page_id as usize].lock();
    inner.status == PageStatus::Active && inner.bucket == bucket
}

/// Return a drained page to the free stack.
///
/// Called with the page locked, no readers, and the page Draining or Closed.
pub(crate) fn free_page(shared: &Shared, page: &Page, inner: &mut PageInner) {
    debug_assert!(inner.status.is_reclaimable());
    debug_assert_eq!(inner.refcount, 0);

    let free = {
        let mut state = shared.state.lock();
        state.table.release(page.id(), inner.bucket);
        state.table.free_count()
    };

    let was_closed = inner.status == PageStatus::Closed;
    let objects = inner.object_count;
    inner.reset();

    metrics::PAGES_FREED.increment();
    metrics::PAGES_FREE.set(free as i64);
    debug!(page_id = page.id(), was_closed, objects, free, "freed page");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ALIGNMENT, ExtstoreConfig};

    fn shared(page_count: usize) -> Shared {
        let config = ExtstoreConfig::new()
            .page_size(2 * ALIGNMENT)
            .write_buffer_size(ALIGNMENT)
            .page_count(page_count)
            .bucket_count(1)
            .write_buffer_count(2);
        Shared::new(config, tempfile::tempfile().unwrap())
    }

    #[test]
    fn test_initial_state() {
        let table = PageTable::new(4, 2);
        assert_eq!(table.free_count(), 4);
        assert_eq!(table.peek_free(), Some(0));
        assert_eq!(table.head(0), None);
        assert_eq!(table.head(5), None);
    }

    #[test]
    fn test_take_links_new_head() {
        let mut table = PageTable::new(4, 2);
        assert_eq!(table.take(0), Some((0, 1)));
        assert_eq!(table.take(0), Some((1, 2)));
        assert_eq!(table.take(1), Some((2, 3)));

        assert_eq!(table.head(0), Some(1));
        assert_eq!(table.chain(0), &[0, 1]);
        assert_eq!(table.head(1), Some(2));
        assert_eq!(table.free_count(), 1);
    }

    #[test]
    fn test_take_exhausted() {
        let mut table = PageTable::new(1, 1);
        assert!(table.take(0).is_some());
        assert!(table.take(0).is_none());
        assert_eq!(table.peek_free(), None);
    }

    #[test]
    fn test_release_unlinks() {
        let mut table = PageTable::new(3, 1);
        table.take(0);
        table.take(0);
        table.take(0);
        assert_eq!(table.chain(0), &[0, 1, 2]);

        // unlink from the middle of the chain
        table.release(1, 0);
        assert_eq!(table.chain(0), &[0, 2]);
        assert_eq!(table.peek_free(), Some(1));

        // releasing the head exposes the older page
        table.release(2, 0);
        assert_eq!(table.head(0), Some(0));
        assert_eq!(table.free_count(), 2);
    }

    #[test]
    fn test_versions_strictly_increase_on_reuse() {
        let mut table = PageTable::new(1, 1);
        let (id, v1) = table.take(0).unwrap();
        table.release(id, 0);
        let (id2, v2) = table.take(0).unwrap();
        assert_eq!(id, id2);
        assert!(v2 > v1);
    }

    #[test]
    fn test_allocate_returns_active_head() {
        let shared = shared(3);
        let first = allocate(&shared, 0, None).unwrap();
        // a racing writer already linked a page
        assert_eq!(allocate(&shared, 0, None).unwrap(), first);

        let second = allocate(&shared, 0, Some(first)).unwrap();
        assert_ne!(second, first);
        assert_eq!(allocate(&shared, 0, Some(first)).unwrap(), second);
        assert_eq!(shared.state.lock().table.free_count(), 1);
    }

    #[test]
    fn test_draining_head_is_replaced() {
        let shared = shared(3);
        let old = allocate(&shared, 0, None).unwrap();
        let newer = allocate(&shared, 0, Some(old)).unwrap();
        let freed_version = shared.pages[newer as usize].info().version;

        // the old page is fully written and the newer head gets reclaimed,
        // leaving the draining page at the head of the chain
        shared.pages[old as usize].lock().status = PageStatus::Draining;
        {
            let page = &shared.pages[newer as usize];
            let mut inner = page.lock();
            inner.status = PageStatus::Draining;
            free_page(&shared, page, &mut inner);
        }
        assert_eq!(shared.state.lock().table.head(0), Some(old));

        // a writer that found `newer` full gets a fresh page
        let id = allocate(&shared, 0, Some(newer)).unwrap();
        assert_ne!(id, old);
        let info = shared.pages[id as usize].info();
        assert_eq!(info.status, PageStatus::Active);
        assert!(info.version > freed_version);
        assert_eq!(shared.state.lock().table.head(0), Some(id));
    }

    #[test]
    fn test_allocate_exhausted_wakes_maintenance() {
        let shared = shared(1);
        let only = allocate(&shared, 0, None).unwrap();
        assert!(matches!(
            allocate(&shared, 0, Some(only)),
            Err(ExtstoreError::NoFreePage)
        ));
    }
}
