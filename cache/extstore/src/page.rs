//! Pages: fixed-size regions of the backing file.
//!
//! # State Transition Diagram
//!
//! ```text
//!        +--------+  allocate()   +--------+
//!   +--->|  Free  |-------------->| Active |
//!   |    +--------+               +---+----+
//!   |                                 | written == page_size
//!   |                                 v
//!   |  object_count == 0         +----------+
//!   +----------------------------| Draining |
//!   |  && refcount == 0          +----+-----+
//!   |                                 | evicted under pressure
//!   |                                 v
//!   |  refcount == 0             +----------+
//!   +----------------------------|  Closed  |
//!                                +----------+
//! ```
//!
//! Every field of a page except its id and file offset lives behind the
//! page's own mutex.

use crate::wbuf::WriteBuffer;
use parking_lot::{Mutex, MutexGuard};
use std::collections::VecDeque;

/// Lifecycle state of a page. Exactly one holds at any time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageStatus {
    /// On the free stack.
    Free,
    /// Head of a bucket, accepting new write buffers.
    Active,
    /// Fully written; readable, reclaimed once emptied.
    Draining,
    /// Marked for eviction; reclaimed once no reader holds it.
    Closed,
}

impl PageStatus {
    /// Whether the maintenance loop may reclaim a page in this state.
    #[inline]
    pub fn is_reclaimable(self) -> bool {
        matches!(self, PageStatus::Draining | PageStatus::Closed)
    }
}

/// Point-in-time view of a page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageInfo {
    /// Page id (index into the page array).
    pub id: u32,
    /// Current lifecycle state.
    pub status: PageStatus,
    /// Current version, 0 while free.
    pub version: u64,
    /// Live object estimate.
    pub object_count: u64,
    /// Bytes handed out to write buffers.
    pub allocated: u64,
    /// Bytes flushed to the backing file.
    pub written: u64,
    /// In-flight direct readers.
    pub refcount: u32,
    /// Owning bucket while not free.
    pub bucket: usize,
    /// Write buffers attached and not yet released.
    pub buffers: usize,
}

/// A page slot. The id and file offset never change.
pub(crate) struct Page {
    id: u32,
    offset: u64,
    inner: Mutex<PageInner>,
}

impl Page {
    pub fn new(id: u32, page_size: usize) -> Self {
        Self {
            id,
            offset: id as u64 * page_size as u64,
            inner: Mutex::new(PageInner::default()),
        }
    }

    #[inline]
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Byte offset of this page within the backing file.
    #[inline]
    pub fn offset(&self) -> u64 {
        self.offset
    }

    #[inline]
    pub fn lock(&self) -> MutexGuard<'_, PageInner> {
        self.inner.lock()
    }

    pub fn info(&self) -> PageInfo {
        let inner = self.lock();
        PageInfo {
            id: self.id,
            status: inner.status,
            version: inner.version,
            object_count: inner.object_count,
            allocated: inner.allocated,
            written: inner.written,
            refcount: inner.refcount,
            bucket: inner.bucket,
            buffers: inner.buffer_count(),
        }
    }
}

/// Mutable page state, guarded by the page mutex.
pub(crate) struct PageInner {
    pub status: PageStatus,
    /// Zero while free.
    pub version: u64,
    pub object_count: u64,
    /// Bytes handed out to write buffers.
    pub allocated: u64,
    /// Bytes whose buffers have been flushed and released, in order.
    pub written: u64,
    /// In-flight readers holding a direct file reference.
    pub refcount: u32,
    pub bucket: usize,
    /// Buffers not yet released, oldest first. The tail is the current
    /// buffer unless it is full.
    buffers: VecDeque<WriteBuffer>,
}

impl Default for PageInner {
    fn default() -> Self {
        Self {
            status: PageStatus::Free,
            version: 0,
            object_count: 0,
            allocated: 0,
            written: 0,
            refcount: 0,
            bucket: 0,
            buffers: VecDeque::new(),
        }
    }
}

impl PageInner {
    /// Transition Free -> Active for the given bucket and version.
    pub fn activate(&mut self, bucket: usize, version: u64) {
        debug_assert_eq!(self.status, PageStatus::Free);
        debug_assert!(self.buffers.is_empty());
        self.status = PageStatus::Active;
        self.version = version;
        self.bucket = bucket;
        self.object_count = 0;
        self.allocated = 0;
        self.written = 0;
    }

    /// Return to the Free state, zeroing counters.
    pub fn reset(&mut self) {
        debug_assert_eq!(self.refcount, 0);
        debug_assert!(self.buffers.is_empty());
        self.status = PageStatus::Free;
        self.version = 0;
        self.object_count = 0;
        self.allocated = 0;
        self.written = 0;
        self.bucket = 0;
    }

    /// The tail buffer, if it still accepts appends.
    pub fn current_buffer(&mut self) -> Option<&mut WriteBuffer> {
        self.buffers.back_mut().filter(|b| !b.is_full())
    }

    /// Whether another buffer can be attached without exceeding the page.
    pub fn has_capacity(&self, buffer_size: usize, page_size: usize) -> bool {
        self.allocated + buffer_size as u64 <= page_size as u64
    }

    /// Append a buffer to the tail of the chain at the `allocated` cursor.
    pub fn attach(&mut self, mut buffer: WriteBuffer) {
        buffer.attach(self.allocated);
        self.allocated += buffer.size() as u64;
        self.buffers.push_back(buffer);
    }

    /// Number of buffers not yet released.
    pub fn buffer_count(&self) -> usize {
        self.buffers.len()
    }

    /// Mark a buffer flushed, then release every flushed buffer at the head
    /// of the chain, advancing `written` by each buffer's size.
    ///
    /// Buffers flushed out of order stay in the chain until every buffer in
    /// front of them is flushed, so `written` only moves forward.
    pub fn complete_flush(&mut self, buffer_id: usize) -> Vec<WriteBuffer> {
        if let Some(buffer) = self.buffers.iter_mut().find(|b| b.id() == buffer_id) {
            buffer.mark_flushed();
        }

        let mut released = Vec::new();
        while self.buffers.front().is_some_and(|b| b.is_flushed()) {
            if let Some(buffer) = self.buffers.pop_front() {
                self.written += buffer.size() as u64;
                released.push(buffer);
            }
        }
        released
    }

    /// Copy bytes for a range that is still buffered in memory.
    pub fn read_buffered(&self, offset: u64, dst: &mut [u8]) -> bool {
        self.buffers
            .iter()
            .find(|b| b.contains(offset))
            .is_some_and(|b| b.read_at(offset, dst))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BUF: usize = 16;
    const PAGE: usize = 64;

    fn active_page() -> Page {
        let page = Page::new(3, PAGE);
        page.lock().activate(1, 7);
        page
    }

    #[test]
    fn test_page_offset() {
        let page = Page::new(3, PAGE);
        assert_eq!(page.id(), 3);
        assert_eq!(page.offset(), 192);
        assert_eq!(page.info().status, PageStatus::Free);
        assert_eq!(page.info().version, 0);
    }

    #[test]
    fn test_activate_and_reset() {
        let page = active_page();
        let info = page.info();
        assert_eq!(info.status, PageStatus::Active);
        assert_eq!(info.version, 7);
        assert_eq!(info.bucket, 1);

        page.lock().status = PageStatus::Draining;
        page.lock().reset();
        let info = page.info();
        assert_eq!(info.status, PageStatus::Free);
        assert_eq!(info.version, 0);
        assert_eq!(info.allocated, 0);
    }

    #[test]
    fn test_attach_advances_allocated() {
        let page = active_page();
        let mut inner = page.lock();
        assert!(inner.current_buffer().is_none());

        inner.attach(WriteBuffer::new(0, BUF));
        inner.attach(WriteBuffer::new(1, BUF));
        assert_eq!(inner.allocated, 32);
        assert_eq!(inner.buffer_count(), 2);
        assert_eq!(inner.current_buffer().map(|b| b.offset()), Some(16));
        assert!(inner.has_capacity(BUF, PAGE));

        inner.attach(WriteBuffer::new(2, BUF));
        inner.attach(WriteBuffer::new(3, BUF));
        assert!(!inner.has_capacity(BUF, PAGE));
    }

    #[test]
    fn test_flush_releases_in_order() {
        let page = active_page();
        let mut inner = page.lock();
        inner.attach(WriteBuffer::new(0, BUF));
        inner.attach(WriteBuffer::new(1, BUF));

        // second buffer flushed first: nothing released, written unchanged
        let released = inner.complete_flush(1);
        assert!(released.is_empty());
        assert_eq!(inner.written, 0);

        let released = inner.complete_flush(0);
        assert_eq!(released.len(), 2);
        assert_eq!(released[0].id(), 0);
        assert_eq!(released[1].id(), 1);
        assert_eq!(inner.written, 32);
        assert_eq!(inner.buffer_count(), 0);
    }

    #[test]
    fn test_read_buffered() {
        let page = active_page();
        let mut inner = page.lock();
        inner.attach(WriteBuffer::new(0, BUF));
        let first = inner.current_buffer().unwrap().append(b"abcd").unwrap();
        inner.current_buffer().unwrap().seal();
        inner.attach(WriteBuffer::new(1, BUF));
        let second = inner.current_buffer().unwrap().append(b"efgh").unwrap();

        assert_eq!(first, 0);
        assert_eq!(second, 16);

        let mut out = [0u8; 4];
        assert!(inner.read_buffered(second, &mut out));
        assert_eq!(&out, b"efgh");
        assert!(inner.read_buffered(first, &mut out));
        assert_eq!(&out, b"abcd");
        assert!(!inner.read_buffered(40, &mut out));
    }

    #[test]
    fn test_reclaimable() {
        assert!(!PageStatus::Free.is_reclaimable());
        assert!(!PageStatus::Active.is_reclaimable());
        assert!(PageStatus::Draining.is_reclaimable());
        assert!(PageStatus::Closed.is_reclaimable());
    }
}
