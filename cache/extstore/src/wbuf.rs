//! Write buffers and the engine-wide buffer pool.
//!
//! A [`WriteBuffer`] stages objects destined for one page. Buffers are
//! allocated once at startup and cycle between the [`BufferPool`] (idle)
//! and exactly one page's in-flight chain (attached). Once a buffer is
//! sealed, its bytes are shared with the IO worker that flushes it; the
//! buffer only returns to the pool after that worker has dropped its share.

use std::sync::Arc;

/// A fixed-capacity staging buffer.
pub(crate) struct WriteBuffer {
    /// Stable buffer index.
    id: usize,
    /// Backing memory. Uniquely owned except while a flush is in flight.
    data: Arc<[u8]>,
    /// Bytes written so far.
    used: usize,
    /// Offset of the first byte of this buffer within its page.
    offset: u64,
    /// No more appends; queued for flush.
    full: bool,
    /// Contents have been written to the backing file.
    flushed: bool,
}

impl WriteBuffer {
    /// Allocate a zeroed buffer of `size` bytes.
    pub fn new(id: usize, size: usize) -> Self {
        Self {
            id,
            data: Arc::from(vec![0u8; size]),
            used: 0,
            offset: 0,
            full: false,
            flushed: false,
        }
    }

    #[inline]
    pub fn id(&self) -> usize {
        self.id
    }

    #[inline]
    pub fn size(&self) -> usize {
        self.data.len()
    }

    #[inline]
    pub fn used(&self) -> usize {
        self.used
    }

    #[inline]
    pub fn free(&self) -> usize {
        self.size() - self.used
    }

    #[inline]
    pub fn offset(&self) -> u64 {
        self.offset
    }

    #[inline]
    pub fn is_full(&self) -> bool {
        self.full
    }

    #[inline]
    pub fn is_flushed(&self) -> bool {
        self.flushed
    }

    /// Whether `len` more bytes can be appended.
    #[inline]
    pub fn fits(&self, len: usize) -> bool {
        !self.full && self.free() >= len
    }

    /// Whether the page offset falls inside this buffer's page range.
    #[inline]
    pub fn contains(&self, offset: u64) -> bool {
        offset >= self.offset && offset < self.offset + self.size() as u64
    }

    /// Bind the buffer to a page position, clearing any previous state.
    pub fn attach(&mut self, offset: u64) {
        self.offset = offset;
        self.used = 0;
        self.full = false;
        self.flushed = false;
    }

    /// Append bytes, returning their offset within the page.
    ///
    /// Returns `None` if the buffer is sealed, lacks space, or its memory is
    /// still shared with a flush.
    pub fn append(&mut self, bytes: &[u8]) -> Option<u64> {
        if !self.fits(bytes.len()) {
            return None;
        }
        let start = self.used;
        let data = Arc::get_mut(&mut self.data)?;
        data[start..start + bytes.len()].copy_from_slice(bytes);
        self.used += bytes.len();
        Some(self.offset + start as u64)
    }

    /// Mark the buffer full and hand out a shared view of its bytes.
    pub fn seal(&mut self) -> Arc<[u8]> {
        self.full = true;
        self.data.clone()
    }

    /// Record that the contents reached the backing file.
    pub fn mark_flushed(&mut self) {
        self.flushed = true;
    }

    /// Copy `dst.len()` bytes starting at page offset `offset`.
    ///
    /// Returns `false` if the range is not covered by bytes already written
    /// into this buffer.
    pub fn read_at(&self, offset: u64, dst: &mut [u8]) -> bool {
        if offset < self.offset {
            return false;
        }
        let start = (offset - self.offset) as usize;
        let Some(end) = start.checked_add(dst.len()) else {
            return false;
        };
        if end > self.used {
            return false;
        }
        dst.copy_from_slice(&self.data[start..end]);
        true
    }
}

/// Free stack of idle write buffers.
pub(crate) struct BufferPool {
    free: Vec<WriteBuffer>,
    capacity: usize,
}

impl BufferPool {
    /// Allocate `count` buffers of `size` bytes each.
    pub fn new(count: usize, size: usize) -> Self {
        let free = (0..count).map(|id| WriteBuffer::new(id, size)).collect();
        Self {
            free,
            capacity: count,
        }
    }

    /// Pop an idle buffer, if any.
    pub fn acquire(&mut self) -> Option<WriteBuffer> {
        self.free.pop()
    }

    /// Return a flushed buffer to the pool.
    pub fn release(&mut self, buffer: WriteBuffer) {
        debug_assert!(buffer.is_flushed());
        self.free.push(buffer);
    }

    pub fn free_count(&self) -> usize {
        self.free.len()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_append_and_read() {
        let mut buf = WriteBuffer::new(0, 64);
        buf.attach(128);

        assert_eq!(buf.append(b"hello"), Some(128));
        assert_eq!(buf.append(b"world"), Some(133));
        assert_eq!(buf.used(), 10);
        assert_eq!(buf.free(), 54);

        let mut out = [0u8; 5];
        assert!(buf.read_at(133, &mut out));
        assert_eq!(&out, b"world");

        // past the written bytes
        let mut out = [0u8; 8];
        assert!(!buf.read_at(135, &mut out));
        assert!(!buf.read_at(100, &mut out));
    }

    #[test]
    fn test_append_respects_capacity() {
        let mut buf = WriteBuffer::new(0, 8);
        buf.attach(0);
        assert!(buf.append(&[1u8; 6]).is_some());
        assert!(!buf.fits(3));
        assert!(buf.append(&[1u8; 3]).is_none());
        assert!(buf.append(&[1u8; 2]).is_some());
        assert_eq!(buf.free(), 0);
    }

    #[test]
    fn test_sealed_buffer_rejects_appends() {
        let mut buf = WriteBuffer::new(0, 16);
        buf.attach(0);
        buf.append(b"abc");
        let shared = buf.seal();
        assert!(buf.is_full());
        assert_eq!(&shared[..3], b"abc");
        assert!(buf.append(b"d").is_none());

        // once the flush share is dropped and the buffer is recycled, it is
        // writable again
        drop(shared);
        buf.mark_flushed();
        buf.attach(16);
        assert!(!buf.is_flushed());
        assert_eq!(buf.append(b"d"), Some(16));
    }

    #[test]
    fn test_append_while_shared() {
        let mut buf = WriteBuffer::new(0, 16);
        buf.attach(0);
        let shared = buf.data.clone();
        assert!(buf.append(b"x").is_none());
        drop(shared);
        assert!(buf.append(b"x").is_some());
    }

    #[test]
    fn test_contains() {
        let mut buf = WriteBuffer::new(0, 16);
        buf.attach(32);
        assert!(buf.contains(32));
        assert!(buf.contains(47));
        assert!(!buf.contains(48));
        assert!(!buf.contains(31));
    }

    #[test]
    fn test_pool() {
        let mut pool = BufferPool::new(2, 16);
        assert_eq!(pool.free_count(), 2);
        assert_eq!(pool.capacity(), 2);

        let mut a = pool.acquire().unwrap();
        let _b = pool.acquire().unwrap();
        assert!(pool.acquire().is_none());

        a.mark_flushed();
        pool.release(a);
        assert_eq!(pool.free_count(), 1);
    }
}
