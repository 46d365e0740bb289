//! IO request records and completion sinks.

use crate::error::ExtstoreError;

/// Outcome delivered to a completion: bytes transferred or an error.
pub type IoResult = Result<usize, ExtstoreError>;

/// Completion sink, invoked exactly once per request.
pub type Completion = Box<dyn FnOnce(IoRequest, IoResult) + Send + 'static>;

/// Where an object landed, as recorded by [`Engine::write`](crate::Engine::write).
///
/// The caller's index keeps this alongside its key and hands it back for
/// reads and deletes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObjectLocation {
    /// Page holding the object.
    pub page_id: u32,
    /// Version of the page when the object was written.
    pub page_version: u64,
    /// Byte offset of the object within the page.
    pub offset: u64,
    /// Object length in bytes.
    pub len: usize,
}

/// Kind of operation an [`IoRequest`] performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoMode {
    /// Read `buf.len()` bytes into `buf`.
    Read,
    /// Write `buf` directly into the page region.
    Write,
}

/// One read or write against a page region.
///
/// The request owns its buffer; the completion receives the request back
/// so the buffer can be reused.
pub struct IoRequest {
    /// Operation kind.
    pub mode: IoMode,
    /// Target page.
    pub page_id: u32,
    /// Version the caller expects the page to have.
    pub page_version: u64,
    /// Byte offset within the page.
    pub offset: u64,
    /// Destination for reads, payload for writes.
    pub buf: Vec<u8>,
    done: Option<Completion>,
}

impl IoRequest {
    /// Build a read of `location.len` bytes.
    pub fn read<F>(location: ObjectLocation, done: F) -> Self
    where
        F: FnOnce(IoRequest, IoResult) + Send + 'static,
    {
        Self {
            mode: IoMode::Read,
            page_id: location.page_id,
            page_version: location.page_version,
            offset: location.offset,
            buf: vec![0; location.len],
            done: Some(Box::new(done)),
        }
    }

    /// Build a direct positioned write of `data` at `offset` within a page.
    pub fn write<F>(page_id: u32, page_version: u64, offset: u64, data: Vec<u8>, done: F) -> Self
    where
        F: FnOnce(IoRequest, IoResult) + Send + 'static,
    {
        Self {
            mode: IoMode::Write,
            page_id,
            page_version,
            offset,
            buf: data,
            done: Some(Box::new(done)),
        }
    }

    /// Number of bytes this request transfers.
    #[inline]
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    /// Whether the request transfers zero bytes.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Deliver the outcome. Consumes the request.
    pub(crate) fn complete(mut self, result: IoResult) {
        if let Some(done) = self.done.take() {
            done(self, result);
        }
    }
}

impl std::fmt::Debug for IoRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IoRequest")
            .field("mode", &self.mode)
            .field("page_id", &self.page_id)
            .field("page_version", &self.page_version)
            .field("offset", &self.offset)
            .field("len", &self.buf.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn location() -> ObjectLocation {
        ObjectLocation {
            page_id: 2,
            page_version: 5,
            offset: 4096,
            len: 10,
        }
    }

    #[test]
    fn test_read_request() {
        let req = IoRequest::read(location(), |_, _| {});
        assert_eq!(req.mode, IoMode::Read);
        assert_eq!(req.page_id, 2);
        assert_eq!(req.page_version, 5);
        assert_eq!(req.offset, 4096);
        assert_eq!(req.len(), 10);
        assert!(!req.is_empty());
    }

    #[test]
    fn test_complete_invokes_once() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let req = IoRequest::write(1, 1, 0, b"abc".to_vec(), move |req, result| {
            assert_eq!(req.buf, b"abc");
            assert_eq!(result.unwrap(), 3);
            counter.fetch_add(1, Ordering::SeqCst);
        });
        req.complete(Ok(3));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_debug_omits_payload() {
        let req = IoRequest::write(1, 1, 0, vec![0xAB; 64], |_, _| {});
        let debug = format!("{:?}", req);
        assert!(debug.contains("len: 64"));
        assert!(!debug.contains("171"));
    }
}
