//! IO worker pool.
//!
//! Each worker owns a flush queue (sealed write buffers) and a request
//! queue (reads and direct writes) behind one mutex and condition variable.
//! Per wake cycle a worker detaches up to `io_batch_depth` items from the
//! head of each queue, flushes first, then services requests, so a read
//! queued after a flush sees the flushed state.

use crate::allocator;
use crate::engine::Shared;
use crate::error::ExtstoreError;
use crate::io::{IoMode, IoRequest, IoResult};
use crate::metrics;
use crate::page::{Page, PageStatus};
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::os::unix::fs::FileExt;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::{debug, error};

/// A sealed write buffer waiting to be written to its page region.
pub(crate) struct FlushJob {
    pub page_id: u32,
    pub buffer_id: usize,
    /// Absolute position in the backing file.
    pub file_offset: u64,
    /// Shared view of the buffer memory; only `len` bytes are occupied.
    pub data: Arc<[u8]>,
    pub len: usize,
}

#[derive(Default)]
struct Queues {
    flush: VecDeque<FlushJob>,
    requests: VecDeque<IoRequest>,
    shutdown: bool,
}

impl Queues {
    fn is_empty(&self) -> bool {
        self.flush.is_empty() && self.requests.is_empty()
    }
}

/// One worker's queues.
pub(crate) struct IoWorker {
    queues: Mutex<Queues>,
    cond: Condvar,
}

impl IoWorker {
    fn new() -> Self {
        Self {
            queues: Mutex::new(Queues::default()),
            cond: Condvar::new(),
        }
    }

    fn push_flush(&self, job: FlushJob) {
        self.queues.lock().flush.push_back(job);
        self.cond.notify_one();
    }

    fn push_requests(&self, requests: impl IntoIterator<Item = IoRequest>) {
        self.queues.lock().requests.extend(requests);
        self.cond.notify_one();
    }

    fn stop(&self) {
        self.queues.lock().shutdown = true;
        self.cond.notify_one();
    }

    /// Block until work is queued, then detach up to `depth` items from each
    /// queue. Returns `None` once stopped and fully drained.
    fn next_batch(&self, depth: usize) -> Option<(Vec<FlushJob>, Vec<IoRequest>)> {
        let mut queues = self.queues.lock();
        while queues.is_empty() {
            if queues.shutdown {
                return None;
            }
            self.cond.wait(&mut queues);
        }

        let n = depth.min(queues.flush.len());
        let flushes = queues.flush.drain(..n).collect();
        let n = depth.min(queues.requests.len());
        let requests = queues.requests.drain(..n).collect();
        Some((flushes, requests))
    }
}

/// Fixed set of workers selected round-robin.
pub(crate) struct WorkerPool {
    workers: Vec<IoWorker>,
    next: AtomicUsize,
}

impl WorkerPool {
    pub fn new(count: usize) -> Self {
        Self {
            workers: (0..count).map(|_| IoWorker::new()).collect(),
            next: AtomicUsize::new(0),
        }
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    fn pick(&self) -> &IoWorker {
        let n = self.next.fetch_add(1, Ordering::Relaxed);
        &self.workers[n % self.workers.len()]
    }

    /// Queue a sealed buffer on the next worker.
    pub fn submit_flush(&self, job: FlushJob) {
        self.pick().push_flush(job);
    }

    /// Queue a chain of requests, in order, on the next worker.
    pub fn submit(&self, requests: impl IntoIterator<Item = IoRequest>) {
        self.pick().push_requests(requests);
    }

    /// Ask every worker to drain its queues and exit.
    pub fn stop(&self) {
        for worker in &self.workers {
            worker.stop();
        }
    }
}

/// Body of worker thread `index`.
pub(crate) fn run(shared: Arc<Shared>, index: usize) {
    let worker = &shared.workers.workers[index];
    let depth = shared.config.io_batch_depth;
    debug!(worker = index, "io worker started");

    while let Some((flushes, requests)) = worker.next_batch(depth) {
        for job in flushes {
            flush(&shared, job);
        }
        for request in requests {
            service(&shared, request);
        }
    }

    debug!(worker = index, "io worker stopped");
}

/// Write a sealed buffer to its page region and release every flushed
/// buffer at the head of the page's chain.
fn flush(shared: &Shared, job: FlushJob) {
    let FlushJob {
        page_id,
        buffer_id,
        file_offset,
        data,
        len,
    } = job;

    if let Err(e) = shared.file.write_all_at(&data[..len], file_offset) {
        // TODO: surface flush failures to readers of the affected range
        metrics::FLUSH_ERRORS.increment();
        error!(page_id, buffer_id, file_offset, error = %e, "write buffer flush failed");
    }
    // the page chain must hold the only reference before the buffer is
    // marked flushed and recycled
    drop(data);

    let page = &shared.pages[page_id as usize];
    let mut inner = page.lock();
    let released = inner.complete_flush(buffer_id);

    if !released.is_empty() {
        let mut state = shared.state.lock();
        for buffer in released {
            state.buffers.release(buffer);
        }
    }

    if inner.status == PageStatus::Active && inner.written >= shared.config.page_size as u64 {
        inner.status = PageStatus::Draining;
        debug!(page_id, version = inner.version, "page fully written");
    }

    metrics::BUFFER_FLUSHES.increment();
}

/// Service one request and invoke its completion exactly once.
fn service(shared: &Shared, mut request: IoRequest) {
    let Some(page) = shared.pages.get(request.page_id as usize) else {
        let err = ExtstoreError::InvalidPage(request.page_id);
        request.complete(Err(err));
        return;
    };

    if !in_bounds(shared, &request) {
        let err = ExtstoreError::InvalidOffset {
            offset: request.offset,
            len: request.len(),
        };
        request.complete(Err(err));
        return;
    }

    let position = page.offset() + request.offset;

    match request.mode {
        IoMode::Write => {
            let result = shared
                .file
                .write_all_at(&request.buf, position)
                .map(|_| request.len())
                .map_err(|e| device_error(page, "write", e));
            request.complete(result);
        }
        IoMode::Read => {
            let _token = match begin_read(shared, page, &mut request) {
                ReadStart::Done(result) => {
                    request.complete(result);
                    return;
                }
                ReadStart::Disk(token) => token,
            };

            let result = shared
                .file
                .read_exact_at(&mut request.buf, position)
                .map(|_| request.len())
                .map_err(|e| device_error(page, "read", e));
            if result.is_ok() {
                metrics::READS_DISK.increment();
            }
            // the token outlives the completion so the page cannot be
            // reclaimed while the caller inspects the result
            request.complete(result);
        }
    }
}

fn in_bounds(shared: &Shared, request: &IoRequest) -> bool {
    request
        .offset
        .checked_add(request.len() as u64)
        .is_some_and(|end| end <= shared.config.page_size as u64)
}

fn device_error(page: &Page, op: &str, e: std::io::Error) -> ExtstoreError {
    metrics::IO_ERRORS.increment();
    error!(page_id = page.id(), op, error = %e, "positioned io failed");
    ExtstoreError::Io(e)
}

enum ReadStart<'a> {
    /// Finished under the page lock (stale, or served from a buffer).
    Done(IoResult),
    /// Must be read from the file while holding the token.
    Disk(ReadToken<'a>),
}

/// Check the version and either copy from the buffer chain or pin the page
/// for a direct file read.
fn begin_read<'a>(shared: &'a Shared, page: &'a Page, request: &mut IoRequest) -> ReadStart<'a> {
    let mut inner = page.lock();

    if inner.version != request.page_version
        || matches!(inner.status, PageStatus::Free | PageStatus::Closed)
    {
        metrics::STALE_VERSION.increment();
        return ReadStart::Done(Err(ExtstoreError::StaleVersion));
    }

    if inner.status == PageStatus::Active && request.offset >= inner.written {
        if inner.read_buffered(request.offset, &mut request.buf) {
            metrics::READS_BUFFERED.increment();
            return ReadStart::Done(Ok(request.len()));
        }
        return ReadStart::Done(Err(ExtstoreError::InvalidOffset {
            offset: request.offset,
            len: request.len(),
        }));
    }

    inner.refcount += 1;
    ReadStart::Disk(ReadToken { shared, page })
}

/// Holds a page's refcount for a direct read. Dropping it releases the
/// reference and frees the page if it was closed in the meantime.
struct ReadToken<'a> {
    shared: &'a Shared,
    page: &'a Page,
}

impl Drop for ReadToken<'_> {
    fn drop(&mut self) {
        let mut inner = self.page.lock();
        inner.refcount -= 1;
        if inner.refcount == 0 && inner.status == PageStatus::Closed {
            allocator::free_page(self.shared, self.page, &mut inner);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ALIGNMENT, ExtstoreConfig};
    use crate::io::ObjectLocation;

    fn shared() -> Shared {
        let config = ExtstoreConfig::new()
            .page_size(2 * ALIGNMENT)
            .write_buffer_size(ALIGNMENT)
            .page_count(2)
            .bucket_count(1)
            .write_buffer_count(2);
        Shared::new(config, tempfile::tempfile().unwrap())
    }

    /// Activate a page whose first buffer holds `buffered` at offset 0 and
    /// whose file region holds `on_disk`.
    fn page_with_copies(shared: &Shared, buffered: &[u8], on_disk: &[u8]) -> ObjectLocation {
        let page_id = allocator::allocate(shared, 0, None).unwrap();
        let buffer = shared.state.lock().buffers.acquire().unwrap();
        let page = &shared.pages[page_id as usize];
        shared.file.write_all_at(on_disk, page.offset()).unwrap();

        let mut inner = page.lock();
        inner.attach(buffer);
        let offset = inner.current_buffer().unwrap().append(buffered).unwrap();
        ObjectLocation {
            page_id,
            page_version: inner.version,
            offset,
            len: buffered.len(),
        }
    }

    #[test]
    fn test_read_above_written_served_from_buffer() {
        let shared = shared();
        let location = page_with_copies(&shared, b"buffered", b"on disk!");
        let page = &shared.pages[location.page_id as usize];

        let mut request = IoRequest::read(location, |_, _| {});
        match begin_read(&shared, page, &mut request) {
            ReadStart::Done(result) => assert_eq!(result.unwrap(), 8),
            ReadStart::Disk(_) => panic!("unflushed range read from the file"),
        }
        assert_eq!(&request.buf, b"buffered");
        assert_eq!(page.info().refcount, 0);
    }

    #[test]
    fn test_read_below_written_goes_to_disk_while_buffer_chained() {
        let shared = shared();
        let location = page_with_copies(&shared, b"buffered", b"on disk!");
        let page = &shared.pages[location.page_id as usize];

        // the watermark passed the object before its buffer left the chain
        page.lock().written = ALIGNMENT as u64;
        assert_eq!(page.info().buffers, 1);

        let mut request = IoRequest::read(location, |_, _| {});
        match begin_read(&shared, page, &mut request) {
            ReadStart::Disk(token) => {
                assert_eq!(page.info().refcount, 1);
                drop(token);
            }
            ReadStart::Done(_) => panic!("flushed range served from the write buffer"),
        }
        assert_eq!(page.info().refcount, 0);

        let (tx, rx) = crossbeam_channel::bounded(1);
        service(
            &shared,
            IoRequest::read(location, move |req, result| {
                tx.send((req.buf, result)).unwrap();
            }),
        );
        let (buf, result) = rx.recv().unwrap();
        assert_eq!(result.unwrap(), 8);
        assert_eq!(&buf, b"on disk!");
        assert_eq!(page.info().refcount, 0);
    }

    #[test]
    fn test_read_with_old_version_is_stale() {
        let shared = shared();
        let mut location = page_with_copies(&shared, b"buffered", b"on disk!");
        location.page_version += 1;
        let page = &shared.pages[location.page_id as usize];

        let mut request = IoRequest::read(location, |_, _| {});
        match begin_read(&shared, page, &mut request) {
            ReadStart::Done(result) => {
                assert!(matches!(result, Err(ExtstoreError::StaleVersion)))
            }
            ReadStart::Disk(_) => panic!("stale read pinned the page"),
        }
        assert_eq!(page.info().refcount, 0);
    }

    #[test]
    fn test_closed_page_freed_by_last_reader() {
        let shared = shared();
        let location = page_with_copies(&shared, b"buffered", b"on disk!");
        let page = &shared.pages[location.page_id as usize];
        {
            let mut inner = page.lock();
            let buffer_id = inner.current_buffer().unwrap().id();
            let released = inner.complete_flush(buffer_id);
            assert_eq!(inner.written, ALIGNMENT as u64);
            drop(inner);
            let mut state = shared.state.lock();
            for buffer in released {
                state.buffers.release(buffer);
            }
        }

        let mut request = IoRequest::read(location, |_, _| {});
        let ReadStart::Disk(token) = begin_read(&shared, page, &mut request) else {
            panic!("flushed range served from memory");
        };
        page.lock().status = PageStatus::Closed;
        drop(token);

        let info = page.info();
        assert_eq!(info.status, PageStatus::Free);
        assert_eq!(info.version, 0);
        assert_eq!(shared.state.lock().table.free_count(), 2);
    }
}
