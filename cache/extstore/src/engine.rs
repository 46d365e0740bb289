//! The engine: write, read, and delete against pages of one backing file.

use crate::allocator::{self, PageTable};
use crate::config::{ExtstoreConfig, format_size};
use crate::error::{ExtstoreError, Result};
use crate::io::{IoRequest, ObjectLocation};
use crate::maint::{self, Maintenance};
use crate::metrics;
use crate::page::{Page, PageInfo, PageStatus};
use crate::wbuf::BufferPool;
use crate::worker::{self, FlushJob, WorkerPool};
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{error, info, warn};

/// State guarded by the engine-wide lock.
///
/// Never lock a page while holding this.
pub(crate) struct EngineState {
    pub table: PageTable,
    pub buffers: BufferPool,
}

/// State shared by the engine handle and its threads.
pub(crate) struct Shared {
    pub config: ExtstoreConfig,
    pub file: File,
    pub pages: Vec<Page>,
    pub state: Mutex<EngineState>,
    pub workers: WorkerPool,
    pub maint: Maintenance,
}

/// Page counts by status and write buffer availability.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EngineStats {
    /// Total pages.
    pub page_count: usize,
    /// Pages on the free stack.
    pub free_pages: usize,
    /// Pages accepting writes.
    pub active_pages: usize,
    /// Fully written pages.
    pub draining_pages: usize,
    /// Pages closed for eviction, waiting on readers.
    pub closed_pages: usize,
    /// Idle write buffers.
    pub free_write_buffers: usize,
    /// Total write buffers.
    pub write_buffer_count: usize,
}

/// Where a write attempt against one page ended up.
enum Placement {
    Written(ObjectLocation),
    /// The page cannot take the object; a replacement head is needed.
    PageFull,
}

/// A disk-backed page store.
///
/// Objects are appended through [`write`](Self::write), fetched
/// asynchronously through [`read`](Self::read), and released with
/// [`delete`](Self::delete). Dropping the engine drains every queued flush
/// and request before its threads exit.
pub struct Engine {
    shared: Arc<Shared>,
    threads: Vec<JoinHandle<()>>,
}

impl Engine {
    /// Validate `config`, create the backing file, and start the worker and
    /// maintenance threads.
    pub fn new(config: ExtstoreConfig) -> Result<Self> {
        config.validate()?;

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&config.path)?;
        file.set_len(config.file_size())?;

        metrics::PAGES_FREE.set(config.page_count as i64);
        let shared = Arc::new(Shared::new(config, file));

        let mut engine = Engine {
            threads: Vec::with_capacity(shared.workers.len() + 1),
            shared,
        };

        // on a spawn failure, dropping `engine` stops what already started
        for index in 0..engine.shared.workers.len() {
            let shared = engine.shared.clone();
            let handle = thread::Builder::new()
                .name(format!("extstore-io-{index}"))
                .spawn(move || worker::run(shared, index))?;
            engine.threads.push(handle);
        }

        let shared = engine.shared.clone();
        let handle = thread::Builder::new()
            .name("extstore-maint".to_string())
            .spawn(move || maint::run(shared))?;
        engine.threads.push(handle);

        let config = &engine.shared.config;
        info!(
            path = %config.path.display(),
            pages = config.page_count,
            page_size = %format_size(config.page_size),
            write_buffers = config.write_buffer_count,
            write_buffer_size = %format_size(config.write_buffer_size),
            buffers_per_page = config.buffers_per_page(),
            buckets = config.bucket_count,
            workers = config.worker_threads,
            "extstore engine started"
        );

        Ok(engine)
    }

    /// The validated configuration.
    pub fn config(&self) -> &ExtstoreConfig {
        &self.shared.config
    }

    /// Append an object to the bucket's active page.
    ///
    /// Returns where the object landed. The bytes are readable immediately,
    /// from the write buffer until it is flushed and from the file after.
    /// Fails with [`NoFreePage`](ExtstoreError::NoFreePage) or
    /// [`NoWriteBuffer`](ExtstoreError::NoWriteBuffer) when space is
    /// exhausted; the caller may retry later.
    pub fn write(&self, bucket: usize, data: &[u8]) -> Result<ObjectLocation> {
        let config = &self.shared.config;
        if bucket >= config.bucket_count {
            return Err(ExtstoreError::InvalidBucket {
                bucket,
                bucket_count: config.bucket_count,
            });
        }
        if data.len() > config.write_buffer_size {
            return Err(ExtstoreError::ObjectTooLarge {
                len: data.len(),
                max: config.write_buffer_size,
            });
        }

        match self.shared.write(bucket, data) {
            Ok(location) => {
                metrics::OBJECTS_WRITTEN.increment();
                metrics::BYTES_WRITTEN.add(data.len() as u64);
                Ok(location)
            }
            Err(e) => {
                if e.is_exhausted() {
                    metrics::WRITE_REJECTED.increment();
                    warn!(bucket, len = data.len(), error = %e, "write rejected");
                }
                Err(e)
            }
        }
    }

    /// Queue a chain of requests on one worker, serviced in order.
    ///
    /// Always accepted. Each request's completion runs exactly once on the
    /// worker thread.
    pub fn submit<I>(&self, requests: I)
    where
        I: IntoIterator<Item = IoRequest>,
    {
        self.shared.workers.submit(requests);
    }

    /// Queue reads (or direct writes); same as [`submit`](Self::submit).
    pub fn read<I>(&self, requests: I)
    where
        I: IntoIterator<Item = IoRequest>,
    {
        self.submit(requests);
    }

    /// Drop `count` objects from a page's live count.
    ///
    /// Fails with [`StaleVersion`](ExtstoreError::StaleVersion) if the page
    /// has been reclaimed since `version` was observed; the objects are gone
    /// and the delete must not be retried.
    pub fn delete(&self, page_id: u32, version: u64, count: u64) -> Result<()> {
        let page = self
            .shared
            .pages
            .get(page_id as usize)
            .ok_or(ExtstoreError::InvalidPage(page_id))?;

        let mut inner = page.lock();
        if inner.version != version || inner.status == PageStatus::Free {
            metrics::STALE_VERSION.increment();
            return Err(ExtstoreError::StaleVersion);
        }

        inner.object_count = inner.object_count.saturating_sub(count);
        let drained = inner.object_count == 0;
        drop(inner);

        metrics::DELETES.increment();
        if drained {
            self.shared.maint.wake();
        }
        Ok(())
    }

    /// Snapshot of page counts and buffer availability.
    pub fn stats(&self) -> EngineStats {
        let mut stats = EngineStats {
            page_count: self.shared.pages.len(),
            ..Default::default()
        };

        for page in &self.shared.pages {
            match page.lock().status {
                PageStatus::Free => stats.free_pages += 1,
                PageStatus::Active => stats.active_pages += 1,
                PageStatus::Draining => stats.draining_pages += 1,
                PageStatus::Closed => stats.closed_pages += 1,
            }
        }
        let state = self.shared.state.lock();
        stats.free_write_buffers = state.buffers.free_count();
        stats.write_buffer_count = state.buffers.capacity();
        stats
    }

    /// Snapshot of one page, or `None` if the id is out of range.
    pub fn page_info(&self, page_id: u32) -> Option<PageInfo> {
        self.shared.pages.get(page_id as usize).map(Page::info)
    }

    /// Drain all queued work and stop every thread.
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        if self.threads.is_empty() {
            return;
        }

        self.shared.workers.stop();
        self.shared.maint.stop();

        // the last handle may be dropped from a completion on a worker
        let current = thread::current().id();
        for handle in self.threads.drain(..) {
            if handle.thread().id() == current {
                continue;
            }
            let name = handle.thread().name().unwrap_or("extstore").to_string();
            if handle.join().is_err() {
                error!(thread = %name, "extstore thread panicked");
            }
        }

        info!("extstore engine stopped");
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.stop();
    }
}

impl Shared {
    /// Page and buffer state for `config` over `file`, with every page free.
    /// No threads are started.
    pub(crate) fn new(config: ExtstoreConfig, file: File) -> Self {
        let pages = (0..config.page_count)
            .map(|id| Page::new(id as u32, config.page_size))
            .collect();
        let state = EngineState {
            table: PageTable::new(config.page_count, config.bucket_count),
            buffers: BufferPool::new(config.write_buffer_count, config.write_buffer_size),
        };
        Self {
            workers: WorkerPool::new(config.worker_threads),
            maint: Maintenance::new(),
            pages,
            state: Mutex::new(state),
            file,
            config,
        }
    }

    /// Place an object on the bucket's head page, replacing the head once
    /// if it is full.
    fn write(&self, bucket: usize, data: &[u8]) -> Result<ObjectLocation> {
        let head = self.state.lock().table.head(bucket);
        let page_id = match head {
            Some(id) => id,
            None => allocator::allocate(self, bucket, None)?,
        };

        if let Placement::Written(location) = self.write_to_page(page_id, bucket, data)? {
            return Ok(location);
        }

        let page_id = allocator::allocate(self, bucket, Some(page_id))?;
        match self.write_to_page(page_id, bucket, data)? {
            Placement::Written(location) => Ok(location),
            // a concurrent writer filled the replacement first
            Placement::PageFull => Err(ExtstoreError::NoFreePage),
        }
    }

    fn write_to_page(&self, page_id: u32, bucket: usize, data: &[u8]) -> Result<Placement> {
        let page = &self.pages[page_id as usize];
        let mut inner = page.lock();

        // the head may have been replaced or reclaimed since it was read
        if inner.status != PageStatus::Active || inner.bucket != bucket {
            return Ok(Placement::PageFull);
        }

        if let Some(buffer) = inner.current_buffer()
            && !buffer.fits(data.len())
        {
            let job = FlushJob {
                page_id,
                buffer_id: buffer.id(),
                file_offset: page.offset() + buffer.offset(),
                len: buffer.used(),
                data: buffer.seal(),
            };
            self.workers.submit_flush(job);
        }

        if inner.current_buffer().is_none() {
            if !inner.has_capacity(self.config.write_buffer_size, self.config.page_size) {
                return Ok(Placement::PageFull);
            }
            let buffer = self
                .state
                .lock()
                .buffers
                .acquire()
                .ok_or(ExtstoreError::NoWriteBuffer)?;
            inner.attach(buffer);
        }

        let offset = inner
            .current_buffer()
            .and_then(|buffer| buffer.append(data))
            .ok_or(ExtstoreError::BufferInFlight)?;
        inner.object_count += 1;

        Ok(Placement::Written(ObjectLocation {
            page_id,
            page_version: inner.version,
            offset,
            len: data.len(),
        }))
    }
}
