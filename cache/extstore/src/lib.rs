//! extstore: a disk-backed page store for extending an in-memory cache.
//!
//! Callers append serialized objects to append-only pages of a single
//! backing file and later fetch them back by `(page id, version, offset)`.
//! The key index lives outside this crate; the engine only hands out and
//! honors [`ObjectLocation`]s.
//!
//! - **Pages**: fixed-size regions of the file, cycling
//!   Free -> Active -> Draining -> Closed -> Free
//! - **Write buffers**: a fixed pool of staging buffers attached to pages
//!   and flushed by IO workers
//! - **Buckets**: logical partitions, each appending to its own head page
//! - **IO workers**: threads servicing flushes and read requests
//! - **Maintenance**: a thread reclaiming emptied pages and evicting the
//!   least populated page when space runs out
//!
//! # Architecture
//!
//! ```text
//!   write(bucket, bytes)          read([IoRequest])        delete(page, version)
//!          |                             |                          |
//!          v                             v                          v
//!   +-------------+   sealed     +----------------+        +----------------+
//!   |  head page  |------------->|   IO workers   |        |  object_count  |
//!   |  + buffers  |   buffers    | flush, request |        |   reaches 0    |
//!   +------+------+              +-------+--------+        +-------+--------+
//!          | no free page                | positioned io           | wake
//!          v                             v                         v
//!   +-------------+              +----------------+        +----------------+
//!   | free stack  |<-------------|  backing file  |        |  maintenance   |
//!   +-------------+   reclaim    +----------------+        +----------------+
//! ```
//!
//! # Example
//!
//! ```no_run
//! use extstore::{Engine, ExtstoreConfig, IoRequest};
//!
//! let engine = Engine::new(ExtstoreConfig::new().path("/tmp/extstore.dat"))?;
//!
//! let location = engine.write(0, b"serialized item")?;
//! engine.read([IoRequest::read(location, |req, result| {
//!     if let Ok(n) = result {
//!         assert_eq!(&req.buf[..n], b"serialized item");
//!     }
//! })]);
//!
//! engine.delete(location.page_id, location.page_version, 1)?;
//! engine.shutdown();
//! # Ok::<(), extstore::ExtstoreError>(())
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

mod allocator;
mod config;
mod engine;
mod error;
mod io;
mod maint;
mod metrics;
mod page;
mod wbuf;
mod worker;

pub use allocator::LOW_WATER;
pub use config::{ALIGNMENT, ExtstoreConfig, format_size, parse_size};
pub use engine::{Engine, EngineStats};
pub use error::{ExtstoreError, Result};
pub use io::{Completion, IoMode, IoRequest, IoResult, ObjectLocation};
pub use page::{PageInfo, PageStatus};
