//! Engine metrics.

use metriken::{Counter, Gauge, metric};

// Write path
#[metric(
    name = "extstore_objects_written",
    description = "Objects copied into write buffers"
)]
pub static OBJECTS_WRITTEN: Counter = Counter::new();

#[metric(
    name = "extstore_bytes_written",
    description = "Object bytes copied into write buffers"
)]
pub static BYTES_WRITTEN: Counter = Counter::new();

#[metric(
    name = "extstore_write_rejected",
    description = "Writes rejected for lack of pages or write buffers"
)]
pub static WRITE_REJECTED: Counter = Counter::new();

// Pages
#[metric(name = "extstore_pages_allocated", description = "Pages moved Free -> Active")]
pub static PAGES_ALLOCATED: Counter = Counter::new();

#[metric(name = "extstore_pages_freed", description = "Pages returned to the free stack")]
pub static PAGES_FREED: Counter = Counter::new();

#[metric(
    name = "extstore_pages_evicted",
    description = "Pages closed by the maintenance loop under pressure"
)]
pub static PAGES_EVICTED: Counter = Counter::new();

#[metric(name = "extstore_pages_free", description = "Pages on the free stack")]
pub static PAGES_FREE: Gauge = Gauge::new();

// Flushes
#[metric(name = "extstore_buffer_flushes", description = "Write buffers flushed")]
pub static BUFFER_FLUSHES: Counter = Counter::new();

#[metric(
    name = "extstore_flush_errors",
    description = "Write buffer flushes that failed"
)]
pub static FLUSH_ERRORS: Counter = Counter::new();

// Requests
#[metric(
    name = "extstore_reads_buffered",
    description = "Reads served from in-flight write buffers"
)]
pub static READS_BUFFERED: Counter = Counter::new();

#[metric(name = "extstore_reads_disk", description = "Reads served from the backing file")]
pub static READS_DISK: Counter = Counter::new();

#[metric(
    name = "extstore_io_errors",
    description = "Requests that failed with a device error"
)]
pub static IO_ERRORS: Counter = Counter::new();

#[metric(
    name = "extstore_stale_version",
    description = "Reads or deletes against a reclaimed page"
)]
pub static STALE_VERSION: Counter = Counter::new();

#[metric(name = "extstore_deletes", description = "Delete notifications applied")]
pub static DELETES: Counter = Counter::new();

// Maintenance
#[metric(name = "extstore_maint_passes", description = "Maintenance scans performed")]
pub static MAINT_PASSES: Counter = Counter::new();
