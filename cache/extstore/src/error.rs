//! Error types for extstore operations.

use thiserror::Error;

/// Result type for extstore operations.
pub type Result<T> = std::result::Result<T, ExtstoreError>;

/// Errors that can occur while configuring or using the engine.
#[derive(Debug, Error)]
pub enum ExtstoreError {
    /// The configuration violates a size or ratio constraint.
    #[error("configuration error: {0}")]
    Config(String),

    /// A positioned read or write against the backing file failed.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// No free page is available. Maintenance has been signaled.
    #[error("no free page available")]
    NoFreePage,

    /// No free write buffer is available.
    #[error("no free write buffer available")]
    NoWriteBuffer,

    /// The page was reclaimed or reused since the caller observed it.
    #[error("stale page version")]
    StaleVersion,

    /// The bucket index is out of range.
    #[error("invalid bucket {bucket} (bucket count {bucket_count})")]
    InvalidBucket {
        /// Requested bucket.
        bucket: usize,
        /// Number of configured buckets.
        bucket_count: usize,
    },

    /// The object does not fit in a single write buffer.
    #[error("object too large: {len} bytes (max {max})")]
    ObjectTooLarge {
        /// Object length.
        len: usize,
        /// Write buffer size.
        max: usize,
    },

    /// The page id is out of range.
    #[error("invalid page id {0}")]
    InvalidPage(u32),

    /// The requested range does not lie within a page.
    #[error("invalid range: offset {offset} len {len}")]
    InvalidOffset {
        /// Offset within the page.
        offset: u64,
        /// Length of the range.
        len: usize,
    },

    /// The current write buffer is still shared with an in-flight flush.
    #[error("write buffer still in flight")]
    BufferInFlight,
}

impl ExtstoreError {
    /// Numeric status code as reported through completion sinks.
    ///
    /// `StaleVersion` is distinct so callers can tell reclaimed data apart
    /// from every other failure.
    pub fn code(&self) -> i32 {
        match self {
            Self::StaleVersion => -2,
            _ => -1,
        }
    }

    /// Whether the write was rejected for lack of pages or buffers and may
    /// succeed if retried later.
    pub fn is_exhausted(&self) -> bool {
        matches!(self, Self::NoFreePage | Self::NoWriteBuffer)
    }
}
