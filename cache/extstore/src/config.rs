//! Engine configuration.

use crate::error::{ExtstoreError, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Alignment unit for pages and write buffers (flash erase block).
pub const ALIGNMENT: usize = 2 * 1024 * 1024;

/// Configuration for the disk-backed page store.
///
/// The value is consumed once by [`Engine::new`](crate::Engine::new) and
/// validated before any file or thread is created.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ExtstoreConfig {
    /// Path to the backing file. Truncated on startup.
    #[serde(default = "default_path")]
    pub path: PathBuf,

    /// Size of each page in bytes.
    #[serde(default = "default_page_size", deserialize_with = "deserialize_size")]
    pub page_size: usize,

    /// Size of each write buffer in bytes.
    #[serde(
        default = "default_write_buffer_size",
        deserialize_with = "deserialize_size"
    )]
    pub write_buffer_size: usize,

    /// Number of pages in the backing file.
    #[serde(default = "default_page_count")]
    pub page_count: usize,

    /// Number of logical buckets, each owning at most one active page.
    #[serde(default = "default_bucket_count")]
    pub bucket_count: usize,

    /// Number of write buffers in the pool.
    #[serde(default = "default_write_buffer_count")]
    pub write_buffer_count: usize,

    /// Number of IO worker threads.
    #[serde(default = "default_worker_threads")]
    pub worker_threads: usize,

    /// Maximum items a worker pulls from each queue per wake.
    #[serde(default = "default_io_batch_depth")]
    pub io_batch_depth: usize,
}

impl Default for ExtstoreConfig {
    fn default() -> Self {
        Self {
            path: default_path(),
            page_size: default_page_size(),
            write_buffer_size: default_write_buffer_size(),
            page_count: default_page_count(),
            bucket_count: default_bucket_count(),
            write_buffer_count: default_write_buffer_count(),
            worker_threads: default_worker_threads(),
            io_batch_depth: default_io_batch_depth(),
        }
    }
}

impl ExtstoreConfig {
    /// Create a new config with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Load and validate a configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: ExtstoreConfig =
            toml::from_str(&contents).map_err(|e| ExtstoreError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Set the backing file path.
    pub fn path(mut self, path: impl Into<PathBuf>) -> Self {
        self.path = path.into();
        self
    }

    /// Set the page size in bytes.
    pub fn page_size(mut self, size: usize) -> Self {
        self.page_size = size;
        self
    }

    /// Set the write buffer size in bytes.
    pub fn write_buffer_size(mut self, size: usize) -> Self {
        self.write_buffer_size = size;
        self
    }

    /// Set the number of pages.
    pub fn page_count(mut self, count: usize) -> Self {
        self.page_count = count;
        self
    }

    /// Set the number of buckets.
    pub fn bucket_count(mut self, count: usize) -> Self {
        self.bucket_count = count;
        self
    }

    /// Set the number of write buffers.
    pub fn write_buffer_count(mut self, count: usize) -> Self {
        self.write_buffer_count = count;
        self
    }

    /// Set the number of IO worker threads.
    pub fn worker_threads(mut self, threads: usize) -> Self {
        self.worker_threads = threads;
        self
    }

    /// Set the per-wake batch depth of each worker.
    pub fn io_batch_depth(mut self, depth: usize) -> Self {
        self.io_batch_depth = depth;
        self
    }

    /// Total size of the backing file in bytes.
    pub fn file_size(&self) -> u64 {
        self.page_count as u64 * self.page_size as u64
    }

    /// Number of write buffers that fit in one page.
    pub fn buffers_per_page(&self) -> usize {
        self.page_size
            .checked_div(self.write_buffer_size)
            .unwrap_or(0)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.write_buffer_size == 0 || self.page_size == 0 {
            return Err(invalid("page_size and write_buffer_size must be non-zero"));
        }

        if !self.page_size.is_multiple_of(self.write_buffer_size) {
            return Err(invalid(format!(
                "page_size ({}) must be a multiple of write_buffer_size ({})",
                self.page_size, self.write_buffer_size
            )));
        }

        if self.bucket_count < 1 {
            return Err(invalid("bucket_count must be at least 1"));
        }

        // at least one write buffer per potential active page
        if self.bucket_count > self.write_buffer_count {
            return Err(invalid(format!(
                "bucket_count ({}) must not exceed write_buffer_count ({})",
                self.bucket_count, self.write_buffer_count
            )));
        }

        if !self.page_size.is_multiple_of(ALIGNMENT)
            || !self.write_buffer_size.is_multiple_of(ALIGNMENT)
        {
            return Err(invalid(format!(
                "page_size ({}) and write_buffer_size ({}) must be multiples of {}",
                format_size(self.page_size),
                format_size(self.write_buffer_size),
                format_size(ALIGNMENT)
            )));
        }

        if self.page_count < 1 {
            return Err(invalid("page_count must be at least 1"));
        }

        if self.page_count > u32::MAX as usize {
            return Err(invalid("page_count must fit in 32 bits"));
        }

        if self.worker_threads < 1 {
            return Err(invalid("worker_threads must be at least 1"));
        }

        if self.io_batch_depth < 1 {
            return Err(invalid("io_batch_depth must be at least 1"));
        }

        Ok(())
    }
}

fn invalid(msg: impl Into<String>) -> ExtstoreError {
    ExtstoreError::Config(msg.into())
}

// Default value functions

fn default_path() -> PathBuf {
    PathBuf::from("extstore.dat")
}

fn default_page_size() -> usize {
    64 * 1024 * 1024 // 64MB
}

fn default_write_buffer_size() -> usize {
    8 * 1024 * 1024 // 8MB
}

fn default_page_count() -> usize {
    64
}

fn default_bucket_count() -> usize {
    4
}

fn default_write_buffer_count() -> usize {
    8
}

fn default_worker_threads() -> usize {
    1
}

fn default_io_batch_depth() -> usize {
    1
}

/// Deserialize a byte count given as a number or a [`parse_size`] string.
pub(crate) fn deserialize_size<'de, D>(deserializer: D) -> std::result::Result<usize, D::Error>
where
    D: serde::Deserializer<'de>,
{
    use serde::de::Error;

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum SizeValue {
        Number(usize),
        String(String),
    }

    match SizeValue::deserialize(deserializer)? {
        SizeValue::Number(n) => Ok(n),
        SizeValue::String(s) => parse_size(&s).map_err(D::Error::custom),
    }
}

/// Binary units understood by [`parse_size`] and [`format_size`], largest
/// first.
const UNITS: [(&str, usize); 4] = [
    ("T", 1 << 40),
    ("G", 1 << 30),
    ("M", 1 << 20),
    ("K", 1 << 10),
];

/// Parse a byte count with an optional binary unit, such as `"4096"`,
/// `"2MB"`, `"64 MiB"`, or `"1t"`.
pub fn parse_size(s: &str) -> Result<usize> {
    let s = s.trim();
    let split = s.find(|c: char| !c.is_ascii_digit()).unwrap_or(s.len());
    let (digits, unit) = s.split_at(split);

    if digits.is_empty() {
        return Err(invalid(format!("size {s:?} must start with a number")));
    }
    let scale = unit_scale(unit.trim())
        .ok_or_else(|| invalid(format!("size {s:?} has an unknown unit")))?;

    digits
        .parse::<usize>()
        .ok()
        .and_then(|count| count.checked_mul(scale))
        .ok_or_else(|| invalid(format!("size {s:?} does not fit in usize")))
}

/// Bytes per unit; an empty unit or a bare `B` means bytes.
fn unit_scale(unit: &str) -> Option<usize> {
    let unit = unit.to_ascii_uppercase();
    let prefix = match unit.strip_suffix("IB") {
        Some(prefix) if !prefix.is_empty() => prefix,
        _ => unit.strip_suffix('B').unwrap_or(unit.as_str()),
    };
    if prefix.is_empty() {
        return Some(1);
    }
    UNITS
        .iter()
        .find(|(name, _)| *name == prefix)
        .map(|&(_, scale)| scale)
}

/// Render a byte count in the largest unit that divides it exactly.
pub fn format_size(bytes: usize) -> String {
    UNITS
        .iter()
        .find(|&&(_, scale)| bytes >= scale && bytes.is_multiple_of(scale))
        .map(|&(name, scale)| format!("{} {name}B", bytes / scale))
        .unwrap_or_else(|| format!("{bytes} bytes"))
}
