//! Soak run configuration.

use extstore::ExtstoreConfig;
use serde::Deserialize;
use std::path::Path;

/// Top-level soak configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Engine configuration.
    #[serde(default)]
    pub engine: ExtstoreConfig,

    /// Logging configuration.
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Workload shape.
    #[serde(default)]
    pub workload: WorkloadConfig,
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self, Box<dyn std::error::Error>> {
        let contents = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), Box<dyn std::error::Error>> {
        self.engine.validate()?;

        if self.workload.writers == 0 {
            return Err("workload.writers must be at least 1".into());
        }

        if self.workload.object_size == 0 || self.workload.object_size > self.engine.write_buffer_size
        {
            return Err(format!(
                "workload.object_size ({}) must be between 1 and write_buffer_size ({})",
                self.workload.object_size, self.engine.write_buffer_size
            )
            .into());
        }

        if !(0.0..=1.0).contains(&self.workload.delete_ratio) {
            return Err(format!(
                "workload.delete_ratio ({}) must be between 0.0 and 1.0",
                self.workload.delete_ratio
            )
            .into());
        }

        Ok(())
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable multi-line output.
    #[default]
    Pretty,
    /// Single-line output.
    Compact,
    /// Newline-delimited JSON.
    Json,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LoggingConfig {
    /// Log level filter. RUST_LOG takes precedence.
    #[serde(default = "default_level")]
    pub level: String,

    /// Output format.
    #[serde(default)]
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_level(),
            format: LogFormat::default(),
        }
    }
}

/// Workload configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WorkloadConfig {
    /// Number of writer threads.
    #[serde(default = "default_writers")]
    pub writers: usize,

    /// Size of each object in bytes.
    #[serde(
        default = "default_object_size",
        deserialize_with = "deserialize_size"
    )]
    pub object_size: usize,

    /// Run time in seconds. Zero runs until interrupted.
    #[serde(default = "default_duration_secs")]
    pub duration_secs: u64,

    /// Read every object back and verify its bytes.
    #[serde(default = "default_read_back")]
    pub read_back: bool,

    /// Fraction of written objects deleted right away.
    #[serde(default = "default_delete_ratio")]
    pub delete_ratio: f64,
}

impl Default for WorkloadConfig {
    fn default() -> Self {
        Self {
            writers: default_writers(),
            object_size: default_object_size(),
            duration_secs: default_duration_secs(),
            read_back: default_read_back(),
            delete_ratio: default_delete_ratio(),
        }
    }
}

fn default_level() -> String {
    "info".to_string()
}

fn default_writers() -> usize {
    2
}

fn default_object_size() -> usize {
    64 * 1024 // 64KB
}

fn default_duration_secs() -> u64 {
    10
}

fn default_read_back() -> bool {
    true
}

fn default_delete_ratio() -> f64 {
    0.5
}

fn deserialize_size<'de, D>(deserializer: D) -> Result<usize, D::Error>
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
        SizeValue::String(s) => extstore::parse_size(&s).map_err(D::Error::custom),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        Config::default().validate().unwrap();
    }

    #[test]
    fn test_parse_sections() {
        let config: Config = toml::from_str(
            r#"
            [engine]
            path = "/tmp/soak.dat"
            page_size = "4MB"
            write_buffer_size = "2MB"
            page_count = 8
            bucket_count = 2

            [logging]
            level = "debug"
            format = "json"

            [workload]
            writers = 4
            object_size = "16KB"
            delete_ratio = 0.25
            "#,
        )
        .unwrap();

        assert_eq!(config.engine.page_size, 4 * 1024 * 1024);
        assert_eq!(config.engine.page_count, 8);
        assert_eq!(config.logging.format, LogFormat::Json);
        assert_eq!(config.workload.writers, 4);
        assert_eq!(config.workload.object_size, 16 * 1024);
        assert!(config.workload.read_back);
        config.validate().unwrap();
    }

    #[test]
    fn test_object_larger_than_buffer_rejected() {
        let mut config = Config::default();
        config.workload.object_size = config.engine.write_buffer_size + 1;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_unknown_section_rejected() {
        assert!(toml::from_str::<Config>("[cache]\nsize = 1").is_err());
    }
}
