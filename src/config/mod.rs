//! Run configuration.
//!
//! Every section has defaults, so an empty JSON object is a valid
//! configuration file. Command-line flags are applied on top by the binary.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::reassembly::AssemblerConfig;
use crate::writer::OutputConfig;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("unknown decoder: {0}")]
    UnknownDecoder(String),

    #[error("no decoders left after applying include={include:?} exclude={exclude:?}")]
    NoDecodersSelected { include: String, exclude: String },

    #[error("invalid configuration: {0}")]
    Invalid(String),

    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct DecoderConfig {
    /// Comma separated decoder names. Empty selects every registered decoder.
    pub include: String,
    /// Comma separated decoder names to leave out.
    pub exclude: String,
    /// Skip decoders that fail to initialize instead of aborting.
    pub ignore_init_errors: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SweepConfig {
    /// Capture-time inactivity after which a connection is force-completed.
    pub idle_timeout_secs: u64,
    /// Capture-time distance between two idle sweeps.
    pub interval_secs: u64,
    /// Capture-time age after which incomplete IPv4 datagrams are dropped.
    pub fragment_timeout_secs: u64,
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            idle_timeout_secs: 120,
            interval_secs: 10,
            fragment_timeout_secs: 30,
        }
    }
}

impl SweepConfig {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn fragment_timeout(&self) -> Duration {
        Duration::from_secs(self.fragment_timeout_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// Bytes of each direction kept for stream decoders.
    pub max_stream_capture_bytes: usize,
    /// Delivered chunks queued per direction before the ingest thread blocks.
    pub channel_capacity: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            max_stream_capture_bytes: 1024 * 1024,
            channel_capacity: 64,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub decoders: DecoderConfig,
    pub output: OutputConfig,
    pub assembler: AssemblerConfig,
    pub connection: ConnectionConfig,
    pub sweep: SweepConfig,
    /// Count written records in prometheus counters.
    pub export_metrics: bool,
}

impl Config {
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.assembler.max_buffered_bytes_per_flow == 0 {
            return Err(ConfigError::Invalid(
                "assembler.max_buffered_bytes_per_flow must be greater than zero".into(),
            ));
        }
        if self.connection.channel_capacity == 0 {
            return Err(ConfigError::Invalid(
                "connection.channel_capacity must be greater than zero".into(),
            ));
        }
        if self.sweep.idle_timeout_secs == 0 || self.sweep.interval_secs == 0 {
            return Err(ConfigError::Invalid(
                "sweep.idle_timeout_secs and sweep.interval_secs must be greater than zero".into(),
            ));
        }
        if self.sweep.interval_secs > self.sweep.idle_timeout_secs {
            return Err(ConfigError::Invalid(format!(
                "sweep.interval_secs ({}) exceeds sweep.idle_timeout_secs ({})",
                self.sweep.interval_secs, self.sweep.idle_timeout_secs
            )));
        }
        if self.output.buffered && self.output.buffer_size == 0 {
            return Err(ConfigError::Invalid(
                "output.buffer_size must be greater than zero when buffering".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::writer::OutputFormat;

    #[test]
    fn test_defaults_are_valid() {
        let config = Config::default();
        config.validate().unwrap();
        assert_eq!(config.assembler.max_buffered_bytes_per_flow, 4 * 1024 * 1024);
        assert_eq!(config.sweep.idle_timeout(), Duration::from_secs(120));
        assert_eq!(config.sweep.interval(), Duration::from_secs(10));
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let config: Config = serde_json::from_str(
            r#"{"decoders": {"include": "TCP,HTTP"}, "output": {"format": "csv"}, "sweep": {"idle_timeout_secs": 30}}"#,
        )
        .unwrap();
        assert_eq!(config.decoders.include, "TCP,HTTP");
        assert_eq!(config.output.format, OutputFormat::Csv);
        assert_eq!(config.sweep.idle_timeout_secs, 30);
        assert_eq!(config.sweep.interval_secs, 10);
        assert!(!config.export_metrics);
    }

    #[test]
    fn test_rejects_zero_limits() {
        let mut config = Config::default();
        config.assembler.max_buffered_bytes_per_flow = 0;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        let mut config = Config::default();
        config.sweep.interval_secs = 600;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_missing_file() {
        let err = Config::from_json_file("/nonexistent/flowscope.json").unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }
}
