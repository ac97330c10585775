//! TOML configuration loading for the VAT audit pipeline
//!
//! Every field carries a serde default, so a missing or partial config file
//! still yields a runnable configuration. CLI overrides are applied by the
//! binary after loading.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Worker count setting: `"auto"` (logical CPUs - 1) or a fixed count.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum WorkerCount {
    /// Literal string, only `"auto"` is accepted
    Auto(String),
    /// Fixed worker count (>= 1)
    Fixed(usize),
}

impl Default for WorkerCount {
    fn default() -> Self {
        WorkerCount::Auto("auto".to_string())
    }
}

impl WorkerCount {
    /// Resolved fixed count, `None` for auto
    pub fn fixed(&self) -> Option<usize> {
        match self {
            WorkerCount::Fixed(n) => Some(*n),
            WorkerCount::Auto(_) => None,
        }
    }
}

/// Top-level pipeline configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub business: BusinessConfig,
    pub paths: PathsConfig,
    pub inputs: InputsConfig,
    pub import: ImportConfig,
    pub performance: PerformanceConfig,
    pub normalize: NormalizeConfig,
}

/// Business tag namespace
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BusinessConfig {
    /// Alphanumeric/underscore identifier used as a table-name prefix
    pub tag: String,
}

impl Default for BusinessConfig {
    fn default() -> Self {
        Self {
            tag: "VAT_INV".to_string(),
        }
    }
}

/// Input/output/database directories
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    pub input_dir: String,
    pub database_dir: String,
    pub output_dir: String,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            input_dir: "Source_Data".to_string(),
            database_dir: "Database".to_string(),
            output_dir: "Outputs".to_string(),
        }
    }
}

/// Input file validation limits
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InputsConfig {
    /// Maximum accepted workbook size in MB; files above are skipped
    pub max_file_mb: f64,
}

impl Default for InputsConfig {
    fn default() -> Self {
        Self { max_file_mb: 200.0 }
    }
}

/// Import stage settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ImportConfig {
    /// Parallel (shard/merge) vs sequential (direct DB) ingestion
    pub parallel: bool,
    pub workers: WorkerCount,
    /// Rows per chunk when the merge engine reads shards back
    pub csv_chunk_size: usize,
    /// Rows per chunk in streaming sheet reads (static fallback)
    pub stream_chunk_size: usize,
    /// Enable the bounded worker -> spool hand-off channel
    pub handoff_enabled: bool,
    /// Hand-off send timeout before a worker degrades to its own shard
    pub handoff_timeout_ms: u64,
    /// Hand-off channel capacity (batches)
    pub handoff_capacity: usize,
}

impl Default for ImportConfig {
    fn default() -> Self {
        Self {
            parallel: true,
            workers: WorkerCount::default(),
            csv_chunk_size: 1_000,
            stream_chunk_size: 10_000,
            handoff_enabled: false,
            handoff_timeout_ms: 5_000,
            handoff_capacity: 8,
        }
    }
}

/// Performance tuning: memory monitoring and IO throttling
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PerformanceConfig {
    pub memory_monitoring: MemoryMonitoringConfig,
    pub io_throttle: IoThrottleConfig,
}

/// Streaming-decision thresholds
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryMonitoringConfig {
    pub enabled: bool,
    /// Files above this size always stream
    pub large_file_streaming_mb: f64,
    /// Stream everything once system memory usage reaches this percentage
    pub stream_switch_threshold_percent: f64,
    /// Stream a file larger than this fraction of available memory
    pub available_memory_fraction: f64,
    /// Fraction of available memory used to size dynamic stream chunks
    pub stream_chunk_memory_fraction: f64,
}

impl Default for MemoryMonitoringConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            large_file_streaming_mb: 100.0,
            stream_switch_threshold_percent: 75.0,
            available_memory_fraction: 0.4,
            stream_chunk_memory_fraction: 0.1,
        }
    }
}

/// Disk-busy admission control for the worker pool
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IoThrottleConfig {
    pub enabled: bool,
    /// Busy percentage at/above which the worker count is reduced
    pub busy_threshold_percent: f64,
    /// Sub-second sampling window
    pub sample_ms: u64,
    /// Multiplier applied to the worker count when the disk is busy
    pub reduce_factor: f64,
    /// Floor for the reduced worker count (>= 1)
    pub min_workers: usize,
}

impl Default for IoThrottleConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            busy_threshold_percent: 75.0,
            sample_ms: 250,
            reduce_factor: 0.5,
            min_workers: 1,
        }
    }
}

/// Value-normalization settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NormalizeConfig {
    /// Cap on recorded failure samples per column
    pub max_failure_samples: usize,
    /// Map recognized exemption tokens in the tax-rate column to zero
    pub tax_text_to_zero: bool,
    /// Success ratio required for the generic date-parse method to win
    pub date_parse_success_ratio: f64,
}

impl Default for NormalizeConfig {
    fn default() -> Self {
        Self {
            max_failure_samples: 100,
            tax_text_to_zero: true,
            date_parse_success_ratio: 0.7,
        }
    }
}

/// Load configuration from a TOML file.
///
/// A missing file yields the default configuration; a present but invalid
/// file is a hard error (misconfiguration should not be silently ignored).
pub fn load_config(path: &Path) -> Result<PipelineConfig> {
    if !path.exists() {
        tracing::info!(path = %path.display(), "Config file not found, using defaults");
        return Ok(PipelineConfig::default());
    }
    let content = std::fs::read_to_string(path)
        .map_err(|e| Error::Config(format!("Read config {} failed: {}", path.display(), e)))?;
    let config: PipelineConfig = toml::from_str(&content)
        .map_err(|e| Error::Config(format!("Parse config {} failed: {}", path.display(), e)))?;
    validate_config(&config)?;
    Ok(config)
}

/// Reject configurations the pipeline cannot run with.
pub fn validate_config(config: &PipelineConfig) -> Result<()> {
    let tag = &config.business.tag;
    if tag.is_empty() || !tag.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return Err(Error::Config(format!(
            "business.tag must be alphanumeric/underscore, got {:?}",
            tag
        )));
    }
    if let WorkerCount::Auto(s) = &config.import.workers {
        if !s.eq_ignore_ascii_case("auto") {
            return Err(Error::Config(format!(
                "import.workers must be \"auto\" or an integer, got {:?}",
                s
            )));
        }
    }
    if config.import.workers.fixed() == Some(0) {
        return Err(Error::Config(
            "import.workers must be at least 1".to_string(),
        ));
    }
    if config.import.csv_chunk_size == 0 || config.import.stream_chunk_size == 0 {
        return Err(Error::Config(
            "chunk sizes must be greater than 0".to_string(),
        ));
    }
    Ok(())
}
