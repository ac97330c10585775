//! Immutable per-run configuration
//!
//! Built once at run start from the loaded config plus CLI overrides and the
//! process timestamp; cloned into workers, never mutated afterwards. No
//! component reads ambient global state.

use chrono::Local;
use std::path::PathBuf;
use vap_common::config::{PipelineConfig, WorkerCount};

/// Resolved runtime configuration shared across pipeline stages.
#[derive(Debug, Clone)]
pub struct RunContext {
    /// Namespace prefix isolating this dataset's tables
    pub business_tag: String,
    pub input_dir: PathBuf,
    pub database_dir: PathBuf,
    pub output_dir: PathBuf,
    pub db_path: PathBuf,

    pub parallel: bool,
    pub workers: WorkerCount,
    pub csv_chunk_size: usize,
    pub stream_chunk_size: usize,

    pub max_file_mb: f64,
    pub memory_monitoring_enabled: bool,
    pub large_file_streaming_mb: f64,
    pub stream_switch_threshold_percent: f64,
    pub available_memory_fraction: f64,
    pub stream_chunk_memory_fraction: f64,

    pub io_throttle_enabled: bool,
    pub io_busy_threshold_percent: f64,
    pub io_sample_ms: u64,
    pub io_reduce_factor: f64,
    pub io_min_workers: usize,

    pub max_failure_samples: usize,
    pub tax_text_to_zero: bool,
    pub date_parse_success_ratio: f64,

    pub handoff_enabled: bool,
    pub handoff_timeout_ms: u64,
    pub handoff_capacity: usize,

    /// Run timestamp, `YYYY-MM-DD HH:MM:SS`; identifies this invocation in
    /// audit columns and export file names
    pub process_time: String,
}

impl RunContext {
    /// Build the run context from a validated configuration.
    pub fn from_config(config: &PipelineConfig) -> Self {
        let database_dir = PathBuf::from(&config.paths.database_dir);
        let db_path = database_dir.join(format!("{}_Audit_Repo.db", config.business.tag));
        Self {
            business_tag: config.business.tag.clone(),
            input_dir: PathBuf::from(&config.paths.input_dir),
            database_dir,
            output_dir: PathBuf::from(&config.paths.output_dir),
            db_path,
            parallel: config.import.parallel,
            workers: config.import.workers.clone(),
            csv_chunk_size: config.import.csv_chunk_size,
            stream_chunk_size: config.import.stream_chunk_size,
            max_file_mb: config.inputs.max_file_mb,
            memory_monitoring_enabled: config.performance.memory_monitoring.enabled,
            large_file_streaming_mb: config.performance.memory_monitoring.large_file_streaming_mb,
            stream_switch_threshold_percent: config
                .performance
                .memory_monitoring
                .stream_switch_threshold_percent,
            available_memory_fraction: config
                .performance
                .memory_monitoring
                .available_memory_fraction,
            stream_chunk_memory_fraction: config
                .performance
                .memory_monitoring
                .stream_chunk_memory_fraction,
            io_throttle_enabled: config.performance.io_throttle.enabled,
            io_busy_threshold_percent: config.performance.io_throttle.busy_threshold_percent,
            io_sample_ms: config.performance.io_throttle.sample_ms,
            io_reduce_factor: config.performance.io_throttle.reduce_factor,
            io_min_workers: config.performance.io_throttle.min_workers,
            max_failure_samples: config.normalize.max_failure_samples,
            tax_text_to_zero: config.normalize.tax_text_to_zero,
            date_parse_success_ratio: config.normalize.date_parse_success_ratio,
            handoff_enabled: config.import.handoff_enabled,
            handoff_timeout_ms: config.import.handoff_timeout_ms,
            handoff_capacity: config.import.handoff_capacity,
            process_time: Local::now().format("%Y-%m-%d %H:%M:%S").to_string(),
        }
    }

    /// Run timestamp rendered safe for file names (`:` and space replaced)
    pub fn process_time_stamp(&self) -> String {
        self.process_time.replace(':', "-").replace(' ', "_")
    }

    /// Temp root for this run's shard files
    pub fn temp_root(&self) -> PathBuf {
        self.output_dir
            .join(crate::types::TEMP_DIR_PREFIX)
            .join(self.process_time_stamp())
    }

    // ------------------------------------------------------------------------
    // Staging tables
    // ------------------------------------------------------------------------

    /// Transit table for raw detail-classified sheets; dropped at run end
    pub fn transit_table(&self) -> String {
        format!("ODS_{}_TEMP_TRANSIT", self.business_tag)
    }

    /// Staging table holding consolidated line rows (summary-classified sheets)
    pub fn detail_table(&self) -> String {
        format!("ODS_{}_DETAIL", self.business_tag)
    }

    pub fn header_table(&self) -> String {
        format!("ODS_{}_HEADER", self.business_tag)
    }

    pub fn special_table(&self, suffix: &str) -> String {
        format!("ODS_{}_SPECIAL_{}", self.business_tag, suffix)
    }

    // ------------------------------------------------------------------------
    // Ledger partitions
    // ------------------------------------------------------------------------

    /// Year-partitioned detail ledger table
    pub fn ledger_detail_table(&self, year: &str) -> String {
        format!("LEDGER_{}_{}_DETAIL", self.business_tag, year)
    }

    /// Year-partitioned header ledger table
    pub fn ledger_header_table(&self, year: &str) -> String {
        format!("LEDGER_{}_{}_HEADER", self.business_tag, year)
    }
}
