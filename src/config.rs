use std::time::Duration;

use clap::Parser;

use crate::error::{DispatchError, Result};
use crate::query_processor::ProcessorSettings;

/// Server configuration. Every flag can also come from the environment.
#[derive(Parser, Debug, Clone)]
#[clap(author, version, about = "Scatter/gather SQL dispatcher", long_about = None)]
pub struct Config {
    /// Address the HTTP API listens on
    #[clap(long, env = "SHARDQ_LISTEN", default_value = "0.0.0.0:8000")]
    pub listen: String,

    /// Worker endpoint that executes one SQL statement
    #[clap(long, env = "WORKER_URL", default_value = "http://worker-svc:8001/execute")]
    pub worker_url: String,

    /// Number of partitions a splittable query is cut into
    #[clap(long, env = "MAX_PARTS", default_value_t = 4)]
    pub max_parts: usize,

    /// Deadline for a single worker call, in milliseconds
    #[clap(long, env = "WORKER_TIMEOUT_MS", default_value_t = 30_000)]
    pub worker_timeout_ms: u64,

    /// Return results from the remaining workers when some fail
    #[clap(long, env = "SHARDQ_PARTIAL_RESULTS")]
    pub partial_results: bool,

    /// Postgres DSN used to look up partition bounds
    #[clap(long, env = "DB_DSN")]
    pub bounds_dsn: Option<String>,

    /// Partition column used when the WHERE clause names none
    #[clap(long, env = "SHARDQ_PARTITION_COLUMN", default_value = "id")]
    pub default_partition_column: String,

    /// Default log filter when RUST_LOG is not set
    #[clap(long, env = "SHARDQ_LOG", default_value = "info")]
    pub log_level: String,
}

impl Config {
    pub fn validate(&self) -> Result<()> {
        if self.max_parts == 0 {
            return Err(DispatchError::Config("max_parts must be at least 1".to_string()));
        }
        if self.worker_timeout_ms == 0 {
            return Err(DispatchError::Config("worker_timeout_ms must be positive".to_string()));
        }
        if self.default_partition_column.trim().is_empty() {
            return Err(DispatchError::Config("default partition column is empty".to_string()));
        }
        Ok(())
    }

    pub fn processor_settings(&self) -> ProcessorSettings {
        ProcessorSettings {
            max_parts: self.max_parts,
            worker_timeout: Duration::from_millis(self.worker_timeout_ms),
            partial_results: self.partial_results,
            default_partition_column: self.default_partition_column.clone(),
        }
    }
}
