//! Engine configuration that downstream crates can serialize/deserialize.
//!
//! The join method switches are ordinary fields of [`JoinConfig`]; nothing in
//! the engine reads process-wide mutable state.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JoinConfig {
    /// Allow nest-loop depths.
    pub enable_nestloop: bool,

    /// Allow hash-join depths.
    pub enable_hashjoin: bool,

    /// Nominal size of one chunk (bytes). Also the ceiling for the pair of
    /// intermediate result-index buffers of a task.
    pub chunk_size: usize,

    /// Hard ceiling of one destination chunk (bytes).
    pub chunk_size_limit: usize,

    /// Safety margin applied to every estimated buffer size.
    pub chunk_size_margin: f64,

    /// Fraction of the planned outer rows after which observed selectivity is
    /// trusted completely.
    pub observed_trust_fraction: f64,

    /// Rows pulled from the outer source into one source chunk.
    pub outer_chunk_rows: usize,

    /// Tasks allowed in flight at once, across all devices.
    pub max_async_tasks: usize,

    /// Directory for the LEFT/FULL partitioning spill.
    pub spill_dir: String,

    /// Rows buffered before one spill segment is written.
    pub spill_batch_rows: usize,

    /// Hand out whole result chunks instead of single rows.
    pub bulk_exec: bool,
}

impl Default for JoinConfig {
    fn default() -> Self {
        let chunk_size = (15 << 20) + (512 << 10);
        Self {
            enable_nestloop: true,
            enable_hashjoin: true,
            chunk_size,
            chunk_size_limit: 4 * chunk_size,
            chunk_size_margin: 1.25,
            observed_trust_fraction: 0.30,
            outer_chunk_rows: 4096,
            max_async_tasks: 4,
            spill_dir: "/tmp/gpujoin-spill".to_string(),
            spill_batch_rows: 1024,
            bulk_exec: false,
        }
    }
}

impl JoinConfig {
    /// Create a config from environment variables, falling back to defaults.
    ///
    /// Environment variables:
    /// - `GPUJOIN_ENABLE_NESTLOOP`, `GPUJOIN_ENABLE_HASHJOIN`: `on`/`off`/`true`/`false`
    /// - `GPUJOIN_CHUNK_SIZE`, `GPUJOIN_CHUNK_SIZE_LIMIT`: bytes
    /// - `GPUJOIN_CHUNK_SIZE_MARGIN`: factor >= 1.0
    /// - `GPUJOIN_OBSERVED_TRUST_FRACTION`: fraction in (0, 1]
    /// - `GPUJOIN_OUTER_CHUNK_ROWS`, `GPUJOIN_MAX_ASYNC_TASKS`
    /// - `GPUJOIN_SPILL_DIR`, `GPUJOIN_SPILL_BATCH_ROWS`
    /// - `GPUJOIN_BULK_EXEC`
    pub fn from_env() -> Self {
        let mut cfg = Self::default();

        if let Some(v) = env_bool("GPUJOIN_ENABLE_NESTLOOP") {
            cfg.enable_nestloop = v;
        }
        if let Some(v) = env_bool("GPUJOIN_ENABLE_HASHJOIN") {
            cfg.enable_hashjoin = v;
        }
        if let Some(v) = env_parse::<usize>("GPUJOIN_CHUNK_SIZE") {
            cfg.chunk_size = v;
            cfg.chunk_size_limit = cfg.chunk_size_limit.max(v);
        }
        if let Some(v) = env_parse::<usize>("GPUJOIN_CHUNK_SIZE_LIMIT") {
            cfg.chunk_size_limit = v;
        }
        if let Some(v) = env_parse::<f64>("GPUJOIN_CHUNK_SIZE_MARGIN") {
            cfg.chunk_size_margin = v;
        }
        if let Some(v) = env_parse::<f64>("GPUJOIN_OBSERVED_TRUST_FRACTION") {
            cfg.observed_trust_fraction = v;
        }
        if let Some(v) = env_parse::<usize>("GPUJOIN_OUTER_CHUNK_ROWS") {
            cfg.outer_chunk_rows = v;
        }
        if let Some(v) = env_parse::<usize>("GPUJOIN_MAX_ASYNC_TASKS") {
            cfg.max_async_tasks = v;
        }
        if let Ok(s) = std::env::var("GPUJOIN_SPILL_DIR") {
            cfg.spill_dir = s;
        }
        if let Some(v) = env_parse::<usize>("GPUJOIN_SPILL_BATCH_ROWS") {
            cfg.spill_batch_rows = v;
        }
        if let Some(v) = env_bool("GPUJOIN_BULK_EXEC") {
            cfg.bulk_exec = v;
        }

        cfg
    }

    /// Reject settings the sizing logic cannot work with.
    pub fn validate(&self) -> Result<()> {
        if !self.enable_nestloop && !self.enable_hashjoin {
            return Err(Error::Config(
                "both nest-loop and hash-join are disabled".into(),
            ));
        }
        if self.chunk_size == 0 {
            return Err(Error::Config("chunk_size must be positive".into()));
        }
        if self.chunk_size_limit < self.chunk_size {
            return Err(Error::Config(format!(
                "chunk_size_limit {} is below chunk_size {}",
                self.chunk_size_limit, self.chunk_size
            )));
        }
        if !(self.chunk_size_margin >= 1.0) {
            return Err(Error::Config(format!(
                "chunk_size_margin {} must be >= 1.0",
                self.chunk_size_margin
            )));
        }
        if !(self.observed_trust_fraction > 0.0 && self.observed_trust_fraction <= 1.0) {
            return Err(Error::Config(format!(
                "observed_trust_fraction {} must be in (0, 1]",
                self.observed_trust_fraction
            )));
        }
        if self.outer_chunk_rows == 0 || self.max_async_tasks == 0 || self.spill_batch_rows == 0 {
            return Err(Error::Config(
                "outer_chunk_rows, max_async_tasks and spill_batch_rows must be positive".into(),
            ));
        }
        Ok(())
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|s| s.trim().parse::<T>().ok())
}

fn env_bool(key: &str) -> Option<bool> {
    let s = std::env::var(key).ok()?;
    match s.trim().to_ascii_lowercase().as_str() {
        "1" | "on" | "true" | "yes" => Some(true),
        "0" | "off" | "false" | "no" => Some(false),
        _ => None,
    }
}
