//! Pipeline configuration.
//!
//! Layers, lowest priority first: [`PipelineConfig::default`], an optional
//! JSON file ([`PipelineConfig::load`]), environment variables
//! ([`PipelineConfig::apply_env`]) and finally whatever the CLI sets.

use std::path::Path;

use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use sysinfo::System;

use crate::error::{PipelineError, Result};

pub const DEFAULT_CHUNK_SIZE: usize = 1024 * 1024; // 1 MiB
const MIN_DEFAULT_BUDGET: u64 = 64 * 1024 * 1024;
const MAX_DEFAULT_BUDGET: u64 = 1024 * 1024 * 1024;

/// Where the coordinator's release (the final write) runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum WriterStrategy {
    /// The worker that completes a chunk also releases it, under the coordinator lock.
    #[value(name = "pool")]
    PoolHosted,
    /// Workers post results to one writer thread; workers never touch the disk for output.
    #[value(name = "dedicated")]
    DedicatedThread,
}

/// Which write backend executes output-file writes during extraction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum IoBackendKind {
    /// Detect at startup.
    Auto,
    /// Synchronous positional writes on the releasing thread.
    Blocking,
    /// Writes submitted to a tokio runtime and awaited when a file completes.
    Runtime,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Worker thread count. 0 = number of logical cores.
    pub pool_size: usize,
    /// Upper bound for bytes buffered across all in-flight chunks.
    pub memory_budget_bytes: u64,
    /// Read/write granularity when packing.
    pub chunk_size_bytes: usize,
    pub writer_strategy: WriterStrategy,
    /// Job-count limit of the work queue. 0 = twice the pool size.
    pub queue_depth: usize,
    pub io_backend: IoBackendKind,
    /// Abort the whole operation on the first codec error.
    pub fail_fast: bool,
    /// Keep incomplete extracted files with a `.partial` suffix instead of deleting them.
    pub keep_partial: bool,
    /// Store chunks raw when compressing does not shrink them.
    pub adaptive: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        PipelineConfig {
            pool_size: 0,
            memory_budget_bytes: default_memory_budget(),
            chunk_size_bytes: DEFAULT_CHUNK_SIZE,
            writer_strategy: WriterStrategy::DedicatedThread,
            queue_depth: 0,
            io_backend: IoBackendKind::Auto,
            fail_fast: false,
            keep_partial: false,
            adaptive: true,
        }
    }
}

/// A quarter of the currently available memory, clamped to 64 MiB..1 GiB.
pub fn default_memory_budget() -> u64 {
    let mut sys = System::new();
    sys.refresh_memory();
    let available = sys.available_memory();
    if available == 0 {
        return MIN_DEFAULT_BUDGET;
    }
    (available / 4).clamp(MIN_DEFAULT_BUDGET, MAX_DEFAULT_BUDGET)
}

impl PipelineConfig {
    /// Read a JSON config file. Missing fields keep their defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let bytes = std::fs::read(path).map_err(|e| PipelineError::io(e, path))?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// Apply `BLITZPIPE_MEM_BUDGET_MB` and `BLITZPIPE_THREADS`. Unparsable
    /// or zero values are ignored.
    pub fn apply_env(mut self) -> Self {
        if let Some(mb) = env_u64("BLITZPIPE_MEM_BUDGET_MB") {
            match mib_to_bytes(mb) {
                Some(bytes) => self.memory_budget_bytes = bytes,
                None => tracing::warn!(value = mb, "BLITZPIPE_MEM_BUDGET_MB is out of range, ignored"),
            }
        }
        if let Some(threads) = env_u64("BLITZPIPE_THREADS") {
            self.pool_size = threads as usize;
        }
        self
    }

    pub fn resolved_pool_size(&self) -> usize {
        if self.pool_size == 0 {
            num_cpus::get().max(1)
        } else {
            self.pool_size
        }
    }

    pub fn resolved_queue_depth(&self) -> usize {
        if self.queue_depth == 0 {
            self.resolved_pool_size() * 2
        } else {
            self.queue_depth
        }
    }

    /// Reject configurations that could never make progress.
    ///
    /// `max_job_bytes` is the largest reservation a single job of the
    /// upcoming operation needs.
    pub fn validate(&self, max_job_bytes: u64) -> Result<()> {
        if self.chunk_size_bytes == 0 {
            return Err(PipelineError::Config("chunk size must be non-zero".into()));
        }
        if self.resolved_queue_depth() == 0 || self.memory_budget_bytes < max_job_bytes {
            return Err(PipelineError::BackpressureDeadlock {
                budget: self.memory_budget_bytes,
                required: max_job_bytes,
            });
        }
        Ok(())
    }
}

/// `mb` MiB in bytes, or `None` when that does not fit in a `u64`.
pub fn mib_to_bytes(mb: u64) -> Option<u64> {
    mb.checked_mul(1024 * 1024)
}

/// `kb` KiB in bytes, or `None` when that does not fit in a `usize`.
pub fn kib_to_bytes(kb: usize) -> Option<usize> {
    kb.checked_mul(1024)
}

fn env_u64(key: &str) -> Option<u64> {
    std::env::var(key)
        .ok()
        .and_then(|s| s.trim().parse::<u64>().ok())
        .filter(|&v| v > 0)
}
