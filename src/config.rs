//! Runtime configuration loading from environment variables.
//!
//! All configuration values are loaded from `Q8DECONV_*` environment variables
//! with sensible defaults. Invalid values fall back to defaults without crashing.
//!
//! # Environment Variables
//!
//! | Variable | Default | Description |
//! |---|---|---|
//! | `Q8DECONV_NUM_THREADS` | 0 | Tile-executing threads (0 = auto) |
//! | `Q8DECONV_MAX_SCRATCH_BYTES` | unlimited | Budget for operator buffers (bytes) |
//! | `Q8DECONV_LOG_LEVEL` | info | Log filter directive |
//! | `Q8DECONV_LOG_FORMAT` | json | `json` or `pretty` |
//! | `Q8DECONV_LOG_FILE` | unset | Append logs to this file instead of stderr |
//! | `Q8DECONV_MR` | 4 | Reference micro-kernel row tile |
//! | `Q8DECONV_NR` | 8 | Reference micro-kernel column tile |
//! | `Q8DECONV_KR` | 1 | Reference micro-kernel channel packing |

use std::path::PathBuf;

use crate::engine::{DeconvError, ScalarQ8Conv};
use crate::memory::{AllocationBudget, AllocationBudgetConfig};
use crate::scheduler::{ThreadPool, ThreadPoolConfig, ThreadPoolError};
use crate::telemetry::{LogConfig, LogFormat};

/// Smallest scratch budget accepted from the environment.
const MIN_SCRATCH_BYTES: usize = 4096;
/// Largest micro-kernel tile dimension accepted from the environment.
const MAX_TILE_DIM: usize = 64;

/// Tile shape of the reference micro-kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UkernelConfig {
    pub mr: usize,
    pub nr: usize,
    pub kr: usize,
}

impl Default for UkernelConfig {
    fn default() -> Self {
        Self { mr: 4, nr: 8, kr: 1 }
    }
}

/// All runtime configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct EnvConfig {
    pub thread_pool: ThreadPoolConfig,
    pub budget: AllocationBudgetConfig,
    pub logging: LogConfig,
    pub ukernel: UkernelConfig,
}

impl EnvConfig {
    /// Spawn a thread pool sized by this configuration.
    pub fn build_thread_pool(&self) -> Result<ThreadPool, ThreadPoolError> {
        ThreadPool::new(self.thread_pool.clone())
    }

    pub fn build_budget(&self) -> AllocationBudget {
        AllocationBudget::new(self.budget.clone())
    }

    pub fn build_ukernel(&self) -> Result<ScalarQ8Conv, DeconvError> {
        ScalarQ8Conv::new(self.ukernel.mr, self.ukernel.nr, self.ukernel.kr)
    }
}

/// Parse a `usize` env var, returning `default` on missing or invalid.
fn parse_usize(key: &str, default: usize) -> usize {
    match std::env::var(key) {
        Ok(val) => val.trim().parse::<usize>().unwrap_or(default),
        Err(_) => default,
    }
}

/// Load thread pool configuration from environment.
fn load_thread_pool_config() -> ThreadPoolConfig {
    let num_threads = parse_usize("Q8DECONV_NUM_THREADS", 0);
    ThreadPoolConfig {
        num_threads,
        ..Default::default()
    }
}

/// Load the scratch budget from environment.
fn load_budget_config() -> AllocationBudgetConfig {
    let max_bytes = parse_usize("Q8DECONV_MAX_SCRATCH_BYTES", usize::MAX);
    let max_bytes = max_bytes.max(MIN_SCRATCH_BYTES);
    AllocationBudgetConfig { max_bytes }
}

/// Load logging configuration from environment.
fn load_log_config() -> LogConfig {
    let defaults = LogConfig::default();
    let level = std::env::var("Q8DECONV_LOG_LEVEL")
        .ok()
        .filter(|v| !v.trim().is_empty())
        .unwrap_or(defaults.level);
    let format = std::env::var("Q8DECONV_LOG_FORMAT")
        .ok()
        .and_then(|v| LogFormat::parse(&v))
        .unwrap_or(defaults.format);
    let output_path = std::env::var("Q8DECONV_LOG_FILE")
        .ok()
        .filter(|v| !v.trim().is_empty())
        .map(PathBuf::from);
    LogConfig { format, level, output_path }
}

/// Load micro-kernel tile shape from environment.
fn load_ukernel_config() -> UkernelConfig {
    let defaults = UkernelConfig::default();
    let mr = parse_usize("Q8DECONV_MR", defaults.mr).clamp(1, MAX_TILE_DIM);
    let nr = parse_usize("Q8DECONV_NR", defaults.nr).clamp(1, MAX_TILE_DIM);
    let kr = parse_usize("Q8DECONV_KR", defaults.kr).clamp(1, MAX_TILE_DIM);
    UkernelConfig { mr, nr, kr }
}

/// Load all configuration from environment variables.
///
/// Missing or invalid values fall back to safe defaults without panicking.
pub fn load() -> EnvConfig {
    EnvConfig {
        thread_pool: load_thread_pool_config(),
        budget: load_budget_config(),
        logging: load_log_config(),
        ukernel: load_ukernel_config(),
    }
}
