//! Telemetry: structured logging, tracing spans and metrics.

mod logging;
mod metrics;
mod spans;

pub use logging::{init_logging, LogConfig, LogError, LogFormat};
pub use self::metrics::{
    init_metrics, record_indirection_bytes, record_run_failure, record_run_success, record_tiles,
    FAILURES_TOTAL, INDIRECTION_BYTES, RUNS_TOTAL, TILES_TOTAL,
};
pub use spans::{DeconvSpan, SpanExt};
