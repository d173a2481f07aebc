//! Deconvolution metrics through the `metrics` facade.
//!
//! Recording is a no-op until the embedding application installs a recorder.

use metrics::{counter, describe_counter, describe_gauge, gauge, Unit};

pub const RUNS_TOTAL: &str = "q8deconv_runs_total";
pub const FAILURES_TOTAL: &str = "q8deconv_failures_total";
pub const TILES_TOTAL: &str = "q8deconv_tiles_total";
pub const INDIRECTION_BYTES: &str = "q8deconv_indirection_bytes";

/// Register metric descriptions with the installed recorder.
pub fn init_metrics() {
    describe_counter!(RUNS_TOTAL, Unit::Count, "Completed deconvolution runs");
    describe_counter!(
        FAILURES_TOTAL,
        Unit::Count,
        "Deconvolutions rejected or aborted, by status"
    );
    describe_counter!(TILES_TOTAL, Unit::Count, "Micro-kernel tiles dispatched");
    describe_gauge!(
        INDIRECTION_BYTES,
        Unit::Bytes,
        "Bytes held by the most recently built indirection buffer"
    );
}

/// Record a completed run.
pub fn record_run_success() {
    counter!(RUNS_TOTAL).increment(1);
}

/// Record a failed create, setup or run. `status` is a stable label value.
pub fn record_run_failure(status: &'static str) {
    counter!(FAILURES_TOTAL, "status" => status).increment(1);
}

/// Record tiles handed to the executor for one run.
pub fn record_tiles(tiles: usize) {
    counter!(TILES_TOTAL).increment(tiles as u64);
}

/// Record the size of a freshly built indirection buffer.
pub fn record_indirection_bytes(bytes: usize) {
    gauge!(INDIRECTION_BYTES).set(bytes as f64);
}
