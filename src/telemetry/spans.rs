//! Span utilities and extension traits for deconvolution tracing.

use tracing::{info_span, Span};

/// Extension trait for adding context to spans.
pub trait SpanExt {
    /// Record the result of an operation into the span.
    fn record_result<T, E>(&self, result: &Result<T, E>)
    where
        E: std::fmt::Display;
}

impl SpanExt for Span {
    fn record_result<T, E>(&self, result: &Result<T, E>)
    where
        E: std::fmt::Display,
    {
        match result {
            Ok(_) => {
                self.record("status", "ok");
            }
            Err(e) => {
                self.record("status", "error");
                self.record("error.message", e.to_string().as_str());
            }
        }
    }
}

/// Factory for the span wrapping one deconvolution call.
pub struct DeconvSpan;

impl DeconvSpan {
    /// Create a span with the call geometry.
    ///
    /// `status` and `error.message` are filled in by
    /// [`SpanExt::record_result`]; `tiles` by the dispatcher.
    pub fn new(batch_size: usize, input_height: usize, input_width: usize, groups: usize) -> Span {
        info_span!(
            "q8_deconvolution",
            batch_size,
            input_height,
            input_width,
            groups,
            status = tracing::field::Empty,
            error.message = tracing::field::Empty,
            tiles = tracing::field::Empty,
        )
    }
}
