//! Deconvolution error types.
//!
//! All errors are fail-closed: invalid parameters are rejected before any
//! buffer is allocated, and allocation failures release everything that was
//! built so far.

use thiserror::Error;

/// Status codes surfaced by the deconvolution path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Success,
    InvalidParameter,
    OutOfMemory,
}

impl Status {
    /// Stable label used in logs and metrics.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::InvalidParameter => "invalid_parameter",
            Self::OutOfMemory => "out_of_memory",
        }
    }
}

/// Errors that can occur while creating, setting up or running a deconvolution.
#[derive(Debug, Error)]
pub enum DeconvError {
    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("Out of memory: failed to allocate {bytes} bytes for {what}")]
    OutOfMemory { what: &'static str, bytes: usize },
}

impl DeconvError {
    /// Status code equivalent of this error.
    pub fn status(&self) -> Status {
        match self {
            Self::InvalidParameter(_) => Status::InvalidParameter,
            Self::OutOfMemory { .. } => Status::OutOfMemory,
        }
    }

    /// Returns true if this error was raised before any allocation happened.
    pub fn is_validation(&self) -> bool {
        matches!(self, Self::InvalidParameter(_))
    }
}

impl From<Result<(), DeconvError>> for Status {
    fn from(result: Result<(), DeconvError>) -> Self {
        match result {
            Ok(()) => Status::Success,
            Err(e) => e.status(),
        }
    }
}
