//! q8deconv
//!
//! Quantized (u8) transposed convolution for CPU inference.
//!
//! # Pipeline
//!
//! - **Validate**: input, kernel and output scales must be positive normal
//!   floats; nothing is allocated otherwise.
//! - **Describe**: a [`DeconvOperator`] owns the requantization constants,
//!   the zero-padding strip and the indirection buffer.
//! - **Index**: the indirection buffer maps every (group, image, output
//!   pixel, kernel tap) to the input pixel it reads or to zero padding.
//! - **Dispatch**: the output space is tiled `(1, 1, mr, nr)` and each tile
//!   is computed by a [`Q8ConvUkernel`] on a caller-owned [`TiledExecutor`].
//!
//! # Example
//!
//! ```
//! use q8deconv::{deconvolve, DeconvParams, PackedWeights, QuantizationParams, ScalarQ8Conv, SerialExecutor};
//!
//! // 1x1 kernel, one channel, weight 1 with zero point 0, output zero point 127.
//! let params = DeconvParams::new([1, 1], 1, 1, 1);
//! let weights = PackedWeights::pack(&params, &ScalarQ8Conv::default(), &[1], &[0]).unwrap();
//! let mut output = [0u8; 1];
//! let dims = deconvolve(
//!     &params, &weights, 1, 1, 1,
//!     QuantizationParams::new(1.0, 0), &[1],
//!     QuantizationParams::new(1.0, 127), &mut output,
//!     &SerialExecutor,
//! ).unwrap();
//! assert_eq!((dims.width, dims.height), (1, 1));
//! assert_eq!(output, [128]);
//! ```

pub mod config;
pub mod engine;
pub mod memory;
pub mod scheduler;
pub mod telemetry;

pub use engine::{
    deconvolve, deconvolve_with, DeconvError, DeconvOperator, DeconvParams, OutputDims,
    PackedWeights, Q8ConvUkernel, QuantizationParams, ScalarQ8Conv, Status,
};
pub use memory::AllocationBudget;
pub use scheduler::{SerialExecutor, ThreadPool, ThreadPoolConfig, TiledExecutor};
