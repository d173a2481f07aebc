//! Quantized transposed-convolution engine.
//!
//! A deconvolution is computed as an implicit GEMM: the indirection buffer
//! gathers, for every output pixel and kernel tap, the input pixel that tap
//! reads (or the zero-padding strip), and a micro-kernel multiplies those
//! gathered rows by prepacked weights one `mr x nr` tile at a time.

mod deconv;
mod dispatch;
pub mod error;
pub mod indirection;
mod operator;
pub mod params;
pub mod quantization;
pub mod ukernel;

pub use deconv::{deconvolve, deconvolve_with};
pub use error::{DeconvError, Status};
pub use indirection::{IndirectionBuffer, IndirectionEntry, IndirectionLayout, TapSources};
pub use operator::{DeconvOperator, SetupState};
pub use params::{DeconvParams, OutputDims};
pub use quantization::{
    requantization_scale, validate_scale, ConvQuantizationParams, QuantizationParams,
    Requantization, MAX_REQUANTIZATION_SCALE,
};
pub use ukernel::{round_up, PackedWeights, Q8ConvUkernel, ScalarQ8Conv, TileOutput, UkernelTile};
