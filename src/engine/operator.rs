//! Deconvolution operator descriptor.
//!
//! An operator is created once per (geometry, quantization) pair, set up for
//! one input size, and run any number of times against that size. It owns
//! its zero-padding buffer and indirection buffer; [`DeconvOperator::teardown`]
//! releases both and is safe to call repeatedly.

use std::sync::Arc;

use tracing::{debug, error};

use super::dispatch::DispatchContext;
use super::error::DeconvError;
use super::indirection::{IndirectionBuffer, IndirectionEntry, IndirectionLayout, TapSources};
use super::params::{DeconvParams, OutputDims};
use super::quantization::{requantization_scale, ConvQuantizationParams, QuantizationParams};
use super::ukernel::{round_up, PackedWeights, Q8ConvUkernel};
use crate::memory::{AllocationBudget, ZeroBuffer};
use crate::scheduler::TiledExecutor;
use crate::telemetry;

/// Input geometry bound by the last successful [`DeconvOperator::setup`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SetupState {
    pub batch_size: usize,
    pub input_height: usize,
    pub input_width: usize,
    pub output: OutputDims,
}

/// A configured quantized transposed convolution.
pub struct DeconvOperator {
    params: DeconvParams,
    quantization: ConvQuantizationParams,
    ukernel: Arc<dyn Q8ConvUkernel>,
    budget: AllocationBudget,
    k_stride: usize,
    n_stride: usize,
    zero_buffer: Option<ZeroBuffer>,
    indirection: IndirectionBuffer,
    state: Option<SetupState>,
}

impl std::fmt::Debug for DeconvOperator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeconvOperator")
            .field("params", &self.params)
            .field("quantization", &self.quantization)
            .field("k_stride", &self.k_stride)
            .field("n_stride", &self.n_stride)
            .field("zero_buffer", &self.zero_buffer)
            .field("indirection_entries", &self.indirection.len())
            .field("state", &self.state)
            .finish()
    }
}

impl DeconvOperator {
    /// Validate parameters, derive requantization and allocate the zero buffer.
    ///
    /// Nothing is allocated unless every parameter is valid.
    pub fn create(
        params: DeconvParams,
        input_quantization: QuantizationParams,
        output_quantization: QuantizationParams,
        ukernel: Arc<dyn Q8ConvUkernel>,
        budget: AllocationBudget,
    ) -> Result<Self, DeconvError> {
        params.validate()?;
        let scale = requantization_scale(
            input_quantization.scale,
            params.kernel_scale,
            output_quantization.scale,
        )?;
        if ukernel.mr() == 0 || ukernel.nr() == 0 || ukernel.kr() == 0 {
            return Err(DeconvError::InvalidParameter(
                "micro-kernel tile dimensions must be non-zero".into(),
            ));
        }

        let quantization = ConvQuantizationParams::new(
            input_quantization.zero_point,
            params.kernel_zero_point,
            scale,
            output_quantization.zero_point,
            params.output_min,
            params.output_max,
        );
        let k_stride = round_up(params.group_input_channels, ukernel.kr());
        let n_stride = round_up(params.group_output_channels, ukernel.nr());
        let zero_buffer = ZeroBuffer::new(
            params.group_input_channels,
            k_stride,
            input_quantization.zero_point,
            &budget,
        )?;

        debug!(
            groups = params.groups,
            group_input_channels = params.group_input_channels,
            group_output_channels = params.group_output_channels,
            kernel_width = params.kernel_width(),
            kernel_height = params.kernel_height(),
            requantization_scale = scale,
            "created deconvolution operator"
        );

        Ok(Self {
            params,
            quantization,
            ukernel,
            budget,
            k_stride,
            n_stride,
            zero_buffer: Some(zero_buffer),
            indirection: IndirectionBuffer::new(),
            state: None,
        })
    }

    /// Bind an input size and build the indirection buffer.
    ///
    /// A reused operator resizes its existing indirection buffer. On
    /// allocation failure the operator is torn down and `OutOfMemory` is
    /// returned; a later successful setup allocates everything again.
    pub fn setup(
        &mut self,
        batch_size: usize,
        input_height: usize,
        input_width: usize,
    ) -> Result<OutputDims, DeconvError> {
        if batch_size == 0 {
            let output = OutputDims { width: 0, height: 0 };
            self.state = Some(SetupState {
                batch_size,
                input_height,
                input_width,
                output,
            });
            return Ok(output);
        }

        let output = self.params.compute_output_dims([input_width, input_height])?;
        if let Err(e) = self.allocate(batch_size, output) {
            error!(error = %e, "deconvolution setup failed, releasing operator buffers");
            self.teardown();
            return Err(e);
        }
        self.indirection
            .build(&self.params, [input_width, input_height], output);
        telemetry::record_indirection_bytes(self.indirection.reserved_bytes());

        self.state = Some(SetupState {
            batch_size,
            input_height,
            input_width,
            output,
        });
        debug!(
            batch_size,
            input_height,
            input_width,
            output_height = output.height,
            output_width = output.width,
            indirection_entries = self.indirection.len(),
            "deconvolution operator set up"
        );
        Ok(output)
    }

    fn allocate(&mut self, batch_size: usize, output: OutputDims) -> Result<(), DeconvError> {
        if self.zero_buffer.is_none() {
            self.zero_buffer = Some(ZeroBuffer::new(
                self.params.group_input_channels,
                self.k_stride,
                self.quantization.input_zero_point,
                &self.budget,
            )?);
        }
        let mr = self.ukernel.mr();
        let output_size = output.size();
        let tiled_output_size = output_size
            .checked_next_multiple_of(mr)
            .ok_or(DeconvError::OutOfMemory { what: "indirection buffer", bytes: usize::MAX })?;
        let layout = IndirectionLayout {
            batch_size,
            groups: self.params.groups,
            output_size,
            tiled_output_size,
            output_tile_size: mr,
            kernel_size: self.params.kernel_size(),
        };
        self.indirection.resize(layout, &self.budget)
    }

    /// Compute the deconvolution for the bound input size.
    ///
    /// `input` holds `batch x height x width` pixels `input_pixel_stride`
    /// bytes apart; `output` receives `batch x output_height x output_width`
    /// pixels `output_pixel_stride` bytes apart. Blocks until every tile is
    /// written. Bytes between the last channel and the next pixel are left
    /// untouched.
    pub fn run(
        &self,
        packed_weights: &PackedWeights,
        input: &[u8],
        output: &mut [u8],
        executor: &dyn TiledExecutor,
    ) -> Result<(), DeconvError> {
        let state = self
            .state
            .ok_or_else(|| DeconvError::InvalidParameter("operator has not been set up".into()))?;
        if state.batch_size == 0 {
            return Ok(());
        }
        let (Some(zero_buffer), Some(layout)) = (self.zero_buffer.as_ref(), self.indirection.layout()) else {
            return Err(DeconvError::InvalidParameter("operator has been torn down".into()));
        };

        let input_pixels = state
            .batch_size
            .checked_mul(state.input_height)
            .and_then(|n| n.checked_mul(state.input_width));
        check_len(
            "input",
            input.len(),
            input_pixels.and_then(|n| {
                tensor_len(n, self.params.input_pixel_stride, self.params.input_channels())
            }),
        )?;
        let output_pixels = state.batch_size.checked_mul(state.output.size());
        check_len(
            "output",
            output.len(),
            output_pixels.and_then(|n| {
                tensor_len(n, self.params.output_pixel_stride, self.params.output_channels())
            }),
        )?;
        check_len(
            "packed weights",
            packed_weights.as_bytes().len(),
            Some(PackedWeights::packed_len(&self.params, self.ukernel.nr(), self.ukernel.kr())),
        )?;

        let context = DispatchContext {
            params: &self.params,
            quantization: &self.quantization,
            layout,
            indirection: self.indirection.entries(),
            sources: TapSources::new(input, zero_buffer.as_slice()),
            packed_weights: packed_weights.as_bytes(),
            ukernel: self.ukernel.as_ref(),
        };
        context.run(output, executor);
        Ok(())
    }

    /// Release the zero and indirection buffers. Idempotent.
    pub fn teardown(&mut self) {
        self.zero_buffer = None;
        self.indirection.release();
        self.state = None;
    }

    pub fn params(&self) -> &DeconvParams {
        &self.params
    }

    pub fn quantization(&self) -> &ConvQuantizationParams {
        &self.quantization
    }

    pub fn state(&self) -> Option<&SetupState> {
        self.state.as_ref()
    }

    pub fn zero_buffer(&self) -> Option<&ZeroBuffer> {
        self.zero_buffer.as_ref()
    }

    pub fn indirection(&self) -> &IndirectionBuffer {
        &self.indirection
    }

    /// Resolve an indirection entry against `input` and the zero buffer.
    ///
    /// Returns `None` when the operator has been torn down.
    pub fn resolve_entry<'a>(&'a self, input: &'a [u8], entry: IndirectionEntry) -> Option<&'a [u8]> {
        let zero = self.zero_buffer.as_ref()?;
        Some(TapSources::new(input, zero.as_slice()).resolve(entry, self.params.group_input_channels))
    }

    pub fn budget(&self) -> &AllocationBudget {
        &self.budget
    }

    /// Input channel stride of one packed group, `round_up(gic, kr)`.
    pub fn k_stride(&self) -> usize {
        self.k_stride
    }

    /// Output channel stride of one packed group, `round_up(goc, nr)`.
    pub fn n_stride(&self) -> usize {
        self.n_stride
    }
}

impl Drop for DeconvOperator {
    fn drop(&mut self) {
        self.teardown();
    }
}

/// Bytes spanned by `pixels` pixels `stride` apart when the last pixel only
/// needs `channels` bytes, or `None` on overflow.
fn tensor_len(pixels: usize, stride: usize, channels: usize) -> Option<usize> {
    match pixels {
        0 => Some(0),
        n => (n - 1).checked_mul(stride)?.checked_add(channels),
    }
}

fn check_len(what: &str, actual: usize, required: Option<usize>) -> Result<(), DeconvError> {
    let Some(required) = required else {
        error!(what, actual, "buffer size overflows");
        return Err(DeconvError::InvalidParameter(format!("{what} buffer size overflows")));
    };
    if actual < required {
        error!(what, actual, required, "buffer too small for deconvolution");
        return Err(DeconvError::InvalidParameter(format!(
            "{what} buffer has {actual} bytes, {required} required"
        )));
    }
    Ok(())
}
