//! One-shot quantized deconvolution entry points.

use std::sync::Arc;

use super::error::DeconvError;
use super::operator::DeconvOperator;
use super::params::{DeconvParams, OutputDims};
use super::quantization::QuantizationParams;
use super::ukernel::{PackedWeights, Q8ConvUkernel, ScalarQ8Conv};
use crate::memory::AllocationBudget;
use crate::scheduler::TiledExecutor;
use crate::telemetry::{self, DeconvSpan, SpanExt};

/// Run one deconvolution with the reference micro-kernel and an unlimited budget.
///
/// `packed_weights` must be laid out for [`ScalarQ8Conv::default`].
#[allow(clippy::too_many_arguments)]
pub fn deconvolve(
    params: &DeconvParams,
    packed_weights: &PackedWeights,
    batch_size: usize,
    input_height: usize,
    input_width: usize,
    input_quantization: QuantizationParams,
    input: &[u8],
    output_quantization: QuantizationParams,
    output: &mut [u8],
    executor: &dyn TiledExecutor,
) -> Result<OutputDims, DeconvError> {
    deconvolve_with(
        params,
        packed_weights,
        batch_size,
        input_height,
        input_width,
        input_quantization,
        input,
        output_quantization,
        output,
        executor,
        Arc::new(ScalarQ8Conv::default()),
        &AllocationBudget::default(),
    )
}

/// Run one deconvolution with a caller-chosen micro-kernel and budget.
///
/// A batch of zero images succeeds immediately with empty output dims,
/// before any parameter is validated, and leaves `output` untouched.
/// Every buffer allocated for the call is released before returning.
#[allow(clippy::too_many_arguments)]
pub fn deconvolve_with(
    params: &DeconvParams,
    packed_weights: &PackedWeights,
    batch_size: usize,
    input_height: usize,
    input_width: usize,
    input_quantization: QuantizationParams,
    input: &[u8],
    output_quantization: QuantizationParams,
    output: &mut [u8],
    executor: &dyn TiledExecutor,
    ukernel: Arc<dyn Q8ConvUkernel>,
    budget: &AllocationBudget,
) -> Result<OutputDims, DeconvError> {
    if batch_size == 0 {
        telemetry::record_run_success();
        return Ok(OutputDims { width: 0, height: 0 });
    }

    let span = DeconvSpan::new(batch_size, input_height, input_width, params.groups);
    let _guard = span.enter();

    let result = run_once(
        params,
        packed_weights,
        [batch_size, input_height, input_width],
        input_quantization,
        input,
        output_quantization,
        output,
        executor,
        ukernel,
        budget,
    );

    span.record_result(&result);
    match &result {
        Ok(_) => telemetry::record_run_success(),
        Err(e) => telemetry::record_run_failure(e.status().as_str()),
    }
    result
}

#[allow(clippy::too_many_arguments)]
fn run_once(
    params: &DeconvParams,
    packed_weights: &PackedWeights,
    [batch_size, input_height, input_width]: [usize; 3],
    input_quantization: QuantizationParams,
    input: &[u8],
    output_quantization: QuantizationParams,
    output: &mut [u8],
    executor: &dyn TiledExecutor,
    ukernel: Arc<dyn Q8ConvUkernel>,
    budget: &AllocationBudget,
) -> Result<OutputDims, DeconvError> {
    let mut operator = DeconvOperator::create(
        params.clone(),
        input_quantization,
        output_quantization,
        ukernel,
        budget.clone(),
    )?;
    let dims = operator.setup(batch_size, input_height, input_width)?;
    operator.run(packed_weights, input, output, executor)?;
    Ok(dims)
}
