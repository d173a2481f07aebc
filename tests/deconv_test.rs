//! End-to-end deconvolution tests against a direct reference implementation.

use std::sync::Arc;

use q8deconv::engine::{requantization_scale, ConvQuantizationParams};
use q8deconv::{
    deconvolve, deconvolve_with, AllocationBudget, DeconvError, DeconvParams, OutputDims,
    PackedWeights, Q8ConvUkernel, QuantizationParams, ScalarQ8Conv, SerialExecutor, Status,
    ThreadPool, ThreadPoolConfig, TiledExecutor,
};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

// =============================================================================
// Reference
// =============================================================================

struct Case {
    params: DeconvParams,
    batch_size: usize,
    input_dims: [usize; 2],
    input_quant: QuantizationParams,
    output_quant: QuantizationParams,
    input: Vec<u8>,
    kernel: Vec<u8>,
    bias: Vec<i32>,
}

/// Direct transposed convolution: every output pixel sums the input pixels
/// that a forward convolution with the same geometry would have read.
fn reference(case: &Case) -> (OutputDims, Vec<u8>) {
    let p = &case.params;
    let [iw, ih] = case.input_dims;
    let out = p.compute_output_dims(case.input_dims).unwrap();
    let scale = requantization_scale(case.input_quant.scale, p.kernel_scale, case.output_quant.scale).unwrap();
    let q = ConvQuantizationParams::new(
        case.input_quant.zero_point,
        p.kernel_zero_point,
        scale,
        case.output_quant.zero_point,
        p.output_min,
        p.output_max,
    );
    let [kw, kh] = p.kernel_dims;
    let (gic, goc) = (p.group_input_channels, p.group_output_channels);
    let izp = case.input_quant.zero_point as i32;
    let kzp = p.kernel_zero_point as i32;

    let mut output = vec![0u8; case.batch_size * out.size() * p.output_pixel_stride];
    for n in 0..case.batch_size {
        for oy in 0..out.height {
            for ox in 0..out.width {
                for g in 0..p.groups {
                    for oc in 0..goc {
                        let mut acc = case.bias[g * goc + oc];
                        for ky in 0..kh {
                            let y = (oy + p.padding[0]) as isize - (ky * p.dilation[1]) as isize;
                            if y < 0 || y as usize % p.stride_dims[1] != 0 {
                                continue;
                            }
                            let iy = y as usize / p.stride_dims[1];
                            if iy >= ih {
                                continue;
                            }
                            for kx in 0..kw {
                                let x = (ox + p.padding[1]) as isize - (kx * p.dilation[0]) as isize;
                                if x < 0 || x as usize % p.stride_dims[0] != 0 {
                                    continue;
                                }
                                let ix = x as usize / p.stride_dims[0];
                                if ix >= iw {
                                    continue;
                                }
                                let pixel = ((n * ih + iy) * iw + ix) * p.input_pixel_stride + g * gic;
                                for ic in 0..gic {
                                    let a = case.input[pixel + ic] as i32 - izp;
                                    let w = case.kernel[(((g * gic + ic) * kh + ky) * kw + kx) * goc + oc] as i32 - kzp;
                                    acc += a * w;
                                }
                            }
                        }
                        let index = ((n * out.height + oy) * out.width + ox) * p.output_pixel_stride + g * goc + oc;
                        output[index] = q.requantization.requantize(acc);
                    }
                }
            }
        }
    }
    (out, output)
}

fn random_case(rng: &mut StdRng) -> Case {
    let kernel_dims = [rng.gen_range(1..=3), rng.gen_range(1..=3)];
    let stride = [rng.gen_range(1..=3), rng.gen_range(1..=3)];
    let dilation = [rng.gen_range(1..=2), rng.gen_range(1..=2)];
    let groups = rng.gen_range(1..=3);
    let gic = rng.gen_range(1..=11);
    let goc = rng.gen_range(1..=11);
    let input_dims = [rng.gen_range(1..=6), rng.gen_range(1..=6)];
    let adjustment = [rng.gen_range(0..stride[0]), rng.gen_range(0..stride[1])];
    // Total padding per axis stays below the kernel extent so every output is non-empty.
    let top = rng.gen_range(0..kernel_dims[1]);
    let left = rng.gen_range(0..kernel_dims[0]);
    let padding = [
        top,
        left,
        rng.gen_range(0..kernel_dims[1] - top),
        rng.gen_range(0..kernel_dims[0] - left),
    ];
    let input_pixel_stride = groups * gic + rng.gen_range(0..3);
    let output_pixel_stride = groups * goc + rng.gen_range(0..3);

    let params = DeconvParams::new(kernel_dims, groups, gic, goc)
        .with_stride(stride[0], stride[1])
        .with_dilation(dilation[0], dilation[1])
        .with_padding(padding)
        .with_adjustment(adjustment[0], adjustment[1])
        .with_pixel_strides(input_pixel_stride, output_pixel_stride)
        .with_kernel_quantization(rng.gen_range(100..=156), 0.02)
        .with_output_range(rng.gen_range(0..=20), rng.gen_range(235..=255));

    let batch_size = rng.gen_range(1..=2);
    let input_len = batch_size * input_dims[0] * input_dims[1] * input_pixel_stride;
    let ks = kernel_dims[0] * kernel_dims[1];
    Case {
        batch_size,
        input_dims,
        input_quant: QuantizationParams::new(0.5, rng.gen_range(100..=156)),
        output_quant: QuantizationParams::new(0.25, rng.gen_range(100..=156)),
        input: (0..input_len).map(|_| rng.gen()).collect(),
        kernel: (0..groups * gic * ks * goc).map(|_| rng.gen()).collect(),
        bias: (0..groups * goc).map(|_| rng.gen_range(-2000..2000)).collect(),
        params,
    }
}

/// Run `case` and compare the channel bytes of every output pixel.
fn check_case(case: &Case, ukernel: Arc<dyn Q8ConvUkernel>, executor: &dyn TiledExecutor) {
    let (dims, expected) = reference(case);
    let packed = PackedWeights::pack(&case.params, ukernel.as_ref(), &case.kernel, &case.bias).unwrap();
    let mut output = vec![0u8; expected.len()];
    let got_dims = deconvolve_with(
        &case.params,
        &packed,
        case.batch_size,
        case.input_dims[1],
        case.input_dims[0],
        case.input_quant,
        &case.input,
        case.output_quant,
        &mut output,
        executor,
        ukernel,
        &AllocationBudget::default(),
    )
    .unwrap();
    assert_eq!(got_dims, dims);

    let stride = case.params.output_pixel_stride;
    let channels = case.params.output_channels();
    for (pixel, (got, want)) in output.chunks(stride).zip(expected.chunks(stride)).enumerate() {
        assert_eq!(&got[..channels], &want[..channels], "pixel {pixel} of {:?}", case.params);
    }
}

// =============================================================================
// Scenarios
// =============================================================================

#[test]
fn identity_through_zero_centered_values() {
    let params = DeconvParams::new([1, 1], 1, 1, 1).with_kernel_quantization(128, 1.0);
    let packed = PackedWeights::pack(&params, &ScalarQ8Conv::default(), &[0], &[0]).unwrap();
    let mut output = [0u8; 1];
    let dims = deconvolve(
        &params,
        &packed,
        1,
        1,
        1,
        QuantizationParams::new(1.0, 128),
        &[128],
        QuantizationParams::new(1.0, 128),
        &mut output,
        &SerialExecutor,
    )
    .unwrap();
    assert_eq!(dims, OutputDims { width: 1, height: 1 });
    assert_eq!(output, [128]);
}

#[test]
fn stride_two_output_dims_follow_formula() {
    let params = DeconvParams::new([2, 2], 1, 1, 1).with_stride(2, 2);
    let packed = PackedWeights::pack(&params, &ScalarQ8Conv::default(), &[1, 2, 3, 4], &[0]).unwrap();
    let mut output = [0u8; 16];
    let dims = deconvolve(
        &params,
        &packed,
        1,
        2,
        2,
        QuantizationParams::new(1.0, 0),
        &[1, 2, 3, 4],
        QuantizationParams::new(1.0, 0),
        &mut output,
        &SerialExecutor,
    )
    .unwrap();
    // (input - 1) * stride - 2 * padding + dilation * (kernel - 1) + adjustment + 1
    let expected = (2 - 1) * 2 + (2 - 1) + 1;
    assert_eq!(dims, OutputDims { width: expected, height: expected });
    // Each input pixel scatters the whole kernel into its own 2x2 block.
    #[rustfmt::skip]
    let want = [
        1, 2, 2, 4,
        3, 4, 6, 8,
        3, 6, 4, 8,
        9, 12, 12, 16,
    ];
    assert_eq!(output, want);
}

#[test]
fn random_geometry_matches_reference_serial() {
    let mut rng = StdRng::seed_from_u64(0x5eed);
    for _ in 0..40 {
        let case = random_case(&mut rng);
        check_case(&case, Arc::new(ScalarQ8Conv::default()), &SerialExecutor);
    }
}

#[test]
fn random_geometry_matches_reference_thread_pool() {
    let pool = ThreadPool::new(ThreadPoolConfig::with_threads(4)).unwrap();
    let mut rng = StdRng::seed_from_u64(0xdec0);
    for _ in 0..40 {
        let case = random_case(&mut rng);
        check_case(&case, Arc::new(ScalarQ8Conv::default()), &pool);
    }
    assert!(pool.stats().jobs_executed > 0);
}

#[test]
fn other_tile_shapes_match_reference() {
    let pool = ThreadPool::new(ThreadPoolConfig::with_threads(3)).unwrap();
    let mut rng = StdRng::seed_from_u64(7);
    for (mr, nr, kr) in [(1, 1, 1), (2, 4, 2), (8, 3, 4), (5, 16, 8)] {
        for _ in 0..8 {
            let case = random_case(&mut rng);
            check_case(&case, Arc::new(ScalarQ8Conv::new(mr, nr, kr).unwrap()), &pool);
        }
    }
}

#[test]
fn repeated_runs_are_byte_identical() {
    let mut rng = StdRng::seed_from_u64(42);
    let case = random_case(&mut rng);
    let ukernel = ScalarQ8Conv::default();
    let packed = PackedWeights::pack(&case.params, &ukernel, &case.kernel, &case.bias).unwrap();
    let (_, expected) = reference(&case);
    let pool = ThreadPool::new(ThreadPoolConfig::with_threads(4)).unwrap();

    let mut outputs = Vec::new();
    for executor in [&pool as &dyn TiledExecutor, &SerialExecutor, &pool] {
        let mut output = vec![0u8; expected.len()];
        deconvolve(
            &case.params,
            &packed,
            case.batch_size,
            case.input_dims[1],
            case.input_dims[0],
            case.input_quant,
            &case.input,
            case.output_quant,
            &mut output,
            executor,
        )
        .unwrap();
        outputs.push(output);
    }
    assert_eq!(outputs[0], outputs[1]);
    assert_eq!(outputs[1], outputs[2]);
}

// =============================================================================
// Rejections and special cases
// =============================================================================

#[test]
fn invalid_scales_are_rejected_before_allocation() {
    let params = DeconvParams::new([3, 3], 1, 4, 4);
    let packed = PackedWeights::pack(&params, &ScalarQ8Conv::default(), &[0; 144], &[0; 4]).unwrap();
    let bad = [0.0f32, -0.5, f32::NAN, f32::INFINITY, f32::MIN_POSITIVE / 4.0];

    for scale in bad {
        for (input_scale, output_scale) in [(scale, 1.0), (1.0, scale)] {
            let budget = AllocationBudget::default();
            let mut output = [0u8; 400];
            let err = deconvolve_with(
                &params,
                &packed,
                1,
                4,
                4,
                QuantizationParams::new(input_scale, 0),
                &[0; 64],
                QuantizationParams::new(output_scale, 0),
                &mut output,
                &SerialExecutor,
                Arc::new(ScalarQ8Conv::default()),
                &budget,
            )
            .unwrap_err();
            assert_eq!(err.status(), Status::InvalidParameter, "scale {scale}");
            assert_eq!(budget.allocations(), 0);
            assert_eq!(budget.peak_bytes(), 0);
        }
    }
}

#[test]
fn empty_batch_is_a_no_op() {
    let params = DeconvParams::new([3, 3], 1, 4, 4);
    let packed = PackedWeights::from_bytes(Vec::new());
    let budget = AllocationBudget::default();
    let mut output = [0x5Au8; 16];
    // Even an invalid scale is not looked at.
    let dims = deconvolve_with(
        &params,
        &packed,
        0,
        4,
        4,
        QuantizationParams::new(f32::NAN, 0),
        &[],
        QuantizationParams::new(1.0, 0),
        &mut output,
        &SerialExecutor,
        Arc::new(ScalarQ8Conv::default()),
        &budget,
    )
    .unwrap();
    assert_eq!(dims, OutputDims { width: 0, height: 0 });
    assert_eq!(budget.allocations(), 0);
    assert_eq!(output, [0x5A; 16]);
}

#[test]
fn out_of_memory_releases_all_buffers() {
    let params = DeconvParams::new([3, 3], 2, 4, 4);
    let packed = PackedWeights::pack(&params, &ScalarQ8Conv::default(), &[0; 288], &[0; 8]).unwrap();
    let budget = AllocationBudget::with_limit(64);
    let mut output = vec![0u8; 100 * 8];
    let err = deconvolve_with(
        &params,
        &packed,
        1,
        8,
        8,
        QuantizationParams::new(1.0, 0),
        &[0; 128],
        QuantizationParams::new(1.0, 0),
        &mut output,
        &SerialExecutor,
        Arc::new(ScalarQ8Conv::default()),
        &budget,
    )
    .unwrap_err();
    assert!(matches!(err, DeconvError::OutOfMemory { .. }));
    assert_eq!(budget.current_bytes(), 0);
    assert!(output.iter().all(|&b| b == 0));
}

#[test]
fn overflowing_sizes_fail_and_release_all_buffers() {
    let params = DeconvParams::new([3, 3], 1, 4, 4);
    let packed = PackedWeights::pack(&params, &ScalarQ8Conv::default(), &[0; 144], &[0; 4]).unwrap();
    let shapes = [
        (usize::MAX / 8, 4, 4, Status::OutOfMemory),
        (1, usize::MAX / 2, usize::MAX / 2, Status::InvalidParameter),
    ];
    for (batch_size, height, width, status) in shapes {
        let budget = AllocationBudget::default();
        let mut output = [0u8; 16];
        let err = deconvolve_with(
            &params,
            &packed,
            batch_size,
            height,
            width,
            QuantizationParams::new(1.0, 0),
            &[0; 16],
            QuantizationParams::new(1.0, 0),
            &mut output,
            &SerialExecutor,
            Arc::new(ScalarQ8Conv::default()),
            &budget,
        )
        .unwrap_err();
        assert_eq!(err.status(), status, "batch {batch_size} input {height}x{width}");
        assert_eq!(budget.current_bytes(), 0);
        assert_eq!(output, [0; 16]);
    }
}

#[test]
fn successful_call_releases_all_buffers() {
    let mut rng = StdRng::seed_from_u64(3);
    let case = random_case(&mut rng);
    let packed = PackedWeights::pack(&case.params, &ScalarQ8Conv::default(), &case.kernel, &case.bias).unwrap();
    let (_, expected) = reference(&case);
    let budget = AllocationBudget::default();
    let mut output = vec![0u8; expected.len()];
    deconvolve_with(
        &case.params,
        &packed,
        case.batch_size,
        case.input_dims[1],
        case.input_dims[0],
        case.input_quant,
        &case.input,
        case.output_quant,
        &mut output,
        &SerialExecutor,
        Arc::new(ScalarQ8Conv::default()),
        &budget,
    )
    .unwrap();
    assert_eq!(budget.allocations(), 2);
    assert!(budget.peak_bytes() > 0);
    assert_eq!(budget.current_bytes(), 0);
}
