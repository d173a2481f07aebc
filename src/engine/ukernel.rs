//! Quantized convolution micro-kernel seam.
//!
//! A micro-kernel computes one `mr x nr` output tile from `ks` indirection
//! rows per output row, a packed weight block and the requantization
//! parameters. [`ScalarQ8Conv`] is the portable reference kernel; its packed
//! weight layout is produced by [`PackedWeights::pack`].
//!
//! Packed layout, per group, per block of `nr` output channels:
//!
//! ```text
//! [nr x i32 bias (LE)] [ks x (k_stride / kr) x nr x kr weight bytes]
//! ```
//!
//! Channel padding holds the kernel zero point, bias padding holds 0.

use std::marker::PhantomData;

use super::error::DeconvError;
use super::indirection::{IndirectionEntry, TapSources};
use super::params::DeconvParams;
use super::quantization::ConvQuantizationParams;

/// Round `value` up to a multiple of `multiple`.
#[inline]
pub fn round_up(value: usize, multiple: usize) -> usize {
    value.div_ceil(multiple) * multiple
}

/// Inputs of one micro-kernel call.
pub struct UkernelTile<'a> {
    /// Valid rows in this tile (`<= mr`).
    pub rows: usize,
    /// Valid columns in this tile (`<= nr`).
    pub cols: usize,
    /// Input channels per group.
    pub kc: usize,
    /// Kernel positions.
    pub ks: usize,
    /// `ks x mr` entries, kernel-position major.
    pub indirection: &'a [IndirectionEntry],
    pub sources: TapSources<'a>,
    /// Packed block for this tile's columns: biases followed by weights.
    pub weights: &'a [u8],
    pub quantization: &'a ConvQuantizationParams,
}

/// Micro-kernel computing one quantized GEMM tile.
pub trait Q8ConvUkernel: Send + Sync {
    /// Output rows per tile.
    fn mr(&self) -> usize;
    /// Output channels per tile.
    fn nr(&self) -> usize;
    /// Input-channel packing granularity.
    fn kr(&self) -> usize;
    /// Compute `tile.rows x tile.cols` outputs.
    fn compute(&self, tile: &UkernelTile<'_>, output: &mut TileOutput<'_>);
}

/// Portable reference kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScalarQ8Conv {
    mr: usize,
    nr: usize,
    kr: usize,
}

impl Default for ScalarQ8Conv {
    fn default() -> Self {
        Self { mr: 4, nr: 8, kr: 1 }
    }
}

impl ScalarQ8Conv {
    pub fn new(mr: usize, nr: usize, kr: usize) -> Result<Self, DeconvError> {
        if mr == 0 || nr == 0 || kr == 0 {
            return Err(DeconvError::InvalidParameter(format!(
                "micro-kernel tile {mr}x{nr} (kr {kr}) must be non-zero"
            )));
        }
        Ok(Self { mr, nr, kr })
    }
}

impl Q8ConvUkernel for ScalarQ8Conv {
    fn mr(&self) -> usize {
        self.mr
    }

    fn nr(&self) -> usize {
        self.nr
    }

    fn kr(&self) -> usize {
        self.kr
    }

    fn compute(&self, tile: &UkernelTile<'_>, output: &mut TileOutput<'_>) {
        let q = tile.quantization;
        let izp = q.input_zero_point as i32;
        let kzp = q.kernel_zero_point as i32;
        let k_blocks = round_up(tile.kc, self.kr) / self.kr;
        let bias_bytes = self.nr * 4;

        for m in 0..tile.rows {
            for n in 0..tile.cols {
                let b = &tile.weights[n * 4..n * 4 + 4];
                let mut acc = i32::from_le_bytes([b[0], b[1], b[2], b[3]]);
                for ki in 0..tile.ks {
                    let a = tile.sources.resolve(tile.indirection[ki * self.mr + m], tile.kc);
                    let block = bias_bytes + ki * k_blocks * self.nr * self.kr;
                    for (k, &av) in a.iter().enumerate() {
                        let w = tile.weights
                            [block + ((k / self.kr) * self.nr + n) * self.kr + k % self.kr];
                        acc = acc.wrapping_add((av as i32 - izp) * (w as i32 - kzp));
                    }
                }
                output.store(m, n, q.requantization.requantize(acc));
            }
        }
    }
}

/// Writable view of one output tile inside a buffer shared by all tiles.
///
/// Rows are `stride` bytes apart. Tiles handed out for one dispatch never
/// overlap, which is what makes concurrent writes through them sound.
pub struct TileOutput<'a> {
    ptr: *mut u8,
    len: usize,
    base: usize,
    stride: usize,
    rows: usize,
    cols: usize,
    _marker: PhantomData<&'a mut [u8]>,
}

impl<'a> TileOutput<'a> {
    /// View over an exclusively borrowed buffer.
    pub fn new(buffer: &'a mut [u8], base: usize, stride: usize, rows: usize, cols: usize) -> Self {
        Self {
            ptr: buffer.as_mut_ptr(),
            len: buffer.len(),
            base,
            stride,
            rows,
            cols,
            _marker: PhantomData,
        }
    }

    /// # Safety
    /// `ptr` must be valid for writes of `len` bytes for `'a`, and no other
    /// live `TileOutput` may cover any of the bytes this tile can address.
    pub(crate) unsafe fn from_raw(
        ptr: *mut u8,
        len: usize,
        base: usize,
        stride: usize,
        rows: usize,
        cols: usize,
    ) -> Self {
        Self {
            ptr,
            len,
            base,
            stride,
            rows,
            cols,
            _marker: PhantomData,
        }
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn cols(&self) -> usize {
        self.cols
    }

    /// Write one output value at (`row`, `col`) of the tile.
    #[inline]
    pub fn store(&mut self, row: usize, col: usize, value: u8) {
        assert!(row < self.rows && col < self.cols, "store outside tile");
        let index = self.base + row * self.stride + col;
        assert!(index < self.len, "store outside output buffer");
        // SAFETY: index is in bounds and this tile exclusively owns it.
        unsafe { *self.ptr.add(index) = value };
    }
}

/// Opaque packed-weights blob consumed by the dispatcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackedWeights {
    data: Vec<u8>,
}

impl PackedWeights {
    /// Wrap a blob produced by an external packer.
    pub fn from_bytes(data: Vec<u8>) -> Self {
        Self { data }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    /// Bytes of one group's packed weights.
    pub fn group_stride(params: &DeconvParams, nr: usize, kr: usize) -> usize {
        let k_stride = round_up(params.group_input_channels, kr);
        let n_stride = round_up(params.group_output_channels, nr);
        n_stride * (k_stride * params.kernel_size() + 4)
    }

    /// Bytes the dispatcher expects for `params`.
    pub fn packed_len(params: &DeconvParams, nr: usize, kr: usize) -> usize {
        params.groups * Self::group_stride(params, nr, kr)
    }

    /// Pack an unpacked kernel for `ukernel`.
    ///
    /// `kernel` is laid out `[group][input_channel][ky][kx][output_channel]`
    /// and `bias` holds one i32 per output channel across all groups.
    pub fn pack(
        params: &DeconvParams,
        ukernel: &dyn Q8ConvUkernel,
        kernel: &[u8],
        bias: &[i32],
    ) -> Result<Self, DeconvError> {
        let (nr, kr) = (ukernel.nr(), ukernel.kr());
        let groups = params.groups;
        let gic = params.group_input_channels;
        let goc = params.group_output_channels;
        let ks = params.kernel_size();
        let k_stride = round_up(gic, kr);

        if kernel.len() != groups * gic * ks * goc {
            return Err(DeconvError::InvalidParameter(format!(
                "kernel has {} bytes, expected {}",
                kernel.len(),
                groups * gic * ks * goc
            )));
        }
        if bias.len() != groups * goc {
            return Err(DeconvError::InvalidParameter(format!(
                "bias has {} entries, expected {}",
                bias.len(),
                groups * goc
            )));
        }

        let mut data = Vec::with_capacity(Self::packed_len(params, nr, kr));
        for g in 0..groups {
            for nr_start in (0..goc).step_by(nr) {
                let nr_size = nr.min(goc - nr_start);
                for off in 0..nr {
                    let b = if off < nr_size { bias[g * goc + nr_start + off] } else { 0 };
                    data.extend_from_slice(&b.to_le_bytes());
                }
                for ki in 0..ks {
                    for kr_start in (0..k_stride).step_by(kr) {
                        for off in 0..nr {
                            for kr_off in 0..kr {
                                let ic = kr_start + kr_off;
                                let value = if off < nr_size && ic < gic {
                                    kernel[((g * gic + ic) * ks + ki) * goc + nr_start + off]
                                } else {
                                    params.kernel_zero_point
                                };
                                data.push(value);
                            }
                        }
                    }
                }
            }
        }
        debug_assert_eq!(data.len(), Self::packed_len(params, nr, kr));
        Ok(Self { data })
    }
}
