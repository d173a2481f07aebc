//! Deconvolution geometry and kernel quantization parameters.
//!
//! Spatial pairs are stored `[width, height]`; padding is stored
//! `[top, left, bottom, right]`.

use super::error::DeconvError;

/// Output spatial size of a deconvolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutputDims {
    pub width: usize,
    pub height: usize,
}

impl OutputDims {
    /// Number of output pixels per image.
    pub fn size(&self) -> usize {
        self.width * self.height
    }
}

/// Everything that describes one deconvolution besides the activations.
#[derive(Debug, Clone, PartialEq)]
pub struct DeconvParams {
    pub kernel_dims: [usize; 2],
    pub stride_dims: [usize; 2],
    pub dilation: [usize; 2],
    pub padding: [usize; 4],
    pub adjustment_dims: [usize; 2],
    pub groups: usize,
    pub group_input_channels: usize,
    pub group_output_channels: usize,
    /// Distance in bytes between consecutive input pixels.
    pub input_pixel_stride: usize,
    /// Distance in bytes between consecutive output pixels.
    pub output_pixel_stride: usize,
    pub kernel_zero_point: u8,
    pub kernel_scale: f32,
    pub output_min: u8,
    pub output_max: u8,
}

impl DeconvParams {
    /// Dense parameters: unit stride and dilation, no padding, tightly packed
    /// pixels, full output range.
    pub fn new(
        kernel_dims: [usize; 2],
        groups: usize,
        group_input_channels: usize,
        group_output_channels: usize,
    ) -> Self {
        Self {
            kernel_dims,
            stride_dims: [1, 1],
            dilation: [1, 1],
            padding: [0; 4],
            adjustment_dims: [0, 0],
            groups,
            group_input_channels,
            group_output_channels,
            input_pixel_stride: groups * group_input_channels,
            output_pixel_stride: groups * group_output_channels,
            kernel_zero_point: 0,
            kernel_scale: 1.0,
            output_min: 0,
            output_max: 255,
        }
    }

    pub fn with_stride(mut self, width: usize, height: usize) -> Self {
        self.stride_dims = [width, height];
        self
    }

    pub fn with_dilation(mut self, width: usize, height: usize) -> Self {
        self.dilation = [width, height];
        self
    }

    /// Padding as `[top, left, bottom, right]`.
    pub fn with_padding(mut self, padding: [usize; 4]) -> Self {
        self.padding = padding;
        self
    }

    pub fn with_adjustment(mut self, width: usize, height: usize) -> Self {
        self.adjustment_dims = [width, height];
        self
    }

    pub fn with_pixel_strides(mut self, input: usize, output: usize) -> Self {
        self.input_pixel_stride = input;
        self.output_pixel_stride = output;
        self
    }

    pub fn with_kernel_quantization(mut self, zero_point: u8, scale: f32) -> Self {
        self.kernel_zero_point = zero_point;
        self.kernel_scale = scale;
        self
    }

    pub fn with_output_range(mut self, min: u8, max: u8) -> Self {
        self.output_min = min;
        self.output_max = max;
        self
    }

    pub fn kernel_width(&self) -> usize {
        self.kernel_dims[0]
    }

    pub fn kernel_height(&self) -> usize {
        self.kernel_dims[1]
    }

    pub fn kernel_size(&self) -> usize {
        self.kernel_dims[0] * self.kernel_dims[1]
    }

    pub fn input_channels(&self) -> usize {
        self.groups * self.group_input_channels
    }

    pub fn output_channels(&self) -> usize {
        self.groups * self.group_output_channels
    }

    /// Validate the geometry. Does not look at scales.
    pub fn validate(&self) -> Result<(), DeconvError> {
        let counts = [
            ("kernel width", self.kernel_dims[0]),
            ("kernel height", self.kernel_dims[1]),
            ("stride width", self.stride_dims[0]),
            ("stride height", self.stride_dims[1]),
            ("dilation width", self.dilation[0]),
            ("dilation height", self.dilation[1]),
            ("groups", self.groups),
            ("group input channels", self.group_input_channels),
            ("group output channels", self.group_output_channels),
        ];
        for (what, value) in counts {
            if value == 0 {
                return Err(DeconvError::InvalidParameter(format!("{what} must be non-zero")));
            }
        }
        for axis in 0..2 {
            if self.adjustment_dims[axis] >= self.stride_dims[axis] {
                return Err(DeconvError::InvalidParameter(format!(
                    "adjustment {} must be smaller than stride {}",
                    self.adjustment_dims[axis], self.stride_dims[axis]
                )));
            }
        }
        if self.input_pixel_stride < self.input_channels() {
            return Err(DeconvError::InvalidParameter(format!(
                "input pixel stride {} is smaller than {} input channels",
                self.input_pixel_stride,
                self.input_channels()
            )));
        }
        if self.output_pixel_stride < self.output_channels() {
            return Err(DeconvError::InvalidParameter(format!(
                "output pixel stride {} is smaller than {} output channels",
                self.output_pixel_stride,
                self.output_channels()
            )));
        }
        if self.output_min > self.output_max {
            return Err(DeconvError::InvalidParameter(format!(
                "output min {} exceeds output max {}",
                self.output_min, self.output_max
            )));
        }
        Ok(())
    }

    /// Output size of a transposed convolution over `input_dims = [width, height]`:
    /// `stride * (input - 1) + adjustment + dilation * (kernel - 1) + 1 - pad_before - pad_after`.
    ///
    /// Sizes whose pixel count does not fit in `usize` are rejected, so
    /// [`OutputDims::size`] never overflows on the result.
    pub fn compute_output_dims(&self, input_dims: [usize; 2]) -> Result<OutputDims, DeconvError> {
        let pads = [
            self.padding[1].checked_add(self.padding[3]),
            self.padding[0].checked_add(self.padding[2]),
        ];
        let mut out = [0usize; 2];
        for axis in 0..2 {
            if input_dims[axis] == 0 {
                return Err(DeconvError::InvalidParameter("input dimensions must be non-zero".into()));
            }
            let kernel_extent = self.kernel_dims[axis]
                .checked_sub(1)
                .and_then(|k| self.dilation[axis].checked_mul(k));
            let full = self.stride_dims[axis]
                .checked_mul(input_dims[axis] - 1)
                .and_then(|v| v.checked_add(self.adjustment_dims[axis]))
                .and_then(|v| v.checked_add(kernel_extent?))
                .and_then(|v| v.checked_add(1))
                .ok_or_else(|| {
                    DeconvError::InvalidParameter(format!(
                        "input size {} overflows the output size",
                        input_dims[axis]
                    ))
                })?;
            let pads = pads[axis]
                .ok_or_else(|| DeconvError::InvalidParameter("padding overflows".into()))?;
            out[axis] = match full.checked_sub(pads) {
                Some(size) if size > 0 => size,
                _ => {
                    return Err(DeconvError::InvalidParameter(format!(
                        "padding {} leaves no output along an axis of size {}",
                        pads, full
                    )))
                }
            };
        }
        if out[0].checked_mul(out[1]).is_none() {
            return Err(DeconvError::InvalidParameter(format!(
                "output of {}x{} pixels overflows",
                out[0], out[1]
            )));
        }
        Ok(OutputDims { width: out[0], height: out[1] })
    }
}
