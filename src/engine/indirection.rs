//! Indirection buffer for transposed convolution.
//!
//! One entry per (group, image, tiled output pixel, kernel tap) tells the
//! micro-kernel where that tap's input channels live: either at an offset into
//! the input tensor, or in the zero-padding buffer. The micro-kernel then runs
//! a dense GEMM over the gathered rows with no bounds checks of its own.
//!
//! Within a (group, image) block, entries for one row tile of `mr` outputs
//! are stored kernel-tap major: `tile_start * ks + tap * mr + tile_offset`.

use super::error::DeconvError;
use super::params::{DeconvParams, OutputDims};
use crate::memory::{AllocationBudget, Reservation};

/// Where one kernel tap of one output pixel reads its input channels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IndirectionEntry {
    /// Padding, stride gap, or a tile row past the last output pixel.
    #[default]
    Zero,
    /// Byte offset of the group's first channel in the input tensor.
    Input { offset: usize },
}

/// The two buffers an [`IndirectionEntry`] can resolve into.
#[derive(Debug, Clone, Copy)]
pub struct TapSources<'a> {
    input: &'a [u8],
    zero: &'a [u8],
}

impl<'a> TapSources<'a> {
    pub fn new(input: &'a [u8], zero: &'a [u8]) -> Self {
        Self { input, zero }
    }

    /// The `channels` bytes `entry` points at.
    #[inline]
    pub fn resolve(&self, entry: IndirectionEntry, channels: usize) -> &'a [u8] {
        match entry {
            IndirectionEntry::Zero => &self.zero[..channels],
            IndirectionEntry::Input { offset } => &self.input[offset..offset + channels],
        }
    }
}

/// Geometry of a built indirection buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndirectionLayout {
    pub batch_size: usize,
    pub groups: usize,
    pub output_size: usize,
    pub tiled_output_size: usize,
    pub output_tile_size: usize,
    pub kernel_size: usize,
}

impl IndirectionLayout {
    /// Entry count, or `None` when it does not fit in `usize`.
    pub fn len(&self) -> Option<usize> {
        self.batch_size
            .checked_mul(self.groups)?
            .checked_mul(self.tiled_output_size)?
            .checked_mul(self.kernel_size)
    }

    /// First entry of the row tile starting at output `tile_start`.
    pub fn tile_offset(&self, group: usize, image: usize, tile_start: usize) -> usize {
        (group * self.batch_size + image) * self.tiled_output_size * self.kernel_size
            + tile_start * self.kernel_size
    }

    /// Entry for one output pixel and kernel tap.
    pub fn index(&self, group: usize, image: usize, output_index: usize, tap: usize) -> usize {
        let tile_start = output_index - output_index % self.output_tile_size;
        self.tile_offset(group, image, tile_start)
            + tap * self.output_tile_size
            + output_index % self.output_tile_size
    }
}

/// Resizable table of indirection entries.
///
/// Reusing a buffer across setups resizes the existing storage and its budget
/// reservation in place.
#[derive(Debug, Default)]
pub struct IndirectionBuffer {
    entries: Vec<IndirectionEntry>,
    layout: Option<IndirectionLayout>,
    reservation: Option<Reservation>,
}

impl IndirectionBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> &[IndirectionEntry] {
        &self.entries
    }

    pub fn layout(&self) -> Option<&IndirectionLayout> {
        self.layout.as_ref()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Bytes reserved for the entries.
    pub fn reserved_bytes(&self) -> usize {
        self.reservation.as_ref().map_or(0, Reservation::bytes)
    }

    /// Resize to `layout.len()` entries, all [`IndirectionEntry::Zero`].
    ///
    /// A layout whose byte size overflows `usize` fails with `OutOfMemory`
    /// before anything is reserved.
    pub fn resize(&mut self, layout: IndirectionLayout, budget: &AllocationBudget) -> Result<(), DeconvError> {
        let (len, bytes) = layout
            .len()
            .and_then(|len| Some((len, len.checked_mul(std::mem::size_of::<IndirectionEntry>())?)))
            .ok_or(DeconvError::OutOfMemory { what: "indirection buffer", bytes: usize::MAX })?;

        match self.reservation.as_mut() {
            Some(reservation) => reservation.resize(bytes)?,
            None => self.reservation = Some(budget.try_reserve("indirection buffer", bytes)?),
        }

        self.entries.clear();
        self.entries
            .try_reserve_exact(len)
            .map_err(|_| DeconvError::OutOfMemory { what: "indirection buffer", bytes })?;
        self.entries.resize(len, IndirectionEntry::Zero);
        self.entries.shrink_to(len);
        self.layout = Some(layout);
        Ok(())
    }

    /// Drop the entries and return their bytes to the budget.
    pub fn release(&mut self) {
        self.entries = Vec::new();
        self.layout = None;
        self.reservation = None;
    }

    /// Fill every entry for a deconvolution over `input_dims = [width, height]`.
    ///
    /// Must follow a successful [`resize`](Self::resize) with the same layout.
    pub fn build(&mut self, params: &DeconvParams, input_dims: [usize; 2], output: OutputDims) {
        let Some(layout) = self.layout else {
            return;
        };
        let [input_width, input_height] = input_dims;
        let [kernel_width, kernel_height] = params.kernel_dims;
        let [stride_width, stride_height] = params.stride_dims;
        let [dilation_width, dilation_height] = params.dilation;
        let padding_top = params.padding[0];
        let padding_left = params.padding[1];
        let mr = layout.output_tile_size;

        for group in 0..layout.groups {
            for image in 0..layout.batch_size {
                for tile_start in (0..layout.tiled_output_size).step_by(mr) {
                    let base = layout.tile_offset(group, image, tile_start);
                    for tile_offset in 0..mr {
                        let output_index = tile_start + tile_offset;
                        if output_index >= layout.output_size {
                            for tap in 0..layout.kernel_size {
                                self.entries[base + tap * mr + tile_offset] = IndirectionEntry::Zero;
                            }
                            continue;
                        }
                        let oy = output_index / output.width;
                        let ox = output_index % output.width;
                        for ky in 0..kernel_height {
                            let iy = source_coordinate(
                                oy + padding_top,
                                ky * dilation_height,
                                stride_height,
                                input_height,
                            );
                            for kx in 0..kernel_width {
                                let ix = source_coordinate(
                                    ox + padding_left,
                                    kx * dilation_width,
                                    stride_width,
                                    input_width,
                                );
                                let entry = match (iy, ix) {
                                    (Some(iy), Some(ix)) => IndirectionEntry::Input {
                                        offset: ((image * input_height + iy) * input_width + ix)
                                            * params.input_pixel_stride
                                            + group * params.group_input_channels,
                                    },
                                    _ => IndirectionEntry::Zero,
                                };
                                let tap = ky * kernel_width + kx;
                                self.entries[base + tap * mr + tile_offset] = entry;
                            }
                        }
                    }
                }
            }
        }
    }
}

/// Input coordinate a forward convolution would have written to `padded`
/// from under kernel offset `tap`, if it is a real input sample.
#[inline]
fn source_coordinate(padded: usize, tap: usize, stride: usize, extent: usize) -> Option<usize> {
    let y = padded.checked_sub(tap)?;
    if y % stride != 0 {
        return None;
    }
    let i = y / stride;
    (i < extent).then_some(i)
}
