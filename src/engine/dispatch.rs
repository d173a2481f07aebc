//! Tiled parallel dispatch of micro-kernel calls.
//!
//! The iteration space is `(groups, batch, output pixels, group output
//! channels)`, tiled `(1, 1, mr, nr)`. Each tile reads its own indirection
//! rows and packed weight block and writes a disjoint `mr x nr` block of the
//! output tensor.

use tracing::{debug, Span};

use super::indirection::{IndirectionEntry, IndirectionLayout, TapSources};
use super::params::DeconvParams;
use super::quantization::ConvQuantizationParams;
use super::ukernel::{round_up, Q8ConvUkernel, TileOutput, UkernelTile};
use crate::scheduler::{Tile4d, TileGrid, TiledExecutor};
use crate::telemetry;

/// Everything a tile needs, shared read-only by all tiles.
pub(crate) struct DispatchContext<'a> {
    pub params: &'a DeconvParams,
    pub quantization: &'a ConvQuantizationParams,
    pub layout: &'a IndirectionLayout,
    pub indirection: &'a [IndirectionEntry],
    pub sources: TapSources<'a>,
    pub packed_weights: &'a [u8],
    pub ukernel: &'a dyn Q8ConvUkernel,
}

/// Output buffer shared across tiles.
struct SharedOutput {
    ptr: *mut u8,
    len: usize,
}

// SAFETY: tiles of one dispatch address disjoint bytes, and the buffer is
// exclusively borrowed for the whole dispatch.
unsafe impl Sync for SharedOutput {}

impl DispatchContext<'_> {
    /// Run every tile on `executor` and return the number of tiles.
    pub fn run(&self, output: &mut [u8], executor: &dyn TiledExecutor) -> usize {
        let (mr, nr, kr) = (self.ukernel.mr(), self.ukernel.nr(), self.ukernel.kr());
        let range = [
            self.layout.groups,
            self.layout.batch_size,
            self.layout.output_size,
            self.params.group_output_channels,
        ];
        let tile = [1, 1, mr, nr];
        let tiles = TileGrid::new(range, tile).len();

        debug!(
            groups = range[0],
            batch_size = range[1],
            output_size = range[2],
            channels = range[3],
            tiles,
            threads = executor.num_threads(),
            "dispatching deconvolution tiles"
        );

        let shared = SharedOutput {
            ptr: output.as_mut_ptr(),
            len: output.len(),
        };
        let k_stride = round_up(self.params.group_input_channels, kr);
        let n_stride = round_up(self.params.group_output_channels, nr);
        let column_block_bytes = k_stride * self.layout.kernel_size + 4;

        executor.compute_4d_tiled(range, tile, &|t: Tile4d| {
            self.compute_tile(t, &shared, n_stride, column_block_bytes);
        });

        telemetry::record_tiles(tiles);
        Span::current().record("tiles", tiles);
        tiles
    }

    fn compute_tile(&self, t: Tile4d, output: &SharedOutput, n_stride: usize, column_block_bytes: usize) {
        let [group, image, row_start, col_start] = t.start;
        let [_, _, rows, cols] = t.size;
        let mr = self.ukernel.mr();
        let ks = self.layout.kernel_size;

        let indirection_start = self.layout.tile_offset(group, image, row_start);
        let indirection = &self.indirection[indirection_start..indirection_start + ks * mr];
        let weights = &self.packed_weights[(col_start + group * n_stride) * column_block_bytes..];

        let stride = self.params.output_pixel_stride;
        let base = (image * self.layout.output_size + row_start) * stride
            + group * self.params.group_output_channels
            + col_start;
        // SAFETY: the buffer outlives the dispatch and this tile's
        // rows x cols block is addressed by no other tile.
        let mut view = unsafe { TileOutput::from_raw(output.ptr, output.len, base, stride, rows, cols) };

        let tile = UkernelTile {
            rows,
            cols,
            kc: self.params.group_input_channels,
            ks,
            indirection,
            sources: self.sources,
            weights,
            quantization: self.quantization,
        };
        self.ukernel.compute(&tile, &mut view);
    }
}
