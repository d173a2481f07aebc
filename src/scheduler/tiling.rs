//! 4D tiled parallel-for abstraction.
//!
//! An executor splits a 4D range into tiles and calls a task once per tile,
//! blocking until every tile has run. Tiles are enumerated row-major with the
//! last dimension fastest.

/// One tile of a 4D range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tile4d {
    pub start: [usize; 4],
    pub size: [usize; 4],
}

/// Enumerates the tiles covering a 4D range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TileGrid {
    range: [usize; 4],
    tile: [usize; 4],
    counts: [usize; 4],
}

impl TileGrid {
    /// Grid over `range` with tiles of at most `tile`. Zero tile sizes count as 1.
    pub fn new(range: [usize; 4], tile: [usize; 4]) -> Self {
        let tile = tile.map(|t| t.max(1));
        let counts = std::array::from_fn(|d| range[d].div_ceil(tile[d]));
        Self { range, tile, counts }
    }

    /// Number of tiles.
    pub fn len(&self) -> usize {
        self.counts.iter().product()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Tiles per dimension.
    pub fn counts(&self) -> [usize; 4] {
        self.counts
    }

    /// The `index`-th tile, `index < self.len()`.
    pub fn tile(&self, index: usize) -> Tile4d {
        debug_assert!(index < self.len());
        let mut rest = index;
        let mut start = [0usize; 4];
        let mut size = [0usize; 4];
        for d in (0..4).rev() {
            let i = rest % self.counts[d];
            rest /= self.counts[d];
            start[d] = i * self.tile[d];
            size[d] = self.tile[d].min(self.range[d] - start[d]);
        }
        Tile4d { start, size }
    }
}

/// Task invoked once per tile.
pub type TileTask<'a> = dyn Fn(Tile4d) + Sync + 'a;

/// A parallel-for over 4D tiles.
pub trait TiledExecutor {
    /// Call `task` once for every tile of `range` and return when all calls
    /// have completed. No ordering between tiles is guaranteed.
    fn compute_4d_tiled(&self, range: [usize; 4], tile: [usize; 4], task: &TileTask<'_>);

    /// Threads that may execute tiles, the caller included.
    fn num_threads(&self) -> usize;
}

/// Runs every tile in order on the calling thread.
#[derive(Debug, Clone, Copy, Default)]
pub struct SerialExecutor;

impl TiledExecutor for SerialExecutor {
    fn compute_4d_tiled(&self, range: [usize; 4], tile: [usize; 4], task: &TileTask<'_>) {
        let grid = TileGrid::new(range, tile);
        for index in 0..grid.len() {
            task(grid.tile(index));
        }
    }

    fn num_threads(&self) -> usize {
        1
    }
}
