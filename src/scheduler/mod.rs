//! Parallel execution of tiled work.
//!
//! [`TiledExecutor`] is the seam the dispatcher runs on. [`SerialExecutor`]
//! runs on the calling thread; [`ThreadPool`] keeps persistent workers.

mod thread_pool;
mod tiling;

pub use thread_pool::{ThreadPool, ThreadPoolConfig, ThreadPoolError, ThreadPoolStats};
pub use tiling::{SerialExecutor, Tile4d, TileGrid, TileTask, TiledExecutor};
