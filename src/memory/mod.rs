//! Memory management for operator scratch buffers.
//!
//! Provides the allocation budget every operator buffer is reserved against,
//! and the zero-padding buffer with its guard prefix.

mod budget;
mod zero_buffer;

pub use budget::{AllocationBudget, AllocationBudgetConfig, Reservation};
pub use zero_buffer::ZeroBuffer;
