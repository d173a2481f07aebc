//! Zero-padding buffer read by the micro-kernel for out-of-bounds taps.
//!
//! The buffer holds one input-channel strip filled with the input zero point.
//! When a group has fewer than [`ZeroBuffer::GUARD_BYTES`] input channels,
//! vectorized kernels still load 8 bytes at a time, so the allocation gets 8
//! extra leading bytes and the usable view starts after them. Consumers only
//! ever see the usable view.

use crate::engine::DeconvError;

use super::budget::{AllocationBudget, Reservation};

/// Owned zero-point strip with a guard prefix for narrow channel counts.
#[derive(Debug)]
pub struct ZeroBuffer {
    data: Vec<u8>,
    offset: usize,
    _reservation: Reservation,
}

impl ZeroBuffer {
    /// Minimum channel count that needs no guard prefix; also the guard width.
    pub const GUARD_BYTES: usize = 8;

    /// Allocate a strip of `k_stride` bytes for `group_input_channels` channels.
    pub fn new(
        group_input_channels: usize,
        k_stride: usize,
        zero_point: u8,
        budget: &AllocationBudget,
    ) -> Result<Self, DeconvError> {
        debug_assert!(k_stride >= group_input_channels);
        let mut size = k_stride;
        let mut offset = 0;
        if group_input_channels < Self::GUARD_BYTES {
            size += Self::GUARD_BYTES;
            offset = Self::GUARD_BYTES;
        }

        let reservation = budget.try_reserve("zero padding", size)?;
        let mut data = Vec::new();
        data.try_reserve_exact(size)
            .map_err(|_| DeconvError::OutOfMemory { what: "zero padding", bytes: size })?;
        data.resize(size, zero_point);

        Ok(Self {
            data,
            offset,
            _reservation: reservation,
        })
    }

    /// The usable strip. Never includes the guard prefix.
    pub fn as_slice(&self) -> &[u8] {
        &self.data[self.offset..]
    }

    /// Offset of the usable strip within the allocation.
    pub fn offset(&self) -> usize {
        self.offset
    }

    /// Bytes actually allocated, guard prefix included.
    pub fn allocation_len(&self) -> usize {
        self.data.len()
    }
}
