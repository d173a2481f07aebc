//! Allocation budget for operator scratch buffers.
//!
//! Every buffer a deconvolution operator owns is reserved here first. The
//! budget enforces an optional byte ceiling (turning exhaustion into
//! `OutOfMemory` before the allocator is touched), counts allocations, and
//! releases bytes automatically when a [`Reservation`] is dropped.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tracing::error;

use crate::engine::DeconvError;

/// Configuration for an allocation budget.
#[derive(Debug, Clone)]
pub struct AllocationBudgetConfig {
    /// Maximum bytes reserved at once across all operators sharing the budget.
    pub max_bytes: usize,
}

impl Default for AllocationBudgetConfig {
    fn default() -> Self {
        Self { max_bytes: usize::MAX }
    }
}

/// Shared state for allocation tracking.
struct BudgetInner {
    config: AllocationBudgetConfig,
    current_bytes: AtomicUsize,
    peak_bytes: AtomicUsize,
    allocations: AtomicUsize,
}

impl BudgetInner {
    fn reserve(&self, what: &'static str, bytes: usize) -> Result<(), DeconvError> {
        let prev = self.current_bytes.fetch_add(bytes, Ordering::SeqCst);
        match prev.checked_add(bytes) {
            Some(total) if total <= self.config.max_bytes => {
                self.peak_bytes.fetch_max(total, Ordering::SeqCst);
                self.allocations.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
            _ => {
                self.current_bytes.fetch_sub(bytes, Ordering::SeqCst);
                error!("failed to allocate {} bytes for {}", bytes, what);
                Err(DeconvError::OutOfMemory { what, bytes })
            }
        }
    }

    fn release(&self, bytes: usize) {
        self.current_bytes.fetch_sub(bytes, Ordering::SeqCst);
    }
}

/// Byte budget and allocation counter shared by operators.
#[derive(Clone)]
pub struct AllocationBudget {
    inner: Arc<BudgetInner>,
}

impl Default for AllocationBudget {
    fn default() -> Self {
        Self::new(AllocationBudgetConfig::default())
    }
}

impl std::fmt::Debug for AllocationBudget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AllocationBudget")
            .field("max_bytes", &self.inner.config.max_bytes)
            .field("current_bytes", &self.current_bytes())
            .field("allocations", &self.allocations())
            .finish()
    }
}

impl AllocationBudget {
    /// Create a new budget.
    pub fn new(config: AllocationBudgetConfig) -> Self {
        Self {
            inner: Arc::new(BudgetInner {
                config,
                current_bytes: AtomicUsize::new(0),
                peak_bytes: AtomicUsize::new(0),
                allocations: AtomicUsize::new(0),
            }),
        }
    }

    /// Budget capped at `max_bytes`.
    pub fn with_limit(max_bytes: usize) -> Self {
        Self::new(AllocationBudgetConfig { max_bytes })
    }

    /// Reserve `bytes` for the buffer named `what`.
    pub fn try_reserve(&self, what: &'static str, bytes: usize) -> Result<Reservation, DeconvError> {
        self.inner.reserve(what, bytes)?;
        Ok(Reservation {
            what,
            bytes,
            inner: self.inner.clone(),
        })
    }

    /// Bytes currently reserved.
    pub fn current_bytes(&self) -> usize {
        self.inner.current_bytes.load(Ordering::SeqCst)
    }

    /// High-water mark of reserved bytes.
    pub fn peak_bytes(&self) -> usize {
        self.inner.peak_bytes.load(Ordering::SeqCst)
    }

    /// Number of successful reservations, including resizes that grew a buffer.
    pub fn allocations(&self) -> usize {
        self.inner.allocations.load(Ordering::SeqCst)
    }

    pub fn max_bytes(&self) -> usize {
        self.inner.config.max_bytes
    }
}

/// RAII reservation that returns its bytes to the budget when dropped.
pub struct Reservation {
    what: &'static str,
    bytes: usize,
    inner: Arc<BudgetInner>,
}

impl std::fmt::Debug for Reservation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reservation")
            .field("what", &self.what)
            .field("bytes", &self.bytes)
            .finish()
    }
}

impl Reservation {
    pub fn bytes(&self) -> usize {
        self.bytes
    }

    /// Grow or shrink the reservation in place.
    ///
    /// On failure the reservation keeps its previous size.
    pub fn resize(&mut self, bytes: usize) -> Result<(), DeconvError> {
        if bytes > self.bytes {
            self.inner.reserve(self.what, bytes - self.bytes)?;
        } else {
            self.inner.release(self.bytes - bytes);
        }
        self.bytes = bytes;
        Ok(())
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        self.inner.release(self.bytes);
    }
}
