//! Aggregator construction parameters.
//!
//! There is no environment or file-based configuration: every knob is a
//! constructor argument supplied by the surrounding training loop.

use crate::types::DeviceId;

/// Parameters fixed for the lifetime of a [`GradAggregator`](crate::GradAggregator).
#[derive(Debug, Clone)]
pub struct AggregatorConfig {
    /// Run the reduction on a background worker, double-buffering the
    /// gradients so the optimizer can overlap the next minibatch.
    pub use_async: bool,

    /// Device holding the gradient tensors.
    pub device: DeviceId,

    /// Gradients of at most this many bytes are fused into one shared
    /// reduction buffer (sync mode only). `0` disables packing.
    ///
    /// There is no built-in default; the training loop owns the policy.
    pub pack_threshold_bytes: usize,

    /// Log aggregation latency every this many iterations. `0` disables
    /// the trace.
    pub stats_trace: usize,
}

impl AggregatorConfig {
    /// Synchronous aggregation with the given packing threshold.
    pub fn sync(device: DeviceId, pack_threshold_bytes: usize) -> Self {
        Self {
            use_async: false,
            device,
            pack_threshold_bytes,
            stats_trace: 0,
        }
    }

    /// Double-buffered background aggregation. Packing is implied off:
    /// the async path already overlaps communication with compute.
    pub fn background(device: DeviceId) -> Self {
        Self {
            use_async: true,
            device,
            pack_threshold_bytes: 0,
            stats_trace: 0,
        }
    }

    pub fn with_stats_trace(mut self, every: usize) -> Self {
        self.stats_trace = every;
        self
    }
}
