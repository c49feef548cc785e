//! Small-gradient packing.
//!
//! Sub-threshold gradients are latency-bound: the collective's startup
//! cost dominates the payload. Fusing them into one contiguous buffer
//! turns `k` reductions into one. The fused buffer is reduced as its own
//! standalone element, ordered first.
//!
//! Packing is skipped in async mode: that path already overlaps
//! communication with the next minibatch, and the extra staging would
//! complicate the double buffer for marginal gain.

use crate::error::{GradaxError, Result};
use crate::tensor::GradTensor;
use crate::types::{DeviceId, Scalar, Slot};

/// Partition of the submitted gradients into fused and standalone sets.
#[derive(Debug, Clone)]
pub(crate) struct PackPlan {
    /// Reduction order: the fused buffer (if any) first, then every
    /// standalone gradient by ascending position.
    pub slots: Vec<Slot>,
    /// Positions fused into the shared buffer, in pack order.
    pub packed: Vec<usize>,
    /// Per-position membership in the fused set.
    packed_set: Vec<bool>,
    /// Total element count of the fused buffer.
    pub packed_elems: usize,
}

impl PackPlan {
    /// Classify `grads` against the packing threshold.
    ///
    /// Rejects sparse gradients: aggregation operates on dense storage
    /// only. A `threshold_bytes` of zero (or async mode) packs nothing.
    pub fn build<E: Scalar>(
        grads: &[GradTensor<E>],
        threshold_bytes: usize,
        use_async: bool,
    ) -> Result<PackPlan> {
        let mut packed = Vec::new();
        let mut packed_set = vec![false; grads.len()];
        let mut standalone = Vec::new();
        let mut packed_elems = 0;

        for (i, grad) in grads.iter().enumerate() {
            if !grad.is_dense() {
                return Err(GradaxError::SparseGradient { position: i });
            }
            if !use_async && grad.size_in_bytes() <= threshold_bytes && threshold_bytes > 0 {
                packed.push(i);
                packed_set[i] = true;
                packed_elems += grad.num_elements();
            } else {
                standalone.push(Slot::Grad(i));
            }
        }

        let mut slots = Vec::with_capacity(standalone.len() + 1);
        if !packed.is_empty() {
            slots.push(Slot::Packed);
        }
        slots.extend(standalone);

        Ok(PackPlan {
            slots,
            packed,
            packed_set,
            packed_elems,
        })
    }

    /// Every gradient standalone, the fallback when the fused buffer
    /// cannot be allocated.
    pub fn all_standalone(count: usize) -> PackPlan {
        PackPlan {
            slots: (0..count).map(Slot::Grad).collect(),
            packed: Vec::new(),
            packed_set: vec![false; count],
            packed_elems: 0,
        }
    }

    pub fn grad_count(&self) -> usize {
        self.packed_set.len()
    }

    pub fn is_packed(&self, position: usize) -> bool {
        self.packed_set[position]
    }

    pub fn has_packed(&self) -> bool {
        !self.packed.is_empty()
    }
}

/// Allocate the `1 x packed_elems` fused buffer, or `None` when the
/// allocation is refused (the caller then falls back to all-standalone).
pub(crate) fn try_alloc_packed_buffer<E: Scalar>(
    packed_elems: usize,
    device: DeviceId,
) -> Option<GradTensor<E>> {
    if packed_elems == 0 {
        return None;
    }
    let mut storage: Vec<E> = Vec::new();
    storage.try_reserve_exact(packed_elems).ok()?;
    storage.resize(packed_elems, E::zero());
    Some(GradTensor::from_slice(1, packed_elems, device, &storage))
}

/// Copy every fused gradient into its column range of the shared buffer.
pub(crate) fn pack_into<E: Scalar>(
    plan: &PackPlan,
    grads: &[GradTensor<E>],
    buf: &mut GradTensor<E>,
) {
    let mut offset = 0;
    for &i in &plan.packed {
        let n = grads[i].num_elements();
        buf.column_slice_mut(offset, n).copy_from_slice(grads[i].as_slice());
        offset += n;
    }
}

/// Scatter the reduced buffer back into the fused gradients.
pub(crate) fn unpack_from<E: Scalar>(
    plan: &PackPlan,
    grads: &mut [GradTensor<E>],
    buf: &GradTensor<E>,
) {
    let mut offset = 0;
    for &i in &plan.packed {
        let n = grads[i].num_elements();
        grads[i].as_mut_slice().copy_from_slice(buf.column_slice(offset, n));
        offset += n;
    }
}
