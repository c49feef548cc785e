//! Dense gradient tensors the aggregator borrows from the optimizer.
//!
//! gradax never allocates gradients on behalf of the training loop; it
//! only swaps, packs, and overwrites storage it is handed. The tensor
//! type here is deliberately small: a row-major dense matrix with a
//! device tag, plus the handful of operations the aggregation pipeline
//! needs (byte views for the fabric, storage swap for double buffering,
//! range copies for the fused small-gradient buffer).

use crate::types::{DeviceId, Scalar};

/// Storage layout of a matrix. Aggregation supports dense only; the
/// sparse tag exists so submissions can be rejected with a typed error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatrixKind {
    Dense,
    Sparse,
}

/// A row-major dense matrix of `rows x cols` elements on `device`.
#[derive(Debug, Clone)]
pub struct GradTensor<E: Scalar> {
    rows: usize,
    cols: usize,
    device: DeviceId,
    kind: MatrixKind,
    data: Vec<E>,
}

impl<E: Scalar> GradTensor<E> {
    /// A zeroed dense matrix.
    pub fn zeros(rows: usize, cols: usize, device: DeviceId) -> Self {
        Self {
            rows,
            cols,
            device,
            kind: MatrixKind::Dense,
            data: vec![E::zero(); rows * cols],
        }
    }

    /// A dense matrix initialized from a row-major slice.
    ///
    /// # Panics
    /// If `data.len() != rows * cols`.
    pub fn from_slice(rows: usize, cols: usize, device: DeviceId, data: &[E]) -> Self {
        assert_eq!(data.len(), rows * cols, "row-major data must fill the matrix");
        Self {
            rows,
            cols,
            device,
            kind: MatrixKind::Dense,
            data: data.to_vec(),
        }
    }

    /// A sparse placeholder of the same shape vocabulary. Aggregation
    /// rejects these; the constructor exists for callers that carry
    /// mixed parameter sets.
    pub fn sparse(rows: usize, cols: usize, device: DeviceId) -> Self {
        Self {
            rows,
            cols,
            device,
            kind: MatrixKind::Sparse,
            data: Vec::new(),
        }
    }

    /// A zeroed dense matrix with the same shape and device as `self`.
    pub fn zeros_like(&self) -> Self {
        Self::zeros(self.rows, self.cols, self.device)
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn cols(&self) -> usize {
        self.cols
    }

    pub fn num_elements(&self) -> usize {
        self.rows * self.cols
    }

    pub fn size_in_bytes(&self) -> usize {
        self.num_elements() * std::mem::size_of::<E>()
    }

    pub fn device(&self) -> DeviceId {
        self.device
    }

    pub fn kind(&self) -> MatrixKind {
        self.kind
    }

    pub fn is_dense(&self) -> bool {
        self.kind == MatrixKind::Dense
    }

    /// True when `other` can act as this tensor's double-buffer partner.
    pub fn same_shape_and_device(&self, other: &GradTensor<E>) -> bool {
        self.rows == other.rows && self.cols == other.cols && self.device == other.device
    }

    pub fn as_slice(&self) -> &[E] {
        &self.data
    }

    pub fn as_mut_slice(&mut self) -> &mut [E] {
        &mut self.data
    }

    /// Raw little-endian view of the element storage for fabric calls.
    pub fn as_bytes(&self) -> &[u8] {
        unsafe {
            std::slice::from_raw_parts(
                self.data.as_ptr() as *const u8,
                self.data.len() * std::mem::size_of::<E>(),
            )
        }
    }

    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        unsafe {
            std::slice::from_raw_parts_mut(
                self.data.as_mut_ptr() as *mut u8,
                self.data.len() * std::mem::size_of::<E>(),
            )
        }
    }

    /// Contiguous column range of a single-row matrix.
    ///
    /// The fused small-gradient buffer is shaped `1 x total`, so a column
    /// slice is an element range. Multi-row slicing is not needed here.
    pub fn column_slice(&self, offset: usize, count: usize) -> &[E] {
        debug_assert_eq!(self.rows, 1, "column_slice is defined for 1-row buffers");
        &self.data[offset..offset + count]
    }

    pub fn column_slice_mut(&mut self, offset: usize, count: usize) -> &mut [E] {
        debug_assert_eq!(self.rows, 1, "column_slice is defined for 1-row buffers");
        &mut self.data[offset..offset + count]
    }

    /// Set every element to `value`.
    pub fn fill(&mut self, value: E) {
        self.data.fill(value);
    }

    /// Reshape and reallocate, zeroing the contents.
    pub fn resize(&mut self, rows: usize, cols: usize) {
        self.rows = rows;
        self.cols = cols;
        self.data.clear();
        self.data.resize(rows * cols, E::zero());
    }

    /// Exchange storage with a same-shaped partner in constant time.
    ///
    /// This is the double-buffer rotation: no elements are copied, the
    /// two tensors simply trade their backing allocations.
    pub fn swap_storage(&mut self, other: &mut GradTensor<E>) {
        debug_assert!(self.same_shape_and_device(other));
        std::mem::swap(&mut self.data, &mut other.data);
    }

    /// Owned copy of the elements, row-major.
    pub fn to_vec(&self) -> Vec<E> {
        self.data.clone()
    }
}
