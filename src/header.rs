//! Per-iteration training statistics exchanged alongside the gradients.

use crate::error::{GradaxError, Result};

/// Training statistics for one rank's minibatch shard.
///
/// Headers travel over the fabric as their little-endian byte image, so
/// they are not portable across ranks with differing byte order or float
/// format; all ranks of one job must share both.
///
/// The serialized form leads with the eval-node count so a receiver can
/// pre-size its buffer from [`StatsHeader::byte_len`].
#[derive(Debug, Clone, PartialEq)]
pub struct StatsHeader {
    /// Samples processed this iteration.
    pub num_samples: u64,
    /// Samples carrying a training label.
    pub num_samples_with_label: u64,
    /// Summed training criterion over the local shard.
    pub criterion: f64,
    /// Per-eval-node `(error sum, sample count)` pairs.
    pub eval_errors: Vec<(f64, u64)>,
}

/// count (u32) + num_samples + num_samples_with_label + criterion.
const FIXED_BYTES: usize = 4 + 8 + 8 + 8;
/// One `(f64, u64)` eval-error entry.
const EVAL_ENTRY_BYTES: usize = 8 + 8;

impl StatsHeader {
    /// A zeroed header for `num_eval_nodes` evaluation nodes.
    pub fn new(num_eval_nodes: usize) -> Self {
        Self {
            num_samples: 0,
            num_samples_with_label: 0,
            criterion: 0.0,
            eval_errors: vec![(0.0, 0); num_eval_nodes],
        }
    }

    pub fn num_eval_nodes(&self) -> usize {
        self.eval_errors.len()
    }

    /// Zero all statistics, keeping the eval-node count.
    pub fn clear(&mut self) {
        self.num_samples = 0;
        self.num_samples_with_label = 0;
        self.criterion = 0.0;
        for e in &mut self.eval_errors {
            *e = (0.0, 0);
        }
    }

    /// Serialized size for a header with `num_eval_nodes` entries.
    pub const fn byte_len(num_eval_nodes: usize) -> usize {
        FIXED_BYTES + num_eval_nodes * EVAL_ENTRY_BYTES
    }

    /// Fold `other` into `self` by element-wise addition.
    ///
    /// Addition commutes, so fold order (and therefore header arrival
    /// order on the main rank) does not affect the result.
    pub fn aggregate(&mut self, other: &mut StatsHeader, reset_other: bool) -> Result<()> {
        if other.num_eval_nodes() != self.num_eval_nodes() {
            return Err(GradaxError::HeaderDecode(format!(
                "eval-node count mismatch: {} vs {}",
                self.num_eval_nodes(),
                other.num_eval_nodes()
            )));
        }
        self.num_samples += other.num_samples;
        self.num_samples_with_label += other.num_samples_with_label;
        self.criterion += other.criterion;
        for (mine, theirs) in self.eval_errors.iter_mut().zip(&other.eval_errors) {
            mine.0 += theirs.0;
            mine.1 += theirs.1;
        }
        if reset_other {
            other.clear();
        }
        Ok(())
    }

    /// Little-endian byte image, `byte_len(self.num_eval_nodes())` long.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(Self::byte_len(self.num_eval_nodes()));
        buf.extend_from_slice(&(self.eval_errors.len() as u32).to_le_bytes());
        buf.extend_from_slice(&self.num_samples.to_le_bytes());
        buf.extend_from_slice(&self.num_samples_with_label.to_le_bytes());
        buf.extend_from_slice(&self.criterion.to_le_bytes());
        for &(err, n) in &self.eval_errors {
            buf.extend_from_slice(&err.to_le_bytes());
            buf.extend_from_slice(&n.to_le_bytes());
        }
        buf
    }

    /// Overwrite `self` from a serialized image with a matching eval count.
    pub fn decode_from(&mut self, bytes: &[u8]) -> Result<()> {
        let decoded = Self::decode(bytes)?;
        if decoded.num_eval_nodes() != self.num_eval_nodes() {
            return Err(GradaxError::HeaderDecode(format!(
                "expected {} eval nodes, image carries {}",
                self.num_eval_nodes(),
                decoded.num_eval_nodes()
            )));
        }
        *self = decoded;
        Ok(())
    }

    /// Parse a serialized header.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < FIXED_BYTES {
            return Err(GradaxError::HeaderSizeMismatch {
                expected: FIXED_BYTES,
                actual: bytes.len(),
            });
        }
        let count = u32::from_le_bytes(bytes[0..4].try_into().expect("4-byte slice")) as usize;
        let expected = Self::byte_len(count);
        if bytes.len() != expected {
            return Err(GradaxError::HeaderSizeMismatch {
                expected,
                actual: bytes.len(),
            });
        }

        let read_u64 =
            |off: usize| u64::from_le_bytes(bytes[off..off + 8].try_into().expect("8-byte slice"));
        let read_f64 =
            |off: usize| f64::from_le_bytes(bytes[off..off + 8].try_into().expect("8-byte slice"));

        let mut eval_errors = Vec::with_capacity(count);
        let mut off = FIXED_BYTES;
        for _ in 0..count {
            eval_errors.push((read_f64(off), read_u64(off + 8)));
            off += EVAL_ENTRY_BYTES;
        }

        Ok(Self {
            num_samples: read_u64(4),
            num_samples_with_label: read_u64(12),
            criterion: read_f64(20),
            eval_errors,
        })
    }
}
