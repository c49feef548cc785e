use crate::types::{DeviceId, Rank};

pub type Result<T> = std::result::Result<T, GradaxError>;

#[derive(Debug, thiserror::Error)]
pub enum GradaxError {
    #[error("gradient {position} is sparse: aggregation supports dense gradients only")]
    SparseGradient { position: usize },

    #[error(
        "no shadow tensor matches gradient {position} \
         ({rows}x{cols} on {device}): submission order or shapes changed since init"
    )]
    ShadowMismatch {
        position: usize,
        rows: usize,
        cols: usize,
        device: DeviceId,
    },

    #[error("pending background aggregation found while resetting aggregator state")]
    PendingAtReset,

    #[error("{operation} failed on rank {rank}: {reason}")]
    FabricFailed {
        operation: &'static str,
        rank: Rank,
        reason: String,
    },

    #[error("gpu collective {operation} failed: {reason}")]
    CollectiveFailed {
        operation: &'static str,
        reason: String,
    },

    #[error("header decode failed: {0}")]
    HeaderDecode(String),

    #[error("header size mismatch: expected {expected} bytes, got {actual}")]
    HeaderSizeMismatch { expected: usize, actual: usize },

    #[error("gradient count mismatch: aggregator initialized with {expected}, submitted {actual}")]
    GradientCountMismatch { expected: usize, actual: usize },

    #[error("buffer size mismatch: expected {expected} bytes, got {actual}")]
    BufferSizeMismatch { expected: usize, actual: usize },

    #[error("staging allocation of {bytes} bytes failed: {reason}")]
    StagingAlloc { bytes: usize, reason: String },

    #[error("device bridge error: {0}")]
    Device(String),

    #[error("background reduction worker disconnected")]
    WorkerGone,

    #[error("no transport strategy matches device={device}, gdr={gdr}, collective={collective}")]
    UnreachableTransport {
        device: DeviceId,
        gdr: bool,
        collective: bool,
    },

    #[error("receive posted twice for source rank {from_rank} tag {tag}")]
    ReceiveInFlight { from_rank: Rank, tag: u64 },
}
