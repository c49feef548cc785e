pub mod agg;
pub mod collective;
pub mod config;
pub mod error;
pub mod fabric;
pub mod gpu;
pub mod header;
pub(crate) mod reduce;
pub mod tensor;
pub mod types;

pub use agg::GradAggregator;
pub use collective::{DisabledCollective, GpuCollective, LoopbackCollective};
pub use config::AggregatorConfig;
pub use error::{GradaxError, Result};
pub use fabric::{CommFabric, CountingFabric, FabricOpCounts, FabricOptions, LocalFabric};
pub use gpu::{DeviceBridge, HostBridge, StagingBuf};
pub use header::StatsHeader;
pub use tensor::{GradTensor, MatrixKind};
pub use types::{DataType, DeviceId, Rank, ReduceOp, Scalar, Slot};

#[cfg(feature = "cuda")]
pub use gpu::CudaBridge;
