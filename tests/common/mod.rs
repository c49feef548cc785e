//! Multi-rank test harness: one thread per rank over an in-process
//! fabric, with an optional loopback collective backend per rank.

use std::sync::Arc;

use gradax::{
    AggregatorConfig, CommFabric, DeviceId, DisabledCollective, FabricOptions, GpuCollective,
    GradAggregator, HostBridge, LocalFabric, LoopbackCollective, Scalar,
};

/// Which collective backend each rank gets.
#[derive(Clone, Copy)]
pub enum Backend {
    /// No backend built; the aggregator falls back to fabric transports.
    Disabled,
    /// In-process collective, steering the aggregator onto the batched
    /// collective branch.
    Loopback,
}

/// Run `f` once per rank, each on its own thread, with connected fabric
/// and backend endpoints.
pub fn run_cluster<F>(world: u32, opts: FabricOptions, backend: Backend, f: F)
where
    F: Fn(u32, Arc<dyn CommFabric>, Arc<dyn GpuCollective>) + Send + Sync,
{
    let fabrics = LocalFabric::cluster_with(world, opts);
    let backends: Vec<Arc<dyn GpuCollective>> = match backend {
        Backend::Loopback => LoopbackCollective::cluster(world)
            .into_iter()
            .map(|b| Arc::new(b) as Arc<dyn GpuCollective>)
            .collect(),
        Backend::Disabled => (0..world)
            .map(|_| Arc::new(DisabledCollective) as Arc<dyn GpuCollective>)
            .collect(),
    };

    std::thread::scope(|s| {
        for (fabric, backend) in fabrics.into_iter().zip(backends) {
            let f = &f;
            s.spawn(move || {
                let rank = fabric.rank();
                f(rank, Arc::new(fabric), backend);
            });
        }
    });
}

/// Aggregator over the given endpoints, bridged through host memory.
pub fn aggregator<E: Scalar>(
    fabric: Arc<dyn CommFabric>,
    backend: Arc<dyn GpuCollective>,
    cfg: AggregatorConfig,
) -> GradAggregator<E> {
    let bridge = Arc::new(HostBridge::new(cfg.device));
    GradAggregator::new(fabric, backend, bridge, cfg)
}

/// Shorthand for the plain CPU cluster most tests use.
pub fn run_cpu_cluster<F>(world: u32, f: F)
where
    F: Fn(u32, Arc<dyn CommFabric>, Arc<dyn GpuCollective>) + Send + Sync,
{
    run_cluster(world, FabricOptions::default(), Backend::Disabled, f);
}

/// GPU-tagged device used by the staged and direct-device tests; the
/// backing storage is still host memory.
pub const TEST_GPU: DeviceId = DeviceId::Gpu(0);
