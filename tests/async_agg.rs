//! Double-buffered async aggregation: the one-iteration shift, the
//! dispatch rules, epoch-boundary draining, and the reset guard.

mod common;

use std::sync::Arc;

use common::{Backend, aggregator, run_cpu_cluster};
use gradax::{
    AggregatorConfig, CommFabric, CountingFabric, DeviceId, FabricOptions, GpuCollective,
    GradTensor, GradaxError, StatsHeader,
};

/// Rank `r`'s gradient for iteration `i`: element `k` holds
/// `(r + 1) * i + k`, so the 2-rank sum is `3i + 2k`.
fn input(rank: u32, iter: u32) -> GradTensor<f32> {
    let data: Vec<f32> = (0..4)
        .map(|k| (rank as f32 + 1.0) * iter as f32 + k as f32)
        .collect();
    GradTensor::from_slice(2, 2, DeviceId::Cpu, &data)
}

fn summed(iter: u32) -> Vec<f32> {
    (0..4).map(|k| 3.0 * iter as f32 + 2.0 * k as f32).collect()
}

#[test]
fn test_one_iteration_shift() {
    run_cpu_cluster(2, |rank, fabric, backend| {
        let mut agg =
            aggregator::<f32>(fabric, backend, AggregatorConfig::background(DeviceId::Cpu));

        // Iteration 1: dispatched (epoch start), but the returned
        // buffers hold the initial shadow state: zeroes.
        let mut grads = vec![input(rank, 1)];
        let mut header = StatsHeader::new(0);
        header.num_samples = 1;
        assert!(agg.aggregate(&mut grads, &mut header, true).unwrap());
        assert_eq!(grads[0].to_vec(), vec![0.0; 4], "rank {rank}");
        assert_eq!(header.num_samples, 0);

        // Iterations 2..4: feeding iteration i returns iteration i-1's
        // cross-rank reduction.
        for iter in 2..=4u32 {
            grads[0] = input(rank, iter);
            header.num_samples = 1;
            assert!(agg.aggregate(&mut grads, &mut header, false).unwrap());
            assert_eq!(grads[0].to_vec(), summed(iter - 1), "iter {iter}");
            assert_eq!(header.num_samples, 2);
        }
    });
}

#[test]
fn test_matches_sync_sequence_shifted() {
    // The async stream over N iterations equals the sync stream delayed
    // by one: async(k) == sync(k-1).
    run_cpu_cluster(2, |rank, fabric, backend| {
        let mut agg =
            aggregator::<f32>(fabric, backend, AggregatorConfig::background(DeviceId::Cpu));

        let mut observed = Vec::new();
        for iter in 1..=5u32 {
            let mut grads = vec![input(rank, iter)];
            let mut header = StatsHeader::new(0);
            header.num_samples = 1;
            agg.aggregate(&mut grads, &mut header, iter == 1).unwrap();
            observed.push(grads[0].to_vec());
        }

        assert_eq!(observed[0], vec![0.0; 4]);
        for iter in 2..=5u32 {
            // What sync mode would have produced for iteration i-1.
            assert_eq!(observed[(iter - 1) as usize], summed(iter - 1));
        }
    });
}

#[test]
fn test_no_prior_work_returns_false() {
    run_cpu_cluster(2, |_rank, fabric, backend| {
        let counting = Arc::new(CountingFabric::new(fabric));
        let counts = counting.counts();
        let mut agg = aggregator::<f32>(
            counting as Arc<dyn CommFabric>,
            backend,
            AggregatorConfig::background(DeviceId::Cpu),
        );

        let mut grads = vec![GradTensor::<f32>::zeros(2, 2, DeviceId::Cpu)];
        let mut header = StatsHeader::new(0);

        // No samples, no epoch reset: nothing to aggregate, nothing on
        // the wire.
        assert!(!agg.aggregate(&mut grads, &mut header, false).unwrap());
        assert_eq!(counts.reductions(), 0);
        assert_eq!(counts.isend() + counts.irecv(), 0);
    });
}

#[test]
fn test_epoch_boundary_drain_then_reset() {
    run_cpu_cluster(2, |rank, fabric, backend| {
        let mut agg =
            aggregator::<f32>(fabric, backend, AggregatorConfig::background(DeviceId::Cpu));

        let mut grads = vec![input(rank, 1)];
        let mut header = StatsHeader::new(0);
        header.num_samples = 1;
        assert!(agg.aggregate(&mut grads, &mut header, true).unwrap());

        // Drain with zero-sample iterations: the first still dispatches
        // (the previous aggregation saw samples), the second observes a
        // globally empty header and goes idle.
        grads[0].fill(0.0);
        header.clear();
        assert!(agg.aggregate(&mut grads, &mut header, false).unwrap());
        assert_eq!(grads[0].to_vec(), summed(1));

        grads[0].fill(0.0);
        header.clear();
        assert!(!agg.aggregate(&mut grads, &mut header, false).unwrap());

        // Idle now, so an epoch reset is legal and restarts cleanly.
        grads[0] = input(rank, 7);
        header.clear();
        header.num_samples = 1;
        assert!(agg.aggregate(&mut grads, &mut header, true).unwrap());
        assert_eq!(grads[0].to_vec(), vec![0.0; 4], "shadows were re-zeroed");

        grads[0] = input(rank, 8);
        header.clear();
        header.num_samples = 1;
        assert!(agg.aggregate(&mut grads, &mut header, false).unwrap());
        assert_eq!(grads[0].to_vec(), summed(7));
    });
}

#[test]
fn test_reset_with_pending_task_is_logic_error() {
    run_cpu_cluster(2, |rank, fabric, backend| {
        let mut agg =
            aggregator::<f32>(fabric, backend, AggregatorConfig::background(DeviceId::Cpu));

        let mut grads = vec![input(rank, 1)];
        let mut header = StatsHeader::new(0);
        header.num_samples = 1;
        assert!(agg.aggregate(&mut grads, &mut header, true).unwrap());

        // The background task from iteration 1 has not been claimed.
        header.num_samples = 1;
        let err = agg.aggregate(&mut grads, &mut header, true).unwrap_err();
        assert!(matches!(err, GradaxError::PendingAtReset));
    });
}

#[test]
fn test_shadow_shape_change_rejected() {
    run_cpu_cluster(2, |rank, fabric, backend| {
        let mut agg =
            aggregator::<f32>(fabric, backend, AggregatorConfig::background(DeviceId::Cpu));

        let mut grads = vec![input(rank, 1)];
        let mut header = StatsHeader::new(0);
        header.num_samples = 1;
        assert!(agg.aggregate(&mut grads, &mut header, true).unwrap());

        // Same count, different shape: no shadow matches it.
        let mut reshaped = vec![GradTensor::<f32>::zeros(4, 1, DeviceId::Cpu)];
        header.num_samples = 1;
        let err = agg.aggregate(&mut reshaped, &mut header, false).unwrap_err();
        assert!(matches!(
            err,
            GradaxError::ShadowMismatch { position: 0, rows: 4, cols: 1, .. }
        ));
    });
}

#[test]
fn test_async_header_shift() {
    run_cpu_cluster(2, |rank, fabric, backend| {
        let mut agg =
            aggregator::<f32>(fabric, backend, AggregatorConfig::background(DeviceId::Cpu));

        let mut grads = vec![input(rank, 1)];
        let mut header = StatsHeader::new(1);
        header.num_samples = 10 * (rank as u64 + 1);
        header.criterion = 1.0;
        header.eval_errors[0] = (0.5, 5);
        assert!(agg.aggregate(&mut grads, &mut header, true).unwrap());

        // Caller header now holds the (zeroed) shadow.
        assert_eq!(header.num_samples, 0);

        grads[0] = input(rank, 2);
        header.num_samples = 1;
        header.criterion = 0.0;
        header.eval_errors[0] = (0.0, 0);
        assert!(agg.aggregate(&mut grads, &mut header, false).unwrap());

        // Iteration 1's statistics, aggregated across both ranks.
        assert_eq!(header.num_samples, 30);
        assert_eq!(header.criterion, 2.0);
        assert_eq!(header.eval_errors[0], (1.0, 10));
    });
}

#[test]
fn test_gdr_fabric_async() {
    // Async over the direct-device transport: same shift semantics.
    common::run_cluster(
        2,
        FabricOptions {
            main_rank: 0,
            gpu_gdr: true,
        },
        Backend::Disabled,
        |rank, fabric: Arc<dyn CommFabric>, backend: Arc<dyn GpuCollective>| {
            let mut agg =
                aggregator::<f32>(fabric, backend, AggregatorConfig::background(common::TEST_GPU));

            let mut grads = vec![GradTensor::from_slice(
                2,
                2,
                common::TEST_GPU,
                input(rank, 1).as_slice(),
            )];
            let mut header = StatsHeader::new(0);
            header.num_samples = 1;
            assert!(agg.aggregate(&mut grads, &mut header, true).unwrap());

            let fresh: Vec<f32> = input(rank, 2).to_vec();
            grads[0] = GradTensor::from_slice(2, 2, common::TEST_GPU, &fresh);
            header.num_samples = 1;
            assert!(agg.aggregate(&mut grads, &mut header, false).unwrap());
            assert_eq!(grads[0].to_vec(), summed(1));
        },
    );
}
