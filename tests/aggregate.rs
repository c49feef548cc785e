//! End-to-end aggregation: gradients summed across ranks, headers
//! merged, idle ranks zeroed, single-rank fast path.

mod common;

use std::sync::Arc;

use common::{Backend, aggregator, run_cpu_cluster};
use gradax::{
    AggregatorConfig, CountingFabric, DeviceId, DisabledCollective, FabricOptions, GradTensor,
    GradaxError, HostBridge, LocalFabric, GradAggregator, StatsHeader,
};

#[test]
fn test_two_ranks_sum_gradients_and_samples() {
    run_cpu_cluster(2, |rank, fabric, backend| {
        let mut agg = aggregator::<f32>(fabric, backend, AggregatorConfig::sync(DeviceId::Cpu, 0));

        let data: [f32; 4] = if rank == 0 {
            [1.0, 2.0, 3.0, 4.0]
        } else {
            [5.0, 6.0, 7.0, 8.0]
        };
        let mut grads = vec![GradTensor::from_slice(2, 2, DeviceId::Cpu, &data)];
        let mut header = StatsHeader::new(0);
        header.num_samples = if rank == 0 { 10 } else { 5 };

        let any = agg.aggregate(&mut grads, &mut header, false).unwrap();

        assert!(any, "rank {rank}");
        assert_eq!(grads[0].to_vec(), vec![6.0, 8.0, 10.0, 12.0]);
        assert_eq!(header.num_samples, 15);
    });
}

#[test]
fn test_idle_rank_contributes_zeroes() {
    run_cpu_cluster(2, |rank, fabric, backend| {
        let mut agg = aggregator::<f32>(fabric, backend, AggregatorConfig::sync(DeviceId::Cpu, 0));

        // Rank 0 processed nothing; its stale gradient values must not
        // leak into the sum.
        let (data, samples) = if rank == 0 {
            ([9.0f32; 4], 0)
        } else {
            ([1.0f32; 4], 7)
        };
        let mut grads = vec![GradTensor::from_slice(2, 2, DeviceId::Cpu, &data)];
        let mut header = StatsHeader::new(0);
        header.num_samples = samples;

        let any = agg.aggregate(&mut grads, &mut header, false).unwrap();

        assert!(any);
        assert_eq!(grads[0].to_vec(), vec![1.0; 4]);
        assert_eq!(header.num_samples, 7);
    });
}

#[test]
fn test_three_rank_header_aggregation() {
    run_cpu_cluster(3, |rank, fabric, backend| {
        let mut agg = aggregator::<f32>(fabric, backend, AggregatorConfig::sync(DeviceId::Cpu, 0));

        let mut grads = vec![GradTensor::from_slice(1, 1, DeviceId::Cpu, &[0.5f32])];
        let mut header = StatsHeader::new(2);
        header.num_samples = 10 * (rank as u64 + 1);
        header.num_samples_with_label = header.num_samples;
        header.criterion = rank as f64 + 1.0;
        header.eval_errors[0] = (0.1 * (rank as f64 + 1.0), rank as u64 + 1);
        header.eval_errors[1] = (1.0, 2);

        agg.aggregate(&mut grads, &mut header, false).unwrap();

        assert_eq!(header.num_samples, 60, "rank {rank}");
        assert_eq!(header.num_samples_with_label, 60);
        assert_eq!(header.criterion, 6.0);
        assert!((header.eval_errors[0].0 - 0.6).abs() < 1e-12);
        assert_eq!(header.eval_errors[0].1, 6);
        assert_eq!(header.eval_errors[1], (3.0, 6));
    });
}

#[test]
fn test_multiple_tensors_mixed_shapes() {
    run_cpu_cluster(2, |rank, fabric, backend| {
        let mut agg = aggregator::<f64>(fabric, backend, AggregatorConfig::sync(DeviceId::Cpu, 0));

        let scale = rank as f64 + 1.0;
        let mut grads = vec![
            GradTensor::from_slice(1, 3, DeviceId::Cpu, &[scale, 2.0 * scale, 3.0 * scale]),
            GradTensor::from_slice(2, 1, DeviceId::Cpu, &[-scale, scale]),
        ];
        let mut header = StatsHeader::new(0);
        header.num_samples = 1;

        agg.aggregate(&mut grads, &mut header, false).unwrap();

        assert_eq!(grads[0].to_vec(), vec![3.0, 6.0, 9.0]);
        assert_eq!(grads[1].to_vec(), vec![-3.0, 3.0]);
        assert_eq!(header.num_samples, 2);
    });
}

#[test]
fn test_repeated_iterations_accumulate_fresh_sums() {
    run_cpu_cluster(2, |rank, fabric, backend| {
        let mut agg = aggregator::<f32>(fabric, backend, AggregatorConfig::sync(DeviceId::Cpu, 0));

        for iter in 1..=3u32 {
            let v = (rank + iter) as f32;
            let mut grads = vec![GradTensor::from_slice(1, 2, DeviceId::Cpu, &[v, -v])];
            let mut header = StatsHeader::new(0);
            header.num_samples = 4;

            agg.aggregate(&mut grads, &mut header, false).unwrap();

            let expected = (2 * iter + 1) as f32;
            assert_eq!(grads[0].to_vec(), vec![expected, -expected]);
            assert_eq!(header.num_samples, 8);
        }
    });
}

#[test]
fn test_single_rank_fast_path_no_collectives() {
    let fabric = CountingFabric::new(Arc::new(LocalFabric::cluster(1).remove(0)));
    let counts = fabric.counts();
    let mut agg: GradAggregator<f32> = GradAggregator::new(
        Arc::new(fabric),
        Arc::new(DisabledCollective),
        Arc::new(HostBridge::new(DeviceId::Cpu)),
        AggregatorConfig::sync(DeviceId::Cpu, 1024),
    );

    let mut grads = vec![GradTensor::from_slice(2, 2, DeviceId::Cpu, &[1.0, 2.0, 3.0, 4.0])];
    let mut header = StatsHeader::new(1);
    header.num_samples = 3;
    header.criterion = 0.25;
    header.eval_errors[0] = (0.5, 3);

    assert!(agg.aggregate(&mut grads, &mut header, false).unwrap());

    header.num_samples = 0;
    header.criterion = 0.0;
    assert!(!agg.aggregate(&mut grads, &mut header, false).unwrap());

    // Gradients and remaining header fields untouched, nothing on the wire.
    assert_eq!(grads[0].to_vec(), vec![1.0, 2.0, 3.0, 4.0]);
    assert_eq!(header.eval_errors[0], (0.5, 3));
    assert_eq!(counts.reductions(), 0);
    assert_eq!(counts.bcast(), 0);
    assert_eq!(counts.isend(), 0);
    assert_eq!(counts.irecv(), 0);
}

#[test]
fn test_sparse_gradient_rejected() {
    run_cpu_cluster(2, |_rank, fabric, backend| {
        let mut agg = aggregator::<f32>(fabric, backend, AggregatorConfig::sync(DeviceId::Cpu, 0));

        let mut grads = vec![
            GradTensor::from_slice(1, 2, DeviceId::Cpu, &[1.0, 2.0]),
            GradTensor::sparse(4, 4, DeviceId::Cpu),
        ];
        let mut header = StatsHeader::new(0);
        header.num_samples = 1;

        let err = agg.aggregate(&mut grads, &mut header, false).unwrap_err();
        assert!(matches!(err, GradaxError::SparseGradient { position: 1 }));
    });
}

#[test]
fn test_gradient_count_change_rejected() {
    run_cpu_cluster(2, |_rank, fabric, backend| {
        let mut agg = aggregator::<f32>(fabric, backend, AggregatorConfig::sync(DeviceId::Cpu, 0));

        let mut grads = vec![GradTensor::from_slice(1, 2, DeviceId::Cpu, &[1.0, 2.0])];
        let mut header = StatsHeader::new(0);
        header.num_samples = 1;
        agg.aggregate(&mut grads, &mut header, false).unwrap();

        let mut more = vec![
            GradTensor::from_slice(1, 2, DeviceId::Cpu, &[1.0, 2.0]),
            GradTensor::from_slice(1, 2, DeviceId::Cpu, &[3.0, 4.0]),
        ];
        let err = agg.aggregate(&mut more, &mut header, false).unwrap_err();
        assert!(matches!(
            err,
            GradaxError::GradientCountMismatch { expected: 1, actual: 2 }
        ));
    });
}

#[test]
fn test_non_zero_main_rank() {
    common::run_cluster(
        3,
        FabricOptions {
            main_rank: 1,
            gpu_gdr: false,
        },
        Backend::Disabled,
        |rank, fabric, backend| {
            let mut agg =
                aggregator::<f32>(fabric, backend, AggregatorConfig::sync(DeviceId::Cpu, 0));

            let mut grads = vec![GradTensor::from_slice(1, 1, DeviceId::Cpu, &[1.0f32])];
            let mut header = StatsHeader::new(0);
            header.num_samples = rank as u64 + 1;

            agg.aggregate(&mut grads, &mut header, false).unwrap();

            assert_eq!(grads[0].to_vec(), vec![3.0]);
            assert_eq!(header.num_samples, 6);
        },
    );
}
