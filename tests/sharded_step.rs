use std::sync::Arc;

use shardr::distributed::{
    flatten_aligned, group_alignment_paddings, load_sharded_states, materialize_sub_partition,
    repartition_values, save_sharded_state, ParamMapping, SubPartitionIndex,
};
use shardr::{
    AdamW, AdamWConfig, Buffer, DType, NoOpCommunicator, ShardedOptimizer,
    ShardedOptimizerConfig,
};

fn engine_with(
    values: &[&[f32]],
    config: ShardedOptimizerConfig,
) -> ShardedOptimizer<AdamW> {
    let buffers = values
        .iter()
        .map(|v| Buffer::from_f32(v, DType::F16))
        .collect();
    ShardedOptimizer::new(
        AdamW::new(AdamWConfig {
            lr: 0.1,
            weight_decay: 0.0,
            ..Default::default()
        }),
        vec![buffers],
        Arc::new(NoOpCommunicator),
        config,
    )
    .expect("valid setup")
}

#[test]
fn test_flatten_slice_reassemble_roundtrip() {
    // Slicing the flat group and concatenating every sub-partition in
    // interval-major order must reproduce it exactly.
    let buffers = [
        Buffer::from_f32(&[1.0, 2.0, 3.0, 4.0, 5.0], DType::F16),
        Buffer::from_f32(&[6.0, 7.0, 8.0], DType::F16),
        Buffer::from_f32(&[9.0, 10.0], DType::F16),
    ];
    let world_size = 2;
    let budget = 4;
    let (flat, _align) = flatten_aligned(&buffers, world_size, budget).expect("flatten");
    let index = SubPartitionIndex::new(flat.numel(), budget, world_size).expect("index");

    let mut reassembled = Vec::new();
    for comm_idx in 0..index.num_comm_intervals() {
        for rank in 0..world_size {
            let range = index.range(comm_idx, rank);
            reassembled.extend(flat.slice_f32(range.start, range.len()).expect("slice"));
        }
    }
    assert_eq!(reassembled, flat.to_f32_vec());
}

#[test]
fn test_materialized_weights_match_flat_slices() {
    // Materializing each worker's sub-partition from the original buffers
    // must equal the matching flat-group slice, padding included.
    let values: [&[f32]; 3] = [&[1.0, 2.0, 3.0, 4.0, 5.0], &[6.0, 7.0, 8.0], &[9.0, 10.0]];
    let buffers: Vec<Buffer> = values
        .iter()
        .map(|v| Buffer::from_f32(v, DType::F32))
        .collect();
    let numels: Vec<usize> = values.iter().map(|v| v.len()).collect();

    let world_size = 3;
    let budget = 6;
    let (flat, _align) = flatten_aligned(&buffers, world_size, budget).expect("flatten");
    let index = SubPartitionIndex::new(flat.numel(), budget, world_size).expect("index");
    let mapping = ParamMapping::build(&numels, &index, 0);

    for rank in 0..world_size {
        for comm_idx in 0..index.num_comm_intervals() {
            let materialized = materialize_sub_partition(
                mapping.contributions(rank, comm_idx),
                index.sub_partition_size(),
                |param, offset, len| Ok(values[param][offset..offset + len].to_vec()),
            )
            .expect("materialize");

            let range = index.range(comm_idx, rank);
            let expected = flat.slice_f32(range.start, range.len()).expect("slice");
            assert_eq!(materialized, expected, "rank {rank}, interval {comm_idx}");
        }
    }
}

#[test]
fn test_training_loop_converges_toward_target() {
    // Minimize ||w||^2 by feeding grad = 2w; values must shrink every step.
    let mut engine = engine_with(
        &[&[4.0, -4.0, 2.0], &[1.0, -1.0]],
        ShardedOptimizerConfig::default(),
    );

    let magnitude_before: f32 = engine
        .param_values(0, 0)
        .unwrap()
        .iter()
        .chain(engine.param_values(0, 1).unwrap().iter())
        .map(|v| v.abs())
        .sum();

    for _ in 0..20 {
        let w0 = engine.param_values(0, 0).unwrap();
        let w1 = engine.param_values(0, 1).unwrap();
        let g0: Vec<f32> = w0.iter().map(|v| 2.0 * v).collect();
        let g1: Vec<f32> = w1.iter().map(|v| 2.0 * v).collect();
        engine.set_gradient(0, 0, &g0).unwrap();
        engine.set_gradient(0, 1, &g1).unwrap();
        engine.reduce_scatter_gradients().unwrap();
        assert!(!engine.step().unwrap());
    }

    let magnitude_after: f32 = engine
        .param_values(0, 0)
        .unwrap()
        .iter()
        .chain(engine.param_values(0, 1).unwrap().iter())
        .map(|v| v.abs())
        .sum();
    assert!(
        magnitude_after < magnitude_before,
        "{magnitude_after} should shrink below {magnitude_before}"
    );
}

#[test]
fn test_rigid_checkpoint_roundtrip_same_world_size() {
    let values: [&[f32]; 2] = [&[1.0, 2.0, 3.0, 4.0], &[5.0, 6.0, 7.0, 8.0, 9.0]];
    let config = ShardedOptimizerConfig::default().with_elastic_checkpoint(false);

    let mut engine = engine_with(&values, config.clone());
    engine.set_gradient(0, 0, &[0.5; 4]).unwrap();
    engine.set_gradient(0, 1, &[0.5; 5]).unwrap();
    engine.step().unwrap();

    let saved = engine.state_dict();

    let mut restored = engine_with(&values, config);
    restored.load_state_dict(&[saved], true, false).unwrap();

    assert_eq!(
        engine.fp32_sub_partitions(0)[0].values,
        restored.fp32_sub_partitions(0)[0].values
    );
    assert_eq!(
        engine.optimizer().timestep(),
        restored.optimizer().timestep()
    );
}

#[test]
fn test_elastic_checkpoint_identity_roundtrip() {
    // Saving at worker count 1 and repartitioning for worker count 1 must
    // restore byte-identical sub-partitions.
    let values: [&[f32]; 2] = [&[1.0, 2.0, 3.0, 4.0], &[5.0, 6.0, 7.0, 8.0, 9.0]];
    let mut engine = engine_with(&values, ShardedOptimizerConfig::default());
    engine.set_gradient(0, 0, &[0.5; 4]).unwrap();
    engine.set_gradient(0, 1, &[0.25; 5]).unwrap();
    engine.step().unwrap();

    let saved = engine.state_dict();

    let mut restored = engine_with(&values, ShardedOptimizerConfig::default());
    restored.load_state_dict(&[saved], true, true).unwrap();

    assert_eq!(
        engine.fp32_sub_partitions(0)[0].values,
        restored.fp32_sub_partitions(0)[0].values
    );
    assert_eq!(
        engine.optimizer().state(0, 0),
        restored.optimizer().state(0, 0)
    );

    // Both engines must evolve identically from here.
    for e in [&mut engine, &mut restored] {
        e.set_gradient(0, 0, &[0.1; 4]).unwrap();
        e.set_gradient(0, 1, &[0.1; 5]).unwrap();
        e.step().unwrap();
    }
    assert_eq!(
        engine.fp32_sub_partitions(0)[0].values,
        restored.fp32_sub_partitions(0)[0].values
    );
}

/// Slice a lean flat value list the way `world_size` workers would save it:
/// per worker, per interval, padding stripped.
fn saved_shards(lean: &[f32], world_size: usize, budget: usize) -> Vec<Vec<Vec<f32>>> {
    let (flat, _align) =
        shardr::distributed::flatten_aligned_values(&[lean], world_size, budget).expect("flatten");
    let index = SubPartitionIndex::new(flat.len(), budget, world_size).expect("index");
    let paddings = group_alignment_paddings(
        lean.len(),
        index.sub_partition_size(),
        index.num_sub_partitions(),
    );

    (0..world_size)
        .map(|rank| {
            (0..index.num_comm_intervals())
                .map(|comm_idx| {
                    let range = index.range(comm_idx, rank);
                    let pad = paddings[comm_idx * world_size + rank];
                    flat[range.start..range.end - pad].to_vec()
                })
                .collect()
        })
        .collect()
}

#[test]
fn test_elastic_repartition_n_to_m_to_n_recovers_values() {
    let lean: Vec<f32> = (0..17).map(|i| i as f32).collect();

    // Budget 100 keeps every plan at one interval; budget 6 forces several.
    for (n, m, budget) in [
        (2usize, 3usize, 100usize),
        (3, 2, 100),
        (1, 4, 100),
        (4, 1, 100),
        (2, 3, 6),
        (3, 2, 6),
    ] {
        let saved_n = saved_shards(&lean, n, budget);

        // Load under M workers, then re-save what each of the M workers holds.
        let per_rank_n: Vec<&[Vec<f32>]> = saved_n.iter().map(|r| r.as_slice()).collect();
        let mut held_m = Vec::new();
        for rank in 0..m {
            held_m.push(repartition_values(&per_rank_n, m, rank, budget).expect("repartition"));
        }

        // Strip the padding the M-worker plan introduced before re-merging.
        let reference_m = saved_shards(&lean, m, budget);
        for (held, reference) in held_m.iter_mut().zip(&reference_m) {
            for (partition, lean_partition) in held.iter_mut().zip(reference) {
                partition.truncate(lean_partition.len());
                assert_eq!(partition, lean_partition);
            }
        }

        // And back to N: the original values must come back exactly.
        let per_rank_m: Vec<&[Vec<f32>]> = held_m.iter().map(|r| r.as_slice()).collect();
        let reference_n = saved_shards(&lean, n, budget);
        for rank in 0..n {
            let back = repartition_values(&per_rank_m, n, rank, budget).expect("repartition");
            for (partition, lean_partition) in back.iter().zip(&reference_n[rank]) {
                assert_eq!(&partition[..lean_partition.len()], lean_partition.as_slice());
            }
        }
    }
}

#[test]
fn test_sharded_state_directory_roundtrip() {
    let values: [&[f32]; 1] = [&[1.0, 2.0, 3.0, 4.0]];
    let mut engine = engine_with(&values, ShardedOptimizerConfig::default());
    engine.set_gradient(0, 0, &[0.5; 4]).unwrap();
    engine.step().unwrap();

    let dir = tempfile::TempDir::new().expect("tempdir");
    save_sharded_state(dir.path(), 0, 1, &engine.state_dict()).expect("save");

    assert!(dir.path().join("rank_0/zero_state.json").exists());
    assert!(dir.path().join("sharding_meta.json").exists());

    let states = load_sharded_states(dir.path()).expect("load");
    assert_eq!(states.len(), 1);

    let mut restored = engine_with(&values, ShardedOptimizerConfig::default());
    restored.load_state_dict(&states, true, true).unwrap();
    assert_eq!(
        engine.fp32_sub_partitions(0)[0].values,
        restored.fp32_sub_partitions(0)[0].values
    );
}

#[test]
fn test_overflow_step_skips_and_recovers() {
    let values: [&[f32]; 1] = [&[1.0, 2.0, 3.0]];
    let mut engine = engine_with(
        &values,
        ShardedOptimizerConfig::default().with_dynamic_loss_scale(shardr::DynamicScaleArgs {
            init_scale: 2.0,
            ..Default::default()
        }),
    );
    let scale_before = engine.loss_scale();
    let weights_before = engine.param_values(0, 0).unwrap();

    engine.set_gradient(0, 0, &[f32::NAN, 0.0, 0.0]).unwrap();
    assert!(engine.step().unwrap());
    assert!(engine.loss_scale() < scale_before);
    assert_eq!(engine.param_values(0, 0).unwrap(), weights_before);

    // Training continues with clean gradients.
    engine.set_gradient(0, 0, &[0.1, 0.1, 0.1]).unwrap();
    assert!(!engine.step().unwrap());
    assert_ne!(engine.param_values(0, 0).unwrap(), weights_before);
}
