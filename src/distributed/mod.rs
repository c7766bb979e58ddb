pub mod checkpoint;
pub mod flatten;
pub mod param_map;
pub mod partition;
pub mod sharded_optimizer;
pub mod sub_partitions;

pub use checkpoint::{
    load_sharded_states, repartition_values, save_sharded_state, CheckpointState, ElasticState,
    PartitionState, RigidState, ShardingMeta, CHECKPOINT_VERSION,
};
pub use flatten::{flatten_aligned, flatten_aligned_values};
pub use param_map::{materialize_sub_partition, Contribution, ParamMapping};
pub use partition::{
    alignment_padding, best_max_elements_per_comm, group_alignment_paddings, AlignmentPlan,
    PartitionPlan,
};
pub use sharded_optimizer::{ShardedOptimizer, ShardedOptimizerConfig};
pub use sub_partitions::SubPartitionIndex;
