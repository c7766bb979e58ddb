//! Optimizer step service abstraction.
//!
//! The sharding engine never performs the numeric update itself: it hands
//! each worker's private full-precision sub-partitions to a
//! [`SubPartitionOptimizer`] and consumes the updated values. Any optimizer
//! that works on flat slices can sit behind this trait.

use serde::{Deserialize, Serialize};

use crate::error::Result;

/// One worker-private full-precision sub-partition.
///
/// `values` mirrors the reduced-precision slice this worker owns in the flat
/// group; `grad` is attached just before the optimizer step and released
/// right after.
#[derive(Debug, Clone)]
pub struct Fp32SubPartition {
    /// Full-precision master values.
    pub values: Vec<f32>,
    /// Gradient for the pending step, if any.
    pub grad: Option<Vec<f32>>,
}

impl Fp32SubPartition {
    /// A sub-partition seeded from existing values, with no gradient.
    pub fn new(values: Vec<f32>) -> Self {
        Self { values, grad: None }
    }
}

/// A single optimizer-state entry.
///
/// Tensor-valued state (momentum, variance) is merged and re-sliced by the
/// elastic checkpoint; scalar state (step counters, hyperparameters) is
/// passed through unchanged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum StateValue {
    /// Per-element auxiliary state, same length as the sub-partition.
    Tensor(Vec<f32>),
    /// Scalar state, never repartitioned.
    Scalar(f64),
}

/// Numeric optimizer over flat full-precision sub-partitions.
///
/// Implementations may allocate internal per-partition auxiliary state keyed
/// by `(group, partition)` identity; the engine forces that allocation once
/// at setup by stepping with all-zero gradients.
pub trait SubPartitionOptimizer {
    /// One in-place update over every group's sub-partitions.
    ///
    /// Called once per training step. Partitions without a gradient are
    /// skipped.
    fn step(&mut self, groups: &mut [Vec<Fp32SubPartition>]) -> Result<()>;

    /// Auxiliary state of one sub-partition, keyed by state name.
    fn state(&self, group: usize, partition: usize) -> Vec<(String, StateValue)>;

    /// Replace the auxiliary state of one sub-partition.
    fn load_state(
        &mut self,
        group: usize,
        partition: usize,
        entries: &[(String, StateValue)],
    ) -> Result<()>;
}
