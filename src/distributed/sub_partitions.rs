//! Sub-partition index over a flattened parameter group.
//!
//! Walking the flat buffer in strides of `sub_partition_size`, stride `idx`
//! belongs to worker `idx % world_size` within communication interval
//! `idx / world_size`. Both groupings — per interval and per worker — are
//! derived from the same arithmetic, so there is exactly one source of truth
//! and no materialized slice lists.

use std::ops::Range;

use log::info;

use crate::distributed::partition::PartitionPlan;
use crate::error::Result;

/// Index of the sub-partitions tiling one flat group.
///
/// Every element of the flat group belongs to exactly one sub-partition; the
/// `num_sub_partitions` slices of `sub_partition_size` elements tile it with
/// no gaps and no overlap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubPartitionIndex {
    sub_partition_size: usize,
    world_size: usize,
    num_comm_intervals: usize,
}

impl SubPartitionIndex {
    /// Build the index for a padded flat length.
    pub fn new(flat_len: usize, max_elements_per_comm: usize, world_size: usize) -> Result<Self> {
        let plan = PartitionPlan::compute(flat_len, max_elements_per_comm, world_size)?;
        info!(
            "partition info: total_elements={flat_len} world_size={world_size} \
             sub_partition_size={} num_sub_partitions={} num_comm_intervals={}",
            plan.sub_partition_size, plan.num_sub_partitions, plan.num_comm_intervals
        );
        Ok(Self::from_plan(&plan, world_size))
    }

    /// Build the index from an already computed plan.
    pub fn from_plan(plan: &PartitionPlan, world_size: usize) -> Self {
        Self {
            sub_partition_size: plan.sub_partition_size,
            world_size,
            num_comm_intervals: plan.num_comm_intervals,
        }
    }

    /// Elements per sub-partition.
    pub fn sub_partition_size(&self) -> usize {
        self.sub_partition_size
    }

    /// Workers in the group.
    pub fn world_size(&self) -> usize {
        self.world_size
    }

    /// Communication intervals (sub-partitions per worker).
    pub fn num_comm_intervals(&self) -> usize {
        self.num_comm_intervals
    }

    /// Total sub-partitions across all workers and intervals.
    pub fn num_sub_partitions(&self) -> usize {
        self.num_comm_intervals * self.world_size
    }

    /// Flat length covered by the index.
    pub fn flat_len(&self) -> usize {
        self.num_sub_partitions() * self.sub_partition_size
    }

    /// Owning worker of sub-partition `idx`.
    pub fn owner(&self, idx: usize) -> usize {
        idx % self.world_size
    }

    /// Communication interval of sub-partition `idx`.
    pub fn interval(&self, idx: usize) -> usize {
        idx / self.world_size
    }

    /// Element range of the sub-partition at `(comm_idx, rank)`.
    pub fn range(&self, comm_idx: usize, rank: usize) -> Range<usize> {
        let idx = comm_idx * self.world_size + rank;
        let start = idx * self.sub_partition_size;
        start..start + self.sub_partition_size
    }

    /// Ordered element ranges owned by `rank`, one per communication interval.
    pub fn worker_intervals(&self, rank: usize) -> Vec<Range<usize>> {
        (0..self.num_comm_intervals)
            .map(|comm_idx| self.range(comm_idx, rank))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn index(flat_len: usize, world_size: usize) -> SubPartitionIndex {
        SubPartitionIndex::new(flat_len, flat_len, world_size).unwrap()
    }

    #[test]
    fn test_ownership_round_robin() {
        // 12 elements, 3 workers, budget 12: one interval of three
        // sub-partitions of 4.
        let idx = index(12, 3);
        assert_eq!(idx.sub_partition_size(), 4);
        assert_eq!(idx.num_comm_intervals(), 1);
        assert_eq!(idx.owner(0), 0);
        assert_eq!(idx.owner(2), 2);
    }

    #[test]
    fn test_multi_interval_ranges() {
        let idx = SubPartitionIndex::new(12, 6, 2).unwrap();
        assert_eq!(idx.sub_partition_size(), 3);
        assert_eq!(idx.num_comm_intervals(), 2);
        assert_eq!(idx.range(0, 0), 0..3);
        assert_eq!(idx.range(0, 1), 3..6);
        assert_eq!(idx.range(1, 0), 6..9);
        assert_eq!(idx.range(1, 1), 9..12);
        assert_eq!(idx.worker_intervals(1), vec![3..6, 9..12]);
    }

    #[test]
    fn test_sub_partitions_tile_flat_group() {
        // Walking intervals then workers must visit every element exactly once.
        let idx = SubPartitionIndex::new(24, 8, 4).unwrap();
        let mut seen = vec![0usize; idx.flat_len()];
        for comm_idx in 0..idx.num_comm_intervals() {
            for rank in 0..idx.world_size() {
                for i in idx.range(comm_idx, rank) {
                    seen[i] += 1;
                }
            }
        }
        assert!(seen.iter().all(|&count| count == 1));
    }

    #[test]
    fn test_owner_interval_inverse_of_range() {
        let idx = SubPartitionIndex::new(30, 10, 5).unwrap();
        for sub_idx in 0..idx.num_sub_partitions() {
            let comm_idx = idx.interval(sub_idx);
            let rank = idx.owner(sub_idx);
            assert_eq!(idx.range(comm_idx, rank).start, sub_idx * idx.sub_partition_size());
        }
    }
}
