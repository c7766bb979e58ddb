//! Mapping between original buffers and the sub-partitions that slice them.
//!
//! Buffer boundaries do not align with sub-partition boundaries, so each
//! worker needs, per communication interval, the ordered list of buffers
//! (and intra-buffer offsets) that supply its sub-partition. A buffer may
//! contribute to zero, one, or several of a worker's intervals; one spanning
//! an interval boundary contributes to two consecutive intervals.

use crate::distributed::sub_partitions::SubPartitionIndex;
use crate::error::Result;

/// One buffer window feeding one worker's sub-partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Contribution {
    /// Index of the buffer in the group's flattening order.
    pub param: usize,
    /// Start offset of the window within the buffer.
    pub offset: usize,
    /// Elements contributed.
    pub len: usize,
}

/// Per-worker, per-interval contribution lists for one parameter group.
#[derive(Debug, Clone)]
pub struct ParamMapping {
    /// `[rank][comm_idx]` -> ordered contributions.
    per_rank: Vec<Vec<Vec<Contribution>>>,
    /// Buffers the local worker owns no slice of.
    not_local: Vec<usize>,
}

impl ParamMapping {
    /// Build the mapping from buffer element counts and a sub-partition index.
    ///
    /// `param_numels` lists the buffers in flattening order; padding is not a
    /// buffer and trailing padded intervals simply collect no contributions.
    pub fn build(param_numels: &[usize], index: &SubPartitionIndex, local_rank: usize) -> Self {
        let world_size = index.world_size();
        let num_comm_intervals = index.num_comm_intervals();

        let mut per_rank = Vec::with_capacity(world_size);
        let mut not_local = Vec::new();

        for rank in 0..world_size {
            let intervals = index.worker_intervals(rank);
            let mut per_comm: Vec<Vec<Contribution>> = vec![Vec::new(); num_comm_intervals];

            let mut current_index = 0usize;
            for (param, &numel) in param_numels.iter().enumerate() {
                let param_end = current_index + numel;
                let mut contained = false;

                for (comm_idx, range) in intervals.iter().enumerate() {
                    // Either the range enters the buffer part-way through, or
                    // the buffer starts inside the range.
                    let overlap_start = range.start.max(current_index);
                    let overlap_end = range.end.min(param_end);
                    if overlap_start >= overlap_end {
                        continue;
                    }
                    contained = true;
                    per_comm[comm_idx].push(Contribution {
                        param,
                        offset: overlap_start - current_index,
                        len: overlap_end - overlap_start,
                    });
                }

                if !contained && rank == local_rank {
                    not_local.push(param);
                }

                current_index = param_end;
            }

            per_rank.push(per_comm);
        }

        Self {
            per_rank,
            not_local,
        }
    }

    /// Ordered contributions to `rank`'s sub-partition in `comm_idx`.
    pub fn contributions(&self, rank: usize, comm_idx: usize) -> &[Contribution] {
        &self.per_rank[rank][comm_idx]
    }

    /// Buffers the local worker owns no slice of. Their gradient storage can
    /// be released as soon as gradients are no longer needed.
    pub fn not_local(&self) -> &[usize] {
        &self.not_local
    }
}

/// Copy an interval's contribution windows into one flat slice of exactly
/// `sub_partition_size` elements.
///
/// `fetch(param, offset, len)` returns the buffer window as f32; windows land
/// back to back in contribution order, and a short tail (final interval of a
/// group) stays zero-filled.
pub fn materialize_sub_partition<F>(
    contributions: &[Contribution],
    sub_partition_size: usize,
    mut fetch: F,
) -> Result<Vec<f32>>
where
    F: FnMut(usize, usize, usize) -> Result<Vec<f32>>,
{
    let mut flat = vec![0.0f32; sub_partition_size];
    let mut cursor = 0usize;
    for contribution in contributions {
        let values = fetch(contribution.param, contribution.offset, contribution.len)?;
        debug_assert_eq!(values.len(), contribution.len);
        flat[cursor..cursor + contribution.len].copy_from_slice(&values);
        cursor += contribution.len;
    }
    debug_assert!(cursor <= sub_partition_size);
    Ok(flat)
}
