//! Sub-partition sizing arithmetic.
//!
//! A parameter group is flattened and cut into equal-size sub-partitions,
//! `world_size` of them per communication interval. The functions here pick
//! the effective per-communication element budget, derive the resulting
//! partition plan, and account for the zero padding appended so the flat
//! length divides evenly.

use log::{debug, info};

use crate::error::{Error, Result};

/// Pick the effective max-elements-per-communication budget.
///
/// If the group fits in a single communication interval the configured
/// budget is returned unchanged. Otherwise the padding incurred by the
/// maximum interval count consistent with the budget is compared against the
/// padding of using one fewer interval with an enlarged budget; whichever
/// wastes less is chosen, preferring the configured budget on a tie.
pub fn best_max_elements_per_comm(
    num_elements: usize,
    max_elements_per_comm: usize,
    world_size: usize,
) -> Result<usize> {
    if max_elements_per_comm < world_size {
        return Err(Error::InvalidArgument {
            arg: "max_elements_per_comm",
            reason: format!("{max_elements_per_comm} < world_size {world_size}"),
        });
    }

    // Interval count if the budget is used as-is, and the padding that costs.
    let max_comm_intervals = num_elements.div_ceil(max_elements_per_comm);
    let padding_for_max_comm = max_elements_per_comm * max_comm_intervals - num_elements;

    // One fewer interval means every interval grows; when the group already
    // fits in one interval there is nothing to compare.
    let min_comm_intervals = num_elements / max_elements_per_comm;
    if min_comm_intervals == 0 {
        debug!("using default max_elements_per_comm {max_elements_per_comm}");
        return Ok(max_elements_per_comm);
    }

    let padding_for_min_comm = num_elements.div_ceil(world_size * min_comm_intervals);

    if padding_for_max_comm > padding_for_min_comm {
        let updated = max_elements_per_comm + padding_for_min_comm;
        info!("updating max_elements_per_comm {max_elements_per_comm} -> {updated}");
        Ok(updated)
    } else {
        debug!("using default max_elements_per_comm {max_elements_per_comm}");
        Ok(max_elements_per_comm)
    }
}

/// Flatten-side alignment: how many sub-partitions of what size, and how much
/// zero padding, a group of `num_elements` needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AlignmentPlan {
    /// Sub-partitions per worker (= communication intervals).
    pub sub_partition_count: usize,
    /// Elements per sub-partition.
    pub sub_partition_size: usize,
    /// Trailing zero elements appended before flattening.
    pub padding: usize,
}

impl AlignmentPlan {
    /// Compute the alignment for a group.
    ///
    /// The per-worker slice is `ceil(num_elements / world_size)` elements; if
    /// that exceeds the per-worker share of the communication budget, the
    /// slice is cut into budget-sized sub-partitions instead.
    pub fn compute(
        num_elements: usize,
        world_size: usize,
        max_elements_per_comm: usize,
    ) -> Result<Self> {
        if num_elements == 0 {
            return Err(Error::InvalidArgument {
                arg: "num_elements",
                reason: "cannot align an empty group".to_string(),
            });
        }
        if max_elements_per_comm < world_size {
            return Err(Error::InvalidArgument {
                arg: "max_elements_per_comm",
                reason: format!("{max_elements_per_comm} < world_size {world_size}"),
            });
        }

        let aligned_param_size = num_elements.div_ceil(world_size);
        let aligned_comm_size = max_elements_per_comm / world_size;

        let (sub_partition_count, sub_partition_size) = if aligned_param_size <= aligned_comm_size {
            (1, aligned_param_size)
        } else {
            (aligned_param_size.div_ceil(aligned_comm_size), aligned_comm_size)
        };

        let padding = sub_partition_count * sub_partition_size * world_size - num_elements;

        Ok(Self {
            sub_partition_count,
            sub_partition_size,
            padding,
        })
    }

    /// Total element count after padding.
    pub fn padded_len(&self, world_size: usize) -> usize {
        self.sub_partition_count * self.sub_partition_size * world_size
    }
}

/// Partition plan over an already padded flat length.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartitionPlan {
    /// Elements per sub-partition.
    pub sub_partition_size: usize,
    /// Total sub-partitions across all workers and intervals.
    pub num_sub_partitions: usize,
    /// Communication intervals (= sub-partitions per worker).
    pub num_comm_intervals: usize,
}

impl PartitionPlan {
    /// Derive the plan for a padded flat length.
    ///
    /// Fails with [`Error::PartitionAlignment`] when the length does not
    /// divide evenly — that means the padding step was skipped or
    /// miscomputed, never a legitimate runtime condition.
    pub fn compute(
        total_elements: usize,
        max_elements_per_comm: usize,
        world_size: usize,
    ) -> Result<Self> {
        let budget = max_elements_per_comm.min(total_elements);
        let sub_partition_size = budget / world_size;
        if sub_partition_size == 0 {
            return Err(Error::InvalidArgument {
                arg: "max_elements_per_comm",
                reason: format!(
                    "budget {budget} yields an empty sub-partition for world_size {world_size}"
                ),
            });
        }

        let num_sub_partitions = total_elements / sub_partition_size;
        if total_elements % sub_partition_size != 0 {
            return Err(Error::PartitionAlignment {
                reason: format!("{total_elements} % {sub_partition_size} != 0"),
            });
        }

        let num_comm_intervals = num_sub_partitions / world_size;
        if num_sub_partitions % world_size != 0 {
            return Err(Error::PartitionAlignment {
                reason: format!("{num_sub_partitions} % {world_size} != 0"),
            });
        }

        Ok(Self {
            sub_partition_size,
            num_sub_partitions,
            num_comm_intervals,
        })
    }
}

/// Zero padding carried by one sub-partition.
///
/// Only sub-partitions past the end of the unpadded ("lean") flat length
/// carry padding; a fully padded sub-partition reports its whole size.
pub fn alignment_padding(
    flattened_lean_size: usize,
    sub_partition_id: usize,
    sub_partition_size: usize,
) -> usize {
    let high_limit = (sub_partition_id + 1) * sub_partition_size;
    if high_limit <= flattened_lean_size {
        0
    } else {
        sub_partition_size.min(high_limit - flattened_lean_size)
    }
}

/// Per-sub-partition padding for a whole group, indexed by sub-partition id.
pub fn group_alignment_paddings(
    flattened_lean_size: usize,
    sub_partition_size: usize,
    sub_partition_count: usize,
) -> Vec<usize> {
    (0..sub_partition_count)
        .map(|id| alignment_padding(flattened_lean_size, id, sub_partition_size))
        .collect()
}
