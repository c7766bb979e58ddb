//! Flatten a buffer list into one sub-partition-aligned allocation.
//!
//! Concatenation preserves input order and never splits a buffer; a trailing
//! zero buffer is appended so the flat length is an exact multiple of
//! `sub_partition_size * world_size`. The f32 entry point is shared with
//! checkpoint merging, which re-flattens saved sub-partition values.

use crate::buffer::Buffer;
use crate::distributed::partition::AlignmentPlan;
use crate::error::{Error, Result};

/// Flatten buffers into one aligned [`Buffer`] in the group's storage dtype.
///
/// The padding inherits the first buffer's dtype; all buffers must agree.
pub fn flatten_aligned(
    buffers: &[Buffer],
    world_size: usize,
    max_elements_per_comm: usize,
) -> Result<(Buffer, AlignmentPlan)> {
    let first = buffers.first().ok_or_else(|| Error::InvalidArgument {
        arg: "buffers",
        reason: "cannot flatten an empty buffer list".to_string(),
    })?;
    let dtype = first.dtype();

    let num_elements: usize = buffers.iter().map(Buffer::numel).sum();
    let align = AlignmentPlan::compute(num_elements, world_size, max_elements_per_comm)?;

    let mut flat = Buffer::zeros(0, dtype);
    for buffer in buffers {
        flat.append(buffer)?;
    }
    if align.padding > 0 {
        flat.append(&Buffer::zeros(align.padding, dtype))?;
    }

    debug_assert_eq!(flat.numel(), align.padded_len(world_size));
    Ok((flat, align))
}

/// Flatten f32 value lists into one aligned vector.
pub fn flatten_aligned_values(
    tensors: &[&[f32]],
    world_size: usize,
    max_elements_per_comm: usize,
) -> Result<(Vec<f32>, AlignmentPlan)> {
    let num_elements: usize = tensors.iter().map(|t| t.len()).sum();
    let align = AlignmentPlan::compute(num_elements, world_size, max_elements_per_comm)?;

    let mut flat = Vec::with_capacity(align.padded_len(world_size));
    for tensor in tensors {
        flat.extend_from_slice(tensor);
    }
    flat.resize(align.padded_len(world_size), 0.0);

    Ok((flat, align))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::DType;

    #[test]
    fn test_flatten_exact_multiple_no_padding() {
        let buffers = [
            Buffer::from_f32(&[1.0, 2.0, 3.0, 4.0], DType::F16),
            Buffer::from_f32(&[5.0, 6.0, 7.0, 8.0, 9.0], DType::F16),
        ];
        let (flat, align) = flatten_aligned(&buffers, 3, 100).unwrap();
        assert_eq!(align.padding, 0);
        assert_eq!(flat.numel(), 9);
        assert_eq!(
            flat.to_f32_vec(),
            vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0, 9.0]
        );
    }

    #[test]
    fn test_flatten_appends_zero_padding() {
        let buffers = [
            Buffer::from_f32(&[1.0; 4], DType::F32),
            Buffer::from_f32(&[2.0; 5], DType::F32),
            Buffer::from_f32(&[3.0; 2], DType::F32),
        ];
        let (flat, align) = flatten_aligned(&buffers, 3, 100).unwrap();
        assert_eq!(align.padding, 1);
        assert_eq!(flat.numel(), 12);
        assert_eq!(flat.slice_f32(11, 1).unwrap(), vec![0.0]);
    }

    #[test]
    fn test_flatten_rejects_empty_list() {
        assert!(flatten_aligned(&[], 2, 100).is_err());
    }

    #[test]
    fn test_flatten_values_matches_buffer_path() {
        let a = [1.0f32, 2.0, 3.0];
        let b = [4.0f32, 5.0];
        let (flat, align) = flatten_aligned_values(&[&a, &b], 2, 100).unwrap();
        assert_eq!(align.padding, 1);
        assert_eq!(flat, vec![1.0, 2.0, 3.0, 4.0, 5.0, 0.0]);
    }
}
