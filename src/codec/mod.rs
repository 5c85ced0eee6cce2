//! Tensor shard codec: pure split/merge/reshard of parameter tensors.
//!
//! This module never touches storage. Splits produce contiguous equal
//! blocks in ascending shard order along the rule's axis; `merge` is the
//! exact inverse, and `reshard` is merge followed by split at the new
//! count. `merge(split(t)) == t` is the invariant everything above this
//! module leans on.

mod qkv;

pub use qkv::{pack_qkv, unpack_qkv};

use candle_core::Tensor;

use crate::{MeshCkptError, PartitionRule, TensorSpec};

/// Extract shard `shard_index`'s slice of a full tensor.
pub fn split(
    spec: &TensorSpec,
    tensor: &Tensor,
    shard_index: usize,
    shard_count: usize,
) -> crate::Result<Tensor> {
    if tensor.dims() != spec.shape.as_slice() {
        return Err(MeshCkptError::shape_mismatch(
            spec.path.as_str(),
            &spec.shape,
            tensor.dims(),
        ));
    }
    if shard_index >= shard_count {
        return Err(MeshCkptError::ConfigError(format!(
            "shard index {} out of range for {} shards",
            shard_index, shard_count
        )));
    }
    match spec.rule {
        PartitionRule::Replicate => Ok(tensor.clone()),
        PartitionRule::Split { axis } => {
            let block = spec.shard_shape(shard_count)?[axis];
            Ok(tensor.narrow(axis, shard_index * block, block)?)
        }
    }
}

/// Reassemble a full tensor from all of its slices, supplied in shard-index
/// order. Requires exactly as many slices as the checkpoint has shards; any
/// slice whose shape disagrees with the expected per-shard block is a
/// shape-mismatch error (a wrong slice count or shape here indicates a
/// programming or data-corruption bug, never a retryable condition).
pub fn merge(spec: &TensorSpec, slices: &[Tensor]) -> crate::Result<Tensor> {
    if slices.is_empty() {
        return Err(MeshCkptError::shape_mismatch(
            spec.path.as_str(),
            &spec.shape,
            &[],
        ));
    }
    let expected = spec.shard_shape(slices.len())?;
    for slice in slices {
        if slice.dims() != expected.as_slice() {
            return Err(MeshCkptError::shape_mismatch(
                spec.path.as_str(),
                &expected,
                slice.dims(),
            ));
        }
    }
    match spec.rule {
        // Replicas are bit-identical by contract; any copy will do.
        PartitionRule::Replicate => Ok(slices[0].clone()),
        PartitionRule::Split { axis } => Ok(Tensor::cat(slices, axis)?),
    }
}

/// Convert a tensor's slices from `slices.len()` shards to `dest_count`
/// shards: merge, then split at the new count.
pub fn reshard(
    spec: &TensorSpec,
    slices: &[Tensor],
    dest_count: usize,
) -> crate::Result<Vec<Tensor>> {
    let full = merge(spec, slices)?;
    (0..dest_count)
        .map(|i| split(spec, &full, i, dest_count))
        .collect()
}
