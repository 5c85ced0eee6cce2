//! Checkpoint orchestration: manifest, reader, writer, and resharder.
//!
//! This module provides:
//! - `Manifest`: the versioned on-disk record of shard count and locations
//! - `CheckpointReader`: load N stored shards as M in-memory shards
//! - `CheckpointWriter`: persist M shards, manifest written last
//! - `Resharder`: stream a checkpoint from N shards to M shards

mod manifest;
mod prefetch;
mod reader;
mod resharder;
mod writer;

pub use manifest::{Manifest, FORMAT_VERSION, LEGACY_VERSION};
pub use prefetch::ArchivePrefetcher;
pub use reader::CheckpointReader;
pub use resharder::Resharder;
pub use writer::CheckpointWriter;

use candle_core::Tensor;
use std::collections::HashMap;

use crate::TensorPath;

/// One mesh position's parameter dictionary, held in memory.
///
/// Produced by the reader, consumed by the writer; slices of all shards of
/// a split tensor are disjoint and reassemble the full tensor exactly,
/// while replicated tensors are bit-identical across shards.
pub struct ParamShard {
    /// Shard index within the mesh
    pub index: usize,
    /// Parameter tensors keyed by canonical tensor path
    pub tensors: HashMap<String, Tensor>,
}

impl ParamShard {
    pub fn new(index: usize) -> Self {
        ParamShard {
            index,
            tensors: HashMap::new(),
        }
    }

    /// Look up one parameter by path
    pub fn get(&self, path: &TensorPath) -> Option<&Tensor> {
        self.tensors.get(path.as_str())
    }

    /// Total bytes held by this shard's tensors
    pub fn size_bytes(&self) -> usize {
        self.tensors
            .values()
            .map(|t| t.elem_count() * t.dtype().size_in_bytes())
            .sum()
    }
}

impl std::fmt::Debug for ParamShard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ParamShard")
            .field("index", &self.index)
            .field("num_tensors", &self.tensors.len())
            .finish()
    }
}

/// Check one shard's tensors against the plan at a given shard count: the
/// path set must match exactly and every slice must have the predicted
/// per-shard shape.
pub(crate) fn validate_shard_tensors(
    plan: &crate::PartitionPlan,
    shard_index: usize,
    shard_count: usize,
    tensors: &HashMap<String, Tensor>,
) -> crate::Result<()> {
    for spec in plan.iter() {
        let tensor = tensors.get(spec.path.as_str()).ok_or_else(|| {
            crate::MeshCkptError::ArchitectureMismatch {
                path: spec.path.as_str().to_string(),
                detail: format!("missing from shard {}", shard_index),
            }
        })?;
        let expected = spec.shard_shape(shard_count)?;
        if tensor.dims() != expected.as_slice() {
            return Err(crate::MeshCkptError::shape_mismatch(
                format!("{} (shard {})", spec.path, shard_index),
                &expected,
                tensor.dims(),
            ));
        }
    }
    if tensors.len() != plan.len() {
        for name in tensors.keys() {
            if plan.get(&crate::TensorPath::from(name.as_str())).is_none() {
                return Err(crate::MeshCkptError::ArchitectureMismatch {
                    path: name.clone(),
                    detail: format!("unexpected tensor in shard {}", shard_index),
                });
            }
        }
    }
    Ok(())
}
