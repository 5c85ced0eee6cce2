//! Mesh partition planning: which axis of each parameter is split across
//! shards, and what each shard's slice shapes are.
//!
//! This module provides:
//! - `TensorPath`: stable identifier for one parameter tensor
//! - `PartitionRule`: replicate or split-along-axis
//! - `PartitionPlan`: the full tensor-path → rule/shape table for a config
//!
//! The plan is pure metadata derived from an [`ArchConfig`](crate::ArchConfig)
//! alone; building one allocates no tensor bytes and performs no I/O, which
//! is what makes the dematerialized structure-prediction mode free.

mod planner;

pub use planner::PartitionPlan;

use candle_core::DType;
use std::fmt;

/// Stable identifier for one parameter tensor.
///
/// The canonical rendering doubles as the tensor's key inside a shard
/// archive, e.g. `layers.3.attn.q_proj.weight` or `embed.weight`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TensorPath(String);

impl TensorPath {
    /// Path for a global (non-layer) parameter, e.g. `embed.weight`
    pub fn global(module: &str, param: &str) -> Self {
        TensorPath(format!("{}.{}", module, param))
    }

    /// Path for a per-layer parameter, e.g. `layers.3.mlp.fc_in.bias`
    pub fn layer(layer_idx: usize, module: &str, param: &str) -> Self {
        TensorPath(format!("layers.{}.{}.{}", layer_idx, module, param))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Layer index for per-layer parameters, `None` for global ones
    pub fn layer_index(&self) -> Option<usize> {
        let rest = self.0.strip_prefix("layers.")?;
        rest.split('.').next()?.parse().ok()
    }
}

impl fmt::Display for TensorPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TensorPath {
    fn from(s: &str) -> Self {
        TensorPath(s.to_string())
    }
}

/// How one parameter tensor is distributed across shards
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartitionRule {
    /// Every shard holds a full identical copy
    Replicate,
    /// Dimension `axis` is divided into equal contiguous blocks, one per
    /// shard index in ascending order
    Split { axis: usize },
}

/// Shape and dtype of one tensor (or one slice of it)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TensorInfo {
    pub shape: Vec<usize>,
    pub dtype: DType,
}

/// One parameter's entry in a partition plan: identity, full (unsharded)
/// shape, dtype, and partition rule.
#[derive(Debug, Clone)]
pub struct TensorSpec {
    pub path: TensorPath,
    pub shape: Vec<usize>,
    pub dtype: DType,
    pub rule: PartitionRule,
}

impl TensorSpec {
    /// Shape of one shard's slice of this tensor.
    ///
    /// Fails with a configuration error if the split axis is not evenly
    /// divisible by `shard_count`; uneven shards are not supported because
    /// downstream mesh compute assumes uniform per-shard extents.
    pub fn shard_shape(&self, shard_count: usize) -> crate::Result<Vec<usize>> {
        match self.rule {
            PartitionRule::Replicate => Ok(self.shape.clone()),
            PartitionRule::Split { axis } => {
                let extent = self.shape[axis];
                if shard_count == 0 || extent % shard_count != 0 {
                    return Err(crate::MeshCkptError::ConfigError(format!(
                        "tensor {}: axis {} extent {} not divisible by {} shards",
                        self.path, axis, extent, shard_count
                    )));
                }
                let mut shape = self.shape.clone();
                shape[axis] = extent / shard_count;
                Ok(shape)
            }
        }
    }

    /// Number of elements in the full tensor
    pub fn num_elements(&self) -> usize {
        self.shape.iter().product()
    }
}

/// Per-shard tensor layout: the metadata-only view of one shard, with no
/// tensor bytes behind it.
#[derive(Debug, Clone)]
pub struct ShardLayout {
    /// Shard index within the mesh
    pub index: usize,
    /// Slice shape and dtype per tensor path
    pub tensors: std::collections::BTreeMap<TensorPath, TensorInfo>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tensor_path_rendering() {
        assert_eq!(TensorPath::global("embed", "weight").as_str(), "embed.weight");
        assert_eq!(
            TensorPath::layer(7, "attn.out_proj", "bias").as_str(),
            "layers.7.attn.out_proj.bias"
        );
    }

    #[test]
    fn test_layer_index_parse() {
        assert_eq!(
            TensorPath::layer(12, "mlp.fc_in", "weight").layer_index(),
            Some(12)
        );
        assert_eq!(TensorPath::global("embed", "weight").layer_index(), None);
    }

    #[test]
    fn test_shard_shape_split() {
        let spec = TensorSpec {
            path: TensorPath::global("embed", "weight"),
            shape: vec![32, 16],
            dtype: DType::F32,
            rule: PartitionRule::Split { axis: 0 },
        };
        assert_eq!(spec.shard_shape(4).unwrap(), vec![8, 16]);
        assert_eq!(spec.shard_shape(1).unwrap(), vec![32, 16]);
    }

    #[test]
    fn test_shard_shape_uneven_rejected() {
        let spec = TensorSpec {
            path: TensorPath::global("embed", "weight"),
            shape: vec![30, 16],
            dtype: DType::F32,
            rule: PartitionRule::Split { axis: 0 },
        };
        assert!(matches!(
            spec.shard_shape(4),
            Err(crate::MeshCkptError::ConfigError(_))
        ));
    }

    #[test]
    fn test_shard_shape_replicate() {
        let spec = TensorSpec {
            path: TensorPath::global("final_norm", "scale"),
            shape: vec![16],
            dtype: DType::F32,
            rule: PartitionRule::Replicate,
        };
        assert_eq!(spec.shard_shape(8).unwrap(), vec![16]);
    }
}
