//! The partition planner: maps an architecture config to the full table of
//! per-tensor partition rules and unsharded shapes.
//!
//! Rules are a fixed policy, not configurable per call:
//! - embedding table and output head split along the vocabulary axis
//! - Q/K/V (separate or combined) split along the head axis
//! - attention output and second MLP projection split along the input
//!   feature axis (row-parallel), first MLP projection along the output
//!   feature axis (column-parallel)
//! - layer norms and biases of row-parallel projections replicate

use std::collections::BTreeMap;

use candle_core::DType;

use crate::config::ArchConfig;
use crate::{PartitionRule, TensorPath, TensorSpec};

use super::{ShardLayout, TensorInfo};

/// The complete tensor-path → partition-rule/shape table for one
/// architecture config. Deterministically ordered by path.
#[derive(Debug, Clone)]
pub struct PartitionPlan {
    specs: BTreeMap<TensorPath, TensorSpec>,
    n_heads: usize,
    padded_vocab: usize,
}

impl PartitionPlan {
    /// Build the plan for a config. Pure metadata; no allocation of tensor
    /// bytes and no I/O.
    pub fn for_config(config: &ArchConfig) -> crate::Result<Self> {
        config.validate()?;

        let dtype = config.parsed_dtype();
        let d = config.d_model;
        let vocab = config.padded_vocab();
        let mut specs = BTreeMap::new();

        let mut add = |path: TensorPath, shape: Vec<usize>, rule: PartitionRule| {
            specs.insert(
                path.clone(),
                TensorSpec {
                    path,
                    shape,
                    dtype,
                    rule,
                },
            );
        };

        // Token embedding: rows are vocabulary entries, split across shards.
        add(
            TensorPath::global("embed", "weight"),
            vec![vocab, d],
            PartitionRule::Split { axis: 0 },
        );
        if config.embed_bias() {
            add(
                TensorPath::global("embed", "bias"),
                vec![d],
                PartitionRule::Replicate,
            );
        }
        if config.has_embed_norm() {
            for param in ["scale", "offset"] {
                add(
                    TensorPath::global("embed_norm", param),
                    vec![d],
                    PartitionRule::Replicate,
                );
            }
        }

        for layer in 0..config.n_layers {
            if config.combined_qkv() {
                // Strided layout: head groups interleaved Q0,K0,V0,Q1,...
                // along the combined axis. Each shard takes whole head
                // groups, so the per-shard slice is still contiguous.
                add(
                    TensorPath::layer(layer, "attn.qkv_proj", "weight"),
                    vec![d, 3 * d],
                    PartitionRule::Split { axis: 1 },
                );
                if config.qkv_bias() {
                    add(
                        TensorPath::layer(layer, "attn.qkv_proj", "bias"),
                        vec![3 * d],
                        PartitionRule::Split { axis: 0 },
                    );
                }
            } else {
                for proj in ["attn.q_proj", "attn.k_proj", "attn.v_proj"] {
                    add(
                        TensorPath::layer(layer, proj, "weight"),
                        vec![d, d],
                        PartitionRule::Split { axis: 1 },
                    );
                    if config.qkv_bias() {
                        add(
                            TensorPath::layer(layer, proj, "bias"),
                            vec![d],
                            PartitionRule::Split { axis: 0 },
                        );
                    }
                }
            }

            // Row-parallel: split on the input axis, bias applied once and
            // therefore replicated.
            add(
                TensorPath::layer(layer, "attn.out_proj", "weight"),
                vec![d, d],
                PartitionRule::Split { axis: 0 },
            );
            if config.out_proj_bias() {
                add(
                    TensorPath::layer(layer, "attn.out_proj", "bias"),
                    vec![d],
                    PartitionRule::Replicate,
                );
            }

            add(
                TensorPath::layer(layer, "mlp.fc_in", "weight"),
                vec![d, config.d_ffn()],
                PartitionRule::Split { axis: 1 },
            );
            add(
                TensorPath::layer(layer, "mlp.fc_in", "bias"),
                vec![config.d_ffn()],
                PartitionRule::Split { axis: 0 },
            );
            add(
                TensorPath::layer(layer, "mlp.fc_out", "weight"),
                vec![config.d_ffn(), d],
                PartitionRule::Split { axis: 0 },
            );
            add(
                TensorPath::layer(layer, "mlp.fc_out", "bias"),
                vec![d],
                PartitionRule::Replicate,
            );

            for param in ["scale", "offset"] {
                add(
                    TensorPath::layer(layer, "attn_norm", param),
                    vec![d],
                    PartitionRule::Replicate,
                );
            }
            if config.has_mlp_norm() {
                for param in ["scale", "offset"] {
                    add(
                        TensorPath::layer(layer, "mlp_norm", param),
                        vec![d],
                        PartitionRule::Replicate,
                    );
                }
            }
        }

        if config.has_final_norm() {
            for param in ["scale", "offset"] {
                add(
                    TensorPath::global("final_norm", param),
                    vec![d],
                    PartitionRule::Replicate,
                );
            }
        }

        if config.has_lm_head() {
            add(
                TensorPath::global("lm_head", "weight"),
                vec![d, vocab],
                PartitionRule::Split { axis: 1 },
            );
            if config.lm_head_bias() {
                add(
                    TensorPath::global("lm_head", "bias"),
                    vec![vocab],
                    PartitionRule::Split { axis: 0 },
                );
            }
        }

        Ok(PartitionPlan {
            specs,
            n_heads: config.n_heads,
            padded_vocab: vocab,
        })
    }

    /// Number of parameter tensors in the plan
    pub fn len(&self) -> usize {
        self.specs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.specs.is_empty()
    }

    /// Iterate specs in deterministic path order
    pub fn iter(&self) -> impl Iterator<Item = &TensorSpec> {
        self.specs.values()
    }

    /// Look up the partition entry for a tensor path
    pub fn get(&self, path: &TensorPath) -> Option<&TensorSpec> {
        self.specs.get(path)
    }

    /// Verify that another plan describes the same parameter structure:
    /// identical tensor path sets and unsharded shapes. Used to check a
    /// caller-supplied config against the one embedded in a manifest.
    pub fn ensure_matches(&self, other: &PartitionPlan) -> crate::Result<()> {
        for spec in self.iter() {
            match other.get(&spec.path) {
                None => {
                    return Err(crate::MeshCkptError::ArchitectureMismatch {
                        path: spec.path.as_str().to_string(),
                        detail: "tensor missing from checkpoint architecture".to_string(),
                    })
                }
                Some(found) if found.shape != spec.shape => {
                    return Err(crate::MeshCkptError::ArchitectureMismatch {
                        path: spec.path.as_str().to_string(),
                        detail: format!(
                            "expected shape {:?}, checkpoint has {:?}",
                            spec.shape, found.shape
                        ),
                    })
                }
                Some(_) => {}
            }
        }
        for spec in other.iter() {
            if self.get(&spec.path).is_none() {
                return Err(crate::MeshCkptError::ArchitectureMismatch {
                    path: spec.path.as_str().to_string(),
                    detail: "unexpected tensor in checkpoint architecture".to_string(),
                });
            }
        }
        Ok(())
    }

    /// Check that `shard_count` yields uniform shards for every split
    /// tensor. Head-split tensors additionally require whole heads per
    /// shard, so the count must divide `n_heads` (not just `d_model`).
    /// Performs no I/O; callers invoke this before opening any file.
    pub fn validate_shard_count(&self, shard_count: usize) -> crate::Result<()> {
        if shard_count == 0 {
            return Err(crate::MeshCkptError::ConfigError(
                "shard count must be at least 1".to_string(),
            ));
        }
        if self.n_heads % shard_count != 0 {
            return Err(crate::MeshCkptError::ConfigError(format!(
                "{} heads cannot be divided across {} shards",
                self.n_heads, shard_count
            )));
        }
        if self.padded_vocab % shard_count != 0 {
            return Err(crate::MeshCkptError::ConfigError(format!(
                "padded vocabulary of {} rows not divisible by {} shards \
                 (adjust n_vocab_padding)",
                self.padded_vocab, shard_count
            )));
        }
        for spec in self.iter() {
            spec.shard_shape(shard_count)?;
        }
        Ok(())
    }

    /// Metadata-only view of all shards at a given count: slice shapes and
    /// dtypes per tensor, with no tensor bytes behind them.
    pub fn shard_layouts(&self, shard_count: usize) -> crate::Result<Vec<ShardLayout>> {
        self.validate_shard_count(shard_count)?;
        let mut layouts = Vec::with_capacity(shard_count);
        for index in 0..shard_count {
            let mut tensors = BTreeMap::new();
            for spec in self.iter() {
                tensors.insert(
                    spec.path.clone(),
                    TensorInfo {
                        shape: spec.shard_shape(shard_count)?,
                        dtype: spec.dtype,
                    },
                );
            }
            layouts.push(ShardLayout { index, tensors });
        }
        Ok(layouts)
    }

    /// Total parameter count implied by the plan
    pub fn total_parameters(&self) -> usize {
        self.iter().map(|s| s.num_elements()).sum()
    }

    /// Expected dtype for every tensor in the plan
    pub fn dtype(&self) -> DType {
        self.iter()
            .next()
            .map(|s| s.dtype)
            .unwrap_or(DType::F32)
    }
}
