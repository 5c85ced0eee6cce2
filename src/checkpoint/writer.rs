//! Checkpoint writing: M in-memory shards out to storage, manifest last.
//!
//! Every shard archive is written before the manifest. A crash at any
//! earlier point leaves orphaned shard files that no manifest references,
//! so no reader can ever observe a partially written checkpoint; a retry
//! at the same location simply overwrites the stale files. This makes the
//! writer idempotent under retry without any distributed locking.

use std::sync::Arc;

use crate::config::ArchConfig;
use crate::store::ShardStore;
use crate::PartitionPlan;

use super::{validate_shard_tensors, Manifest, ParamShard};

/// Persists in-memory shards as a sharded checkpoint
pub struct CheckpointWriter {
    store: Arc<dyn ShardStore>,
    config: ArchConfig,
}

impl CheckpointWriter {
    pub fn new(store: Arc<dyn ShardStore>, config: &ArchConfig) -> Self {
        CheckpointWriter {
            store,
            config: config.clone(),
        }
    }

    /// Write all shards and then the manifest. The shards must be supplied
    /// in index order and agree with the partition plan's predicted slice
    /// shapes.
    pub fn save(&self, shards: &[ParamShard]) -> crate::Result<Manifest> {
        let plan = PartitionPlan::for_config(&self.config)?;
        plan.validate_shard_count(shards.len())?;

        for (position, shard) in shards.iter().enumerate() {
            if shard.index != position {
                return Err(crate::MeshCkptError::ConfigError(format!(
                    "shard at position {} has index {}; shards must be in index order",
                    position, shard.index
                )));
            }
            validate_shard_tensors(&plan, shard.index, shards.len(), &shard.tensors)?;
        }

        for shard in shards {
            self.store
                .write_archive(
                    &Manifest::shard_file_name(shard.index, shards.len()),
                    &shard.tensors,
                )?;
            tracing::debug!(
                "wrote shard {} of {} ({} tensors)",
                shard.index + 1,
                shards.len(),
                shard.tensors.len()
            );
        }

        // The barrier: only now does the checkpoint become visible.
        let manifest = Manifest::new(shards.len(), self.config.clone());
        manifest.save(self.store.as_ref())?;

        tracing::info!(
            "Saved checkpoint with {} shards at {}",
            shards.len(),
            self.store.location()
        );
        Ok(manifest)
    }
}
