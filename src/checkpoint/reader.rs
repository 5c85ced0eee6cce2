//! Checkpoint reading: N stored shards in, M in-memory shards out.
//!
//! When the target shard count equals the stored count every archive is
//! read directly (fast path, no codec involvement). Otherwise each tensor
//! is merged from all source slices and re-split to the target count (slow
//! path); this is what lets an 8-way training checkpoint land on a 2-way
//! inference mesh.

use std::sync::Arc;

use crate::config::ArchConfig;
use crate::partition::ShardLayout;
use crate::store::{ShardArchive, ShardStore};
use crate::{codec, PartitionPlan};

use super::{validate_shard_tensors, ArchivePrefetcher, Manifest, ParamShard};

/// Loads and reassembles sharded checkpoints
pub struct CheckpointReader {
    store: Arc<dyn ShardStore>,
    config: ArchConfig,
}

impl CheckpointReader {
    pub fn new(store: Arc<dyn ShardStore>, config: &ArchConfig) -> Self {
        CheckpointReader {
            store,
            config: config.clone(),
        }
    }

    /// Load the manifest, validating any embedded architecture against the
    /// caller's config. Legacy checkpoints have no embedded config and the
    /// caller's is taken as authoritative.
    pub fn manifest(&self) -> crate::Result<Manifest> {
        let plan = PartitionPlan::for_config(&self.config)?;
        self.validated_manifest(&plan)
    }

    fn validated_manifest(&self, plan: &PartitionPlan) -> crate::Result<Manifest> {
        let manifest = Manifest::load(self.store.as_ref())?;
        if let Some(arch) = &manifest.arch {
            let checkpoint_plan = PartitionPlan::for_config(arch)?;
            plan.ensure_matches(&checkpoint_plan)?;
        }
        plan.validate_shard_count(manifest.shard_count)?;
        Ok(manifest)
    }

    /// Load the checkpoint as exactly `target_shard_count` in-memory shards.
    pub fn load(&self, target_shard_count: usize) -> crate::Result<Vec<ParamShard>> {
        let plan = PartitionPlan::for_config(&self.config)?;
        // Reject impossible targets before touching storage.
        plan.validate_shard_count(target_shard_count)?;
        let manifest = self.validated_manifest(&plan)?;

        tracing::info!(
            "Loading checkpoint at {} ({} shards on disk, {} requested)",
            self.store.location(),
            manifest.shard_count,
            target_shard_count
        );

        if manifest.shard_count == target_shard_count {
            self.load_direct(&plan, &manifest)
        } else {
            self.load_resplit(&plan, &manifest, target_shard_count)
        }
    }

    /// Predict the per-shard tensor structure (shapes and dtypes) without
    /// reading any tensor bytes. Only the manifest document is touched.
    pub fn load_metadata(&self, target_shard_count: usize) -> crate::Result<Vec<ShardLayout>> {
        let plan = PartitionPlan::for_config(&self.config)?;
        plan.validate_shard_count(target_shard_count)?;
        self.validated_manifest(&plan)?;
        plan.shard_layouts(target_shard_count)
    }

    /// Fast path: stored and requested shard counts agree, each archive
    /// maps 1:1 onto one in-memory shard. The next archive is opened in
    /// the background while the current one is validated.
    fn load_direct(
        &self,
        plan: &PartitionPlan,
        manifest: &Manifest,
    ) -> crate::Result<Vec<ParamShard>> {
        let mut prefetcher = ArchivePrefetcher::new(self.store.clone());
        let mut shards = Vec::with_capacity(manifest.shard_count);

        for (index, name) in manifest.shard_files.iter().enumerate() {
            let next = manifest.shard_files.get(index + 1).map(String::as_str);
            let archive = prefetcher.open_and_prefetch(name, next)?;
            let tensors = archive.load_all()?;
            validate_shard_tensors(plan, index, manifest.shard_count, &tensors)?;
            shards.push(ParamShard { index, tensors });
        }
        Ok(shards)
    }

    /// Slow path: merge every tensor from all source shards and re-split
    /// to the target count, one tensor at a time so the full model is
    /// never resident at once.
    fn load_resplit(
        &self,
        plan: &PartitionPlan,
        manifest: &Manifest,
        target_shard_count: usize,
    ) -> crate::Result<Vec<ParamShard>> {
        let archives = open_all(self.store.as_ref(), plan, manifest)?;

        let mut shards: Vec<ParamShard> =
            (0..target_shard_count).map(ParamShard::new).collect();

        for spec in plan.iter() {
            let slices = archives
                .iter()
                .map(|archive| archive.load_tensor(spec.path.as_str()))
                .collect::<crate::Result<Vec<_>>>()?;
            let resharded = codec::reshard(spec, &slices, target_shard_count)?;
            for (shard, slice) in shards.iter_mut().zip(resharded) {
                shard.tensors.insert(spec.path.as_str().to_string(), slice);
            }
        }
        Ok(shards)
    }
}

/// Open every source archive and check its tensor name set against the
/// plan before any tensor bytes are read.
pub(crate) fn open_all(
    store: &dyn ShardStore,
    plan: &PartitionPlan,
    manifest: &Manifest,
) -> crate::Result<Vec<Box<dyn ShardArchive>>> {
    let mut archives = Vec::with_capacity(manifest.shard_count);
    for (index, name) in manifest.shard_files.iter().enumerate() {
        let archive = store.open_archive(name)?;
        for spec in plan.iter() {
            if archive.tensor_info(spec.path.as_str()).is_err() {
                return Err(crate::MeshCkptError::ArchitectureMismatch {
                    path: spec.path.as_str().to_string(),
                    detail: format!("missing from shard {} ({})", index, name),
                });
            }
        }
        archives.push(archive);
    }
    Ok(archives)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::CheckpointWriter;
    use crate::store::LocalDirStore;
    use crate::{MeshCkptError, TensorPath};
    use candle_core::{Device, Tensor};
    use tempfile::TempDir;

    fn arch(json_compat: &str) -> ArchConfig {
        ArchConfig::from_json(&format!(
            r#"{{
                "compat": "{json_compat}",
                "n_layers": 2,
                "d_model": 16,
                "n_heads": 4,
                "d_head": 4,
                "n_vocab": 30,
                "n_vocab_padding": 2,
                "pe": "rotary"
            }}"#
        ))
        .unwrap()
    }

    /// Build full-model tensors with distinct values, split into `count`
    /// shards through the codec.
    fn build_shards(config: &ArchConfig, count: usize) -> Vec<ParamShard> {
        let plan = PartitionPlan::for_config(config).unwrap();
        let mut shards: Vec<ParamShard> = (0..count).map(ParamShard::new).collect();
        let mut offset = 0f32;
        for spec in plan.iter() {
            let n: usize = spec.shape.iter().product();
            let full = Tensor::arange(offset, offset + n as f32, &Device::Cpu)
                .unwrap()
                .reshape(spec.shape.as_slice())
                .unwrap();
            offset += n as f32;
            for (i, shard) in shards.iter_mut().enumerate() {
                let slice = crate::codec::split(spec, &full, i, count).unwrap();
                shard.tensors.insert(spec.path.as_str().to_string(), slice);
            }
        }
        shards
    }

    fn write_checkpoint(dir: &TempDir, config: &ArchConfig, count: usize) -> Arc<dyn ShardStore> {
        let store: Arc<dyn ShardStore> =
            Arc::new(LocalDirStore::create(dir.path()).unwrap());
        let writer = CheckpointWriter::new(store.clone(), config);
        writer.save(&build_shards(config, count)).unwrap();
        store
    }

    fn flat(t: &Tensor) -> Vec<f32> {
        t.flatten_all().unwrap().to_vec1().unwrap()
    }

    #[test]
    fn test_fast_path_roundtrip() {
        let dir = TempDir::new().unwrap();
        let config = arch("j");
        let store = write_checkpoint(&dir, &config, 4);

        let reader = CheckpointReader::new(store, &config);
        let loaded = reader.load(4).unwrap();
        assert_eq!(loaded.len(), 4);

        let expected = build_shards(&config, 4);
        for (got, want) in loaded.iter().zip(expected.iter()) {
            assert_eq!(got.tensors.len(), want.tensors.len());
            for (name, tensor) in &want.tensors {
                assert_eq!(flat(&got.tensors[name]), flat(tensor), "tensor {}", name);
            }
        }
    }

    #[test]
    fn test_resplit_4_to_2() {
        let dir = TempDir::new().unwrap();
        let config = arch("j");
        let store = write_checkpoint(&dir, &config, 4);

        let reader = CheckpointReader::new(store, &config);
        let loaded = reader.load(2).unwrap();
        assert_eq!(loaded.len(), 2);

        let expected = build_shards(&config, 2);
        for (got, want) in loaded.iter().zip(expected.iter()) {
            for (name, tensor) in &want.tensors {
                assert_eq!(flat(&got.tensors[name]), flat(tensor), "tensor {}", name);
            }
        }
    }

    #[test]
    fn test_resplit_to_single_shard_rebuilds_full_tensors() {
        let dir = TempDir::new().unwrap();
        let config = arch("neox");
        let store = write_checkpoint(&dir, &config, 2);

        let reader = CheckpointReader::new(store, &config);
        let loaded = reader.load(1).unwrap();
        assert_eq!(loaded.len(), 1);

        let embed = loaded[0].get(&TensorPath::global("embed", "weight")).unwrap();
        assert_eq!(embed.dims(), &[32, 16]);
        let qkv = loaded[0]
            .get(&TensorPath::layer(0, "attn.qkv_proj", "weight"))
            .unwrap();
        assert_eq!(qkv.dims(), &[16, 48]);
    }

    #[test]
    fn test_uneven_target_rejected_before_io() {
        let config = arch("j");
        // Store points at a directory that does not even exist; the count
        // check must fire first.
        let store: Arc<dyn ShardStore> =
            Arc::new(LocalDirStore::create(TempDir::new().unwrap().path()).unwrap());
        let reader = CheckpointReader::new(store, &config);
        let err = reader.load(3).unwrap_err();
        assert!(matches!(err, MeshCkptError::ConfigError(_)));
    }

    #[test]
    fn test_missing_manifest_is_manifest_error() {
        let dir = TempDir::new().unwrap();
        let config = arch("j");
        let store: Arc<dyn ShardStore> =
            Arc::new(LocalDirStore::create(dir.path()).unwrap());
        let reader = CheckpointReader::new(store, &config);
        assert!(matches!(
            reader.load(1).unwrap_err(),
            MeshCkptError::ManifestError(_)
        ));
    }

    #[test]
    fn test_architecture_mismatch_detected() {
        let dir = TempDir::new().unwrap();
        let written = arch("j");
        let store = write_checkpoint(&dir, &written, 2);

        let mut other = arch("j");
        other.n_layers = 1;
        let reader = CheckpointReader::new(store, &other);
        let err = reader.load(2).unwrap_err();
        assert!(matches!(err, MeshCkptError::ArchitectureMismatch { .. }));
    }

    #[test]
    fn test_legacy_checkpoint_loads_with_caller_config() {
        let dir = TempDir::new().unwrap();
        let config = arch("j");
        let store: Arc<dyn ShardStore> =
            Arc::new(LocalDirStore::create(dir.path()).unwrap());

        // Flat shard files, no manifest: the legacy layout.
        for shard in build_shards(&config, 2) {
            store
                .write_archive(
                    &Manifest::legacy_shard_file_name(shard.index),
                    &shard.tensors,
                )
                .unwrap();
        }

        let reader = CheckpointReader::new(store, &config);
        let same = reader.load(2).unwrap();
        assert_eq!(same.len(), 2);

        let merged = reader.load(1).unwrap();
        let embed = merged[0].get(&TensorPath::global("embed", "weight")).unwrap();
        assert_eq!(embed.dims(), &[32, 16]);
    }

    #[test]
    fn test_load_metadata_reads_no_tensor_bytes() {
        let dir = TempDir::new().unwrap();
        let config = arch("j");
        let store = write_checkpoint(&dir, &config, 4);

        let reader = CheckpointReader::new(store, &config);
        let layouts = reader.load_metadata(2).unwrap();
        assert_eq!(layouts.len(), 2);
        let embed = &layouts[0].tensors[&TensorPath::global("embed", "weight")];
        assert_eq!(embed.shape, vec![16, 16]);
        assert_eq!(embed.dtype, candle_core::DType::F32);
    }
}
