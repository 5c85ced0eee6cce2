//! Offline resharding: rewrite a checkpoint from N shards to M shards.
//!
//! The resharder never materializes more than one destination shard plus
//! one full tensor at a time. Source archives are memory-mapped, so the
//! per-tensor merge reads only the bytes of the tensor being reassembled.
//! Destination archives are written first and the manifest last, the same
//! crash barrier the writer uses, so an interrupted reshard leaves no
//! loadable checkpoint behind and a retry simply overwrites.

use std::collections::HashMap;
use std::sync::Arc;

use candle_core::Tensor;
use indicatif::{ProgressBar, ProgressStyle};

use crate::config::ArchConfig;
use crate::store::{ShardArchive, ShardStore};
use crate::{codec, MeshCkptError, PartitionPlan};

use super::reader::open_all;
use super::Manifest;

/// Rewrites a stored checkpoint to a different shard count
pub struct Resharder {
    source: Arc<dyn ShardStore>,
    dest: Arc<dyn ShardStore>,
}

impl Resharder {
    pub fn new(source: Arc<dyn ShardStore>, dest: Arc<dyn ShardStore>) -> Self {
        Resharder { source, dest }
    }

    /// Reshard the source checkpoint to `dest_shard_count` shards.
    ///
    /// The architecture comes from the source manifest when present; for
    /// legacy checkpoints the caller must supply one. When both exist the
    /// caller's config must describe the same partition table as the
    /// embedded one.
    pub fn reshard(
        &self,
        config: Option<&ArchConfig>,
        dest_shard_count: usize,
    ) -> crate::Result<Manifest> {
        let manifest = Manifest::load(self.source.as_ref())?;

        let arch = match (&manifest.arch, config) {
            (Some(embedded), Some(caller)) => {
                let embedded_plan = PartitionPlan::for_config(embedded)?;
                let caller_plan = PartitionPlan::for_config(caller)?;
                caller_plan.ensure_matches(&embedded_plan)?;
                embedded.clone()
            }
            (Some(embedded), None) => embedded.clone(),
            (None, Some(caller)) => caller.clone(),
            (None, None) => {
                return Err(MeshCkptError::ConfigError(format!(
                    "legacy checkpoint at {} has no embedded architecture; \
                     a config is required",
                    self.source.location()
                )))
            }
        };

        let plan = PartitionPlan::for_config(&arch)?;
        // Both counts must divide the plan before any tensor bytes move.
        plan.validate_shard_count(manifest.shard_count)?;
        plan.validate_shard_count(dest_shard_count)?;

        tracing::info!(
            "Resharding {} ({} shards) to {} ({} shards)",
            self.source.location(),
            manifest.shard_count,
            self.dest.location(),
            dest_shard_count
        );

        let archives = open_all(self.source.as_ref(), &plan, &manifest)?;

        let pb = ProgressBar::new(dest_shard_count as u64);
        pb.set_style(
            ProgressStyle::default_bar()
                .template("{spinner:.green} [{bar:40.cyan/blue}] {pos}/{len} {msg}")
                .unwrap()
                .progress_chars("=>-"),
        );

        for dest_index in 0..dest_shard_count {
            let name = Manifest::shard_file_name(dest_index, dest_shard_count);
            pb.set_message(name.clone());
            let tensors =
                build_dest_shard(&plan, &archives, dest_index, dest_shard_count)?;
            self.dest.write_archive(&name, &tensors)?;
            tracing::debug!(
                "wrote shard {} of {} ({} tensors)",
                dest_index + 1,
                dest_shard_count,
                tensors.len()
            );
            pb.inc(1);
        }
        pb.finish_with_message("resharded");

        // The barrier: only now does the destination become a checkpoint.
        let dest_manifest = Manifest::new(dest_shard_count, arch);
        dest_manifest.save(self.dest.as_ref())?;
        Ok(dest_manifest)
    }
}

/// Assemble one destination shard's tensors, merging each tensor from all
/// source slices and keeping only the destination slice.
fn build_dest_shard(
    plan: &PartitionPlan,
    archives: &[Box<dyn ShardArchive>],
    dest_index: usize,
    dest_shard_count: usize,
) -> crate::Result<HashMap<String, Tensor>> {
    let mut tensors = HashMap::with_capacity(plan.len());
    for spec in plan.iter() {
        let slices = archives
            .iter()
            .map(|archive| archive.load_tensor(spec.path.as_str()))
            .collect::<crate::Result<Vec<_>>>()?;
        let full = codec::merge(spec, &slices)?;
        let slice = codec::split(spec, &full, dest_index, dest_shard_count)?;
        tensors.insert(spec.path.as_str().to_string(), slice);
    }
    Ok(tensors)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::{CheckpointReader, CheckpointWriter, ParamShard};
    use crate::store::LocalDirStore;
    use crate::TensorPath;
    use candle_core::Device;
    use tempfile::TempDir;

    fn arch(compat: &str) -> ArchConfig {
        ArchConfig::from_json(&format!(
            r#"{{
                "compat": "{compat}",
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
                let slice = codec::split(spec, &full, i, count).unwrap();
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
    fn test_reshard_4_to_2_matches_direct_split() {
        let src_dir = TempDir::new().unwrap();
        let dst_dir = TempDir::new().unwrap();
        let config = arch("j");
        let source = write_checkpoint(&src_dir, &config, 4);
        let dest: Arc<dyn ShardStore> =
            Arc::new(LocalDirStore::create(dst_dir.path()).unwrap());

        let manifest = Resharder::new(source, dest.clone())
            .reshard(None, 2)
            .unwrap();
        assert_eq!(manifest.shard_count, 2);
        assert!(manifest.arch.is_some());

        let reader = CheckpointReader::new(dest, &config);
        let loaded = reader.load(2).unwrap();
        let expected = build_shards(&config, 2);
        for (got, want) in loaded.iter().zip(expected.iter()) {
            for (name, tensor) in &want.tensors {
                assert_eq!(flat(&got.tensors[name]), flat(tensor), "tensor {}", name);
            }
        }
    }

    #[test]
    fn test_reshard_roundtrip_restores_original_slices() {
        let dirs: Vec<TempDir> = (0..3).map(|_| TempDir::new().unwrap()).collect();
        let config = arch("neox");
        let source = write_checkpoint(&dirs[0], &config, 4);
        let mid: Arc<dyn ShardStore> =
            Arc::new(LocalDirStore::create(dirs[1].path()).unwrap());
        let back: Arc<dyn ShardStore> =
            Arc::new(LocalDirStore::create(dirs[2].path()).unwrap());

        Resharder::new(source, mid.clone()).reshard(None, 2).unwrap();
        Resharder::new(mid, back.clone()).reshard(None, 4).unwrap();

        let loaded = CheckpointReader::new(back, &config).load(4).unwrap();
        let expected = build_shards(&config, 4);
        for (got, want) in loaded.iter().zip(expected.iter()) {
            for (name, tensor) in &want.tensors {
                assert_eq!(flat(&got.tensors[name]), flat(tensor), "tensor {}", name);
            }
        }
    }

    #[test]
    fn test_embedding_rows_partition_padded_vocab() {
        let src_dir = TempDir::new().unwrap();
        let dst_dir = TempDir::new().unwrap();
        let config = arch("neox");
        let source = write_checkpoint(&src_dir, &config, 4);
        let dest: Arc<dyn ShardStore> =
            Arc::new(LocalDirStore::create(dst_dir.path()).unwrap());

        Resharder::new(source, dest.clone()).reshard(None, 2).unwrap();

        // Padded vocab is 32 rows; each of the two shards holds 16, and
        // concatenating them restores the full embedding in row order.
        let loaded = CheckpointReader::new(dest, &config).load(2).unwrap();
        let path = TensorPath::global("embed", "weight");
        let a = loaded[0].get(&path).unwrap();
        let b = loaded[1].get(&path).unwrap();
        assert_eq!(a.dims(), &[16, 16]);
        assert_eq!(b.dims(), &[16, 16]);
        let joined = Tensor::cat(&[a, b], 0).unwrap();
        let full: Vec<f32> = (0..32 * 16).map(|v| v as f32).collect();
        assert_eq!(flat(&joined), full);
    }

    #[test]
    fn test_legacy_source_requires_config() {
        let src_dir = TempDir::new().unwrap();
        let dst_dir = TempDir::new().unwrap();
        let config = arch("j");
        let source: Arc<dyn ShardStore> =
            Arc::new(LocalDirStore::create(src_dir.path()).unwrap());
        for shard in build_shards(&config, 2) {
            source
                .write_archive(
                    &Manifest::legacy_shard_file_name(shard.index),
                    &shard.tensors,
                )
                .unwrap();
        }
        let dest: Arc<dyn ShardStore> =
            Arc::new(LocalDirStore::create(dst_dir.path()).unwrap());

        let resharder = Resharder::new(source, dest.clone());
        assert!(matches!(
            resharder.reshard(None, 1).unwrap_err(),
            MeshCkptError::ConfigError(_)
        ));

        // With the caller's config the legacy source reshards, and the
        // destination is written at the current format with it embedded.
        let manifest = resharder.reshard(Some(&config), 1).unwrap();
        assert!(!manifest.is_legacy());
        assert!(manifest.arch.is_some());
        let loaded = CheckpointReader::new(dest, &config).load(1).unwrap();
        assert_eq!(loaded.len(), 1);
    }

    #[test]
    fn test_invalid_dest_count_rejected_before_io() {
        let src_dir = TempDir::new().unwrap();
        let dst_dir = TempDir::new().unwrap();
        let config = arch("j");
        let source = write_checkpoint(&src_dir, &config, 2);
        let dest: Arc<dyn ShardStore> =
            Arc::new(LocalDirStore::create(dst_dir.path()).unwrap());

        // 3 does not divide n_heads=4.
        let err = Resharder::new(source, dest.clone())
            .reshard(None, 3)
            .unwrap_err();
        assert!(matches!(err, MeshCkptError::ConfigError(_)));
        assert!(dest.list_archives().unwrap().is_empty());
    }

    #[test]
    fn test_conflicting_caller_config_rejected() {
        let src_dir = TempDir::new().unwrap();
        let dst_dir = TempDir::new().unwrap();
        let config = arch("j");
        let source = write_checkpoint(&src_dir, &config, 2);
        let dest: Arc<dyn ShardStore> =
            Arc::new(LocalDirStore::create(dst_dir.path()).unwrap());

        let mut other = arch("j");
        other.n_layers = 1;
        let err = Resharder::new(source, dest)
            .reshard(Some(&other), 2)
            .unwrap_err();
        assert!(matches!(err, MeshCkptError::ArchitectureMismatch { .. }));
    }

    #[test]
    fn test_same_count_reshard_copies_checkpoint() {
        let src_dir = TempDir::new().unwrap();
        let dst_dir = TempDir::new().unwrap();
        let config = arch("j");
        let source = write_checkpoint(&src_dir, &config, 2);
        let dest: Arc<dyn ShardStore> =
            Arc::new(LocalDirStore::create(dst_dir.path()).unwrap());

        Resharder::new(source.clone(), dest.clone())
            .reshard(None, 2)
            .unwrap();

        let from_src = CheckpointReader::new(source, &config).load(2).unwrap();
        let from_dst = CheckpointReader::new(dest, &config).load(2).unwrap();
        for (got, want) in from_dst.iter().zip(from_src.iter()) {
            for (name, tensor) in &want.tensors {
                assert_eq!(flat(&got.tensors[name]), flat(tensor), "tensor {}", name);
            }
        }
    }
}
