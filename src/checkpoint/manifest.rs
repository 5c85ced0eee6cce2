//! The checkpoint manifest: single source of truth for "what checkpoint is
//! this".
//!
//! A manifest records format version, shard count, shard archive names, and
//! (for current-format checkpoints) the architecture config the shards were
//! written under. Saving the manifest is always the final step of a write
//! sequence: a location without a manifest is by definition not a valid
//! checkpoint, which is what makes interrupted writes safely ignorable.
//!
//! Pre-manifest checkpoints (flat `shard_{i}.safetensors` files) are
//! auto-detected and loaded as format version 1 with no embedded config;
//! the caller must supply one.

use serde::{Deserialize, Serialize};

use crate::config::ArchConfig;
use crate::store::ShardStore;
use crate::MeshCkptError;

/// Current manifest format version
pub const FORMAT_VERSION: u32 = 2;

/// Version assigned to auto-detected legacy checkpoints
pub const LEGACY_VERSION: u32 = 1;

/// Versioned description of a sharded checkpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Manifest {
    /// Format version of the layout this manifest describes
    pub format_version: u32,

    /// Number of shards the checkpoint was written with
    pub shard_count: usize,

    /// Architecture the shards were partitioned under; absent for legacy
    /// checkpoints, where the caller supplies it
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arch: Option<ArchConfig>,

    /// Archive name per shard index
    pub shard_files: Vec<String>,
}

impl Manifest {
    /// Manifest for a fresh checkpoint written at the current version
    pub fn new(shard_count: usize, arch: ArchConfig) -> Self {
        Manifest {
            format_version: FORMAT_VERSION,
            shard_count,
            arch: Some(arch),
            shard_files: (0..shard_count)
                .map(|i| Self::shard_file_name(i, shard_count))
                .collect(),
        }
    }

    /// Archive name for a shard written at the current version. The count
    /// is part of the name so that orphans from an interrupted write are
    /// never mistaken for a legacy flat-file checkpoint.
    pub fn shard_file_name(index: usize, shard_count: usize) -> String {
        format!("shard_{}_of_{}.safetensors", index, shard_count)
    }

    /// Archive name in the pre-manifest flat layout
    pub fn legacy_shard_file_name(index: usize) -> String {
        format!("shard_{}.safetensors", index)
    }

    pub fn is_legacy(&self) -> bool {
        self.format_version < FORMAT_VERSION
    }

    /// Load the manifest from a store, falling back to legacy detection
    /// when no manifest document exists.
    pub fn load(store: &dyn ShardStore) -> crate::Result<Self> {
        match store.read_manifest_text()? {
            Some(text) => Self::parse(&text),
            None => Self::detect_legacy(store),
        }
    }

    fn parse(text: &str) -> crate::Result<Self> {
        let manifest: Manifest = serde_json::from_str(text)
            .map_err(|e| MeshCkptError::ManifestError(format!("corrupt manifest: {}", e)))?;

        if manifest.format_version > FORMAT_VERSION {
            return Err(MeshCkptError::ManifestError(format!(
                "manifest format version {} is newer than supported version {}",
                manifest.format_version, FORMAT_VERSION
            )));
        }
        if manifest.shard_count == 0 {
            return Err(MeshCkptError::ManifestError(
                "manifest declares zero shards".to_string(),
            ));
        }
        if manifest.shard_files.len() != manifest.shard_count {
            return Err(MeshCkptError::ManifestError(format!(
                "manifest declares {} shards but lists {} files",
                manifest.shard_count,
                manifest.shard_files.len()
            )));
        }
        Ok(manifest)
    }

    /// Treat a directory of flat `shard_{i}.safetensors` files as a
    /// checkpoint. Shard count is inferred from the file census; indices
    /// must be contiguous from zero.
    fn detect_legacy(store: &dyn ShardStore) -> crate::Result<Self> {
        let archives = store.list_archives()?;
        if archives.is_empty() {
            return Err(MeshCkptError::ManifestError(format!(
                "no manifest and no shard files at {}",
                store.location()
            )));
        }

        let mut shard_files: Vec<String> = Vec::new();
        loop {
            let name = Self::legacy_shard_file_name(shard_files.len());
            if archives.contains(&name) {
                shard_files.push(name);
            } else {
                break;
            }
        }

        if shard_files.len() != archives.len() {
            // Either a gap in a legacy checkpoint or orphaned archives from
            // an interrupted manifest-format write; neither is loadable.
            return Err(MeshCkptError::ManifestError(format!(
                "no manifest at {} and the {} archives present are not a \
                 contiguous legacy shard set ({} matched)",
                store.location(),
                archives.len(),
                shard_files.len()
            )));
        }

        tracing::info!(
            "Detected legacy checkpoint with {} shards at {}",
            shard_files.len(),
            store.location()
        );

        Ok(Manifest {
            format_version: LEGACY_VERSION,
            shard_count: shard_files.len(),
            arch: None,
            shard_files,
        })
    }

    /// Persist the manifest. Must only be called after every shard archive
    /// it references has been durably written; this ordering is the crash
    /// safety barrier for the whole write path.
    pub fn save(&self, store: &dyn ShardStore) -> crate::Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        store.write_manifest_text(&json)?;
        tracing::info!(
            "Wrote manifest for {} shards at {}",
            self.shard_count,
            store.location()
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::LocalDirStore;
    use candle_core::{DType, Device, Tensor};
    use std::collections::HashMap;
    use tempfile::TempDir;

    fn arch() -> ArchConfig {
        ArchConfig::from_json(
            r#"{
                "compat": "j",
                "n_layers": 2,
                "d_model": 16,
                "n_heads": 4,
                "d_head": 4,
                "n_vocab": 30,
                "n_vocab_padding": 2,
                "pe": "rotary"
            }"#,
        )
        .unwrap()
    }

    fn dummy_archive() -> HashMap<String, Tensor> {
        let mut tensors = HashMap::new();
        tensors.insert(
            "embed.weight".to_string(),
            Tensor::zeros((4, 4), DType::F32, &Device::Cpu).unwrap(),
        );
        tensors
    }

    #[test]
    fn test_save_load_roundtrip() {
        let dir = TempDir::new().unwrap();
        let store = LocalDirStore::create(dir.path()).unwrap();

        let manifest = Manifest::new(4, arch());
        manifest.save(&store).unwrap();

        let loaded = Manifest::load(&store).unwrap();
        assert_eq!(loaded.format_version, FORMAT_VERSION);
        assert_eq!(loaded.shard_count, 4);
        assert_eq!(loaded.shard_files.len(), 4);
        assert_eq!(loaded.shard_files[2], "shard_2_of_4.safetensors");
        assert!(loaded.arch.is_some());
        assert!(!loaded.is_legacy());
    }

    #[test]
    fn test_missing_manifest_no_files_fails() {
        let dir = TempDir::new().unwrap();
        let store = LocalDirStore::create(dir.path()).unwrap();
        assert!(matches!(
            Manifest::load(&store),
            Err(MeshCkptError::ManifestError(_))
        ));
    }

    #[test]
    fn test_legacy_detection() {
        let dir = TempDir::new().unwrap();
        let store = LocalDirStore::create(dir.path()).unwrap();
        for i in 0..3 {
            store
                .write_archive(&Manifest::legacy_shard_file_name(i), &dummy_archive())
                .unwrap();
        }

        let manifest = Manifest::load(&store).unwrap();
        assert!(manifest.is_legacy());
        assert_eq!(manifest.format_version, LEGACY_VERSION);
        assert_eq!(manifest.shard_count, 3);
        assert!(manifest.arch.is_none());
    }

    #[test]
    fn test_legacy_gap_rejected() {
        let dir = TempDir::new().unwrap();
        let store = LocalDirStore::create(dir.path()).unwrap();
        store
            .write_archive(&Manifest::legacy_shard_file_name(0), &dummy_archive())
            .unwrap();
        store
            .write_archive(&Manifest::legacy_shard_file_name(2), &dummy_archive())
            .unwrap();

        assert!(matches!(
            Manifest::load(&store),
            Err(MeshCkptError::ManifestError(_))
        ));
    }

    #[test]
    fn test_corrupt_manifest_rejected() {
        let dir = TempDir::new().unwrap();
        let store = LocalDirStore::create(dir.path()).unwrap();
        store.write_manifest_text("{ not json").unwrap();
        assert!(matches!(
            Manifest::load(&store),
            Err(MeshCkptError::ManifestError(_))
        ));
    }

    #[test]
    fn test_newer_version_rejected() {
        let dir = TempDir::new().unwrap();
        let store = LocalDirStore::create(dir.path()).unwrap();
        let mut manifest = Manifest::new(1, arch());
        manifest.format_version = FORMAT_VERSION + 1;
        let json = serde_json::to_string(&manifest).unwrap();
        store.write_manifest_text(&json).unwrap();

        let err = Manifest::load(&store).unwrap_err();
        assert!(matches!(err, MeshCkptError::ManifestError(_)));
        assert!(err.to_string().contains("newer"));
    }

    #[test]
    fn test_count_file_mismatch_rejected() {
        let dir = TempDir::new().unwrap();
        let store = LocalDirStore::create(dir.path()).unwrap();
        let mut manifest = Manifest::new(3, arch());
        manifest.shard_files.pop();
        let json = serde_json::to_string(&manifest).unwrap();
        store.write_manifest_text(&json).unwrap();

        assert!(matches!(
            Manifest::load(&store),
            Err(MeshCkptError::ManifestError(_))
        ));
    }
}
