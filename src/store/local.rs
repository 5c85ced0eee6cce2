//! Local-filesystem shard store backed by safetensors archives.
//!
//! Reads are memory-mapped so that opening an archive and inspecting tensor
//! shapes touches only the header; tensor bytes are paged in on demand.
//! Writes go to a fresh temp file that is renamed into place, so a crashed
//! write never leaves a truncated archive under a live name.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use candle_core::{DType, Device, Tensor};
use memmap2::Mmap;
use safetensors::SafeTensors;

use crate::partition::TensorInfo;
use crate::MeshCkptError;

use super::{ShardArchive, ShardStore, MANIFEST_FILE};

/// Extension used for shard archives
pub const ARCHIVE_EXT: &str = "safetensors";

/// Shard store over one local directory
#[derive(Debug)]
pub struct LocalDirStore {
    root: PathBuf,
}

impl LocalDirStore {
    /// Open an existing checkpoint directory
    pub fn open(root: impl AsRef<Path>) -> crate::Result<Self> {
        let root = root.as_ref().to_path_buf();
        if !root.is_dir() {
            return Err(MeshCkptError::StorageError(format!(
                "checkpoint directory not found: {}",
                root.display()
            )));
        }
        Ok(LocalDirStore { root })
    }

    /// Open a directory for writing, creating it if absent
    pub fn create(root: impl AsRef<Path>) -> crate::Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root)?;
        Ok(LocalDirStore { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn archive_path(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }
}

impl ShardStore for LocalDirStore {
    fn open_archive(&self, name: &str) -> crate::Result<Box<dyn ShardArchive>> {
        let path = self.archive_path(name);
        if !path.is_file() {
            return Err(MeshCkptError::StorageError(format!(
                "shard archive not found: {}",
                path.display()
            )));
        }
        let file = fs::File::open(&path)?;
        let mmap = unsafe { Mmap::map(&file)? };
        let archive = LocalArchive { path, mmap };
        // Fail on a corrupt header at open time, not mid-load.
        archive.parsed()?;
        Ok(Box::new(archive))
    }

    fn write_archive(&self, name: &str, tensors: &HashMap<String, Tensor>) -> crate::Result<()> {
        let final_path = self.archive_path(name);
        // Fresh temp name per attempt; renaming over a stale file from a
        // crashed earlier attempt is fine since no manifest references it.
        let tmp_path = self.archive_path(&format!(".{}.tmp-{}", name, std::process::id()));

        candle_core::safetensors::save(tensors, &tmp_path)?;
        fs::rename(&tmp_path, &final_path)?;

        tracing::debug!(
            "wrote shard archive {} ({} tensors)",
            final_path.display(),
            tensors.len()
        );
        Ok(())
    }

    fn read_manifest_text(&self) -> crate::Result<Option<String>> {
        let path = self.root.join(MANIFEST_FILE);
        if !path.is_file() {
            return Ok(None);
        }
        Ok(Some(fs::read_to_string(&path)?))
    }

    fn write_manifest_text(&self, json: &str) -> crate::Result<()> {
        let final_path = self.root.join(MANIFEST_FILE);
        let tmp_path = self.root.join(format!(".manifest.tmp-{}", std::process::id()));
        fs::write(&tmp_path, json)?;
        fs::rename(&tmp_path, &final_path)?;
        Ok(())
    }

    fn list_archives(&self) -> crate::Result<Vec<String>> {
        let mut names = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            let path = entry.path();
            let is_archive = path
                .extension()
                .map_or(false, |ext| ext == ARCHIVE_EXT);
            if is_archive {
                if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
                    // Skip in-flight temp files
                    if !name.starts_with('.') {
                        names.push(name.to_string());
                    }
                }
            }
        }
        names.sort();
        Ok(names)
    }

    fn location(&self) -> String {
        self.root.display().to_string()
    }
}

/// Memory-mapped safetensors archive. Header parsing is repeated per call
/// (it is cheap); tensor bytes are paged in only when loaded.
struct LocalArchive {
    path: PathBuf,
    mmap: Mmap,
}

impl LocalArchive {
    fn parsed(&self) -> crate::Result<SafeTensors<'_>> {
        SafeTensors::deserialize(&self.mmap).map_err(|e| {
            MeshCkptError::StorageError(format!(
                "corrupt shard archive {}: {}",
                self.path.display(),
                e
            ))
        })
    }

    fn view(&self, parsed: &SafeTensors<'_>, name: &str) -> crate::Result<TensorInfo> {
        let view = parsed.tensor(name).map_err(|_| {
            MeshCkptError::StorageError(format!(
                "tensor {} not found in {}",
                name,
                self.path.display()
            ))
        })?;
        Ok(TensorInfo {
            shape: view.shape().to_vec(),
            dtype: convert_dtype(view.dtype(), name)?,
        })
    }
}

impl ShardArchive for LocalArchive {
    fn tensor_names(&self) -> Vec<String> {
        match self.parsed() {
            Ok(parsed) => parsed.names().into_iter().map(String::from).collect(),
            Err(_) => Vec::new(),
        }
    }

    fn tensor_info(&self, name: &str) -> crate::Result<TensorInfo> {
        let parsed = self.parsed()?;
        self.view(&parsed, name)
    }

    fn load_tensor(&self, name: &str) -> crate::Result<Tensor> {
        let parsed = self.parsed()?;
        let view = parsed.tensor(name).map_err(|_| {
            MeshCkptError::StorageError(format!(
                "tensor {} not found in {}",
                name,
                self.path.display()
            ))
        })?;
        let dtype = convert_dtype(view.dtype(), name)?;
        let tensor = Tensor::from_raw_buffer(view.data(), dtype, view.shape(), &Device::Cpu)?;
        Ok(tensor)
    }

    fn load_all(&self) -> crate::Result<HashMap<String, Tensor>> {
        let mut out = HashMap::new();
        for name in self.tensor_names() {
            let tensor = self.load_tensor(&name)?;
            out.insert(name, tensor);
        }
        Ok(out)
    }
}

fn convert_dtype(dtype: safetensors::Dtype, name: &str) -> crate::Result<DType> {
    match dtype {
        safetensors::Dtype::U8 => Ok(DType::U8),
        safetensors::Dtype::U32 => Ok(DType::U32),
        safetensors::Dtype::I64 => Ok(DType::I64),
        safetensors::Dtype::F16 => Ok(DType::F16),
        safetensors::Dtype::BF16 => Ok(DType::BF16),
        safetensors::Dtype::F32 => Ok(DType::F32),
        safetensors::Dtype::F64 => Ok(DType::F64),
        other => Err(MeshCkptError::StorageError(format!(
            "tensor {} has unsupported dtype {:?}",
            name, other
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn sample_tensors() -> HashMap<String, Tensor> {
        let mut tensors = HashMap::new();
        tensors.insert(
            "embed.weight".to_string(),
            Tensor::arange(0f32, 12.0, &Device::Cpu)
                .unwrap()
                .reshape(&[4, 3])
                .unwrap(),
        );
        tensors.insert(
            "final_norm.scale".to_string(),
            Tensor::ones(3, DType::F32, &Device::Cpu).unwrap(),
        );
        tensors
    }

    #[test]
    fn test_write_then_read_archive() {
        let dir = TempDir::new().unwrap();
        let store = LocalDirStore::create(dir.path()).unwrap();
        store
            .write_archive("shard_0.safetensors", &sample_tensors())
            .unwrap();

        let archive = store.open_archive("shard_0.safetensors").unwrap();
        let mut names = archive.tensor_names();
        names.sort();
        assert_eq!(names, vec!["embed.weight", "final_norm.scale"]);

        let embed = archive.load_tensor("embed.weight").unwrap();
        assert_eq!(embed.dims(), &[4, 3]);
        let vals: Vec<f32> = embed.flatten_all().unwrap().to_vec1().unwrap();
        assert_eq!(vals[5], 5.0);
    }

    #[test]
    fn test_tensor_info_without_load() {
        let dir = TempDir::new().unwrap();
        let store = LocalDirStore::create(dir.path()).unwrap();
        store
            .write_archive("shard_0.safetensors", &sample_tensors())
            .unwrap();

        let archive = store.open_archive("shard_0.safetensors").unwrap();
        let info = archive.tensor_info("embed.weight").unwrap();
        assert_eq!(info.shape, vec![4, 3]);
        assert_eq!(info.dtype, DType::F32);
        assert!(archive.tensor_info("missing.weight").is_err());
    }

    #[test]
    fn test_list_archives_skips_temp_and_manifest() {
        let dir = TempDir::new().unwrap();
        let store = LocalDirStore::create(dir.path()).unwrap();
        store
            .write_archive("shard_1.safetensors", &sample_tensors())
            .unwrap();
        store
            .write_archive("shard_0.safetensors", &sample_tensors())
            .unwrap();
        store.write_manifest_text("{}").unwrap();
        std::fs::write(dir.path().join(".shard_9.safetensors.tmp-1"), b"junk").unwrap();

        assert_eq!(
            store.list_archives().unwrap(),
            vec!["shard_0.safetensors", "shard_1.safetensors"]
        );
    }

    #[test]
    fn test_manifest_roundtrip() {
        let dir = TempDir::new().unwrap();
        let store = LocalDirStore::create(dir.path()).unwrap();
        assert!(store.read_manifest_text().unwrap().is_none());
        store.write_manifest_text("{\"shard_count\":2}").unwrap();
        assert_eq!(
            store.read_manifest_text().unwrap().unwrap(),
            "{\"shard_count\":2}"
        );
    }

    #[test]
    fn test_open_missing_directory_fails() {
        let err = LocalDirStore::open("/nonexistent/ckpt").unwrap_err();
        assert!(matches!(err, MeshCkptError::StorageError(_)));
    }

    #[test]
    fn test_open_missing_archive_fails() {
        let dir = TempDir::new().unwrap();
        let store = LocalDirStore::create(dir.path()).unwrap();
        assert!(store.open_archive("shard_0.safetensors").is_err());
    }
}
