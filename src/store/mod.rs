//! Shard file stores: where checkpoint archives live.
//!
//! A [`ShardStore`] persists one shard's full parameter dictionary as a
//! self-contained safetensors archive and holds the checkpoint manifest
//! beside them. Reader, writer, and resharder all receive the store as an
//! injected capability; nothing in this crate hardcodes a transport.
//!
//! Local directories support reads and writes. `https://` locations are
//! read-only: they are materialized into a local cache by [`fetch`] and any
//! write attempt fails with an unsupported-operation error.

mod fetch;
mod local;

pub use fetch::fetch_checkpoint;
pub use local::LocalDirStore;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use candle_core::Tensor;

use crate::partition::TensorInfo;
use crate::MeshCkptError;

/// File name of the checkpoint manifest within a store
pub const MANIFEST_FILE: &str = "manifest.json";

/// One shard archive opened for reading. Implementations keep tensor bytes
/// memory-mapped; `tensor_info` reads only the archive header, never the
/// data section.
pub trait ShardArchive: Send {
    /// Names of all tensors in the archive
    fn tensor_names(&self) -> Vec<String>;

    /// Shape and dtype of one tensor, without reading its bytes
    fn tensor_info(&self, name: &str) -> crate::Result<TensorInfo>;

    /// Load one tensor into memory
    fn load_tensor(&self, name: &str) -> crate::Result<Tensor>;

    /// Load the whole archive as a parameter dictionary
    fn load_all(&self) -> crate::Result<HashMap<String, Tensor>>;
}

/// Storage capability for one checkpoint location.
///
/// Archives are write-once: `write_archive` never mutates a live file in
/// place (local stores write to a fresh temp name and rename), so backends
/// without random-access overwrite are supportable. The manifest must be
/// written last; see [`crate::checkpoint::Manifest`].
pub trait ShardStore: Send + Sync + std::fmt::Debug {
    /// Open one shard archive for reading
    fn open_archive(&self, name: &str) -> crate::Result<Box<dyn ShardArchive>>;

    /// Persist one shard's parameter dictionary under `name`
    fn write_archive(&self, name: &str, tensors: &HashMap<String, Tensor>) -> crate::Result<()>;

    /// Read the manifest document, or `None` if the location has none
    fn read_manifest_text(&self) -> crate::Result<Option<String>>;

    /// Persist the manifest document. Callers must only invoke this after
    /// every archive the manifest references is durably written.
    fn write_manifest_text(&self, json: &str) -> crate::Result<()>;

    /// List archive file names present at the location (legacy detection)
    fn list_archives(&self) -> crate::Result<Vec<String>>;

    /// Human-readable location for logs and errors
    fn location(&self) -> String;
}

/// A checkpoint location: local directory or remote object URL
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Location {
    Local(PathBuf),
    Https(String),
}

impl Location {
    /// Parse a location string: a plain path, `file://` path, or
    /// `http(s)://` URL.
    pub fn parse(s: &str) -> crate::Result<Self> {
        if let Some(path) = s.strip_prefix("file://") {
            Ok(Location::Local(PathBuf::from(path)))
        } else if s.starts_with("https://") || s.starts_with("http://") {
            Ok(Location::Https(s.trim_end_matches('/').to_string()))
        } else if s.contains("://") {
            Err(MeshCkptError::StorageError(format!(
                "unsupported location scheme: {}",
                s
            )))
        } else {
            Ok(Location::Local(PathBuf::from(s)))
        }
    }

    pub fn is_remote(&self) -> bool {
        matches!(self, Location::Https(_))
    }

    /// Open the location for reading. Remote checkpoints are materialized
    /// into `cache_dir` first; the returned store then serves reads from
    /// the cache and rejects writes.
    pub async fn open_readonly(&self, cache_dir: &Path) -> crate::Result<Arc<dyn ShardStore>> {
        match self {
            Location::Local(path) => Ok(Arc::new(LocalDirStore::open(path)?)),
            Location::Https(url) => {
                let local = fetch_checkpoint(url, cache_dir).await?;
                Ok(Arc::new(CachedRemoteStore {
                    inner: LocalDirStore::open(&local)?,
                    origin: url.clone(),
                }))
            }
        }
    }

    /// Open the location for writing. Only local directories are writable;
    /// the directory is created if absent.
    pub fn open_writable(&self) -> crate::Result<Arc<dyn ShardStore>> {
        match self {
            Location::Local(path) => Ok(Arc::new(LocalDirStore::create(path)?)),
            Location::Https(url) => Err(MeshCkptError::UnsupportedOperation(format!(
                "cannot write a checkpoint to {}: remote locations are read-only",
                url
            ))),
        }
    }
}

impl std::fmt::Display for Location {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Location::Local(path) => write!(f, "{}", path.display()),
            Location::Https(url) => f.write_str(url),
        }
    }
}

/// Read-only view over a locally cached remote checkpoint
#[derive(Debug)]
struct CachedRemoteStore {
    inner: LocalDirStore,
    origin: String,
}

impl ShardStore for CachedRemoteStore {
    fn open_archive(&self, name: &str) -> crate::Result<Box<dyn ShardArchive>> {
        self.inner.open_archive(name)
    }

    fn write_archive(&self, name: &str, _tensors: &HashMap<String, Tensor>) -> crate::Result<()> {
        Err(MeshCkptError::UnsupportedOperation(format!(
            "cannot write archive {} to remote location {}",
            name, self.origin
        )))
    }

    fn read_manifest_text(&self) -> crate::Result<Option<String>> {
        self.inner.read_manifest_text()
    }

    fn write_manifest_text(&self, _json: &str) -> crate::Result<()> {
        Err(MeshCkptError::UnsupportedOperation(format!(
            "cannot write manifest to remote location {}",
            self.origin
        )))
    }

    fn list_archives(&self) -> crate::Result<Vec<String>> {
        self.inner.list_archives()
    }

    fn location(&self) -> String {
        self.origin.clone()
    }
}
