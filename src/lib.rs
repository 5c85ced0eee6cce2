//! # meshckpt
//!
//! Sharded checkpoint and resharding toolkit for mesh-parallel transformer
//! models. A checkpoint written by an N-way training mesh can be reloaded
//! onto an M-way inference mesh (N ≠ M) without ever holding the whole
//! unsharded model in memory when per-tensor streaming is possible.
//!
//! ## Core Concept
//!
//! Every parameter of a transformer is assigned a **partition rule** by the
//! [`partition::PartitionPlan`]: either replicated across all shards or split
//! into equal contiguous blocks along one axis. The pure [`codec`] applies
//! those rules to tensors; [`store`] persists one shard's parameter dict as a
//! self-contained safetensors archive; [`checkpoint`] ties them together with
//! a versioned manifest, a reader that resplits on load, a writer whose
//! manifest-last ordering makes saves crash-safe, and a resharder that
//! converts checkpoints between shard counts.
//!
//! ## Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use meshckpt::{ArchConfig, CheckpointReader, LocalDirStore, ShardStore};
//!
//! let config = ArchConfig::from_file("config.json")?;
//! let store: Arc<dyn ShardStore> = Arc::new(LocalDirStore::open("/data/ckpt/step_40000")?);
//! let reader = CheckpointReader::new(store, &config);
//! // Load an 8-way training checkpoint as 2 inference shards.
//! let shards = reader.load(2)?;
//! ```

pub mod checkpoint;
pub mod codec;
pub mod config;
pub mod partition;
pub mod store;
pub mod utils;

// Re-exports for convenience
pub use checkpoint::{CheckpointReader, CheckpointWriter, Manifest, ParamShard, Resharder};
pub use config::{ArchConfig, AttentionKind, Compat, PositionalEncoding};
pub use partition::{PartitionPlan, PartitionRule, TensorPath, TensorSpec};
pub use store::{LocalDirStore, Location, ShardStore};

/// Error types for the library
#[derive(thiserror::Error, Debug)]
pub enum MeshCkptError {
    #[error("configuration error: {0}")]
    ConfigError(String),

    #[error("architecture mismatch at {path}: {detail}")]
    ArchitectureMismatch { path: String, detail: String },

    #[error("manifest error: {0}")]
    ManifestError(String),

    #[error("storage error: {0}")]
    StorageError(String),

    #[error("unsupported storage operation: {0}")]
    UnsupportedOperation(String),

    #[error("shape mismatch at {path}: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        path: String,
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    #[error("download error: {0}")]
    DownloadError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("candle error: {0}")]
    CandleError(#[from] candle_core::Error),

    #[error("JSON parse error: {0}")]
    JsonError(#[from] serde_json::Error),
}

impl MeshCkptError {
    /// Shape-mismatch constructor used by the codec and validation paths.
    pub fn shape_mismatch(path: impl Into<String>, expected: &[usize], actual: &[usize]) -> Self {
        MeshCkptError::ShapeMismatch {
            path: path.into(),
            expected: expected.to_vec(),
            actual: actual.to_vec(),
        }
    }
}

pub type Result<T> = std::result::Result<T, MeshCkptError>;
