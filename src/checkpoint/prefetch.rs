//! Background shard-archive prefetching.
//!
//! Opening an archive and paging in its header is I/O-bound and independent
//! per shard, so while the reader converts and validates shard `i` a
//! background thread can already open shard `i + 1`.

use std::sync::Arc;
use std::thread::JoinHandle;

use crate::store::{ShardArchive, ShardStore};

/// Thread-based read-ahead over shard archives
pub struct ArchivePrefetcher {
    store: Arc<dyn ShardStore>,
    handle: Option<JoinHandle<crate::Result<Box<dyn ShardArchive>>>>,
    prefetched_name: Option<String>,
}

impl ArchivePrefetcher {
    pub fn new(store: Arc<dyn ShardStore>) -> Self {
        ArchivePrefetcher {
            store,
            handle: None,
            prefetched_name: None,
        }
    }

    /// Start opening an archive in the background
    pub fn start_prefetch(&mut self, name: &str) {
        // Drain any in-flight prefetch first
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }

        tracing::debug!("Prefetching shard archive {}", name);
        let store = self.store.clone();
        let owned_name = name.to_string();
        self.prefetched_name = Some(owned_name.clone());
        self.handle = Some(std::thread::spawn(move || store.open_archive(&owned_name)));
    }

    /// Open an archive, using the prefetched handle when it matches
    pub fn open(&mut self, name: &str) -> crate::Result<Box<dyn ShardArchive>> {
        if self.prefetched_name.as_deref() == Some(name) {
            if let Some(handle) = self.handle.take() {
                self.prefetched_name = None;
                return handle.join().map_err(|_| {
                    crate::MeshCkptError::StorageError(format!(
                        "prefetch thread for {} panicked",
                        name
                    ))
                })?;
            }
        }
        self.store.open_archive(name)
    }

    /// Open `name` and kick off a prefetch of `next` when given
    pub fn open_and_prefetch(
        &mut self,
        name: &str,
        next: Option<&str>,
    ) -> crate::Result<Box<dyn ShardArchive>> {
        let archive = self.open(name)?;
        if let Some(next) = next {
            self.start_prefetch(next);
        }
        Ok(archive)
    }
}
