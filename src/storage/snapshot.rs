//! Disk-snapshotted storage.
//!
//! Wraps [`MemoryStorage`] and persists the full state as one
//! MessagePack blob: loaded once at startup, rewritten after every
//! mutation. Saves are dispatched off the caller's path and are
//! best-effort; a crash between a mutation and its flush loses at most
//! the latest mutation, which the reconciliation sweep re-derives.

use super::{
    AuthenticationEntry, BlockEntry, ExternalModule, MemoryStorage, Storage, StorageError,
    StorageResult,
};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Full persisted state.
#[derive(Debug, Serialize, Deserialize)]
pub(super) struct SnapshotData {
    pub auth_entries: HashMap<IpAddr, Vec<AuthenticationEntry>>,
    pub block_entries: Vec<BlockEntry>,
    pub modules: Vec<ExternalModule>,
}

pub struct SnapshotStorage {
    inner: MemoryStorage,
    path: PathBuf,
}

impl SnapshotStorage {
    /// Open the snapshot at `path`. A missing file is an empty initial
    /// state; a file that cannot be decoded is an error (fatal at
    /// startup, by design).
    pub fn open<P: Into<PathBuf>>(path: P) -> StorageResult<Self> {
        let path = path.into();
        let inner = if path.exists() {
            let bytes = std::fs::read(&path)?;
            let data: SnapshotData =
                rmp_serde::from_slice(&bytes).map_err(|e| StorageError::Encode(e.to_string()))?;
            debug!(path = %path.display(), "snapshot loaded");
            MemoryStorage::import(data)
        } else {
            debug!(path = %path.display(), "no snapshot on disk, starting empty");
            MemoryStorage::new()
        };

        Ok(Self { inner, path })
    }

    /// Dispatch a best-effort save of the current state. Failures are
    /// logged, never surfaced to the mutating caller.
    fn schedule_save(&self) {
        let data = self.inner.export();
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || {
            if let Err(e) = write_snapshot(&path, &data) {
                warn!(path = %path.display(), error = %e, "failed to save snapshot");
            }
        });
    }
}

/// Encode and write atomically: temp file, then rename. The temp name
/// is unique per save, so overlapping saves cannot pair one writer's
/// partial file with another's rename.
fn write_snapshot(path: &Path, data: &SnapshotData) -> StorageResult<()> {
    let bytes = rmp_serde::to_vec(data).map_err(|e| StorageError::Encode(e.to_string()))?;
    let temp = path.with_extension(format!("tmp.{:08x}", rand::random::<u32>()));
    std::fs::write(&temp, &bytes)?;
    std::fs::rename(&temp, path)?;
    Ok(())
}

#[async_trait]
impl Storage for SnapshotStorage {
    async fn add_auth_entry(&self, entry: AuthenticationEntry) -> StorageResult<()> {
        let res = self.inner.add_auth_entry(entry).await;
        self.schedule_save();
        res
    }

    async fn find_auth_entries(&self, source: IpAddr) -> StorageResult<HashSet<AuthenticationEntry>> {
        self.inner.find_auth_entries(source).await
    }

    async fn find_sources(&self) -> StorageResult<HashMap<IpAddr, usize>> {
        self.inner.find_sources().await
    }

    async fn add_block_entry(&self, entry: BlockEntry) -> StorageResult<()> {
        let res = self.inner.add_block_entry(entry).await;
        self.schedule_save();
        res
    }

    async fn remove_block_entry(&self, source: IpAddr) -> StorageResult<()> {
        let res = self.inner.remove_block_entry(source).await;
        self.schedule_save();
        res
    }

    async fn find_block_entry(&self, source: IpAddr) -> StorageResult<BlockEntry> {
        self.inner.find_block_entry(source).await
    }

    async fn all_block_entries(&self, active_only: bool) -> StorageResult<Vec<BlockEntry>> {
        self.inner.all_block_entries(active_only).await
    }

    async fn clean_block_entries(&self) -> StorageResult<()> {
        let res = self.inner.clean_block_entries().await;
        self.schedule_save();
        res
    }

    async fn add_external_module(&self, module: ExternalModule) -> StorageResult<()> {
        let res = self.inner.add_external_module(module).await;
        self.schedule_save();
        res
    }

    async fn remove_external_module(&self, id: u32) -> StorageResult<()> {
        let res = self.inner.remove_external_module(id).await;
        self.schedule_save();
        res
    }

    async fn external_modules(&self) -> StorageResult<Vec<ExternalModule>> {
        self.inner.external_modules().await
    }

    async fn find_module_by_address(&self, address: &str) -> StorageResult<ExternalModule> {
        self.inner.find_module_by_address(address).await
    }

    /// Final synchronous flush.
    async fn close(&self) -> StorageResult<()> {
        write_snapshot(&self.path, &self.inner.export())
    }
}
