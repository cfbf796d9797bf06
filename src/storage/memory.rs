//! Volatile in-memory storage.
//!
//! Three concurrent maps, one per record kind. Mutation is serialized
//! per map shard by `DashMap`; expiry of block entries is evaluated
//! lazily at enumeration/clean time, never stored.

use super::{
    AuthenticationEntry, BlockEntry, ExternalModule, Storage, StorageError, StorageResult,
};
use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use std::collections::{HashMap, HashSet};
use std::net::IpAddr;
use tracing::debug;

#[derive(Debug, Default)]
pub struct MemoryStorage {
    auth_entries: DashMap<IpAddr, HashSet<AuthenticationEntry>>,
    block_entries: DashMap<IpAddr, BlockEntry>,
    modules: DashMap<u32, ExternalModule>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of the full state, used by the durable wrapper.
    pub(super) fn export(&self) -> super::snapshot::SnapshotData {
        super::snapshot::SnapshotData {
            auth_entries: self
                .auth_entries
                .iter()
                .map(|e| (*e.key(), e.value().iter().cloned().collect()))
                .collect(),
            block_entries: self.block_entries.iter().map(|e| *e.value()).collect(),
            modules: self.modules.iter().map(|e| e.value().clone()).collect(),
        }
    }

    pub(super) fn import(data: super::snapshot::SnapshotData) -> Self {
        let store = Self::new();
        for (source, entries) in data.auth_entries {
            store.auth_entries.insert(source, entries.into_iter().collect());
        }
        for entry in data.block_entries {
            store.block_entries.insert(entry.source, entry);
        }
        for module in data.modules {
            store.modules.insert(module.id, module);
        }
        store
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn add_auth_entry(&self, entry: AuthenticationEntry) -> StorageResult<()> {
        self.auth_entries
            .entry(entry.source)
            .or_default()
            .insert(entry);
        Ok(())
    }

    async fn find_auth_entries(&self, source: IpAddr) -> StorageResult<HashSet<AuthenticationEntry>> {
        self.auth_entries
            .get(&source)
            .map(|e| e.value().clone())
            .ok_or(StorageError::NotFound)
    }

    async fn find_sources(&self) -> StorageResult<HashMap<IpAddr, usize>> {
        Ok(self
            .auth_entries
            .iter()
            .map(|e| (*e.key(), e.value().len()))
            .collect())
    }

    async fn add_block_entry(&self, entry: BlockEntry) -> StorageResult<()> {
        self.block_entries.insert(entry.source, entry);
        Ok(())
    }

    async fn remove_block_entry(&self, source: IpAddr) -> StorageResult<()> {
        self.block_entries.remove(&source);
        Ok(())
    }

    async fn find_block_entry(&self, source: IpAddr) -> StorageResult<BlockEntry> {
        self.block_entries
            .get(&source)
            .map(|e| *e.value())
            .ok_or(StorageError::NotFound)
    }

    async fn all_block_entries(&self, active_only: bool) -> StorageResult<Vec<BlockEntry>> {
        let now = Utc::now();
        Ok(self
            .block_entries
            .iter()
            .map(|e| *e.value())
            .filter(|e| !active_only || e.is_active_at(now))
            .collect())
    }

    async fn clean_block_entries(&self) -> StorageResult<()> {
        let now = Utc::now();
        self.block_entries.retain(|_, entry| entry.is_active_at(now));
        Ok(())
    }

    async fn add_external_module(&self, module: ExternalModule) -> StorageResult<()> {
        debug!(id = module.id, address = %module.address, "external module registered");
        self.modules.insert(module.id, module);
        Ok(())
    }

    async fn remove_external_module(&self, id: u32) -> StorageResult<()> {
        if self.modules.remove(&id).is_some() {
            debug!(id, "external module removed");
        }
        Ok(())
    }

    async fn external_modules(&self) -> StorageResult<Vec<ExternalModule>> {
        Ok(self.modules.iter().map(|e| e.value().clone()).collect())
    }

    async fn find_module_by_address(&self, address: &str) -> StorageResult<ExternalModule> {
        self.modules
            .iter()
            .find(|e| e.value().address == address)
            .map(|e| e.value().clone())
            .ok_or(StorageError::NotFound)
    }

    async fn close(&self) -> StorageResult<()> {
        Ok(())
    }
}
