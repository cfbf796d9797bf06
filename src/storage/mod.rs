//! Record types and the storage contract the blocking engine consumes.
//!
//! Storage holds three record kinds: observed authentication failures,
//! block decisions, and registered external modules. Implementations
//! serialize their own internal mutation; they do not provide
//! transactions spanning two calls, and callers are expected to
//! tolerate check-then-act races.

mod memory;
mod snapshot;

pub use memory::MemoryStorage;
pub use snapshot::SnapshotStorage;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::net::IpAddr;
use thiserror::Error;

/// Storage errors.
///
/// `NotFound` is a distinguished outcome rather than a failure: absence
/// of a record is meaningful wherever the domain treats "not blocked" or
/// "no attempts yet" as a normal answer.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("entry not found")]
    NotFound,
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("encoding error: {0}")]
    Encode(String),
}

pub type StorageResult<T> = Result<T, StorageError>;

/// One observed failed-authentication event.
///
/// Identity is value-based: storage keeps these with set semantics, so
/// recording the same (source, service, timestamp) twice is idempotent.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AuthenticationEntry {
    pub source: IpAddr,
    pub service: String,
    #[serde(with = "chrono::serde::ts_seconds")]
    pub timestamp: DateTime<Utc>,
}

impl AuthenticationEntry {
    /// Boundary validation: non-empty service, non-zero timestamp.
    /// Source validity is already guaranteed by the `IpAddr` type.
    pub fn is_valid(&self) -> bool {
        !self.service.is_empty() && self.timestamp.timestamp() != 0
    }
}

/// A block decision for one source address.
///
/// Whether a block is active is never stored; it is always derived from
/// `timestamp + duration`. A negative duration is the convention for a
/// sentinel entry that is expired on arrival (used to shape unblock
/// notifications).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockEntry {
    pub source: IpAddr,
    #[serde(with = "chrono::serde::ts_seconds")]
    pub timestamp: DateTime<Utc>,
    /// Block duration in seconds.
    pub duration: i64,
}

impl BlockEntry {
    pub fn expires_at(&self) -> DateTime<Utc> {
        self.timestamp + Duration::seconds(self.duration)
    }

    pub fn is_active_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at() > now
    }

    pub fn is_active(&self) -> bool {
        self.is_active_at(Utc::now())
    }
}

/// A registered webhook endpoint.
///
/// Ids are assigned by the service, not user-supplied; re-registering an
/// address reuses the existing id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExternalModule {
    pub id: u32,
    pub address: String,
    pub method: String,
}

/// Repository for the three record kinds.
///
/// Each call is internally atomic; there are no cross-call transactions.
#[async_trait]
pub trait Storage: Send + Sync {
    async fn add_auth_entry(&self, entry: AuthenticationEntry) -> StorageResult<()>;

    /// All recorded entries for a source. Unknown source is `NotFound`,
    /// not an empty set.
    async fn find_auth_entries(&self, source: IpAddr) -> StorageResult<HashSet<AuthenticationEntry>>;

    /// Distinct sources with their entry counts.
    async fn find_sources(&self) -> StorageResult<HashMap<IpAddr, usize>>;

    /// Insert or overwrite the block entry for `entry.source`. At most
    /// one block entry exists per source.
    async fn add_block_entry(&self, entry: BlockEntry) -> StorageResult<()>;

    async fn remove_block_entry(&self, source: IpAddr) -> StorageResult<()>;

    async fn find_block_entry(&self, source: IpAddr) -> StorageResult<BlockEntry>;

    /// All block entries. With `active_only`, filters to entries whose
    /// `timestamp + duration` is still in the future at call time.
    async fn all_block_entries(&self, active_only: bool) -> StorageResult<Vec<BlockEntry>>;

    /// Drop every expired block entry.
    async fn clean_block_entries(&self) -> StorageResult<()>;

    async fn add_external_module(&self, module: ExternalModule) -> StorageResult<()>;

    /// Idempotent: removing an absent id succeeds.
    async fn remove_external_module(&self, id: u32) -> StorageResult<()>;

    async fn external_modules(&self) -> StorageResult<Vec<ExternalModule>>;

    async fn find_module_by_address(&self, address: &str) -> StorageResult<ExternalModule>;

    /// Flush any pending durable state before shutdown.
    async fn close(&self) -> StorageResult<()>;
}
