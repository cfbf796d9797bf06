//! The blocking engine.
//!
//! Consumes [`Storage`] and a runtime-mutable [`Policy`]; owns the
//! notification dedup cache and the periodic reconciliation sweep.
//! Storage is treated as a black box: no atomicity is assumed across
//! two calls, so check-then-act sequences tolerate stale reads.

pub mod enforce;
mod notify;

pub use enforce::{Enforcer, IptablesEnforcer, NoopEnforcer};

use crate::storage::{AuthenticationEntry, BlockEntry, Storage, StorageError};
use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::net::IpAddr;
use std::sync::Arc;
use tracing::{debug, warn};

/// Abuse threshold policy, replaceable at runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Policy {
    /// Attempts within the window that trigger a block.
    pub attempts: u32,
    /// Sliding-window length in seconds.
    pub period: u64,
    /// Duration applied to new blocks, in seconds.
    pub blocktime: u64,
}

impl Policy {
    pub fn is_valid(&self) -> bool {
        self.attempts >= 1 && self.period >= 1 && self.blocktime >= 1
    }

    fn window(&self) -> Duration {
        Duration::seconds(self.period.min(i64::MAX as u64) as i64)
    }

    /// Sliding-window membership for the window ending at `now`. The
    /// lower bound `now - period` is inclusive; strictly older is out,
    /// as are timestamps after `now`.
    fn in_window(&self, timestamp: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        timestamp >= now - self.window() && timestamp <= now
    }
}

/// Last state pushed to external enforcement points for one source.
///
/// `episode` is the block entry's timestamp: a new block on the same
/// source is a distinct episode and always notifies, so a stale cache
/// entry from a prior block cannot suppress it.
struct NotifiedState {
    episode: DateTime<Utc>,
    blocked: bool,
}

pub struct Blocker {
    store: Arc<dyn Storage>,
    enforcer: Arc<dyn Enforcer>,
    http: reqwest::Client,
    /// Policy and dedup cache share one lock, held only for the
    /// read/update itself, never across a storage or network call.
    policy: Mutex<Policy>,
    last_notified: Mutex<HashMap<IpAddr, NotifiedState>>,
}

impl Blocker {
    pub fn new(store: Arc<dyn Storage>, policy: Policy, enforcer: Arc<dyn Enforcer>) -> Self {
        Self {
            store,
            enforcer,
            http: notify::client(),
            policy: Mutex::new(policy),
            last_notified: Mutex::new(HashMap::new()),
        }
    }

    /// Record one failed-authentication event and evaluate the sliding
    /// window. Blocks the source on the attempt that reaches the
    /// threshold, exactly once per evaluation.
    pub async fn add_entry(&self, entry: AuthenticationEntry) -> Result<()> {
        // A blocked source's failures are not double-counted and cannot
        // re-trigger.
        if let Ok((true, _)) = self.is_blocked(entry.source).await {
            return Ok(());
        }

        let source = entry.source;
        self.store
            .add_auth_entry(entry)
            .await
            .context("failed to add entry to store")?;

        let entries = self
            .store
            .find_auth_entries(source)
            .await
            .context("failed to retrieve auth entries from store")?;

        let policy = self.policy();
        let now = Utc::now();

        let mut count = 0;
        for e in &entries {
            if policy.in_window(e.timestamp, now) {
                count += 1;

                if count >= policy.attempts {
                    self.block_ip(source)
                        .await
                        .with_context(|| format!("failed to block {source}"))?;
                    break;
                }
            }
        }

        Ok(())
    }

    /// Block a source for the policy's blocktime, overwriting any prior
    /// block, then notify. A notification failure is surfaced but the
    /// storage write stands; the sweep retries external state.
    pub async fn block_ip(&self, source: IpAddr) -> Result<BlockEntry> {
        let entry = BlockEntry {
            source,
            timestamp: Utc::now(),
            duration: self.policy().blocktime as i64,
        };

        self.store
            .add_block_entry(entry)
            .await
            .context("failed to store block entry")?;

        self.notify_external(entry)
            .await
            .context("failed to notify external modules of block")?;

        Ok(entry)
    }

    /// Remove a source's block and propagate `blocked = false`.
    ///
    /// The sentinel entry (negative duration, so expired on arrival)
    /// only shapes the notification payload; it is never stored.
    pub async fn unblock_ip(&self, source: IpAddr) -> Result<()> {
        let entry = BlockEntry {
            source,
            timestamp: Utc::now(),
            duration: -(self.policy().blocktime as i64),
        };

        self.store
            .remove_block_entry(source)
            .await
            .context("failed to remove block entry from store")?;

        self.notify_external(entry)
            .await
            .context("failed to notify external modules of unblock")
    }

    /// Whether a source is currently blocked, plus the raw entry.
    /// Absence of a record is a normal negative answer, not an error.
    pub async fn is_blocked(&self, source: IpAddr) -> Result<(bool, Option<BlockEntry>)> {
        let entry = match self.store.find_block_entry(source).await {
            Ok(entry) => entry,
            Err(StorageError::NotFound) => return Ok((false, None)),
            Err(e) => return Err(anyhow::Error::new(e).context("unable to load block entry")),
        };

        // A status query re-confirms external state; dedup makes this
        // a no-op when nothing changed.
        if let Err(e) = self.notify_external(entry).await {
            debug!(source = %source, error = %e, "re-notification on status query failed");
        }

        Ok((entry.is_active(), Some(entry)))
    }

    pub fn policy(&self) -> Policy {
        *self.policy.lock()
    }

    /// Takes effect for all subsequent evaluations; counts already in
    /// flight keep the snapshot they started with.
    pub fn update_policy(&self, policy: Policy) {
        *self.policy.lock() = policy;
    }

    /// One reconciliation pass: re-confirm or correct external state
    /// for every block entry, then drop the fully expired ones. The
    /// dedup cache is evicted down to the sources that survive the
    /// pass, so it cannot grow with the history of blocked sources.
    pub async fn notify_all(&self) -> Result<()> {
        let entries = self
            .store
            .all_block_entries(false)
            .await
            .context("failed to retrieve all block entries")?;

        let surviving: HashSet<IpAddr> =
            entries.iter().filter(|e| e.is_active()).map(|e| e.source).collect();

        for entry in entries {
            self.notify_external(entry)
                .await
                .with_context(|| format!("failed to notify modules of {}", entry.source))?;
        }

        self.store
            .clean_block_entries()
            .await
            .context("failed to clean block store")?;

        self.last_notified
            .lock()
            .retain(|source, _| surviving.contains(source));

        Ok(())
    }
}

/// Spawn the periodic reconciliation sweep.
///
/// Single-iteration errors are logged and never stop the loop; it runs
/// until process shutdown.
pub fn spawn_sweep_task(
    blocker: Arc<Blocker>,
    interval: std::time::Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);

        loop {
            ticker.tick().await;
            if let Err(e) = blocker.notify_all().await {
                warn!(error = %e, "reconciliation sweep failed");
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorage;
    use async_trait::async_trait;

    /// Records every enforcement call as (source, blocked).
    #[derive(Default)]
    struct RecordingEnforcer {
        events: Mutex<Vec<(IpAddr, bool)>>,
    }

    impl RecordingEnforcer {
        fn events(&self) -> Vec<(IpAddr, bool)> {
            self.events.lock().clone()
        }
    }

    #[async_trait]
    impl Enforcer for RecordingEnforcer {
        async fn block(&self, source: IpAddr) -> Result<()> {
            self.events.lock().push((source, true));
            Ok(())
        }

        async fn unblock(&self, source: IpAddr) -> Result<()> {
            self.events.lock().push((source, false));
            Ok(())
        }
    }

    fn test_blocker(
        policy: Policy,
    ) -> (Arc<Blocker>, Arc<MemoryStorage>, Arc<RecordingEnforcer>) {
        let store = Arc::new(MemoryStorage::new());
        let enforcer = Arc::new(RecordingEnforcer::default());
        let blocker = Arc::new(Blocker::new(store.clone(), policy, enforcer.clone()));
        (blocker, store, enforcer)
    }

    fn attempt(ip: IpAddr, offset_secs: i64) -> AuthenticationEntry {
        AuthenticationEntry {
            source: ip,
            service: "sshd".to_string(),
            timestamp: Utc::now() + Duration::seconds(offset_secs),
        }
    }

    const POLICY: Policy = Policy { attempts: 3, period: 5, blocktime: 60 };

    #[test]
    fn window_lower_bound_is_inclusive() {
        let now = DateTime::from_timestamp(1_700_000_000, 0).unwrap();

        assert!(POLICY.in_window(now, now));
        assert!(POLICY.in_window(now - Duration::seconds(POLICY.period as i64), now));
        assert!(!POLICY.in_window(now - Duration::seconds(POLICY.period as i64 + 1), now));
        assert!(!POLICY.in_window(now + Duration::seconds(1), now));
    }

    #[tokio::test]
    async fn blocks_exactly_at_nth_attempt() {
        let ip: IpAddr = "10.0.0.1".parse().unwrap();
        let (blocker, store, enforcer) = test_blocker(POLICY);

        blocker.add_entry(attempt(ip, -2)).await.unwrap();
        blocker.add_entry(attempt(ip, -1)).await.unwrap();
        assert!(!blocker.is_blocked(ip).await.unwrap().0);
        assert!(enforcer.events().is_empty());

        blocker.add_entry(attempt(ip, 0)).await.unwrap();
        let (blocked, entry) = blocker.is_blocked(ip).await.unwrap();
        assert!(blocked);
        assert_eq!(entry.unwrap().duration, 60);

        // Exactly one block decision, on the third attempt.
        assert_eq!(enforcer.events(), vec![(ip, true)]);
        assert_eq!(store.all_block_entries(true).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn entries_outside_window_are_excluded() {
        let ip: IpAddr = "10.0.0.1".parse().unwrap();
        let (blocker, _store, _) = test_blocker(POLICY);

        // Two stale attempts well outside the 5s window.
        blocker.add_entry(attempt(ip, -60)).await.unwrap();
        blocker.add_entry(attempt(ip, -30)).await.unwrap();
        blocker.add_entry(attempt(ip, -1)).await.unwrap();
        blocker.add_entry(attempt(ip, 0)).await.unwrap();
        assert!(!blocker.is_blocked(ip).await.unwrap().0);

        // Third in-window attempt crosses the threshold.
        blocker.add_entry(attempt(ip, -2)).await.unwrap();
        assert!(blocker.is_blocked(ip).await.unwrap().0);
    }

    #[tokio::test]
    async fn blocked_source_entries_are_not_recorded() {
        let ip: IpAddr = "10.0.0.1".parse().unwrap();
        let (blocker, store, _) = test_blocker(POLICY);

        let block = blocker.block_ip(ip).await.unwrap();
        blocker.add_entry(attempt(ip, 0)).await.unwrap();

        // Nothing persisted while blocked, block untouched.
        assert!(matches!(
            store.find_auth_entries(ip).await,
            Err(StorageError::NotFound)
        ));
        let (blocked, entry) = blocker.is_blocked(ip).await.unwrap();
        assert!(blocked);
        assert_eq!(entry.unwrap(), block);
    }

    #[tokio::test]
    async fn unknown_source_is_not_blocked() {
        let (blocker, _, _) = test_blocker(POLICY);
        let (blocked, entry) = blocker
            .is_blocked("192.0.2.7".parse().unwrap())
            .await
            .unwrap();
        assert!(!blocked);
        assert!(entry.is_none());
    }

    #[tokio::test]
    async fn unblock_then_query_reports_unblocked() {
        let ip: IpAddr = "10.0.0.1".parse().unwrap();
        let (blocker, store, enforcer) = test_blocker(POLICY);

        blocker.block_ip(ip).await.unwrap();
        blocker.unblock_ip(ip).await.unwrap();

        let (blocked, entry) = blocker.is_blocked(ip).await.unwrap();
        assert!(!blocked);
        assert!(entry.is_none());
        assert!(store.all_block_entries(false).await.unwrap().is_empty());
        assert_eq!(enforcer.events(), vec![(ip, true), (ip, false)]);
    }

    #[tokio::test]
    async fn repeated_notification_of_same_state_is_deduplicated() {
        let ip: IpAddr = "10.0.0.1".parse().unwrap();
        let (blocker, _, enforcer) = test_blocker(POLICY);

        blocker.block_ip(ip).await.unwrap();
        blocker.notify_all().await.unwrap();
        blocker.notify_all().await.unwrap();
        blocker.is_blocked(ip).await.unwrap();

        // One dispatch despite four evaluations.
        assert_eq!(enforcer.events(), vec![(ip, true)]);
    }

    #[tokio::test]
    async fn new_block_episode_notifies_again() {
        let ip: IpAddr = "10.0.0.1".parse().unwrap();
        let (blocker, _, enforcer) = test_blocker(POLICY);

        blocker.block_ip(ip).await.unwrap();
        blocker.unblock_ip(ip).await.unwrap();
        blocker.block_ip(ip).await.unwrap();

        // The second block has a fresh timestamp, so the stale cache
        // entry must not suppress it.
        assert_eq!(enforcer.events(), vec![(ip, true), (ip, false), (ip, true)]);
    }

    #[tokio::test]
    async fn sweep_drops_expired_blocks_and_notifies_inactive() {
        let ip: IpAddr = "10.0.0.1".parse().unwrap();
        let (blocker, store, enforcer) = test_blocker(POLICY);

        // A block whose duration has already elapsed.
        store
            .add_block_entry(BlockEntry {
                source: ip,
                timestamp: Utc::now() - Duration::seconds(120),
                duration: 60,
            })
            .await
            .unwrap();

        blocker.notify_all().await.unwrap();
        assert_eq!(enforcer.events(), vec![(ip, false)]);
        assert!(store.all_block_entries(false).await.unwrap().is_empty());

        // Entry is gone, so the next sweep dispatches nothing.
        blocker.notify_all().await.unwrap();
        assert_eq!(enforcer.events(), vec![(ip, false)]);
    }

    #[tokio::test]
    async fn sweep_evicts_settled_sources_from_the_dedup_cache() {
        let blocked: IpAddr = "10.0.0.1".parse().unwrap();
        let released: IpAddr = "10.0.0.2".parse().unwrap();
        let (blocker, _, _) = test_blocker(POLICY);

        blocker.block_ip(blocked).await.unwrap();
        blocker.block_ip(released).await.unwrap();
        blocker.unblock_ip(released).await.unwrap();
        assert_eq!(blocker.last_notified.lock().len(), 2);

        blocker.notify_all().await.unwrap();

        // Only sources with a live block keep a cache entry.
        let cache = blocker.last_notified.lock();
        assert_eq!(cache.len(), 1);
        assert!(cache.contains_key(&blocked));
    }

    #[tokio::test]
    async fn policy_update_applies_to_subsequent_evaluations() {
        let ip: IpAddr = "10.0.0.1".parse().unwrap();
        let (blocker, _, _) = test_blocker(Policy { attempts: 10, period: 60, blocktime: 60 });

        for i in 0..3 {
            blocker.add_entry(attempt(ip, -i)).await.unwrap();
        }
        assert!(!blocker.is_blocked(ip).await.unwrap().0);

        blocker.update_policy(Policy { attempts: 3, period: 60, blocktime: 120 });
        assert_eq!(blocker.policy().attempts, 3);

        blocker.add_entry(attempt(ip, -4)).await.unwrap();
        let (blocked, entry) = blocker.is_blocked(ip).await.unwrap();
        assert!(blocked);
        assert_eq!(entry.unwrap().duration, 120);
    }

    #[tokio::test]
    async fn unreachable_module_does_not_fail_blocking() {
        let ip: IpAddr = "10.0.0.1".parse().unwrap();
        let (blocker, store, _) = test_blocker(POLICY);

        store
            .add_external_module(crate::storage::ExternalModule {
                id: 1,
                address: "http://127.0.0.1:9/hook".to_string(),
                method: "POST".to_string(),
            })
            .await
            .unwrap();

        // Delivery is fire-and-forget; the caller never sees it fail.
        blocker.block_ip(ip).await.unwrap();
        assert!(blocker.is_blocked(ip).await.unwrap().0);
    }
}
