//! External notification fan-out.
//!
//! Pushes a block entry's computed state to every registered module and
//! the local enforcement hook, deduplicating against the last state
//! already communicated per source.

use super::{Blocker, NotifiedState};
use crate::storage::{BlockEntry, ExternalModule};
use anyhow::{Context, Result};
use reqwest::header::CONTENT_TYPE;
use serde::Serialize;
use std::time::Duration;
use tracing::{debug, warn};

/// Per-request timeout for webhook delivery.
const DELIVERY_TIMEOUT: Duration = Duration::from_secs(5);

pub(super) fn client() -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(DELIVERY_TIMEOUT)
        .user_agent(concat!("blockd/", env!("CARGO_PKG_VERSION")))
        .build()
        .unwrap_or_else(|_| reqwest::Client::new())
}

/// Webhook body: all block entry fields plus the computed state.
#[derive(Debug, Serialize)]
struct Notification {
    #[serde(flatten)]
    entry: BlockEntry,
    blocked: bool,
}

impl Blocker {
    /// Push `entry`'s current state to external enforcement points.
    ///
    /// The same (source, episode, state) is never pushed twice in a
    /// row. Webhook delivery is detached fire-and-forget work; only
    /// storage and encoding failures surface to the caller.
    pub(crate) async fn notify_external(&self, entry: BlockEntry) -> Result<()> {
        let blocked = entry.is_active();

        {
            let cache = self.last_notified.lock();
            if let Some(prev) = cache.get(&entry.source) {
                if prev.episode == entry.timestamp && prev.blocked == blocked {
                    return Ok(());
                }
            }
        }

        let payload = serde_json::to_vec(&Notification { entry, blocked })
            .context("unable to encode notification")?;

        let modules = self
            .store
            .external_modules()
            .await
            .context("unable to list external modules")?;

        // Correlation id for the log lines of one fan-out.
        let event = rand::random::<u32>();
        debug!(
            modules = modules.len(),
            source = %entry.source,
            blocked,
            event,
            "notifying external modules"
        );

        for module in modules {
            let client = self.http.clone();
            let body = payload.clone();
            tokio::spawn(async move {
                deliver(client, module, body, event).await;
            });
        }

        // Local enforcement is independently best-effort.
        let enforced = if blocked {
            self.enforcer.block(entry.source).await
        } else {
            self.enforcer.unblock(entry.source).await
        };
        if let Err(e) = enforced {
            warn!(source = %entry.source, blocked, error = %e, "local enforcement failed");
        }

        self.last_notified
            .lock()
            .insert(entry.source, NotifiedState { episode: entry.timestamp, blocked });

        Ok(())
    }
}

/// One delivery attempt. Transport failures and non-2xx responses are
/// logged only; the periodic sweep is the retry mechanism.
async fn deliver(client: reqwest::Client, module: ExternalModule, body: Vec<u8>, event: u32) {
    let method = match reqwest::Method::from_bytes(module.method.as_bytes()) {
        Ok(method) => method,
        Err(_) => {
            warn!(
                module = %module.address,
                method = %module.method,
                event,
                "external module has an invalid method"
            );
            return;
        }
    };

    match client
        .request(method, &module.address)
        .header(CONTENT_TYPE, "application/json")
        .body(body)
        .send()
        .await
    {
        Ok(resp) if !resp.status().is_success() => {
            warn!(
                module = %module.address,
                status = %resp.status(),
                event,
                "external module rejected notification"
            );
        }
        Ok(_) => {}
        Err(e) => {
            warn!(module = %module.address, error = %e, event, "failed to deliver notification");
        }
    }
}
