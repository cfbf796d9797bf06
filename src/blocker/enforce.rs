//! Local enforcement hook: firewall-level address blocks.
//!
//! Enforcement is best-effort by contract; callers log failures and
//! move on, and the reconciliation sweep re-applies drifted state.

use async_trait::async_trait;
use std::net::IpAddr;
use tokio::process::Command;
use tracing::debug;

/// A local enforcement point, applied alongside webhook fan-out.
#[async_trait]
pub trait Enforcer: Send + Sync {
    async fn block(&self, source: IpAddr) -> anyhow::Result<()>;
    async fn unblock(&self, source: IpAddr) -> anyhow::Result<()>;
}

/// No local enforcement (disabled in config, and the default in tests).
pub struct NoopEnforcer;

#[async_trait]
impl Enforcer for NoopEnforcer {
    async fn block(&self, _source: IpAddr) -> anyhow::Result<()> {
        Ok(())
    }

    async fn unblock(&self, _source: IpAddr) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Programs DROP rules via the iptables/ip6tables binaries.
pub struct IptablesEnforcer {
    chain: String,
}

impl IptablesEnforcer {
    pub fn new(chain: impl Into<String>) -> Self {
        Self { chain: chain.into() }
    }

    fn binary(source: IpAddr) -> &'static str {
        if source.is_ipv6() { "ip6tables" } else { "iptables" }
    }

    /// Run `iptables <op> <chain> -s <ip> -j DROP`, reporting whether
    /// the command exited zero.
    async fn run(&self, source: IpAddr, op: &str) -> anyhow::Result<bool> {
        let addr = source.to_string();
        let status = Command::new(Self::binary(source))
            .args([op, self.chain.as_str(), "-s", addr.as_str(), "-j", "DROP"])
            .status()
            .await?;
        Ok(status.success())
    }
}

#[async_trait]
impl Enforcer for IptablesEnforcer {
    /// Append-unique: only add the rule when the check reports it absent.
    async fn block(&self, source: IpAddr) -> anyhow::Result<()> {
        if self.run(source, "-C").await? {
            debug!(source = %source, "firewall rule already present");
            return Ok(());
        }
        if !self.run(source, "-A").await? {
            anyhow::bail!("failed to append firewall rule for {source}");
        }
        debug!(source = %source, "firewall rule added");
        Ok(())
    }

    /// Delete-if-exists: an absent rule is not an error.
    async fn unblock(&self, source: IpAddr) -> anyhow::Result<()> {
        if !self.run(source, "-C").await? {
            return Ok(());
        }
        if !self.run(source, "-D").await? {
            anyhow::bail!("failed to delete firewall rule for {source}");
        }
        debug!(source = %source, "firewall rule removed");
        Ok(())
    }
}
