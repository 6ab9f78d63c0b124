//! Leader election for redundant operator replicas.
//!
//! The manager depends only on the [`LeaderElector`] trait. Production uses
//! [`lease::LeaseElector`], a `coordination.k8s.io/v1` Lease; tests use
//! [`memory::InMemoryLeaderElector`].
//!
//! Only the instance holding the lease runs leader-gated runnables. Standby
//! instances retry every `retry_period` until elected or cancelled.

pub mod lease;
pub mod memory;

use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::telemetry::IS_LEADER;

/// Result of a leadership acquisition attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LeadershipResult {
    /// Successfully acquired leadership.
    Acquired {
        /// Token that must be presented on renewal and release.
        lease_token: String,
        lease_duration: Duration,
    },
    /// Leadership is held by another instance.
    NotLeader {
        current_leader: Option<String>,
    },
}

impl LeadershipResult {
    #[must_use]
    pub const fn is_leader(&self) -> bool {
        matches!(self, Self::Acquired { .. })
    }

    #[must_use]
    pub fn lease_token(&self) -> Option<&str> {
        match self {
            Self::Acquired { lease_token, .. } => Some(lease_token),
            Self::NotLeader { .. } => None,
        }
    }
}

/// Result of a lease renewal attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RenewalResult {
    Renewed { lease_duration: Duration },
    /// Lease expired or was taken by another instance.
    Lost,
}

impl RenewalResult {
    #[must_use]
    pub const fn is_renewed(&self) -> bool {
        matches!(self, Self::Renewed { .. })
    }
}

/// Pluggable leader election.
///
/// All methods are `Send + Sync` so the elector can be shared between the
/// election task and the manager.
#[async_trait]
pub trait LeaderElector: Send + Sync {
    /// Attempts to acquire leadership of `lock_key` for `identity`.
    async fn try_acquire(&self, lock_key: &str, identity: &str) -> Result<LeadershipResult>;

    /// Renews a lease obtained from [`LeaderElector::try_acquire`].
    async fn renew(&self, lock_key: &str, lease_token: &str) -> Result<RenewalResult>;

    /// Gives up leadership so a standby can take over without waiting for
    /// the lease to expire. Returns false when the lease was no longer ours.
    async fn release(&self, lock_key: &str, lease_token: &str) -> Result<bool>;

    async fn current_leader(&self, lock_key: &str) -> Result<Option<String>>;
}

/// Timing and identity of one election.
#[derive(Debug, Clone)]
pub struct ElectionConfig {
    pub lock_key: String,
    pub identity: String,
    pub lease_duration: Duration,
    pub renew_deadline: Duration,
    pub retry_period: Duration,
}

impl ElectionConfig {
    /// `<hostname>_<uuid>`, unique per process.
    pub fn default_identity() -> String {
        let host = std::env::var("HOSTNAME").ok().filter(|h| !h.is_empty()).unwrap_or_else(|| "unknown".into());
        format!("{host}_{}", uuid::Uuid::new_v4())
    }
}

/// Blocks until this instance is leader. Returns `None` when `shutdown`
/// fires first.
pub async fn acquire(elector: &dyn LeaderElector, cfg: &ElectionConfig, shutdown: &CancellationToken) -> Result<Option<String>> {
    info!(target: "leader", lease = %cfg.lock_key, identity = %cfg.identity, "attempting to acquire leader lease");
    loop {
        match elector.try_acquire(&cfg.lock_key, &cfg.identity).await {
            Ok(LeadershipResult::Acquired { lease_token, .. }) => {
                info!(target: "leader", lease = %cfg.lock_key, "successfully acquired lease");
                IS_LEADER.set(1);
                return Ok(Some(lease_token));
            }
            Ok(LeadershipResult::NotLeader { current_leader }) => {
                debug!(target: "leader", lease = %cfg.lock_key, current_leader = ?current_leader, "lease held by another instance");
            }
            Err(e) => warn!(target: "leader", lease = %cfg.lock_key, error = %e, "error acquiring lease"),
        }
        tokio::select! {
            _ = shutdown.cancelled() => return Ok(None),
            _ = tokio::time::sleep(cfg.retry_period) => {}
        }
    }
}

/// Renews the lease every `retry_period` until `shutdown` fires. Fails with
/// [`Error::LeadershipLost`] once the lease is taken or renewals keep failing
/// past `renew_deadline`.
///
/// The lease is still held when this returns `Ok`; the caller hands it back
/// with [`release`] once every leader-gated runnable has stopped.
pub async fn hold(elector: &dyn LeaderElector, cfg: &ElectionConfig, lease_token: &str, shutdown: &CancellationToken) -> Result<()> {
    let mut last_renewed = tokio::time::Instant::now();
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return Ok(()),
            _ = tokio::time::sleep(cfg.retry_period) => {}
        }
        match elector.renew(&cfg.lock_key, lease_token).await {
            Ok(RenewalResult::Renewed { .. }) => last_renewed = tokio::time::Instant::now(),
            Ok(RenewalResult::Lost) => {
                IS_LEADER.set(0);
                return Err(Error::LeadershipLost(cfg.lock_key.clone()));
            }
            Err(e) => {
                warn!(target: "leader", lease = %cfg.lock_key, error = %e, "failed to renew lease");
                if last_renewed.elapsed() >= cfg.renew_deadline {
                    IS_LEADER.set(0);
                    return Err(Error::LeadershipLost(cfg.lock_key.clone()));
                }
            }
        }
    }
}

/// Gives the lease back so a standby can take over without waiting for it
/// to expire. Errors are logged, never returned.
pub async fn release(elector: &dyn LeaderElector, cfg: &ElectionConfig, lease_token: &str) {
    IS_LEADER.set(0);
    match elector.release(&cfg.lock_key, lease_token).await {
        Ok(true) => info!(target: "leader", lease = %cfg.lock_key, "released leader lease"),
        Ok(false) => debug!(target: "leader", lease = %cfg.lock_key, "lease already gone at release"),
        Err(e) => warn!(target: "leader", lease = %cfg.lock_key, error = %e, "failed to release lease"),
    }
}
