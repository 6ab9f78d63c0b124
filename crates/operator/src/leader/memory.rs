//! In-memory leader elector for tests and local runs.
//!
//! No cross-process coordination: leadership is only shared between tasks of
//! one process.

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::{LeaderElector, LeadershipResult, RenewalResult};
use crate::error::{Error, Result};

#[derive(Debug, Clone)]
struct Held {
    identity: String,
    token: String,
    expires_at: DateTime<Utc>,
}

#[derive(Debug)]
pub struct InMemoryLeaderElector {
    leases: RwLock<HashMap<String, Held>>,
    lease_duration: Duration,
}

impl Default for InMemoryLeaderElector {
    fn default() -> Self {
        Self::new(Duration::from_secs(15))
    }
}

fn poison_err<T>(_: PoisonError<T>) -> Error {
    Error::LeaderElection("lock poisoned".into())
}

impl InMemoryLeaderElector {
    #[must_use]
    pub fn new(lease_duration: Duration) -> Self {
        Self { leases: RwLock::new(HashMap::new()), lease_duration }
    }

    fn expiry(&self) -> DateTime<Utc> {
        Utc::now() + chrono::Duration::from_std(self.lease_duration).unwrap_or(chrono::Duration::seconds(15))
    }

    /// Hands the lease to `identity` regardless of the current holder.
    pub fn force_leader(&self, lock_key: &str, identity: &str) {
        let held = Held { identity: identity.to_string(), token: uuid::Uuid::new_v4().to_string(), expires_at: self.expiry() };
        if let Ok(mut leases) = self.leases.write() {
            leases.insert(lock_key.to_string(), held);
        }
    }
}

#[async_trait]
impl LeaderElector for InMemoryLeaderElector {
    async fn try_acquire(&self, lock_key: &str, identity: &str) -> Result<LeadershipResult> {
        let mut leases = self.leases.write().map_err(poison_err)?;
        if let Some(held) = leases.get(lock_key) {
            if held.expires_at > Utc::now() && held.identity != identity {
                return Ok(LeadershipResult::NotLeader { current_leader: Some(held.identity.clone()) });
            }
        }
        let held = Held { identity: identity.to_string(), token: uuid::Uuid::new_v4().to_string(), expires_at: self.expiry() };
        let token = held.token.clone();
        leases.insert(lock_key.to_string(), held);
        Ok(LeadershipResult::Acquired { lease_token: token, lease_duration: self.lease_duration })
    }

    async fn renew(&self, lock_key: &str, lease_token: &str) -> Result<RenewalResult> {
        let expires_at = self.expiry();
        let mut leases = self.leases.write().map_err(poison_err)?;
        match leases.get_mut(lock_key) {
            Some(held) if held.token == lease_token && held.expires_at > Utc::now() => {
                held.expires_at = expires_at;
                Ok(RenewalResult::Renewed { lease_duration: self.lease_duration })
            }
            _ => Ok(RenewalResult::Lost),
        }
    }

    async fn release(&self, lock_key: &str, lease_token: &str) -> Result<bool> {
        let mut leases = self.leases.write().map_err(poison_err)?;
        match leases.get(lock_key) {
            Some(held) if held.token == lease_token => {
                leases.remove(lock_key);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn current_leader(&self, lock_key: &str) -> Result<Option<String>> {
        let leases = self.leases.read().map_err(poison_err)?;
        Ok(leases.get(lock_key).filter(|h| h.expires_at > Utc::now()).map(|h| h.identity.clone()))
    }
}
