//! Leader election on a `coordination.k8s.io/v1` Lease.
//!
//! The lease token is the holder identity. Writes go through `replace` with
//! the fetched `resourceVersion`, so two candidates racing for an expired
//! lease cannot both win.
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::coordination::v1::{Lease, LeaseSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{MicroTime, ObjectMeta};
use chrono::Utc;
use kube::api::PostParams;
use kube::{Api, Client};
use tracing::debug;

use super::{LeaderElector, LeadershipResult, RenewalResult};
use crate::error::Result;

pub struct LeaseElector {
    api: Api<Lease>,
    lease_duration: Duration,
}

impl LeaseElector {
    pub fn new(client: Client, namespace: &str, lease_duration: Duration) -> Self {
        Self { api: Api::namespaced(client, namespace), lease_duration }
    }

    fn duration_secs(&self) -> i32 { lease_seconds(self.lease_duration) }

    fn fresh_spec(&self, identity: &str, transitions: i32) -> LeaseSpec {
        let now = MicroTime(Utc::now());
        LeaseSpec {
            holder_identity: Some(identity.to_string()),
            lease_duration_seconds: Some(self.duration_secs()),
            acquire_time: Some(now.clone()),
            renew_time: Some(now),
            lease_transitions: Some(transitions),
            ..LeaseSpec::default()
        }
    }
}

/// `leaseDurationSeconds` for `d`: at least one second, saturating at `i32::MAX`.
fn lease_seconds(d: Duration) -> i32 { i32::try_from(d.as_secs().max(1)).unwrap_or(i32::MAX) }

fn holder(lease: &Lease) -> Option<&str> {
    lease.spec.as_ref().and_then(|s| s.holder_identity.as_deref()).filter(|h| !h.is_empty())
}

pub(crate) fn is_expired(spec: &LeaseSpec) -> bool {
    let Some(renewed) = spec.renew_time.as_ref() else { return true };
    let secs = i64::from(spec.lease_duration_seconds.unwrap_or(0));
    renewed.0 + chrono::Duration::seconds(secs) < Utc::now()
}

fn is_conflict(e: &kube::Error) -> bool {
    matches!(e, kube::Error::Api(ae) if ae.code == 409)
}

#[async_trait]
impl LeaderElector for LeaseElector {
    async fn try_acquire(&self, lock_key: &str, identity: &str) -> Result<LeadershipResult> {
        let acquired = LeadershipResult::Acquired { lease_token: identity.to_string(), lease_duration: self.lease_duration };
        let Some(mut lease) = self.api.get_opt(lock_key).await? else {
            let lease = Lease {
                metadata: ObjectMeta { name: Some(lock_key.to_string()), ..ObjectMeta::default() },
                spec: Some(self.fresh_spec(identity, 0)),
            };
            return match self.api.create(&PostParams::default(), &lease).await {
                Ok(_) => Ok(acquired),
                Err(e) if is_conflict(&e) => Ok(LeadershipResult::NotLeader { current_leader: None }),
                Err(e) => Err(e.into()),
            };
        };
        let spec = lease.spec.clone().unwrap_or_default();
        let current = holder(&lease).map(str::to_string);
        if current.as_deref() != Some(identity) && current.is_some() && !is_expired(&spec) {
            return Ok(LeadershipResult::NotLeader { current_leader: current });
        }
        let transitions = spec.lease_transitions.unwrap_or(0) + i32::from(current.as_deref() != Some(identity));
        let mut next = self.fresh_spec(identity, transitions);
        if current.as_deref() == Some(identity) {
            next.acquire_time = spec.acquire_time.clone();
        }
        lease.spec = Some(next);
        match self.api.replace(lock_key, &PostParams::default(), &lease).await {
            Ok(_) => Ok(acquired),
            Err(e) if is_conflict(&e) => {
                debug!(target: "leader", lease = lock_key, "lost race for lease");
                Ok(LeadershipResult::NotLeader { current_leader: current })
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn renew(&self, lock_key: &str, lease_token: &str) -> Result<RenewalResult> {
        let Some(mut lease) = self.api.get_opt(lock_key).await? else { return Ok(RenewalResult::Lost) };
        if holder(&lease) != Some(lease_token) {
            return Ok(RenewalResult::Lost);
        }
        if let Some(spec) = lease.spec.as_mut() {
            spec.renew_time = Some(MicroTime(Utc::now()));
            spec.lease_duration_seconds = Some(self.duration_secs());
        }
        self.api.replace(lock_key, &PostParams::default(), &lease).await?;
        Ok(RenewalResult::Renewed { lease_duration: self.lease_duration })
    }

    async fn release(&self, lock_key: &str, lease_token: &str) -> Result<bool> {
        let Some(mut lease) = self.api.get_opt(lock_key).await? else { return Ok(false) };
        if holder(&lease) != Some(lease_token) {
            return Ok(false);
        }
        if let Some(spec) = lease.spec.as_mut() {
            spec.holder_identity = None;
            spec.renew_time = None;
            spec.acquire_time = None;
            spec.lease_duration_seconds = Some(1);
        }
        match self.api.replace(lock_key, &PostParams::default(), &lease).await {
            Ok(_) => Ok(true),
            Err(e) if is_conflict(&e) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn current_leader(&self, lock_key: &str) -> Result<Option<String>> {
        let lease = self.api.get_opt(lock_key).await?;
        Ok(lease.as_ref().filter(|l| l.spec.as_ref().is_some_and(|s| !is_expired(s))).and_then(holder).map(str::to_string))
    }
}
