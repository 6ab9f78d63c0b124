//! Control-loop manager.
//!
//! The manager owns the data-plane client, the frozen scheme and a dispatch
//! table of runnables. [`Manager::start`] consumes it and blocks until the
//! supplied token is cancelled or a runnable fails; metrics and health
//! servers, leader election and every runnable run as separate tasks.
use std::collections::BTreeMap;
use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::Router;
use k8s_openapi::api::coordination::v1::Lease;
use tokio::net::TcpListener;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::client::{DataClient, KubeClient};
use crate::error::{Error, Result};
use crate::health::health_router;
use crate::leader::{self, lease::LeaseElector, ElectionConfig, LeaderElector};
use crate::scheme::Scheme;
use crate::telemetry::metrics_router;

pub const DEFAULT_METRICS_ADDR: &str = ":8080";
pub const DEFAULT_HEALTH_PROBE_ADDR: &str = ":8081";
pub const DEFAULT_WEBHOOK_PORT: u16 = 9443;
/// Name of the Lease that redundant replicas compete for.
pub const LEADER_ELECTION_ID: &str = "04220e3f.redhat.com";

const SERVICE_ACCOUNT_NAMESPACE: &str = "/var/run/secrets/kubernetes.io/serviceaccount/namespace";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManagerOptions {
    /// `host:port` or `:port`; `0` disables the endpoint.
    pub metrics_bind_address: String,
    pub health_probe_bind_address: String,
    /// Secure webhook port. No webhooks are registered, so nothing listens here.
    pub port: u16,
    pub leader_election: bool,
    pub leader_election_id: String,
    pub leader_election_namespace: Option<String>,
    pub lease_duration: Duration,
    pub renew_deadline: Duration,
    pub retry_period: Duration,
}

impl Default for ManagerOptions {
    fn default() -> Self {
        Self {
            metrics_bind_address: DEFAULT_METRICS_ADDR.into(),
            health_probe_bind_address: DEFAULT_HEALTH_PROBE_ADDR.into(),
            port: DEFAULT_WEBHOOK_PORT,
            leader_election: false,
            leader_election_id: LEADER_ELECTION_ID.into(),
            leader_election_namespace: None,
            lease_duration: Duration::from_secs(15),
            renew_deadline: Duration::from_secs(10),
            retry_period: Duration::from_secs(2),
        }
    }
}

impl ManagerOptions {
    fn validate(&self) -> Result<()> {
        parse_bind_address(&self.metrics_bind_address)?;
        parse_bind_address(&self.health_probe_bind_address)?;
        if self.leader_election {
            if self.leader_election_id.is_empty() {
                return Err(Error::Options("leader election id must not be empty".into()));
            }
            if self.renew_deadline >= self.lease_duration {
                return Err(Error::Options("lease duration must be greater than renew deadline".into()));
            }
            if self.retry_period >= self.renew_deadline {
                return Err(Error::Options("renew deadline must be greater than retry period".into()));
            }
        }
        Ok(())
    }

    pub fn election_config(&self) -> ElectionConfig {
        ElectionConfig {
            lock_key: self.leader_election_id.clone(),
            identity: ElectionConfig::default_identity(),
            lease_duration: self.lease_duration,
            renew_deadline: self.renew_deadline,
            retry_period: self.retry_period,
        }
    }
}

/// Resolves a Go-style bind address. `:8080` binds every interface, `0` or
/// an empty string disables the endpoint.
pub fn parse_bind_address(addr: &str) -> Result<Option<SocketAddr>> {
    let addr = addr.trim();
    if addr.is_empty() || addr == "0" {
        return Ok(None);
    }
    let full = if addr.starts_with(':') { format!("0.0.0.0{addr}") } else { addr.to_string() };
    if let Ok(sa) = full.parse::<SocketAddr>() {
        return Ok(Some(sa));
    }
    full.to_socket_addrs()
        .map_err(|e| Error::Options(format!("invalid bind address {addr:?}: {e}")))?
        .next()
        .map(Some)
        .ok_or_else(|| Error::Options(format!("bind address {addr:?} resolved to nothing")))
}

/// A unit of work the manager runs for its whole lifetime.
#[async_trait]
pub trait Runnable: Send {
    fn name(&self) -> &str;

    /// Leader-gated runnables only start on the elected replica.
    fn needs_leader_election(&self) -> bool { true }

    /// Runs until `shutdown` is cancelled. Returning early with `Ok` is
    /// allowed; returning `Err` stops the manager.
    async fn run(self: Box<Self>, shutdown: CancellationToken) -> Result<()>;
}

pub struct Manager<C: DataClient> {
    client: C,
    scheme: Arc<Scheme>,
    options: ManagerOptions,
    elector: Option<Arc<dyn LeaderElector>>,
    runnables: BTreeMap<String, Box<dyn Runnable>>,
    ready: Arc<AtomicBool>,
}

impl Manager<KubeClient> {
    /// Builds a manager talking to the cluster described by `config`.
    pub fn new(config: kube::Config, scheme: Arc<Scheme>, options: ManagerOptions) -> Result<Self> {
        validate_scheme(&scheme, &options)?;
        options.validate()?;
        let client = kube::Client::try_from(config).map_err(|e| Error::Connection(e.to_string()))?;
        let elector: Option<Arc<dyn LeaderElector>> = if options.leader_election {
            let namespace = leader_election_namespace(&options)?;
            info!(target: "setup", namespace = %namespace, lease = %options.leader_election_id, "leader election enabled");
            Some(Arc::new(LeaseElector::new(client.clone(), &namespace, options.lease_duration)))
        } else {
            None
        };
        let mut mgr = Self::with_client(KubeClient::new(client, scheme.clone()), scheme, options)?;
        mgr.elector = elector;
        Ok(mgr)
    }
}

impl<C: DataClient> Manager<C> {
    /// Builds a manager around an already constructed client.
    pub fn with_client(client: C, scheme: Arc<Scheme>, options: ManagerOptions) -> Result<Self> {
        validate_scheme(&scheme, &options)?;
        options.validate()?;
        Ok(Self { client, scheme, options, elector: None, runnables: BTreeMap::new(), ready: Arc::new(AtomicBool::new(false)) })
    }

    pub fn with_elector(mut self, elector: Arc<dyn LeaderElector>) -> Self {
        self.elector = Some(elector);
        self
    }

    pub fn client(&self) -> &C { &self.client }

    pub fn scheme(&self) -> &Arc<Scheme> { &self.scheme }

    pub fn options(&self) -> &ManagerOptions { &self.options }

    pub fn runnable_names(&self) -> impl Iterator<Item = &str> { self.runnables.keys().map(String::as_str) }

    /// Adds `runnable` to the dispatch table under `key`.
    pub fn add(&mut self, key: impl Into<String>, runnable: Box<dyn Runnable>) -> Result<()> {
        let key = key.into();
        if self.runnables.contains_key(&key) {
            return Err(Error::Registration { controller: key, reason: "a runnable is already registered under this key".into() });
        }
        debug!(target: "setup", runnable = %key, "runnable registered");
        self.runnables.insert(key, runnable);
        Ok(())
    }

    /// Runs until `shutdown` is cancelled or a runnable fails.
    ///
    /// Returns `Ok(())` after a clean cancellation and the first runnable
    /// error otherwise. Every task has stopped by the time this returns.
    pub async fn start(self, shutdown: CancellationToken) -> Result<()> {
        let Manager { options, elector, runnables, ready, .. } = self;
        let stop = shutdown.child_token();
        let mut tasks: JoinSet<(String, Result<()>)> = JoinSet::new();

        {
            let stop = stop.clone();
            tasks.spawn(async move {
                stop.cancelled().await;
                ("manager".to_string(), Ok(()))
            });
        }
        if let Some(addr) = parse_bind_address(&options.metrics_bind_address)? {
            let listener = TcpListener::bind(addr).await?;
            info!(target: "setup", addr = %addr, "starting metrics server");
            tasks.spawn(serve("metrics", listener, metrics_router(), stop.clone()));
        }
        if let Some(addr) = parse_bind_address(&options.health_probe_bind_address)? {
            let listener = TcpListener::bind(addr).await?;
            info!(target: "setup", addr = %addr, "starting health probe server");
            tasks.spawn(serve("health", listener, health_router(ready.clone()), stop.clone()));
        }

        let (gated, ungated): (Vec<_>, Vec<_>) = runnables.into_values().partition(|r| r.needs_leader_election());
        for r in ungated {
            spawn_runnable(&mut tasks, r, stop.clone());
        }

        let (elected_tx, mut elected_rx) = tokio::sync::oneshot::channel::<String>();
        let mut pending = Some(gated);
        let election = if options.leader_election {
            let elector = elector.ok_or_else(|| Error::LeaderElection("leader election enabled but no elector configured".into()))?;
            let cfg = options.election_config();
            let (task_elector, task_cfg, stop) = (elector.clone(), cfg.clone(), stop.clone());
            tasks.spawn(async move {
                let res = match leader::acquire(task_elector.as_ref(), &task_cfg, &stop).await {
                    Ok(Some(token)) => {
                        let _ = elected_tx.send(token.clone());
                        leader::hold(task_elector.as_ref(), &task_cfg, &token, &stop).await
                    }
                    Ok(None) => Ok(()),
                    Err(e) => Err(e),
                };
                ("leader-election".to_string(), res)
            });
            Some((elector, cfg))
        } else {
            drop(elected_tx);
            for r in pending.take().unwrap_or_default() {
                spawn_runnable(&mut tasks, r, stop.clone());
            }
            None
        };
        ready.store(true, Ordering::Release);
        info!(target: "setup", "manager started");

        let mut lease_token: Option<String> = None;
        let mut first_err: Option<Error> = None;
        loop {
            tokio::select! {
                elected = &mut elected_rx, if pending.is_some() => {
                    let gated = pending.take().unwrap_or_default();
                    if let Ok(token) = elected {
                        lease_token = Some(token);
                        if !stop.is_cancelled() {
                            info!(target: "setup", runnables = gated.len(), "elected leader, starting leader-gated runnables");
                            for r in gated {
                                spawn_runnable(&mut tasks, r, stop.clone());
                            }
                        }
                    }
                }
                joined = tasks.join_next() => match joined {
                    None => break,
                    Some(Ok((name, Ok(())))) => debug!(target: "setup", runnable = %name, "runnable stopped"),
                    Some(Ok((name, Err(e)))) => {
                        error!(target: "setup", runnable = %name, error = %e, "runnable failed, stopping manager");
                        first_err.get_or_insert(e);
                        stop.cancel();
                    }
                    Some(Err(join_err)) => {
                        error!(target: "setup", error = %join_err, "runnable task aborted, stopping manager");
                        first_err.get_or_insert(Error::runnable("task", join_err));
                        stop.cancel();
                    }
                },
            }
        }
        if pending.is_some() {
            lease_token = lease_token.or_else(|| elected_rx.try_recv().ok());
        }
        // Every leader-gated runnable has been joined; only now may a standby take over.
        if let (Some((elector, cfg)), Some(token)) = (election, lease_token) {
            leader::release(elector.as_ref(), &cfg, &token).await;
        }
        ready.store(false, Ordering::Release);
        info!(target: "setup", "manager stopped");
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

fn validate_scheme(scheme: &Scheme, options: &ManagerOptions) -> Result<()> {
    if scheme.is_empty() {
        return Err(Error::Scheme("no kinds registered; populate the scheme before constructing the manager".into()));
    }
    if options.leader_election {
        scheme.require::<Lease>()?;
    }
    Ok(())
}

fn leader_election_namespace(options: &ManagerOptions) -> Result<String> {
    if let Some(ns) = options.leader_election_namespace.as_ref().filter(|ns| !ns.is_empty()) {
        return Ok(ns.clone());
    }
    std::fs::read_to_string(SERVICE_ACCOUNT_NAMESPACE)
        .map(|ns| ns.trim().to_string())
        .map_err(|_| Error::Options("unable to find leader election namespace: not running in-cluster, please specify --leader-election-namespace".into()))
}

fn spawn_runnable(tasks: &mut JoinSet<(String, Result<()>)>, runnable: Box<dyn Runnable>, stop: CancellationToken) {
    let name = runnable.name().to_string();
    info!(target: "setup", runnable = %name, "starting runnable");
    tasks.spawn(async move { (name, runnable.run(stop).await) });
}

async fn serve(name: &'static str, listener: TcpListener, router: Router, stop: CancellationToken) -> (String, Result<()>) {
    let res = axum::serve(listener, router)
        .with_graceful_shutdown(stop.cancelled_owned())
        .await
        .map_err(Error::from);
    (name.to_string(), res)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_operator_identity() {
        let opts = ManagerOptions::default();
        assert_eq!(opts.metrics_bind_address, ":8080");
        assert_eq!(opts.port, 9443);
        assert!(!opts.leader_election);
        assert_eq!(opts.leader_election_id, "04220e3f.redhat.com");
    }

    #[test]
    fn bind_address_forms() {
        assert_eq!(parse_bind_address(":9090").unwrap(), Some("0.0.0.0:9090".parse().unwrap()));
        assert_eq!(parse_bind_address("127.0.0.1:8080").unwrap(), Some("127.0.0.1:8080".parse().unwrap()));
        assert_eq!(parse_bind_address("0").unwrap(), None);
        assert_eq!(parse_bind_address("").unwrap(), None);
        assert!(parse_bind_address("not an address").is_err());
    }

    #[test]
    fn election_timing_is_validated() {
        let opts = ManagerOptions { leader_election: true, renew_deadline: Duration::from_secs(20), ..ManagerOptions::default() };
        assert!(matches!(opts.validate(), Err(Error::Options(_))));
        let opts = ManagerOptions { leader_election: true, leader_election_id: String::new(), ..ManagerOptions::default() };
        assert!(matches!(opts.validate(), Err(Error::Options(_))));
        assert!(ManagerOptions { leader_election: true, ..ManagerOptions::default() }.validate().is_ok());
    }

    #[test]
    fn explicit_election_namespace_wins() {
        let opts = ManagerOptions { leader_election_namespace: Some("openshift-monitoring".into()), ..ManagerOptions::default() };
        assert_eq!(leader_election_namespace(&opts).unwrap(), "openshift-monitoring");
    }
}
