//! Test doubles shared by unit and integration tests: an in-memory
//! [`DataClient`] that records every call, probe runnables, and manager
//! options that keep tests off real ports.
pub mod api_server;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::client::{ClusterObject, DataClient, ObjectKey};
use crate::error::{Error, Result};
use crate::manager::{ManagerOptions, Runnable};
use crate::scheme::Scheme;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Create(ObjectKey),
    Delete(ObjectKey),
    Get(ObjectKey),
}

/// Failure a [`RecordingClient`] can be told to return.
#[derive(Debug, Clone)]
pub enum Failure {
    AlreadyExists,
    Server(String),
}

impl Failure {
    fn to_error(&self, key: &ObjectKey) -> Error {
        match self {
            Self::AlreadyExists => Error::AlreadyExists { kind: key.kind.clone(), name: key.name.clone(), namespace: key.namespace.clone() },
            Self::Server(msg) => Error::Connection(msg.clone()),
        }
    }
}

#[derive(Default)]
struct State {
    calls: Vec<Call>,
    objects: HashMap<ObjectKey, serde_json::Value>,
    fail_create: Option<Failure>,
    fail_delete: Option<Failure>,
    delete_delay: Option<Duration>,
}

#[derive(Clone, Default)]
pub struct RecordingClient {
    state: Arc<Mutex<State>>,
    scheme: Option<Arc<Scheme>>,
}

impl RecordingClient {
    pub fn new() -> Self { Self::default() }

    /// Refuses kinds missing from `scheme`, like the real client.
    pub fn with_scheme(scheme: Arc<Scheme>) -> Self { Self { scheme: Some(scheme), ..Self::default() } }

    pub fn fail_create(self, failure: Failure) -> Self { self.state.lock().unwrap().fail_create = Some(failure); self }

    pub fn fail_delete(self, failure: Failure) -> Self { self.state.lock().unwrap().fail_delete = Some(failure); self }

    /// Delete calls complete only after `delay`; the call is recorded on completion.
    pub fn delete_delay(self, delay: Duration) -> Self { self.state.lock().unwrap().delete_delay = Some(delay); self }

    pub fn calls(&self) -> Vec<Call> { self.state.lock().unwrap().calls.clone() }

    pub fn creates(&self) -> Vec<ObjectKey> {
        self.calls().into_iter().filter_map(|c| match c { Call::Create(k) => Some(k), _ => None }).collect()
    }

    pub fn deletes(&self) -> Vec<ObjectKey> {
        self.calls().into_iter().filter_map(|c| match c { Call::Delete(k) => Some(k), _ => None }).collect()
    }

    pub fn contains(&self, key: &ObjectKey) -> bool { self.state.lock().unwrap().objects.contains_key(key) }

    fn check_scheme<K: ClusterObject>(&self) -> Result<()> {
        match &self.scheme {
            Some(scheme) => scheme.require::<K>(),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl DataClient for RecordingClient {
    async fn create<K: ClusterObject>(&self, obj: &K) -> Result<K> {
        self.check_scheme::<K>()?;
        let key = ObjectKey::of(obj);
        let mut state = self.state.lock().unwrap();
        state.calls.push(Call::Create(key.clone()));
        if let Some(f) = &state.fail_create {
            return Err(f.to_error(&key));
        }
        if state.objects.contains_key(&key) {
            return Err(Failure::AlreadyExists.to_error(&key));
        }
        let value = serde_json::to_value(obj).map_err(|e| Error::Connection(e.to_string()))?;
        state.objects.insert(key, value);
        Ok(obj.clone())
    }

    async fn delete<K: ClusterObject>(&self, obj: &K) -> Result<()> {
        self.check_scheme::<K>()?;
        let key = ObjectKey::of(obj);
        let delay = self.state.lock().unwrap().delete_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let mut state = self.state.lock().unwrap();
        state.calls.push(Call::Delete(key.clone()));
        if let Some(f) = &state.fail_delete {
            return Err(f.to_error(&key));
        }
        state.objects.remove(&key);
        Ok(())
    }

    async fn get<K: ClusterObject>(&self, name: &str, namespace: &str) -> Result<Option<K>> {
        self.check_scheme::<K>()?;
        let key = ObjectKey { kind: K::kind(&()).into_owned(), name: name.into(), namespace: namespace.into() };
        let mut state = self.state.lock().unwrap();
        state.calls.push(Call::Get(key.clone()));
        match state.objects.get(&key) {
            Some(v) => Ok(Some(serde_json::from_value(v.clone()).map_err(|e| Error::Connection(e.to_string()))?)),
            None => Ok(None),
        }
    }
}

/// Runnable that records when it starts and either waits for shutdown or
/// fails after a delay.
#[derive(Clone)]
pub struct ProbeRunnable {
    name: String,
    gated: bool,
    fail_after: Option<Duration>,
    panic_after: Option<Duration>,
    starts: Arc<AtomicUsize>,
    stopped: Arc<AtomicBool>,
}

impl ProbeRunnable {
    pub fn new(name: &str) -> Self {
        Self { name: name.into(), gated: true, fail_after: None, panic_after: None, starts: Arc::default(), stopped: Arc::default() }
    }

    pub fn ungated(mut self) -> Self { self.gated = false; self }

    pub fn fail_after(mut self, delay: Duration) -> Self { self.fail_after = Some(delay); self }

    pub fn panic_after(mut self, delay: Duration) -> Self { self.panic_after = Some(delay); self }

    pub fn starts(&self) -> usize { self.starts.load(Ordering::SeqCst) }

    pub fn stopped(&self) -> bool { self.stopped.load(Ordering::SeqCst) }

    pub fn boxed(&self) -> Box<dyn Runnable> { Box::new(self.clone()) }
}

#[async_trait]
impl Runnable for ProbeRunnable {
    fn name(&self) -> &str { &self.name }

    fn needs_leader_election(&self) -> bool { self.gated }

    async fn run(self: Box<Self>, shutdown: CancellationToken) -> Result<()> {
        self.starts.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.panic_after {
            tokio::time::sleep(delay).await;
            panic!("probe runnable {} panicked", self.name);
        }
        let res = match self.fail_after {
            Some(delay) => tokio::select! {
                _ = shutdown.cancelled() => Ok(()),
                _ = tokio::time::sleep(delay) => Err(Error::runnable(self.name.clone(), "probe failure")),
            },
            None => {
                shutdown.cancelled().await;
                Ok(())
            }
        };
        self.stopped.store(true, Ordering::SeqCst);
        res
    }
}

/// Manager options with both HTTP endpoints disabled and fast election timing.
pub fn test_options() -> ManagerOptions {
    ManagerOptions {
        metrics_bind_address: "0".into(),
        health_probe_bind_address: "0".into(),
        lease_duration: Duration::from_millis(300),
        renew_deadline: Duration::from_millis(200),
        retry_period: Duration::from_millis(20),
        ..ManagerOptions::default()
    }
}
