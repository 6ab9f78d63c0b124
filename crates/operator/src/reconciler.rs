//! Reconciler registration.
//!
//! A [`Reconciler`] binds itself into the manager's dispatch table once,
//! after the manager is built and before it starts.
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use futures_util::StreamExt;
use kube::api::{Patch, PatchParams};
use kube::{Api, Client, ResourceExt};
use kube_runtime::controller::{Action, Controller};
use kube_runtime::watcher;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::client::DataClient;
use crate::crd::{Observability, ObservabilityStatus, KIND};
use crate::error::{Error, Result};
use crate::manager::{Manager, Runnable};
use crate::telemetry::RECONCILE_TOTAL;

const LOG_TARGET: &str = "controllers::observability";

pub trait Reconciler {
    /// Registers the reconciler with `mgr`. Fails when the watched kind is
    /// missing from the manager's scheme or already has a controller.
    fn setup_with_manager<C: DataClient>(self, mgr: &mut Manager<C>) -> Result<()>;
}

/// Keeps `status` of every `Observability` object in step with its
/// generation.
pub struct ObservabilityReconciler {
    client: Client,
}

impl ObservabilityReconciler {
    pub fn new(client: Client) -> Self { Self { client } }
}

impl Reconciler for ObservabilityReconciler {
    fn setup_with_manager<C: DataClient>(self, mgr: &mut Manager<C>) -> Result<()> {
        mgr.scheme().require::<Observability>().map_err(|e| Error::Registration { controller: KIND.into(), reason: e.to_string() })?;
        mgr.add(KIND, Box::new(ObservabilityController { client: self.client }))
    }
}

struct Context {
    client: Client,
}

struct ObservabilityController {
    client: Client,
}

#[async_trait]
impl Runnable for ObservabilityController {
    fn name(&self) -> &str { KIND }

    async fn run(self: Box<Self>, shutdown: CancellationToken) -> Result<()> {
        let api: Api<Observability> = Api::all(self.client.clone());
        let ctx = Arc::new(Context { client: self.client });
        let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
        tokio::spawn(async move {
            shutdown.cancelled().await;
            let _ = stop_tx.send(());
        });
        info!(target: LOG_TARGET, "starting controller");
        Controller::new(api, watcher::Config::default())
            .graceful_shutdown_on(async move {
                let _ = stop_rx.await;
            })
            .run(reconcile, error_policy, ctx)
            .for_each(|res| async move {
                match res {
                    Ok((obj, _)) => debug!(target: LOG_TARGET, name = %obj.name, namespace = ?obj.namespace, "reconciled"),
                    Err(e) => debug!(target: LOG_TARGET, error = %e, "reconcile dispatch error"),
                }
            })
            .await;
        info!(target: LOG_TARGET, "controller stopped");
        Ok(())
    }
}

async fn reconcile(obj: Arc<Observability>, ctx: Arc<Context>) -> Result<Action> {
    let name = obj.name_any();
    let namespace = obj.namespace().unwrap_or_default();
    if obj.metadata.deletion_timestamp.is_some() {
        debug!(target: LOG_TARGET, name = %name, namespace = %namespace, "object is being deleted");
        return Ok(Action::await_change());
    }
    if !needs_status_update(&obj) {
        debug!(target: LOG_TARGET, name = %name, namespace = %namespace, generation = ?obj.metadata.generation, "status up to date");
        RECONCILE_TOTAL.with_label_values(&["success"]).inc();
        return Ok(Action::requeue(Duration::from_secs(300)));
    }
    info!(target: LOG_TARGET, name = %name, namespace = %namespace, "reconciling");
    let status = status_for(&obj);
    let api: Api<Observability> = Api::namespaced(ctx.client.clone(), &namespace);
    match api.patch_status(&name, &PatchParams::default(), &Patch::Merge(json!({ "status": status }))).await {
        Ok(_) => {}
        Err(kube::Error::Api(ae)) if ae.code == 404 => {
            debug!(target: LOG_TARGET, name = %name, namespace = %namespace, "object gone before status update");
            return Ok(Action::await_change());
        }
        Err(e) => return Err(e.into()),
    }
    RECONCILE_TOTAL.with_label_values(&["success"]).inc();
    Ok(Action::requeue(Duration::from_secs(300)))
}

/// The status write itself produces a watch event, so it is only issued when
/// the observed generation is behind.
fn needs_status_update(obj: &Observability) -> bool {
    obj.status.as_ref().map_or(true, |s| s.observed_generation != obj.metadata.generation)
}

fn status_for(obj: &Observability) -> ObservabilityStatus {
    ObservabilityStatus { observed_generation: obj.metadata.generation, last_reconcile: Some(Utc::now().to_rfc3339()) }
}

fn error_policy(obj: Arc<Observability>, err: &Error, _ctx: Arc<Context>) -> Action {
    RECONCILE_TOTAL.with_label_values(&["error"]).inc();
    warn!(target: LOG_TARGET, name = %obj.name_any(), error = %err, "reconcile failed");
    Action::requeue(Duration::from_secs(30))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::ObservabilitySpec;
    use crate::singleton::SingletonDescriptor;
    use crate::test_support::api_server::FakeApiServer;

    const COLLECTION: &str = "/apis/observability.redhat.com/v1/namespaces/openshift-monitoring/observabilities";
    const STATUS: &str = "/observabilities/managed-services-observability/status";

    #[test]
    fn status_tracks_generation() {
        let mut obj = Observability::new("managed-services-observability", ObservabilitySpec::default());
        obj.metadata.generation = Some(3);
        let status = status_for(&obj);
        assert_eq!(status.observed_generation, Some(3));
        assert!(status.last_reconcile.is_some());
    }

    #[tokio::test]
    async fn failed_reconcile_requeues() {
        let client = Client::try_from(kube::Config::new("http://127.0.0.1:1".parse().unwrap())).unwrap();
        let ctx = Arc::new(Context { client });
        let obj = Arc::new(Observability::new("x", ObservabilitySpec::default()));
        let action = error_policy(obj, &Error::Connection("down".into()), ctx);
        assert_eq!(action, Action::requeue(Duration::from_secs(30)));
    }

    #[test]
    fn status_update_only_when_generation_moves() {
        let mut obj = Observability::new("x", ObservabilitySpec::default());
        obj.metadata.generation = Some(2);
        assert!(needs_status_update(&obj));
        obj.status = Some(ObservabilityStatus { observed_generation: Some(1), last_reconcile: None });
        assert!(needs_status_update(&obj));
        obj.status = Some(status_for(&obj));
        assert!(!needs_status_update(&obj));
    }

    #[tokio::test]
    async fn status_write_does_not_retrigger_reconcile() {
        let server = FakeApiServer::start().await.unwrap();
        server.seed(COLLECTION, serde_json::to_value(SingletonDescriptor::default().build()).unwrap());

        let controller = Box::new(ObservabilityController { client: server.client().unwrap() });
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(controller.run(shutdown.clone()));

        for _ in 0..500 {
            if server.requests("PATCH", STATUS) > 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(server.requests("PATCH", STATUS), 1, "one status write per generation");
        let stored = server.object(&format!("{COLLECTION}/managed-services-observability")).unwrap();
        assert_eq!(stored["status"]["observedGeneration"], 1);

        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(5), task).await.unwrap().unwrap().unwrap();
    }
}
