//! Termination handling and singleton cleanup.
//!
//! [`TerminationHandler`] moves once from [`Phase::Running`] to
//! [`Phase::Terminating`] on SIGINT/SIGTERM (or [`TerminationHandler::trigger`])
//! and cancels the token the manager runs under. [`supervise`] wraps
//! [`Manager::start`] so that the singleton is deleted on every way out.
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::client::{DataClient, ObjectKey};
use crate::crd::Observability;
use crate::error::{Error, Result};
use crate::manager::Manager;
use crate::telemetry::record_singleton_op;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Running,
    Terminating,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminationSignal {
    Interrupt,
    Terminate,
    /// Programmatic request, e.g. from a test.
    Requested,
}

impl TerminationSignal {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Interrupt => "SIGINT",
            Self::Terminate => "SIGTERM",
            Self::Requested => "requested",
        }
    }
}

#[derive(Debug, Clone)]
pub struct TerminationHandler {
    token: CancellationToken,
    terminating: Arc<AtomicBool>,
}

impl Default for TerminationHandler {
    fn default() -> Self { Self::new() }
}

impl TerminationHandler {
    pub fn new() -> Self { Self { token: CancellationToken::new(), terminating: Arc::new(AtomicBool::new(false)) } }

    pub fn phase(&self) -> Phase {
        if self.terminating.load(Ordering::Acquire) { Phase::Terminating } else { Phase::Running }
    }

    /// Token cancelled on the transition to [`Phase::Terminating`].
    pub fn token(&self) -> CancellationToken { self.token.clone() }

    /// Performs the transition. Returns false if it had already happened.
    pub fn trigger(&self, signal: TerminationSignal) -> bool {
        if self.terminating.swap(true, Ordering::AcqRel) {
            return false;
        }
        info!(target: "shutdown", signal = signal.as_str(), "termination requested, stopping manager");
        self.token.cancel();
        true
    }

    pub async fn terminated(&self) { self.token.cancelled().await }

    /// Listens for SIGINT and SIGTERM. The first one triggers termination; a
    /// second one exits the process with status 1 without waiting for cleanup.
    pub fn install(&self) -> Result<JoinHandle<()>> {
        let handler = self.clone();
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            let mut sigterm = signal(SignalKind::terminate())?;
            let mut sigint = signal(SignalKind::interrupt())?;
            Ok(tokio::spawn(async move {
                let received = tokio::select! {
                    _ = sigterm.recv() => TerminationSignal::Terminate,
                    _ = sigint.recv() => TerminationSignal::Interrupt,
                };
                handler.trigger(received);
                tokio::select! {
                    _ = sigterm.recv() => {}
                    _ = sigint.recv() => {}
                }
                error!(target: "shutdown", "second termination signal received, exiting immediately");
                std::process::exit(1);
            }))
        }
        #[cfg(not(unix))]
        {
            Ok(tokio::spawn(async move {
                if let Err(e) = tokio::signal::ctrl_c().await {
                    error!(target: "shutdown", error = %e, "failed to listen for Ctrl+C");
                    return;
                }
                handler.trigger(TerminationSignal::Interrupt);
                if tokio::signal::ctrl_c().await.is_ok() {
                    error!(target: "shutdown", "second termination signal received, exiting immediately");
                    std::process::exit(1);
                }
            }))
        }
    }
}

/// Responsibility for deleting the singleton.
///
/// [`SingletonGuard::release`] deletes it in place. A guard dropped without
/// release (its owner was cancelled or panicked) spawns the delete on the
/// current runtime instead.
pub struct SingletonGuard<C: DataClient> {
    client: C,
    object: Option<Observability>,
}

impl<C: DataClient> SingletonGuard<C> {
    pub fn new(client: C, object: Observability) -> Self { Self { client, object: Some(object) } }

    pub async fn release(mut self) {
        if let Some(obj) = self.object.take() {
            delete_singleton(&self.client, &obj).await;
        }
    }
}

impl<C: DataClient> Drop for SingletonGuard<C> {
    fn drop(&mut self) {
        let Some(obj) = self.object.take() else { return };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let client = self.client.clone();
                handle.spawn(async move { delete_singleton(&client, &obj).await });
            }
            Err(_) => warn!(target: "shutdown", key = %ObjectKey::of(&obj), "no runtime left, singleton not deleted"),
        }
    }
}

async fn delete_singleton<C: DataClient>(client: &C, obj: &Observability) {
    let key = ObjectKey::of(obj);
    info!(target: "shutdown", kind = %key.kind, name = %key.name, namespace = %key.namespace, "deleting singleton");
    match client.delete(obj).await {
        Ok(()) => record_singleton_op("delete", true),
        Err(e) => {
            record_singleton_op("delete", false);
            warn!(target: "shutdown", kind = %key.kind, name = %key.name, namespace = %key.namespace, error = %e, "failed to delete singleton");
        }
    }
}

/// Runs `manager` under `handler` and deletes `singleton` once the manager
/// has stopped, whether it stopped cleanly, failed or panicked.
///
/// The returned value is the manager's own outcome; a failed delete is
/// logged and never changes it.
pub async fn supervise<C: DataClient>(manager: Manager<C>, singleton: Observability, handler: &TerminationHandler) -> Result<()> {
    let guard = SingletonGuard::new(manager.client().clone(), singleton);
    let outcome = match tokio::spawn(manager.start(handler.token())).await {
        Ok(res) => res,
        Err(join_err) => Err(Error::runnable("manager", join_err)),
    };
    if handler.phase() == Phase::Terminating {
        info!(target: "shutdown", "termination received, deleting Observability CR");
    } else {
        info!(target: "shutdown", "manager exited, deleting Observability CR");
    }
    guard.release().await;
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trigger_is_one_way() {
        let handler = TerminationHandler::new();
        assert_eq!(handler.phase(), Phase::Running);
        assert!(handler.trigger(TerminationSignal::Interrupt));
        assert!(!handler.trigger(TerminationSignal::Terminate));
        assert_eq!(handler.phase(), Phase::Terminating);
        assert!(handler.token().is_cancelled());
    }

    #[tokio::test]
    async fn terminated_resolves_after_trigger() {
        let handler = TerminationHandler::new();
        let waiter = {
            let handler = handler.clone();
            tokio::spawn(async move { handler.terminated().await })
        };
        handler.trigger(TerminationSignal::Requested);
        waiter.await.unwrap();
    }
}
