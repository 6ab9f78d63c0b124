//! Bootstrap and lifecycle shell for the managed-services Observability
//! operator.
//!
//! Startup is strictly sequential and every step is fatal on failure:
//! scheme → manager → reconciler registration → singleton creation →
//! [`Manager::start`] under [`shutdown::supervise`], which deletes the
//! singleton again once the manager stops.
pub mod client;
pub mod config;
pub mod crd;
pub mod error;
pub mod health;
pub mod leader;
pub mod logging;
pub mod manager;
pub mod reconciler;
pub mod scheme;
pub mod shutdown;
pub mod singleton;
pub mod telemetry;
pub mod test_support;

use std::sync::Arc;

use tracing::{error, info};

pub use client::{DataClient, KubeClient, ObjectKey};
pub use crd::{Observability, ObservabilitySpec, ObservabilityStatus};
pub use error::{Error, Result};
pub use manager::{Manager, ManagerOptions, Runnable};
pub use scheme::Scheme;
pub use shutdown::{supervise, TerminationHandler};
pub use singleton::{CreatePolicy, SingletonDescriptor};

use config::Cli;
use reconciler::{ObservabilityReconciler, Reconciler};

fn fatal(msg: &'static str) -> impl FnOnce(Error) -> Error {
    move |e| {
        error!(target: "setup", error = %e, "{msg}");
        e
    }
}

/// Creates the singleton through the manager's client, then runs the
/// manager under `handler`. The manager never starts if the create fails.
pub async fn run<C: DataClient>(manager: Manager<C>, handler: &TerminationHandler, descriptor: &SingletonDescriptor, policy: CreatePolicy) -> Result<()> {
    let singleton = singleton::ensure(manager.client(), descriptor, policy).await.map_err(fatal("error creating Observability CR"))?;
    info!(target: "setup", "starting manager");
    supervise(manager, singleton, handler).await.map_err(fatal("problem running manager"))
}

/// Full startup sequence for the binary.
pub async fn run_from_cli(cli: &Cli) -> Result<()> {
    let scheme = Arc::new(Scheme::with_defaults().map_err(fatal("unable to register types"))?);
    let config = kube::Config::infer().await
        .map_err(|e| Error::Connection(e.to_string()))
        .map_err(fatal("unable to start manager"))?;
    let mut mgr = Manager::new(config, scheme, cli.manager_options()).map_err(fatal("unable to start manager"))?;
    ObservabilityReconciler::new(mgr.client().inner().clone())
        .setup_with_manager(&mut mgr)
        .map_err(fatal("unable to create controller"))?;
    let handler = TerminationHandler::new();
    handler.install().map_err(fatal("unable to install signal handler"))?;
    run(mgr, &handler, &SingletonDescriptor::default(), cli.create_policy()).await
}
