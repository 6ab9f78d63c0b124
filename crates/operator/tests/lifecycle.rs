use std::sync::Arc;
use std::time::Duration;

use observability_operator::shutdown::{Phase, TerminationSignal};
use observability_operator::test_support::{test_options, Call, Failure, ProbeRunnable, RecordingClient};
use observability_operator::{run, CreatePolicy, Error, Manager, ObjectKey, Scheme, SingletonDescriptor, TerminationHandler};

fn singleton_key() -> ObjectKey {
    ObjectKey { kind: "Observability".into(), name: "managed-services-observability".into(), namespace: "openshift-monitoring".into() }
}

fn manager(client: RecordingClient, probe: &ProbeRunnable) -> Manager<RecordingClient> {
    let scheme = Arc::new(Scheme::with_defaults().unwrap());
    let mut mgr = Manager::with_client(client, scheme, test_options()).unwrap();
    mgr.add("probe", probe.boxed()).unwrap();
    mgr
}

async fn wait_for(mut cond: impl FnMut() -> bool) {
    for _ in 0..200 {
        if cond() { return; }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached");
}

#[tokio::test]
async fn signal_deletes_singleton_created_at_startup() {
    let client = RecordingClient::new();
    let probe = ProbeRunnable::new("probe");
    let handler = TerminationHandler::new();
    let task = {
        let (mgr, handler) = (manager(client.clone(), &probe), handler.clone());
        tokio::spawn(async move { run(mgr, &handler, &SingletonDescriptor::default(), CreatePolicy::Strict).await })
    };
    wait_for(|| probe.starts() == 1).await;
    assert_eq!(client.creates(), vec![singleton_key()]);
    assert!(client.deletes().is_empty());
    assert!(client.contains(&singleton_key()));

    handler.trigger(TerminationSignal::Interrupt);
    task.await.unwrap().unwrap();
    assert_eq!(handler.phase(), Phase::Terminating);
    assert_eq!(client.creates(), vec![singleton_key()]);
    assert_eq!(client.deletes(), vec![singleton_key()]);
    assert!(!client.contains(&singleton_key()));
    assert!(probe.stopped());
}

#[tokio::test]
async fn run_returns_only_after_delete_completes() {
    let client = RecordingClient::new().delete_delay(Duration::from_millis(150));
    let probe = ProbeRunnable::new("probe");
    let handler = TerminationHandler::new();
    handler.trigger(TerminationSignal::Terminate);
    run(manager(client.clone(), &probe), &handler, &SingletonDescriptor::default(), CreatePolicy::Strict).await.unwrap();
    assert_eq!(client.deletes(), vec![singleton_key()]);
}

#[tokio::test]
async fn create_failure_never_starts_manager() {
    let client = RecordingClient::new().fail_create(Failure::Server("apiserver unavailable".into()));
    let probe = ProbeRunnable::new("probe").ungated();
    let handler = TerminationHandler::new();
    let err = run(manager(client.clone(), &probe), &handler, &SingletonDescriptor::default(), CreatePolicy::Strict).await.unwrap_err();
    assert!(matches!(err, Error::Bootstrap { .. }), "{err}");
    assert_eq!(err.exit_code(), 1);
    assert_eq!(probe.starts(), 0);
    assert_eq!(client.creates().len(), 1);
    assert!(client.deletes().is_empty());
}

#[tokio::test]
async fn delete_failure_keeps_clean_exit() {
    let client = RecordingClient::new().fail_delete(Failure::Server("forbidden".into()));
    let probe = ProbeRunnable::new("probe");
    let handler = TerminationHandler::new();
    handler.trigger(TerminationSignal::Requested);
    let res = run(manager(client.clone(), &probe), &handler, &SingletonDescriptor::default(), CreatePolicy::Strict).await;
    assert!(res.is_ok());
    assert_eq!(client.deletes().len(), 1);
}

#[tokio::test]
async fn delete_failure_does_not_mask_manager_error() {
    let client = RecordingClient::new().fail_delete(Failure::Server("forbidden".into()));
    let probe = ProbeRunnable::new("probe").fail_after(Duration::from_millis(20));
    let handler = TerminationHandler::new();
    let err = run(manager(client.clone(), &probe), &handler, &SingletonDescriptor::default(), CreatePolicy::Strict).await.unwrap_err();
    assert!(matches!(err, Error::Runnable { .. }), "{err}");
    assert_eq!(client.deletes(), vec![singleton_key()]);
}

#[tokio::test]
async fn manager_error_still_cleans_up() {
    let client = RecordingClient::new();
    let probe = ProbeRunnable::new("probe").fail_after(Duration::from_millis(20));
    let handler = TerminationHandler::new();
    let res = run(manager(client.clone(), &probe), &handler, &SingletonDescriptor::default(), CreatePolicy::Strict).await;
    assert!(res.is_err());
    assert_eq!(handler.phase(), Phase::Running);
    assert_eq!(client.deletes(), vec![singleton_key()]);
}

#[tokio::test]
async fn panicking_runnable_still_cleans_up() {
    let client = RecordingClient::new();
    let probe = ProbeRunnable::new("probe").panic_after(Duration::from_millis(10));
    let handler = TerminationHandler::new();
    let res = run(manager(client.clone(), &probe), &handler, &SingletonDescriptor::default(), CreatePolicy::Strict).await;
    assert!(res.is_err());
    assert_eq!(client.deletes(), vec![singleton_key()]);
}

#[tokio::test]
async fn leftover_singleton_is_fatal_when_strict() {
    let client = RecordingClient::new();
    let leftover = SingletonDescriptor::default().build();
    observability_operator::DataClient::create(&client, &leftover).await.unwrap();

    let probe = ProbeRunnable::new("probe");
    let err = run(manager(client.clone(), &probe), &TerminationHandler::new(), &SingletonDescriptor::default(), CreatePolicy::Strict).await.unwrap_err();
    assert!(err.is_already_exists());
    assert_eq!(probe.starts(), 0);
}

#[tokio::test]
async fn leftover_singleton_is_adopted_on_request() {
    let client = RecordingClient::new();
    let leftover = SingletonDescriptor::default().build();
    observability_operator::DataClient::create(&client, &leftover).await.unwrap();

    let probe = ProbeRunnable::new("probe");
    let handler = TerminationHandler::new();
    handler.trigger(TerminationSignal::Requested);
    run(manager(client.clone(), &probe), &handler, &SingletonDescriptor::default(), CreatePolicy::AdoptExisting).await.unwrap();
    assert_eq!(client.creates().len(), 2);
    assert!(client.calls().contains(&Call::Get(singleton_key())));
    assert_eq!(client.deletes(), vec![singleton_key()]);
    assert!(!client.contains(&singleton_key()));
}
