//! End-to-end tests against the real `offload-worker` binary.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};

use offload::{
    DataHandler, EchoDataHandler, EndpointKind, HandshakeError, Lifecycle, Outcome, ProcessState,
    Request, Supervisor, SupervisorConfig, SupervisorError, WorkerRegistry,
};

const WORKER: &str = env!("CARGO_BIN_EXE_offload-worker");

fn config(entry_point: &str) -> SupervisorConfig {
    SupervisorConfig::new(WORKER)
        .with_entry_point(entry_point)
        .with_accept_timeout(Duration::from_secs(30))
        .with_join_timeout(Duration::from_secs(5))
}

async fn launched(entry_point: &str, data_handler: Arc<dyn DataHandler>) -> Arc<Supervisor> {
    let supervisor = Supervisor::new(config(entry_point), data_handler);
    supervisor.launch().await.expect("worker should launch");
    supervisor
}

async fn stop(supervisor: &Supervisor) -> ProcessState {
    supervisor.shutdown().await;
    supervisor.join(None).await
}

/// Records every data request and answers with a derived value.
#[derive(Default)]
struct Lookup {
    seen: Mutex<Vec<Value>>,
}

#[async_trait]
impl DataHandler for Lookup {
    async fn handle(&self, request: &Request) -> Outcome {
        self.seen.lock().unwrap().push(request.payload.clone());
        match request.payload.get("key").and_then(Value::as_str) {
            Some(key) => Outcome::Answer(json!(key.to_uppercase())),
            None => Outcome::failure("KeyError: no key given"),
        }
    }
}

#[tokio::test]
async fn echo_round_trip() {
    let supervisor = launched("echo", Arc::new(EchoDataHandler)).await;

    supervisor
        .send(Request::new(json!("Hello World!")))
        .await
        .unwrap();
    let response = supervisor.receive().await.unwrap().unwrap();
    assert_eq!(response.answer, Some(json!("Hello World!")));
    assert!(response.failure_info.is_none());

    stop(&supervisor).await;
}

#[tokio::test]
async fn echo_returns_every_payload_unchanged() {
    let supervisor = launched("echo", Arc::new(EchoDataHandler)).await;

    let payloads = [
        json!(null),
        json!(0),
        json!(-3.5),
        json!(""),
        json!("ünïcödé"),
        json!([1, [2, [3]]]),
        json!({"nested": {"list": [true, false, null]}}),
    ];
    for payload in payloads {
        let response = supervisor.call(payload.clone()).await.unwrap();
        assert!(response.failure_info.is_none());
        // A null answer arrives as `None`; `into_outcome` restores it.
        assert_eq!(response.into_outcome(), Outcome::Answer(payload));
    }

    stop(&supervisor).await;
}

#[tokio::test]
async fn shutdown_right_after_launch_exits_cleanly() {
    let supervisor = launched("echo", Arc::new(EchoDataHandler)).await;

    supervisor.shutdown().await;
    let state = supervisor.join(None).await;

    #[cfg(unix)]
    assert_eq!(state, ProcessState::Exited(0));
    #[cfg(not(unix))]
    assert!(state.is_terminal());
}

#[tokio::test]
async fn handler_error_becomes_failure_info() {
    let supervisor = launched("probe", Arc::new(EchoDataHandler)).await;

    let response = supervisor
        .call(json!({"op": "raise", "kind": "ValueError", "message": "bad payload"}))
        .await
        .unwrap();
    assert!(response.answer.is_none());
    let info = response.failure_info.unwrap();
    assert!(info.contains("ValueError"), "{info}");
    assert!(info.contains("bad payload"), "{info}");

    // Worker keeps serving.
    let response = supervisor
        .call(json!({"op": "echo", "value": "after"}))
        .await
        .unwrap();
    assert_eq!(response.answer, Some(json!("after")));

    stop(&supervisor).await;
}

#[tokio::test]
async fn handler_panic_does_not_kill_worker() {
    let supervisor = launched("probe", Arc::new(EchoDataHandler)).await;

    let response = supervisor
        .call(json!({"op": "panic", "message": "index out of range"}))
        .await
        .unwrap();
    assert!(response.failure_info.unwrap().contains("index out of range"));
    assert_eq!(supervisor.process_state(), ProcessState::Running);

    let response = supervisor
        .call(json!({"op": "echo", "value": 1}))
        .await
        .unwrap();
    assert_eq!(response.answer, Some(json!(1)));

    stop(&supervisor).await;
}

#[tokio::test]
async fn data_request_is_served_during_control_call() {
    let lookup = Arc::new(Lookup::default());
    let supervisor = launched("probe", lookup.clone()).await;

    let response = supervisor
        .call(json!({"op": "fetch", "payload": {"key": "volume"}}))
        .await
        .unwrap();
    assert_eq!(response.answer, Some(json!({"fetched": "VOLUME"})));
    assert_eq!(*lookup.seen.lock().unwrap(), vec![json!({"key": "volume"})]);

    // A failing host lookup surfaces as the control call's failure.
    let response = supervisor
        .call(json!({"op": "fetch", "payload": {}}))
        .await
        .unwrap();
    assert!(response.failure_info.unwrap().contains("KeyError"));

    stop(&supervisor).await;
}

#[tokio::test]
async fn concurrent_calls_get_their_own_answers() {
    let supervisor = launched("echo", Arc::new(EchoDataHandler)).await;

    let tasks: Vec<_> = (0..8)
        .map(|i| {
            let supervisor = Arc::clone(&supervisor);
            tokio::spawn(async move { (i, supervisor.call(json!(i)).await) })
        })
        .collect();
    for task in tasks {
        let (i, response) = task.await.unwrap();
        assert_eq!(response.unwrap().answer, Some(json!(i)));
    }

    stop(&supervisor).await;
}

#[tokio::test]
async fn shutdown_and_join_are_idempotent() {
    let supervisor = launched("echo", Arc::new(EchoDataHandler)).await;

    supervisor.shutdown().await;
    supervisor.shutdown().await;
    let first = supervisor.join(None).await;
    let second = supervisor.join(None).await;

    assert!(first.is_terminal());
    assert_eq!(first, second);
    assert_eq!(supervisor.process_state(), first);
    assert_eq!(supervisor.lifecycle(), Lifecycle::ShuttingDown);
}

#[tokio::test]
async fn channel_ops_after_shutdown_are_silent() {
    let supervisor = launched("echo", Arc::new(EchoDataHandler)).await;
    stop(&supervisor).await;

    assert!(supervisor.send(Request::new(json!(1))).await.is_ok());
    assert!(supervisor.send_stop().await.is_ok());
    assert!(matches!(supervisor.receive().await, Ok(None)));
    assert!(matches!(
        supervisor.call(json!(1)).await,
        Err(SupervisorError::ShutDown)
    ));
}

#[tokio::test]
async fn pending_receive_returns_on_shutdown() {
    let supervisor = launched("probe", Arc::new(EchoDataHandler)).await;
    supervisor
        .send(Request::new(json!({"op": "sleep", "ms": 60_000})))
        .await
        .unwrap();

    let receiver = {
        let supervisor = Arc::clone(&supervisor);
        tokio::spawn(async move { supervisor.receive().await })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;
    supervisor.shutdown().await;

    let received = tokio::time::timeout(Duration::from_secs(5), receiver)
        .await
        .expect("receive should return after shutdown")
        .unwrap();
    assert!(matches!(received, Ok(None)));
    assert!(supervisor.join(None).await.is_terminal());
}

#[cfg(unix)]
#[tokio::test]
async fn unresponsive_worker_is_killed_by_join() {
    let supervisor = launched("probe", Arc::new(EchoDataHandler)).await;

    let response = supervisor.call(json!({"op": "ignore_term"})).await.unwrap();
    assert_eq!(response.answer, Some(json!(true)));
    supervisor
        .send(Request::new(json!({"op": "sleep", "ms": 60_000})))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    supervisor.shutdown().await;
    let state = supervisor.join(Some(Duration::from_millis(300))).await;
    assert_eq!(state, ProcessState::Killed { signal: Some(9) });
}

#[tokio::test]
async fn worker_exit_surfaces_channel_closed() {
    let supervisor = launched("probe", Arc::new(EchoDataHandler)).await;

    supervisor
        .send(Request::new(json!({"op": "exit", "code": 3})))
        .await
        .unwrap();
    let err = supervisor.receive().await.unwrap_err();
    assert!(
        matches!(err, SupervisorError::ChannelClosed | SupervisorError::Channel(_)),
        "{err}"
    );

    assert_eq!(supervisor.join(None).await, ProcessState::Exited(3));
    supervisor.shutdown().await;
    assert_eq!(supervisor.join(None).await, ProcessState::Exited(3));
}

#[tokio::test]
async fn stop_sentinel_ends_worker() {
    let supervisor = launched("echo", Arc::new(EchoDataHandler)).await;

    supervisor.send_stop().await.unwrap();
    assert_eq!(supervisor.join(None).await, ProcessState::Exited(0));
    supervisor.shutdown().await;
}

#[tokio::test]
async fn unknown_entry_point_fails_handshake() {
    let supervisor = Supervisor::new(config("no-such-entry"), Arc::new(EchoDataHandler));

    let err = supervisor.launch().await.unwrap_err();
    assert!(
        matches!(
            err,
            SupervisorError::Handshake(HandshakeError::ExitedEarly(status)) if status.code() == Some(1)
        ),
        "{err}"
    );
    assert_eq!(supervisor.lifecycle(), Lifecycle::Failed);
    assert!(!supervisor.wait_for_connection(Some(Duration::ZERO)).await);
}

#[tokio::test]
async fn connected_only_after_both_channels() {
    let supervisor = Supervisor::new(config("echo"), Arc::new(EchoDataHandler));
    assert!(!supervisor.wait_for_connection(Some(Duration::ZERO)).await);

    let launch = supervisor.launch_in_background();
    assert!(supervisor.wait_for_connection(None).await);
    launch.await.unwrap().unwrap();

    // Already connected: returns at once.
    assert!(supervisor.wait_for_connection(Some(Duration::ZERO)).await);
    // Second launch is a no-op.
    supervisor.launch().await.unwrap();

    stop(&supervisor).await;
}

#[tokio::test]
async fn launch_over_tcp_endpoint() {
    let supervisor = Supervisor::new(
        config("echo").with_endpoint(EndpointKind::Tcp),
        Arc::new(EchoDataHandler),
    );
    supervisor.launch().await.unwrap();
    let response = supervisor.call(json!("over tcp")).await.unwrap();
    assert_eq!(response.answer, Some(json!("over tcp")));
    stop(&supervisor).await;
}

#[cfg(unix)]
#[tokio::test]
async fn launch_over_named_socket_cleans_up() {
    let dir = tempfile::tempdir().unwrap();
    let supervisor = Supervisor::new(
        config("echo").with_endpoint(EndpointKind::Named {
            dir: dir.path().to_path_buf(),
        }),
        Arc::new(EchoDataHandler),
    );
    supervisor.launch().await.unwrap();
    assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);

    let response = supervisor.call(json!("over unix")).await.unwrap();
    assert_eq!(response.answer, Some(json!("over unix")));
    stop(&supervisor).await;
}

#[tokio::test]
async fn registry_shares_and_restarts_worker() {
    let registry = WorkerRegistry::new(config("echo"), Arc::new(EchoDataHandler));
    assert!(registry.get().await.is_none());

    let first = registry.init().await.unwrap();
    let again = registry.init().await.unwrap();
    assert!(Arc::ptr_eq(&first, &again));
    let first_pid = first.pid();

    let state = registry.shutdown().await.unwrap();
    assert!(state.is_terminal());
    assert!(registry.get().await.is_none());

    let fresh = registry.init().await.unwrap();
    assert_ne!(fresh.pid(), first_pid);
    assert_eq!(fresh.call(json!("hi")).await.unwrap().answer, Some(json!("hi")));
    registry.shutdown().await;
}
