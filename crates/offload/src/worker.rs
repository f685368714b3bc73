//! Worker-side main loop.
//!
//! Runs in the child process spawned by the supervisor:
//! - Handshake (address + auth key) is read from stdin until EOF
//! - Control connection first, then data connection, each authenticated
//! - Control requests are served one at a time by the selected entry point
//! - Handlers may call back into the host through the data channel
//!
//! SIGTERM ends the process cleanly with exit status 0.

use std::collections::BTreeMap;
use std::io;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use serde_json::{Value, json};
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::bridge::auth::{AuthError, authenticate_connector};
use crate::bridge::protocol::{HandshakePayload, Outcome, Request, Response};
use crate::bridge::transport::{Connection, connect};
use crate::bridge::{ChannelReader, ChannelWriter, Frame, framed, read_frame, write_frame};
use crate::config::{DEFAULT_ENTRY_POINT, ENV_ENTRY_POINT};
use crate::handshake::ChannelRole;

#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error("failed to read handshake from stdin: {0}")]
    Stdin(#[source] io::Error),
    #[error("malformed handshake: {0}")]
    Handshake(#[source] serde_json::Error),
    #[error("unknown entry point {0:?}")]
    UnknownEntryPoint(String),
    #[error("failed to connect {role} channel: {source}")]
    Connect {
        role: ChannelRole,
        #[source]
        source: io::Error,
    },
    #[error("{role} channel failed authentication: {source}")]
    Auth {
        role: ChannelRole,
        #[source]
        source: AuthError,
    },
    #[error("failed to install signal handler: {0}")]
    Signal(#[source] io::Error),
    #[error("{0} channel closed by host")]
    ChannelClosed(ChannelRole),
    #[error("{role} channel error: {source}")]
    Channel {
        role: ChannelRole,
        #[source]
        source: io::Error,
    },
    #[error("protocol error: {0}")]
    Protocol(String),
}

/// Worker-side behaviour for control requests.
///
/// An `Err` is reported to the host as `failure_info`; the loop keeps serving.
#[async_trait]
pub trait ControlHandler: Send + Sync + 'static {
    async fn handle(&self, request: &Request, ctx: &WorkerContext) -> anyhow::Result<Value>;
}

struct DataChannel {
    reader: ChannelReader<Response>,
    writer: ChannelWriter<Option<Request>>,
}

/// Worker's end of the data channel: synchronous calls into the host.
pub struct DataClient {
    channel: tokio::sync::Mutex<DataChannel>,
}

impl DataClient {
    pub fn new(conn: Connection) -> Self {
        let (reader, writer) = framed(conn);
        Self {
            channel: tokio::sync::Mutex::new(DataChannel { reader, writer }),
        }
    }

    /// Ask the host for `payload` and wait for its answer.
    ///
    /// A host-side failure comes back as a `Response` with `failure_info` set,
    /// not as an `Err`.
    pub async fn call(&self, payload: Value) -> Result<Response, WorkerError> {
        let mut guard = self.channel.lock().await;
        let DataChannel { reader, writer } = &mut *guard;

        let request = Request::new(payload);
        let id = request.id;
        write_frame(writer, Some(request))
            .await
            .map_err(|e| channel_error(ChannelRole::Data, e))?;

        match read_frame(reader).await {
            Frame::Message(response) if response.request_id == id => Ok(response),
            Frame::Message(response) => Err(WorkerError::Protocol(format!(
                "expected data response to {id}, got one for {}",
                response.request_id
            ))),
            Frame::Closed => Err(WorkerError::ChannelClosed(ChannelRole::Data)),
            Frame::Failed(source) => Err(WorkerError::Channel {
                role: ChannelRole::Data,
                source,
            }),
        }
    }

    /// Tell the host's data responder to stop.
    pub async fn stop(&self) -> Result<(), WorkerError> {
        let mut guard = self.channel.lock().await;
        write_frame(&mut guard.writer, None)
            .await
            .map_err(|e| channel_error(ChannelRole::Data, e))
    }
}

fn channel_error(role: ChannelRole, source: io::Error) -> WorkerError {
    if crate::bridge::is_disconnect(&source) {
        WorkerError::ChannelClosed(role)
    } else {
        WorkerError::Channel { role, source }
    }
}

/// What a control handler can reach besides its request.
pub struct WorkerContext {
    data: DataClient,
    ignore_terminate: Arc<AtomicBool>,
}

impl WorkerContext {
    pub fn new(data: DataClient) -> Self {
        Self {
            data,
            ignore_terminate: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn data(&self) -> &DataClient {
        &self.data
    }

    /// Keep running through SIGTERM; only a kill stops the process.
    pub fn ignore_terminate(&self) {
        self.ignore_terminate.store(true, Ordering::Relaxed);
    }
}

/// Named control handlers a worker binary can be launched with.
#[derive(Clone, Default)]
pub struct EntryPoints {
    handlers: BTreeMap<String, Arc<dyn ControlHandler>>,
}

impl EntryPoints {
    pub fn new() -> Self {
        Self::default()
    }

    /// `echo`, `probe`, and `main`. The default name serves echo; the
    /// diagnostic ops are only reachable by asking for `probe`.
    pub fn builtin() -> Self {
        let echo: Arc<dyn ControlHandler> = Arc::new(EchoHandler);
        Self::new()
            .with("echo", Arc::clone(&echo))
            .with("probe", Arc::new(ProbeHandler))
            .with(DEFAULT_ENTRY_POINT, echo)
    }

    pub fn with(mut self, name: impl Into<String>, handler: Arc<dyn ControlHandler>) -> Self {
        self.handlers.insert(name.into(), handler);
        self
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn ControlHandler>> {
        self.handlers.get(name).cloned()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.handlers.keys().map(String::as_str)
    }
}

/// Answers every control request with its payload.
pub struct EchoHandler;

#[async_trait]
impl ControlHandler for EchoHandler {
    async fn handle(&self, request: &Request, _ctx: &WorkerContext) -> anyhow::Result<Value> {
        Ok(request.payload.clone())
    }
}

/// Scriptable handler driven by `{"op": ...}` payloads.
///
/// | op            | fields            | result                                  |
/// |---------------|-------------------|-----------------------------------------|
/// | `echo`        | `value`           | `value`                                 |
/// | `raise`       | `kind`, `message` | failure `"{kind}: {message}"`           |
/// | `panic`       | `message`         | handler panics                          |
/// | `fetch`       | `payload`         | `{"fetched": answer}` from the host     |
/// | `sleep`       | `ms`              | `null` after the delay                  |
/// | `ignore_term` |                   | `true`; SIGTERM is ignored from now on  |
/// | `exit`        | `code`            | process exits without answering         |
pub struct ProbeHandler;

#[async_trait]
impl ControlHandler for ProbeHandler {
    async fn handle(&self, request: &Request, ctx: &WorkerContext) -> anyhow::Result<Value> {
        let payload = &request.payload;
        let op = payload
            .get("op")
            .and_then(Value::as_str)
            .ok_or_else(|| anyhow::anyhow!("TypeError: probe payload needs a string \"op\""))?;

        match op {
            "echo" => Ok(payload.get("value").cloned().unwrap_or(Value::Null)),
            "raise" => {
                let kind = str_field(payload, "kind").unwrap_or("Exception");
                let message = str_field(payload, "message").unwrap_or_default();
                Err(anyhow::anyhow!("{kind}: {message}"))
            }
            "panic" => {
                let message = str_field(payload, "message").unwrap_or("probe panic");
                panic!("{message}")
            }
            "fetch" => {
                let query = payload.get("payload").cloned().unwrap_or(Value::Null);
                let response = ctx.data().call(query).await?;
                match response.into_outcome() {
                    Outcome::Answer(answer) => Ok(json!({ "fetched": answer })),
                    Outcome::Failure(info) => Err(anyhow::anyhow!("host data request failed: {info}")),
                }
            }
            "sleep" => {
                let ms = payload.get("ms").and_then(Value::as_u64).unwrap_or(0);
                tokio::time::sleep(Duration::from_millis(ms)).await;
                Ok(Value::Null)
            }
            "ignore_term" => {
                ctx.ignore_terminate();
                Ok(Value::Bool(true))
            }
            "exit" => {
                let code = payload
                    .get("code")
                    .and_then(Value::as_i64)
                    .and_then(|c| i32::try_from(c).ok())
                    .unwrap_or(0);
                tracing::info!(code, "Probe requested exit");
                std::process::exit(code)
            }
            other => Err(anyhow::anyhow!("ValueError: unknown probe op {other:?}")),
        }
    }
}

fn str_field<'a>(payload: &'a Value, key: &str) -> Option<&'a str> {
    payload.get(key).and_then(Value::as_str)
}

/// Entry point name from `OFFLOAD_ENTRY_POINT`, else `main`.
pub fn entry_point_from_env() -> String {
    std::env::var(ENV_ENTRY_POINT)
        .ok()
        .map(|name| name.trim().to_string())
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| DEFAULT_ENTRY_POINT.to_string())
}

/// Read the whole handshake from `input` (stdin in a real worker).
pub async fn read_handshake<R>(mut input: R) -> Result<HandshakePayload, WorkerError>
where
    R: AsyncRead + Unpin,
{
    let mut raw = Vec::new();
    input
        .read_to_end(&mut raw)
        .await
        .map_err(WorkerError::Stdin)?;
    serde_json::from_slice(&raw).map_err(WorkerError::Handshake)
}

async fn connect_authenticated(
    payload: &HandshakePayload,
    role: ChannelRole,
) -> Result<Connection, WorkerError> {
    let mut conn = connect(&payload.address)
        .await
        .map_err(|source| WorkerError::Connect { role, source })?;
    authenticate_connector(&mut conn, &payload.auth_key)
        .await
        .map_err(|source| WorkerError::Auth { role, source })?;
    tracing::debug!(%role, "Connected to host");
    Ok(conn)
}

/// Resolve the entry point, complete the handshake and serve until told to stop.
///
/// Returns `Ok` on stop sentinel, host disconnect or SIGTERM.
pub async fn run_main(entry_points: &EntryPoints) -> Result<(), WorkerError> {
    let mut terminate = Terminate::install().map_err(WorkerError::Signal)?;

    // Stdin is drained before any early exit; the host may still be writing.
    let payload = read_handshake(tokio::io::stdin()).await?;

    let name = entry_point_from_env();
    let handler = entry_points
        .get(&name)
        .ok_or_else(|| WorkerError::UnknownEntryPoint(name.clone()))?;
    tracing::debug!(endpoint = %payload.address, entry_point = %name, "Handshake received");

    let control = connect_authenticated(&payload, ChannelRole::Control).await?;
    let data = connect_authenticated(&payload, ChannelRole::Data).await?;
    tracing::info!(entry_point = %name, "Worker connected");

    let ctx = WorkerContext::new(DataClient::new(data));
    let ignore = Arc::clone(&ctx.ignore_terminate);

    tokio::select! {
        served = serve(handler, control, &ctx) => served,
        () = terminate.wait(&ignore) => {
            tracing::info!("Received SIGTERM, exiting");
            Ok(())
        }
    }
}

/// Serve control requests until the stop sentinel or the host closes the channel.
pub async fn serve(
    handler: Arc<dyn ControlHandler>,
    control: Connection,
    ctx: &WorkerContext,
) -> Result<(), WorkerError> {
    let (mut reader, mut writer) = framed::<Option<Request>, Response>(control);

    loop {
        let request = match read_frame(&mut reader).await {
            Frame::Message(Some(request)) => request,
            Frame::Message(None) => {
                tracing::debug!("Stop sentinel received");
                break;
            }
            Frame::Closed => {
                tracing::debug!("Control channel closed by host");
                break;
            }
            Frame::Failed(source) => {
                return Err(WorkerError::Channel {
                    role: ChannelRole::Control,
                    source,
                });
            }
        };

        tracing::trace!(request_id = %request.id, "Control request received");
        let outcome = dispatch(handler.as_ref(), &request, ctx).await;
        let response = Response::from_outcome(request.id, outcome);

        if let Err(e) = write_frame(&mut writer, response).await {
            if crate::bridge::is_disconnect(&e) {
                tracing::debug!("Host went away before the response was written");
                break;
            }
            return Err(WorkerError::Channel {
                role: ChannelRole::Control,
                source: e,
            });
        }
    }

    if let Err(e) = ctx.data().stop().await {
        tracing::debug!(error = %e, "Data channel already closed");
    }
    Ok(())
}

async fn dispatch(handler: &dyn ControlHandler, request: &Request, ctx: &WorkerContext) -> Outcome {
    match AssertUnwindSafe(handler.handle(request, ctx))
        .catch_unwind()
        .await
    {
        Ok(Ok(answer)) => Outcome::Answer(answer),
        Ok(Err(e)) => {
            tracing::debug!(request_id = %request.id, error = %format!("{e:#}"), "Handler failed");
            Outcome::from_error(&e)
        }
        Err(panic) => {
            let info = crate::panic_message(panic.as_ref());
            tracing::error!(request_id = %request.id, %info, "Handler panicked");
            Outcome::Failure(format!("handler panicked: {info}"))
        }
    }
}

/// SIGTERM listener, installed before anything else so an early terminate
/// request is not lost.
struct Terminate {
    #[cfg(unix)]
    signal: tokio::signal::unix::Signal,
}

impl Terminate {
    #[cfg(unix)]
    fn install() -> io::Result<Self> {
        use tokio::signal::unix::{SignalKind, signal};
        Ok(Self {
            signal: signal(SignalKind::terminate())?,
        })
    }

    #[cfg(not(unix))]
    fn install() -> io::Result<Self> {
        Ok(Self {})
    }

    #[cfg(unix)]
    async fn wait(&mut self, ignore: &AtomicBool) {
        loop {
            if self.signal.recv().await.is_none() {
                std::future::pending::<()>().await;
            }
            if !ignore.load(Ordering::Relaxed) {
                return;
            }
            tracing::warn!("Ignoring SIGTERM");
        }
    }

    // Termination elsewhere cannot be intercepted.
    #[cfg(not(unix))]
    async fn wait(&mut self, _ignore: &AtomicBool) {
        std::future::pending::<()>().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::responder::{DataHandler, DataResponder, EchoDataHandler};
    use tokio_util::sync::CancellationToken;

    struct Harness {
        host_rx: ChannelReader<Response>,
        host_tx: ChannelWriter<Option<Request>>,
        task: tokio::task::JoinHandle<Result<(), WorkerError>>,
    }

    fn start(handler: Arc<dyn ControlHandler>, data_handler: Arc<dyn DataHandler>) -> Harness {
        let (host_control, worker_control) = tokio::io::duplex(4096);
        let (host_data, worker_data) = tokio::io::duplex(4096);

        DataResponder::new(
            Box::new(host_data),
            data_handler,
            Arc::new(AtomicBool::new(false)),
            CancellationToken::new(),
        )
        .spawn();

        let task = tokio::spawn(async move {
            let ctx = WorkerContext::new(DataClient::new(Box::new(worker_data)));
            serve(handler, Box::new(worker_control), &ctx).await
        });

        let (host_rx, host_tx) = framed(Box::new(host_control));
        Harness {
            host_rx,
            host_tx,
            task,
        }
    }

    async fn call(h: &mut Harness, payload: Value) -> Response {
        let request = Request::new(payload);
        let id = request.id;
        write_frame(&mut h.host_tx, Some(request)).await.unwrap();
        match read_frame(&mut h.host_rx).await {
            Frame::Message(response) => {
                assert_eq!(response.request_id, id);
                response
            }
            other => panic!("unexpected frame {other:?}"),
        }
    }

    struct FailingLookup;

    #[async_trait]
    impl DataHandler for FailingLookup {
        async fn handle(&self, _request: &Request) -> Outcome {
            Outcome::failure("KeyError: 'missing'")
        }
    }

    #[tokio::test]
    async fn echo_entry_returns_payload() {
        let mut h = start(Arc::new(EchoHandler), Arc::new(EchoDataHandler));
        let response = call(&mut h, json!("Hello World!")).await;
        assert_eq!(response.answer, Some(json!("Hello World!")));
        assert!(response.failure_info.is_none());
    }

    #[tokio::test]
    async fn handler_error_is_reported_and_loop_continues() {
        let mut h = start(Arc::new(ProbeHandler), Arc::new(EchoDataHandler));

        let failed = call(
            &mut h,
            json!({"op": "raise", "kind": "ValueError", "message": "bad"}),
        )
        .await;
        assert!(failed.answer.is_none());
        assert_eq!(failed.failure_info.as_deref(), Some("ValueError: bad"));

        let ok = call(&mut h, json!({"op": "echo", "value": 7})).await;
        assert_eq!(ok.answer, Some(json!(7)));
    }

    #[tokio::test]
    async fn handler_panic_is_reported_and_loop_continues() {
        let mut h = start(Arc::new(ProbeHandler), Arc::new(EchoDataHandler));

        let failed = call(&mut h, json!({"op": "panic", "message": "table on fire"})).await;
        assert!(failed.failure_info.unwrap().contains("table on fire"));

        let ok = call(&mut h, json!({"op": "echo", "value": "still here"})).await;
        assert_eq!(ok.answer, Some(json!("still here")));
    }

    #[tokio::test]
    async fn fetch_goes_through_the_data_channel() {
        let mut h = start(Arc::new(ProbeHandler), Arc::new(EchoDataHandler));
        let response = call(&mut h, json!({"op": "fetch", "payload": {"key": "k"}})).await;
        assert_eq!(response.answer, Some(json!({"fetched": {"key": "k"}})));
    }

    #[tokio::test]
    async fn host_data_failure_propagates_as_control_failure() {
        let mut h = start(Arc::new(ProbeHandler), Arc::new(FailingLookup));
        let response = call(&mut h, json!({"op": "fetch", "payload": "missing"})).await;
        let info = response.failure_info.unwrap();
        assert!(info.contains("KeyError: 'missing'"), "{info}");
    }

    #[tokio::test]
    async fn unknown_op_and_missing_op_fail() {
        let mut h = start(Arc::new(ProbeHandler), Arc::new(EchoDataHandler));
        let unknown = call(&mut h, json!({"op": "dance"})).await;
        assert!(unknown.failure_info.unwrap().contains("dance"));
        let missing = call(&mut h, json!(42)).await;
        assert!(missing.failure_info.unwrap().starts_with("TypeError"));
    }

    #[tokio::test]
    async fn stop_sentinel_ends_serve() {
        let mut h = start(Arc::new(EchoHandler), Arc::new(EchoDataHandler));
        write_frame(&mut h.host_tx, None).await.unwrap();
        h.task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn host_close_ends_serve() {
        let h = start(Arc::new(EchoHandler), Arc::new(EchoDataHandler));
        drop(h.host_tx);
        drop(h.host_rx);
        h.task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn data_call_after_host_close_is_channel_closed() {
        let (host_data, worker_data) = tokio::io::duplex(64);
        drop(host_data);
        let client = DataClient::new(Box::new(worker_data));
        let err = client.call(json!(1)).await.unwrap_err();
        assert!(matches!(err, WorkerError::ChannelClosed(ChannelRole::Data)));
    }

    #[tokio::test]
    async fn handshake_is_read_to_eof() {
        let raw = br#"{"address":{"kind":"tcp","addr":"127.0.0.1:4000"},"auth_key":"0000000000000000000000000000000000000000000000000000000000000000"}"#;
        let payload = read_handshake(&raw[..]).await.unwrap();
        assert_eq!(payload.address.to_string(), "tcp://127.0.0.1:4000");
    }

    #[tokio::test]
    async fn truncated_handshake_is_rejected() {
        let err = read_handshake(&br#"{"address":"#[..]).await.unwrap_err();
        assert!(matches!(err, WorkerError::Handshake(_)));
    }

    #[test]
    fn builtin_entry_points() {
        let entries = EntryPoints::builtin();
        assert_eq!(entries.names().collect::<Vec<_>>(), vec!["echo", "main", "probe"]);
        assert!(entries.get("echo").is_some());
        assert!(entries.get("nope").is_none());
    }

    #[tokio::test]
    async fn default_entry_point_does_not_run_diagnostic_ops() {
        let entries = EntryPoints::builtin();
        let main = entries.get(DEFAULT_ENTRY_POINT).unwrap();
        let mut h = start(main, Arc::new(EchoDataHandler));

        for payload in [json!({"op": "exit", "code": 3}), json!({"op": "ignore_term"})] {
            let response = call(&mut h, payload.clone()).await;
            assert_eq!(response.answer, Some(payload));
            assert!(response.failure_info.is_none());
        }
        assert!(!h.task.is_finished());
    }
}
