//! Worker supervisor - owns one worker process and its two channels.
//!
//! Separates lifecycle management from the callers issuing requests:
//! - `launch` runs the handshake and starts the data responder
//! - `send` / `receive` / `call` drive the control channel
//! - `shutdown` closes both channels, asks the worker to terminate and hands
//!   the process to a reaper task
//! - `join` waits on the reaper, escalating to a kill where the platform
//!   lacks guaranteed termination
//!
//! Channel failures are surfaced while running and swallowed once the
//! lifecycle is `ShuttingDown`: closing the channels is what caused them.
//!
//! The control channel is strictly one request in flight. `send` followed by
//! `receive` assumes a single caller; concurrent callers must use `call`,
//! which holds an internal lock across the pair.

use std::process::ExitStatus;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures::SinkExt;
use tokio::process::Child;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::bridge::protocol::{Request, Response};
use crate::bridge::{ChannelReader, ChannelWriter, Frame, framed, read_frame, write_frame};
use crate::config::SupervisorConfig;
use crate::handshake::{Handshake, HandshakeError, launch_worker};
use crate::responder::{DataHandler, DataResponder, ResponderExit};

/// Where the supervisor is in its life.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    Idle,
    Launching,
    /// Both channels accepted; data responder running.
    Connected,
    /// Set exactly once by `shutdown`. Channel errors are expected from here on.
    ShuttingDown,
    /// Handshake failed; this supervisor will not launch again.
    Failed,
}

/// Observed state of the worker process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    /// Never spawned, or its status could not be observed.
    Unknown,
    Running,
    Exited(i32),
    /// Terminated by a signal (unix) or without an exit code.
    Killed { signal: Option<i32> },
}

impl ProcessState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Exited(_) | Self::Killed { .. })
    }

    pub fn exit_code(&self) -> Option<i32> {
        match self {
            Self::Exited(code) => Some(*code),
            _ => None,
        }
    }
}

impl From<ExitStatus> for ProcessState {
    fn from(status: ExitStatus) -> Self {
        match status.code() {
            Some(code) => Self::Exited(code),
            None => Self::Killed {
                signal: exit_signal(&status),
            },
        }
    }
}

#[cfg(unix)]
fn exit_signal(status: &ExitStatus) -> Option<i32> {
    use std::os::unix::process::ExitStatusExt;
    status.signal()
}

#[cfg(not(unix))]
fn exit_signal(_status: &ExitStatus) -> Option<i32> {
    None
}

#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error(transparent)]
    Handshake(#[from] HandshakeError),
    #[error("worker is not connected")]
    NotConnected,
    #[error("supervisor has shut down")]
    ShutDown,
    #[error("an earlier launch failed; create a new supervisor to retry")]
    LaunchFailed,
    #[error("control channel closed by worker")]
    ChannelClosed,
    #[error("control channel error: {0}")]
    Channel(#[source] std::io::Error),
    #[error("protocol error: {0}")]
    Protocol(String),
}

struct Reaper {
    /// Taken by the first `join` that escalates.
    kill_tx: Option<oneshot::Sender<()>>,
    exit_rx: watch::Receiver<Option<ProcessState>>,
}

enum ProcessSlot {
    NotStarted,
    Running(Child),
    Reaping(Reaper),
    Exited(ProcessState),
}

fn lock<T>(mutex: &StdMutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct Supervisor {
    config: SupervisorConfig,
    data_handler: Arc<dyn DataHandler>,
    lifecycle: watch::Sender<Lifecycle>,
    /// Shared with the responder loop.
    shutting_down: Arc<AtomicBool>,
    /// Fired once by `shutdown`; aborts pending launch, reads and writes.
    cancel: CancellationToken,
    launch_lock: tokio::sync::Mutex<()>,
    call_lock: tokio::sync::Mutex<()>,
    control_writer: tokio::sync::Mutex<Option<ChannelWriter<Option<Request>>>>,
    control_reader: tokio::sync::Mutex<Option<ChannelReader<Response>>>,
    responder: StdMutex<Option<JoinHandle<ResponderExit>>>,
    process: StdMutex<ProcessSlot>,
    pid: StdMutex<Option<u32>>,
}

impl Supervisor {
    pub fn new(config: SupervisorConfig, data_handler: Arc<dyn DataHandler>) -> Arc<Self> {
        let (lifecycle, _) = watch::channel(Lifecycle::Idle);
        Arc::new(Self {
            config,
            data_handler,
            lifecycle,
            shutting_down: Arc::new(AtomicBool::new(false)),
            cancel: CancellationToken::new(),
            launch_lock: tokio::sync::Mutex::new(()),
            call_lock: tokio::sync::Mutex::new(()),
            control_writer: tokio::sync::Mutex::new(None),
            control_reader: tokio::sync::Mutex::new(None),
            responder: StdMutex::new(None),
            process: StdMutex::new(ProcessSlot::NotStarted),
            pid: StdMutex::new(None),
        })
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.config
    }

    pub fn lifecycle(&self) -> Lifecycle {
        *self.lifecycle.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.lifecycle() == Lifecycle::Connected
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::Acquire)
    }

    /// OS process id of the worker, once spawned.
    pub fn pid(&self) -> Option<u32> {
        *lock(&self.pid)
    }

    /// Spawn the worker and complete the handshake.
    ///
    /// Calling again after success is a no-op. Concurrent calls wait for the
    /// first one and share its outcome.
    pub async fn launch(&self) -> Result<(), SupervisorError> {
        let _launching = self.launch_lock.lock().await;

        match self.lifecycle() {
            Lifecycle::Connected => return Ok(()),
            Lifecycle::ShuttingDown => return Err(SupervisorError::ShutDown),
            Lifecycle::Failed => return Err(SupervisorError::LaunchFailed),
            Lifecycle::Idle | Lifecycle::Launching => {}
        }
        self.transition(Lifecycle::Idle, Lifecycle::Launching);

        let Handshake {
            child,
            control,
            data,
        } = match launch_worker(&self.config, &self.cancel).await {
            Ok(handshake) => handshake,
            Err(HandshakeError::Cancelled) => return Err(SupervisorError::ShutDown),
            Err(e) => {
                self.transition(Lifecycle::Launching, Lifecycle::Failed);
                return Err(e.into());
            }
        };

        *lock(&self.pid) = child.id();
        *lock(&self.process) = ProcessSlot::Running(child);

        let responder = DataResponder::new(
            data,
            Arc::clone(&self.data_handler),
            Arc::clone(&self.shutting_down),
            self.cancel.clone(),
        )
        .spawn();
        *lock(&self.responder) = Some(responder);

        let (reader, writer) = framed(control);
        *self.control_reader.lock().await = Some(reader);
        *self.control_writer.lock().await = Some(writer);

        if !self.transition(Lifecycle::Launching, Lifecycle::Connected) {
            // shutdown() ran while the channels were being installed.
            self.teardown().await;
            return Err(SupervisorError::ShutDown);
        }

        tracing::info!(pid = ?self.pid(), "Worker supervisor connected");
        Ok(())
    }

    /// Run `launch` on its own task, the way a caller that only wants to
    /// `wait_for_connection` later would.
    pub fn launch_in_background(self: &Arc<Self>) -> JoinHandle<Result<(), SupervisorError>> {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let result = this.launch().await;
            if let Err(ref e) = result {
                tracing::error!(error = %e, "Background launch failed");
            }
            result
        })
    }

    /// Wait until the handshake completes or fails, bounded by `timeout`.
    ///
    /// Never errors on expiry; returns whether the worker is connected.
    pub async fn wait_for_connection(&self, timeout: Option<Duration>) -> bool {
        let mut rx = self.lifecycle.subscribe();
        let settled = async move {
            let _ = rx
                .wait_for(|s| !matches!(s, Lifecycle::Idle | Lifecycle::Launching))
                .await;
        };
        match timeout {
            Some(limit) => {
                let _ = tokio::time::timeout(limit, settled).await;
            }
            None => settled.await,
        }
        self.is_connected()
    }

    /// Write one request to the control channel.
    pub async fn send(&self, request: Request) -> Result<(), SupervisorError> {
        self.send_frame(Some(request)).await
    }

    /// Ask the worker's main loop to stop.
    pub async fn send_stop(&self) -> Result<(), SupervisorError> {
        self.send_frame(None).await
    }

    async fn send_frame(&self, frame: Option<Request>) -> Result<(), SupervisorError> {
        let mut guard = self.control_writer.lock().await;
        let Some(writer) = guard.as_mut() else {
            return self.surface(SupervisorError::NotConnected, ());
        };

        let written = tokio::select! {
            written = write_frame(writer, frame) => written,
            _ = self.cancel.cancelled() => return Ok(()),
        };
        match written {
            Ok(()) => Ok(()),
            Err(e) if crate::bridge::is_disconnect(&e) => {
                self.surface(SupervisorError::ChannelClosed, ())
            }
            Err(e) => self.surface(SupervisorError::Channel(e), ()),
        }
    }

    /// Read the next raw response from the control channel.
    ///
    /// `Ok(None)` means the channel was closed by shutdown.
    pub async fn receive(&self) -> Result<Option<Response>, SupervisorError> {
        let mut guard = self.control_reader.lock().await;
        let Some(reader) = guard.as_mut() else {
            return self.surface(SupervisorError::NotConnected, None);
        };

        let frame = tokio::select! {
            frame = read_frame(reader) => frame,
            _ = self.cancel.cancelled() => return Ok(None),
        };
        match frame {
            Frame::Message(response) => Ok(Some(response)),
            Frame::Closed => self.surface(SupervisorError::ChannelClosed, None),
            Frame::Failed(e) => self.surface(SupervisorError::Channel(e), None),
        }
    }

    /// Send `payload` and wait for its response, exclusive of other `call`s.
    pub async fn call(&self, payload: serde_json::Value) -> Result<Response, SupervisorError> {
        let _exclusive = self.call_lock.lock().await;

        let request = Request::new(payload);
        let id = request.id;
        self.send(request).await?;

        match self.receive().await? {
            Some(response) if response.request_id == id => Ok(response),
            Some(response) => Err(SupervisorError::Protocol(format!(
                "expected response to {id}, got one for {}",
                response.request_id
            ))),
            None => Err(SupervisorError::ShutDown),
        }
    }

    /// Swallow `err` once shutting down, surface it otherwise.
    fn surface<T>(&self, err: SupervisorError, fallback: T) -> Result<T, SupervisorError> {
        match self.lifecycle() {
            Lifecycle::ShuttingDown => {
                tracing::debug!(error = %err, "Channel error during shutdown suppressed");
                Ok(fallback)
            }
            _ => Err(err),
        }
    }

    /// Compare-and-set on the lifecycle; false if another transition won.
    fn transition(&self, from: Lifecycle, to: Lifecycle) -> bool {
        self.lifecycle.send_if_modified(|current| {
            if *current == from {
                *current = to;
                true
            } else {
                false
            }
        })
    }

    /// Close both channels, request termination and start the reaper.
    ///
    /// Idempotent; safe after the worker already exited or before launch.
    pub async fn shutdown(&self) {
        if self.shutting_down.swap(true, Ordering::AcqRel) {
            return;
        }
        tracing::info!(pid = ?self.pid(), "Shutting down worker supervisor");
        self.lifecycle.send_replace(Lifecycle::ShuttingDown);
        self.cancel.cancel();
        self.teardown().await;
    }

    async fn teardown(&self) {
        if let Some(mut writer) = self.control_writer.lock().await.take()
            && let Err(e) = writer.close().await
        {
            tracing::debug!(error = %e, "Ignoring control channel close error");
        }
        drop(self.control_reader.lock().await.take());

        // Responder sees the cancellation at its next read; abort covers a
        // handler that is still running.
        if let Some(responder) = lock(&self.responder).take() {
            responder.abort();
        }

        self.start_reaper(true);
    }

    /// Hand the child to a reaper task unless it already has one or is gone.
    fn start_reaper(&self, terminate: bool) {
        let mut slot = lock(&self.process);
        let mut child = match std::mem::replace(&mut *slot, ProcessSlot::NotStarted) {
            ProcessSlot::Running(child) => child,
            other => {
                *slot = other;
                return;
            }
        };

        match child.try_wait() {
            Ok(Some(status)) => {
                let state = ProcessState::from(status);
                tracing::debug!(?state, "Worker already exited");
                *slot = ProcessSlot::Exited(state);
                return;
            }
            Ok(None) => {
                if terminate {
                    request_termination(&mut child);
                }
            }
            Err(e) => tracing::warn!(error = %e, "Failed to poll worker process"),
        }

        let (kill_tx, kill_rx) = oneshot::channel();
        let (exit_tx, exit_rx) = watch::channel(None);
        tokio::spawn(reap(child, kill_rx, exit_tx));
        *slot = ProcessSlot::Reaping(Reaper {
            kill_tx: Some(kill_tx),
            exit_rx,
        });
    }

    /// Poll the worker's state without blocking.
    pub fn process_state(&self) -> ProcessState {
        let mut slot = lock(&self.process);
        match &mut *slot {
            ProcessSlot::NotStarted => ProcessState::Unknown,
            ProcessSlot::Running(child) => match child.try_wait() {
                Ok(Some(status)) => ProcessState::from(status),
                Ok(None) => ProcessState::Running,
                Err(_) => ProcessState::Unknown,
            },
            ProcessSlot::Reaping(reaper) => (*reaper.exit_rx.borrow()).unwrap_or(ProcessState::Running),
            ProcessSlot::Exited(state) => *state,
        }
    }

    /// Wait for the reaper to observe the worker's exit.
    ///
    /// `None` uses the configured join timeout. On unix a worker still alive
    /// after the timeout is killed and waited on once more; elsewhere
    /// termination is already forceful and no escalation happens. Returns
    /// `Running` if the exit is still unobserved.
    pub async fn join(&self, timeout: Option<Duration>) -> ProcessState {
        let limit = timeout.unwrap_or(self.config.join_timeout);

        // join without shutdown still reaps, but without the graceful request.
        self.start_reaper(false);

        let (exit_rx, kill_tx) = {
            let mut slot = lock(&self.process);
            match &mut *slot {
                ProcessSlot::NotStarted => return ProcessState::Unknown,
                ProcessSlot::Exited(state) => return *state,
                ProcessSlot::Running(_) => return ProcessState::Running,
                ProcessSlot::Reaping(reaper) => (reaper.exit_rx.clone(), reaper.kill_tx.take()),
            }
        };

        if let Some(state) = wait_exit(exit_rx.clone(), limit).await {
            self.record_exit(state);
            return state;
        }

        #[cfg(unix)]
        {
            tracing::warn!(
                pid = ?self.pid(),
                grace_ms = limit.as_millis(),
                "Worker unresponsive after grace period, killing"
            );
            if let Some(kill_tx) = kill_tx {
                let _ = kill_tx.send(());
            }
            if let Some(state) = wait_exit(exit_rx, limit).await {
                self.record_exit(state);
                return state;
            }
        }

        #[cfg(not(unix))]
        {
            // Put the escalation handle back for a later join.
            if let ProcessSlot::Reaping(reaper) = &mut *lock(&self.process) {
                reaper.kill_tx = kill_tx;
            }
            drop(exit_rx);
        }

        ProcessState::Running
    }

    fn record_exit(&self, state: ProcessState) {
        let mut slot = lock(&self.process);
        if matches!(*slot, ProcessSlot::Reaping(_)) {
            *slot = ProcessSlot::Exited(state);
        }
    }
}

async fn wait_exit(
    mut exit_rx: watch::Receiver<Option<ProcessState>>,
    limit: Duration,
) -> Option<ProcessState> {
    let observed = tokio::time::timeout(limit, async move {
        exit_rx.wait_for(Option::is_some).await.ok().and_then(|s| *s)
    })
    .await;
    observed.ok().flatten()
}

/// Ask the worker to exit: SIGTERM on unix, TerminateProcess elsewhere.
fn request_termination(child: &mut Child) {
    #[cfg(unix)]
    {
        use nix::sys::signal::{Signal, kill};
        use nix::unistd::Pid;

        let Some(pid) = child.id().and_then(|pid| i32::try_from(pid).ok()) else {
            return;
        };
        tracing::debug!(pid, "Sending SIGTERM to worker");
        if let Err(e) = kill(Pid::from_raw(pid), Signal::SIGTERM) {
            tracing::debug!(pid, error = %e, "SIGTERM not delivered");
        }
    }

    #[cfg(not(unix))]
    {
        tracing::debug!(pid = ?child.id(), "Terminating worker");
        if let Err(e) = child.start_kill() {
            tracing::debug!(error = %e, "Terminate not delivered");
        }
    }
}

/// Own the child until it exits; kill it if `join` escalates.
async fn reap(
    mut child: Child,
    kill_rx: oneshot::Receiver<()>,
    exit_tx: watch::Sender<Option<ProcessState>>,
) {
    let pid = child.id();
    let status = tokio::select! {
        status = child.wait() => status,
        Ok(()) = kill_rx => {
            if let Err(e) = child.start_kill() {
                tracing::debug!(?pid, error = %e, "Kill not delivered");
            }
            child.wait().await
        }
    };

    match status {
        Ok(status) => {
            let state = ProcessState::from(status);
            tracing::info!(?pid, ?state, "Worker process reaped");
            exit_tx.send_replace(Some(state));
        }
        Err(e) => tracing::error!(?pid, error = %e, "Failed to wait for worker"),
    }
}
