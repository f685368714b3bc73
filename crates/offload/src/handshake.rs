//! Host side of the launch handshake.
//!
//! Flow:
//! 1. Generate a fresh auth key, bind a fresh endpoint
//! 2. Spawn the worker with the entry point in its environment
//! 3. Write `(address, key)` to the worker's stdin once, close stdin
//! 4. Accept + authenticate the control connection, then the data connection
//!
//! Step 4 races the worker's exit, the optional accept timeout and the
//! supervisor's shutdown signal; whichever fires first decides the outcome.

use std::ffi::OsString;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::process::{Child, ChildStdin, Command};
use tokio_util::sync::CancellationToken;

use crate::bridge::auth::{AuthError, AuthKey, authenticate_acceptor};
use crate::bridge::protocol::HandshakePayload;
use crate::bridge::transport::{Connection, Endpoint};
use crate::config::{ENV_ENTRY_POINT, SupervisorConfig};

/// Which of the two connections is being established.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelRole {
    Control,
    Data,
}

impl std::fmt::Display for ChannelRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Control => f.write_str("control"),
            Self::Data => f.write_str("data"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SpawnError {
    #[error("failed to spawn process: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("spawn failed: {0}")]
    Other(String),
}

/// Extension point for different worker launch strategies.
///
/// Implementations must pipe stdin: the handshake is written there.
pub trait WorkerSpawner: Send + Sync {
    fn spawn(&self, entry_point: &str) -> Result<Child, SpawnError>;
}

/// Runs a program with the entry point passed in `OFFLOAD_ENTRY_POINT`.
#[derive(Debug, Clone)]
pub struct CommandSpawner {
    program: PathBuf,
    args: Vec<OsString>,
}

impl CommandSpawner {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn with_args<I, A>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = A>,
        A: Into<OsString>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn program(&self) -> &PathBuf {
        &self.program
    }

    pub fn args(&self) -> &[OsString] {
        &self.args
    }
}

impl WorkerSpawner for CommandSpawner {
    fn spawn(&self, entry_point: &str) -> Result<Child, SpawnError> {
        let child = Command::new(&self.program)
            .args(&self.args)
            .env(ENV_ENTRY_POINT, entry_point)
            .stdin(Stdio::piped())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()?;
        Ok(child)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum HandshakeError {
    #[error("failed to create endpoint: {0}")]
    Endpoint(#[source] std::io::Error),
    #[error("failed to generate auth key: {0}")]
    Key(#[source] AuthError),
    #[error("failed to spawn worker: {0}")]
    Spawn(#[from] SpawnError),
    #[error("worker stdin not captured")]
    StdinNotCaptured,
    #[error("failed to write handshake to worker stdin: {0}")]
    Stdin(#[source] std::io::Error),
    #[error("failed to accept {role} connection: {source}")]
    Accept {
        role: ChannelRole,
        #[source]
        source: std::io::Error,
    },
    #[error("{role} connection failed authentication: {source}")]
    Auth {
        role: ChannelRole,
        #[source]
        source: AuthError,
    },
    #[error("worker did not connect within {0:?}")]
    AcceptTimeout(Duration),
    #[error("worker exited before connecting ({0})")]
    ExitedEarly(ExitStatus),
    #[error("failed to observe worker exit: {0}")]
    Wait(#[source] std::io::Error),
    #[error("launch cancelled by shutdown")]
    Cancelled,
}

/// A spawned worker with both channels accepted and authenticated.
pub struct Handshake {
    pub child: Child,
    pub control: Connection,
    pub data: Connection,
}

/// Spawn the worker and run the host side of the handshake.
///
/// On failure the child (if any) is killed and reaped before returning.
pub async fn launch_worker(
    config: &SupervisorConfig,
    cancel: &CancellationToken,
) -> Result<Handshake, HandshakeError> {
    let auth_key = AuthKey::generate().map_err(HandshakeError::Key)?;
    let endpoint = Endpoint::bind(&config.endpoint)
        .await
        .map_err(HandshakeError::Endpoint)?;

    tracing::info!(
        entry_point = %config.entry_point,
        endpoint = %endpoint.address(),
        "Spawning worker process"
    );
    let mut child = config.spawner.spawn(&config.entry_point)?;
    tracing::debug!(pid = ?child.id(), "Worker process spawned");

    let payload = HandshakePayload {
        address: endpoint.address().clone(),
        auth_key: auth_key.clone(),
    };

    let result = async {
        let stdin = child
            .stdin
            .take()
            .ok_or(HandshakeError::StdinNotCaptured)?;
        write_handshake(stdin, &payload).await?;

        let accept_both = async {
            let control = accept_authenticated(&endpoint, &auth_key, ChannelRole::Control).await?;
            let data = accept_authenticated(&endpoint, &auth_key, ChannelRole::Data).await?;
            Ok::<_, HandshakeError>((control, data))
        };

        let bounded = async {
            match config.accept_timeout {
                Some(limit) => tokio::time::timeout(limit, accept_both)
                    .await
                    .map_err(|_| HandshakeError::AcceptTimeout(limit))?,
                None => accept_both.await,
            }
        };

        tokio::select! {
            accepted = bounded => accepted,
            status = child.wait() => Err(match status {
                Ok(status) => HandshakeError::ExitedEarly(status),
                Err(e) => HandshakeError::Wait(e),
            }),
            _ = cancel.cancelled() => Err(HandshakeError::Cancelled),
        }
    }
    .await;

    // Endpoint address is single use.
    drop(endpoint);

    match result {
        Ok((control, data)) => {
            tracing::info!(pid = ?child.id(), "Worker connected");
            Ok(Handshake {
                child,
                control,
                data,
            })
        }
        Err(e) => {
            tracing::warn!(error = %e, "Worker handshake failed");
            if child.start_kill().is_ok() {
                let _ = child.wait().await;
            }
            Err(e)
        }
    }
}

async fn write_handshake(
    mut stdin: ChildStdin,
    payload: &HandshakePayload,
) -> Result<(), HandshakeError> {
    let bytes = serde_json::to_vec(payload)
        .map_err(|e| HandshakeError::Stdin(std::io::Error::other(e)))?;
    stdin.write_all(&bytes).await.map_err(HandshakeError::Stdin)?;
    stdin.flush().await.map_err(HandshakeError::Stdin)?;
    // Closing stdin tells the worker the handshake data is complete.
    stdin.shutdown().await.map_err(HandshakeError::Stdin)?;
    drop(stdin);
    tracing::trace!(bytes = bytes.len(), "Handshake written to worker stdin");
    Ok(())
}

async fn accept_authenticated(
    endpoint: &Endpoint,
    key: &AuthKey,
    role: ChannelRole,
) -> Result<Connection, HandshakeError> {
    tracing::trace!(%role, "Waiting for worker connection");
    let mut conn = endpoint
        .accept()
        .await
        .map_err(|source| HandshakeError::Accept { role, source })?;
    authenticate_acceptor(&mut conn, key)
        .await
        .map_err(|source| HandshakeError::Auth { role, source })?;
    tracing::debug!(%role, "Worker connection authenticated");
    Ok(conn)
}
