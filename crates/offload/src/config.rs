//! Supervisor configuration.
//!
//! Built in code with the `with_*` methods, or seeded from the environment:
//!
//! | Variable                    | Effect                                   |
//! |-----------------------------|------------------------------------------|
//! | `OFFLOAD_ENTRY_POINT`       | worker entry point (default `main`)      |
//! | `OFFLOAD_ACCEPT_TIMEOUT_MS` | bound on the handshake accept phase      |
//! | `OFFLOAD_ENDPOINT`          | `abstract`, `named` or `tcp`             |

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::bridge::transport::EndpointKind;
use crate::handshake::{CommandSpawner, WorkerSpawner};

pub const DEFAULT_ENTRY_POINT: &str = "main";

/// Grace period `join` waits for the reaper before escalating.
pub const DEFAULT_JOIN_TIMEOUT: Duration = Duration::from_millis(200);

pub const ENV_ENTRY_POINT: &str = "OFFLOAD_ENTRY_POINT";
pub const ENV_ACCEPT_TIMEOUT_MS: &str = "OFFLOAD_ACCEPT_TIMEOUT_MS";
pub const ENV_ENDPOINT: &str = "OFFLOAD_ENDPOINT";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{var} is not valid: {value:?}")]
    Invalid { var: &'static str, value: String },
}

#[derive(Clone)]
pub struct SupervisorConfig {
    /// Identifier of the worker-side behaviour to run.
    pub entry_point: String,
    /// `None` waits for the worker indefinitely.
    pub accept_timeout: Option<Duration>,
    pub join_timeout: Duration,
    pub endpoint: EndpointKind,
    pub spawner: Arc<dyn WorkerSpawner>,
}

impl SupervisorConfig {
    /// Launch `program` through the default command spawner.
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            entry_point: DEFAULT_ENTRY_POINT.to_string(),
            accept_timeout: None,
            join_timeout: DEFAULT_JOIN_TIMEOUT,
            endpoint: EndpointKind::platform_default(),
            spawner: Arc::new(CommandSpawner::new(program)),
        }
    }

    /// Like `new`, then applies any `OFFLOAD_*` overrides present in the environment.
    pub fn from_env(program: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        Self::new(program).apply_env(|var| std::env::var(var).ok())
    }

    fn apply_env(
        mut self,
        lookup: impl Fn(&'static str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        if let Some(entry) = lookup(ENV_ENTRY_POINT)
            && !entry.trim().is_empty()
        {
            self.entry_point = entry.trim().to_string();
        }

        if let Some(raw) = lookup(ENV_ACCEPT_TIMEOUT_MS) {
            let millis: u64 = raw.trim().parse().map_err(|_| ConfigError::Invalid {
                var: ENV_ACCEPT_TIMEOUT_MS,
                value: raw.clone(),
            })?;
            self.accept_timeout = Some(Duration::from_millis(millis));
        }

        if let Some(raw) = lookup(ENV_ENDPOINT) {
            self.endpoint = EndpointKind::parse(&raw).ok_or(ConfigError::Invalid {
                var: ENV_ENDPOINT,
                value: raw,
            })?;
        }

        Ok(self)
    }

    pub fn with_entry_point(mut self, entry_point: impl Into<String>) -> Self {
        self.entry_point = entry_point.into();
        self
    }

    pub fn with_accept_timeout(mut self, timeout: Duration) -> Self {
        self.accept_timeout = Some(timeout);
        self
    }

    pub fn with_join_timeout(mut self, timeout: Duration) -> Self {
        self.join_timeout = timeout;
        self
    }

    pub fn with_endpoint(mut self, endpoint: EndpointKind) -> Self {
        self.endpoint = endpoint;
        self
    }

    pub fn with_spawner(mut self, spawner: Arc<dyn WorkerSpawner>) -> Self {
        self.spawner = spawner;
        self
    }
}

impl std::fmt::Debug for SupervisorConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SupervisorConfig")
            .field("entry_point", &self.entry_point)
            .field("accept_timeout", &self.accept_timeout)
            .field("join_timeout", &self.join_timeout)
            .field("endpoint", &self.endpoint)
            .finish_non_exhaustive()
    }
}
