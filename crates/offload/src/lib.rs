//! offload: run request/response work in a supervised child process.
//!
//! The host spawns a worker, hands it an endpoint address and a one-time
//! auth key over stdin, and accepts two authenticated connections back:
//! - **control**: host asks, worker answers
//! - **data**: worker asks, host answers (served by a background responder)
//!
//! Shutdown closes both channels, terminates the worker and reaps it.

pub mod bridge;
pub mod config;
pub mod handshake;
pub mod logging;
pub mod registry;
pub mod responder;
pub mod supervisor;
pub mod worker;

pub use bridge::protocol::{Outcome, Request, RequestId, Response};
pub use bridge::transport::{EndpointAddress, EndpointKind};
pub use config::{ConfigError, SupervisorConfig};
pub use handshake::{CommandSpawner, HandshakeError, SpawnError, WorkerSpawner};
pub use registry::WorkerRegistry;
pub use responder::{DataHandler, EchoDataHandler};
pub use supervisor::{Lifecycle, ProcessState, Supervisor, SupervisorError};
pub use worker::{ControlHandler, DataClient, EntryPoints, WorkerContext, WorkerError};

/// Best-effort text of a caught panic payload.
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
