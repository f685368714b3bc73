//! Data Request Responder - serves the worker's own requests on the data channel.
//!
//! Runs as its own task from the moment the data connection is accepted until
//! the worker closes the channel, sends the stop sentinel, or the supervisor
//! shuts down. Requests are served strictly in arrival order, one at a time.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use futures::FutureExt;
use tokio_util::sync::CancellationToken;

use crate::bridge::protocol::{Outcome, Request, Response};
use crate::bridge::transport::Connection;
use crate::bridge::{ChannelReader, ChannelWriter, Frame, framed, read_frame, write_frame};

/// Host-side handler for worker-issued data requests.
///
/// Implementations capture their own failures as `Outcome::Failure`.
#[async_trait]
pub trait DataHandler: Send + Sync + 'static {
    async fn handle(&self, request: &Request) -> Outcome;
}

/// Answers every data request with its own payload.
#[derive(Debug, Default, Clone, Copy)]
pub struct EchoDataHandler;

#[async_trait]
impl DataHandler for EchoDataHandler {
    async fn handle(&self, request: &Request) -> Outcome {
        Outcome::Answer(request.payload.clone())
    }
}

/// Why the responder loop stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponderExit {
    /// Worker closed the data channel.
    Closed,
    /// Worker sent the stop sentinel.
    Stopped,
    /// Supervisor is shutting down.
    Shutdown,
    /// Reading or writing failed for a reason other than the peer closing.
    Failed(String),
}

pub struct DataResponder {
    reader: ChannelReader<Option<Request>>,
    writer: ChannelWriter<Response>,
    handler: Arc<dyn DataHandler>,
    shutting_down: Arc<AtomicBool>,
    cancel: CancellationToken,
}

impl DataResponder {
    pub fn new(
        conn: Connection,
        handler: Arc<dyn DataHandler>,
        shutting_down: Arc<AtomicBool>,
        cancel: CancellationToken,
    ) -> Self {
        let (reader, writer) = framed(conn);
        Self {
            reader,
            writer,
            handler,
            shutting_down,
            cancel,
        }
    }

    pub fn spawn(self) -> tokio::task::JoinHandle<ResponderExit> {
        tokio::spawn(self.run())
    }

    pub async fn run(mut self) -> ResponderExit {
        let exit = loop {
            let frame = tokio::select! {
                frame = read_frame(&mut self.reader) => frame,
                _ = self.cancel.cancelled() => break ResponderExit::Shutdown,
            };

            let request = match frame {
                Frame::Message(Some(request)) => request,
                Frame::Message(None) => break ResponderExit::Stopped,
                Frame::Closed => break ResponderExit::Closed,
                Frame::Failed(e) => {
                    if !self.shutting_down.load(Ordering::Relaxed) {
                        tracing::error!(error = %e, "Data channel read failed");
                    }
                    break ResponderExit::Failed(e.to_string());
                }
            };
            if self.shutting_down.load(Ordering::Relaxed) {
                break ResponderExit::Shutdown;
            }

            tracing::trace!(request_id = %request.id, "Data request received");
            let outcome = dispatch(self.handler.as_ref(), &request).await;
            let response = Response::from_outcome(request.id, outcome);

            if let Err(e) = write_frame(&mut self.writer, response).await {
                if crate::bridge::is_disconnect(&e) {
                    break ResponderExit::Closed;
                }
                if !self.shutting_down.load(Ordering::Relaxed) {
                    tracing::error!(error = %e, "Data channel write failed");
                }
                break ResponderExit::Failed(e.to_string());
            }
        };

        tracing::debug!(?exit, "Data responder exiting");
        exit
    }
}

async fn dispatch(handler: &dyn DataHandler, request: &Request) -> Outcome {
    match AssertUnwindSafe(handler.handle(request)).catch_unwind().await {
        Ok(outcome) => outcome,
        Err(panic) => {
            let info = crate::panic_message(panic.as_ref());
            tracing::error!(request_id = %request.id, %info, "Data handler panicked");
            Outcome::Failure(format!("data handler panicked: {info}"))
        }
    }
}
