//! IPC bridge for host-worker communication.
//!
//! This module provides everything below the supervisor: the endpoint the
//! worker connects to, the authentication run on each stream, the wire
//! types and their framing.
//!
//! # Architecture
//!
//! - **transport**: ephemeral endpoint (abstract/named unix socket, TCP loopback)
//! - **auth**: per-launch key and mutual HMAC challenge/response
//! - **protocol**: Request/Response messages and the handshake payload
//! - **codec**: JSON framing codec for AsyncRead/AsyncWrite

pub mod auth;
pub mod codec;
pub mod protocol;
pub mod transport;

use futures::{SinkExt, StreamExt};
use serde::{Serialize, de::DeserializeOwned};
use tokio::io::{ReadHalf, WriteHalf};
use tokio_util::codec::{FramedRead, FramedWrite};

use codec::JsonCodec;
use transport::Connection;

pub type ChannelReader<T> = FramedRead<ReadHalf<Connection>, JsonCodec<T>>;
pub type ChannelWriter<T> = FramedWrite<WriteHalf<Connection>, JsonCodec<T>>;

/// Split an authenticated stream into framed halves: `In` is read, `Out` written.
pub fn framed<In, Out>(conn: Connection) -> (ChannelReader<In>, ChannelWriter<Out>)
where
    In: DeserializeOwned,
    Out: Serialize,
{
    let (read_half, write_half) = tokio::io::split(conn);
    (
        FramedRead::new(read_half, JsonCodec::new()),
        FramedWrite::new(write_half, JsonCodec::new()),
    )
}

/// Outcome of reading one frame, with end-of-stream separated from failure.
#[derive(Debug)]
pub enum Frame<T> {
    Message(T),
    Closed,
    Failed(std::io::Error),
}

pub async fn read_frame<T: DeserializeOwned>(reader: &mut ChannelReader<T>) -> Frame<T> {
    match reader.next().await {
        Some(Ok(msg)) => Frame::Message(msg),
        Some(Err(e)) if is_disconnect(&e) => Frame::Closed,
        Some(Err(e)) => Frame::Failed(e),
        None => Frame::Closed,
    }
}

pub async fn write_frame<T: Serialize>(
    writer: &mut ChannelWriter<T>,
    msg: T,
) -> std::io::Result<()> {
    writer.send(msg).await
}

/// Peer-went-away errors count as a closed channel, not a transport failure.
pub fn is_disconnect(err: &std::io::Error) -> bool {
    use std::io::ErrorKind;
    matches!(
        err.kind(),
        ErrorKind::BrokenPipe
            | ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::UnexpectedEof
            | ErrorKind::NotConnected
    )
}
