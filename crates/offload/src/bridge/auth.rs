//! Per-launch authentication key and the challenge/response run on each stream.
//!
//! Both sides prove knowledge of the key before any framed message flows:
//! the acceptor challenges first, then the connector challenges back.

use std::fmt;
use std::io;

use hmac::{Hmac, Mac};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::Sha256;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

type HmacSha256 = Hmac<Sha256>;

pub const AUTH_KEY_LEN: usize = 32;
const CHALLENGE_LEN: usize = 32;
const DIGEST_LEN: usize = 32;

const VERDICT_WELCOME: u8 = 0x01;
const VERDICT_FAILURE: u8 = 0x00;

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("peer sent a digest that does not match the auth key")]
    DigestMismatch,
    #[error("peer rejected our digest")]
    Rejected,
    #[error("unexpected verdict byte {0:#04x}")]
    BadVerdict(u8),
    #[error("auth key has an invalid length")]
    KeyLength,
    #[error("random source unavailable: {0}")]
    Random(String),
    #[error("i/o during authentication: {0}")]
    Io(#[from] io::Error),
}

/// Fresh random secret shared with exactly one worker launch.
///
/// Hex-encoded on the wire; `Debug` never prints the bytes.
#[derive(Clone, PartialEq, Eq)]
pub struct AuthKey([u8; AUTH_KEY_LEN]);

impl AuthKey {
    pub fn generate() -> Result<Self, AuthError> {
        let mut bytes = [0u8; AUTH_KEY_LEN];
        fill_random(&mut bytes)?;
        Ok(Self(bytes))
    }

    pub fn from_bytes(bytes: [u8; AUTH_KEY_LEN]) -> Self {
        Self(bytes)
    }

    fn digest(&self, challenge: &[u8]) -> Result<HmacSha256, AuthError> {
        let mut mac =
            <HmacSha256 as Mac>::new_from_slice(&self.0).map_err(|_| AuthError::KeyLength)?;
        mac.update(challenge);
        Ok(mac)
    }
}

impl fmt::Debug for AuthKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("AuthKey(<redacted>)")
    }
}

impl Serialize for AuthKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(self.0))
    }
}

impl<'de> Deserialize<'de> for AuthKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        let mut bytes = [0u8; AUTH_KEY_LEN];
        hex::decode_to_slice(&text, &mut bytes).map_err(serde::de::Error::custom)?;
        Ok(Self(bytes))
    }
}

fn fill_random(buf: &mut [u8]) -> Result<(), AuthError> {
    getrandom::getrandom(buf).map_err(|e| AuthError::Random(e.to_string()))
}

/// Challenge the peer and check its answer.
async fn deliver_challenge<S>(stream: &mut S, key: &AuthKey) -> Result<(), AuthError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut challenge = [0u8; CHALLENGE_LEN];
    fill_random(&mut challenge)?;
    stream.write_all(&challenge).await?;
    stream.flush().await?;

    let mut digest = [0u8; DIGEST_LEN];
    stream.read_exact(&mut digest).await?;

    if key.digest(&challenge)?.verify_slice(&digest).is_ok() {
        stream.write_all(&[VERDICT_WELCOME]).await?;
        stream.flush().await?;
        Ok(())
    } else {
        // Best effort: the peer may already be gone.
        let _ = stream.write_all(&[VERDICT_FAILURE]).await;
        let _ = stream.flush().await;
        Err(AuthError::DigestMismatch)
    }
}

/// Answer the peer's challenge and read its verdict.
async fn answer_challenge<S>(stream: &mut S, key: &AuthKey) -> Result<(), AuthError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut challenge = [0u8; CHALLENGE_LEN];
    stream.read_exact(&mut challenge).await?;

    let digest = key.digest(&challenge)?.finalize().into_bytes();
    stream.write_all(&digest).await?;
    stream.flush().await?;

    let mut verdict = [0u8; 1];
    stream.read_exact(&mut verdict).await?;
    match verdict[0] {
        VERDICT_WELCOME => Ok(()),
        VERDICT_FAILURE => Err(AuthError::Rejected),
        other => Err(AuthError::BadVerdict(other)),
    }
}

/// Run on a stream the host just accepted.
pub async fn authenticate_acceptor<S>(stream: &mut S, key: &AuthKey) -> Result<(), AuthError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    deliver_challenge(stream, key).await?;
    answer_challenge(stream, key).await
}

/// Run on a stream the worker just connected.
pub async fn authenticate_connector<S>(stream: &mut S, key: &AuthKey) -> Result<(), AuthError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    answer_challenge(stream, key).await?;
    deliver_challenge(stream, key).await
}
