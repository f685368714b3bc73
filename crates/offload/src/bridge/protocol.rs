//! Wire protocol types for host-worker communication.
//!
//! Two channels, same message shapes:
//! - **Control channel**: host issues `Request`s, worker answers with `Response`s.
//! - **Data channel**: worker issues `Request`s, host answers with `Response`s.
//!
//! On either channel a `null` frame in place of a `Request` asks the serving
//! loop to stop, so the request side of the wire is typed `Option<Request>`.

use serde::{Deserialize, Serialize};

use super::auth::AuthKey;
use super::transport::EndpointAddress;

/// Correlation token linking a `Request` to its `Response`.
///
/// Generated by whichever side issues the call. UUID v4 keeps ids unique per
/// outstanding call without any shared counter between the two processes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(uuid::Uuid);

impl RequestId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &uuid::Uuid {
        &self.0
    }

    pub fn parse(s: &str) -> Result<Self, uuid::Error> {
        let uuid = uuid::Uuid::parse_str(s)?;
        Ok(Self(uuid))
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A call issued over either channel. The payload is opaque to this crate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub id: RequestId,
    pub payload: serde_json::Value,
}

impl Request {
    /// Wrap a payload with a freshly generated correlation id.
    pub fn new(payload: serde_json::Value) -> Self {
        Self {
            id: RequestId::new(),
            payload,
        }
    }

    pub fn with_id(id: RequestId, payload: serde_json::Value) -> Self {
        Self { id, payload }
    }
}

/// What a handler produced for one request.
///
/// Kept separate from `Response` so that exactly one of answer / failure is
/// ever populated on the wire.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Answer(serde_json::Value),
    /// Handler raised; the text describes the failure.
    Failure(String),
}

impl Outcome {
    pub fn failure(info: impl Into<String>) -> Self {
        Self::Failure(info.into())
    }

    /// Render an error chain the way it ends up in `failure_info`.
    pub fn from_error(err: &anyhow::Error) -> Self {
        Self::Failure(format!("{err:#}"))
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, Self::Failure(_))
    }
}

impl From<anyhow::Result<serde_json::Value>> for Outcome {
    fn from(result: anyhow::Result<serde_json::Value>) -> Self {
        match result {
            Ok(value) => Self::Answer(value),
            Err(e) => Self::from_error(&e),
        }
    }
}

/// Reply to a `Request`, correlated by `request_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub request_id: RequestId,
    pub answer: Option<serde_json::Value>,
    pub failure_info: Option<String>,
}

impl Response {
    pub fn from_outcome(request_id: RequestId, outcome: Outcome) -> Self {
        match outcome {
            Outcome::Answer(value) => Self {
                request_id,
                answer: Some(value),
                failure_info: None,
            },
            Outcome::Failure(info) => Self {
                request_id,
                answer: None,
                failure_info: Some(info),
            },
        }
    }

    /// `failure_info` takes precedence: a present failure means the remote
    /// handler raised, whatever `answer` holds.
    pub fn into_outcome(self) -> Outcome {
        match (self.failure_info, self.answer) {
            (Some(info), _) => Outcome::Failure(info),
            (None, value) => Outcome::Answer(value.unwrap_or(serde_json::Value::Null)),
        }
    }

    pub fn is_failure(&self) -> bool {
        self.failure_info.is_some()
    }
}

/// Written once to the worker's stdin, then stdin is closed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandshakePayload {
    pub address: EndpointAddress,
    pub auth_key: AuthKey,
}
