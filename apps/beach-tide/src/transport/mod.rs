//! Transport endpoints used by the engine.
//!
//! Two seams: [`SessionApi`] for request/response calls (directory, tail
//! fetch, command delivery, ping) and [`StreamConnector`] for per-session
//! duplex streams. Both are stateless; all bookkeeping lives above them.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;
use thiserror::Error;
use url::Url;

pub mod frame;
pub mod http;
pub mod mock;
pub mod websocket;

pub use frame::{ClientFrame, FrameError, StreamFrame, parse_frame};
pub use http::HttpSessionApi;
pub use websocket::WebSocketConnector;

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("invalid endpoint: {0}")]
    InvalidEndpoint(String),
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),
    #[error("unexpected http status {0}")]
    HttpStatus(StatusCode),
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("connect timed out after {0:?}")]
    ConnectTimeout(Duration),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("server rejected request: {0}")]
    Rejected(String),
}

/// Append `segments` under `base`'s path. Each segment is percent-encoded,
/// so a session id cannot reach into the query, fragment or parent path.
pub(crate) fn endpoint_url(base: &Url, segments: &[&str]) -> Result<Url, TransportError> {
    if let Some(bad) = segments
        .iter()
        .find(|segment| matches!(**segment, "" | "." | ".."))
    {
        return Err(TransportError::InvalidEndpoint(format!(
            "path segment {bad:?} under {base}"
        )));
    }
    let mut url = base.clone();
    url.path_segments_mut()
        .map_err(|_| TransportError::InvalidEndpoint(format!("{base} cannot be a base")))?
        .pop_if_empty()
        .extend(segments);
    Ok(url)
}

/// One entry from the session directory.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct SessionSummary {
    pub id: String,
    /// Creation time as unix seconds, when the server reports it.
    #[serde(default)]
    pub created_at: Option<i64>,
}

/// Immediate acknowledgement for a delivered command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandAck {
    pub message: Option<String>,
    /// Fresh output tail, when the server includes one.
    pub tail: Option<String>,
}

#[async_trait]
pub trait SessionApi: Send + Sync {
    async fn list_sessions(&self) -> Result<Vec<SessionSummary>, TransportError>;

    async fn fetch_tail(&self, session: &str, lines: usize) -> Result<String, TransportError>;

    /// Deliver a prompt through the AI path.
    async fn send_prompt(&self, session: &str, payload: &str)
    -> Result<CommandAck, TransportError>;

    /// Deliver a command through direct shell execution.
    async fn exec_shell(&self, session: &str, payload: &str)
    -> Result<CommandAck, TransportError>;

    async fn ping(&self) -> Result<(), TransportError>;
}

#[async_trait]
pub trait StreamConnector: Send + Sync {
    /// Open a stream for `session`. Implementations write the authentication
    /// frame before returning.
    async fn connect(
        &self,
        session: &str,
        credential: Option<&str>,
    ) -> Result<Box<dyn StreamConnection>, TransportError>;
}

#[async_trait]
pub trait StreamConnection: Send {
    /// Next raw text frame; `None` once the peer has gone away.
    async fn recv(&mut self) -> Option<Result<String, TransportError>>;

    async fn close(&mut self);
}
