use serde::{Deserialize, Deserializer, Serialize};
use thiserror::Error;

/// Frames received on a session stream.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamFrame {
    /// Full replacement of the session text.
    Snapshot {
        session: String,
        #[serde(default, deserialize_with = "null_as_empty")]
        data: String,
    },
    /// Text appended to the session.
    Delta {
        session: String,
        #[serde(default, deserialize_with = "null_as_empty")]
        data: String,
    },
    /// Server-declared end of the session.
    #[serde(alias = "session_closed")]
    Closed {
        session: String,
        #[serde(default)]
        data: Option<String>,
    },
    Error {
        #[serde(default)]
        session: Option<String>,
        #[serde(default)]
        data: Option<String>,
    },
}

impl StreamFrame {
    pub fn session(&self) -> Option<&str> {
        match self {
            StreamFrame::Snapshot { session, .. }
            | StreamFrame::Delta { session, .. }
            | StreamFrame::Closed { session, .. } => Some(session),
            StreamFrame::Error { session, .. } => session.as_deref(),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            StreamFrame::Snapshot { .. } => "snapshot",
            StreamFrame::Delta { .. } => "delta",
            StreamFrame::Closed { .. } => "closed",
            StreamFrame::Error { .. } => "error",
        }
    }
}

/// Frames the client writes; authentication is always first.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    Auth {
        session: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        token: Option<String>,
    },
}

#[derive(Error, Debug)]
pub enum FrameError {
    #[error("malformed frame: {0}")]
    Malformed(#[from] serde_json::Error),
}

pub fn parse_frame(text: &str) -> Result<StreamFrame, FrameError> {
    Ok(serde_json::from_str(text)?)
}

fn null_as_empty<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<String>::deserialize(deserializer)?.unwrap_or_default())
}
