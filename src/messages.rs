//! The wire-level JSON message shapes exchanged between a client and its
//! connection (§6). Client messages are parsed with `serde`'s tagged-enum
//! support, the same `#[serde(tag = "type", ...)]` pattern the teacher's
//! `websocket.rs: CollaborationMessage` uses; server messages are produced
//! directly rather than round-tripped.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::metrics::MetricsSnapshot;
use crate::operation::Operation;
use crate::vector_clock::VectorClock;

/// A message sent by a client over its channel.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    TextChange {
        content: String,
        #[serde(default)]
        cursor_position: usize,
        #[serde(default)]
        vector_clock: std::collections::HashMap<String, u64>,
    },
    CursorChange {
        position: usize,
        #[serde(default)]
        selection_start: Option<usize>,
        #[serde(default)]
        selection_end: Option<usize>,
    },
    Ping,
    GetMetrics,
}

impl ClientMessage {
    /// Parses a raw JSON text frame, reporting malformed JSON and unknown
    /// `type` values distinctly so the coordinator can count them under the
    /// right error kind.
    pub fn parse(text: &str) -> Result<ClientMessage, ClientMessageParseError> {
        let value: Value = serde_json::from_str(text).map_err(ClientMessageParseError::Json)?;
        let message_type = value
            .get("type")
            .and_then(Value::as_str)
            .ok_or(ClientMessageParseError::MissingType)?;

        match message_type {
            "text_change" | "cursor_change" | "ping" | "get_metrics" => {
                serde_json::from_value(value).map_err(ClientMessageParseError::Json)
            }
            other => Err(ClientMessageParseError::UnknownType(other.to_string())),
        }
    }
}

#[derive(Debug)]
pub enum ClientMessageParseError {
    Json(serde_json::Error),
    MissingType,
    UnknownType(String),
}

impl std::fmt::Display for ClientMessageParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Json(e) => write!(f, "malformed message: {e}"),
            Self::MissingType => write!(f, "message missing required \"type\" field"),
            Self::UnknownType(t) => write!(f, "unknown message type: {t}"),
        }
    }
}

/// Performance figures embedded in a broadcast `text_change`, mirroring the
/// teacher/original's `buffer.get_performance_metrics()` subset.
#[derive(Debug, Clone, Serialize)]
pub struct TextChangePerformance {
    pub processing_time_ms: f64,
    pub operations_processed: u64,
}

/// A message the coordinator sends out over a client's channel.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    SessionJoined {
        session_id: String,
        user_id: String,
        content: String,
        users: Vec<String>,
        buffer_state: BufferStateView,
        server_time: f64,
    },
    UserJoined {
        user_id: String,
        timestamp: f64,
    },
    UserLeft {
        user_id: String,
        timestamp: f64,
    },
    TextChange {
        content: String,
        user_id: String,
        operations: Vec<Operation>,
        vector_clock: VectorClock,
        timestamp: f64,
        performance: TextChangePerformance,
    },
    CursorChange {
        user_id: String,
        position: usize,
        selection_start: Option<usize>,
        selection_end: Option<usize>,
        timestamp: f64,
    },
    Ping {
        server_time: f64,
    },
    Pong {
        server_time: f64,
    },
    Metrics {
        data: MetricsSnapshot,
    },
    Error {
        message: String,
    },
}

impl ServerMessage {
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).expect("ServerMessage always serializes")
    }
}

/// A trimmed view of `OperationBuffer` sent to a client on join, matching
/// the `buffer_state` field of `session_joined`.
#[derive(Debug, Clone, Serialize)]
pub struct BufferStateView {
    pub content_length: usize,
    pub vector_clock: VectorClock,
    pub state_hash: String,
    pub history_length: usize,
}
