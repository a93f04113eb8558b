//! Error taxonomy shared by the OT engine, buffer, session store, and
//! connection coordinator.

use thiserror::Error;

/// Unified error type for every fallible operation in this crate.
///
/// Each variant maps to one of the failure classes described in the design
/// notes: integrity failures and invalid messages are reported back to the
/// offending client, rate limiting and store fallbacks are logged and
/// swallowed, channel errors trigger a disconnect, and internal errors are
/// logged but never tear down a session.
#[derive(Debug, Error)]
pub enum CollabError {
    #[error("operation failed integrity check: {0}")]
    Integrity(String),

    #[error("invalid message: {0}")]
    InvalidMessage(String),

    #[error("rate limit exceeded for client {client_id}")]
    RateLimited { client_id: String },

    #[error("session store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("channel error: {0}")]
    Channel(String),

    #[error("internal error: {0}")]
    Internal(String),

    #[error("session not found: {0}")]
    SessionNotFound(String),

    #[error(transparent)]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, CollabError>;
