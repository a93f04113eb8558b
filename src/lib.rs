//! Real-time collaborative text editing: an operational-transform engine
//! plus the session coordinator that fans operations out to connected
//! peers and keeps a canonical per-session document.
//!
//! Module layout mirrors the component breakdown: [`vector_clock`] and
//! [`operation`] are the core data model, [`ot`] is the pure transformation
//! algebra, [`buffer`] is the per-session state machine built on top of it,
//! [`session`] is the storage abstraction the coordinator depends on, and
//! [`coordinator`] ties connections, the buffer, and the store together.
//! [`messages`], [`metrics`], [`presence`], and [`config`] are the wire
//! schema and supporting ambient concerns; [`server`] is the thin
//! WebSocket front door.

pub mod buffer;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod messages;
pub mod metrics;
pub mod operation;
pub mod ot;
pub mod presence;
pub mod server;
pub mod session;
pub mod vector_clock;

pub use error::{CollabError, Result};
