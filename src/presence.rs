//! Short-TTL tracking of who is currently connected to a session, kept
//! separate from the durable `SessionState.users` superset in `session.rs`.
//!
//! Grounded on the teacher's `presence.rs` (a `RwLock`-guarded map shape)
//! narrowed to the one responsibility the spec actually needs, and on
//! `original_source/backend/app/sessions.py: _track_user_presence /
//! _get_active_users / _cleanup_inactive_users`, whose `session_users:{id}`
//! hash of `user_id -> last_seen` this mirrors directly. Presence is
//! authoritative for "who is here right now"; `session.rs`'s `users` set is
//! reconciled against it on leave and on the periodic expire sweep (spec §9
//! Open Question, resolved in `DESIGN.md`).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio::sync::RwLock;

pub const PRESENCE_TTL: Duration = Duration::from_secs(300);

fn now_epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Per-session `user_id -> last_seen` records, TTL-expired lazily on read.
#[derive(Default)]
pub struct PresenceTracker {
    sessions: Arc<RwLock<HashMap<String, HashMap<String, u64>>>>,
}

impl PresenceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks `user_id` as currently present in `session_id`, refreshing its
    /// TTL. Called on connect and on any activity (cursor move, text
    /// change, ping).
    pub async fn touch(&self, session_id: &str, user_id: &str) {
        let mut sessions = self.sessions.write().await;
        sessions
            .entry(session_id.to_string())
            .or_default()
            .insert(user_id.to_string(), now_epoch_secs());
    }

    /// Removes `user_id` from `session_id`'s presence record immediately,
    /// rather than waiting for its TTL to lapse. Called on disconnect.
    pub async fn remove(&self, session_id: &str, user_id: &str) {
        let mut sessions = self.sessions.write().await;
        if let Some(users) = sessions.get_mut(session_id) {
            users.remove(user_id);
            if users.is_empty() {
                sessions.remove(session_id);
            }
        }
    }

    /// The set of users whose presence record for `session_id` has not
    /// expired, i.e. the live user set the spec treats as authoritative.
    pub async fn active_users(&self, session_id: &str) -> Vec<String> {
        let sessions = self.sessions.read().await;
        let Some(users) = sessions.get(session_id) else {
            return Vec::new();
        };
        let now = now_epoch_secs();
        users
            .iter()
            .filter(|(_, &last_seen)| now.saturating_sub(last_seen) < PRESENCE_TTL.as_secs())
            .map(|(user_id, _)| user_id.clone())
            .collect()
    }

    /// Sweeps every session's presence map, dropping entries past their
    /// TTL and empty session entries. Returns the number of users removed,
    /// for the periodic `expire()` pass to log.
    pub async fn prune_expired(&self) -> usize {
        let mut sessions = self.sessions.write().await;
        let now = now_epoch_secs();
        let mut removed = 0;

        sessions.retain(|_, users| {
            let before = users.len();
            users.retain(|_, &mut last_seen| now.saturating_sub(last_seen) < PRESENCE_TTL.as_secs());
            removed += before - users.len();
            !users.is_empty()
        });

        removed
    }
}
