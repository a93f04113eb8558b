//! Session state and the storage abstraction the connection coordinator
//! depends on: create/get/join/leave/update/active/expire, fronted by a
//! short-TTL in-process cache.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use moka::future::Cache;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::{CollabError, Result};

/// Content seeded into a freshly created session when the caller does not
/// supply one, matching the welcome text the system this is modeled on
/// greets first-time sessions with.
pub const DEFAULT_WELCOME_CONTENT: &str =
    "// Welcome to the collaborative code editor!\n// Start typing to begin...\n";

pub const SESSION_TTL: Duration = Duration::from_secs(24 * 3600);
pub const PRESENCE_TTL: Duration = Duration::from_secs(300);
const LOCAL_CACHE_TTL: Duration = Duration::from_secs(30);

fn now_epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Durable per-session record. `users` is the durable superset of everyone
/// who has ever joined and not explicitly left; the live set is tracked
/// separately by presence (see [`PresenceTracker`] in `presence.rs`) and is
/// authoritative for "who is here right now".
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionState {
    pub session_id: String,
    pub content: String,
    pub users: HashSet<String>,
    pub created_at: u64,
    pub last_activity: u64,
    pub version: u64,
    pub operation_count: u64,
    pub content_checksum: String,
}

impl SessionState {
    fn new(session_id: String, content: String) -> Self {
        let now = now_epoch_secs();
        let content_checksum = Self::checksum(&content);
        Self {
            session_id,
            content,
            users: HashSet::new(),
            created_at: now,
            last_activity: now,
            version: 0,
            operation_count: 0,
            content_checksum,
        }
    }

    fn checksum(content: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(content.as_bytes());
        let digest = hasher.finalize();
        let mut s = String::with_capacity(16);
        for byte in digest.iter() {
            if s.len() >= 16 {
                break;
            }
            s.push_str(&format!("{:02x}", byte));
        }
        s.truncate(16);
        s
    }

    /// Recomputes the checksum and compares it against the stored one.
    pub fn verify_integrity(&self) -> bool {
        Self::checksum(&self.content) == self.content_checksum
    }

    fn touch(&mut self) {
        self.last_activity = now_epoch_secs();
    }

    fn is_expired(&self, ttl: Duration) -> bool {
        now_epoch_secs().saturating_sub(self.last_activity) > ttl.as_secs()
    }
}

/// A lightweight view of a session, returned by `active()` for a dashboard
/// or admin surface without handing out the full mutable record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSummary {
    pub session_id: String,
    pub user_count: usize,
    pub content_length: usize,
    pub version: u64,
    pub operation_count: u64,
}

impl From<&SessionState> for SessionSummary {
    fn from(s: &SessionState) -> Self {
        Self {
            session_id: s.session_id.clone(),
            user_count: s.users.len(),
            content_length: s.content.chars().count(),
            version: s.version,
            operation_count: s.operation_count,
        }
    }
}

/// Narrow storage interface a coordinator depends on. Any backing store —
/// an in-memory map (used here), or a remote key/value service — implements
/// this trait; the coordinator is agnostic to which.
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn create(&self, session_id: Option<String>, initial_content: Option<String>) -> Result<SessionState>;
    async fn get(&self, session_id: &str) -> Result<Option<SessionState>>;
    async fn join(&self, session_id: &str, user_id: &str) -> Result<SessionState>;
    async fn leave(&self, session_id: &str, user_id: &str) -> Result<()>;
    async fn update_content(&self, session_id: &str, content: String) -> Result<bool>;
    async fn active(&self) -> Result<HashMap<String, SessionSummary>>;
    async fn expire(&self) -> Result<usize>;
}

#[derive(Default)]
struct StoreStats {
    cache_hits: u64,
    cache_misses: u64,
    store_errors: u64,
}

/// In-process session store: a write-through map fronted by a short-TTL
/// cache. There is no remote failure mode in this backend, but the cache is
/// still consulted first (and kept warm) so a future remote-backed store can
/// be swapped in behind this same trait without changing the coordinator.
pub struct InMemorySessionStore {
    sessions: Arc<RwLock<HashMap<String, SessionState>>>,
    cache: Cache<String, SessionState>,
    stats: Arc<RwLock<StoreStats>>,
}

impl InMemorySessionStore {
    pub fn new() -> Self {
        Self {
            sessions: Arc::new(RwLock::new(HashMap::new())),
            cache: Cache::builder().time_to_live(LOCAL_CACHE_TTL).build(),
            stats: Arc::new(RwLock::new(StoreStats::default())),
        }
    }

    pub async fn cache_hits(&self) -> u64 {
        self.stats.read().await.cache_hits
    }

    pub async fn cache_misses(&self) -> u64 {
        self.stats.read().await.cache_misses
    }

    pub async fn store_errors(&self) -> u64 {
        self.stats.read().await.store_errors
    }

    async fn load(&self, session_id: &str) -> Option<SessionState> {
        if let Some(cached) = self.cache.get(session_id).await {
            self.stats.write().await.cache_hits += 1;
            return Some(cached);
        }
        self.stats.write().await.cache_misses += 1;
        let sessions = self.sessions.read().await;
        sessions.get(session_id).cloned()
    }

    async fn store(&self, state: SessionState) {
        self.cache.insert(state.session_id.clone(), state.clone()).await;
        let mut sessions = self.sessions.write().await;
        sessions.insert(state.session_id.clone(), state);
    }
}

impl Default for InMemorySessionStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SessionStore for InMemorySessionStore {
    async fn create(&self, session_id: Option<String>, initial_content: Option<String>) -> Result<SessionState> {
        let session_id = session_id.unwrap_or_else(|| Uuid::new_v4().to_string()[..8].to_string());

        if let Some(existing) = self.load(&session_id).await {
            return Ok(existing);
        }

        let content = initial_content.unwrap_or_else(|| DEFAULT_WELCOME_CONTENT.to_string());
        let state = SessionState::new(session_id, content);
        self.store(state.clone()).await;
        Ok(state)
    }

    async fn get(&self, session_id: &str) -> Result<Option<SessionState>> {
        Ok(self.load(session_id).await)
    }

    async fn join(&self, session_id: &str, user_id: &str) -> Result<SessionState> {
        let mut state = match self.load(session_id).await {
            Some(state) => state,
            None => self.create(Some(session_id.to_string()), None).await?,
        };
        state.users.insert(user_id.to_string());
        state.touch();
        self.store(state.clone()).await;
        Ok(state)
    }

    async fn leave(&self, session_id: &str, user_id: &str) -> Result<()> {
        if let Some(mut state) = self.load(session_id).await {
            state.users.remove(user_id);
            state.touch();
            self.store(state).await;
        }
        Ok(())
    }

    async fn update_content(&self, session_id: &str, content: String) -> Result<bool> {
        let mut state = match self.load(session_id).await {
            Some(state) => state,
            None => return Ok(false),
        };
        state.content = content;
        state.content_checksum = SessionState::checksum(&state.content);
        state.version += 1;
        state.operation_count += 1;
        state.touch();
        self.store(state).await;
        Ok(true)
    }

    async fn active(&self) -> Result<HashMap<String, SessionSummary>> {
        let sessions = self.sessions.read().await;
        Ok(sessions
            .iter()
            .filter(|(_, s)| !s.is_expired(SESSION_TTL))
            .map(|(id, s)| (id.clone(), SessionSummary::from(s)))
            .collect())
    }

    async fn expire(&self) -> Result<usize> {
        let mut sessions = self.sessions.write().await;
        let expired: Vec<String> = sessions
            .iter()
            .filter(|(_, s)| s.is_expired(SESSION_TTL))
            .map(|(id, _)| id.clone())
            .collect();
        for id in &expired {
            sessions.remove(id);
            self.cache.invalidate(id).await;
        }
        Ok(expired.len())
    }
}
