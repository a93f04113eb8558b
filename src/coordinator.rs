//! The connection coordinator (C6): accepts connections, routes messages,
//! fans operations out to peers, rate-limits, and runs the periodic health
//! and retention sweeps.
//!
//! Grounded directly on `original_source/backend/app/manager.py:
//! AdvancedConnectionManager` (`connect`/`disconnect`/`broadcast_to_session`/
//! `handle_message`/`_check_rate_limit`/`_health_check_loop`/`_cleanup_loop`),
//! reshaped into the teacher's `websocket.rs` per-connection-task idiom.
//! Per the design notes (§9), live channels are addressed by a stable `u64`
//! handle rather than held as long-lived references, so the coordinator
//! never needs a cyclic pointer back into the transport layer.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::{mpsc, RwLock};

use crate::buffer::OperationBuffer;
use crate::config::Config;
use crate::error::{CollabError, Result};
use crate::messages::{BufferStateView, ClientMessage, ClientMessageParseError, ServerMessage, TextChangePerformance};
use crate::metrics::MetricsAggregator;
use crate::ot::engine;
use crate::presence::PresenceTracker;
use crate::session::{SessionState, SessionStore};
use crate::vector_clock::VectorClock;

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

fn now_secs_f64() -> f64 {
    now_ms() as f64 / 1000.0
}

/// A connection's locally observed state, addressed by a stable `ConnectionId`
/// rather than any transport-level handle.
struct ChannelState {
    user_id: String,
    sender: mpsc::UnboundedSender<ServerMessage>,
    cursor_position: usize,
    last_activity: Instant,
    vector_clock: VectorClock,
}

pub type ConnectionId = u64;

struct SessionRuntime {
    buffer: OperationBuffer,
    channels: HashMap<ConnectionId, ChannelState>,
}

/// Per-user sliding window of recent request timestamps, bounded per §3's
/// "at most 100 entries" record shape.
struct RateLimitRecord {
    requests: VecDeque<Instant>,
}

pub struct Coordinator {
    config: Config,
    store: Arc<dyn SessionStore>,
    presence: Arc<PresenceTracker>,
    metrics: Arc<MetricsAggregator>,
    sessions: RwLock<HashMap<String, SessionRuntime>>,
    rate_limits: RwLock<HashMap<String, RateLimitRecord>>,
    /// Last-known-good `SessionState` per session, consulted when a store
    /// call times out or errors (§4.5, §5: "the coordinator falls back to
    /// the cached value and records an error").
    session_cache: RwLock<HashMap<String, SessionState>>,
    next_connection_id: AtomicU64,
}

impl Coordinator {
    pub fn new(config: Config, store: Arc<dyn SessionStore>, metrics: Arc<MetricsAggregator>) -> Self {
        Self {
            config,
            store,
            presence: Arc::new(PresenceTracker::new()),
            metrics,
            sessions: RwLock::new(HashMap::new()),
            rate_limits: RwLock::new(HashMap::new()),
            session_cache: RwLock::new(HashMap::new()),
            next_connection_id: AtomicU64::new(1),
        }
    }

    pub fn metrics(&self) -> &Arc<MetricsAggregator> {
        &self.metrics
    }

    /// Records a transport-level connection error (§7 `ChannelError`),
    /// driven by the WebSocket front door's receive-loop error path.
    pub fn record_connection_error(&self) {
        self.metrics.record_connection_error();
    }

    /// Calls `SessionStore::join`, enforcing the configured store timeout.
    /// On timeout or store error, records a `store_unavailable` error and
    /// falls back to the last cached `SessionState` for this session; if
    /// nothing has ever been cached, the failure is surfaced as
    /// `StoreUnavailable`.
    async fn store_join(&self, session_id: &str, user_id: &str) -> Result<SessionState> {
        let call = self.store.join(session_id, user_id);
        match tokio::time::timeout(self.config.store_call_timeout(), call).await {
            Ok(Ok(state)) => {
                self.session_cache
                    .write()
                    .await
                    .insert(session_id.to_string(), state.clone());
                Ok(state)
            }
            Ok(Err(e)) => self.store_unavailable(session_id, e.to_string()).await,
            Err(_) => {
                self.store_unavailable(session_id, format!("store join timed out for {session_id}"))
                    .await
            }
        }
    }

    async fn store_unavailable(&self, session_id: &str, reason: String) -> Result<SessionState> {
        self.metrics.record_error("store_unavailable").await;
        log::warn!("session store unavailable for {session_id}: {reason}");
        self.session_cache
            .read()
            .await
            .get(session_id)
            .cloned()
            .ok_or(CollabError::StoreUnavailable(reason))
    }

    /// Calls `SessionStore::leave`, enforcing the configured store timeout.
    /// Failures here are logged and counted but never propagated: a
    /// connection is already gone from the in-memory session by the time
    /// this runs, so there is nothing left for the caller to do about it.
    async fn store_leave(&self, session_id: &str, user_id: &str) {
        let call = self.store.leave(session_id, user_id);
        match tokio::time::timeout(self.config.store_call_timeout(), call).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                self.metrics.record_error("store_unavailable").await;
                log::warn!("session store leave failed for {session_id}/{user_id}: {e}");
            }
            Err(_) => {
                self.metrics.record_error("store_unavailable").await;
                log::warn!("session store leave timed out for {session_id}/{user_id}");
            }
        }
    }

    /// Calls `SessionStore::update_content`, enforcing the configured store
    /// timeout. Per §7, store errors are masked at the coordinator boundary:
    /// the buffer already holds the authoritative content used for
    /// broadcast, so a persistence failure here is logged and counted, not
    /// surfaced to the client.
    async fn store_update_content(&self, session_id: &str, content: String) {
        let call = self.store.update_content(session_id, content);
        match tokio::time::timeout(self.config.store_call_timeout(), call).await {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => {
                self.metrics.record_error("store_unavailable").await;
                log::warn!("session store update_content failed for {session_id}: {e}");
            }
            Err(_) => {
                self.metrics.record_error("store_unavailable").await;
                log::warn!("session store update_content timed out for {session_id}");
            }
        }
    }

    async fn active_session_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// Accepts a new connection into `session_id`, creating the session's
    /// buffer (seeded from the store) if this is its first live channel.
    /// Returns the resolved `user_id` and the connection's stable handle.
    pub async fn connect(
        &self,
        session_id: &str,
        user_id: Option<String>,
        sender: mpsc::UnboundedSender<ServerMessage>,
    ) -> Result<(ConnectionId, String)> {
        let started = Instant::now();
        let user_id = user_id.unwrap_or_else(|| format!("user_{}", &uuid::Uuid::new_v4().to_string()[..8]));

        // A user whose presence record is still live for this session is
        // establishing a second, concurrent connection to it — a reconnect
        // (e.g. a dropped socket retried by the client) rather than a brand
        // new participant.
        let is_reconnect = self.presence.active_users(session_id).await.contains(&user_id);

        let mut sessions = self.sessions.write().await;
        if !sessions.contains_key(session_id) {
            let state = self.store_join(session_id, &user_id).await?;
            let buffer = OperationBuffer::new("server", state.content);
            sessions.insert(
                session_id.to_string(),
                SessionRuntime {
                    buffer,
                    channels: HashMap::new(),
                },
            );
        } else {
            // The session's buffer already lives in memory; a failure here
            // only affects the durable user list in the store, not this
            // connection, so it is logged/counted rather than propagated.
            let _ = self.store_join(session_id, &user_id).await;
        }

        let connection_id = self.next_connection_id.fetch_add(1, Ordering::Relaxed);
        let runtime = sessions.get_mut(session_id).expect("just inserted or already present");
        runtime.channels.insert(
            connection_id,
            ChannelState {
                user_id: user_id.clone(),
                sender: sender.clone(),
                cursor_position: 0,
                last_activity: Instant::now(),
                vector_clock: VectorClock::new(),
            },
        );

        let content = runtime.buffer.content().to_string();
        let users: Vec<String> = runtime.channels.values().map(|c| c.user_id.clone()).collect();
        let buffer_state = BufferStateView {
            content_length: content.chars().count(),
            vector_clock: runtime.buffer.vector_clock().clone(),
            state_hash: runtime.buffer.state_hash().to_string(),
            history_length: runtime.buffer.history().len(),
        };
        drop(sessions);

        self.presence.touch(session_id, &user_id).await;

        let _ = sender.send(ServerMessage::SessionJoined {
            session_id: session_id.to_string(),
            user_id: user_id.clone(),
            content,
            users,
            buffer_state,
            server_time: now_secs_f64(),
        });

        self.broadcast(
            session_id,
            ServerMessage::UserJoined {
                user_id: user_id.clone(),
                timestamp: now_secs_f64(),
            },
            Some(connection_id),
        )
        .await;

        self.metrics.record_connection_opened();
        if is_reconnect {
            self.metrics.record_reconnection_attempt();
        }
        self.metrics
            .record_latency(started.elapsed().as_secs_f64() * 1000.0)
            .await;

        Ok((connection_id, user_id))
    }

    /// Removes a connection from its session. Idempotent: disconnecting an
    /// already-removed connection id is a no-op.
    pub async fn disconnect(&self, session_id: &str, connection_id: ConnectionId) {
        let user_id = {
            let mut sessions = self.sessions.write().await;
            let Some(runtime) = sessions.get_mut(session_id) else {
                return;
            };
            let Some(channel) = runtime.channels.remove(&connection_id) else {
                return;
            };
            channel.user_id
        };

        self.presence.remove(session_id, &user_id).await;
        self.store_leave(session_id, &user_id).await;
        self.metrics.record_connection_closed();

        self.broadcast(
            session_id,
            ServerMessage::UserLeft {
                user_id,
                timestamp: now_secs_f64(),
            },
            None,
        )
        .await;
    }

    /// Sends `message` to every live channel in `session_id` except
    /// `exclude`, in parallel, isolating per-peer send failures. Any channel
    /// whose send fails is disconnected once the fan-out completes.
    async fn broadcast(&self, session_id: &str, message: ServerMessage, exclude: Option<ConnectionId>) {
        let senders: Vec<(ConnectionId, mpsc::UnboundedSender<ServerMessage>)> = {
            let sessions = self.sessions.read().await;
            let Some(runtime) = sessions.get(session_id) else {
                return;
            };
            runtime
                .channels
                .iter()
                .filter(|(id, _)| Some(**id) != exclude)
                .map(|(id, channel)| (*id, channel.sender.clone()))
                .collect()
        };

        let tasks: Vec<_> = senders
            .into_iter()
            .map(|(id, sender)| {
                let message = message.clone();
                tokio::spawn(async move {
                    let ok = sender.send(message).is_ok();
                    (id, ok)
                })
            })
            .collect();

        let mut failed = Vec::new();
        for task in tasks {
            match task.await {
                Ok((_, true)) => {
                    self.metrics.increment_message_count().await;
                }
                Ok((id, false)) => failed.push(id),
                Err(_) => { /* task panicked; nothing to clean up beyond logging */ }
            }
        }

        for id in failed {
            self.metrics.record_error("broadcast_error").await;
            self.metrics.record_connection_error();
            self.disconnect(session_id, id).await;
        }
    }

    /// Checks and records a request against `user_id`'s sliding 60-second
    /// window, per §4.6's 100-requests-per-window budget.
    async fn check_rate_limit(&self, user_id: &str) -> bool {
        let mut limits = self.rate_limits.write().await;
        let record = limits.entry(user_id.to_string()).or_insert_with(|| RateLimitRecord {
            requests: VecDeque::new(),
        });

        let now = Instant::now();
        let window = self.config.rate_limit.window_secs;
        while let Some(&front) = record.requests.front() {
            if now.duration_since(front).as_secs() >= window {
                record.requests.pop_front();
            } else {
                break;
            }
        }

        if record.requests.len() as u32 >= self.config.rate_limit.max_requests {
            return false;
        }
        record.requests.push_back(now);
        true
    }

    /// Parses and dispatches one raw message from `connection_id` in
    /// `session_id`. Never returns an error to the caller: every failure
    /// mode is either a logged-and-swallowed internal condition or a single
    /// `error` reply sent back over `sender`, per §7's propagation policy.
    pub async fn handle(&self, session_id: &str, connection_id: ConnectionId, raw: &str) {
        let started = Instant::now();

        let user_id = {
            let mut sessions = self.sessions.write().await;
            let Some(runtime) = sessions.get_mut(session_id) else {
                return;
            };
            let Some(channel) = runtime.channels.get_mut(&connection_id) else {
                return;
            };
            channel.last_activity = Instant::now();
            channel.user_id.clone()
        };

        if !self.check_rate_limit(&user_id).await {
            self.metrics.record_error("rate_limit_exceeded").await;
            self.reply(session_id, connection_id, ServerMessage::Error {
                message: "rate limit exceeded".to_string(),
            })
            .await;
            return;
        }

        let message = match ClientMessage::parse(raw) {
            Ok(message) => message,
            Err(e) => {
                let error_kind = match &e {
                    ClientMessageParseError::UnknownType(_) => "unknown_message_type",
                    ClientMessageParseError::Json(_) | ClientMessageParseError::MissingType => "invalid_message",
                };
                self.metrics.record_error(error_kind).await;
                log::warn!("invalid message from {user_id} in {session_id}: {e}");
                self.reply(session_id, connection_id, ServerMessage::Error {
                    message: format!("invalid message: {e}"),
                })
                .await;
                return;
            }
        };

        let result = match message {
            ClientMessage::TextChange {
                content,
                cursor_position,
                vector_clock,
            } => {
                self.handle_text_change(session_id, connection_id, &user_id, content, cursor_position, vector_clock)
                    .await
            }
            ClientMessage::CursorChange {
                position,
                selection_start,
                selection_end,
            } => {
                self.handle_cursor_change(session_id, connection_id, &user_id, position, selection_start, selection_end)
                    .await
            }
            ClientMessage::Ping => {
                self.reply(session_id, connection_id, ServerMessage::Pong {
                    server_time: now_secs_f64(),
                })
                .await;
                Ok(())
            }
            ClientMessage::GetMetrics => {
                let snapshot = self.metrics.snapshot(self.active_session_count().await).await;
                self.reply(session_id, connection_id, ServerMessage::Metrics { data: snapshot })
                    .await;
                Ok(())
            }
        };

        if let Err(e) = result {
            self.metrics.record_error("message_processing_error").await;
            log::error!("error processing message from {user_id} in {session_id}: {e}");
            self.reply(session_id, connection_id, ServerMessage::Error {
                message: "failed to process message".to_string(),
            })
            .await;
        }

        self.metrics
            .record_operation_processing_time(started.elapsed().as_secs_f64() * 1000.0)
            .await;
    }

    async fn reply(&self, session_id: &str, connection_id: ConnectionId, message: ServerMessage) {
        let sessions = self.sessions.read().await;
        if let Some(runtime) = sessions.get(session_id) {
            if let Some(channel) = runtime.channels.get(&connection_id) {
                let _ = channel.sender.send(message);
            }
        }
    }

    async fn handle_text_change(
        &self,
        session_id: &str,
        connection_id: ConnectionId,
        user_id: &str,
        new_content: String,
        cursor_position: usize,
        client_vector_clock: HashMap<String, u64>,
    ) -> Result<()> {
        let (operations, merged_vc, transformed_content, performance) = {
            let mut sessions = self.sessions.write().await;
            let runtime = sessions
                .get_mut(session_id)
                .ok_or_else(|| CollabError::SessionNotFound(session_id.to_string()))?;

            let mut incoming_vc = VectorClock::new();
            for (client_id, counter) in &client_vector_clock {
                for _ in 0..*counter {
                    incoming_vc.increment(client_id);
                }
            }

            let channel = runtime
                .channels
                .get_mut(&connection_id)
                .ok_or_else(|| CollabError::Channel("connection no longer present".to_string()))?;
            channel.vector_clock.merge(&incoming_vc);
            channel.cursor_position = cursor_position;
            let connection_vc = channel.vector_clock.clone();

            let old_content = runtime.buffer.content().to_string();
            let ops = engine::diff_to_ops(&old_content, &new_content, user_id, connection_vc.clone(), now_ms())?;

            if ops.is_empty() {
                return Ok(());
            }

            let mut content = old_content;
            let mut applied = Vec::with_capacity(ops.len());
            for op in ops {
                let applied_op = runtime.buffer.apply_local(op)?;
                content = runtime.buffer.content().to_string();
                applied.push(applied_op);
            }

            let performance = runtime.buffer.performance();
            (applied, connection_vc, content, performance)
        };

        // A persistence failure here is masked at the coordinator boundary
        // (§7): the buffer above already applied the edit, so peers still
        // get a correct, converging broadcast even if the store is down.
        self.store_update_content(session_id, transformed_content.clone()).await;

        self.broadcast(
            session_id,
            ServerMessage::TextChange {
                content: transformed_content,
                user_id: user_id.to_string(),
                operations,
                vector_clock: merged_vc,
                timestamp: now_secs_f64(),
                performance: TextChangePerformance {
                    processing_time_ms: performance.average_processing_time_ms,
                    operations_processed: performance.operations_processed,
                },
            },
            Some(connection_id),
        )
        .await;

        self.metrics.increment_operation_count().await;
        Ok(())
    }

    async fn handle_cursor_change(
        &self,
        session_id: &str,
        connection_id: ConnectionId,
        user_id: &str,
        position: usize,
        selection_start: Option<usize>,
        selection_end: Option<usize>,
    ) -> Result<()> {
        {
            let mut sessions = self.sessions.write().await;
            let runtime = sessions
                .get_mut(session_id)
                .ok_or_else(|| CollabError::SessionNotFound(session_id.to_string()))?;
            let channel = runtime
                .channels
                .get_mut(&connection_id)
                .ok_or_else(|| CollabError::Channel("connection no longer present".to_string()))?;
            channel.cursor_position = position;
            channel.last_activity = Instant::now();
        }

        self.presence.touch(session_id, user_id).await;

        self.broadcast(
            session_id,
            ServerMessage::CursorChange {
                user_id: user_id.to_string(),
                position,
                selection_start,
                selection_end,
                timestamp: now_secs_f64(),
            },
            Some(connection_id),
        )
        .await;

        Ok(())
    }

    /// Pings every channel whose last observed activity is older than the
    /// configured health-check interval; a channel whose send fails is
    /// disconnected.
    pub async fn health_check(&self) {
        let interval = self.config.health_check_interval();
        let now = Instant::now();

        let stale: Vec<(String, ConnectionId, mpsc::UnboundedSender<ServerMessage>)> = {
            let sessions = self.sessions.read().await;
            sessions
                .iter()
                .flat_map(|(session_id, runtime)| {
                    runtime
                        .channels
                        .iter()
                        .filter(|(_, channel)| now.duration_since(channel.last_activity) >= interval)
                        .map(|(id, channel)| (session_id.clone(), *id, channel.sender.clone()))
                        .collect::<Vec<_>>()
                })
                .collect()
        };

        for (session_id, connection_id, sender) in stale {
            let sent = sender
                .send(ServerMessage::Ping {
                    server_time: now_secs_f64(),
                })
                .is_ok();
            if !sent {
                self.disconnect(&session_id, connection_id).await;
            }
        }
    }

    /// Prunes idle rate-limit records and retires buffers for sessions with
    /// no live channel whose last operation is older than the configured
    /// retention window, per §4.6's retention cleanup.
    pub async fn retention_cleanup(&self) {
        {
            let idle_after = self.config.retention.rate_limit_idle_secs;
            let mut limits = self.rate_limits.write().await;
            let now = Instant::now();
            limits.retain(|_, record| {
                while let Some(&front) = record.requests.front() {
                    if now.duration_since(front).as_secs() >= idle_after {
                        record.requests.pop_front();
                    } else {
                        break;
                    }
                }
                !record.requests.is_empty()
            });
        }

        self.presence.prune_expired().await;

        let retention = self.config.buffer_retention();
        let mut sessions = self.sessions.write().await;
        sessions.retain(|_, runtime| {
            if !runtime.channels.is_empty() {
                return true;
            }
            match runtime.buffer.last_operation_time() {
                Some(last) => last.elapsed() < retention,
                None => true,
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::InMemorySessionStore;

    fn make_coordinator() -> Coordinator {
        Coordinator::new(
            Config::default(),
            Arc::new(InMemorySessionStore::new()),
            Arc::new(MetricsAggregator::new()),
        )
    }

    #[tokio::test]
    async fn connect_sends_session_joined_and_broadcasts_join() {
        let coordinator = make_coordinator();
        let (tx_a, mut rx_a) = mpsc::unbounded_channel();
        let (connection_a, user_a) = coordinator.connect("s1", Some("alice".into()), tx_a).await.unwrap();
        assert_eq!(user_a, "alice");
        assert!(matches!(rx_a.try_recv().unwrap(), ServerMessage::SessionJoined { .. }));

        let (tx_b, mut rx_b) = mpsc::unbounded_channel();
        coordinator.connect("s1", Some("bob".into()), tx_b).await.unwrap();
        // alice should have heard about bob joining
        let msg = rx_a.recv().await.unwrap();
        assert!(matches!(msg, ServerMessage::UserJoined { user_id, .. } if user_id == "bob"));
        let _ = connection_a;
        let _ = rx_b;
    }

    #[tokio::test]
    async fn text_change_broadcasts_to_peers_excluding_sender() {
        let coordinator = make_coordinator();
        let (tx_a, mut rx_a) = mpsc::unbounded_channel();
        let (connection_a, _) = coordinator.connect("s1", Some("alice".into()), tx_a).await.unwrap();
        let (tx_b, mut rx_b) = mpsc::unbounded_channel();
        coordinator.connect("s1", Some("bob".into()), tx_b).await.unwrap();
        // drain the join notifications
        while rx_a.try_recv().is_ok() {}
        while rx_b.try_recv().is_ok() {}

        coordinator
            .handle(
                "s1",
                connection_a,
                r#"{"type":"text_change","content":"hello world","cursor_position":11,"vector_clock":{}}"#,
            )
            .await;

        let msg = rx_b.recv().await.unwrap();
        assert!(matches!(msg, ServerMessage::TextChange { ref content, .. } if content == "hello world"));
        assert!(rx_a.try_recv().is_err(), "sender should not receive its own broadcast");
    }

    #[tokio::test]
    async fn disconnect_is_idempotent() {
        let coordinator = make_coordinator();
        let (tx, _rx) = mpsc::unbounded_channel();
        let (connection_id, _) = coordinator.connect("s1", Some("alice".into()), tx).await.unwrap();
        coordinator.disconnect("s1", connection_id).await;
        coordinator.disconnect("s1", connection_id).await;
    }

    #[tokio::test]
    async fn rate_limit_blocks_101st_request() {
        let coordinator = make_coordinator();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let (connection_id, _) = coordinator.connect("s1", Some("alice".into()), tx).await.unwrap();
        while rx.try_recv().is_ok() {}

        for _ in 0..100 {
            coordinator.handle("s1", connection_id, r#"{"type":"ping"}"#).await;
        }
        while rx.try_recv().is_ok() {}

        coordinator.handle("s1", connection_id, r#"{"type":"ping"}"#).await;
        let msg = rx.recv().await.unwrap();
        assert!(matches!(msg, ServerMessage::Error { .. }));
    }

    #[tokio::test]
    async fn unknown_message_type_replies_with_error() {
        let coordinator = make_coordinator();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let (connection_id, _) = coordinator.connect("s1", Some("alice".into()), tx).await.unwrap();
        while rx.try_recv().is_ok() {}

        coordinator.handle("s1", connection_id, r#"{"type":"frobnicate"}"#).await;
        let msg = rx.recv().await.unwrap();
        assert!(matches!(msg, ServerMessage::Error { .. }));
    }

    #[tokio::test]
    async fn unknown_message_type_is_counted_distinctly_from_invalid_message() {
        let coordinator = make_coordinator();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let (connection_id, _) = coordinator.connect("s1", Some("alice".into()), tx).await.unwrap();
        while rx.try_recv().is_ok() {}

        coordinator.handle("s1", connection_id, r#"{"type":"frobnicate"}"#).await;
        let _ = rx.recv().await;
        coordinator.handle("s1", connection_id, "not json at all").await;
        let _ = rx.recv().await;

        let snapshot = coordinator.metrics().snapshot(0).await;
        assert_eq!(snapshot.errors.error_breakdown.get("unknown_message_type"), Some(&1));
        assert_eq!(snapshot.errors.error_breakdown.get("invalid_message"), Some(&1));
    }

    #[tokio::test]
    async fn reconnecting_user_increments_reconnection_counter() {
        let coordinator = make_coordinator();
        let (tx1, _rx1) = mpsc::unbounded_channel();
        coordinator.connect("s1", Some("alice".into()), tx1).await.unwrap();

        let (tx2, _rx2) = mpsc::unbounded_channel();
        coordinator.connect("s1", Some("alice".into()), tx2).await.unwrap();

        let snapshot = coordinator.metrics().snapshot(0).await;
        assert_eq!(snapshot.connections.reconnections, 1);
        assert_eq!(snapshot.connections.total, 2);
    }

    #[tokio::test]
    async fn broadcast_failure_counts_connection_error_and_drops_peer() {
        let coordinator = make_coordinator();
        let (tx_a, mut rx_a) = mpsc::unbounded_channel();
        let (connection_a, _) = coordinator.connect("s1", Some("alice".into()), tx_a).await.unwrap();
        let (tx_b, rx_b) = mpsc::unbounded_channel();
        coordinator.connect("s1", Some("bob".into()), tx_b).await.unwrap();
        drop(rx_b); // bob's send half is now broken, as if its socket died.
        while rx_a.try_recv().is_ok() {}

        coordinator
            .handle(
                "s1",
                connection_a,
                r#"{"type":"text_change","content":"hello","cursor_position":5,"vector_clock":{}}"#,
            )
            .await;

        let snapshot = coordinator.metrics().snapshot(0).await;
        assert!(snapshot.connections.errors >= 1);
        assert!(snapshot.errors.error_breakdown.get("broadcast_error").is_some());
    }

    struct AlwaysErrorsStore;

    #[async_trait::async_trait]
    impl SessionStore for AlwaysErrorsStore {
        async fn create(&self, _session_id: Option<String>, _initial_content: Option<String>) -> Result<SessionState> {
            Err(CollabError::Internal("store down".into()))
        }
        async fn get(&self, _session_id: &str) -> Result<Option<SessionState>> {
            Err(CollabError::Internal("store down".into()))
        }
        async fn join(&self, _session_id: &str, _user_id: &str) -> Result<SessionState> {
            Err(CollabError::Internal("store down".into()))
        }
        async fn leave(&self, _session_id: &str, _user_id: &str) -> Result<()> {
            Err(CollabError::Internal("store down".into()))
        }
        async fn update_content(&self, _session_id: &str, _content: String) -> Result<bool> {
            Err(CollabError::Internal("store down".into()))
        }
        async fn active(&self) -> Result<HashMap<String, crate::session::SessionSummary>> {
            Ok(HashMap::new())
        }
        async fn expire(&self) -> Result<usize> {
            Ok(0)
        }
    }

    #[tokio::test]
    async fn store_join_surfaces_store_unavailable_when_nothing_cached() {
        let coordinator = Coordinator::new(
            Config::default(),
            Arc::new(AlwaysErrorsStore),
            Arc::new(MetricsAggregator::new()),
        );

        let result = coordinator.store_join("s1", "alice").await;
        assert!(matches!(result, Err(CollabError::StoreUnavailable(_))));

        let snapshot = coordinator.metrics().snapshot(0).await;
        assert_eq!(snapshot.errors.error_breakdown.get("store_unavailable"), Some(&1));
    }

    /// A store that succeeds once (to let the coordinator warm its cache)
    /// and fails on every call after, modeling a backend that goes down
    /// mid-session.
    struct FlakyStore {
        calls: std::sync::atomic::AtomicU32,
        inner: InMemorySessionStore,
    }

    #[async_trait::async_trait]
    impl SessionStore for FlakyStore {
        async fn create(&self, session_id: Option<String>, initial_content: Option<String>) -> Result<SessionState> {
            self.inner.create(session_id, initial_content).await
        }
        async fn get(&self, session_id: &str) -> Result<Option<SessionState>> {
            self.inner.get(session_id).await
        }
        async fn join(&self, session_id: &str, user_id: &str) -> Result<SessionState> {
            if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
                self.inner.join(session_id, user_id).await
            } else {
                Err(CollabError::Internal("store flaked".into()))
            }
        }
        async fn leave(&self, session_id: &str, user_id: &str) -> Result<()> {
            self.inner.leave(session_id, user_id).await
        }
        async fn update_content(&self, session_id: &str, content: String) -> Result<bool> {
            self.inner.update_content(session_id, content).await
        }
        async fn active(&self) -> Result<HashMap<String, crate::session::SessionSummary>> {
            self.inner.active().await
        }
        async fn expire(&self) -> Result<usize> {
            self.inner.expire().await
        }
    }

    #[tokio::test]
    async fn store_join_falls_back_to_cached_state_once_warmed() {
        let store = Arc::new(FlakyStore {
            calls: std::sync::atomic::AtomicU32::new(0),
            inner: InMemorySessionStore::new(),
        });
        let coordinator = Coordinator::new(Config::default(), store, Arc::new(MetricsAggregator::new()));

        let first = coordinator.store_join("s1", "alice").await.unwrap();
        assert_eq!(first.session_id, "s1");

        let second = coordinator.store_join("s1", "alice").await.unwrap();
        assert_eq!(second.session_id, "s1");

        let snapshot = coordinator.metrics().snapshot(0).await;
        assert_eq!(snapshot.errors.error_breakdown.get("store_unavailable"), Some(&1));
    }
}
