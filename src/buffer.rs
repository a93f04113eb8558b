//! Per-session operation buffer: owns the canonical text, sequences local
//! and remote operations, and tracks convergence/performance bookkeeping.

use std::time::Instant;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::Result;
use crate::ot::engine;
use crate::operation::Operation;
use crate::vector_clock::VectorClock;

/// Snapshot of a buffer's performance counters, exposed to clients via the
/// `get_metrics` message and embedded in `text_change` broadcasts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BufferPerformance {
    pub operations_processed: u64,
    pub average_processing_time_ms: f64,
}

/// The authoritative server-side state for one collaborative session: the
/// current text, the append-only history of applied operations, and the
/// queue of locally-applied-but-not-yet-acknowledged operations used to
/// transform incoming remote operations.
#[derive(Debug, Clone)]
pub struct OperationBuffer {
    content: String,
    client_id: String,
    history: Vec<Operation>,
    pending: Vec<Operation>,
    vector_clock: VectorClock,
    state_hash: String,
    operations_processed: u64,
    average_processing_time_ms: f64,
    last_operation_time: Option<Instant>,
}

const EMA_ALPHA: f64 = 0.1;

impl OperationBuffer {
    pub fn new(client_id: impl Into<String>, content: impl Into<String>) -> Self {
        let content = content.into();
        let vector_clock = VectorClock::new();
        let state_hash = Self::compute_state_hash(&content, &vector_clock);
        Self {
            content,
            client_id: client_id.into(),
            history: Vec::new(),
            pending: Vec::new(),
            vector_clock,
            state_hash,
            operations_processed: 0,
            average_processing_time_ms: 0.0,
            last_operation_time: None,
        }
    }

    pub fn content(&self) -> &str {
        &self.content
    }

    pub fn vector_clock(&self) -> &VectorClock {
        &self.vector_clock
    }

    pub fn state_hash(&self) -> &str {
        &self.state_hash
    }

    pub fn history(&self) -> &[Operation] {
        &self.history
    }

    pub fn pending(&self) -> &[Operation] {
        &self.pending
    }

    pub fn last_operation_time(&self) -> Option<Instant> {
        self.last_operation_time
    }

    fn compute_state_hash(content: &str, vc: &VectorClock) -> String {
        let mut hasher = Sha256::new();
        hasher.update(content.as_bytes());
        for (client_id, counter) in vc.sorted_entries() {
            hasher.update(client_id.as_bytes());
            hasher.update(counter.to_le_bytes());
        }
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

    fn record_metrics(&mut self, elapsed_ms: f64) {
        self.operations_processed += 1;
        if self.operations_processed == 1 {
            self.average_processing_time_ms = elapsed_ms;
        } else {
            self.average_processing_time_ms =
                EMA_ALPHA * elapsed_ms + (1.0 - EMA_ALPHA) * self.average_processing_time_ms;
        }
        self.last_operation_time = Some(Instant::now());
    }

    /// Applies an operation authored by this buffer's own owning client: the
    /// operation is stamped with this buffer's client id and vector clock
    /// before being applied and appended to `pending` (until acknowledged)
    /// and `history`.
    pub fn apply_local(&mut self, mut op: Operation) -> Result<Operation> {
        let started = Instant::now();

        op.client_id = self.client_id.clone();
        self.vector_clock.increment(&self.client_id);
        op.vector_clock = self.vector_clock.clone();

        self.content = engine::apply(&self.content, &op)?;
        self.history.push(op.clone());
        self.pending.push(op.clone());
        self.state_hash = Self::compute_state_hash(&self.content, &self.vector_clock);

        self.record_metrics(started.elapsed().as_secs_f64() * 1000.0);
        Ok(op)
    }

    /// Applies an operation received from a remote client. The operation's
    /// own checksum and vector clock are verified/merged, and if this buffer
    /// still has unacknowledged local operations pending, the incoming
    /// operation is transformed against them first so it lands correctly on
    /// top of the local edits this buffer has already applied.
    pub fn apply_remote(&mut self, mut op: Operation) -> Result<Operation> {
        let started = Instant::now();

        self.vector_clock.merge(&op.vector_clock);

        if !self.pending.is_empty() {
            let (transformed, new_pending) = engine::transform(&[op], &self.pending)?;
            op = transformed.into_iter().next().expect("single input yields single output");
            self.pending = new_pending;
        }

        self.content = engine::apply(&self.content, &op)?;
        self.history.push(op.clone());
        self.state_hash = Self::compute_state_hash(&self.content, &self.vector_clock);

        self.record_metrics(started.elapsed().as_secs_f64() * 1000.0);
        Ok(op)
    }

    /// Clears operations from `pending` once the caller has confirmed
    /// (e.g. via an ack from the session store write) that they no longer
    /// need to be considered when transforming new remote operations.
    pub fn clear_pending(&mut self) {
        self.pending.clear();
    }

    pub fn performance(&self) -> BufferPerformance {
        BufferPerformance {
            operations_processed: self.operations_processed,
            average_processing_time_ms: self.average_processing_time_ms,
        }
    }
}
