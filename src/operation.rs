//! The atomic unit of an edit: an immutable, checksummed, causally-stamped
//! operation.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{CollabError, Result};
use crate::vector_clock::VectorClock;

/// The three operation kinds. `Retain` is never authored directly by a
/// client; it only ever appears as the output of a transformation that
/// cancelled out a conflicting delete.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OpKind {
    Retain,
    Insert,
    Delete,
}

impl OpKind {
    /// Ordering used to break ties in `apply_batch` when two operations
    /// share a timestamp. Retain sorts before Insert before Delete, per the
    /// priority stated in the spec prose.
    pub fn priority(self) -> u8 {
        match self {
            OpKind::Retain => 0,
            OpKind::Insert => 1,
            OpKind::Delete => 2,
        }
    }
}

/// An immutable edit against a document, expressed in code-point positions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Operation {
    pub kind: OpKind,
    pub position: usize,
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub length: usize,
    pub client_id: String,
    pub op_id: String,
    pub vector_clock: VectorClock,
    /// Milliseconds since the epoch; used only as a last-resort tiebreak.
    pub timestamp: i64,
    pub checksum: String,
}

impl Operation {
    fn compute_checksum(kind: OpKind, position: usize, text: &str, length: usize) -> String {
        let mut hasher = Sha256::new();
        hasher.update(format!("{:?}:{}:{}:{}", kind, position, text, length));
        let digest = hasher.finalize();
        hex_prefix(&digest, 32)
    }

    fn compute_op_id(client_id: &str, timestamp: i64, kind: OpKind, position: usize) -> String {
        let mut hasher = Sha256::new();
        hasher.update(format!("{}:{}:{:?}:{}", client_id, timestamp, kind, position));
        let digest = hasher.finalize();
        hex_prefix(&digest, 16)
    }

    fn new(
        kind: OpKind,
        position: usize,
        text: String,
        length: usize,
        client_id: String,
        vector_clock: VectorClock,
        timestamp: i64,
    ) -> Result<Self> {
        match kind {
            OpKind::Insert => {
                if text.is_empty() {
                    return Err(CollabError::InvalidMessage(
                        "insert operation requires non-empty text".into(),
                    ));
                }
            }
            OpKind::Delete => {
                if length == 0 {
                    return Err(CollabError::InvalidMessage(
                        "delete operation requires length > 0".into(),
                    ));
                }
            }
            OpKind::Retain => {}
        }

        let op_id = Self::compute_op_id(&client_id, timestamp, kind, position);
        let checksum = Self::compute_checksum(kind, position, &text, length);

        Ok(Self {
            kind,
            position,
            text,
            length,
            client_id,
            op_id,
            vector_clock,
            timestamp,
            checksum,
        })
    }

    pub fn insert(
        position: usize,
        text: impl Into<String>,
        client_id: impl Into<String>,
        vector_clock: VectorClock,
        timestamp: i64,
    ) -> Result<Self> {
        Self::new(
            OpKind::Insert,
            position,
            text.into(),
            0,
            client_id.into(),
            vector_clock,
            timestamp,
        )
    }

    pub fn delete(
        position: usize,
        length: usize,
        client_id: impl Into<String>,
        vector_clock: VectorClock,
        timestamp: i64,
    ) -> Result<Self> {
        Self::new(
            OpKind::Delete,
            position,
            String::new(),
            length,
            client_id.into(),
            vector_clock,
            timestamp,
        )
    }

    pub fn retain(
        position: usize,
        client_id: impl Into<String>,
        vector_clock: VectorClock,
        timestamp: i64,
    ) -> Result<Self> {
        Self::new(
            OpKind::Retain,
            position,
            String::new(),
            0,
            client_id.into(),
            vector_clock,
            timestamp,
        )
    }

    /// Recomputes the checksum over the content fields and compares it
    /// against the stored one. Any tampering with `kind`/`position`/`text`/
    /// `length` after construction is detected.
    pub fn verify(&self) -> bool {
        let expected = Self::compute_checksum(self.kind, self.position, &self.text, self.length);
        expected == self.checksum
    }

    /// The half-open range `[position, position+length)` this operation
    /// touches. Insert has zero width, anchored at `position`.
    pub fn range(&self) -> (usize, usize) {
        match self.kind {
            OpKind::Delete => (self.position, self.position + self.length),
            OpKind::Insert | OpKind::Retain => (self.position, self.position),
        }
    }
}

fn hex_prefix(bytes: &[u8], hex_chars: usize) -> String {
    let mut s = String::with_capacity(hex_chars);
    for byte in bytes {
        if s.len() >= hex_chars {
            break;
        }
        s.push_str(&format!("{:02x}", byte));
    }
    s.truncate(hex_chars);
    s
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_requires_text() {
        assert!(Operation::insert(0, "", "a", VectorClock::new(), 0).is_err());
    }

    #[test]
    fn delete_requires_positive_length() {
        assert!(Operation::delete(0, 0, "a", VectorClock::new(), 0).is_err());
    }

    #[test]
    fn checksum_is_idempotent() {
        let op = Operation::insert(2, "hi", "a", VectorClock::new(), 1).unwrap();
        assert!(op.verify());
        let round_tripped: Operation =
            serde_json::from_str(&serde_json::to_string(&op).unwrap()).unwrap();
        assert!(round_tripped.verify());
        assert_eq!(op, round_tripped);
    }

    #[test]
    fn tampering_invalidates_checksum() {
        let mut op = Operation::insert(2, "hi", "a", VectorClock::new(), 1).unwrap();
        op.position = 99;
        assert!(!op.verify());
    }
}
