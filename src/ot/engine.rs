//! The transformation algebra itself: `apply`, `apply_batch`,
//! `transform_position`, `transform_pair`, `transform`, and `diff_to_ops`.
//!
//! Every function here is pure: no I/O, no shared mutable state. Convergence
//! of the whole system rests entirely on these functions being deterministic.

use crate::error::{CollabError, Result};
use crate::operation::{OpKind, Operation};
use crate::vector_clock::VectorClock;

/// Applies a single operation to `text`, returning the new text.
///
/// Positions are clamped to the bounds of `text` rather than rejected: an
/// Insert past the end appends, a Delete that runs past the end only removes
/// the overlap. This matches how a client's view of the document can lag the
/// server's by a few operations without producing a hard failure.
pub fn apply(text: &str, op: &Operation) -> Result<String> {
    if !op.verify() {
        return Err(CollabError::Integrity(format!(
            "operation {} failed checksum verification",
            op.op_id
        )));
    }
    let mut chars: Vec<char> = text.chars().collect();
    apply_unchecked(&mut chars, op.kind, op.position, &op.text, op.length);
    Ok(chars.into_iter().collect())
}

/// Mutates `chars` in place per `kind`/`position`/`text`/`length`, without
/// re-verifying the operation's checksum. Used internally once a caller has
/// already verified (or deliberately adjusted) the operation.
fn apply_unchecked(chars: &mut Vec<char>, kind: OpKind, position: usize, text: &str, length: usize) {
    match kind {
        OpKind::Retain => {}
        OpKind::Insert => {
            let pos = position.min(chars.len());
            let inserted: Vec<char> = text.chars().collect();
            chars.splice(pos..pos, inserted);
        }
        OpKind::Delete => {
            let start = position.min(chars.len());
            let end = (position + length).min(chars.len());
            if start < end {
                chars.drain(start..end);
            }
        }
    }
}

/// Applies a batch of causally-independent (already non-concurrent, or
/// already transformed) operations to `text` in priority order: sorted by
/// `(timestamp, kind priority, client_id)` with Retain < Insert < Delete, and
/// `client_id` breaking any remaining tie so replay is fully deterministic.
///
/// Concurrent operations must be passed through [`transform`] first; this
/// function does not itself resolve conflicts, it only sequences and applies
/// already-compatible operations while keeping positions consistent via a
/// running offset.
pub fn apply_batch(text: &str, ops: &[Operation]) -> Result<String> {
    for op in ops {
        if !op.verify() {
            return Err(CollabError::Integrity(format!(
                "operation {} failed checksum verification",
                op.op_id
            )));
        }
    }

    let mut sorted: Vec<&Operation> = ops.iter().collect();
    sorted.sort_by(|a, b| {
        a.timestamp
            .cmp(&b.timestamp)
            .then(a.kind.priority().cmp(&b.kind.priority()))
            .then(a.client_id.cmp(&b.client_id))
    });

    let mut chars: Vec<char> = text.chars().collect();
    let mut offset: i64 = 0;

    for op in sorted {
        let adjusted_position = (op.position as i64 + offset).max(0) as usize;
        apply_unchecked(&mut chars, op.kind, adjusted_position, &op.text, op.length);
        match op.kind {
            OpKind::Insert => offset += op.text.chars().count() as i64,
            OpKind::Delete => offset -= op.length as i64,
            OpKind::Retain => {}
        }
    }

    Ok(chars.into_iter().collect())
}

/// Maps a cursor position forward across one applied operation.
pub fn transform_position(pos: usize, op: &Operation) -> usize {
    match op.kind {
        OpKind::Insert => {
            if pos >= op.position {
                pos + op.text.chars().count()
            } else {
                pos
            }
        }
        OpKind::Delete => {
            let (start, end) = op.range();
            if pos > start && pos <= end {
                start
            } else if pos > end {
                pos.saturating_sub(op.length)
            } else {
                pos
            }
        }
        OpKind::Retain => pos,
    }
}

fn determine_priority(a: &Operation, b: &Operation) -> bool {
    use crate::vector_clock::Causality;
    match a.vector_clock.compare(&b.vector_clock) {
        Causality::Before => true,
        Causality::After => false,
        Causality::Concurrent | Causality::Equal => match a.client_id.cmp(&b.client_id) {
            std::cmp::Ordering::Less => true,
            std::cmp::Ordering::Greater => false,
            std::cmp::Ordering::Equal => a.timestamp <= b.timestamp,
        },
    }
}

fn retain_at(position: usize, client_id: &str, vc: VectorClock, timestamp: i64) -> Operation {
    Operation::retain(position, client_id, vc, timestamp)
        .expect("retain construction never fails its own invariants")
}

fn insert_like(source: &Operation, position: usize) -> Operation {
    Operation::insert(
        position,
        source.text.clone(),
        source.client_id.clone(),
        source.vector_clock.clone(),
        source.timestamp,
    )
    .expect("insert construction never fails when text is already non-empty")
}

fn delete_like(source: &Operation, position: usize, length: usize) -> Operation {
    Operation::delete(
        position,
        length,
        source.client_id.clone(),
        source.vector_clock.clone(),
        source.timestamp,
    )
    .expect("delete construction never fails when length is already positive")
}

fn transform_insert_insert(a: &Operation, b: &Operation, a_wins: bool) -> (Operation, Operation) {
    if a.position < b.position {
        (a.clone(), insert_like(b, b.position + a.text.chars().count()))
    } else if a.position > b.position {
        (insert_like(a, a.position + b.text.chars().count()), b.clone())
    } else if a_wins {
        (a.clone(), insert_like(b, b.position + a.text.chars().count()))
    } else {
        (insert_like(a, a.position + b.text.chars().count()), b.clone())
    }
}

/// Transforms an insert against a delete. `insert` and `delete` may be
/// either side of the original pair; the caller is responsible for mapping
/// the returned `(insert', delete')` back onto `(a', b')` in the right order.
fn transform_insert_delete(insert: &Operation, delete: &Operation) -> (Operation, Operation) {
    let (del_start, del_end) = delete.range();
    if insert.position <= del_start {
        (
            insert.clone(),
            delete_like(delete, del_start + insert.text.chars().count(), delete.length),
        )
    } else if insert.position >= del_end {
        let new_pos = insert.position.saturating_sub(delete.length);
        (insert_like(insert, new_pos), delete.clone())
    } else {
        // Insert lands strictly inside the deleted range. The insert
        // relocates to the seam at the start of the delete; the delete keeps
        // its original length but shifts past the inserted text.
        //
        // This does not perfectly converge in both causal orders: a replica
        // that applies the insert locally before the transformed delete
        // arrives ends up deleting part of the just-inserted text, while a
        // replica that applies the delete first preserves the insert whole.
        // Splitting the delete into two fragments around the insert would
        // fix this, but the operation model here carries a single
        // contiguous (position, length) range per delete, so it cannot
        // represent a split. This mirrors the same limitation in the
        // reference implementation this engine is modeled on.
        (
            insert_like(insert, del_start),
            delete_like(delete, del_start + insert.text.chars().count(), delete.length),
        )
    }
}

fn transform_delete_delete(a: &Operation, b: &Operation) -> (Operation, Operation) {
    let (a0, a1) = a.range();
    let (b0, b1) = b.range();
    let overlap_start = a0.max(b0);
    let overlap_end = a1.min(b1);
    let overlap = overlap_end.saturating_sub(overlap_start);

    let new_position = a0.min(b0);

    let a_new_length = a.length.saturating_sub(overlap);
    let b_new_length = b.length.saturating_sub(overlap);

    let a_prime = if a_new_length == 0 {
        retain_at(new_position, &a.client_id, a.vector_clock.clone(), a.timestamp)
    } else {
        delete_like(a, new_position, a_new_length)
    };
    let b_prime = if b_new_length == 0 {
        retain_at(new_position, &b.client_id, b.vector_clock.clone(), b.timestamp)
    } else {
        delete_like(b, new_position, b_new_length)
    };

    (a_prime, b_prime)
}

/// Transforms two concurrent operations against each other so that applying
/// `a` then `b'` yields the same text as applying `b` then `a'`.
///
/// Operations from the same client pass through untouched — a client's own
/// operations are already causally ordered with respect to each other and
/// never need transforming against themselves.
pub fn transform_pair(a: &Operation, b: &Operation) -> Result<(Operation, Operation)> {
    if !a.verify() || !b.verify() {
        return Err(CollabError::Integrity(
            "cannot transform an operation that fails checksum verification".into(),
        ));
    }

    if a.client_id == b.client_id {
        return Ok((a.clone(), b.clone()));
    }

    let a_wins = determine_priority(a, b);

    let result = match (a.kind, b.kind) {
        (OpKind::Retain, _) => (a.clone(), b.clone()),
        (_, OpKind::Retain) => (a.clone(), b.clone()),
        (OpKind::Insert, OpKind::Insert) => transform_insert_insert(a, b, a_wins),
        (OpKind::Insert, OpKind::Delete) => {
            let (insert_prime, delete_prime) = transform_insert_delete(a, b);
            (insert_prime, delete_prime)
        }
        (OpKind::Delete, OpKind::Insert) => {
            let (insert_prime, delete_prime) = transform_insert_delete(b, a);
            (delete_prime, insert_prime)
        }
        (OpKind::Delete, OpKind::Delete) => transform_delete_delete(a, b),
    };

    Ok(result)
}

/// Batch transformation: transforms every operation in `ops_a` against every
/// operation in `ops_b` (and vice versa), folding pairwise so that applying
/// the transformed `ops_a'` after `ops_b` commutes with applying the
/// transformed `ops_b'` after `ops_a`.
///
/// Each side is folded against the *original* other sequence, not the
/// partially-transformed one, so the result does not depend on iteration
/// order within a batch.
pub fn transform(ops_a: &[Operation], ops_b: &[Operation]) -> Result<(Vec<Operation>, Vec<Operation>)> {
    let mut transformed_a = Vec::with_capacity(ops_a.len());
    for a in ops_a {
        let mut current = a.clone();
        for b in ops_b {
            let (a_prime, _) = transform_pair(&current, b)?;
            current = a_prime;
        }
        transformed_a.push(current);
    }

    let mut transformed_b = Vec::with_capacity(ops_b.len());
    for b in ops_b {
        let mut current = b.clone();
        for a in ops_a {
            let (_, b_prime) = transform_pair(a, &current)?;
            current = b_prime;
        }
        transformed_b.push(current);
    }

    Ok((transformed_a, transformed_b))
}

/// Computes the minimal delete/insert pair that turns `old` into `new` by
/// diffing their common prefix and suffix. Used when a client reports a
/// whole-document snapshot instead of discrete operations.
pub fn diff_to_ops(
    old: &str,
    new: &str,
    client_id: &str,
    vector_clock: VectorClock,
    timestamp: i64,
) -> Result<Vec<Operation>> {
    if old == new {
        return Ok(Vec::new());
    }

    let old_chars: Vec<char> = old.chars().collect();
    let new_chars: Vec<char> = new.chars().collect();

    let mut prefix_len = 0;
    while prefix_len < old_chars.len()
        && prefix_len < new_chars.len()
        && old_chars[prefix_len] == new_chars[prefix_len]
    {
        prefix_len += 1;
    }

    let old_remaining = old_chars.len() - prefix_len;
    let new_remaining = new_chars.len() - prefix_len;
    let max_suffix = old_remaining.min(new_remaining);

    let mut suffix_len = 0;
    while suffix_len < max_suffix
        && old_chars[old_chars.len() - 1 - suffix_len] == new_chars[new_chars.len() - 1 - suffix_len]
    {
        suffix_len += 1;
    }

    let old_middle: String = old_chars[prefix_len..old_chars.len() - suffix_len].iter().collect();
    let new_middle: String = new_chars[prefix_len..new_chars.len() - suffix_len].iter().collect();

    let mut ops = Vec::new();
    if !old_middle.is_empty() {
        ops.push(Operation::delete(
            prefix_len,
            old_middle.chars().count(),
            client_id,
            vector_clock.clone(),
            timestamp,
        )?);
    }
    if !new_middle.is_empty() {
        ops.push(Operation::insert(
            prefix_len,
            new_middle,
            client_id,
            vector_clock,
            timestamp,
        )?);
    }

    Ok(ops)
}
