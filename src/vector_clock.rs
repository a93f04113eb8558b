//! Partial-order causality tracking for operations authored by concurrent
//! clients.

use std::cmp::Ordering as CmpOrdering;
use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// The result of comparing two vector clocks under the standard partial
/// order: `Before` iff every component of `self` is `<=` the other's and at
/// least one is strictly less, `After` symmetrically, `Equal` if every
/// observed component matches, `Concurrent` otherwise.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Causality {
    Before,
    After,
    Concurrent,
    Equal,
}

/// A mapping from client id to a monotonically increasing counter.
///
/// Unseen client ids are implicitly zero, so clocks from different replicas
/// with different sets of known clients still compare correctly.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VectorClock {
    counters: HashMap<String, u64>,
}

impl VectorClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, client_id: &str) -> u64 {
        self.counters.get(client_id).copied().unwrap_or(0)
    }

    /// Raises the counter for `client_id` by one and returns the new value.
    pub fn increment(&mut self, client_id: &str) -> u64 {
        let entry = self.counters.entry(client_id.to_string()).or_insert(0);
        *entry += 1;
        *entry
    }

    /// Merges `other` into `self`, taking the pairwise maximum of every
    /// component. This is the least upper bound of the two clocks.
    pub fn merge(&mut self, other: &VectorClock) {
        for (client_id, &count) in &other.counters {
            let entry = self.counters.entry(client_id.clone()).or_insert(0);
            if count > *entry {
                *entry = count;
            }
        }
    }

    /// Compares `self` against `other` under the vector-clock partial order.
    pub fn compare(&self, other: &VectorClock) -> Causality {
        let mut self_less = false;
        let mut other_less = false;

        let mut clients: Vec<&String> = self.counters.keys().chain(other.counters.keys()).collect();
        clients.sort();
        clients.dedup();

        for client_id in clients {
            match self.get(client_id).cmp(&other.get(client_id)) {
                CmpOrdering::Less => self_less = true,
                CmpOrdering::Greater => other_less = true,
                CmpOrdering::Equal => {}
            }
        }

        match (self_less, other_less) {
            (false, false) => Causality::Equal,
            (true, false) => Causality::Before,
            (false, true) => Causality::After,
            (true, true) => Causality::Concurrent,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.counters.is_empty()
    }

    /// Sorted `(client_id, counter)` pairs, used for deterministic hashing.
    pub fn sorted_entries(&self) -> Vec<(&str, u64)> {
        let mut entries: Vec<(&str, u64)> =
            self.counters.iter().map(|(k, &v)| (k.as_str(), v)).collect();
        entries.sort_by(|a, b| a.0.cmp(b.0));
        entries
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn increment_raises_clock_strictly() {
        let mut vc = VectorClock::new();
        let before = vc.clone();
        vc.increment("a");
        assert_eq!(vc.compare(&before), Causality::After);
        assert_eq!(before.compare(&vc), Causality::Before);
    }

    #[test]
    fn merge_is_least_upper_bound() {
        let mut a = VectorClock::new();
        a.increment("a");
        let mut b = VectorClock::new();
        b.increment("b");

        let mut merged = a.clone();
        merged.merge(&b);

        assert_ne!(merged.compare(&a), Causality::Before);
        assert_ne!(merged.compare(&b), Causality::Before);
    }

    #[test]
    fn concurrent_clocks_detected() {
        let mut a = VectorClock::new();
        a.increment("x");
        let mut b = VectorClock::new();
        b.increment("y");
        assert_eq!(a.compare(&b), Causality::Concurrent);
    }

    #[test]
    fn equal_clocks() {
        let mut a = VectorClock::new();
        a.increment("x");
        let b = a.clone();
        assert_eq!(a.compare(&b), Causality::Equal);
    }

    #[test]
    fn unseen_clients_treated_as_zero() {
        let mut a = VectorClock::new();
        a.increment("x");
        let b = VectorClock::new();
        assert_eq!(a.compare(&b), Causality::After);
    }
}
