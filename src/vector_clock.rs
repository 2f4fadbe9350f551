//! Vector clocks for causal ordering of operations.
//!
//! A [`VectorClock`] maps a client id to the number of operations that client
//! has authored. Comparing two clocks tells whether one causally precedes the
//! other or whether they are concurrent (a conflict).
//!
//! ```
//! use oplog_engine::{VectorClock, ClockComparison};
//!
//! let mut a = VectorClock::new();
//! a.increment("A");
//! let mut b = a.clone();
//! b.increment("B");
//!
//! assert_eq!(a.compare(&b), ClockComparison::Less);
//! assert!(b.dominates(&a));
//! ```

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Result of comparing two vector clocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClockComparison {
    /// Left happened before right.
    Less,
    /// Left happened after right.
    Greater,
    Equal,
    /// Neither dominates the other.
    Concurrent,
}

impl std::fmt::Display for ClockComparison {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Less => write!(f, "LESS"),
            Self::Greater => write!(f, "GREATER"),
            Self::Equal => write!(f, "EQUAL"),
            Self::Concurrent => write!(f, "CONCURRENT"),
        }
    }
}

/// Per-client operation counters. Missing entries count as zero.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VectorClock(BTreeMap<String, u64>);

impl VectorClock {
    #[must_use]
    pub fn new() -> Self {
        Self(BTreeMap::new())
    }

    /// Counter for `client_id` (zero if the client is unknown).
    #[must_use]
    pub fn get(&self, client_id: &str) -> u64 {
        self.0.get(client_id).copied().unwrap_or(0)
    }

    /// Bump the counter of `client_id` and return the new value.
    pub fn increment(&mut self, client_id: &str) -> u64 {
        let counter = self.0.entry(client_id.to_string()).or_insert(0);
        *counter += 1;
        *counter
    }

    /// Copy of this clock with `client_id` incremented.
    #[must_use]
    pub fn incremented(&self, client_id: &str) -> Self {
        let mut next = self.clone();
        next.increment(client_id);
        next
    }

    /// Pointwise maximum with `other`, in place.
    pub fn merge(&mut self, other: &VectorClock) {
        for (client, &counter) in &other.0 {
            let entry = self.0.entry(client.clone()).or_insert(0);
            if counter > *entry {
                *entry = counter;
            }
        }
    }

    #[must_use]
    pub fn merged(&self, other: &VectorClock) -> Self {
        let mut out = self.clone();
        out.merge(other);
        out
    }

    pub fn compare(&self, other: &VectorClock) -> ClockComparison {
        let mut self_ahead = false;
        let mut other_ahead = false;

        for client in self.0.keys().chain(other.0.keys()) {
            let mine = self.get(client);
            let theirs = other.get(client);
            if mine > theirs {
                self_ahead = true;
            } else if theirs > mine {
                other_ahead = true;
            }
            if self_ahead && other_ahead {
                return ClockComparison::Concurrent;
            }
        }

        match (self_ahead, other_ahead) {
            (false, false) => ClockComparison::Equal,
            (true, false) => ClockComparison::Greater,
            (false, true) => ClockComparison::Less,
            (true, true) => ClockComparison::Concurrent,
        }
    }

    /// Strict causal domination: `>=` everywhere and `>` somewhere.
    #[must_use]
    pub fn dominates(&self, other: &VectorClock) -> bool {
        self.compare(other) == ClockComparison::Greater
    }

    /// `>=` everywhere (dominates or equal).
    #[must_use]
    pub fn covers(&self, other: &VectorClock) -> bool {
        matches!(
            self.compare(other),
            ClockComparison::Greater | ClockComparison::Equal
        )
    }

    #[must_use]
    pub fn is_concurrent_with(&self, other: &VectorClock) -> bool {
        self.compare(other) == ClockComparison::Concurrent
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, u64)> {
        self.0.iter().map(|(k, v)| (k.as_str(), *v))
    }
}

impl<S: Into<String>> FromIterator<(S, u64)> for VectorClock {
    fn from_iter<I: IntoIterator<Item = (S, u64)>>(iter: I) -> Self {
        Self(iter.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }
}

impl std::fmt::Display for VectorClock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{{")?;
        for (i, (client, counter)) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{client}:{counter}")?;
        }
        write!(f, "}}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn clock(entries: &[(&str, u64)]) -> VectorClock {
        entries.iter().map(|(k, v)| (*k, *v)).collect()
    }

    #[test]
    fn test_increment_starts_at_one() {
        let mut c = VectorClock::new();
        assert_eq!(c.increment("A"), 1);
        assert_eq!(c.increment("A"), 2);
        assert_eq!(c.get("A"), 2);
        assert_eq!(c.get("B"), 0);
    }

    #[test]
    fn test_compare_equal() {
        let a = clock(&[("A", 1), ("B", 2)]);
        assert_eq!(a.compare(&a.clone()), ClockComparison::Equal);
        assert_eq!(VectorClock::new().compare(&VectorClock::new()), ClockComparison::Equal);
    }

    #[test]
    fn test_missing_entries_count_as_zero() {
        let a = clock(&[("A", 1), ("B", 0)]);
        let b = clock(&[("A", 1)]);
        assert_eq!(a.compare(&b), ClockComparison::Equal);
    }

    #[test]
    fn test_compare_less_and_greater() {
        let a = clock(&[("A", 1)]);
        let b = clock(&[("A", 2), ("B", 1)]);
        assert_eq!(a.compare(&b), ClockComparison::Less);
        assert_eq!(b.compare(&a), ClockComparison::Greater);
        assert!(b.dominates(&a));
        assert!(!a.dominates(&b));
    }

    #[test]
    fn test_compare_concurrent() {
        let a = clock(&[("A", 2), ("B", 1)]);
        let b = clock(&[("A", 1), ("B", 2)]);
        assert_eq!(a.compare(&b), ClockComparison::Concurrent);
        assert!(a.is_concurrent_with(&b));
    }

    #[test]
    fn test_merge_takes_pointwise_max() {
        let mut a = clock(&[("A", 5), ("B", 1)]);
        a.merge(&clock(&[("B", 10), ("C", 3)]));
        assert_eq!(a, clock(&[("A", 5), ("B", 10), ("C", 3)]));
    }

    #[test]
    fn test_merged_then_incremented_dominates_both() {
        let local = clock(&[("local", 5)]);
        let remote = clock(&[("remote", 10), ("other", 3)]);
        let next = local.merged(&remote).incremented("local");

        assert_eq!(next.get("local"), 6);
        assert_eq!(next.get("remote"), 10);
        assert_eq!(next.get("other"), 3);
        assert!(next.dominates(&local));
        assert!(next.dominates(&remote));
    }

    #[test]
    fn test_serde_is_plain_map() {
        let a = clock(&[("A", 5), ("B", 10)]);
        let json = serde_json::to_value(&a).unwrap();
        assert_eq!(json, serde_json::json!({"A": 5, "B": 10}));
        let back: VectorClock = serde_json::from_value(json).unwrap();
        assert_eq!(back, a);
    }

    #[test]
    fn test_display() {
        assert_eq!(clock(&[("A", 1), ("B", 2)]).to_string(), "{A:1, B:2}");
    }
}
