use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Causal relationship of one clock to another.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClockOrdering {
    Before,
    After,
    Equal,
    Concurrent,
}

impl ClockOrdering {
    /// The ordering seen from the other side of the comparison.
    pub fn reverse(self) -> Self {
        match self {
            Self::Before => Self::After,
            Self::After => Self::Before,
            other => other,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Before => "before",
            Self::After => "after",
            Self::Equal => "equal",
            Self::Concurrent => "concurrent",
        }
    }
}

/// Map from node id to logical counter. A node without an entry counts as 0,
/// so `{}` and `{"n1": 0}` compare `Equal` even though they are not `==`.
///
/// All operations return new clocks; a clock value is never mutated while
/// someone else may be reading it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VectorClock {
    entries: BTreeMap<String, u64>,
}

impl VectorClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// A fresh clock tracking a single node at counter 0.
    pub fn create(node_id: &str) -> Self {
        let mut entries = BTreeMap::new();
        entries.insert(node_id.to_string(), 0);
        Self { entries }
    }

    /// Counter for `node_id`, 0 if absent.
    pub fn get(&self, node_id: &str) -> u64 {
        self.entries.get(node_id).copied().unwrap_or(0)
    }

    /// Copy of this clock with `node_id` advanced by one.
    pub fn increment(&self, node_id: &str) -> Self {
        let mut next = self.clone();
        let counter = next.entries.entry(node_id.to_string()).or_insert(0);
        *counter = counter.saturating_add(1);
        next
    }

    /// Pointwise maximum over the union of both clocks' nodes.
    pub fn merge(&self, other: &VectorClock) -> Self {
        let mut merged = self.clone();
        for (node, counter) in &other.entries {
            let entry = merged.entries.entry(node.clone()).or_insert(*counter);
            if *counter > *entry {
                *entry = *counter;
            }
        }
        merged
    }

    /// Classify `self` relative to `other`.
    pub fn compare(&self, other: &VectorClock) -> ClockOrdering {
        let mut self_behind = false;
        let mut other_behind = false;

        for node in self.entries.keys().chain(other.entries.keys()) {
            let ours = self.get(node);
            let theirs = other.get(node);
            if ours < theirs {
                self_behind = true;
            } else if ours > theirs {
                other_behind = true;
            }
            if self_behind && other_behind {
                return ClockOrdering::Concurrent;
            }
        }

        match (self_behind, other_behind) {
            (true, false) => ClockOrdering::Before,
            (false, true) => ClockOrdering::After,
            (false, false) => ClockOrdering::Equal,
            (true, true) => ClockOrdering::Concurrent,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn entries(&self) -> &BTreeMap<String, u64> {
        &self.entries
    }

    /// Serialize to msgpack bytes (a map of node id to counter).
    pub fn to_msgpack(&self) -> Result<Vec<u8>, crate::CoreError> {
        rmp_serde::to_vec(&self.entries).map_err(|e| crate::CoreError::Serialization(e.to_string()))
    }

    /// Deserialize from msgpack bytes.
    pub fn from_msgpack(bytes: &[u8]) -> Result<Self, crate::CoreError> {
        let entries: BTreeMap<String, u64> =
            rmp_serde::from_slice(bytes).map_err(|e| crate::CoreError::Serialization(e.to_string()))?;
        Ok(Self { entries })
    }
}

impl<S: Into<String>> FromIterator<(S, u64)> for VectorClock {
    fn from_iter<I: IntoIterator<Item = (S, u64)>>(iter: I) -> Self {
        Self {
            entries: iter.into_iter().map(|(k, v)| (k.into(), v)).collect(),
        }
    }
}
