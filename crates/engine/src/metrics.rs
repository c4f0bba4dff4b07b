use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use serde::Serialize;

use labelsync_core::{RecordId, ReplicaId, SessionId, hlc::physical_now};

/// Structured events the engine reports to its metrics sink.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EngineEvent {
    SessionCreated {
        session_id: SessionId,
        annotator_id: String,
        replica: ReplicaId,
    },
    SessionEnded {
        session_id: SessionId,
        duration_secs: f64,
    },
    ReplicaSwitched {
        session_id: SessionId,
        from: ReplicaId,
        to: ReplicaId,
    },
    ConflictDetected {
        session_id: SessionId,
        data_id: String,
        record_id: RecordId,
    },
    ConflictsResolved {
        strategy: String,
        groups: usize,
        deleted: usize,
    },
    ReplicaHealthChanged {
        replica: ReplicaId,
        healthy: bool,
    },
}

impl EngineEvent {
    pub const KINDS: [&'static str; 6] = [
        "session_created",
        "session_ended",
        "replica_switched",
        "conflict_detected",
        "conflicts_resolved",
        "replica_health_changed",
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Self::SessionCreated { .. } => "session_created",
            Self::SessionEnded { .. } => "session_ended",
            Self::ReplicaSwitched { .. } => "replica_switched",
            Self::ConflictDetected { .. } => "conflict_detected",
            Self::ConflictsResolved { .. } => "conflicts_resolved",
            Self::ReplicaHealthChanged { .. } => "replica_health_changed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RecordedEvent {
    pub at_ms: u64,
    pub event: EngineEvent,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct TimingSummary {
    pub count: usize,
    pub mean_ms: f64,
    pub min_ms: f64,
    pub max_ms: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MetricsSnapshot {
    pub counters: BTreeMap<String, u64>,
    pub timings: BTreeMap<String, TimingSummary>,
    pub gauges: BTreeMap<String, f64>,
    pub events: Vec<RecordedEvent>,
}

impl MetricsSnapshot {
    pub fn counter(&self, name: &str) -> u64 {
        self.counters.get(name).copied().unwrap_or(0)
    }

    pub fn gauge(&self, name: &str) -> Option<f64> {
        self.gauges.get(name).copied()
    }

    pub fn events_named<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a EngineEvent> + 'a {
        self.events
            .iter()
            .map(|e| &e.event)
            .filter(move |e| e.name() == name)
    }

    /// Up to `limit` events, newest first, optionally of one kind only.
    pub fn recent_events(&self, kind: Option<&str>, limit: usize) -> Vec<RecordedEvent> {
        self.events
            .iter()
            .rev()
            .filter(|e| kind.is_none_or(|k| e.event.name() == k))
            .take(limit)
            .cloned()
            .collect()
    }
}

/// Destination for counters, timings, gauges and events.
pub trait MetricsSink: Send + Sync {
    fn increment_counter(&self, name: &str, by: u64);
    fn record_timing(&self, name: &str, elapsed: Duration);
    fn set_gauge(&self, name: &str, value: f64);
    fn record_event(&self, event: EngineEvent);
    fn snapshot(&self) -> MetricsSnapshot;
}

#[derive(Default)]
struct Inner {
    counters: HashMap<String, u64>,
    timings: HashMap<String, VecDeque<f64>>,
    gauges: HashMap<String, f64>,
    events: VecDeque<RecordedEvent>,
}

/// Process-local sink keeping bounded windows of timing samples and events.
pub struct InMemoryMetrics {
    inner: Mutex<Inner>,
    event_capacity: usize,
    timing_samples: usize,
}

impl InMemoryMetrics {
    pub fn new(event_capacity: usize, timing_samples: usize) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            event_capacity: event_capacity.max(1),
            timing_samples: timing_samples.max(1),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // a panic mid-update leaves at worst a stale number behind
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Default for InMemoryMetrics {
    fn default() -> Self {
        Self::new(1000, 1000)
    }
}

impl MetricsSink for InMemoryMetrics {
    fn increment_counter(&self, name: &str, by: u64) {
        let mut inner = self.lock();
        let counter = inner.counters.entry(name.to_string()).or_insert(0);
        *counter = counter.saturating_add(by);
    }

    fn record_timing(&self, name: &str, elapsed: Duration) {
        let mut inner = self.lock();
        let samples = inner.timings.entry(name.to_string()).or_default();
        if samples.len() == self.timing_samples {
            samples.pop_front();
        }
        samples.push_back(elapsed.as_secs_f64() * 1000.0);
    }

    fn set_gauge(&self, name: &str, value: f64) {
        self.lock().gauges.insert(name.to_string(), value);
    }

    fn record_event(&self, event: EngineEvent) {
        let at_ms = physical_now().unwrap_or(0);
        let mut inner = self.lock();
        if inner.events.len() == self.event_capacity {
            inner.events.pop_front();
        }
        inner.events.push_back(RecordedEvent { at_ms, event });
    }

    fn snapshot(&self) -> MetricsSnapshot {
        let inner = self.lock();
        let timings = inner
            .timings
            .iter()
            .filter(|(_, samples)| !samples.is_empty())
            .map(|(name, samples)| {
                let count = samples.len();
                let sum: f64 = samples.iter().sum();
                let min = samples.iter().copied().fold(f64::INFINITY, f64::min);
                let max = samples.iter().copied().fold(f64::NEG_INFINITY, f64::max);
                (
                    name.clone(),
                    TimingSummary {
                        count,
                        mean_ms: sum / count as f64,
                        min_ms: min,
                        max_ms: max,
                    },
                )
            })
            .collect();

        MetricsSnapshot {
            counters: inner.counters.iter().map(|(k, v)| (k.clone(), *v)).collect(),
            timings,
            gauges: inner.gauges.iter().map(|(k, v)| (k.clone(), *v)).collect(),
            events: inner.events.iter().cloned().collect(),
        }
    }
}
