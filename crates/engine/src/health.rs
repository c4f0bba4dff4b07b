use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::sync::{Arc, Mutex, RwLock};
use std::thread;
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{debug, info, warn};

use labelsync_core::{ReplicaId, hlc::physical_now};
use labelsync_storage::StorageError;

use crate::metrics::{EngineEvent, MetricsSink};
use crate::registry::{ReplicaEntry, ReplicaRegistry};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ReplicaStatus {
    pub healthy: bool,
    /// Wall clock of the last probe, `None` until the replica was probed.
    pub checked_at_ms: Option<u64>,
}

/// Point-in-time health of every replica. Replaced whole, never edited in place.
#[derive(Debug, Clone, Serialize)]
pub struct HealthSnapshot {
    pub replicas: BTreeMap<ReplicaId, ReplicaStatus>,
    #[serde(skip)]
    refreshed_at: Option<Instant>,
}

impl HealthSnapshot {
    /// Before the first refresh every enabled replica is assumed healthy.
    fn assumed(registry: &ReplicaRegistry) -> Self {
        let replicas = registry
            .entries()
            .iter()
            .map(|e| {
                (
                    e.id.clone(),
                    ReplicaStatus {
                        healthy: e.enabled,
                        checked_at_ms: None,
                    },
                )
            })
            .collect();
        Self {
            replicas,
            refreshed_at: None,
        }
    }

    pub fn is_healthy(&self, id: &ReplicaId) -> bool {
        self.replicas.get(id).is_some_and(|s| s.healthy)
    }

    pub fn all_healthy(&self) -> bool {
        self.replicas.values().all(|s| s.healthy)
    }

    pub fn as_map(&self) -> BTreeMap<ReplicaId, bool> {
        self.replicas
            .iter()
            .map(|(id, s)| (id.clone(), s.healthy))
            .collect()
    }

    pub fn age(&self) -> Option<Duration> {
        self.refreshed_at.map(|at| at.elapsed())
    }
}

type ProbeResult = Result<(), StorageError>;

/// At most one outstanding ping per replica. A ping that outlives its wait
/// stays parked here and the next probe waits on it instead of starting
/// another thread.
#[derive(Default)]
struct ProbeSlot {
    running: Arc<AtomicBool>,
    parked: Mutex<Option<Receiver<ProbeResult>>>,
}

/// Clears the running flag when the probe thread ends, panics included.
struct RunningGuard(Arc<AtomicBool>);

impl Drop for RunningGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Probes replicas with a bounded wait and publishes the resulting health map.
pub struct ReplicaHealthTracker {
    registry: Arc<ReplicaRegistry>,
    metrics: Arc<dyn MetricsSink>,
    probe_timeout: Duration,
    staleness: Duration,
    current: RwLock<Arc<HealthSnapshot>>,
    refreshing: AtomicBool,
    slots: BTreeMap<ReplicaId, ProbeSlot>,
}

impl ReplicaHealthTracker {
    pub fn new(
        registry: Arc<ReplicaRegistry>,
        metrics: Arc<dyn MetricsSink>,
        probe_timeout: Duration,
        staleness: Duration,
    ) -> Self {
        let initial = Arc::new(HealthSnapshot::assumed(&registry));
        let slots = registry
            .entries()
            .iter()
            .map(|e| (e.id.clone(), ProbeSlot::default()))
            .collect();
        Self {
            registry,
            metrics,
            probe_timeout,
            staleness,
            current: RwLock::new(initial),
            refreshing: AtomicBool::new(false),
            slots,
        }
    }

    pub fn snapshot(&self) -> Arc<HealthSnapshot> {
        // the slot only ever holds a complete snapshot, so a poisoned lock
        // still guards a consistent value
        let guard = self.current.read().unwrap_or_else(|e| e.into_inner());
        Arc::clone(&guard)
    }

    /// Probe one replica. Any failure, including a timeout, reads as unhealthy.
    pub fn probe(&self, id: &ReplicaId) -> bool {
        match self.registry.get(id) {
            Some(entry) => {
                let pending = self.start_probe(entry);
                self.wait_probe(&entry.id, pending, self.probe_timeout)
            }
            None => false,
        }
    }

    /// Probe every replica concurrently and atomically replace the health map.
    pub fn refresh_all(&self) -> Arc<HealthSnapshot> {
        let deadline = Instant::now() + self.probe_timeout;
        let pending: Vec<_> = self
            .registry
            .entries()
            .iter()
            .map(|entry| (entry.id.clone(), self.start_probe(entry)))
            .collect();

        let checked_at_ms = physical_now().ok();
        let mut replicas = BTreeMap::new();
        for (id, rx) in pending {
            let healthy = self.wait_probe(&id, rx, deadline.saturating_duration_since(Instant::now()));
            replicas.insert(id, ReplicaStatus { healthy, checked_at_ms });
        }

        let next = Arc::new(HealthSnapshot {
            replicas,
            refreshed_at: Some(Instant::now()),
        });
        let previous = self.replace(Arc::clone(&next));
        self.report_changes(&previous, &next);
        debug!(healthy = next.replicas.values().filter(|s| s.healthy).count(), "replica health refreshed");
        next
    }

    /// Refresh first if the cached view is older than the staleness threshold.
    /// Concurrent callers do not pile up: only one refresh runs at a time and
    /// the others use the current view.
    pub fn ensure_fresh(&self) -> Arc<HealthSnapshot> {
        let current = self.snapshot();
        let stale = current.age().is_none_or(|age| age > self.staleness);
        if !stale {
            return current;
        }
        if self
            .refreshing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return current;
        }
        let refreshed = self.refresh_all();
        self.refreshing.store(false, Ordering::Release);
        refreshed
    }

    /// Exclude a replica right away after a failed read, until the next refresh
    /// finds it healthy again.
    pub fn mark_unhealthy(&self, id: &ReplicaId) {
        let mut guard = self.current.write().unwrap_or_else(|e| e.into_inner());
        if !guard.is_healthy(id) {
            return;
        }
        let mut next = HealthSnapshot::clone(&guard);
        if let Some(status) = next.replicas.get_mut(id) {
            status.healthy = false;
            status.checked_at_ms = physical_now().ok();
        }
        let previous = std::mem::replace(&mut *guard, Arc::new(next));
        let next = Arc::clone(&guard);
        drop(guard);
        self.report_changes(&previous, &next);
    }

    fn replace(&self, next: Arc<HealthSnapshot>) -> Arc<HealthSnapshot> {
        let mut guard = self.current.write().unwrap_or_else(|e| e.into_inner());
        std::mem::replace(&mut *guard, next)
    }

    fn report_changes(&self, previous: &HealthSnapshot, next: &HealthSnapshot) {
        for (id, status) in &next.replicas {
            if previous.is_healthy(id) == status.healthy {
                continue;
            }
            if status.healthy {
                info!(replica = %id, "replica recovered");
            } else {
                warn!(replica = %id, "replica marked unhealthy");
            }
            self.metrics.record_event(EngineEvent::ReplicaHealthChanged {
                replica: id.clone(),
                healthy: status.healthy,
            });
        }
    }

    /// Pings still running on their helper thread.
    pub fn probes_in_flight(&self) -> usize {
        self.slots
            .values()
            .filter(|slot| slot.running.load(Ordering::Acquire))
            .count()
    }

    /// Run `ping` on a helper thread so a hung replica cannot stall the caller.
    /// Reuses a parked ping if one is outstanding. `None` means no answer can
    /// come: the replica is disabled, or another caller is already waiting on
    /// its only ping.
    fn start_probe(&self, entry: &ReplicaEntry) -> Option<Receiver<ProbeResult>> {
        if !entry.enabled {
            return None;
        }
        let slot = self.slots.get(&entry.id)?;
        let parked = slot.parked.lock().unwrap_or_else(|e| e.into_inner()).take();
        if parked.is_some() && slot.running.load(Ordering::Acquire) {
            return parked;
        }
        // a parked ping that already finished only holds an old answer
        if slot.running.swap(true, Ordering::AcqRel) {
            debug!(replica = %entry.id, "probe already in flight");
            return None;
        }

        let store = Arc::clone(&entry.store);
        let guard = RunningGuard(Arc::clone(&slot.running));
        let (tx, rx) = mpsc::channel();
        let spawned = thread::Builder::new()
            .name(format!("probe-{}", entry.id))
            .spawn(move || {
                let result = store.ping();
                drop(guard);
                let _ = tx.send(result);
            });
        match spawned {
            Ok(_) => Some(rx),
            Err(e) => {
                // the closure, and with it the guard, is dropped on failure
                warn!(replica = %entry.id, error = %e, "could not start probe");
                None
            }
        }
    }

    fn wait_probe(&self, id: &ReplicaId, pending: Option<Receiver<ProbeResult>>, timeout: Duration) -> bool {
        let Some(rx) = pending else {
            return false;
        };
        match rx.recv_timeout(timeout) {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                debug!(replica = %id, error = %e, "probe failed");
                false
            }
            Err(RecvTimeoutError::Timeout) => {
                debug!(replica = %id, "probe timed out, left pending");
                if let Some(slot) = self.slots.get(id) {
                    let mut parked = slot.parked.lock().unwrap_or_else(|e| e.into_inner());
                    if parked.is_none() {
                        *parked = Some(rx);
                    }
                }
                false
            }
            Err(RecvTimeoutError::Disconnected) => {
                debug!(replica = %id, "probe ended without an answer");
                false
            }
        }
    }
}
