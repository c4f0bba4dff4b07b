use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use tracing::{debug, warn};

use labelsync_core::ReplicaId;
use labelsync_storage::{ReplicaStore, StorageError};

use crate::EngineError;
use crate::health::ReplicaHealthTracker;
use crate::registry::{ReplicaEntry, ReplicaRegistry};

/// Single-writer routing: writes go to the primary, reads go to a healthy
/// replica chosen round-robin, with the primary as the last resort.
pub struct ReplicaRouter {
    registry: Arc<ReplicaRegistry>,
    health: Arc<ReplicaHealthTracker>,
    cursor: AtomicUsize,
}

impl ReplicaRouter {
    pub fn new(registry: Arc<ReplicaRegistry>, health: Arc<ReplicaHealthTracker>) -> Self {
        Self {
            registry,
            health,
            cursor: AtomicUsize::new(0),
        }
    }

    pub fn registry(&self) -> &ReplicaRegistry {
        &self.registry
    }

    pub fn health(&self) -> &ReplicaHealthTracker {
        &self.health
    }

    /// The primary. Fails only when it is administratively disabled; a primary
    /// that merely failed a probe still takes writes.
    pub fn route_write(&self) -> Result<&ReplicaEntry, EngineError> {
        let primary = self.registry.primary();
        if !primary.enabled {
            return Err(EngineError::ReplicaUnavailable(primary.id.clone()));
        }
        Ok(primary)
    }

    /// Convenience for write paths that only need the store.
    pub fn primary_store(&self) -> Result<&dyn ReplicaStore, EngineError> {
        Ok(self.route_write()?.store.as_ref())
    }

    pub fn route_read(&self, preferred: Option<&ReplicaId>) -> ReplicaId {
        self.select_read(preferred, &[])
            .unwrap_or_else(|| self.registry.primary())
            .id
            .clone()
    }

    /// Preferred replica if healthy, else the next healthy secondary, else the
    /// primary. Replicas in `exclude` are skipped entirely.
    fn select_read(&self, preferred: Option<&ReplicaId>, exclude: &[ReplicaId]) -> Option<&ReplicaEntry> {
        let snapshot = self.health.ensure_fresh();
        let usable = |e: &ReplicaEntry| e.enabled && !exclude.contains(&e.id) && snapshot.is_healthy(&e.id);

        if let Some(entry) = preferred.and_then(|id| self.registry.get(id)) {
            if usable(entry) {
                debug!(replica = %entry.id, "read routed to pinned replica");
                return Some(entry);
            }
        }

        let healthy: Vec<&ReplicaEntry> = self.registry.secondaries().filter(|e| usable(e)).collect();
        if !healthy.is_empty() {
            let slot = self.cursor.fetch_add(1, Ordering::Relaxed) % healthy.len();
            debug!(replica = %healthy[slot].id, "read routed round-robin");
            return Some(healthy[slot]);
        }

        let primary = self.registry.primary();
        if primary.enabled && !exclude.contains(&primary.id) {
            debug!("no healthy secondary, read falls back to primary");
            return Some(primary);
        }
        None
    }

    /// Run a read against the routed replica. A transient failure marks that
    /// replica unhealthy and retries on the next one; anything else is
    /// returned as is.
    pub fn with_read<T>(
        &self,
        preferred: Option<&ReplicaId>,
        read: impl Fn(&dyn ReplicaStore) -> Result<T, StorageError>,
    ) -> Result<T, EngineError> {
        let mut tried: Vec<ReplicaId> = Vec::new();
        let mut preferred = preferred;
        let mut last_err = None;

        while let Some(entry) = self.select_read(preferred, &tried) {
            match read(entry.store.as_ref()) {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() => {
                    warn!(replica = %entry.id, error = %e, "read failed, trying another replica");
                    self.health.mark_unhealthy(&entry.id);
                    tried.push(entry.id.clone());
                    preferred = None;
                    last_err = Some(e);
                }
                Err(e) => return Err(e.into()),
            }
        }

        Err(match last_err {
            Some(e) => e.into(),
            None => EngineError::ReplicaUnavailable(self.registry.primary().id.clone()),
        })
    }
}
