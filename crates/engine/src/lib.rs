pub mod clocks;
pub mod config;
pub mod detector;
pub mod error;
pub mod health;
pub mod metrics;
pub mod monitor;
pub mod records;
pub mod registry;
pub mod resolver;
pub mod router;
pub mod sessions;
pub mod tasks;

pub use config::{EngineConfig, ReplicaRole, ResolutionScope};
pub use detector::{ClockIssue, ConflictDescriptor};
pub use error::EngineError;
pub use health::{HealthSnapshot, ReplicaHealthTracker};
pub use metrics::{EngineEvent, InMemoryMetrics, MetricsSink, MetricsSnapshot, RecordedEvent};
pub use monitor::{ConsistencyReport, OverallStatus, SessionConsistency};
pub use records::{LabelPatch, LabelingStats, NewLabel};
pub use registry::{ReplicaEntry, ReplicaRegistry};
pub use resolver::{ResolutionOutcome, ResolutionStrategy};
pub use sessions::{CleanupReport, NewSession, SessionStats, SessionSummary};
pub use tasks::BackgroundTasks;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use tracing::warn;

use labelsync_core::{RecordId, ReplicaId, SessionId};
use labelsync_storage::{ConflictCounts, LabeledRecord, SessionRecord};

use crate::clocks::{ClockStore, Timestamps};
use crate::monitor::{ConsistencyMonitor, enabled_replicas_healthy};
use crate::records::LabelingRecordStore;
use crate::resolver::ConflictResolver;
use crate::router::ReplicaRouter;
use crate::sessions::SessionManager;

const TOTAL_REQUESTS: &str = "requests.total";

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthReport {
    pub status: OverallStatus,
    pub replica_health: BTreeMap<ReplicaId, bool>,
    pub active_sessions: usize,
    pub total_requests: u64,
}

/// The consistency engine. Every operation takes `&self`; share it as
/// `Arc<Engine>` between request workers and [`BackgroundTasks`].
pub struct Engine {
    config: EngineConfig,
    router: Arc<ReplicaRouter>,
    metrics: Arc<dyn MetricsSink>,
    sessions: SessionManager,
    records: LabelingRecordStore,
    resolver: ConflictResolver,
    monitor: ConsistencyMonitor,
}

impl Engine {
    /// Open every configured replica and build the engine around them.
    pub fn open(config: EngineConfig) -> Result<Self, EngineError> {
        let registry = ReplicaRegistry::open(&config)?;
        let metrics = Arc::new(InMemoryMetrics::new(
            config.metrics.event_capacity,
            config.metrics.timing_samples,
        ));
        Ok(Self::with_registry(config, registry, metrics))
    }

    /// Build the engine over replicas opened elsewhere. `config.replicas` is
    /// not consulted.
    pub fn with_registry(config: EngineConfig, registry: ReplicaRegistry, metrics: Arc<dyn MetricsSink>) -> Self {
        let registry = Arc::new(registry);
        let health = Arc::new(ReplicaHealthTracker::new(
            Arc::clone(&registry),
            Arc::clone(&metrics),
            config.health.probe_timeout(),
            config.health.staleness(),
        ));
        let router = Arc::new(ReplicaRouter::new(registry, health));
        let clocks = Arc::new(ClockStore::new());
        let timestamps = Arc::new(Timestamps::new());

        let sessions = SessionManager::new(
            Arc::clone(&router),
            Arc::clone(&clocks),
            Arc::clone(&timestamps),
            Arc::clone(&metrics),
            config.sessions.clone(),
        );
        let records = LabelingRecordStore::new(
            Arc::clone(&router),
            clocks,
            Arc::clone(&timestamps),
            Arc::clone(&metrics),
        );
        let resolver = ConflictResolver::new(
            Arc::clone(&router),
            timestamps,
            Arc::clone(&metrics),
            config.resolution.clone(),
        );
        let monitor = ConsistencyMonitor::new(Arc::clone(&router), Arc::clone(&metrics));

        Self {
            config,
            router,
            metrics,
            sessions,
            records,
            resolver,
            monitor,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn router(&self) -> &ReplicaRouter {
        &self.router
    }

    /// Count the call, time it, and record `<op>.success` or `<op>.error`.
    fn instrumented<T>(&self, op: &str, f: impl FnOnce() -> Result<T, EngineError>) -> Result<T, EngineError> {
        let started = Instant::now();
        self.metrics.increment_counter(TOTAL_REQUESTS, 1);
        let result = f();
        let outcome = if result.is_ok() { "success" } else { "error" };
        self.metrics.increment_counter(&format!("{op}.{outcome}"), 1);
        self.metrics
            .record_timing(&format!("{op}.duration"), started.elapsed());
        result
    }

    // --- sessions ---

    pub fn create_session(&self, annotator_id: &str) -> Result<NewSession, EngineError> {
        self.instrumented("create_session", || self.sessions.create(annotator_id))
    }

    pub fn get_session(&self, session_id: SessionId) -> Result<SessionRecord, EngineError> {
        self.instrumented("get_session", || self.sessions.get(session_id))
    }

    pub fn list_sessions(&self, active_only: bool) -> Result<Vec<SessionRecord>, EngineError> {
        self.instrumented("list_sessions", || self.sessions.list(active_only))
    }

    pub fn switch_replica(&self, session_id: SessionId, replica: &ReplicaId) -> Result<(), EngineError> {
        self.instrumented("switch_replica", || self.sessions.switch_replica(session_id, replica))
    }

    pub fn end_session(&self, session_id: SessionId) -> Result<SessionSummary, EngineError> {
        self.instrumented("end_session", || self.sessions.end(session_id))
    }

    pub fn expire_idle_sessions(&self) -> Result<Vec<SessionId>, EngineError> {
        self.instrumented("expire_idle_sessions", || self.sessions.expire_idle())
    }

    pub fn cleanup_old_data(&self, days: u32) -> Result<CleanupReport, EngineError> {
        self.instrumented("cleanup_old_data", || self.sessions.cleanup_old_data(days))
    }

    // --- labeling ---

    pub fn create_label(
        &self,
        session_id: SessionId,
        annotator_id: &str,
        label: NewLabel,
    ) -> Result<LabeledRecord, EngineError> {
        self.instrumented("create_label", || self.records.create(session_id, annotator_id, label))
    }

    pub fn update_label(&self, record_id: RecordId, patch: LabelPatch) -> Result<LabeledRecord, EngineError> {
        self.instrumented("update_label", || self.records.update(record_id, patch))
    }

    pub fn batch_label(
        &self,
        session_id: SessionId,
        annotator_id: &str,
        items: Vec<NewLabel>,
    ) -> Result<Vec<LabeledRecord>, EngineError> {
        self.instrumented("batch_label", || {
            self.records.batch_create(session_id, annotator_id, items)
        })
    }

    /// Labels of a session, read from the session's pinned replica when it is
    /// healthy. `limit: None` returns everything after `offset`.
    pub fn list_labels(
        &self,
        session_id: SessionId,
        limit: Option<u32>,
        offset: u32,
    ) -> Result<Vec<LabeledRecord>, EngineError> {
        self.instrumented("list_labels", || {
            let session = self.sessions.get(session_id)?;
            self.sessions.note_activity(session_id);
            self.records
                .list_by_session(session_id, Some(&session.current_replica), limit, offset)
        })
    }

    pub fn list_conflicts(&self, session_id: SessionId) -> Result<Vec<LabeledRecord>, EngineError> {
        self.instrumented("list_conflicts", || {
            let session = self.sessions.get(session_id)?;
            self.records
                .list_conflicts(session_id, Some(&session.current_replica))
        })
    }

    /// Totals for one annotator across all of their sessions.
    pub fn labeling_stats(&self, annotator_id: &str) -> Result<LabelingStats, EngineError> {
        self.instrumented("labeling_stats", || self.records.annotator_stats(annotator_id))
    }

    pub fn session_labeling_stats(&self, session_id: SessionId) -> Result<LabelingStats, EngineError> {
        self.instrumented("session_labeling_stats", || {
            let session = self.sessions.get(session_id)?;
            self.records
                .session_stats(session_id, Some(&session.current_replica))
        })
    }

    // --- resolution ---

    /// Resolve the conflict group `record_id` belongs to. The strategy name
    /// is checked before anything is read or written.
    pub fn resolve_conflict(
        &self,
        record_id: RecordId,
        strategy: &str,
        chosen_label: Option<&str>,
    ) -> Result<ResolutionOutcome, EngineError> {
        self.instrumented("resolve_conflict", || {
            let strategy: ResolutionStrategy = strategy.parse()?;
            self.resolver.resolve_record(record_id, strategy, chosen_label)
        })
    }

    pub fn resolve_session_conflicts(&self, session_id: SessionId, strategy: &str) -> Result<ResolutionOutcome, EngineError> {
        self.instrumented("resolve_session_conflicts", || {
            let strategy: ResolutionStrategy = strategy.parse()?;
            self.sessions.get(session_id)?;
            self.resolver.resolve_session(session_id, strategy)
        })
    }

    // --- monitoring ---

    pub fn refresh_health(&self) -> Arc<HealthSnapshot> {
        self.router.health().refresh_all()
    }

    /// Primary down is an error, any other enabled replica down is degraded.
    /// Never fails; a session count that cannot be read reports as an error.
    pub fn health(&self) -> HealthReport {
        let snapshot = self.router.health().ensure_fresh();
        let primary_ok = snapshot.is_healthy(&self.router.registry().primary().id);
        let active = self.sessions.list(true).map(|s| s.len());

        let status = match (&active, primary_ok) {
            (Err(e), _) => {
                warn!(error = %e, "health check could not count sessions");
                OverallStatus::Error
            }
            (Ok(_), false) => OverallStatus::Error,
            (Ok(_), true) if !enabled_replicas_healthy(&self.router, &snapshot) => OverallStatus::Degraded,
            (Ok(_), true) => OverallStatus::Healthy,
        };

        HealthReport {
            status,
            replica_health: snapshot.as_map(),
            active_sessions: active.unwrap_or(0),
            total_requests: self.metrics.snapshot().counter(TOTAL_REQUESTS),
        }
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Up to `limit` recorded events, newest first. `kind` must be one of
    /// [`EngineEvent::KINDS`].
    pub fn events(&self, kind: Option<&str>, limit: usize) -> Result<Vec<RecordedEvent>, EngineError> {
        if let Some(kind) = kind {
            if !EngineEvent::KINDS.contains(&kind) {
                return Err(EngineError::InvalidInput(format!("unknown event kind: {kind}")));
            }
        }
        Ok(self.metrics.snapshot().recent_events(kind, limit))
    }

    pub fn conflict_stats(&self) -> Result<ConflictCounts, EngineError> {
        self.instrumented("conflict_stats", || self.records.conflict_counts())
    }

    pub fn session_stats(&self) -> Result<SessionStats, EngineError> {
        self.instrumented("session_stats", || self.sessions.stats())
    }

    pub fn consistency_report(&self) -> Result<ConsistencyReport, EngineError> {
        self.instrumented("consistency_report", || self.monitor.run_sweep())
    }

    pub fn check_session(&self, session_id: SessionId) -> Result<SessionConsistency, EngineError> {
        self.instrumented("check_session", || {
            let session = self.sessions.get(session_id)?;
            self.monitor.check_session(&session)
        })
    }
}
