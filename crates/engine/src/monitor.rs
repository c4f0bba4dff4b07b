use std::collections::BTreeMap;
use std::sync::Arc;

use serde::Serialize;
use tracing::{error, info};

use labelsync_core::{ReplicaId, SessionId, hlc::physical_now};
use labelsync_storage::SessionRecord;

use crate::EngineError;
use crate::detector::{ClockIssue, ConflictDescriptor, check_clock_consistency, detect_label_conflicts};
use crate::health::HealthSnapshot;
use crate::metrics::MetricsSink;
use crate::router::ReplicaRouter;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OverallStatus {
    Healthy,
    Degraded,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionConsistency {
    pub session_id: SessionId,
    pub record_count: usize,
    /// Records still flagged `is_conflict`.
    pub flagged: usize,
    pub label_conflicts: Vec<ConflictDescriptor>,
    pub clock_issues: Vec<ClockIssue>,
    pub replica: ReplicaId,
    pub replica_healthy: bool,
}

impl SessionConsistency {
    pub fn is_consistent(&self) -> bool {
        self.label_conflicts.is_empty() && self.clock_issues.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConsistencyReport {
    pub timestamp_ms: u64,
    pub active_session_count: usize,
    pub sessions_checked: usize,
    pub conflicts_found: usize,
    pub replica_health: BTreeMap<ReplicaId, bool>,
    pub overall_status: OverallStatus,
    /// Sessions whose check failed; the sweep carried on without them.
    pub failed_sessions: Vec<SessionId>,
}

/// Enabled replicas only; a replica switched off in config is not a fault.
pub(crate) fn enabled_replicas_healthy(router: &ReplicaRouter, health: &HealthSnapshot) -> bool {
    router
        .registry()
        .entries()
        .iter()
        .filter(|e| e.enabled)
        .all(|e| health.is_healthy(&e.id))
}

pub struct ConsistencyMonitor {
    router: Arc<ReplicaRouter>,
    metrics: Arc<dyn MetricsSink>,
}

impl ConsistencyMonitor {
    pub fn new(router: Arc<ReplicaRouter>, metrics: Arc<dyn MetricsSink>) -> Self {
        Self { router, metrics }
    }

    pub fn check_session(&self, session: &SessionRecord) -> Result<SessionConsistency, EngineError> {
        let session_id = session.session_id;
        let records = self
            .router
            .with_read(Some(&session.current_replica), |store| store.list_records(session_id, None, 0))?;

        Ok(SessionConsistency {
            session_id,
            record_count: records.len(),
            flagged: records.iter().filter(|r| r.is_conflict).count(),
            label_conflicts: detect_label_conflicts(&records),
            clock_issues: check_clock_consistency(&records),
            replica: session.current_replica.clone(),
            replica_healthy: self.router.health().snapshot().is_healthy(&session.current_replica),
        })
    }

    /// Refresh health, check every active session, publish gauges. A session
    /// whose check fails is logged and counted; the sweep goes on.
    pub fn run_sweep(&self) -> Result<ConsistencyReport, EngineError> {
        let health = self.router.health().refresh_all();
        let sessions = self.router.with_read(None, |store| store.list_sessions(true))?;

        let mut sessions_checked = 0;
        let mut conflicts_found = 0;
        let mut failed_sessions = Vec::new();
        for session in &sessions {
            match self.check_session(session) {
                Ok(checked) => {
                    sessions_checked += 1;
                    conflicts_found += checked.label_conflicts.len();
                }
                Err(e) => {
                    error!(session_id = %session.session_id, error = %e, "consistency check failed");
                    failed_sessions.push(session.session_id);
                }
            }
        }

        let replicas_ok = enabled_replicas_healthy(&self.router, &health);
        let overall_status = if !failed_sessions.is_empty() {
            OverallStatus::Error
        } else if conflicts_found > 0 || !replicas_ok {
            OverallStatus::Degraded
        } else {
            OverallStatus::Healthy
        };

        self.metrics
            .set_gauge("consistency.active_sessions", sessions.len() as f64);
        self.metrics
            .set_gauge("consistency.conflicts", conflicts_found as f64);
        info!(
            active = sessions.len(),
            conflicts = conflicts_found,
            failed = failed_sessions.len(),
            status = ?overall_status,
            "consistency sweep finished"
        );

        Ok(ConsistencyReport {
            timestamp_ms: physical_now()?,
            active_session_count: sessions.len(),
            sessions_checked,
            conflicts_found,
            replica_health: health.as_map(),
            overall_status,
            failed_sessions,
        })
    }
}
