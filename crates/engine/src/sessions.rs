use std::collections::BTreeMap;
use std::sync::Arc;

use serde::Serialize;
use tracing::{info, warn};

use labelsync_core::{Hlc, ReplicaId, SessionId, VectorClock};
use labelsync_storage::SessionRecord;

use crate::EngineError;
use crate::clocks::{ClockStore, Timestamps};
use crate::config::SessionConfig;
use crate::metrics::{EngineEvent, MetricsSink};
use crate::router::ReplicaRouter;

const MS_PER_DAY: u64 = 86_400_000;
const RECENT_SESSIONS: usize = 10;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NewSession {
    pub session_id: SessionId,
    pub initial_clock: VectorClock,
    pub replica: ReplicaId,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct SessionSummary {
    pub session_id: SessionId,
    pub duration_secs: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct CleanupReport {
    pub sessions_deleted: u64,
    pub records_deleted: u64,
    pub cutoff: Hlc,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionStats {
    pub total_sessions: usize,
    pub active_sessions: usize,
    /// Active sessions per pinned replica. Every registered replica is listed.
    pub replica_distribution: BTreeMap<ReplicaId, usize>,
    /// Active sessions, most recently active first.
    pub recent_sessions: Vec<SessionRecord>,
}

pub struct SessionManager {
    router: Arc<ReplicaRouter>,
    clocks: Arc<ClockStore>,
    timestamps: Arc<Timestamps>,
    metrics: Arc<dyn MetricsSink>,
    config: SessionConfig,
}

impl SessionManager {
    pub fn new(
        router: Arc<ReplicaRouter>,
        clocks: Arc<ClockStore>,
        timestamps: Arc<Timestamps>,
        metrics: Arc<dyn MetricsSink>,
        config: SessionConfig,
    ) -> Self {
        Self {
            router,
            clocks,
            timestamps,
            metrics,
            config,
        }
    }

    /// Start a session pinned to the primary with clock `{primary: 0}`.
    pub fn create(&self, annotator_id: &str) -> Result<NewSession, EngineError> {
        if annotator_id.trim().is_empty() {
            return Err(EngineError::InvalidInput("annotator_id must not be empty".into()));
        }
        let primary = self.router.route_write()?;
        let at = self.timestamps.now()?;
        let clock = VectorClock::create(primary.id.as_str());
        let session = SessionRecord {
            session_id: SessionId::new(),
            annotator_id: annotator_id.to_string(),
            current_replica: primary.id.clone(),
            is_active: true,
            created_at: at,
            last_activity: at,
            ended_at: None,
        };
        primary.store.insert_session(&session, &clock)?;
        self.clocks.merge(session.session_id, &clock);

        info!(session_id = %session.session_id, annotator_id, "session created");
        self.metrics.record_event(EngineEvent::SessionCreated {
            session_id: session.session_id,
            annotator_id: session.annotator_id.clone(),
            replica: primary.id.clone(),
        });
        Ok(NewSession {
            session_id: session.session_id,
            initial_clock: clock,
            replica: primary.id.clone(),
        })
    }

    /// Read through the router. A secondary that has not seen the session
    /// yet is not taken as proof it does not exist; the primary decides.
    pub fn get(&self, session_id: SessionId) -> Result<SessionRecord, EngineError> {
        if let Some(session) = self.router.with_read(None, |store| store.get_session(session_id))? {
            return Ok(session);
        }
        self.router
            .primary_store()?
            .get_session(session_id)?
            .ok_or(EngineError::SessionNotFound(session_id))
    }

    pub fn list(&self, active_only: bool) -> Result<Vec<SessionRecord>, EngineError> {
        self.router.with_read(None, |store| store.list_sessions(active_only))
    }

    /// Record activity on the primary. Best effort: reads keep working
    /// through the secondaries while the primary is away.
    pub fn note_activity(&self, session_id: SessionId) {
        let touched = self
            .timestamps
            .now()
            .and_then(|at| Ok(self.router.primary_store()?.touch_session(session_id, at)?));
        if let Err(e) = touched {
            warn!(session_id = %session_id, error = %e, "session activity not recorded");
        }
    }

    pub fn stats(&self) -> Result<SessionStats, EngineError> {
        let sessions = self.list(false)?;
        let mut replica_distribution: BTreeMap<ReplicaId, usize> = self
            .router
            .registry()
            .entries()
            .iter()
            .map(|e| (e.id.clone(), 0))
            .collect();

        let mut active: Vec<SessionRecord> = sessions.iter().filter(|s| s.is_active).cloned().collect();
        for session in &active {
            *replica_distribution.entry(session.current_replica.clone()).or_insert(0) += 1;
        }
        let active_sessions = active.len();
        active.sort_by(|a, b| b.last_activity.cmp(&a.last_activity));
        active.truncate(RECENT_SESSIONS);

        Ok(SessionStats {
            total_sessions: sessions.len(),
            active_sessions,
            replica_distribution,
            recent_sessions: active,
        })
    }

    /// Pin the session's reads to `replica`, which must be known, enabled
    /// and currently healthy.
    pub fn switch_replica(&self, session_id: SessionId, replica: &ReplicaId) -> Result<(), EngineError> {
        let target = self
            .router
            .registry()
            .get(replica)
            .filter(|e| e.enabled)
            .ok_or_else(|| EngineError::ReplicaUnavailable(replica.clone()))?;
        if !self.router.health().ensure_fresh().is_healthy(&target.id) {
            return Err(EngineError::ReplicaUnavailable(replica.clone()));
        }

        let primary = self.router.primary_store()?;
        let session = primary
            .get_session(session_id)?
            .ok_or(EngineError::SessionNotFound(session_id))?;
        let at = self.timestamps.now()?;
        if !primary.set_session_replica(session_id, replica, at)? {
            return Err(EngineError::SessionNotFound(session_id));
        }

        info!(session_id = %session_id, from = %session.current_replica, to = %replica, "replica switched");
        self.metrics.record_event(EngineEvent::ReplicaSwitched {
            session_id,
            from: session.current_replica,
            to: replica.clone(),
        });
        Ok(())
    }

    /// Deactivate the session and drop its cached clock. Ending twice
    /// reports the duration of the first end.
    pub fn end(&self, session_id: SessionId) -> Result<SessionSummary, EngineError> {
        let primary = self.router.primary_store()?;
        let session = primary
            .get_session(session_id)?
            .ok_or(EngineError::SessionNotFound(session_id))?;
        let at = self.timestamps.now()?;
        primary.deactivate_session(session_id, at)?;
        self.clocks.remove(session_id);

        let ended_at = session.ended_at.unwrap_or(at);
        let duration_secs = ended_at.seconds_since(&session.created_at);
        info!(session_id = %session_id, duration_secs, "session ended");
        self.metrics.record_event(EngineEvent::SessionEnded {
            session_id,
            duration_secs,
        });
        Ok(SessionSummary {
            session_id,
            duration_secs,
        })
    }

    /// Deactivate sessions idle for longer than the configured timeout.
    pub fn expire_idle(&self) -> Result<Vec<SessionId>, EngineError> {
        let now = self.timestamps.now()?;
        let idle_ms = self.config.idle_timeout_secs.saturating_mul(1000);
        let idle_before = Hlc::at_millis(now.wall_ms().saturating_sub(idle_ms));
        let expired = self
            .router
            .primary_store()?
            .deactivate_idle_sessions(idle_before, now)?;

        for session_id in &expired {
            self.clocks.remove(*session_id);
        }
        if !expired.is_empty() {
            info!(count = expired.len(), "idle sessions expired");
            self.metrics
                .increment_counter("sessions.expired", expired.len() as u64);
        }
        Ok(expired)
    }

    /// Remove inactive sessions and settled records older than `days`.
    pub fn cleanup_old_data(&self, days: u32) -> Result<CleanupReport, EngineError> {
        let now = self.timestamps.now()?;
        let cutoff = Hlc::at_millis(now.wall_ms().saturating_sub(u64::from(days) * MS_PER_DAY));
        let counts = self.router.primary_store()?.purge_before(cutoff)?;
        info!(
            sessions = counts.sessions,
            records = counts.records,
            days,
            "old data cleaned up"
        );
        Ok(CleanupReport {
            sessions_deleted: counts.sessions,
            records_deleted: counts.records,
            cutoff,
        })
    }

    pub fn retention_days(&self) -> u32 {
        self.config.retention_days
    }
}
