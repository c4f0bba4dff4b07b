use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::Serialize;
use tracing::info;

use labelsync_core::{RecordId, SessionId};
use labelsync_storage::{GroupResolution, LabeledRecord, ReplicaStore, ResolutionStatus};

use crate::EngineError;
use crate::clocks::Timestamps;
use crate::config::{ResolutionConfig, ResolutionScope};
use crate::metrics::{EngineEvent, MetricsSink};
use crate::router::ReplicaRouter;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionStrategy {
    /// Keep the most recently updated record.
    LastWriteWins,
    /// Keep the record with the highest confidence.
    ConfidenceBased,
    /// Keep every record, clear the flags, apply the caller's label.
    Manual,
}

impl ResolutionStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::LastWriteWins => "last_write_wins",
            Self::ConfidenceBased => "confidence_based",
            Self::Manual => "manual_resolution",
        }
    }

    pub fn status(&self) -> ResolutionStatus {
        match self {
            Self::LastWriteWins => ResolutionStatus::LastWriteWins,
            Self::ConfidenceBased => ResolutionStatus::ConfidenceBased,
            Self::Manual => ResolutionStatus::Manual,
        }
    }
}

impl fmt::Display for ResolutionStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ResolutionStrategy {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "last_write_wins" => Ok(Self::LastWriteWins),
            "confidence_based" => Ok(Self::ConfidenceBased),
            "manual_resolution" | "manual" => Ok(Self::Manual),
            other => Err(EngineError::UnknownStrategy(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ResolutionOutcome {
    pub strategy: ResolutionStrategy,
    /// Conflict groups that were settled. Zero means nothing was pending.
    pub groups: usize,
    pub deleted: usize,
    pub cleared: usize,
}

impl ResolutionOutcome {
    fn empty(strategy: ResolutionStrategy) -> Self {
        Self {
            strategy,
            groups: 0,
            deleted: 0,
            cleared: 0,
        }
    }

    fn add(&mut self, plan: &GroupResolution) {
        self.groups += 1;
        self.deleted += plan.delete.len();
        self.cleared += plan.mark.len();
    }
}

/// Decide how one `data_id` group is settled. `None` when no record in the
/// group is still flagged, which makes resolving twice a no-op.
///
/// `chosen_label` goes to the survivor, or for manual resolution to the
/// named record (which must belong to the group).
pub fn plan_resolution(
    strategy: ResolutionStrategy,
    group: &[LabeledRecord],
    chosen_label: Option<(RecordId, &str)>,
) -> Option<GroupResolution> {
    if !group.iter().any(|r| r.is_conflict) {
        return None;
    }
    let data_id = group.first()?.data_id.clone();

    let survivor = match strategy {
        ResolutionStrategy::LastWriteWins => group
            .iter()
            .max_by(|a, b| a.updated_at.cmp(&b.updated_at).then(a.record_id.cmp(&b.record_id))),
        ResolutionStrategy::ConfidenceBased => group.iter().max_by(|a, b| {
            a.confidence
                .total_cmp(&b.confidence)
                .then(a.record_id.cmp(&b.record_id))
        }),
        ResolutionStrategy::Manual => None,
    };

    let plan = match survivor {
        Some(winner) => GroupResolution {
            data_id,
            status: strategy.status(),
            survivor: Some(winner.record_id),
            delete: group
                .iter()
                .filter(|r| r.record_id != winner.record_id)
                .map(|r| r.record_id)
                .collect(),
            mark: vec![winner.record_id],
            relabel: chosen_label.map(|(_, label)| (winner.record_id, label.to_string())),
        },
        None => {
            let relabel = chosen_label
                .filter(|(id, _)| group.iter().any(|r| r.record_id == *id))
                .map(|(id, label)| (id, label.to_string()));
            let mut mark: Vec<RecordId> = group
                .iter()
                .filter(|r| r.is_conflict)
                .map(|r| r.record_id)
                .collect();
            if let Some((id, _)) = &relabel {
                if !mark.contains(id) {
                    mark.push(*id);
                }
            }
            GroupResolution {
                data_id,
                status: strategy.status(),
                survivor: None,
                delete: Vec::new(),
                mark,
                relabel,
            }
        }
    };
    Some(plan)
}

/// Settles conflict groups on the primary. Each group is read, planned and
/// applied inside one storage transaction, so concurrent resolutions of the
/// same group never act on each other's stale view.
pub struct ConflictResolver {
    router: Arc<ReplicaRouter>,
    timestamps: Arc<Timestamps>,
    metrics: Arc<dyn MetricsSink>,
    config: ResolutionConfig,
}

impl ConflictResolver {
    pub fn new(
        router: Arc<ReplicaRouter>,
        timestamps: Arc<Timestamps>,
        metrics: Arc<dyn MetricsSink>,
        config: ResolutionConfig,
    ) -> Self {
        Self {
            router,
            timestamps,
            metrics,
            config,
        }
    }

    fn scope(&self, session_id: SessionId) -> Option<SessionId> {
        match self.config.scope {
            ResolutionScope::Session => Some(session_id),
            ResolutionScope::Global => None,
        }
    }

    fn apply(
        &self,
        primary: &dyn ReplicaStore,
        strategy: ResolutionStrategy,
        session_id: SessionId,
        data_id: &str,
        chosen_label: Option<(RecordId, &str)>,
        outcome: &mut ResolutionOutcome,
    ) -> Result<(), EngineError> {
        let at = self.timestamps.now()?;
        let planner = |group: &[LabeledRecord]| plan_resolution(strategy, group, chosen_label);
        let Some(plan) = primary.resolve_group(
            data_id,
            self.scope(session_id),
            &planner,
            self.config.archive_resolved,
            at,
        )?
        else {
            return Ok(());
        };
        info!(
            data_id = %plan.data_id,
            strategy = %strategy,
            deleted = plan.delete.len(),
            "conflict group resolved"
        );
        outcome.add(&plan);
        Ok(())
    }

    fn finish(&self, outcome: ResolutionOutcome) -> ResolutionOutcome {
        if outcome.groups > 0 {
            self.metrics.increment_counter("conflicts.resolved", outcome.groups as u64);
            self.metrics.record_event(EngineEvent::ConflictsResolved {
                strategy: outcome.strategy.as_str().to_string(),
                groups: outcome.groups,
                deleted: outcome.deleted,
            });
        }
        outcome
    }

    /// Resolve the group the given record belongs to.
    pub fn resolve_record(
        &self,
        record_id: RecordId,
        strategy: ResolutionStrategy,
        chosen_label: Option<&str>,
    ) -> Result<ResolutionOutcome, EngineError> {
        if let Some(label) = chosen_label {
            if label.trim().is_empty() {
                return Err(EngineError::InvalidInput("chosen label must not be empty".into()));
            }
        }
        let primary = self.router.primary_store()?;
        let record = primary
            .get_record(record_id)?
            .ok_or(EngineError::RecordNotFound(record_id))?;

        let mut outcome = ResolutionOutcome::empty(strategy);
        self.apply(
            primary,
            strategy,
            record.session_id,
            &record.data_id,
            chosen_label.map(|label| (record_id, label)),
            &mut outcome,
        )?;
        Ok(self.finish(outcome))
    }

    /// Resolve every conflicted group of a session. Groups commit one by one;
    /// a failure leaves earlier groups resolved and later ones pending.
    pub fn resolve_session(
        &self,
        session_id: SessionId,
        strategy: ResolutionStrategy,
    ) -> Result<ResolutionOutcome, EngineError> {
        let primary = self.router.primary_store()?;
        let data_ids: BTreeSet<String> = primary
            .list_conflicts(Some(session_id))?
            .into_iter()
            .map(|r| r.data_id)
            .collect();

        let mut outcome = ResolutionOutcome::empty(strategy);
        for data_id in &data_ids {
            self.apply(primary, strategy, session_id, data_id, None, &mut outcome)?;
        }
        Ok(self.finish(outcome))
    }
}
