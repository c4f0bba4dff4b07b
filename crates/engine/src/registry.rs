use std::sync::Arc;

use labelsync_core::ReplicaId;
use labelsync_storage::{ReplicaStore, SqliteReplica};

use crate::EngineError;
use crate::config::{EngineConfig, ReplicaRole};

pub struct ReplicaEntry {
    pub id: ReplicaId,
    pub role: ReplicaRole,
    /// Administratively enabled. A disabled replica is never probed or routed to.
    pub enabled: bool,
    pub store: Arc<dyn ReplicaStore>,
}

impl ReplicaEntry {
    pub fn new(
        id: impl Into<ReplicaId>,
        role: ReplicaRole,
        store: Arc<dyn ReplicaStore>,
    ) -> Self {
        Self {
            id: id.into(),
            role,
            enabled: true,
            store,
        }
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    pub fn is_primary(&self) -> bool {
        self.role == ReplicaRole::Primary
    }
}

/// The configured replicas in registration order, with exactly one primary.
pub struct ReplicaRegistry {
    entries: Vec<ReplicaEntry>,
    primary: usize,
}

impl ReplicaRegistry {
    pub fn new(entries: Vec<ReplicaEntry>) -> Result<Self, EngineError> {
        let mut primaries = entries
            .iter()
            .enumerate()
            .filter(|(_, e)| e.is_primary())
            .map(|(i, _)| i);
        let primary = primaries
            .next()
            .ok_or_else(|| EngineError::Config("no primary replica registered".into()))?;
        if primaries.next().is_some() {
            return Err(EngineError::Config("more than one primary replica registered".into()));
        }

        for (i, entry) in entries.iter().enumerate() {
            if entries[..i].iter().any(|e| e.id == entry.id) {
                return Err(EngineError::Config(format!("duplicate replica id: {}", entry.id)));
            }
        }

        Ok(Self { entries, primary })
    }

    /// Open a SQLite replica for every configured entry. The primary is opened
    /// first so the schema exists before secondaries attach read-only.
    pub fn open(config: &EngineConfig) -> Result<Self, EngineError> {
        config.validate()?;
        let timeout = config.health.probe_timeout();

        let mut entries = Vec::with_capacity(config.replicas.len());
        let ordered = config
            .replicas
            .iter()
            .filter(|r| r.role == ReplicaRole::Primary)
            .chain(config.replicas.iter().filter(|r| r.role == ReplicaRole::Secondary));
        for replica in ordered {
            let store: Arc<dyn ReplicaStore> = match replica.role {
                ReplicaRole::Primary => Arc::new(SqliteReplica::open_primary(&replica.path, timeout)?),
                ReplicaRole::Secondary => {
                    Arc::new(SqliteReplica::open_secondary(&replica.path, timeout)?)
                }
            };
            entries.push(ReplicaEntry {
                id: replica.id.clone(),
                role: replica.role,
                enabled: replica.enabled,
                store,
            });
        }

        // restore registration order for round-robin
        entries.sort_by_key(|e| {
            config
                .replicas
                .iter()
                .position(|r| r.id == e.id)
                .unwrap_or(usize::MAX)
        });
        Self::new(entries)
    }

    pub fn primary(&self) -> &ReplicaEntry {
        &self.entries[self.primary]
    }

    pub fn get(&self, id: &ReplicaId) -> Option<&ReplicaEntry> {
        self.entries.iter().find(|e| &e.id == id)
    }

    pub fn entries(&self) -> &[ReplicaEntry] {
        &self.entries
    }

    pub fn secondaries(&self) -> impl Iterator<Item = &ReplicaEntry> {
        self.entries.iter().filter(|e| !e.is_primary())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> Arc<dyn ReplicaStore> {
        Arc::new(SqliteReplica::open_in_memory().unwrap())
    }

    #[test]
    fn keeps_registration_order() {
        let registry = ReplicaRegistry::new(vec![
            ReplicaEntry::new("replica-1", ReplicaRole::Secondary, store()),
            ReplicaEntry::new("primary", ReplicaRole::Primary, store()),
            ReplicaEntry::new("replica-2", ReplicaRole::Secondary, store()),
        ])
        .unwrap();

        assert_eq!(registry.primary().id.as_str(), "primary");
        let secondaries: Vec<_> = registry.secondaries().map(|e| e.id.as_str()).collect();
        assert_eq!(secondaries, vec!["replica-1", "replica-2"]);
    }

    #[test]
    fn rejects_bad_topologies() {
        assert!(ReplicaRegistry::new(vec![]).is_err());
        assert!(
            ReplicaRegistry::new(vec![
                ReplicaEntry::new("a", ReplicaRole::Primary, store()),
                ReplicaEntry::new("b", ReplicaRole::Primary, store()),
            ])
            .is_err()
        );
        assert!(
            ReplicaRegistry::new(vec![
                ReplicaEntry::new("a", ReplicaRole::Primary, store()),
                ReplicaEntry::new("a", ReplicaRole::Secondary, store()),
            ])
            .is_err()
        );
    }
}
