use std::error::Error;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tempfile::TempDir;

use labelsync_core::{Confidence, ReplicaId, VectorClock};
use labelsync_engine::{
    Engine, EngineConfig, InMemoryMetrics, NewLabel, ReplicaEntry, ReplicaRegistry, ReplicaRole,
};
use labelsync_storage::{ReplicaStore, SqliteReplica};

use crate::FlakyReplica;

/// A primary plus read-only secondaries over one SQLite file in a temp dir.
/// Every replica is wrapped in a [`FlakyReplica`] so tests can take it down.
pub struct TestCluster {
    pub engine: Arc<Engine>,
    replicas: Vec<(ReplicaId, Arc<FlakyReplica>)>,
    db_path: PathBuf,
    _dir: TempDir,
}

impl TestCluster {
    pub fn new(secondaries: usize) -> Result<Self, Box<dyn Error>> {
        Self::with_config(secondaries, EngineConfig::default())
    }

    pub fn with_config(secondaries: usize, config: EngineConfig) -> Result<Self, Box<dyn Error>> {
        crate::init_test_logging();
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("labels.db");
        let timeout = config.health.probe_timeout();

        let mut replicas = vec![(
            ReplicaId::from("primary"),
            Arc::new(FlakyReplica::new("primary", SqliteReplica::open_primary(&path, timeout)?)),
        )];
        for i in 1..=secondaries {
            let name = format!("replica-{i}");
            let store = SqliteReplica::open_secondary(&path, timeout)?;
            replicas.push((ReplicaId::new(name.clone()), Arc::new(FlakyReplica::new(&name, store))));
        }

        let entries = replicas
            .iter()
            .enumerate()
            .map(|(i, (id, replica))| {
                let role = if i == 0 { ReplicaRole::Primary } else { ReplicaRole::Secondary };
                let store: Arc<dyn ReplicaStore> = replica.clone();
                ReplicaEntry::new(id.clone(), role, store)
            })
            .collect();
        let registry = ReplicaRegistry::new(entries)?;
        let metrics = Arc::new(InMemoryMetrics::new(
            config.metrics.event_capacity,
            config.metrics.timing_samples,
        ));
        let engine = Arc::new(Engine::with_registry(config, registry, metrics));

        Ok(Self {
            engine,
            replicas,
            db_path: path,
            _dir: dir,
        })
    }

    pub fn replica(&self, id: &str) -> &FlakyReplica {
        self.replicas
            .iter()
            .find(|(rid, _)| rid.as_str() == id)
            .map(|(_, r)| r.as_ref())
            .unwrap_or_else(|| panic!("no replica named {id}"))
    }

    pub fn set_down(&self, id: &str, down: bool) {
        self.replica(id).set_down(down);
    }

    /// The shared database file, for tests that need to reach under the engine.
    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    pub fn secondary_ids(&self) -> Vec<ReplicaId> {
        self.replicas.iter().skip(1).map(|(id, _)| id.clone()).collect()
    }
}

/// Label input with a clock given as `(node, counter)` pairs.
pub fn new_label(data_id: &str, label: &str, confidence: f64, clock: &[(&str, u64)]) -> NewLabel {
    NewLabel {
        data_id: data_id.to_string(),
        original_text: format!("text of {data_id}"),
        label: label.to_string(),
        confidence: Confidence::new(confidence).unwrap_or(Confidence::MAX),
        vector_clock: clock.iter().map(|(n, c)| (*n, *c)).collect::<VectorClock>(),
    }
}
