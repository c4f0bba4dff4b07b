use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use labelsync_core::ReplicaId;

use crate::EngineError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplicaRole {
    Primary,
    Secondary,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReplicaConfig {
    pub id: ReplicaId,
    pub path: PathBuf,
    pub role: ReplicaRole,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    pub interval_secs: u64,
    /// A cached health view older than this is refreshed before routing a read.
    pub staleness_ms: u64,
    /// Bound on every probe and on the SQLite busy wait.
    pub probe_timeout_ms: u64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            interval_secs: 30,
            staleness_ms: 10_000,
            probe_timeout_ms: 5_000,
        }
    }
}

impl HealthConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn staleness(&self) -> Duration {
        Duration::from_millis(self.staleness_ms)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    pub interval_secs: u64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self { interval_secs: 300 }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub idle_timeout_secs: u64,
    pub retention_days: u32,
    pub cleanup_interval_secs: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            idle_timeout_secs: 3600,
            retention_days: 30,
            cleanup_interval_secs: 3600,
        }
    }
}

/// Which records form a conflict group: those of one session sharing a
/// `data_id`, or every record with that `data_id`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionScope {
    #[default]
    Session,
    Global,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ResolutionConfig {
    pub scope: ResolutionScope,
    /// Copy losing records into the archive table instead of only deleting them.
    pub archive_resolved: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    pub event_capacity: usize,
    pub timing_samples: usize,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            event_capacity: 1000,
            timing_samples: 1000,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub replicas: Vec<ReplicaConfig>,
    pub health: HealthConfig,
    pub monitor: MonitorConfig,
    pub sessions: SessionConfig,
    pub resolution: ResolutionConfig,
    pub metrics: MetricsConfig,
}

fn default_true() -> bool {
    true
}

impl EngineConfig {
    pub fn from_toml_str(s: &str) -> Result<Self, EngineError> {
        let config: EngineConfig =
            toml::from_str(s).map_err(|e| EngineError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self, EngineError> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| EngineError::Config(format!("{}: {e}", path.display())))?;
        Self::from_toml_str(&text)
    }

    /// Exactly one primary, unique replica ids.
    pub fn validate(&self) -> Result<(), EngineError> {
        let primaries = self
            .replicas
            .iter()
            .filter(|r| r.role == ReplicaRole::Primary)
            .count();
        if primaries != 1 {
            return Err(EngineError::Config(format!(
                "expected exactly one primary replica, found {primaries}"
            )));
        }

        let mut seen = HashSet::new();
        for replica in &self.replicas {
            if !seen.insert(replica.id.as_str()) {
                return Err(EngineError::Config(format!("duplicate replica id: {}", replica.id)));
            }
        }
        Ok(())
    }

    pub fn primary(&self) -> Option<&ReplicaConfig> {
        self.replicas.iter().find(|r| r.role == ReplicaRole::Primary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_fill_missing_sections() {
        let config = EngineConfig::from_toml_str(
            r#"
            [[replicas]]
            id = "primary"
            path = "/tmp/labels.db"
            role = "primary"
            "#,
        )
        .unwrap();

        assert_eq!(config.health.interval_secs, 30);
        assert_eq!(config.health.probe_timeout(), Duration::from_secs(5));
        assert_eq!(config.monitor.interval_secs, 300);
        assert_eq!(config.sessions.retention_days, 30);
        assert_eq!(config.resolution.scope, ResolutionScope::Session);
        assert!(!config.resolution.archive_resolved);
        assert_eq!(config.metrics.event_capacity, 1000);
        assert!(config.replicas[0].enabled);
    }

    #[test]
    fn overrides_are_applied() {
        let config = EngineConfig::from_toml_str(
            r#"
            [[replicas]]
            id = "primary"
            path = "a.db"
            role = "primary"

            [[replicas]]
            id = "replica-1"
            path = "a.db"
            role = "secondary"
            enabled = false

            [health]
            staleness_ms = 250

            [resolution]
            scope = "global"
            archive_resolved = true
            "#,
        )
        .unwrap();

        assert_eq!(config.health.staleness(), Duration::from_millis(250));
        assert_eq!(config.health.interval_secs, 30);
        assert_eq!(config.resolution.scope, ResolutionScope::Global);
        assert!(config.resolution.archive_resolved);
        assert!(!config.replicas[1].enabled);
        assert_eq!(config.primary().unwrap().id, ReplicaId::from("primary"));
    }

    #[test]
    fn rejects_missing_or_double_primary() {
        let none = EngineConfig::from_toml_str(
            r#"
            [[replicas]]
            id = "r1"
            path = "a.db"
            role = "secondary"
            "#,
        );
        assert!(matches!(none, Err(EngineError::Config(_))));

        let two = EngineConfig::from_toml_str(
            r#"
            [[replicas]]
            id = "p1"
            path = "a.db"
            role = "primary"

            [[replicas]]
            id = "p2"
            path = "b.db"
            role = "primary"
            "#,
        );
        assert!(matches!(two, Err(EngineError::Config(_))));
    }

    #[test]
    fn rejects_duplicate_ids() {
        let dup = EngineConfig::from_toml_str(
            r#"
            [[replicas]]
            id = "primary"
            path = "a.db"
            role = "primary"

            [[replicas]]
            id = "primary"
            path = "a.db"
            role = "secondary"
            "#,
        );
        assert!(matches!(dup, Err(EngineError::Config(msg)) if msg.contains("duplicate")));
    }
}
