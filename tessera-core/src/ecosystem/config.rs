//! Ecosystem configuration.

use serde::{Deserialize, Serialize};

use super::hydration::Snapshot;
use crate::error::{Error, Result};
use crate::graph::SchedulerMode;

/// Id used when none is configured.
pub const DEFAULT_ECOSYSTEM_ID: &str = "@@default";

/// Settings of one ecosystem.
///
/// Every field is optional when loading from JSON:
///
/// ```json
/// { "id": "app", "scheduler": "async", "max_jobs_per_flush": 10000 }
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EcosystemConfig {
    /// Key in the process-wide ecosystem registry.
    pub id: String,

    /// Whether flushes run synchronously or on a spawned tokio task.
    pub scheduler: SchedulerMode,

    /// Abort a flush after this many jobs. `None` means unbounded.
    pub max_jobs_per_flush: Option<usize>,

    /// Values consumed by nodes as they are created.
    pub hydration: Option<Snapshot>,
}

impl Default for EcosystemConfig {
    fn default() -> Self {
        Self {
            id: DEFAULT_ECOSYSTEM_ID.to_owned(),
            scheduler: SchedulerMode::Sync,
            max_jobs_per_flush: None,
            hydration: None,
        }
    }
}

impl EcosystemConfig {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Self::default()
        }
    }

    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|error| Error::serialization("config", error))
    }

    pub fn with_scheduler(mut self, scheduler: SchedulerMode) -> Self {
        self.scheduler = scheduler;
        self
    }

    pub fn with_max_jobs_per_flush(mut self, limit: usize) -> Self {
        self.max_jobs_per_flush = Some(limit);
        self
    }

    pub fn with_hydration(mut self, snapshot: Snapshot) -> Self {
        self.hydration = Some(snapshot);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_fields_use_defaults() {
        let config = EcosystemConfig::from_json(r#"{ "scheduler": "async" }"#).unwrap();
        assert_eq!(config.id, DEFAULT_ECOSYSTEM_ID);
        assert_eq!(config.scheduler, SchedulerMode::Async);
        assert_eq!(config.max_jobs_per_flush, None);
    }

    #[test]
    fn hydration_loads_from_json() {
        let config = EcosystemConfig::from_json(
            r#"{ "id": "app", "hydration": { "count": 3 }, "max_jobs_per_flush": 50 }"#,
        )
        .unwrap();
        assert_eq!(config.id, "app");
        assert_eq!(config.max_jobs_per_flush, Some(50));
        let hydration = config.hydration.unwrap();
        assert_eq!(hydration.get("count"), Some(&serde_json::json!(3)));
    }

    #[test]
    fn invalid_json_is_a_serialization_error() {
        let error = EcosystemConfig::from_json("{ nope").unwrap_err();
        assert!(matches!(error, Error::Serialization { .. }));
    }
}
