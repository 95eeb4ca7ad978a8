//! lablet.toml configuration parser.

use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::duration::{DurationError, parse_duration_secs};
use crate::types::{Capacity, LicenseType, PortRange, WorkerTemplate};

/// Workers take up to this long to boot; the lookahead must exceed it.
pub const MIN_COLD_START_SECS: u64 = 15 * 60;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{field}: {source}")]
    Duration {
        field: &'static str,
        source: DurationError,
    },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

fn duration_field(field: &'static str, value: &str) -> Result<u64, ConfigError> {
    parse_duration_secs(value).map_err(|source| ConfigError::Duration { field, source })
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub scaling: ScalingConfig,
    #[serde(default)]
    pub licenses: LicenseConfig,
    #[serde(default)]
    pub worker_templates: Vec<WorkerTemplateConfig>,
    /// Statically declared workers (standalone daemon).
    #[serde(default)]
    pub workers: Vec<StaticWorkerConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Periodic queue re-sweep interval.
    pub sweep_interval: String,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            sweep_interval: "30s".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScalingConfig {
    pub lookahead: String,
    pub cold_start_bound: String,
    pub stop_grace: String,
    pub retention: String,
    pub queue_depth_threshold: usize,
    pub provision_attempts: u32,
    pub provision_backoff: String,
}

impl Default for ScalingConfig {
    fn default() -> Self {
        Self {
            lookahead: "30m".to_string(),
            cold_start_bound: "15m".to_string(),
            stop_grace: "5m".to_string(),
            retention: "2h".to_string(),
            queue_depth_threshold: 10,
            provision_attempts: 3,
            provision_backoff: "5s".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LicenseConfig {
    pub personal_node_limit: u32,
}

impl Default for LicenseConfig {
    fn default() -> Self {
        Self {
            personal_node_limit: 20,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerTemplateConfig {
    pub id: String,
    pub license_type: LicenseType,
    pub cpu_cores: u32,
    pub memory_gb: u32,
    pub storage_gb: u32,
    /// Defaults to the license's node ceiling.
    pub max_nodes: Option<u32>,
    #[serde(default)]
    pub nested_virt: bool,
    pub port_start: u16,
    pub port_end: u16,
    pub image: String,
}

impl WorkerTemplateConfig {
    pub fn to_template(&self, personal_node_limit: u32) -> WorkerTemplate {
        let ceiling = self.license_type.default_node_ceiling(personal_node_limit);
        WorkerTemplate {
            id: self.id.clone(),
            license_type: self.license_type,
            capacity: Capacity::new(
                self.cpu_cores,
                self.memory_gb,
                self.storage_gb,
                self.max_nodes.map_or(ceiling, |n| n.min(ceiling)),
            ),
            nested_virt: self.nested_virt,
            port_range: PortRange::new(self.port_start, self.port_end),
            image: self.image.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StaticWorkerConfig {
    pub id: String,
    /// Id of the worker template this node was built from.
    pub template: String,
}

/// Resolved scaling parameters, in seconds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScalingPolicy {
    pub lookahead_secs: u64,
    pub cold_start_secs: u64,
    pub stop_grace_secs: u64,
    pub retention_secs: u64,
    pub queue_depth_threshold: usize,
    pub provision_attempts: u32,
    pub provision_backoff: Duration,
}

impl Default for ScalingPolicy {
    fn default() -> Self {
        Self {
            lookahead_secs: 30 * 60,
            cold_start_secs: MIN_COLD_START_SECS,
            stop_grace_secs: 5 * 60,
            retention_secs: 2 * 3600,
            queue_depth_threshold: 10,
            provision_attempts: 3,
            provision_backoff: Duration::from_secs(5),
        }
    }
}

impl ScalingConfig {
    /// Parse and validate the scaling section.
    pub fn policy(&self) -> Result<ScalingPolicy, ConfigError> {
        let policy = ScalingPolicy {
            lookahead_secs: duration_field("scaling.lookahead", &self.lookahead)?,
            cold_start_secs: duration_field("scaling.cold_start_bound", &self.cold_start_bound)?,
            stop_grace_secs: duration_field("scaling.stop_grace", &self.stop_grace)?,
            retention_secs: duration_field("scaling.retention", &self.retention)?,
            queue_depth_threshold: self.queue_depth_threshold,
            provision_attempts: self.provision_attempts,
            provision_backoff: Duration::from_secs(duration_field(
                "scaling.provision_backoff",
                &self.provision_backoff,
            )?),
        };

        if policy.cold_start_secs < MIN_COLD_START_SECS {
            return Err(ConfigError::Invalid(format!(
                "scaling.cold_start_bound must be at least {MIN_COLD_START_SECS}s"
            )));
        }
        if policy.lookahead_secs <= policy.cold_start_secs {
            return Err(ConfigError::Invalid(
                "scaling.lookahead must exceed scaling.cold_start_bound".to_string(),
            ));
        }
        if policy.retention_secs < policy.stop_grace_secs {
            return Err(ConfigError::Invalid(
                "scaling.retention must be at least scaling.stop_grace".to_string(),
            ));
        }
        if policy.provision_attempts == 0 {
            return Err(ConfigError::Invalid(
                "scaling.provision_attempts must be at least 1".to_string(),
            ));
        }
        Ok(policy)
    }
}

impl EngineConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> anyhow::Result<Self> {
        let config: EngineConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    pub fn sweep_interval(&self) -> Result<Duration, ConfigError> {
        let secs = duration_field("scheduler.sweep_interval", &self.scheduler.sweep_interval)?;
        if secs == 0 {
            return Err(ConfigError::Invalid(
                "scheduler.sweep_interval must be positive".to_string(),
            ));
        }
        Ok(Duration::from_secs(secs))
    }

    /// Worker templates with license defaults applied.
    pub fn templates(&self) -> Vec<WorkerTemplate> {
        self.worker_templates
            .iter()
            .map(|t| t.to_template(self.licenses.personal_node_limit))
            .collect()
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.sweep_interval()?;
        self.scaling.policy()?;

        let mut ids = HashSet::new();
        for t in &self.worker_templates {
            if !ids.insert(t.id.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate worker template id: {}",
                    t.id
                )));
            }
            if t.port_end < t.port_start {
                return Err(ConfigError::Invalid(format!(
                    "worker template {}: port_end < port_start",
                    t.id
                )));
            }
        }

        let mut worker_ids = HashSet::new();
        for w in &self.workers {
            if !ids.contains(w.template.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "worker {} references unknown template {}",
                    w.id, w.template
                )));
            }
            if !worker_ids.insert(w.id.as_str()) {
                return Err(ConfigError::Invalid(format!("duplicate worker id: {}", w.id)));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
[scheduler]
sweep_interval = "10s"

[scaling]
lookahead = "20m"
retention = "1h"

[licenses]
personal_node_limit = 20

[[worker_templates]]
id = "personal-small"
license_type = "PERSONAL"
cpu_cores = 16
memory_gb = 64
storage_gb = 500
port_start = 2000
port_end = 2999
image = "ami-cml-2.7"

[[worker_templates]]
id = "enterprise-large"
license_type = "ENTERPRISE"
cpu_cores = 96
memory_gb = 384
storage_gb = 2000
nested_virt = true
port_start = 3000
port_end = 4999
image = "ami-cml-2.7"

[[workers]]
id = "w-static-1"
template = "personal-small"
"#;

    #[test]
    fn test_parse_sample() {
        let config = EngineConfig::from_toml_str(SAMPLE).unwrap();
        assert_eq!(config.worker_templates.len(), 2);
        assert_eq!(config.sweep_interval().unwrap(), Duration::from_secs(10));

        let policy = config.scaling.policy().unwrap();
        assert_eq!(policy.lookahead_secs, 1200);
        assert_eq!(policy.cold_start_secs, 900);
        assert_eq!(policy.retention_secs, 3600);
        assert_eq!(policy.queue_depth_threshold, 10);
    }

    #[test]
    fn test_parse_minimal() {
        let config = EngineConfig::from_toml_str("").unwrap();
        assert!(config.worker_templates.is_empty());
        assert_eq!(config.scaling.policy().unwrap(), ScalingPolicy::default());
    }

    #[test]
    fn templates_apply_license_node_ceiling() {
        let config = EngineConfig::from_toml_str(SAMPLE).unwrap();
        let templates = config.templates();
        assert_eq!(templates[0].capacity.nodes, 20);
        assert_eq!(templates[1].capacity.nodes, u32::MAX);
        assert!(templates[1].nested_virt);
        assert_eq!(templates[0].port_range.len(), 1000);
    }

    #[test]
    fn lookahead_must_exceed_cold_start() {
        let toml_str = r#"
[scaling]
lookahead = "10m"
"#;
        let err = EngineConfig::from_toml_str(toml_str).unwrap_err();
        assert!(err.to_string().contains("lookahead"));
    }

    #[test]
    fn cold_start_bound_has_floor() {
        let toml_str = r#"
[scaling]
cold_start_bound = "5m"
"#;
        assert!(EngineConfig::from_toml_str(toml_str).is_err());
    }

    #[test]
    fn invalid_duration_is_an_error() {
        let toml_str = r#"
[scheduler]
sweep_interval = "soon"
"#;
        let err = EngineConfig::from_toml_str(toml_str).unwrap_err();
        assert!(err.to_string().contains("scheduler.sweep_interval"));
    }

    #[test]
    fn static_worker_must_reference_template() {
        let toml_str = r#"
[[workers]]
id = "w1"
template = "missing"
"#;
        assert!(EngineConfig::from_toml_str(toml_str).is_err());
    }

    #[test]
    fn round_trips_through_toml() {
        let config = EngineConfig::from_toml_str(SAMPLE).unwrap();
        let rendered = config.to_toml_string().unwrap();
        assert!(rendered.contains("personal-small"));
        let reparsed = EngineConfig::from_toml_str(&rendered).unwrap();
        assert_eq!(reparsed.workers.len(), 1);
    }
}
