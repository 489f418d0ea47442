//! Control plane configuration
//!
//! Everything the binary needs to wire the registry, planner, orchestrator,
//! node agent and API server. Loaded from an optional YAML file; every
//! section falls back to its defaults.

use crate::agent::AgentConfig;
use crate::controlplane::{ApiServerConfig, OrchestratorConfig};
use crate::error::{Error, Result};
use crate::topology::PlannerConfig;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Top-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ControlPlaneConfig {
    /// Name given to the cluster record at bootstrap
    pub cluster_name: String,
    pub planner: PlannerConfig,
    pub orchestrator: OrchestratorConfig,
    pub agent: AgentConfig,
    pub api: ApiServerConfig,
    /// Nodes without a heartbeat for this long are marked offline (0 disables)
    pub stale_node_secs: u64,
    /// How often agents are asked for brick daemons that exited (0 disables)
    pub brick_sweep_secs: u64,
}

impl Default for ControlPlaneConfig {
    fn default() -> Self {
        Self {
            cluster_name: "default".to_string(),
            planner: PlannerConfig::default(),
            orchestrator: OrchestratorConfig::default(),
            agent: AgentConfig::default(),
            api: ApiServerConfig::default(),
            stale_node_secs: 0,
            brick_sweep_secs: 10,
        }
    }
}

impl ControlPlaneConfig {
    /// Parse a YAML document
    pub fn from_yaml(text: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Read and parse a YAML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            Error::Configuration(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_yaml(&text)
    }

    pub fn validate(&self) -> Result<()> {
        if self.cluster_name.trim().is_empty() {
            return Err(Error::Configuration("cluster_name must not be empty".into()));
        }
        if self.planner.port_base == 0 || self.planner.port_base > self.planner.port_max {
            return Err(Error::Configuration(format!(
                "invalid brick port range {}..={}",
                self.planner.port_base, self.planner.port_max
            )));
        }
        if self.orchestrator.max_step_attempts == 0 {
            return Err(Error::Configuration(
                "max_step_attempts must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn test_empty_document_uses_defaults() {
        let config = ControlPlaneConfig::from_yaml("{}").unwrap();
        assert_eq!(config.cluster_name, "default");
        assert_eq!(config.orchestrator, OrchestratorConfig::default());
        assert_eq!(config.planner.port_base, 49152);
        assert_eq!(config.brick_sweep_secs, 10);
    }

    #[test]
    fn test_partial_sections() {
        let config = ControlPlaneConfig::from_yaml(
            r#"
cluster_name: lab
planner:
  port_base: 50000
orchestrator:
  max_step_attempts: 3
agent:
  work_dir: /tmp/bcp
  supervisor:
    launcher: /usr/local/bin/brick-launcher
api:
  rest_addr: 127.0.0.1:9090
"#,
        )
        .unwrap();

        assert_eq!(config.cluster_name, "lab");
        assert_eq!(config.planner.port_base, 50000);
        assert_eq!(config.planner.port_max, 65535);
        assert_eq!(config.orchestrator.max_step_attempts, 3);
        assert_eq!(config.orchestrator.ack_timeout_ms, 30_000);
        assert_eq!(config.agent.supervisor.launcher, "/usr/local/bin/brick-launcher");
        assert_eq!(config.api.rest_addr.port(), 9090);
    }

    #[test]
    fn test_invalid_port_range() {
        let err = ControlPlaneConfig::from_yaml("planner:\n  port_base: 60000\n  port_max: 50000\n")
            .unwrap_err();
        assert_matches!(err, Error::Configuration(_));
    }
}
