//! Brick launch configuration
//!
//! The JSON object the node-local brick launcher consumes. The launcher does
//! no normalization beyond defaulting the optional `device`/`mountdir` to an
//! empty string, so what is built here is exactly what it runs.

use crate::domain::{Brick, Node, Volume};
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// `node` member of a launch config
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LaunchNode {
    pub id: String,
    pub hostname: String,
}

/// `volume` member of a launch config
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LaunchVolume {
    pub name: String,
}

/// Per-brick launch configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BrickLaunchConfig {
    /// Export directory
    pub path: String,
    pub node: LaunchNode,
    pub volume: LaunchVolume,
    /// Process identifier, `hostname:sanitized-path`
    pub name: String,
    pub port: u16,
    /// Block device mounted at `mountdir` before the daemon starts
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub device: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub mountdir: String,
}

/// `/bricks/gv0/brick0` -> `bricks-gv0-brick0`
pub fn sanitize_path(path: &str) -> String {
    path.replace('/', "-").trim_start_matches('-').to_string()
}

/// Name the agent runs a brick's daemon under
pub fn process_name(hostname: &str, path: &str) -> String {
    format!("{}:{}", hostname, sanitize_path(path))
}

impl BrickLaunchConfig {
    /// Build the config for one brick; `bricks.<index>.device` and
    /// `bricks.<index>.mountdir` volume options supply the mount
    pub fn for_brick(
        volume: &Volume,
        node: &Node,
        brick: &Brick,
        options: &BTreeMap<String, String>,
    ) -> Self {
        let option = |field: &str| {
            options
                .get(&format!("bricks.{}.{}", brick.index, field))
                .cloned()
                .unwrap_or_default()
        };

        Self {
            path: brick.path.clone(),
            node: LaunchNode {
                id: node.id.to_string(),
                hostname: node.hostname.clone(),
            },
            volume: LaunchVolume {
                name: volume.name.clone(),
            },
            name: process_name(&node.hostname, &brick.path),
            port: brick.port,
            device: option("device"),
            mountdir: option("mountdir"),
        }
    }

    /// Parse a config the way the launcher does
    pub fn from_json(text: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Reject configs the launcher would refuse
    pub fn validate(&self) -> Result<()> {
        let required = [
            ("path", &self.path),
            ("node.id", &self.node.id),
            ("node.hostname", &self.node.hostname),
            ("volume.name", &self.volume.name),
            ("name", &self.name),
        ];
        for (field, value) in required {
            if value.is_empty() {
                return Err(Error::Validation(format!(
                    "launch config missing required field {}",
                    field
                )));
            }
        }
        if self.port == 0 {
            return Err(Error::Validation("launch config missing required field port".into()));
        }
        if self.device.is_empty() != self.mountdir.is_empty() {
            return Err(Error::Validation(format!(
                "launch config {} sets only one of device/mountdir",
                self.name
            )));
        }
        Ok(())
    }

    pub fn wants_mount(&self) -> bool {
        !self.device.is_empty()
    }
}
