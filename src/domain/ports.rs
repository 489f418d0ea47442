//! Domain Ports - Core trait definitions for the control plane
//!
//! These traits define the boundaries between the orchestration core and the
//! collaborators it does not own: the per-machine node agents that receive
//! rendered configuration and launch bricks, and the per-volume option store.

use super::types::{Node, VolumeId};
use crate::error::Result;
use crate::volfile::BrickLaunchConfig;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

// =============================================================================
// Node Agent Port
// =============================================================================

/// Configuration delivered to one node for one volume
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeVolfiles {
    /// Server volfile covering every brick of the volume on this node
    pub server: String,
    /// Client volfile for the whole volume
    pub client: String,
}

/// How a brick launch was acknowledged
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LaunchOutcome {
    /// The launcher's child reported ready
    Ready,
    /// The brick was already mounted/running; a repeated launch is a no-op
    AlreadyRunning,
}

/// Channel to the per-machine agents that run storage daemons.
///
/// Every call blocks until the agent acknowledges. The orchestrator bounds
/// the wait; implementations report a launcher failure as
/// [`crate::Error::Launcher`].
#[async_trait]
pub trait NodeAgent: Send + Sync {
    /// Agent implementation name
    fn name(&self) -> &str;

    /// Confirm a node is reachable and ready to join
    async fn probe(&self, node: &Node) -> Result<()>;

    /// Install the volume's rendered volfiles on a node (wholesale replace)
    async fn publish_volfiles(&self, node: &Node, volume: &str, volfiles: &NodeVolfiles)
        -> Result<()>;

    /// Start the storage daemon for one brick
    async fn launch_brick(&self, node: &Node, config: &BrickLaunchConfig) -> Result<LaunchOutcome>;

    /// Stop the storage daemon for one brick
    async fn stop_brick(&self, node: &Node, config: &BrickLaunchConfig) -> Result<()>;

    /// Remove every artifact of a volume from a node
    async fn retire_volume(&self, node: &Node, volume: &str) -> Result<()>;

    /// Kick off data migration across a volume's subvolumes
    async fn rebalance(&self, node: &Node, volume: &str) -> Result<()>;

    /// Process names of bricks on `node` whose daemon exited since the last
    /// call. Agents that cannot watch their daemons report none.
    async fn exited_bricks(&self, _node: &Node) -> Result<Vec<String>> {
        Ok(Vec::new())
    }

    /// Check if the agent channel is healthy
    async fn health_check(&self) -> Result<bool> {
        Ok(true)
    }
}

// =============================================================================
// Option Source Port
// =============================================================================

/// Read-only view of the per-volume option store
pub trait OptionSource: Send + Sync {
    /// All options set on a volume, ordered by key
    fn options(&self, volume: &VolumeId) -> BTreeMap<String, String>;
}
