//! Registry Events
//!
//! Events emitted by the registry for external consumers to react to
//! membership and topology changes.

use crate::domain::{BrickId, BrickStatus, NodeId, NodeStatus, VolumeId, VolumeState};
use serde::{Deserialize, Serialize};

/// Events emitted by the registry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum RegistryEvent {
    /// A node joined the cluster
    NodeAdded { node_id: NodeId, hostname: String },

    /// A node left the cluster
    NodeRemoved { node_id: NodeId },

    /// A node went online or offline
    NodeStatusChanged { node_id: NodeId, status: NodeStatus },

    /// A volume record was created
    VolumeCreated { volume_id: VolumeId, name: String },

    /// A volume moved through its lifecycle
    VolumeStateChanged {
        volume_id: VolumeId,
        from: VolumeState,
        to: VolumeState,
    },

    /// A volume record was deleted
    VolumeDeleted { volume_id: VolumeId },

    /// Bricks were attached to a volume
    BricksAdded { volume_id: VolumeId, count: usize },

    /// A brick was moved to another node
    BrickReplaced {
        volume_id: VolumeId,
        old_brick: BrickId,
        new_brick: BrickId,
    },

    /// A brick's runtime status changed
    BrickStatusChanged {
        volume_id: VolumeId,
        brick_id: BrickId,
        status: BrickStatus,
    },

    /// All bricks of a volume were released
    BricksReleased { volume_id: VolumeId, count: usize },
}

impl RegistryEvent {
    /// Get the node ID if this is a node event
    pub fn node_id(&self) -> Option<&NodeId> {
        match self {
            RegistryEvent::NodeAdded { node_id, .. } => Some(node_id),
            RegistryEvent::NodeRemoved { node_id } => Some(node_id),
            RegistryEvent::NodeStatusChanged { node_id, .. } => Some(node_id),
            _ => None,
        }
    }

    /// Get the volume ID if this is a volume or brick event
    pub fn volume_id(&self) -> Option<&VolumeId> {
        match self {
            RegistryEvent::VolumeCreated { volume_id, .. } => Some(volume_id),
            RegistryEvent::VolumeStateChanged { volume_id, .. } => Some(volume_id),
            RegistryEvent::VolumeDeleted { volume_id } => Some(volume_id),
            RegistryEvent::BricksAdded { volume_id, .. } => Some(volume_id),
            RegistryEvent::BrickReplaced { volume_id, .. } => Some(volume_id),
            RegistryEvent::BrickStatusChanged { volume_id, .. } => Some(volume_id),
            RegistryEvent::BricksReleased { volume_id, .. } => Some(volume_id),
            _ => None,
        }
    }

    /// Check if this is a node-level event
    pub fn is_node_event(&self) -> bool {
        self.node_id().is_some()
    }

    /// Check if this event changes brick topology
    pub fn is_topology_event(&self) -> bool {
        matches!(
            self,
            RegistryEvent::BricksAdded { .. }
                | RegistryEvent::BrickReplaced { .. }
                | RegistryEvent::BricksReleased { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_ids() {
        let event = RegistryEvent::NodeAdded {
            node_id: NodeId::new("node-001"),
            hostname: "host.local".to_string(),
        };
        assert_eq!(event.node_id().map(|n| n.as_str()), Some("node-001"));
        assert!(event.volume_id().is_none());
        assert!(event.is_node_event());

        let event = RegistryEvent::BricksAdded {
            volume_id: VolumeId::new("volume-001"),
            count: 3,
        };
        assert!(!event.is_node_event());
        assert!(event.is_topology_event());
        assert_eq!(event.volume_id().map(|v| v.as_str()), Some("volume-001"));
    }
}
