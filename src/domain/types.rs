//! Domain Types - Cluster, Node, Volume and Brick records
//!
//! Plain data owned by the registry. Every record is cloned out of the
//! registry, never mutated in place by callers.

use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// =============================================================================
// Identifiers
// =============================================================================

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }
    };
}

string_id!(
    /// Unique identifier for the cluster
    ClusterId
);
string_id!(
    /// Unique identifier for a node
    NodeId
);
string_id!(
    /// Unique identifier for a volume
    VolumeId
);
string_id!(
    /// Unique identifier for a brick
    BrickId
);
string_id!(
    /// Unique identifier for a task
    TaskId
);

// =============================================================================
// Cluster
// =============================================================================

/// The cluster all nodes and volumes belong to
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Cluster {
    pub id: ClusterId,
    pub name: String,
    pub created_at: DateTime<Utc>,
}

// =============================================================================
// Node
// =============================================================================

/// Membership status of a node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeStatus {
    Online,
    Offline,
}

impl std::fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NodeStatus::Online => write!(f, "online"),
            NodeStatus::Offline => write!(f, "offline"),
        }
    }
}

/// A storage node that can host bricks
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    pub id: NodeId,
    pub hostname: String,
    pub status: NodeStatus,
    /// Capacity hint used by the planner
    pub capacity_bytes: u64,
    /// Fault domain (rack, zone) if known
    pub fault_domain: Option<String>,
    pub registered_at: DateTime<Utc>,
    pub last_heartbeat: DateTime<Utc>,
}

impl Node {
    pub fn is_online(&self) -> bool {
        self.status == NodeStatus::Online
    }
}

// =============================================================================
// Volume
// =============================================================================

/// Redundancy/distribution layout of a volume
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum VolumeType {
    Distribute,
    Replicate,
    DistributeReplicate,
    Disperse,
}

impl VolumeType {
    /// Type a volume takes on once it has `distribute_count` subvolumes
    pub fn with_distribute_count(self, distribute_count: u32) -> Self {
        match self {
            VolumeType::Replicate if distribute_count > 1 => VolumeType::DistributeReplicate,
            VolumeType::DistributeReplicate if distribute_count <= 1 => VolumeType::Replicate,
            other => other,
        }
    }
}

impl std::fmt::Display for VolumeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VolumeType::Distribute => write!(f, "distribute"),
            VolumeType::Replicate => write!(f, "replicate"),
            VolumeType::DistributeReplicate => write!(f, "distribute-replicate"),
            VolumeType::Disperse => write!(f, "disperse"),
        }
    }
}

impl std::str::FromStr for VolumeType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "distribute" => Ok(VolumeType::Distribute),
            "replicate" => Ok(VolumeType::Replicate),
            "distribute-replicate" | "distributed-replicate" => Ok(VolumeType::DistributeReplicate),
            "disperse" => Ok(VolumeType::Disperse),
            other => Err(Error::Validation(format!("unknown volume type: {}", other))),
        }
    }
}

/// Lifecycle state of a volume
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VolumeState {
    Creating,
    Created,
    Started,
    Stopping,
    Stopped,
    Deleting,
}

impl VolumeState {
    /// Whether `self -> to` is a legal lifecycle transition
    pub fn can_transition_to(self, to: VolumeState) -> bool {
        use VolumeState::*;
        matches!(
            (self, to),
            (Creating, Created)
                | (Creating, Deleting)
                | (Created, Started)
                | (Created, Deleting)
                | (Started, Stopping)
                | (Stopping, Stopped)
                | (Stopped, Started)
                | (Stopped, Deleting)
        )
    }
}

impl std::fmt::Display for VolumeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            VolumeState::Creating => "creating",
            VolumeState::Created => "created",
            VolumeState::Started => "started",
            VolumeState::Stopping => "stopping",
            VolumeState::Stopped => "stopped",
            VolumeState::Deleting => "deleting",
        };
        write!(f, "{}", s)
    }
}

/// Typed request describing a volume to create
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeSpec {
    pub name: String,
    pub volume_type: VolumeType,
    /// Replica count, or disperse count for disperse volumes
    #[serde(default = "default_one")]
    pub replica_count: u32,
    #[serde(default = "default_one")]
    pub distribute_count: u32,
    /// Bricks per disperse set that may be lost
    #[serde(default)]
    pub redundancy_count: u32,
    pub capacity_bytes: u64,
}

fn default_one() -> u32 {
    1
}

impl VolumeSpec {
    /// Reject malformed or self-contradictory layouts
    pub fn validate(&self) -> Result<()> {
        validate_name(&self.name)?;

        if self.capacity_bytes == 0 {
            return Err(Error::Validation("capacity must be greater than zero".into()));
        }
        if self.distribute_count == 0 {
            return Err(Error::Validation("distribute count must be at least 1".into()));
        }

        let (r, d) = (self.replica_count, self.distribute_count);
        match self.volume_type {
            VolumeType::Distribute if r != 1 => Err(Error::Validation(format!(
                "distribute volume takes replica count 1, got {}",
                r
            ))),
            VolumeType::Replicate if r < 2 || d != 1 => Err(Error::Validation(format!(
                "replicate volume needs replica count >= 2 and distribute count 1, got {}x{}",
                r, d
            ))),
            VolumeType::DistributeReplicate if r < 2 || d < 2 => Err(Error::Validation(format!(
                "distribute-replicate volume needs replica count >= 2 and distribute count >= 2, got {}x{}",
                r, d
            ))),
            VolumeType::Disperse => {
                let redundancy = self.redundancy_count;
                if r < 3 {
                    return Err(Error::Validation(format!(
                        "disperse count must be at least 3, got {}",
                        r
                    )));
                }
                if redundancy == 0 || 2 * redundancy >= r {
                    return Err(Error::Validation(format!(
                        "redundancy {} invalid for disperse count {}",
                        redundancy, r
                    )));
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }

    /// Number of bricks per replica (or disperse) set
    pub fn group_size(&self) -> u32 {
        match self.volume_type {
            VolumeType::Distribute => 1,
            _ => self.replica_count,
        }
    }
}

/// Names end up in file paths and translator names
pub fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(Error::Validation("name must not be empty".into()));
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        return Err(Error::Validation(format!(
            "name {:?} may only contain ASCII alphanumerics, '-' and '_'",
            name
        )));
    }
    Ok(())
}

/// A logical storage volume composed of bricks
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Volume {
    pub id: VolumeId,
    pub name: String,
    pub volume_type: VolumeType,
    pub replica_count: u32,
    pub distribute_count: u32,
    pub redundancy_count: u32,
    pub capacity_bytes: u64,
    pub state: VolumeState,
    pub created_at: DateTime<Utc>,
}

impl Volume {
    /// Number of bricks per replica (or disperse) set
    pub fn group_size(&self) -> u32 {
        match self.volume_type {
            VolumeType::Distribute => 1,
            _ => self.replica_count,
        }
    }

    /// Number of bricks the layout calls for
    pub fn brick_count(&self) -> u32 {
        self.group_size() * self.distribute_count
    }

    /// Layout description handed to the planner
    pub fn spec(&self) -> VolumeSpec {
        VolumeSpec {
            name: self.name.clone(),
            volume_type: self.volume_type,
            replica_count: self.replica_count,
            distribute_count: self.distribute_count,
            redundancy_count: self.redundancy_count,
            capacity_bytes: self.capacity_bytes,
        }
    }
}

// =============================================================================
// Brick
// =============================================================================

/// Runtime status of a brick
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BrickStatus {
    Pending,
    Online,
    Offline,
}

/// An export directory on a node serving one unit of a volume
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Brick {
    pub id: BrickId,
    pub volume_id: VolumeId,
    pub node_id: NodeId,
    /// Position in the volume's brick order
    pub index: u32,
    pub path: String,
    pub port: u16,
    pub size_bytes: u64,
    pub status: BrickStatus,
}

impl Brick {
    /// Replica (or disperse) set this brick belongs to
    pub fn replica_set(&self, group_size: u32) -> u32 {
        self.index / group_size.max(1)
    }
}
