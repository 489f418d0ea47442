//! Placement Policy
//!
//! Tunables for brick placement: the port range bricks listen on and the
//! directory bricks are exported under.

use crate::domain::{VolumeSpec, VolumeType};
use serde::{Deserialize, Serialize};

/// First port handed to bricks
pub const DEFAULT_PORT_BASE: u16 = 49152;

/// Last port handed to bricks
pub const DEFAULT_PORT_MAX: u16 = 65535;

/// Planner configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlannerConfig {
    /// Lowest port a brick may listen on
    pub port_base: u16,
    /// Highest port a brick may listen on
    pub port_max: u16,
    /// Directory bricks are exported under on every node
    pub brick_root: String,
}

impl Default for PlannerConfig {
    fn default() -> Self {
        Self {
            port_base: DEFAULT_PORT_BASE,
            port_max: DEFAULT_PORT_MAX,
            brick_root: "/bricks".to_string(),
        }
    }
}

impl PlannerConfig {
    /// Export path of a volume's brick
    pub fn brick_path(&self, volume: &str, index: u32) -> String {
        format!(
            "{}/{}/brick{}",
            self.brick_root.trim_end_matches('/'),
            volume,
            index
        )
    }
}

/// Bytes each brick must provide for the layout to hold `capacity_bytes`
pub fn brick_size(spec: &VolumeSpec) -> u64 {
    let d = u64::from(spec.distribute_count.max(1));
    let per_subvolume = spec.capacity_bytes.div_ceil(d);
    match spec.volume_type {
        VolumeType::Disperse => {
            let data_bricks = u64::from(spec.replica_count.saturating_sub(spec.redundancy_count).max(1));
            per_subvolume.div_ceil(data_bricks)
        }
        _ => per_subvolume,
    }
}
