//! Topology Planner
//!
//! Pure placement of bricks onto nodes. Bricks are grouped into replica (or
//! disperse) sets; every member of a set lands on a distinct node, sets are
//! spread evenly over the pool, and ties break on the lowest node id so the
//! same snapshot always yields the same plan.

use super::policy::{brick_size, PlannerConfig};
use crate::domain::{Brick, Node, NodeId, Volume, VolumeSpec};
use crate::error::{PlanningError, Result};
use crate::registry::{NewBrick, TopologySnapshot};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

// =============================================================================
// Plan Types
// =============================================================================

/// One brick of a placement plan
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlannedBrick {
    pub index: u32,
    pub replica_set: u32,
    pub node_id: NodeId,
    pub hostname: String,
    pub path: String,
    pub port: u16,
    pub size_bytes: u64,
}

impl PlannedBrick {
    /// Registry request for this brick
    pub fn to_new_brick(&self) -> NewBrick {
        NewBrick {
            node_id: self.node_id.clone(),
            index: self.index,
            path: self.path.clone(),
            port: self.port,
            size_bytes: self.size_bytes,
        }
    }
}

/// Ordered placement for a volume (or the groups added to it)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlacementPlan {
    pub volume: String,
    pub group_size: u32,
    /// Distribute count of the volume once the plan is applied
    pub distribute_count: u32,
    pub bricks: Vec<PlannedBrick>,
}

impl PlacementPlan {
    /// Distinct nodes the plan touches
    pub fn nodes_used(&self) -> BTreeSet<NodeId> {
        self.bricks.iter().map(|b| b.node_id.clone()).collect()
    }

    /// Planned bricks grouped by replica set
    pub fn replica_sets(&self) -> BTreeMap<u32, Vec<&PlannedBrick>> {
        let mut sets: BTreeMap<u32, Vec<&PlannedBrick>> = BTreeMap::new();
        for brick in &self.bricks {
            sets.entry(brick.replica_set).or_default().push(brick);
        }
        sets
    }

    pub fn to_new_bricks(&self) -> Vec<NewBrick> {
        self.bricks.iter().map(PlannedBrick::to_new_brick).collect()
    }
}

// =============================================================================
// Node Load
// =============================================================================

/// Planner's running view of one online node
#[derive(Debug, Clone)]
struct NodeLoad {
    node_id: NodeId,
    hostname: String,
    /// Fault domain, or the node id when none is known
    domain: String,
    free_bytes: u64,
    ports: BTreeSet<u16>,
    total_bricks: usize,
    volume_bricks: usize,
}

impl NodeLoad {
    fn lowest_free_port(&self, base: u16, max: u16) -> Option<u16> {
        (base..=max).find(|p| !self.ports.contains(p))
    }

    fn rank(&self) -> (usize, usize, &NodeId) {
        (self.volume_bricks, self.total_bricks, &self.node_id)
    }
}

fn failure_domain(node: &Node) -> String {
    node.fault_domain
        .clone()
        .unwrap_or_else(|| node.id.to_string())
}

/// Loads of online nodes ordered by id
fn node_loads(snapshot: &TopologySnapshot, volume: Option<&Volume>) -> Vec<NodeLoad> {
    let mut nodes: Vec<NodeLoad> = snapshot
        .nodes
        .iter()
        .filter(|n| n.is_online())
        .map(|n| {
            let bricks: Vec<&Brick> = snapshot.bricks_on(&n.id).collect();
            NodeLoad {
                node_id: n.id.clone(),
                hostname: n.hostname.clone(),
                domain: failure_domain(n),
                free_bytes: n.capacity_bytes.saturating_sub(snapshot.used_bytes(&n.id)),
                ports: snapshot.used_ports(&n.id),
                total_bricks: bricks.len(),
                volume_bricks: volume
                    .map(|v| bricks.iter().filter(|b| b.volume_id == v.id).count())
                    .unwrap_or(0),
            }
        })
        .collect();
    nodes.sort_by(|a, b| a.node_id.cmp(&b.node_id));
    nodes
}

// =============================================================================
// Topology Planner
// =============================================================================

/// Computes brick placements; never touches the registry
#[derive(Debug, Clone, Default)]
pub struct TopologyPlanner {
    config: PlannerConfig,
}

impl TopologyPlanner {
    pub fn new(config: PlannerConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &PlannerConfig {
        &self.config
    }

    /// Place every brick of a new volume
    pub fn plan(&self, spec: &VolumeSpec, snapshot: &TopologySnapshot) -> Result<PlacementPlan> {
        spec.validate()?;

        let mut loads = node_loads(snapshot, None);
        let group_size = spec.group_size();
        let size = brick_size(spec);

        let mut bricks = Vec::with_capacity((group_size * spec.distribute_count) as usize);
        for set in 0..spec.distribute_count {
            bricks.extend(self.assign_group(
                &mut loads,
                &spec.name,
                set,
                set * group_size,
                group_size,
                size,
                &BTreeSet::new(),
                &BTreeSet::new(),
            )?);
        }

        debug!(
            volume = %spec.name,
            bricks = bricks.len(),
            brick_size = size,
            "Planned volume topology"
        );

        Ok(PlacementPlan {
            volume: spec.name.clone(),
            group_size,
            distribute_count: spec.distribute_count,
            bricks,
        })
    }

    /// Place `extra_sets` additional replica sets for an existing volume
    pub fn plan_expansion(
        &self,
        volume: &Volume,
        snapshot: &TopologySnapshot,
        extra_sets: u32,
    ) -> Result<PlacementPlan> {
        if extra_sets == 0 {
            return Err(crate::Error::Validation(
                "expansion must add at least one subvolume".into(),
            ));
        }

        let existing = snapshot.volume_bricks(&volume.id);
        let group_size = volume.group_size();
        let size = existing
            .first()
            .map(|b| b.size_bytes)
            .unwrap_or_else(|| brick_size(&volume.spec()));
        let first_set = volume.distribute_count;

        let mut loads = node_loads(snapshot, Some(volume));
        let mut bricks = Vec::with_capacity((group_size * extra_sets) as usize);
        for set in first_set..first_set + extra_sets {
            bricks.extend(self.assign_group(
                &mut loads,
                &volume.name,
                set,
                set * group_size,
                group_size,
                size,
                &BTreeSet::new(),
                &BTreeSet::new(),
            )?);
        }

        Ok(PlacementPlan {
            volume: volume.name.clone(),
            group_size,
            distribute_count: first_set + extra_sets,
            bricks,
        })
    }

    /// Find a new home for one brick, away from the rest of its replica set
    pub fn plan_replacement(
        &self,
        volume: &Volume,
        brick: &Brick,
        snapshot: &TopologySnapshot,
        exclude: &NodeId,
    ) -> Result<PlannedBrick> {
        let group_size = volume.group_size();
        let set = brick.replica_set(group_size);

        let mut excluded: BTreeSet<NodeId> = snapshot
            .volume_bricks(&volume.id)
            .into_iter()
            .filter(|b| b.id != brick.id && b.replica_set(group_size) == set)
            .map(|b| b.node_id.clone())
            .collect();
        let taken_domains: BTreeSet<String> = excluded
            .iter()
            .filter_map(|id| snapshot.node(id))
            .map(failure_domain)
            .collect();
        excluded.insert(exclude.clone());
        excluded.insert(brick.node_id.clone());

        let mut loads = node_loads(snapshot, Some(volume));
        let mut placed = self.assign_group(
            &mut loads,
            &volume.name,
            set,
            brick.index,
            1,
            brick.size_bytes,
            &excluded,
            &taken_domains,
        )?;
        placed
            .pop()
            .ok_or_else(|| crate::Error::Internal("replacement produced no brick".into()))
    }

    /// Assign one replica set to `group_size` distinct nodes, spreading it
    /// over as many fault domains as the candidates allow
    #[allow(clippy::too_many_arguments)]
    fn assign_group(
        &self,
        loads: &mut [NodeLoad],
        volume: &str,
        set: u32,
        first_index: u32,
        group_size: u32,
        size: u64,
        excluded: &BTreeSet<NodeId>,
        taken_domains: &BTreeSet<String>,
    ) -> Result<Vec<PlannedBrick>> {
        let eligible = loads
            .iter()
            .filter(|n| !excluded.contains(&n.node_id))
            .count();
        let required = group_size as usize;
        if eligible < required {
            return Err(PlanningError::InsufficientNodes {
                required,
                available: eligible,
            }
            .into());
        }

        let mut chosen: BTreeSet<NodeId> = BTreeSet::new();
        let mut domains = taken_domains.clone();
        let mut out = Vec::with_capacity(required);

        for slot in 0..group_size {
            let mut port_exhausted: Option<NodeId> = None;
            let mut pick: Option<(usize, u16)> = None;

            let mut order: Vec<usize> = (0..loads.len())
                .filter(|&i| {
                    let n = &loads[i];
                    !excluded.contains(&n.node_id)
                        && !chosen.contains(&n.node_id)
                        && n.free_bytes >= size
                })
                .collect();
            order.sort_by(|&a, &b| {
                let key = |i: usize| (domains.contains(&loads[i].domain), loads[i].rank());
                key(a).cmp(&key(b))
            });

            for i in order {
                match loads[i].lowest_free_port(self.config.port_base, self.config.port_max) {
                    Some(port) => {
                        pick = Some((i, port));
                        break;
                    }
                    None => {
                        port_exhausted.get_or_insert_with(|| loads[i].node_id.clone());
                    }
                }
            }

            let (i, port) = match (pick, port_exhausted) {
                (Some(p), _) => p,
                (None, Some(node_id)) => {
                    return Err(PlanningError::PortExhausted {
                        node_id: node_id.to_string(),
                        base: self.config.port_base,
                        max: self.config.port_max,
                    }
                    .into())
                }
                (None, None) => {
                    let available = loads
                        .iter()
                        .filter(|n| !excluded.contains(&n.node_id) && n.free_bytes >= size)
                        .count();
                    return Err(PlanningError::InsufficientCapacity {
                        required,
                        available,
                        brick_size_bytes: size,
                    }
                    .into());
                }
            };

            let node = &mut loads[i];
            node.free_bytes -= size;
            node.ports.insert(port);
            node.total_bricks += 1;
            node.volume_bricks += 1;
            chosen.insert(node.node_id.clone());
            domains.insert(node.domain.clone());

            let index = first_index + slot;
            out.push(PlannedBrick {
                index,
                replica_set: set,
                node_id: node.node_id.clone(),
                hostname: node.hostname.clone(),
                path: self.config.brick_path(volume, index),
                port,
                size_bytes: size,
            });
        }

        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{BrickStatus, Node, NodeStatus, VolumeId, VolumeState, VolumeType};
    use crate::error::Error;
    use assert_matches::assert_matches;
    use chrono::Utc;

    const GIB: u64 = 1 << 30;

    fn node(id: &str, capacity: u64) -> Node {
        Node {
            id: NodeId::new(id),
            hostname: format!("{}.local", id),
            status: NodeStatus::Online,
            capacity_bytes: capacity,
            fault_domain: None,
            registered_at: Utc::now(),
            last_heartbeat: Utc::now(),
        }
    }

    fn snapshot(nodes: &[&str]) -> TopologySnapshot {
        TopologySnapshot {
            nodes: nodes.iter().map(|n| node(n, 100 * GIB)).collect(),
            bricks: Vec::new(),
        }
    }

    fn spec(volume_type: VolumeType, r: u32, d: u32) -> VolumeSpec {
        VolumeSpec {
            name: "gv0".into(),
            volume_type,
            replica_count: r,
            distribute_count: d,
            redundancy_count: 0,
            capacity_bytes: 10 * GIB,
        }
    }

    fn apply(snapshot: &mut TopologySnapshot, volume_id: &str, plan: &PlacementPlan) {
        for (i, b) in plan.bricks.iter().enumerate() {
            snapshot.bricks.push(Brick {
                id: crate::domain::BrickId::new(format!("{}-b{}", volume_id, i)),
                volume_id: VolumeId::new(volume_id),
                node_id: b.node_id.clone(),
                index: b.index,
                path: b.path.clone(),
                port: b.port,
                size_bytes: b.size_bytes,
                status: BrickStatus::Pending,
            });
        }
    }

    fn volume_from(spec: &VolumeSpec, id: &str) -> Volume {
        Volume {
            id: VolumeId::new(id),
            name: spec.name.clone(),
            volume_type: spec.volume_type,
            replica_count: spec.group_size(),
            distribute_count: spec.distribute_count,
            redundancy_count: spec.redundancy_count,
            capacity_bytes: spec.capacity_bytes,
            state: VolumeState::Created,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_replica_three_on_three_nodes() {
        let planner = TopologyPlanner::default();
        let plan = planner
            .plan(&spec(VolumeType::Replicate, 3, 1), &snapshot(&["n1", "n2", "n3"]))
            .unwrap();

        assert_eq!(plan.bricks.len(), 3);
        assert_eq!(plan.nodes_used().len(), 3);
        assert!(plan.bricks.iter().all(|b| b.port == 49152));
        assert_eq!(plan.bricks[0].path, "/bricks/gv0/brick0");
    }

    #[test]
    fn test_replica_sets_never_share_a_node() {
        let planner = TopologyPlanner::default();
        for nodes in [vec!["a", "b"], vec!["a", "b", "c"], vec!["a", "b", "c", "d", "e"]] {
            let plan = planner
                .plan(&spec(VolumeType::DistributeReplicate, 2, 4), &snapshot(&nodes))
                .unwrap();
            for (_, members) in plan.replica_sets() {
                let distinct: BTreeSet<_> = members.iter().map(|b| &b.node_id).collect();
                assert_eq!(distinct.len(), members.len());
            }
        }
    }

    #[test]
    fn test_ports_distinct_per_node() {
        let planner = TopologyPlanner::default();
        let mut snap = snapshot(&["a", "b"]);
        let first = planner
            .plan(&spec(VolumeType::DistributeReplicate, 2, 3), &snap)
            .unwrap();
        apply(&mut snap, "v1", &first);

        let mut second_spec = spec(VolumeType::Replicate, 2, 1);
        second_spec.name = "gv1".into();
        let second = planner.plan(&second_spec, &snap).unwrap();
        apply(&mut snap, "v2", &second);

        for n in ["a", "b"] {
            let ports: Vec<u16> = snap.bricks_on(&NodeId::new(n)).map(|b| b.port).collect();
            let distinct: BTreeSet<u16> = ports.iter().copied().collect();
            assert_eq!(ports.len(), distinct.len());
            assert_eq!(distinct, (49152..49156).collect());
        }
    }

    #[test]
    fn test_distribute_spreads_evenly_with_lowest_id_ties() {
        let planner = TopologyPlanner::default();
        let plan = planner
            .plan(&spec(VolumeType::Distribute, 1, 4), &snapshot(&["c", "a", "b"]))
            .unwrap();
        let nodes: Vec<&str> = plan.bricks.iter().map(|b| b.node_id.as_str()).collect();
        assert_eq!(nodes, vec!["a", "b", "c", "a"]);
    }

    #[test]
    fn test_replica_sets_spread_across_fault_domains() {
        let planner = TopologyPlanner::default();
        let mut snap = snapshot(&["a", "b", "c", "d"]);
        for (node, rack) in snap.nodes.iter_mut().zip(["r1", "r1", "r2", "r2"]) {
            node.fault_domain = Some(rack.to_string());
        }

        let plan = planner
            .plan(&spec(VolumeType::DistributeReplicate, 2, 2), &snap)
            .unwrap();
        let nodes: Vec<&str> = plan.bricks.iter().map(|b| b.node_id.as_str()).collect();
        assert_eq!(nodes, vec!["a", "c", "b", "d"]);

        // Replacing "a" keeps its set away from rack r2, where "c" lives
        let volume = volume_from(&spec(VolumeType::DistributeReplicate, 2, 2), "v1");
        apply(&mut snap, "v1", &plan);
        let brick = snap.bricks[0].clone();
        snap.nodes.push(Node {
            fault_domain: Some("r2".into()),
            ..node("e", 100 * GIB)
        });
        snap.nodes.push(Node {
            fault_domain: Some("r3".into()),
            ..node("f", 100 * GIB)
        });
        let moved = planner
            .plan_replacement(&volume, &brick, &snap, &NodeId::new("a"))
            .unwrap();
        assert_eq!(moved.node_id.as_str(), "f");
    }

    #[test]
    fn test_insufficient_nodes() {
        let planner = TopologyPlanner::default();
        let err = planner
            .plan(&spec(VolumeType::Replicate, 2, 1), &snapshot(&["only"]))
            .unwrap_err();
        assert_matches!(
            err,
            Error::Planning(PlanningError::InsufficientNodes { required: 2, available: 1 })
        );
    }

    #[test]
    fn test_offline_nodes_are_not_candidates() {
        let planner = TopologyPlanner::default();
        let mut snap = snapshot(&["a", "b"]);
        snap.nodes[1].status = NodeStatus::Offline;
        assert_matches!(
            planner.plan(&spec(VolumeType::Replicate, 2, 1), &snap),
            Err(Error::Planning(PlanningError::InsufficientNodes { .. }))
        );
    }

    #[test]
    fn test_insufficient_capacity() {
        let planner = TopologyPlanner::default();
        let snap = TopologySnapshot {
            nodes: vec![node("a", 100 * GIB), node("b", GIB)],
            bricks: Vec::new(),
        };
        assert_matches!(
            planner.plan(&spec(VolumeType::Replicate, 2, 1), &snap),
            Err(Error::Planning(PlanningError::InsufficientCapacity { available: 1, .. }))
        );
    }

    #[test]
    fn test_port_exhaustion() {
        let planner = TopologyPlanner::new(PlannerConfig {
            port_base: 50000,
            port_max: 50001,
            ..Default::default()
        });
        let err = planner
            .plan(&spec(VolumeType::Distribute, 1, 3), &snapshot(&["a"]))
            .unwrap_err();
        assert_matches!(err, Error::Planning(PlanningError::PortExhausted { .. }));
    }

    #[test]
    fn test_plan_is_reproducible() {
        let planner = TopologyPlanner::default();
        let snap = snapshot(&["n3", "n1", "n2", "n4"]);
        let s = spec(VolumeType::DistributeReplicate, 2, 3);
        assert_eq!(planner.plan(&s, &snap).unwrap(), planner.plan(&s, &snap).unwrap());
    }

    #[test]
    fn test_expansion_appends_sets() {
        let planner = TopologyPlanner::default();
        let mut snap = snapshot(&["a", "b", "c", "d"]);
        let s = spec(VolumeType::Replicate, 2, 1);
        let plan = planner.plan(&s, &snap).unwrap();
        apply(&mut snap, "v1", &plan);

        let volume = volume_from(&s, "v1");
        let expansion = planner.plan_expansion(&volume, &snap, 1).unwrap();
        assert_eq!(expansion.distribute_count, 2);
        let indexes: Vec<u32> = expansion.bricks.iter().map(|b| b.index).collect();
        assert_eq!(indexes, vec![2, 3]);
        // Nodes without bricks of this volume are preferred
        let nodes: Vec<&str> = expansion.bricks.iter().map(|b| b.node_id.as_str()).collect();
        assert_eq!(nodes, vec!["c", "d"]);
    }

    #[test]
    fn test_replacement_avoids_replica_peers() {
        let planner = TopologyPlanner::default();
        let mut snap = snapshot(&["a", "b", "c"]);
        let s = spec(VolumeType::Replicate, 2, 1);
        let plan = planner.plan(&s, &snap).unwrap();
        apply(&mut snap, "v1", &plan);
        let volume = volume_from(&s, "v1");

        let victim = snap.bricks[0].clone();
        let replacement = planner
            .plan_replacement(&volume, &victim, &snap, &victim.node_id)
            .unwrap();
        assert_eq!(replacement.node_id.as_str(), "c");
        assert_eq!(replacement.index, victim.index);

        snap.nodes.truncate(2);
        assert_matches!(
            planner.plan_replacement(&volume, &victim, &snap, &victim.node_id),
            Err(Error::Planning(_))
        );
    }
}
