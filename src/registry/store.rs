//! Cluster Registry
//!
//! Holds Cluster, Node, Volume and Brick records behind a single lock so
//! every mutation is atomic and referentially checked. Brick batches are
//! applied under one write guard; readers never observe a partial brick set.

use super::events::RegistryEvent;
use crate::domain::{
    Brick, BrickId, BrickStatus, Cluster, ClusterId, Node, NodeId, NodeStatus, Volume, VolumeId,
    VolumeSpec, VolumeState,
};
use crate::error::{Error, Result};
use chrono::Utc;
use parking_lot::RwLock;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info};

// =============================================================================
// Constants
// =============================================================================

/// Capacity of the registry event channel
pub const EVENT_CHANNEL_CAPACITY: usize = 1024;

// =============================================================================
// Brick Requests
// =============================================================================

/// A brick to attach to a volume
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewBrick {
    pub node_id: NodeId,
    pub index: u32,
    pub path: String,
    pub port: u16,
    pub size_bytes: u64,
}

// =============================================================================
// Topology Snapshot
// =============================================================================

/// Consistent copy of nodes and bricks, the planner's only input from the registry
#[derive(Debug, Clone, Default)]
pub struct TopologySnapshot {
    /// Nodes ordered by id
    pub nodes: Vec<Node>,
    /// Bricks ordered by id
    pub bricks: Vec<Brick>,
}

impl TopologySnapshot {
    /// Bricks hosted on a node
    pub fn bricks_on<'a>(&'a self, node_id: &'a NodeId) -> impl Iterator<Item = &'a Brick> + 'a {
        self.bricks.iter().filter(move |b| &b.node_id == node_id)
    }

    /// Bricks of a volume ordered by index
    pub fn volume_bricks(&self, volume_id: &VolumeId) -> Vec<&Brick> {
        let mut bricks: Vec<&Brick> = self
            .bricks
            .iter()
            .filter(|b| &b.volume_id == volume_id)
            .collect();
        bricks.sort_by_key(|b| b.index);
        bricks
    }

    /// Ports held by bricks on a node
    pub fn used_ports(&self, node_id: &NodeId) -> BTreeSet<u16> {
        self.bricks_on(node_id).map(|b| b.port).collect()
    }

    /// Bytes already committed to bricks on a node
    pub fn used_bytes(&self, node_id: &NodeId) -> u64 {
        self.bricks_on(node_id).map(|b| b.size_bytes).sum()
    }

    pub fn node(&self, node_id: &NodeId) -> Option<&Node> {
        self.nodes.iter().find(|n| &n.id == node_id)
    }
}

// =============================================================================
// Registry State
// =============================================================================

#[derive(Debug, Default)]
struct RegistryState {
    nodes: BTreeMap<NodeId, Node>,
    volumes: BTreeMap<VolumeId, Volume>,
    bricks: BTreeMap<BrickId, Brick>,
    /// Nodes taken offline for missed heartbeats; only these come back on a heartbeat
    stale: BTreeSet<NodeId>,
}

impl RegistryState {
    fn node(&self, node_id: &NodeId) -> Result<&Node> {
        self.nodes
            .get(node_id)
            .ok_or_else(|| Error::not_found("node", node_id))
    }

    fn volume(&self, volume_id: &VolumeId) -> Result<&Volume> {
        self.volumes
            .get(volume_id)
            .ok_or_else(|| Error::not_found("volume", volume_id))
    }

    fn volume_bricks(&self, volume_id: &VolumeId) -> Vec<Brick> {
        let mut bricks: Vec<Brick> = self
            .bricks
            .values()
            .filter(|b| &b.volume_id == volume_id)
            .cloned()
            .collect();
        bricks.sort_by_key(|b| b.index);
        bricks
    }

    fn node_bricks(&self, node_id: &NodeId) -> Vec<Brick> {
        self.bricks
            .values()
            .filter(|b| &b.node_id == node_id)
            .cloned()
            .collect()
    }

    fn port_holder(&self, node_id: &NodeId, port: u16) -> Option<&Brick> {
        self.bricks
            .values()
            .find(|b| &b.node_id == node_id && b.port == port)
    }
}

// =============================================================================
// Registry Statistics
// =============================================================================

/// Snapshot of registry statistics
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct RegistryStats {
    pub total_nodes: u64,
    pub online_nodes: u64,
    pub total_volumes: u64,
    pub started_volumes: u64,
    pub total_bricks: u64,
    pub online_bricks: u64,
    pub total_capacity_bytes: u64,
    pub allocated_bytes: u64,
    pub mutations: u64,
}

// =============================================================================
// Registry
// =============================================================================

/// Single source of truth for cluster topology
pub struct Registry {
    cluster: Cluster,
    state: RwLock<RegistryState>,
    node_counter: AtomicU64,
    volume_counter: AtomicU64,
    brick_counter: AtomicU64,
    mutations: AtomicU64,
    event_sender: broadcast::Sender<RegistryEvent>,
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("cluster", &self.cluster.name)
            .field("mutations", &self.mutations.load(Ordering::Relaxed))
            .finish()
    }
}

impl Registry {
    /// Bootstrap the registry for a cluster
    pub fn new(cluster_name: impl Into<String>) -> Arc<Self> {
        let (event_sender, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let cluster = Cluster {
            id: ClusterId::new("cluster-0000000000000001"),
            name: cluster_name.into(),
            created_at: Utc::now(),
        };

        info!(cluster = %cluster.name, "Registry initialized");

        Arc::new(Self {
            cluster,
            state: RwLock::new(RegistryState::default()),
            node_counter: AtomicU64::new(0),
            volume_counter: AtomicU64::new(0),
            brick_counter: AtomicU64::new(0),
            mutations: AtomicU64::new(0),
            event_sender,
        })
    }

    /// Get an event receiver
    pub fn subscribe(&self) -> broadcast::Receiver<RegistryEvent> {
        self.event_sender.subscribe()
    }

    pub fn cluster(&self) -> &Cluster {
        &self.cluster
    }

    fn next_id(counter: &AtomicU64, prefix: &str) -> String {
        let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
        format!("{}-{:016x}", prefix, n)
    }

    fn emit(&self, event: RegistryEvent) {
        self.mutations.fetch_add(1, Ordering::Relaxed);
        let _ = self.event_sender.send(event);
    }

    // =========================================================================
    // Nodes
    // =========================================================================

    /// Register a node; it joins offline until probed
    pub fn add_node(
        &self,
        hostname: impl Into<String>,
        capacity_bytes: u64,
        fault_domain: Option<String>,
    ) -> Result<Node> {
        let hostname = hostname.into();
        if hostname.trim().is_empty() {
            return Err(Error::Validation("hostname must not be empty".into()));
        }

        let mut state = self.state.write();
        if state.nodes.values().any(|n| n.hostname == hostname) {
            return Err(Error::conflict(format!(
                "node with hostname {} already registered",
                hostname
            )));
        }

        let now = Utc::now();
        let node = Node {
            id: NodeId::new(Self::next_id(&self.node_counter, "node")),
            hostname: hostname.clone(),
            status: NodeStatus::Offline,
            capacity_bytes,
            fault_domain,
            registered_at: now,
            last_heartbeat: now,
        };
        state.nodes.insert(node.id.clone(), node.clone());
        drop(state);

        debug!(node = %node.id, hostname = %hostname, "Node registered");
        self.emit(RegistryEvent::NodeAdded {
            node_id: node.id.clone(),
            hostname,
        });

        Ok(node)
    }

    pub fn get_node(&self, node_id: &NodeId) -> Result<Node> {
        self.state.read().node(node_id).cloned()
    }

    pub fn find_node(&self, hostname: &str) -> Option<Node> {
        self.state
            .read()
            .nodes
            .values()
            .find(|n| n.hostname == hostname)
            .cloned()
    }

    /// All nodes ordered by id
    pub fn list_nodes(&self) -> Vec<Node> {
        self.state.read().nodes.values().cloned().collect()
    }

    pub fn online_nodes(&self) -> Vec<Node> {
        self.state
            .read()
            .nodes
            .values()
            .filter(|n| n.is_online())
            .cloned()
            .collect()
    }

    pub fn set_node_status(&self, node_id: &NodeId, status: NodeStatus) -> Result<Node> {
        let mut state = self.state.write();
        let node = state
            .nodes
            .get_mut(node_id)
            .ok_or_else(|| Error::not_found("node", node_id))?;

        let changed = node.status != status;
        node.status = status;
        if status == NodeStatus::Online {
            node.last_heartbeat = Utc::now();
        }
        let node = node.clone();
        state.stale.remove(node_id);
        drop(state);

        if changed {
            info!(node = %node_id, status = %status, "Node status changed");
            self.emit(RegistryEvent::NodeStatusChanged {
                node_id: node_id.clone(),
                status,
            });
        }
        Ok(node)
    }

    /// Record a heartbeat.
    ///
    /// Only a node that went offline for missed heartbeats is brought back
    /// online. Nodes that never passed a probe or were drained stay offline
    /// until a task says otherwise.
    pub fn heartbeat(&self, node_id: &NodeId) -> Result<()> {
        let mut state = self.state.write();
        let revive = state.stale.remove(node_id);
        let node = state
            .nodes
            .get_mut(node_id)
            .ok_or_else(|| Error::not_found("node", node_id))?;
        node.last_heartbeat = Utc::now();
        let came_online = revive && node.status == NodeStatus::Offline;
        if came_online {
            node.status = NodeStatus::Online;
        }
        drop(state);

        if came_online {
            self.emit(RegistryEvent::NodeStatusChanged {
                node_id: node_id.clone(),
                status: NodeStatus::Online,
            });
        }
        Ok(())
    }

    /// Mark nodes whose last heartbeat is older than `max_age_secs` offline
    pub fn mark_stale_offline(&self, max_age_secs: u64) -> Vec<NodeId> {
        let now = Utc::now();
        let mut stale = Vec::new();

        let mut state = self.state.write();
        for node in state.nodes.values_mut() {
            let age = now.signed_duration_since(node.last_heartbeat);
            if node.is_online() && age.num_seconds() > max_age_secs as i64 {
                node.status = NodeStatus::Offline;
                stale.push(node.id.clone());
            }
        }
        state.stale.extend(stale.iter().cloned());
        drop(state);

        for node_id in &stale {
            info!(node = %node_id, "Node missed heartbeats, marked offline");
            self.emit(RegistryEvent::NodeStatusChanged {
                node_id: node_id.clone(),
                status: NodeStatus::Offline,
            });
        }
        stale
    }

    /// Remove a node that owns no bricks
    pub fn remove_node(&self, node_id: &NodeId) -> Result<Node> {
        let mut state = self.state.write();
        state.node(node_id)?;

        let bricks = state.node_bricks(node_id);
        let online = bricks
            .iter()
            .filter(|b| b.status == BrickStatus::Online)
            .count();
        if online > 0 {
            return Err(Error::conflict(format!(
                "node {} owns {} online bricks",
                node_id, online
            )));
        }
        if !bricks.is_empty() {
            return Err(Error::conflict(format!(
                "node {} still owns {} bricks; release or replace them first",
                node_id,
                bricks.len()
            )));
        }

        let node = state
            .nodes
            .remove(node_id)
            .ok_or_else(|| Error::not_found("node", node_id))?;
        state.stale.remove(node_id);
        drop(state);

        info!(node = %node_id, hostname = %node.hostname, "Node removed");
        self.emit(RegistryEvent::NodeRemoved {
            node_id: node_id.clone(),
        });
        Ok(node)
    }

    // =========================================================================
    // Volumes
    // =========================================================================

    /// Create a volume record in `creating`
    pub fn create_volume(&self, spec: &VolumeSpec) -> Result<Volume> {
        spec.validate()?;

        let mut state = self.state.write();
        if state.volumes.values().any(|v| v.name == spec.name) {
            return Err(Error::conflict(format!("volume {} already exists", spec.name)));
        }

        let volume = Volume {
            id: VolumeId::new(Self::next_id(&self.volume_counter, "volume")),
            name: spec.name.clone(),
            volume_type: spec.volume_type,
            replica_count: spec.group_size(),
            distribute_count: spec.distribute_count,
            redundancy_count: spec.redundancy_count,
            capacity_bytes: spec.capacity_bytes,
            state: VolumeState::Creating,
            created_at: Utc::now(),
        };
        state.volumes.insert(volume.id.clone(), volume.clone());
        drop(state);

        info!(volume = %volume.name, id = %volume.id, kind = %volume.volume_type, "Volume created");
        self.emit(RegistryEvent::VolumeCreated {
            volume_id: volume.id.clone(),
            name: volume.name.clone(),
        });
        Ok(volume)
    }

    pub fn get_volume(&self, volume_id: &VolumeId) -> Result<Volume> {
        self.state.read().volume(volume_id).cloned()
    }

    /// Look a volume up by name
    pub fn find_volume(&self, name: &str) -> Result<Volume> {
        self.state
            .read()
            .volumes
            .values()
            .find(|v| v.name == name)
            .cloned()
            .ok_or_else(|| Error::not_found("volume", name))
    }

    pub fn list_volumes(&self) -> Vec<Volume> {
        self.state.read().volumes.values().cloned().collect()
    }

    /// Move a volume through its lifecycle; re-entering the current state is a no-op
    pub fn transition_volume(&self, volume_id: &VolumeId, to: VolumeState) -> Result<Volume> {
        let mut state = self.state.write();
        let volume = state
            .volumes
            .get_mut(volume_id)
            .ok_or_else(|| Error::not_found("volume", volume_id))?;

        let from = volume.state;
        if from == to {
            return Ok(volume.clone());
        }
        if !from.can_transition_to(to) {
            return Err(Error::conflict(format!(
                "volume {} cannot move from {} to {}",
                volume.name, from, to
            )));
        }
        volume.state = to;
        let volume = volume.clone();
        drop(state);

        info!(volume = %volume.name, %from, %to, "Volume state changed");
        self.emit(RegistryEvent::VolumeStateChanged {
            volume_id: volume_id.clone(),
            from,
            to,
        });
        Ok(volume)
    }

    /// Delete a volume that is not started and owns no bricks
    pub fn delete_volume(&self, volume_id: &VolumeId) -> Result<Volume> {
        let mut state = self.state.write();
        let volume = state.volume(volume_id)?;
        if volume.state == VolumeState::Started {
            return Err(Error::conflict(format!(
                "volume {} is started",
                volume.name
            )));
        }
        let bricks = state.volume_bricks(volume_id).len();
        if bricks > 0 {
            return Err(Error::conflict(format!(
                "volume {} still owns {} bricks",
                volume.name, bricks
            )));
        }
        let volume = state
            .volumes
            .remove(volume_id)
            .ok_or_else(|| Error::not_found("volume", volume_id))?;
        drop(state);

        info!(volume = %volume.name, "Volume deleted");
        self.emit(RegistryEvent::VolumeDeleted {
            volume_id: volume_id.clone(),
        });
        Ok(volume)
    }

    // =========================================================================
    // Bricks
    // =========================================================================

    /// Attach a batch of bricks and set the volume's distribute count, atomically.
    ///
    /// A brick already present at the same (node, path, index) is returned as is,
    /// so a retried call does not double-apply.
    pub fn add_bricks(
        &self,
        volume_id: &VolumeId,
        bricks: &[NewBrick],
        distribute_count: u32,
    ) -> Result<Vec<Brick>> {
        let mut state = self.state.write();
        let volume = state.volume(volume_id)?.clone();
        if volume.state == VolumeState::Deleting {
            return Err(Error::conflict(format!(
                "volume {} is being deleted",
                volume.name
            )));
        }

        let existing = state.volume_bricks(volume_id);
        let mut result: Vec<Option<Brick>> = Vec::with_capacity(bricks.len());
        let mut batch_ports: BTreeSet<(NodeId, u16)> = BTreeSet::new();
        let mut batch_indexes: BTreeSet<u32> = BTreeSet::new();

        // Validate the whole batch before touching state
        for nb in bricks {
            state.node(&nb.node_id)?;

            if let Some(same) = existing
                .iter()
                .find(|b| b.node_id == nb.node_id && b.path == nb.path)
            {
                if same.index != nb.index {
                    return Err(Error::conflict(format!(
                        "{}:{} already serves index {}",
                        nb.node_id, nb.path, same.index
                    )));
                }
                result.push(Some(same.clone()));
                continue;
            }

            if existing.iter().any(|b| b.index == nb.index) || !batch_indexes.insert(nb.index) {
                return Err(Error::conflict(format!(
                    "volume {} already has a brick at index {}",
                    volume.name, nb.index
                )));
            }
            if state.port_holder(&nb.node_id, nb.port).is_some()
                || !batch_ports.insert((nb.node_id.clone(), nb.port))
            {
                return Err(Error::transient_conflict(format!(
                    "port {} already in use on node {}",
                    nb.port, nb.node_id
                )));
            }
            result.push(None);
        }

        let mut added = 0;
        let mut out = Vec::with_capacity(bricks.len());
        for (nb, reused) in bricks.iter().zip(result) {
            let brick = match reused {
                Some(brick) => brick,
                None => {
                    let brick = Brick {
                        id: BrickId::new(Self::next_id(&self.brick_counter, "brick")),
                        volume_id: volume_id.clone(),
                        node_id: nb.node_id.clone(),
                        index: nb.index,
                        path: nb.path.clone(),
                        port: nb.port,
                        size_bytes: nb.size_bytes,
                        status: BrickStatus::Pending,
                    };
                    state.bricks.insert(brick.id.clone(), brick.clone());
                    added += 1;
                    brick
                }
            };
            out.push(brick);
        }

        if let Some(v) = state.volumes.get_mut(volume_id) {
            v.distribute_count = distribute_count.max(1);
            v.volume_type = v.volume_type.with_distribute_count(v.distribute_count);
        }
        drop(state);

        if added > 0 {
            debug!(volume = %volume.name, added, "Bricks attached");
            self.emit(RegistryEvent::BricksAdded {
                volume_id: volume_id.clone(),
                count: added,
            });
        }
        Ok(out)
    }

    pub fn get_brick(&self, brick_id: &BrickId) -> Result<Brick> {
        self.state
            .read()
            .bricks
            .get(brick_id)
            .cloned()
            .ok_or_else(|| Error::not_found("brick", brick_id))
    }

    /// Bricks of a volume ordered by index
    pub fn volume_bricks(&self, volume_id: &VolumeId) -> Result<Vec<Brick>> {
        let state = self.state.read();
        state.volume(volume_id)?;
        Ok(state.volume_bricks(volume_id))
    }

    /// Volume and its bricks read under one guard
    pub fn volume_with_bricks(&self, volume_id: &VolumeId) -> Result<(Volume, Vec<Brick>)> {
        let state = self.state.read();
        let volume = state.volume(volume_id)?.clone();
        Ok((volume, state.volume_bricks(volume_id)))
    }

    pub fn node_bricks(&self, node_id: &NodeId) -> Result<Vec<Brick>> {
        let state = self.state.read();
        state.node(node_id)?;
        Ok(state.node_bricks(node_id))
    }

    pub fn set_brick_status(&self, brick_id: &BrickId, status: BrickStatus) -> Result<Brick> {
        let mut state = self.state.write();
        let brick = state
            .bricks
            .get_mut(brick_id)
            .ok_or_else(|| Error::not_found("brick", brick_id))?;
        let changed = brick.status != status;
        brick.status = status;
        let brick = brick.clone();
        drop(state);

        if changed {
            self.emit(RegistryEvent::BrickStatusChanged {
                volume_id: brick.volume_id.clone(),
                brick_id: brick_id.clone(),
                status,
            });
        }
        Ok(brick)
    }

    /// Move a brick to another node, keeping its index in the volume
    pub fn replace_brick(
        &self,
        brick_id: &BrickId,
        node_id: &NodeId,
        path: &str,
        port: u16,
    ) -> Result<Brick> {
        let mut state = self.state.write();
        let old = state
            .bricks
            .get(brick_id)
            .cloned()
            .ok_or_else(|| Error::not_found("brick", brick_id))?;
        state.node(node_id)?;

        if old.status == BrickStatus::Online {
            return Err(Error::conflict(format!(
                "brick {} is online; stop it before replacing",
                brick_id
            )));
        }
        if let Some(holder) = state.port_holder(node_id, port) {
            return Err(Error::transient_conflict(format!(
                "port {} already in use on node {} by {}",
                port, node_id, holder.id
            )));
        }
        if state
            .bricks
            .values()
            .any(|b| b.volume_id == old.volume_id && &b.node_id == node_id && b.path == path)
        {
            return Err(Error::conflict(format!(
                "{}:{} already belongs to the volume",
                node_id, path
            )));
        }

        let new = Brick {
            id: BrickId::new(Self::next_id(&self.brick_counter, "brick")),
            volume_id: old.volume_id.clone(),
            node_id: node_id.clone(),
            index: old.index,
            path: path.to_string(),
            port,
            size_bytes: old.size_bytes,
            status: BrickStatus::Pending,
        };
        state.bricks.remove(brick_id);
        state.bricks.insert(new.id.clone(), new.clone());
        drop(state);

        info!(old = %brick_id, new = %new.id, node = %node_id, "Brick replaced");
        self.emit(RegistryEvent::BrickReplaced {
            volume_id: new.volume_id.clone(),
            old_brick: brick_id.clone(),
            new_brick: new.id.clone(),
        });
        Ok(new)
    }

    /// Detach every brick of a volume that is not started
    pub fn release_bricks(&self, volume_id: &VolumeId) -> Result<usize> {
        let mut state = self.state.write();
        let volume = state.volume(volume_id)?.clone();
        if volume.state == VolumeState::Started {
            return Err(Error::conflict(format!(
                "volume {} is started",
                volume.name
            )));
        }

        let bricks = state.volume_bricks(volume_id);
        if let Some(online) = bricks.iter().find(|b| b.status == BrickStatus::Online) {
            return Err(Error::conflict(format!(
                "brick {} of volume {} is still online",
                online.id, volume.name
            )));
        }
        for brick in &bricks {
            state.bricks.remove(&brick.id);
        }
        drop(state);

        if !bricks.is_empty() {
            self.emit(RegistryEvent::BricksReleased {
                volume_id: volume_id.clone(),
                count: bricks.len(),
            });
        }
        Ok(bricks.len())
    }

    // =========================================================================
    // Snapshots
    // =========================================================================

    /// Consistent copy of nodes and bricks for planning
    pub fn snapshot(&self) -> TopologySnapshot {
        let state = self.state.read();
        TopologySnapshot {
            nodes: state.nodes.values().cloned().collect(),
            bricks: state.bricks.values().cloned().collect(),
        }
    }

    /// Get registry statistics
    pub fn stats(&self) -> RegistryStats {
        let state = self.state.read();
        RegistryStats {
            total_nodes: state.nodes.len() as u64,
            online_nodes: state.nodes.values().filter(|n| n.is_online()).count() as u64,
            total_volumes: state.volumes.len() as u64,
            started_volumes: state
                .volumes
                .values()
                .filter(|v| v.state == VolumeState::Started)
                .count() as u64,
            total_bricks: state.bricks.len() as u64,
            online_bricks: state
                .bricks
                .values()
                .filter(|b| b.status == BrickStatus::Online)
                .count() as u64,
            total_capacity_bytes: state.nodes.values().map(|n| n.capacity_bytes).sum(),
            allocated_bytes: state.bricks.values().map(|b| b.size_bytes).sum(),
            mutations: self.mutations.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::VolumeType;
    use assert_matches::assert_matches;

    const GIB: u64 = 1 << 30;

    fn registry_with_nodes(count: usize) -> (Arc<Registry>, Vec<Node>) {
        let registry = Registry::new("test");
        let nodes = (0..count)
            .map(|i| {
                let node = registry
                    .add_node(format!("host-{}.local", i), 100 * GIB, None)
                    .unwrap();
                registry.set_node_status(&node.id, NodeStatus::Online).unwrap()
            })
            .collect();
        (registry, nodes)
    }

    fn replica_spec(name: &str) -> VolumeSpec {
        VolumeSpec {
            name: name.into(),
            volume_type: VolumeType::Replicate,
            replica_count: 2,
            distribute_count: 1,
            redundancy_count: 0,
            capacity_bytes: GIB,
        }
    }

    fn new_brick(node: &Node, index: u32, port: u16) -> NewBrick {
        NewBrick {
            node_id: node.id.clone(),
            index,
            path: format!("/bricks/gv0/brick{}", index),
            port,
            size_bytes: GIB,
        }
    }

    #[test]
    fn test_add_node_and_duplicate_hostname() {
        let registry = Registry::new("test");
        let node = registry.add_node("host-1.local", GIB, None).unwrap();
        assert_eq!(node.status, NodeStatus::Offline);
        assert_eq!(registry.get_node(&node.id).unwrap().hostname, "host-1.local");

        let err = registry.add_node("host-1.local", GIB, None).unwrap_err();
        assert_matches!(err, Error::Conflict { .. });
        assert_matches!(
            registry.get_node(&NodeId::new("node-ffff")),
            Err(Error::NotFound { .. })
        );
    }

    #[test]
    fn test_volume_name_unique() {
        let registry = Registry::new("test");
        registry.create_volume(&replica_spec("gv0")).unwrap();
        assert_matches!(
            registry.create_volume(&replica_spec("gv0")),
            Err(Error::Conflict { .. })
        );
    }

    #[test]
    fn test_add_bricks_is_atomic_and_idempotent() {
        let (registry, nodes) = registry_with_nodes(2);
        let volume = registry.create_volume(&replica_spec("gv0")).unwrap();

        let batch = vec![new_brick(&nodes[0], 0, 49152), new_brick(&nodes[1], 1, 49152)];
        let first = registry.add_bricks(&volume.id, &batch, 1).unwrap();
        let again = registry.add_bricks(&volume.id, &batch, 1).unwrap();
        assert_eq!(first, again);
        assert_eq!(registry.volume_bricks(&volume.id).unwrap().len(), 2);

        // Second brick collides on port: nothing from the batch may land
        let other = registry.create_volume(&replica_spec("gv1")).unwrap();
        let bad = vec![
            NewBrick {
                path: "/bricks/gv1/brick0".into(),
                ..new_brick(&nodes[0], 0, 49153)
            },
            NewBrick {
                path: "/bricks/gv1/brick1".into(),
                ..new_brick(&nodes[1], 1, 49152)
            },
        ];
        let err = registry.add_bricks(&other.id, &bad, 1).unwrap_err();
        assert_matches!(err, Error::Conflict { transient: true, .. });
        assert!(err.is_retryable());
        assert!(registry.volume_bricks(&other.id).unwrap().is_empty());
    }

    #[test]
    fn test_add_bricks_rejects_unknown_node() {
        let registry = Registry::new("test");
        let volume = registry.create_volume(&replica_spec("gv0")).unwrap();
        let brick = NewBrick {
            node_id: NodeId::new("node-missing"),
            index: 0,
            path: "/bricks/gv0/brick0".into(),
            port: 49152,
            size_bytes: GIB,
        };
        assert_matches!(
            registry.add_bricks(&volume.id, &[brick], 1),
            Err(Error::NotFound { .. })
        );
    }

    #[test]
    fn test_volume_cannot_be_deleted_while_started_or_with_bricks() {
        let (registry, nodes) = registry_with_nodes(2);
        let volume = registry.create_volume(&replica_spec("gv0")).unwrap();
        registry
            .add_bricks(
                &volume.id,
                &[new_brick(&nodes[0], 0, 49152), new_brick(&nodes[1], 1, 49152)],
                1,
            )
            .unwrap();
        registry.transition_volume(&volume.id, VolumeState::Created).unwrap();
        registry.transition_volume(&volume.id, VolumeState::Started).unwrap();

        assert_matches!(registry.delete_volume(&volume.id), Err(Error::Conflict { .. }));
        assert_matches!(registry.release_bricks(&volume.id), Err(Error::Conflict { .. }));

        registry.transition_volume(&volume.id, VolumeState::Stopping).unwrap();
        registry.transition_volume(&volume.id, VolumeState::Stopped).unwrap();
        assert_matches!(registry.delete_volume(&volume.id), Err(Error::Conflict { .. }));

        registry.transition_volume(&volume.id, VolumeState::Deleting).unwrap();
        assert_eq!(registry.release_bricks(&volume.id).unwrap(), 2);
        registry.delete_volume(&volume.id).unwrap();
        assert!(registry.list_volumes().is_empty());
    }

    #[test]
    fn test_illegal_transition_is_conflict() {
        let registry = Registry::new("test");
        let volume = registry.create_volume(&replica_spec("gv0")).unwrap();
        assert_matches!(
            registry.transition_volume(&volume.id, VolumeState::Started),
            Err(Error::Conflict { .. })
        );
        // Re-entering the current state is a no-op
        registry.transition_volume(&volume.id, VolumeState::Creating).unwrap();
    }

    #[test]
    fn test_remove_node_with_bricks() {
        let (registry, nodes) = registry_with_nodes(2);
        let volume = registry.create_volume(&replica_spec("gv0")).unwrap();
        let bricks = registry
            .add_bricks(
                &volume.id,
                &[new_brick(&nodes[0], 0, 49152), new_brick(&nodes[1], 1, 49152)],
                1,
            )
            .unwrap();
        registry.set_brick_status(&bricks[0].id, BrickStatus::Online).unwrap();

        let err = registry.remove_node(&nodes[0].id).unwrap_err();
        assert!(err.to_string().contains("online bricks"));

        registry.set_brick_status(&bricks[0].id, BrickStatus::Offline).unwrap();
        assert_matches!(registry.remove_node(&nodes[0].id), Err(Error::Conflict { .. }));

        let spare = registry.add_node("host-spare.local", 100 * GIB, None).unwrap();
        let moved = registry
            .replace_brick(&bricks[0].id, &spare.id, "/bricks/gv0/brick0", 49152)
            .unwrap();
        assert_eq!(moved.index, 0);
        assert_eq!(moved.status, BrickStatus::Pending);

        registry.remove_node(&nodes[0].id).unwrap();
        assert_eq!(registry.list_nodes().len(), 2);
    }

    #[test]
    fn test_mark_stale_offline() {
        let (registry, nodes) = registry_with_nodes(1);
        assert!(registry.mark_stale_offline(3600).is_empty());

        {
            let mut state = registry.state.write();
            let node = state.nodes.get_mut(&nodes[0].id).unwrap();
            node.last_heartbeat = Utc::now() - chrono::Duration::seconds(120);
        }
        assert_eq!(registry.mark_stale_offline(60), vec![nodes[0].id.clone()]);
        assert_eq!(registry.get_node(&nodes[0].id).unwrap().status, NodeStatus::Offline);

        registry.heartbeat(&nodes[0].id).unwrap();
        assert!(registry.get_node(&nodes[0].id).unwrap().is_online());
    }

    #[test]
    fn test_heartbeat_does_not_revive_unprobed_or_drained_nodes() {
        let (registry, nodes) = registry_with_nodes(1);
        let unprobed = registry.add_node("host-new.local", GIB, None).unwrap();
        registry.heartbeat(&unprobed.id).unwrap();
        assert_eq!(registry.get_node(&unprobed.id).unwrap().status, NodeStatus::Offline);

        registry.set_node_status(&nodes[0].id, NodeStatus::Offline).unwrap();
        registry.heartbeat(&nodes[0].id).unwrap();
        assert_eq!(registry.get_node(&nodes[0].id).unwrap().status, NodeStatus::Offline);
    }

    #[tokio::test]
    async fn test_events_are_broadcast() {
        let registry = Registry::new("test");
        let mut events = registry.subscribe();
        let node = registry.add_node("host-1.local", GIB, None).unwrap();

        match events.recv().await.unwrap() {
            RegistryEvent::NodeAdded { node_id, hostname } => {
                assert_eq!(node_id, node.id);
                assert_eq!(hostname, "host-1.local");
            }
            other => panic!("unexpected event {:?}", other),
        }
        assert_eq!(registry.stats().total_nodes, 1);
    }
}
