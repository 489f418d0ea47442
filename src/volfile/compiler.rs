//! Volfile Compiler
//!
//! Turns a volume and its bricks into per-node server volfiles and a single
//! client volfile. Output depends only on the inputs: maps are ordered and
//! bricks are sorted by index before rendering.

use super::graph::{render, Translator};
use crate::domain::{Brick, Node, NodeId, NodeVolfiles, Volume, VolumeType};
use crate::error::{Error, Result};
use serde::Serialize;
use std::collections::BTreeMap;

/// Default worker threads for `performance/io-threads`
const DEFAULT_IO_THREADS: u32 = 16;

/// Compiled volfiles of one volume
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CompiledVolfiles {
    pub volume: String,
    /// Server volfile per node hosting at least one brick
    pub server: BTreeMap<NodeId, String>,
    pub client: String,
}

impl CompiledVolfiles {
    /// Bundle delivered to one node
    pub fn for_node(&self, node_id: &NodeId) -> Option<NodeVolfiles> {
        self.server.get(node_id).map(|server| NodeVolfiles {
            server: server.clone(),
            client: self.client.clone(),
        })
    }

    pub fn nodes(&self) -> impl Iterator<Item = &NodeId> {
        self.server.keys()
    }
}

/// Volfile compiler
#[derive(Debug, Clone, Default)]
pub struct VolfileCompiler;

impl VolfileCompiler {
    pub fn new() -> Self {
        Self
    }

    /// Compile server and client volfiles
    pub fn compile(
        &self,
        volume: &Volume,
        bricks: &[Brick],
        nodes: &BTreeMap<NodeId, Node>,
        options: &BTreeMap<String, String>,
    ) -> Result<CompiledVolfiles> {
        if bricks.is_empty() {
            return Err(Error::Validation(format!(
                "volume {} has no bricks",
                volume.name
            )));
        }

        let mut sorted: Vec<&Brick> = bricks.iter().collect();
        sorted.sort_by_key(|b| b.index);

        let mut per_node: BTreeMap<NodeId, Vec<Translator>> = BTreeMap::new();
        let mut clients = Vec::with_capacity(sorted.len());

        for brick in &sorted {
            if brick.volume_id != volume.id {
                return Err(Error::Validation(format!(
                    "brick {} does not belong to volume {}",
                    brick.id, volume.name
                )));
            }
            let node = nodes
                .get(&brick.node_id)
                .ok_or_else(|| Error::not_found("node", brick.node_id.as_str()))?;

            per_node
                .entry(node.id.clone())
                .or_default()
                .extend(server_stack(volume, brick, options));
            clients.push(client_stub(volume, brick, node, options));
        }

        let server = per_node
            .into_iter()
            .map(|(node_id, xlators)| (node_id, render(&xlators)))
            .collect();

        let client = render(&client_graph(volume, clients, options));

        Ok(CompiledVolfiles {
            volume: volume.name.clone(),
            server,
            client,
        })
    }
}

fn server_stack(
    volume: &Volume,
    brick: &Brick,
    options: &BTreeMap<String, String>,
) -> Vec<Translator> {
    let prefix = format!("{}-brick{}", volume.name, brick.index);
    let posix = format!("{}-posix", prefix);
    let locks = format!("{}-locks", prefix);

    vec![
        Translator::new(&posix, "posix", "storage/posix")
            .option("directory", &brick.path)
            .option("volume-id", &volume.id)
            .with_volume_options(options),
        Translator::new(&locks, "locks", "features/locks")
            .with_volume_options(options)
            .subvolume(&posix),
        // Named after the export path so clients can address it as
        // remote-subvolume.
        Translator::new(&brick.path, "io-threads", "performance/io-threads")
            .option("thread-count", DEFAULT_IO_THREADS)
            .with_volume_options(options)
            .subvolume(&locks),
        Translator::new(format!("{}-server", prefix), "server", "protocol/server")
            .option("transport-type", "tcp")
            .option("transport.listen-port", brick.port)
            .option(format!("auth.addr.{}.allow", brick.path), "*")
            .with_volume_options(options)
            .subvolume(&brick.path),
    ]
}

fn client_stub(
    volume: &Volume,
    brick: &Brick,
    node: &Node,
    options: &BTreeMap<String, String>,
) -> Translator {
    Translator::new(
        format!("{}-client-{}", volume.name, brick.index),
        "client",
        "protocol/client",
    )
    .option("remote-host", &node.hostname)
    .option("remote-subvolume", &brick.path)
    .option("remote-port", brick.port)
    .option("transport-type", "tcp")
    .with_volume_options(options)
}

/// Client stubs followed by the cluster translators above them, top last
fn client_graph(
    volume: &Volume,
    clients: Vec<Translator>,
    options: &BTreeMap<String, String>,
) -> Vec<Translator> {
    if clients.len() == 1 {
        return clients;
    }

    let group_size = volume.group_size().max(1) as usize;
    let set_kind = match volume.volume_type {
        VolumeType::Replicate | VolumeType::DistributeReplicate if group_size > 1 => {
            Some(("replicate", "cluster/replicate"))
        }
        VolumeType::Disperse if group_size > 1 => Some(("disperse", "cluster/disperse")),
        _ => None,
    };

    let client_names: Vec<String> = clients.iter().map(|c| c.name.clone()).collect();
    let mut graph = clients;

    let top_children = match set_kind {
        None => client_names,
        Some((kind, xlator_type)) => {
            let mut names = Vec::new();
            for (set, members) in client_names.chunks(group_size).enumerate() {
                let mut xl = Translator::new(
                    format!("{}-{}-{}", volume.name, kind, set),
                    kind,
                    xlator_type,
                );
                if volume.volume_type == VolumeType::Disperse {
                    xl = xl.option("redundancy", volume.redundancy_count);
                }
                let xl = xl
                    .with_volume_options(options)
                    .subvolumes(members.iter().cloned());
                names.push(xl.name.clone());
                graph.push(xl);
            }
            names
        }
    };

    if top_children.len() > 1 {
        graph.push(
            Translator::new(
                format!("{}-dht", volume.name),
                "distribute",
                "cluster/distribute",
            )
            .with_volume_options(options)
            .subvolumes(top_children),
        );
    }
    graph
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{BrickId, BrickStatus, NodeStatus, VolumeId, VolumeState};
    use chrono::Utc;

    fn node(id: &str) -> Node {
        Node {
            id: NodeId::new(id),
            hostname: format!("{}.local", id),
            status: NodeStatus::Online,
            capacity_bytes: 1 << 40,
            fault_domain: None,
            registered_at: Utc::now(),
            last_heartbeat: Utc::now(),
        }
    }

    fn volume(volume_type: VolumeType, r: u32, d: u32, redundancy: u32) -> Volume {
        Volume {
            id: VolumeId::new("volume-0000000000000001"),
            name: "gv0".into(),
            volume_type,
            replica_count: r,
            distribute_count: d,
            redundancy_count: redundancy,
            capacity_bytes: 1 << 30,
            state: VolumeState::Created,
            created_at: Utc::now(),
        }
    }

    fn bricks(volume: &Volume, placement: &[&str]) -> Vec<Brick> {
        placement
            .iter()
            .enumerate()
            .map(|(i, node)| Brick {
                id: BrickId::new(format!("brick-{}", i)),
                volume_id: volume.id.clone(),
                node_id: NodeId::new(*node),
                index: i as u32,
                path: format!("/bricks/gv0/brick{}", i),
                port: 49152 + i as u16,
                size_bytes: 1 << 30,
                status: BrickStatus::Pending,
            })
            .collect()
    }

    fn nodes(ids: &[&str]) -> BTreeMap<NodeId, Node> {
        ids.iter().map(|id| (NodeId::new(*id), node(id))).collect()
    }

    #[test]
    fn test_replicate_three_nodes() {
        let vol = volume(VolumeType::Replicate, 3, 1, 0);
        let bricks = bricks(&vol, &["n1", "n2", "n3"]);
        let out = VolfileCompiler::new()
            .compile(&vol, &bricks, &nodes(&["n1", "n2", "n3"]), &BTreeMap::new())
            .unwrap();

        assert_eq!(out.server.len(), 3);
        let n1 = &out.server[&NodeId::new("n1")];
        assert!(n1.contains("type storage/posix"));
        assert!(n1.contains("option directory /bricks/gv0/brick0"));
        assert!(n1.contains("option transport.listen-port 49152"));
        assert!(n1.contains("option auth.addr./bricks/gv0/brick0.allow *"));
        assert!(!n1.contains("brick1"));

        assert_eq!(out.client.matches("type protocol/client").count(), 3);
        assert!(out.client.contains("option remote-host n2.local"));
        assert!(out.client.contains("type cluster/replicate"));
        assert!(out
            .client
            .contains("subvolumes gv0-client-0 gv0-client-1 gv0-client-2"));
        assert!(!out.client.contains("cluster/distribute"));
        assert!(out.client.trim_end().ends_with("end-volume"));
    }

    #[test]
    fn test_distribute_replicate_nesting() {
        let vol = volume(VolumeType::DistributeReplicate, 2, 2, 0);
        let bricks = bricks(&vol, &["n1", "n2", "n3", "n1"]);
        let out = VolfileCompiler::new()
            .compile(&vol, &bricks, &nodes(&["n1", "n2", "n3"]), &BTreeMap::new())
            .unwrap();

        assert!(out.client.contains("subvolumes gv0-client-0 gv0-client-1"));
        assert!(out.client.contains("subvolumes gv0-client-2 gv0-client-3"));
        assert!(out
            .client
            .contains("subvolumes gv0-replicate-0 gv0-replicate-1"));
        // Top translator comes last.
        let last = out.client.rsplit("volume ").next().unwrap();
        assert!(last.starts_with("gv0-dht"));

        // Two bricks on n1 share its server file.
        let n1 = &out.server[&NodeId::new("n1")];
        assert!(n1.contains("gv0-brick0-server"));
        assert!(n1.contains("gv0-brick3-server"));
    }

    #[test]
    fn test_disperse_carries_redundancy() {
        let vol = volume(VolumeType::Disperse, 3, 1, 1);
        let bricks = bricks(&vol, &["n1", "n2", "n3"]);
        let out = VolfileCompiler::new()
            .compile(&vol, &bricks, &nodes(&["n1", "n2", "n3"]), &BTreeMap::new())
            .unwrap();
        assert!(out.client.contains("type cluster/disperse"));
        assert!(out.client.contains("option redundancy 1"));
    }

    #[test]
    fn test_single_brick_client_is_top() {
        let vol = volume(VolumeType::Distribute, 1, 1, 0);
        let bricks = bricks(&vol, &["n1"]);
        let out = VolfileCompiler::new()
            .compile(&vol, &bricks, &nodes(&["n1"]), &BTreeMap::new())
            .unwrap();
        assert_eq!(out.client.matches("end-volume").count(), 1);
        assert!(out.client.starts_with("volume gv0-client-0\n"));
    }

    #[test]
    fn test_pure_distribute() {
        let vol = volume(VolumeType::Distribute, 1, 3, 0);
        let bricks = bricks(&vol, &["n1", "n2", "n3"]);
        let out = VolfileCompiler::new()
            .compile(&vol, &bricks, &nodes(&["n1", "n2", "n3"]), &BTreeMap::new())
            .unwrap();
        assert!(out
            .client
            .contains("subvolumes gv0-client-0 gv0-client-1 gv0-client-2"));
        assert!(out.client.contains("type cluster/distribute"));
        assert!(!out.client.contains("cluster/replicate"));
    }

    #[test]
    fn test_compile_is_deterministic() {
        let vol = volume(VolumeType::DistributeReplicate, 2, 2, 0);
        let mut input = bricks(&vol, &["n1", "n2", "n2", "n3"]);
        let nodes = nodes(&["n1", "n2", "n3"]);
        let mut options = BTreeMap::new();
        options.insert("io-threads.thread-count".to_string(), "32".to_string());
        options.insert("replicate.quorum-type".to_string(), "auto".to_string());

        let compiler = VolfileCompiler::new();
        let first = compiler.compile(&vol, &input, &nodes, &options).unwrap();
        input.reverse();
        let second = compiler.compile(&vol, &input, &nodes, &options).unwrap();
        assert_eq!(first, second);

        assert!(first.client.contains("option quorum-type auto"));
        assert!(first.server[&NodeId::new("n2")].contains("option thread-count 32"));
        assert!(!first.server[&NodeId::new("n2")].contains("option thread-count 16"));
    }

    #[test]
    fn test_unknown_node_rejected() {
        let vol = volume(VolumeType::Distribute, 1, 1, 0);
        let bricks = bricks(&vol, &["ghost"]);
        let err = VolfileCompiler::new()
            .compile(&vol, &bricks, &BTreeMap::new(), &BTreeMap::new())
            .unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::NotFound);
    }
}
