//! In-memory Node Agent
//!
//! Keeps published volfiles and running bricks in process. Used for dry-run
//! deployments and tests; faults can be injected per operation to exercise
//! retry and failure paths.

use crate::domain::{LaunchOutcome, Node, NodeAgent, NodeVolfiles};
use crate::error::{Error, Result};
use crate::volfile::BrickLaunchConfig;
use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

/// Agent operations, for call logs and fault targeting
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentOp {
    Probe,
    Publish,
    Launch,
    Stop,
    Retire,
    Rebalance,
}

impl std::fmt::Display for AgentOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            AgentOp::Probe => "probe",
            AgentOp::Publish => "publish",
            AgentOp::Launch => "launch",
            AgentOp::Stop => "stop",
            AgentOp::Retire => "retire",
            AgentOp::Rebalance => "rebalance",
        };
        write!(f, "{}", s)
    }
}

/// What an injected fault does
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultKind {
    /// Fail with [`Error::ExternalTimeout`]
    Timeout,
    /// Fail with [`Error::Launcher`]
    LauncherExit,
    /// Sleep before answering normally
    Hang(Duration),
}

#[derive(Debug, Clone)]
struct Fault {
    op: AgentOp,
    hostname: Option<String>,
    remaining: u32,
    kind: FaultKind,
}

/// One recorded agent call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentCall {
    pub op: AgentOp,
    pub hostname: String,
    /// Volume name or brick process name
    pub subject: String,
}

/// In-process node agent
#[derive(Debug, Default)]
pub struct MemoryNodeAgent {
    published: DashMap<(String, String), NodeVolfiles>,
    running: DashMap<String, BrickLaunchConfig>,
    rebalanced: DashMap<String, u32>,
    exited: Mutex<Vec<String>>,
    faults: Mutex<Vec<Fault>>,
    calls: Mutex<Vec<AgentCall>>,
}

impl MemoryNodeAgent {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `times` calls of `op` fail (or hang); `hostname`
    /// restricts the fault to one node
    pub fn inject_fault(&self, op: AgentOp, hostname: Option<&str>, times: u32, kind: FaultKind) {
        self.faults.lock().push(Fault {
            op,
            hostname: hostname.map(str::to_string),
            remaining: times,
            kind,
        });
    }

    pub fn calls(&self) -> Vec<AgentCall> {
        self.calls.lock().clone()
    }

    pub fn call_count(&self, op: AgentOp) -> usize {
        self.calls.lock().iter().filter(|c| c.op == op).count()
    }

    pub fn volfiles(&self, volume: &str, hostname: &str) -> Option<NodeVolfiles> {
        self.published
            .get(&(volume.to_string(), hostname.to_string()))
            .map(|v| v.clone())
    }

    pub fn is_running(&self, brick_name: &str) -> bool {
        self.running.contains_key(brick_name)
    }

    pub fn running_count(&self) -> usize {
        self.running.len()
    }

    /// Simulate a running brick's daemon dying on its own
    pub fn crash_brick(&self, brick_name: &str) -> bool {
        let crashed = self.running.remove(brick_name).is_some();
        if crashed {
            self.exited.lock().push(brick_name.to_string());
        }
        crashed
    }

    pub fn rebalance_count(&self, volume: &str) -> u32 {
        self.rebalanced.get(volume).map(|c| *c).unwrap_or(0)
    }

    /// Record the call and apply any matching fault
    async fn enter(&self, op: AgentOp, node: &Node, subject: &str) -> Result<()> {
        self.calls.lock().push(AgentCall {
            op,
            hostname: node.hostname.clone(),
            subject: subject.to_string(),
        });

        let fault = {
            let mut faults = self.faults.lock();
            let hit = faults.iter_mut().find(|f| {
                f.op == op
                    && f.remaining > 0
                    && f.hostname.as_deref().map_or(true, |h| h == node.hostname)
            });
            hit.map(|f| {
                f.remaining -= 1;
                f.kind
            })
        };

        match fault {
            None => Ok(()),
            Some(FaultKind::Timeout) => {
                debug!(%op, node = %node.hostname, "Injected timeout");
                Err(Error::ExternalTimeout {
                    node: node.hostname.clone(),
                    operation: op.to_string(),
                    timeout: Duration::ZERO,
                })
            }
            Some(FaultKind::LauncherExit) => Err(Error::Launcher {
                brick: subject.to_string(),
                reason: "exited with exit status: 1".into(),
            }),
            Some(FaultKind::Hang(delay)) => {
                tokio::time::sleep(delay).await;
                Ok(())
            }
        }
    }
}

#[async_trait]
impl NodeAgent for MemoryNodeAgent {
    fn name(&self) -> &str {
        "memory"
    }

    async fn probe(&self, node: &Node) -> Result<()> {
        self.enter(AgentOp::Probe, node, &node.hostname).await
    }

    async fn publish_volfiles(
        &self,
        node: &Node,
        volume: &str,
        volfiles: &NodeVolfiles,
    ) -> Result<()> {
        self.enter(AgentOp::Publish, node, volume).await?;
        self.published
            .insert((volume.to_string(), node.hostname.clone()), volfiles.clone());
        Ok(())
    }

    async fn launch_brick(&self, node: &Node, config: &BrickLaunchConfig) -> Result<LaunchOutcome> {
        self.enter(AgentOp::Launch, node, &config.name).await?;
        config.validate()?;
        if self.running.contains_key(&config.name) {
            return Ok(LaunchOutcome::AlreadyRunning);
        }
        self.running.insert(config.name.clone(), config.clone());
        Ok(LaunchOutcome::Ready)
    }

    async fn stop_brick(&self, node: &Node, config: &BrickLaunchConfig) -> Result<()> {
        self.enter(AgentOp::Stop, node, &config.name).await?;
        self.running.remove(&config.name);
        Ok(())
    }

    async fn exited_bricks(&self, node: &Node) -> Result<Vec<String>> {
        let prefix = format!("{}:", node.hostname);
        let mut exited = self.exited.lock();
        let (mine, rest): (Vec<String>, Vec<String>) =
            exited.drain(..).partition(|name| name.starts_with(&prefix));
        *exited = rest;
        Ok(mine)
    }

    async fn retire_volume(&self, node: &Node, volume: &str) -> Result<()> {
        self.enter(AgentOp::Retire, node, volume).await?;
        self.published
            .remove(&(volume.to_string(), node.hostname.clone()));
        Ok(())
    }

    async fn rebalance(&self, node: &Node, volume: &str) -> Result<()> {
        self.enter(AgentOp::Rebalance, node, volume).await?;
        *self.rebalanced.entry(volume.to_string()).or_insert(0) += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{NodeId, NodeStatus};
    use crate::volfile::{LaunchNode, LaunchVolume};
    use assert_matches::assert_matches;
    use chrono::Utc;

    fn node(hostname: &str) -> Node {
        Node {
            id: NodeId::new(hostname),
            hostname: hostname.to_string(),
            status: NodeStatus::Online,
            capacity_bytes: 1 << 30,
            fault_domain: None,
            registered_at: Utc::now(),
            last_heartbeat: Utc::now(),
        }
    }

    fn config() -> BrickLaunchConfig {
        BrickLaunchConfig {
            path: "/bricks/gv0/brick0".into(),
            node: LaunchNode {
                id: "h1".into(),
                hostname: "h1".into(),
            },
            volume: LaunchVolume { name: "gv0".into() },
            name: "h1:bricks-gv0-brick0".into(),
            port: 49152,
            device: String::new(),
            mountdir: String::new(),
        }
    }

    #[tokio::test]
    async fn test_launch_twice_reports_already_running() {
        let agent = MemoryNodeAgent::new();
        let h1 = node("h1");
        assert_eq!(
            agent.launch_brick(&h1, &config()).await.unwrap(),
            LaunchOutcome::Ready
        );
        assert_eq!(
            agent.launch_brick(&h1, &config()).await.unwrap(),
            LaunchOutcome::AlreadyRunning
        );
        assert_eq!(agent.running_count(), 1);
        assert_eq!(agent.call_count(AgentOp::Launch), 2);
    }

    #[tokio::test]
    async fn test_fault_targets_node_and_expires() {
        let agent = MemoryNodeAgent::new();
        agent.inject_fault(AgentOp::Probe, Some("h2"), 1, FaultKind::Timeout);

        agent.probe(&node("h1")).await.unwrap();
        let err = agent.probe(&node("h2")).await.unwrap_err();
        assert_matches!(err, Error::ExternalTimeout { .. });
        assert!(err.is_transient());
        agent.probe(&node("h2")).await.unwrap();
    }

    #[tokio::test]
    async fn test_crashed_brick_is_reported_once_to_its_node() {
        let agent = MemoryNodeAgent::new();
        let h1 = node("h1");
        agent.launch_brick(&h1, &config()).await.unwrap();

        assert!(agent.crash_brick("h1:bricks-gv0-brick0"));
        assert!(!agent.crash_brick("h1:bricks-gv0-brick0"));
        assert!(!agent.is_running("h1:bricks-gv0-brick0"));

        assert!(agent.exited_bricks(&node("h2")).await.unwrap().is_empty());
        assert_eq!(
            agent.exited_bricks(&h1).await.unwrap(),
            vec!["h1:bricks-gv0-brick0".to_string()]
        );
        assert!(agent.exited_bricks(&h1).await.unwrap().is_empty());
    }

    #[test]
    fn test_publish_retire_and_rebalance() {
        let agent = MemoryNodeAgent::new();
        let h1 = node("h1");
        let volfiles = NodeVolfiles {
            server: "volume gv0-brick0-posix\nend-volume\n".into(),
            client: "volume gv0-client-0\nend-volume\n".into(),
        };

        tokio_test::block_on(async {
            agent.publish_volfiles(&h1, "gv0", &volfiles).await.unwrap();
            agent.rebalance(&h1, "gv0").await.unwrap();
            assert_eq!(agent.volfiles("gv0", "h1"), Some(volfiles.clone()));

            agent.retire_volume(&h1, "gv0").await.unwrap();
        });

        assert!(agent.volfiles("gv0", "h1").is_none());
        assert_eq!(agent.rebalance_count("gv0"), 1);
        let ops: Vec<AgentOp> = agent.calls().iter().map(|c| c.op).collect();
        assert_eq!(ops, vec![AgentOp::Publish, AgentOp::Rebalance, AgentOp::Retire]);
    }
}
