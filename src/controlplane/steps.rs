//! Step implementations
//!
//! Every step reads current registry state and converges towards its goal, so
//! running it again after a partial failure is safe.

use super::orchestrator::Orchestrator;
use super::task::{Operation, Step};
use crate::domain::{
    Brick, BrickStatus, Node, NodeId, NodeStatus, Volume, VolumeId, VolumeState,
};
use crate::error::{Error, Result};
use crate::registry::TopologySnapshot;
use crate::topology::PlacementPlan;
use crate::volfile::{BrickLaunchConfig, CompiledVolfiles};
use futures::future::join_all;
use std::collections::{BTreeMap, BTreeSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Scratch state carried between the steps of one task
#[derive(Debug)]
pub(crate) struct TaskContext {
    pub operation: Operation,
    pub volume_id: Option<VolumeId>,
    pub node_id: Option<NodeId>,
    pub plan: Option<PlacementPlan>,
    /// Volumes whose bricks moved off a drained node
    pub affected: BTreeSet<VolumeId>,
    pub compiled: BTreeMap<VolumeId, CompiledVolfiles>,
    pub cancel: CancellationToken,
}

impl TaskContext {
    pub fn for_volume(operation: Operation, volume_id: VolumeId) -> Self {
        Self {
            operation,
            volume_id: Some(volume_id),
            node_id: None,
            plan: None,
            affected: BTreeSet::new(),
            compiled: BTreeMap::new(),
            cancel: CancellationToken::new(),
        }
    }

    pub fn for_node(operation: Operation, node_id: NodeId) -> Self {
        Self {
            operation,
            volume_id: None,
            node_id: Some(node_id),
            plan: None,
            affected: BTreeSet::new(),
            compiled: BTreeMap::new(),
            cancel: CancellationToken::new(),
        }
    }

    fn volume_id(&self) -> Result<&VolumeId> {
        self.volume_id
            .as_ref()
            .ok_or_else(|| Error::Internal("volume step on a node task".into()))
    }

    fn node_id(&self) -> Result<&NodeId> {
        self.node_id
            .as_ref()
            .ok_or_else(|| Error::Internal("node step on a volume task".into()))
    }

    /// Volumes the compile/publish/launch steps act on
    fn volumes(&self) -> Vec<VolumeId> {
        match &self.volume_id {
            Some(id) => vec![id.clone()],
            None => self.affected.iter().cloned().collect(),
        }
    }
}

/// Pick the error to report from a fan-out: a permanent one if any, so the
/// step is not retried in vain
fn first_error(results: Vec<Result<()>>) -> Result<()> {
    let mut errors: Vec<Error> = results.into_iter().filter_map(|r| r.err()).collect();
    if errors.is_empty() {
        return Ok(());
    }
    let pick = errors.iter().position(|e| !e.is_retryable()).unwrap_or(0);
    Err(errors.swap_remove(pick))
}

/// Whether every node the plan uses is still online. Port clashes are left to
/// the registry, which reports them as transient so the retry replans.
fn plan_nodes_online(plan: &PlacementPlan, snapshot: &TopologySnapshot) -> bool {
    plan.bricks.iter().all(|planned| {
        snapshot
            .node(&planned.node_id)
            .map(|n| n.is_online())
            .unwrap_or(false)
    })
}

impl Orchestrator {
    pub(super) async fn execute_step(&self, ctx: &mut TaskContext, step: Step) -> Result<()> {
        match step {
            Step::PlanTopology | Step::PlanExpansion => {
                let plan = self.plan_for(ctx, &self.registry.snapshot())?;
                info!(
                    bricks = plan.bricks.len(),
                    nodes = plan.nodes_used().len(),
                    "Placement planned"
                );
                ctx.plan = Some(plan);
                Ok(())
            }
            Step::CreateBricks => self.create_bricks(ctx),
            Step::CompileVolfiles => self.compile_volfiles(ctx),
            Step::PublishVolfiles => self.publish_volfiles(ctx).await,
            Step::LaunchBricks => self.launch_bricks(ctx).await,
            Step::StopBricks => self.stop_bricks(ctx).await,
            Step::TriggerRebalance => self.trigger_rebalance(ctx).await,
            Step::MarkCreated => self.mark(ctx, VolumeState::Created),
            Step::MarkStarted => self.mark(ctx, VolumeState::Started),
            Step::MarkStopping => self.mark(ctx, VolumeState::Stopping),
            Step::MarkStopped => self.mark(ctx, VolumeState::Stopped),
            Step::MarkDeleting => self.mark(ctx, VolumeState::Deleting),
            Step::RetireVolfiles => self.retire_volfiles(ctx).await,
            Step::ReleaseBricks => {
                let released = self.registry.release_bricks(ctx.volume_id()?)?;
                info!(released, "Bricks released");
                Ok(())
            }
            Step::DeleteVolume => {
                let volume_id = ctx.volume_id()?.clone();
                self.registry.delete_volume(&volume_id)?;
                self.acked.retain(|(v, _), _| v != &volume_id);
                Ok(())
            }
            Step::ProbeNode => {
                let node = self.registry.get_node(ctx.node_id()?)?;
                self.ack(&node.hostname, "probe", self.agent.probe(&node))
                    .await
            }
            Step::MarkNodeOnline => {
                self.registry
                    .set_node_status(ctx.node_id()?, NodeStatus::Online)?;
                Ok(())
            }
            Step::DrainNode => self.drain_node(ctx).await,
            Step::ReplaceBricks => self.replace_bricks(ctx),
            Step::RemoveNode => {
                let node_id = ctx.node_id()?.clone();
                self.registry.remove_node(&node_id)?;
                self.acked.retain(|(_, n), _| n != &node_id);
                Ok(())
            }
        }
    }

    // =========================================================================
    // Placement
    // =========================================================================

    fn plan_for(&self, ctx: &TaskContext, snapshot: &TopologySnapshot) -> Result<PlacementPlan> {
        match &ctx.operation {
            Operation::CreateVolume { spec } => self.planner.plan(spec, snapshot),
            Operation::ExpandVolume { add_subvolumes, .. } => {
                let volume = self.registry.get_volume(ctx.volume_id()?)?;
                self.planner
                    .plan_expansion(&volume, snapshot, *add_subvolumes)
            }
            other => Err(Error::Internal(format!(
                "{} has no placement step",
                other.kind()
            ))),
        }
    }

    fn create_bricks(&self, ctx: &mut TaskContext) -> Result<()> {
        let volume_id = ctx.volume_id()?.clone();
        let _placement = self.placement.lock();
        let snapshot = self.registry.snapshot();

        let plan = match ctx.plan.take() {
            Some(plan) if plan_nodes_online(&plan, &snapshot) => plan,
            _ => {
                debug!("Placement went stale, replanning");
                self.plan_for(ctx, &snapshot)?
            }
        };

        // On error the plan stays taken, so a retried attempt replans
        let bricks =
            self.registry
                .add_bricks(&volume_id, &plan.to_new_bricks(), plan.distribute_count)?;
        info!(bricks = bricks.len(), "Bricks recorded");
        ctx.plan = Some(plan);
        Ok(())
    }

    fn replace_bricks(&self, ctx: &mut TaskContext) -> Result<()> {
        let node_id = ctx.node_id()?.clone();
        let _placement = self.placement.lock();

        for (brick, target) in self.plan_node_replacements(&node_id)? {
            let new = self
                .registry
                .replace_brick(&brick.id, &target.node_id, &target.path, target.port)?;
            info!(
                old = %brick.id,
                new = %new.id,
                node = %target.hostname,
                port = target.port,
                "Brick moved"
            );
            ctx.affected.insert(brick.volume_id);
        }
        Ok(())
    }

    // =========================================================================
    // Volfiles
    // =========================================================================

    fn node_map(&self) -> BTreeMap<NodeId, Node> {
        self.registry
            .list_nodes()
            .into_iter()
            .map(|n| (n.id.clone(), n))
            .collect()
    }

    fn compile_volfiles(&self, ctx: &mut TaskContext) -> Result<()> {
        let nodes = self.node_map();
        for volume_id in ctx.volumes() {
            let (volume, bricks) = self.registry.volume_with_bricks(&volume_id)?;
            let options = self.options.options(&volume_id);
            let compiled = self.compiler.compile(&volume, &bricks, &nodes, &options)?;
            debug!(volume = %volume.name, nodes = compiled.server.len(), "Volfiles compiled");
            ctx.compiled.insert(volume_id, compiled);
        }
        Ok(())
    }

    async fn publish_volfiles(&self, ctx: &mut TaskContext) -> Result<()> {
        let nodes = self.node_map();
        let mut publishes = Vec::new();

        for (volume_id, compiled) in &ctx.compiled {
            for node_id in compiled.nodes() {
                let Some(bundle) = compiled.for_node(node_id) else {
                    continue;
                };
                let key = (volume_id.clone(), node_id.clone());
                if self.acked.get(&key).map(|v| *v == bundle).unwrap_or(false) {
                    debug!(volume = %compiled.volume, node = %node_id, "Volfiles unchanged");
                    continue;
                }
                let node = nodes
                    .get(node_id)
                    .ok_or_else(|| Error::not_found("node", node_id))?;
                publishes.push(async move {
                    self.ack(
                        &node.hostname,
                        "publish_volfiles",
                        self.agent.publish_volfiles(node, &compiled.volume, &bundle),
                    )
                    .await?;
                    self.acked.insert(key, bundle);
                    Ok(())
                });
            }
        }

        let count = publishes.len();
        first_error(join_all(publishes).await)?;
        info!(nodes = count, "Volfiles published");
        Ok(())
    }

    async fn retire_volfiles(&self, ctx: &mut TaskContext) -> Result<()> {
        let volume_id = ctx.volume_id()?.clone();
        let (volume, bricks) = self.registry.volume_with_bricks(&volume_id)?;
        let nodes = self.node_map();
        let hosts: BTreeSet<&NodeId> = bricks.iter().map(|b| &b.node_id).collect();

        let retires = hosts.into_iter().filter_map(|id| nodes.get(id)).map(|node| {
            let volume = &volume;
            async move {
                self.ack(
                    &node.hostname,
                    "retire_volume",
                    self.agent.retire_volume(node, &volume.name),
                )
                .await?;
                self.acked.remove(&(volume.id.clone(), node.id.clone()));
                Ok(())
            }
        });
        first_error(join_all(retires).await)
    }

    // =========================================================================
    // Bricks
    // =========================================================================

    async fn launch_bricks(&self, ctx: &mut TaskContext) -> Result<()> {
        let nodes = self.node_map();
        let starting = matches!(ctx.operation, Operation::StartVolume { .. });

        for volume_id in ctx.volumes() {
            let (volume, bricks) = self.registry.volume_with_bricks(&volume_id)?;
            if !starting && volume.state != VolumeState::Started {
                debug!(volume = %volume.name, state = %volume.state, "Volume not started, skipping launch");
                continue;
            }
            let options = self.options.options(&volume_id);
            let pending: Vec<&Brick> = bricks
                .iter()
                .filter(|b| b.status != BrickStatus::Online)
                .collect();

            let mut launches = Vec::with_capacity(pending.len());
            for brick in pending {
                let node = nodes
                    .get(&brick.node_id)
                    .ok_or_else(|| Error::not_found("node", &brick.node_id))?;
                let config = BrickLaunchConfig::for_brick(&volume, node, brick, &options);
                launches.push(self.launch_one(node, brick, config));
            }
            let count = launches.len();
            first_error(join_all(launches).await)?;
            info!(volume = %volume.name, bricks = count, "Bricks launched");
        }
        Ok(())
    }

    async fn launch_one(&self, node: &Node, brick: &Brick, config: BrickLaunchConfig) -> Result<()> {
        let outcome = self
            .ack(
                &node.hostname,
                "launch_brick",
                self.agent.launch_brick(node, &config),
            )
            .await?;
        self.registry
            .set_brick_status(&brick.id, BrickStatus::Online)?;
        debug!(brick = %config.name, ?outcome, "Brick online");
        Ok(())
    }

    async fn stop_bricks(&self, ctx: &mut TaskContext) -> Result<()> {
        let volume_id = ctx.volume_id()?.clone();
        let (volume, bricks) = self.registry.volume_with_bricks(&volume_id)?;
        let nodes = self.node_map();
        let options = self.options.options(&volume_id);

        let mut stops = Vec::new();
        for brick in bricks.iter().filter(|b| b.status != BrickStatus::Offline) {
            let node = nodes
                .get(&brick.node_id)
                .ok_or_else(|| Error::not_found("node", &brick.node_id))?;
            let config = BrickLaunchConfig::for_brick(&volume, node, brick, &options);
            stops.push(async move {
                self.ack(
                    &node.hostname,
                    "stop_brick",
                    self.agent.stop_brick(node, &config),
                )
                .await?;
                self.registry
                    .set_brick_status(&brick.id, BrickStatus::Offline)?;
                Ok(())
            });
        }
        first_error(join_all(stops).await)
    }

    async fn trigger_rebalance(&self, ctx: &mut TaskContext) -> Result<()> {
        let volume_id = ctx.volume_id()?.clone();
        let (volume, bricks) = self.registry.volume_with_bricks(&volume_id)?;
        let nodes = self.node_map();
        let hosts: BTreeSet<&NodeId> = bricks.iter().map(|b| &b.node_id).collect();

        let calls = hosts.into_iter().filter_map(|id| nodes.get(id)).map(|node| {
            let volume = &volume;
            async move {
                self.ack(
                    &node.hostname,
                    "rebalance",
                    self.agent.rebalance(node, &volume.name),
                )
                .await
            }
        });
        first_error(join_all(calls).await)?;
        info!(volume = %volume.name, "Rebalance triggered");
        Ok(())
    }

    /// Stop the node's bricks and take it out of placement
    async fn drain_node(&self, ctx: &mut TaskContext) -> Result<()> {
        let node_id = ctx.node_id()?.clone();
        let node = self.registry.get_node(&node_id)?;
        let bricks = self.registry.node_bricks(&node_id)?;

        if node.is_online() {
            let volumes: BTreeMap<VolumeId, Volume> = bricks
                .iter()
                .map(|b| b.volume_id.clone())
                .collect::<BTreeSet<_>>()
                .into_iter()
                .map(|id| self.registry.get_volume(&id).map(|v| (id, v)))
                .collect::<Result<_>>()?;

            let mut stops = Vec::new();
            for brick in bricks.iter().filter(|b| b.status != BrickStatus::Offline) {
                let volume = volumes
                    .get(&brick.volume_id)
                    .ok_or_else(|| Error::not_found("volume", &brick.volume_id))?;
                let options = self.options.options(&volume.id);
                let config = BrickLaunchConfig::for_brick(volume, &node, brick, &options);
                let node = &node;
                stops.push(async move {
                    self.ack(
                        &node.hostname,
                        "stop_brick",
                        self.agent.stop_brick(node, &config),
                    )
                    .await
                });
            }
            first_error(join_all(stops).await)?;
        } else {
            warn!(node = %node.hostname, "Node offline, skipping brick shutdown");
        }

        for brick in &bricks {
            if brick.status != BrickStatus::Offline {
                self.registry
                    .set_brick_status(&brick.id, BrickStatus::Offline)?;
            }
            ctx.affected.insert(brick.volume_id.clone());
        }
        self.registry
            .set_node_status(&node_id, NodeStatus::Offline)?;
        info!(node = %node.hostname, bricks = bricks.len(), "Node drained");
        Ok(())
    }

    fn mark(&self, ctx: &TaskContext, to: VolumeState) -> Result<()> {
        let volume = self.registry.transition_volume(ctx.volume_id()?, to)?;
        info!(volume = %volume.name, state = %to, "Volume state changed");
        Ok(())
    }
}
