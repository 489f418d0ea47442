//! Task Orchestrator
//!
//! Accepts operations, validates them against the registry, and runs each as
//! a task: an ordered list of idempotent steps executed on the tokio runtime.
//! Transient step failures are retried with exponential backoff; anything
//! else fails the task where it stands. Nothing is rolled back.

use super::claim::{ClaimGuard, TargetClaims};
use super::metrics::TaskMetrics;
use super::steps::TaskContext;
use super::task::{Operation, Step, StepState, Target, Task, TaskFailure, TaskState};
use crate::domain::{
    validate_name, Brick, BrickStatus, NodeAgent, NodeId, NodeVolfiles, OptionSource,
    TaskId, VolumeId, VolumeState,
};
use crate::error::{Error, Result};
use crate::registry::{Registry, TopologySnapshot};
use crate::topology::TopologyPlanner;
use crate::volfile::{process_name, VolfileCompiler};
use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};

// =============================================================================
// Orchestrator Configuration
// =============================================================================

/// Retry and timeout policy for task execution
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Attempts per step, including the first
    pub max_step_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    /// Bound on every node agent acknowledgment
    pub ack_timeout_ms: u64,
    /// Finished tasks kept for queries
    pub task_history: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_step_attempts: 5,
            initial_backoff_ms: 200,
            max_backoff_ms: 10_000,
            ack_timeout_ms: 30_000,
            task_history: 1_000,
        }
    }
}

impl OrchestratorConfig {
    pub fn ack_timeout(&self) -> Duration {
        Duration::from_millis(self.ack_timeout_ms)
    }

    fn backoff(&self) -> ExponentialBackoff {
        let initial = Duration::from_millis(self.initial_backoff_ms);
        let mut backoff = ExponentialBackoff {
            initial_interval: initial,
            current_interval: initial,
            max_interval: Duration::from_millis(self.max_backoff_ms.max(self.initial_backoff_ms)),
            multiplier: 2.0,
            randomization_factor: 0.1,
            max_elapsed_time: None,
            ..ExponentialBackoff::default()
        };
        backoff.reset();
        backoff
    }
}

// =============================================================================
// Task Table
// =============================================================================

struct TaskEntry {
    task: Task,
    state_tx: watch::Sender<TaskState>,
    cancel: CancellationToken,
}

/// What submit hands to the runner
struct Prepared {
    target: Target,
    target_name: String,
    /// Other targets the task mutates, claimed together with `target`
    also_claims: Vec<Target>,
    context: TaskContext,
}

// =============================================================================
// Orchestrator
// =============================================================================

/// Runs operations as tasks against the registry and node agents
pub struct Orchestrator {
    pub(super) config: OrchestratorConfig,
    pub(super) registry: Arc<Registry>,
    pub(super) planner: TopologyPlanner,
    pub(super) compiler: VolfileCompiler,
    pub(super) agent: Arc<dyn NodeAgent>,
    pub(super) options: Arc<dyn OptionSource>,
    claims: Arc<TargetClaims>,
    tasks: RwLock<BTreeMap<TaskId, TaskEntry>>,
    /// Volfiles each node last acknowledged, per volume
    pub(super) acked: DashMap<(VolumeId, NodeId), NodeVolfiles>,
    /// Serializes plan-and-apply so concurrent tasks never pick the same port
    pub(super) placement: Mutex<()>,
    task_counter: AtomicU64,
    metrics: TaskMetrics,
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("config", &self.config)
            .field("agent", &self.agent.name())
            .field("claimed_targets", &self.claims.active_count())
            .finish()
    }
}

impl Orchestrator {
    /// Create a new orchestrator
    pub fn new(
        config: OrchestratorConfig,
        registry: Arc<Registry>,
        planner: TopologyPlanner,
        agent: Arc<dyn NodeAgent>,
        options: Arc<dyn OptionSource>,
    ) -> Result<Arc<Self>> {
        Ok(Arc::new(Self {
            config,
            registry,
            planner,
            compiler: VolfileCompiler::new(),
            agent,
            options,
            claims: TargetClaims::new(),
            tasks: RwLock::new(BTreeMap::new()),
            acked: DashMap::new(),
            placement: Mutex::new(()),
            task_counter: AtomicU64::new(0),
            metrics: TaskMetrics::new()?,
        }))
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn planner(&self) -> &TopologyPlanner {
        &self.planner
    }

    pub fn compiler(&self) -> &VolfileCompiler {
        &self.compiler
    }

    pub fn agent(&self) -> &Arc<dyn NodeAgent> {
        &self.agent
    }

    pub fn options(&self) -> &Arc<dyn OptionSource> {
        &self.options
    }

    pub fn metrics(&self) -> &TaskMetrics {
        &self.metrics
    }

    fn next_task_id(&self) -> TaskId {
        let n = self.task_counter.fetch_add(1, Ordering::Relaxed) + 1;
        TaskId::new(format!("task-{:016x}", n))
    }

    // =========================================================================
    // Submit
    // =========================================================================

    /// Validate an operation and start it as a task.
    ///
    /// Validation and planning errors return here and leave no records
    /// behind. A target that already has an active task is a conflict.
    pub fn submit(self: &Arc<Self>, operation: Operation) -> Result<Task> {
        let kind = operation.kind();
        let prepared = self.prepare(operation)?;

        let task_id = self.next_task_id();
        let mut targets = vec![prepared.target.clone()];
        targets.extend(prepared.also_claims.iter().cloned());
        let guard = self.claims.claim_all(&targets, &task_id)?;

        let task = Task::new(
            task_id.clone(),
            kind,
            prepared.target.clone(),
            prepared.target_name.clone(),
        );
        let (state_tx, _) = watch::channel(TaskState::Pending);
        let cancel = prepared.context.cancel.clone();
        self.tasks.write().insert(
            task_id.clone(),
            TaskEntry {
                task: task.clone(),
                state_tx,
                cancel,
            },
        );
        self.metrics.task_submitted(kind);
        info!(
            task = %task_id,
            operation = %kind,
            target = %prepared.target,
            name = %prepared.target_name,
            "Task submitted"
        );

        let span = info_span!("task", task = %task_id, operation = %kind);
        let this = Arc::clone(self);
        tokio::spawn(
            async move { this.run(task_id, prepared.context, guard).await }.instrument(span),
        );

        Ok(task)
    }

    /// Submit-time validation and dry-run planning per operation
    fn prepare(&self, operation: Operation) -> Result<Prepared> {
        let registry = &self.registry;
        match &operation {
            Operation::CreateVolume { spec } => {
                spec.validate()?;
                if registry.find_volume(&spec.name).is_ok() {
                    return Err(Error::conflict(format!("volume {} already exists", spec.name)));
                }
                self.planner.plan(spec, &registry.snapshot())?;

                let volume = registry.create_volume(spec)?;
                Ok(Prepared {
                    target: Target::Volume(volume.id.clone()),
                    target_name: volume.name,
                    also_claims: Vec::new(),
                    context: TaskContext::for_volume(operation, volume.id),
                })
            }
            Operation::ExpandVolume {
                volume,
                add_subvolumes,
            } => {
                let vol = registry.find_volume(volume)?;
                require_state(
                    &vol.name,
                    vol.state,
                    &[VolumeState::Created, VolumeState::Started, VolumeState::Stopped],
                    "expand",
                )?;
                if *add_subvolumes == 0 {
                    return Err(Error::Validation(
                        "expansion must add at least one subvolume".into(),
                    ));
                }
                self.planner
                    .plan_expansion(&vol, &registry.snapshot(), *add_subvolumes)?;
                Ok(volume_target(operation.clone(), vol.id, vol.name))
            }
            Operation::StartVolume { volume } => {
                let vol = registry.find_volume(volume)?;
                require_state(
                    &vol.name,
                    vol.state,
                    &[VolumeState::Created, VolumeState::Stopped],
                    "start",
                )?;
                Ok(volume_target(operation.clone(), vol.id, vol.name))
            }
            Operation::StopVolume { volume } => {
                let vol = registry.find_volume(volume)?;
                require_state(
                    &vol.name,
                    vol.state,
                    &[VolumeState::Started, VolumeState::Stopping],
                    "stop",
                )?;
                Ok(volume_target(operation.clone(), vol.id, vol.name))
            }
            Operation::DeleteVolume { volume } => {
                let vol = registry.find_volume(volume)?;
                require_state(
                    &vol.name,
                    vol.state,
                    &[
                        VolumeState::Creating,
                        VolumeState::Created,
                        VolumeState::Stopped,
                        VolumeState::Deleting,
                    ],
                    "delete",
                )?;
                Ok(volume_target(operation.clone(), vol.id, vol.name))
            }
            Operation::RebalanceVolume { volume } => {
                let vol = registry.find_volume(volume)?;
                require_state(&vol.name, vol.state, &[VolumeState::Started], "rebalance")?;
                if vol.distribute_count < 2 {
                    return Err(Error::Validation(format!(
                        "volume {} has a single subvolume; nothing to rebalance",
                        vol.name
                    )));
                }
                Ok(volume_target(operation.clone(), vol.id, vol.name))
            }
            Operation::AddNode {
                hostname,
                capacity_bytes,
                fault_domain,
            } => {
                validate_hostname(hostname)?;
                if *capacity_bytes == 0 {
                    return Err(Error::Validation("node capacity must be positive".into()));
                }
                if registry.find_node(hostname).is_some() {
                    return Err(Error::conflict(format!("node {} already exists", hostname)));
                }
                let node = registry.add_node(hostname, *capacity_bytes, fault_domain.clone())?;
                Ok(Prepared {
                    target: Target::Node(node.id.clone()),
                    target_name: node.hostname,
                    also_claims: Vec::new(),
                    context: TaskContext::for_node(operation, node.id),
                })
            }
            Operation::RemoveNode { node } => {
                let found = self.resolve_node(node)?;
                let replacements = self.plan_node_replacements(&found.id)?;
                let volumes: BTreeSet<VolumeId> = replacements
                    .into_iter()
                    .map(|(brick, _)| brick.volume_id)
                    .collect();
                Ok(Prepared {
                    target: Target::Node(found.id.clone()),
                    target_name: found.hostname,
                    also_claims: volumes.into_iter().map(Target::Volume).collect(),
                    context: TaskContext::for_node(operation, found.id),
                })
            }
        }
    }

    /// Look a node up by id, then by hostname
    pub fn resolve_node(&self, node: &str) -> Result<crate::domain::Node> {
        self.registry
            .get_node(&NodeId::new(node))
            .or_else(|_| {
                self.registry
                    .find_node(node)
                    .ok_or_else(|| Error::not_found("node", node))
            })
    }

    /// Dry-run replacements for every brick on `node_id`, reserving each
    /// chosen port before planning the next
    pub(super) fn plan_node_replacements(
        &self,
        node_id: &NodeId,
    ) -> Result<Vec<(Brick, crate::topology::PlannedBrick)>> {
        let mut snapshot: TopologySnapshot = self.registry.snapshot();
        let mut bricks = self.registry.node_bricks(node_id)?;
        bricks.sort_by(|a, b| (&a.volume_id, a.index).cmp(&(&b.volume_id, b.index)));

        let mut planned = Vec::with_capacity(bricks.len());
        for brick in bricks {
            let volume = self.registry.get_volume(&brick.volume_id)?;
            let target = self
                .planner
                .plan_replacement(&volume, &brick, &snapshot, node_id)?;
            if let Some(entry) = snapshot.bricks.iter_mut().find(|b| b.id == brick.id) {
                entry.node_id = target.node_id.clone();
                entry.port = target.port;
                entry.path = target.path.clone();
            }
            planned.push((brick, target));
        }
        Ok(planned)
    }

    // =========================================================================
    // Execution
    // =========================================================================

    async fn run(self: Arc<Self>, task_id: TaskId, mut ctx: TaskContext, guard: ClaimGuard) {
        let kind = ctx.operation.kind();
        self.update_task(&task_id, |task| {
            task.state = TaskState::Running;
            task.started_at = Some(chrono::Utc::now());
        });
        self.notify(&task_id, TaskState::Running);
        info!("Task running");

        let mut outcome: std::result::Result<(), (usize, Step, Error)> = Ok(());
        for (index, &step) in kind.steps().iter().enumerate() {
            if ctx.cancel.is_cancelled() {
                outcome = Err((index, step, Error::Cancelled));
                break;
            }
            if let Err(e) = self.run_step(&task_id, &mut ctx, index, step).await {
                outcome = Err((index, step, e));
                break;
            }
        }

        let state = match outcome {
            Ok(()) => {
                info!("Task succeeded");
                self.update_task(&task_id, |task| {
                    task.state = TaskState::Succeeded;
                    task.finished_at = Some(chrono::Utc::now());
                });
                TaskState::Succeeded
            }
            Err((step_index, step, e)) => {
                error!(step = %step, step_index, error = %e, "Task failed");
                let failure = TaskFailure {
                    step_index,
                    step,
                    kind: e.kind(),
                    message: e.to_string(),
                };
                self.update_task(&task_id, |task| {
                    task.state = TaskState::Failed;
                    task.failure = Some(failure);
                    task.finished_at = Some(chrono::Utc::now());
                });
                TaskState::Failed
            }
        };
        self.metrics.task_finished(kind, state);

        // Terminal state is recorded before the targets are released, and
        // waiters wake only once they are free.
        drop(guard);
        self.notify(&task_id, state);
        self.prune_history();
    }

    /// Run one step, retrying transient failures
    pub(super) async fn run_step(
        &self,
        task_id: &TaskId,
        ctx: &mut TaskContext,
        index: usize,
        step: Step,
    ) -> Result<()> {
        let mut backoff = self.config.backoff();
        let max_attempts = self.config.max_step_attempts.max(1);
        let mut attempt = 0;

        loop {
            attempt += 1;
            self.update_task(task_id, |task| {
                let record = &mut task.steps[index];
                record.state = StepState::Running;
                record.attempts = attempt;
            });
            debug!(step = %step, attempt, "Running step");

            match self.execute_step(ctx, step).await {
                Ok(()) => {
                    self.update_task(task_id, |task| {
                        task.steps[index].state = StepState::Succeeded;
                    });
                    debug!(step = %step, attempt, "Step succeeded");
                    return Ok(());
                }
                Err(e) => {
                    let message = e.to_string();
                    let retry = e.is_retryable() && attempt < max_attempts;
                    self.update_task(task_id, |task| {
                        let record = &mut task.steps[index];
                        record.error = Some(message);
                        if !retry {
                            record.state = StepState::Failed;
                        }
                    });
                    if !retry {
                        return Err(e);
                    }

                    let delay = backoff
                        .next_backoff()
                        .unwrap_or_else(|| Duration::from_millis(self.config.max_backoff_ms));
                    self.metrics.step_retried(step.as_str());
                    warn!(step = %step, attempt, ?delay, error = %e, "Step failed, retrying");

                    tokio::select! {
                        _ = ctx.cancel.cancelled() => {
                            self.update_task(task_id, |task| {
                                task.steps[index].state = StepState::Failed;
                            });
                            return Err(Error::Cancelled);
                        }
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
    }

    /// Bound an agent call by the acknowledgment timeout
    pub(super) async fn ack<T, F>(&self, hostname: &str, operation: &str, call: F) -> Result<T>
    where
        F: std::future::Future<Output = Result<T>>,
    {
        let timeout = self.config.ack_timeout();
        match tokio::time::timeout(timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(Error::ExternalTimeout {
                node: hostname.to_string(),
                operation: operation.to_string(),
                timeout,
            }),
        }
    }

    fn update_task(&self, task_id: &TaskId, f: impl FnOnce(&mut Task)) {
        if let Some(entry) = self.tasks.write().get_mut(task_id) {
            f(&mut entry.task);
        }
    }

    fn notify(&self, task_id: &TaskId, state: TaskState) {
        if let Some(entry) = self.tasks.read().get(task_id) {
            entry.state_tx.send_replace(state);
        }
    }

    /// Drop the oldest finished tasks beyond the history limit
    fn prune_history(&self) {
        let mut tasks = self.tasks.write();
        let finished: Vec<TaskId> = tasks
            .iter()
            .filter(|(_, e)| e.task.state.is_terminal())
            .map(|(id, _)| id.clone())
            .collect();
        let excess = finished.len().saturating_sub(self.config.task_history);
        for id in finished.into_iter().take(excess) {
            tasks.remove(&id);
        }
    }

    // =========================================================================
    // Queries & Control
    // =========================================================================

    pub fn get_task(&self, task_id: &TaskId) -> Result<Task> {
        self.tasks
            .read()
            .get(task_id)
            .map(|e| e.task.clone())
            .ok_or_else(|| Error::not_found("task", task_id))
    }

    /// All known tasks, oldest first
    pub fn list_tasks(&self) -> Vec<Task> {
        self.tasks.read().values().map(|e| e.task.clone()).collect()
    }

    /// The task holding `target`, if any
    pub fn active_task(&self, target: &Target) -> Option<Task> {
        let task_id = self.claims.holder(target)?;
        self.get_task(&task_id).ok()
    }

    /// Request cooperative cancellation; takes effect between steps
    pub fn cancel(&self, task_id: &TaskId) -> Result<Task> {
        let tasks = self.tasks.read();
        let entry = tasks
            .get(task_id)
            .ok_or_else(|| Error::not_found("task", task_id))?;
        if entry.task.state.is_terminal() {
            return Err(Error::conflict(format!(
                "task {} already {}",
                task_id, entry.task.state
            )));
        }
        entry.cancel.cancel();
        info!(task = %task_id, "Task cancellation requested");
        Ok(entry.task.clone())
    }

    /// Resolve once the task is terminal
    pub async fn wait(&self, task_id: &TaskId) -> Result<Task> {
        let mut rx = {
            let tasks = self.tasks.read();
            let entry = tasks
                .get(task_id)
                .ok_or_else(|| Error::not_found("task", task_id))?;
            entry.state_tx.subscribe()
        };
        rx.wait_for(|state| state.is_terminal())
            .await
            .map_err(|_| Error::Internal(format!("task {} dropped while waiting", task_id)))?;
        self.get_task(task_id)
    }
}

// =============================================================================
// Brick Health
// =============================================================================

impl Orchestrator {
    /// Ask each online node which brick daemons exited on their own and mark
    /// those bricks offline. Returns how many bricks changed.
    ///
    /// Nothing is relaunched here; a stop and start of the volume brings the
    /// brick back.
    pub async fn sweep_exited_bricks(&self) -> usize {
        let mut marked = 0;
        for node in self.registry.online_nodes() {
            let exited = match self
                .ack(&node.hostname, "exited-bricks", self.agent.exited_bricks(&node))
                .await
            {
                Ok(exited) if exited.is_empty() => continue,
                Ok(exited) => exited,
                Err(e) => {
                    debug!(node = %node.hostname, error = %e, "Could not collect exited bricks");
                    continue;
                }
            };
            let Ok(bricks) = self.registry.node_bricks(&node.id) else {
                continue;
            };

            for brick in bricks.iter().filter(|b| b.status == BrickStatus::Online) {
                let name = process_name(&node.hostname, &brick.path);
                if !exited.contains(&name) {
                    continue;
                }
                match self.registry.set_brick_status(&brick.id, BrickStatus::Offline) {
                    Ok(_) => {
                        warn!(
                            node = %node.hostname,
                            brick = %brick.id,
                            volume = %brick.volume_id,
                            "Brick daemon exited, marked offline"
                        );
                        marked += 1;
                    }
                    Err(e) => debug!(brick = %brick.id, error = %e, "Brick went away during sweep"),
                }
            }
        }
        marked
    }
}

// =============================================================================
// Helpers
// =============================================================================

fn volume_target(operation: Operation, volume_id: VolumeId, name: String) -> Prepared {
    Prepared {
        target: Target::Volume(volume_id.clone()),
        target_name: name,
        also_claims: Vec::new(),
        context: TaskContext::for_volume(operation, volume_id),
    }
}

fn require_state(
    name: &str,
    state: VolumeState,
    allowed: &[VolumeState],
    action: &str,
) -> Result<()> {
    if allowed.contains(&state) {
        return Ok(());
    }
    Err(Error::Validation(format!(
        "cannot {} volume {} in state {}",
        action, name, state
    )))
}

fn validate_hostname(hostname: &str) -> Result<()> {
    if hostname.is_empty()
        || hostname.len() > 253
        || !hostname
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '.' || c == '_')
    {
        return Err(Error::Validation(format!("invalid hostname {:?}", hostname)));
    }
    // Hostnames share the volume name charset apart from dots.
    hostname.split('.').try_for_each(|label| {
        if label.is_empty() {
            Err(Error::Validation(format!("invalid hostname {:?}", hostname)))
        } else {
            validate_name(label)
        }
    })
}
