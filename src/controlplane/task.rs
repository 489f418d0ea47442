//! Task model
//!
//! Operations, the ordered steps each one runs, and the per-task record the
//! orchestrator keeps (state, step log, failure).

use crate::domain::{NodeId, TaskId, VolumeId, VolumeSpec};
use crate::error::ErrorKind;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

// =============================================================================
// Operations
// =============================================================================

/// A user-requested change, validated at submit
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "operation", rename_all = "kebab-case")]
pub enum Operation {
    CreateVolume {
        #[serde(flatten)]
        spec: VolumeSpec,
    },
    ExpandVolume {
        volume: String,
        /// Replica (or disperse) sets to add
        add_subvolumes: u32,
    },
    StartVolume {
        volume: String,
    },
    StopVolume {
        volume: String,
    },
    DeleteVolume {
        volume: String,
    },
    RebalanceVolume {
        volume: String,
    },
    AddNode {
        hostname: String,
        capacity_bytes: u64,
        #[serde(default)]
        fault_domain: Option<String>,
    },
    RemoveNode {
        /// Node id or hostname
        node: String,
    },
}

impl Operation {
    pub fn kind(&self) -> OperationKind {
        match self {
            Operation::CreateVolume { .. } => OperationKind::CreateVolume,
            Operation::ExpandVolume { .. } => OperationKind::ExpandVolume,
            Operation::StartVolume { .. } => OperationKind::StartVolume,
            Operation::StopVolume { .. } => OperationKind::StopVolume,
            Operation::DeleteVolume { .. } => OperationKind::DeleteVolume,
            Operation::RebalanceVolume { .. } => OperationKind::RebalanceVolume,
            Operation::AddNode { .. } => OperationKind::AddNode,
            Operation::RemoveNode { .. } => OperationKind::RemoveNode,
        }
    }
}

/// Operation without its arguments
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OperationKind {
    CreateVolume,
    ExpandVolume,
    StartVolume,
    StopVolume,
    DeleteVolume,
    RebalanceVolume,
    AddNode,
    RemoveNode,
}

impl OperationKind {
    /// Steps run, in order
    pub fn steps(self) -> &'static [Step] {
        use Step::*;
        match self {
            OperationKind::CreateVolume => &[
                PlanTopology,
                CreateBricks,
                CompileVolfiles,
                PublishVolfiles,
                MarkCreated,
            ],
            OperationKind::ExpandVolume => &[
                PlanExpansion,
                CreateBricks,
                CompileVolfiles,
                PublishVolfiles,
                LaunchBricks,
            ],
            OperationKind::StartVolume => &[
                CompileVolfiles,
                PublishVolfiles,
                LaunchBricks,
                MarkStarted,
            ],
            OperationKind::StopVolume => &[MarkStopping, StopBricks, MarkStopped],
            OperationKind::DeleteVolume => {
                &[MarkDeleting, RetireVolfiles, ReleaseBricks, DeleteVolume]
            }
            OperationKind::RebalanceVolume => {
                &[CompileVolfiles, PublishVolfiles, TriggerRebalance]
            }
            OperationKind::AddNode => &[ProbeNode, MarkNodeOnline],
            OperationKind::RemoveNode => &[
                DrainNode,
                ReplaceBricks,
                CompileVolfiles,
                PublishVolfiles,
                LaunchBricks,
                RemoveNode,
            ],
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            OperationKind::CreateVolume => "create-volume",
            OperationKind::ExpandVolume => "expand-volume",
            OperationKind::StartVolume => "start-volume",
            OperationKind::StopVolume => "stop-volume",
            OperationKind::DeleteVolume => "delete-volume",
            OperationKind::RebalanceVolume => "rebalance-volume",
            OperationKind::AddNode => "add-node",
            OperationKind::RemoveNode => "remove-node",
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One idempotent unit of work inside a task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Step {
    PlanTopology,
    PlanExpansion,
    CreateBricks,
    CompileVolfiles,
    PublishVolfiles,
    LaunchBricks,
    StopBricks,
    TriggerRebalance,
    MarkCreated,
    MarkStarted,
    MarkStopping,
    MarkStopped,
    MarkDeleting,
    RetireVolfiles,
    ReleaseBricks,
    DeleteVolume,
    ProbeNode,
    MarkNodeOnline,
    DrainNode,
    ReplaceBricks,
    RemoveNode,
}

impl Step {
    pub fn as_str(self) -> &'static str {
        match self {
            Step::PlanTopology => "plan-topology",
            Step::PlanExpansion => "plan-expansion",
            Step::CreateBricks => "create-bricks",
            Step::CompileVolfiles => "compile-volfiles",
            Step::PublishVolfiles => "publish-volfiles",
            Step::LaunchBricks => "launch-bricks",
            Step::StopBricks => "stop-bricks",
            Step::TriggerRebalance => "trigger-rebalance",
            Step::MarkCreated => "mark-created",
            Step::MarkStarted => "mark-started",
            Step::MarkStopping => "mark-stopping",
            Step::MarkStopped => "mark-stopped",
            Step::MarkDeleting => "mark-deleting",
            Step::RetireVolfiles => "retire-volfiles",
            Step::ReleaseBricks => "release-bricks",
            Step::DeleteVolume => "delete-volume",
            Step::ProbeNode => "probe-node",
            Step::MarkNodeOnline => "mark-node-online",
            Step::DrainNode => "drain-node",
            Step::ReplaceBricks => "replace-bricks",
            Step::RemoveNode => "remove-node",
        }
    }
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Targets
// =============================================================================

/// What a task mutates; at most one active task per target
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum Target {
    Volume(VolumeId),
    Node(NodeId),
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Target::Volume(id) => write!(f, "volume/{}", id),
            Target::Node(id) => write!(f, "node/{}", id),
        }
    }
}

// =============================================================================
// Task Record
// =============================================================================

/// Task lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Pending,
    Running,
    Succeeded,
    Failed,
}

impl TaskState {
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskState::Succeeded | TaskState::Failed)
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TaskState::Pending => "pending",
            TaskState::Running => "running",
            TaskState::Succeeded => "succeeded",
            TaskState::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Progress of one step
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepState {
    Pending,
    Running,
    Succeeded,
    Failed,
}

/// Step log entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepRecord {
    pub step: Step,
    pub state: StepState,
    pub attempts: u32,
    /// Last error seen, including ones that were retried
    pub error: Option<String>,
}

/// Where and why a task failed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskFailure {
    pub step_index: usize,
    pub step: Step,
    pub kind: ErrorKind,
    pub message: String,
}

/// A submitted operation and its progress
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub operation: OperationKind,
    pub target: Target,
    /// Volume name or node hostname
    pub target_name: String,
    pub state: TaskState,
    pub steps: Vec<StepRecord>,
    pub failure: Option<TaskFailure>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl Task {
    pub fn new(id: TaskId, operation: OperationKind, target: Target, target_name: String) -> Self {
        Self {
            id,
            operation,
            target,
            target_name,
            state: TaskState::Pending,
            steps: operation
                .steps()
                .iter()
                .map(|&step| StepRecord {
                    step,
                    state: StepState::Pending,
                    attempts: 0,
                    error: None,
                })
                .collect(),
            failure: None,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
        }
    }

    pub fn step(&self, step: Step) -> Option<&StepRecord> {
        self.steps.iter().find(|r| r.step == step)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::VolumeType;

    #[test]
    fn test_operation_wire_format() {
        let op: Operation = serde_json::from_str(
            r#"{"operation":"create-volume","name":"gv0","volume_type":"replicate","replica_count":3,"capacity_bytes":1024}"#,
        )
        .unwrap();
        match &op {
            Operation::CreateVolume { spec } => {
                assert_eq!(spec.volume_type, VolumeType::Replicate);
                assert_eq!(spec.replica_count, 3);
                assert_eq!(spec.distribute_count, 1);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(op.kind(), OperationKind::CreateVolume);

        let op: Operation =
            serde_json::from_str(r#"{"operation":"remove-node","node":"h1"}"#).unwrap();
        assert_eq!(op.kind(), OperationKind::RemoveNode);
    }

    #[test]
    fn test_task_starts_with_pending_steps() {
        let task = Task::new(
            TaskId::new("task-1"),
            OperationKind::StartVolume,
            Target::Volume(VolumeId::new("volume-1")),
            "gv0".into(),
        );
        assert_eq!(task.state, TaskState::Pending);
        let names: Vec<&str> = task.steps.iter().map(|s| s.step.as_str()).collect();
        assert_eq!(
            names,
            vec!["compile-volfiles", "publish-volfiles", "launch-bricks", "mark-started"]
        );
        assert!(task.steps.iter().all(|s| s.state == StepState::Pending));
    }

    #[test]
    fn test_target_display() {
        assert_eq!(
            Target::Node(NodeId::new("node-1")).to_string(),
            "node/node-1"
        );
    }
}
