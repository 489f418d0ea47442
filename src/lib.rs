//! Brick Control Plane
//!
//! Control plane for a brick-based distributed filesystem: tracks nodes,
//! volumes and bricks, places bricks across nodes, runs multi-step cluster
//! operations as serialized, retried tasks, and compiles the topology into
//! the volfiles and launch configurations node agents consume.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────┐
//! │                         REST API (axum)                             │
//! ├─────────────────────────────────────────────────────────────────────┤
//! │                      Task Orchestrator                              │
//! │   submit → validate + dry-run plan → claim target → run steps      │
//! ├───────────────────┬───────────────────┬─────────────────────────────┤
//! │  Topology Planner │  Volfile Compiler │       Node Agent port       │
//! │  (pure placement) │  (deterministic)  │  (local fs + supervisor)    │
//! ├───────────────────┴───────────────────┴─────────────────────────────┤
//! │                Registry (nodes, volumes, bricks)                    │
//! └─────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - [`registry`]: Cluster, node, volume and brick records
//! - [`topology`]: Brick placement
//! - [`controlplane`]: Task orchestrator and REST API
//! - [`volfile`]: Volfile and launch configuration compiler
//! - [`agent`]: Node agent implementations
//! - [`domain`]: Core records and ports
//! - [`error`]: Error types and handling

pub mod agent;
pub mod config;
pub mod controlplane;
pub mod domain;
pub mod error;
pub mod registry;
pub mod topology;
pub mod volfile;

// Re-export commonly used types
pub use agent::{AgentConfig, LocalNodeAgent, MemoryNodeAgent, SupervisorConfig};

pub use config::ControlPlaneConfig;

pub use controlplane::{
    ApiServer, ApiServerConfig, Operation, Orchestrator, OrchestratorConfig, Target, Task,
    TaskState,
};

pub use domain::{
    Brick, BrickStatus, Node, NodeAgent, NodeStatus, OptionSource, Volume, VolumeSpec,
    VolumeState, VolumeType,
};

pub use error::{Error, ErrorAction, ErrorKind, Result};

pub use registry::{MemoryOptions, Registry, RegistryEvent};

pub use topology::{PlacementPlan, PlannerConfig, TopologyPlanner};

pub use volfile::{BrickLaunchConfig, CompiledVolfiles, VolfileCompiler};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
