//! Node Agent Module
//!
//! Implementations of the [`NodeAgent`](crate::domain::NodeAgent) port: a
//! filesystem-backed agent that supervises launcher processes, and an
//! in-memory agent.

pub mod local;
pub mod memory;
pub mod supervisor;

pub use local::{AgentConfig, LocalNodeAgent};
pub use memory::{AgentCall, AgentOp, FaultKind, MemoryNodeAgent};
pub use supervisor::{BrickSupervisor, SupervisorConfig};
