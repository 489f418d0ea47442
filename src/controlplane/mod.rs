//! Control Plane Module
//!
//! The task orchestrator that turns volume and node operations into ordered,
//! retried steps against the registry, the topology planner, the volfile
//! compiler and the node agents.

pub mod api;
pub mod claim;
pub mod metrics;
pub mod orchestrator;
mod steps;
pub mod task;

pub use api::*;
pub use claim::{ClaimGuard, TargetClaims};
pub use metrics::TaskMetrics;
pub use orchestrator::*;
pub use task::*;
