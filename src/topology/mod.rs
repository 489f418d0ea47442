//! Topology Module
//!
//! Pure brick placement: replica-set aware node selection and per-node port
//! assignment over a registry snapshot.

pub mod planner;
pub mod policy;

pub use planner::*;
pub use policy::*;
