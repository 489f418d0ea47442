//! API Module
//!
//! REST surface over the orchestrator: volume and node operations submit
//! tasks, task endpoints report their progress.

pub mod rest;
pub mod server;

pub use rest::*;
pub use server::*;
