//! Domain layer - Core records and port definitions
//!
//! This module defines the records the registry owns and the traits (ports)
//! that external collaborators implement, following hexagonal architecture
//! principles.

pub mod ports;
pub mod types;

pub use ports::*;
pub use types::*;
