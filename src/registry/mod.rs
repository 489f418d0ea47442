//! Registry Module
//!
//! Cluster, node, volume and brick records with referentially-checked atomic
//! mutations, plus the in-memory volume option store.

pub mod events;
pub mod options;
pub mod store;

pub use events::*;
pub use options::*;
pub use store::*;
