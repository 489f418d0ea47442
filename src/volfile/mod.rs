//! Volfile Module
//!
//! Translator-graph generation for servers and clients, the brick launch
//! configuration schema, and the on-disk layout both are published under.

pub mod compiler;
pub mod graph;
pub mod launch;

pub use compiler::{CompiledVolfiles, VolfileCompiler};
pub use launch::{process_name, sanitize_path, BrickLaunchConfig, LaunchNode, LaunchVolume};

use std::path::PathBuf;

/// Directory holding a volume's artifacts, relative to an agent work dir
pub fn volume_dir(volume: &str) -> PathBuf {
    PathBuf::from("vols").join(volume)
}

/// `vols/<volume>/<volume>.<hostname>.vol`
pub fn server_volfile_path(volume: &str, hostname: &str) -> PathBuf {
    volume_dir(volume).join(format!("{}.{}.vol", volume, hostname))
}

/// `vols/<volume>/<volume>.client.vol`
pub fn client_volfile_path(volume: &str) -> PathBuf {
    volume_dir(volume).join(format!("{}.client.vol", volume))
}

/// `vols/<volume>/bricks/<hostname>:<sanitized-path>.json`
pub fn launch_config_path(volume: &str, launch_name: &str) -> PathBuf {
    volume_dir(volume)
        .join("bricks")
        .join(format!("{}.json", launch_name))
}
