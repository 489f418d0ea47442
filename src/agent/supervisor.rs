//! Brick Supervisor
//!
//! Runs the brick launcher as a child process per brick and reports when it
//! is ready. A child still alive after the readiness grace period, or one
//! that exits 0 (a launcher that daemonizes, or found the brick already
//! running), counts as ready. A child that exits non-zero is relaunched up
//! to `max_restarts` times before the launch fails. Restarts stop once a
//! child is ready; a ready child that later exits is only collected by
//! [`BrickSupervisor::reap`], and the caller decides what to do about it.

use crate::domain::LaunchOutcome;
use crate::error::{Error, Result};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

// =============================================================================
// Configuration
// =============================================================================

/// Launcher invocation and restart policy
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    /// Launcher program; invoked as `<launcher> <args..> <config.json>`
    pub launcher: String,
    pub args: Vec<String>,
    /// How long a child must stay up to count as ready
    pub ready_grace_ms: u64,
    /// Relaunches after a non-zero exit
    pub max_restarts: u32,
    pub restart_delay_ms: u64,
    /// Wait for a stopped child to exit before giving up on it
    pub stop_timeout_ms: u64,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            launcher: "brick-launcher".to_string(),
            args: Vec::new(),
            ready_grace_ms: 500,
            max_restarts: 2,
            restart_delay_ms: 200,
            stop_timeout_ms: 5_000,
        }
    }
}

impl SupervisorConfig {
    fn ready_grace(&self) -> Duration {
        Duration::from_millis(self.ready_grace_ms)
    }

    fn restart_delay(&self) -> Duration {
        Duration::from_millis(self.restart_delay_ms)
    }

    fn stop_timeout(&self) -> Duration {
        Duration::from_millis(self.stop_timeout_ms)
    }
}

// =============================================================================
// Supervisor
// =============================================================================

/// Tracks one launcher child per brick name
#[derive(Debug)]
pub struct BrickSupervisor {
    config: SupervisorConfig,
    children: Mutex<HashMap<String, Child>>,
}

impl BrickSupervisor {
    pub fn new(config: SupervisorConfig) -> Self {
        Self {
            config,
            children: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.config
    }

    /// Whether the named brick has a live child; reaps exited ones
    pub fn is_running(&self, name: &str) -> bool {
        let mut children = self.children.lock();
        match children.get_mut(name).map(|child| child.try_wait()) {
            Some(Ok(None)) => true,
            Some(_) => {
                children.remove(name);
                false
            }
            None => false,
        }
    }

    /// Names of tracked bricks; an exited child stays until reaped
    pub fn running(&self) -> Vec<String> {
        let children = self.children.lock();
        let mut names: Vec<String> = children.keys().cloned().collect();
        names.sort();
        names
    }

    /// Remove and return the bricks named with `prefix` whose child exited
    /// after it was ready
    pub fn reap(&self, prefix: &str) -> Vec<String> {
        let mut children = self.children.lock();
        let mut exited = Vec::new();
        children.retain(|name, child| {
            if !name.starts_with(prefix) {
                return true;
            }
            match child.try_wait() {
                Ok(None) => true,
                Ok(Some(status)) => {
                    warn!(brick = %name, %status, "Brick child exited");
                    exited.push(name.clone());
                    false
                }
                Err(e) => {
                    warn!(brick = %name, error = %e, "Lost track of brick child");
                    exited.push(name.clone());
                    false
                }
            }
        });
        exited.sort();
        exited
    }

    /// Launch the brick described by `config_path`
    pub async fn launch(&self, name: &str, config_path: &Path) -> Result<LaunchOutcome> {
        if self.is_running(name) {
            debug!(brick = %name, "Brick child already running");
            return Ok(LaunchOutcome::AlreadyRunning);
        }

        let mut attempt = 0;
        loop {
            attempt += 1;
            let mut child = self.spawn(name, config_path)?;

            let waited = tokio::time::timeout(self.config.ready_grace(), child.wait()).await;
            match waited {
                Err(_) => {
                    info!(brick = %name, pid = ?child.id(), attempt, "Brick ready");
                    self.children.lock().insert(name.to_string(), child);
                    return Ok(LaunchOutcome::Ready);
                }
                Ok(Ok(status)) if status.success() => {
                    info!(brick = %name, attempt, "Launcher exited cleanly");
                    return Ok(LaunchOutcome::Ready);
                }
                Ok(Ok(status)) => {
                    if attempt > self.config.max_restarts {
                        return Err(Error::Launcher {
                            brick: name.to_string(),
                            reason: format!("exited with {} after {} attempts", status, attempt),
                        });
                    }
                    warn!(brick = %name, %status, attempt, "Launcher crashed, restarting");
                    tokio::time::sleep(self.config.restart_delay()).await;
                }
                Ok(Err(e)) => return Err(Error::Io(e)),
            }
        }
    }

    fn spawn(&self, name: &str, config_path: &Path) -> Result<Child> {
        Command::new(&self.config.launcher)
            .args(&self.config.args)
            .arg(config_path)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Error::Launcher {
                brick: name.to_string(),
                reason: format!("failed to spawn {}: {}", self.config.launcher, e),
            })
    }

    /// Stop the named brick's child; returns whether one was running
    pub async fn stop(&self, name: &str) -> Result<bool> {
        let child = self.children.lock().remove(name);
        let Some(mut child) = child else {
            return Ok(false);
        };
        if let Ok(Some(_)) = child.try_wait() {
            return Ok(false);
        }

        child.start_kill()?;
        let waited = tokio::time::timeout(self.config.stop_timeout(), child.wait()).await;
        match waited {
            Ok(status) => {
                debug!(brick = %name, status = ?status.ok(), "Brick child stopped");
                Ok(true)
            }
            Err(_) => Err(Error::Launcher {
                brick: name.to_string(),
                reason: "child did not exit after kill".into(),
            }),
        }
    }

    /// Kill every child
    pub async fn shutdown(&self) {
        let names: Vec<String> = self.children.lock().keys().cloned().collect();
        for name in names {
            if let Err(e) = self.stop(&name).await {
                warn!(brick = %name, error = %e, "Failed to stop brick during shutdown");
            }
        }
    }
}
