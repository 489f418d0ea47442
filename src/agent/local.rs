//! Local Node Agent
//!
//! Serves every node from one machine: artifacts land under a single work
//! directory (paths are keyed by hostname, so nodes never collide) and bricks
//! run as children of a [`BrickSupervisor`].

use super::supervisor::{BrickSupervisor, SupervisorConfig};
use crate::domain::{LaunchOutcome, Node, NodeAgent, NodeVolfiles};
use crate::error::{Error, Result};
use crate::volfile::{
    client_volfile_path, launch_config_path, server_volfile_path, volume_dir, BrickLaunchConfig,
};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, info, instrument};

/// Local agent configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Root for published volfiles and launch configs
    pub work_dir: PathBuf,
    pub supervisor: SupervisorConfig,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            work_dir: PathBuf::from("/var/lib/brick-control-plane"),
            supervisor: SupervisorConfig::default(),
        }
    }
}

/// Node agent writing to the local filesystem
#[derive(Debug)]
pub struct LocalNodeAgent {
    work_dir: PathBuf,
    supervisor: BrickSupervisor,
    tmp_counter: AtomicU64,
}

impl LocalNodeAgent {
    pub fn new(config: AgentConfig) -> Self {
        Self {
            work_dir: config.work_dir,
            supervisor: BrickSupervisor::new(config.supervisor),
            tmp_counter: AtomicU64::new(0),
        }
    }

    pub fn work_dir(&self) -> &Path {
        &self.work_dir
    }

    pub fn supervisor(&self) -> &BrickSupervisor {
        &self.supervisor
    }

    /// Write via a temp file and rename so readers never see a partial file
    async fn write_file(&self, relative: &Path, contents: &str) -> Result<PathBuf> {
        let path = self.work_dir.join(relative);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut tmp = path.clone().into_os_string();
        tmp.push(format!(".tmp{}", self.tmp_counter.fetch_add(1, Ordering::Relaxed)));
        tokio::fs::write(&tmp, contents).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(path)
    }

    async fn remove_file(&self, relative: &Path) -> Result<()> {
        match tokio::fs::remove_file(self.work_dir.join(relative)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl NodeAgent for LocalNodeAgent {
    fn name(&self) -> &str {
        "local"
    }

    #[instrument(skip(self, node), fields(node = %node.hostname))]
    async fn probe(&self, node: &Node) -> Result<()> {
        tokio::fs::create_dir_all(&self.work_dir).await?;
        let meta = tokio::fs::metadata(&self.work_dir).await?;
        if meta.permissions().readonly() {
            return Err(Error::Configuration(format!(
                "work dir {} is read-only",
                self.work_dir.display()
            )));
        }
        debug!("Node probe succeeded");
        Ok(())
    }

    #[instrument(skip(self, node, volfiles), fields(node = %node.hostname))]
    async fn publish_volfiles(
        &self,
        node: &Node,
        volume: &str,
        volfiles: &NodeVolfiles,
    ) -> Result<()> {
        self.write_file(&server_volfile_path(volume, &node.hostname), &volfiles.server)
            .await?;
        self.write_file(&client_volfile_path(volume), &volfiles.client)
            .await?;
        info!(volume = %volume, "Published volfiles");
        Ok(())
    }

    #[instrument(skip(self, node, config), fields(node = %node.hostname, brick = %config.name))]
    async fn launch_brick(&self, node: &Node, config: &BrickLaunchConfig) -> Result<LaunchOutcome> {
        config.validate()?;
        let path = self
            .write_file(
                &launch_config_path(&config.volume.name, &config.name),
                &config.to_json()?,
            )
            .await?;
        self.supervisor.launch(&config.name, &path).await
    }

    #[instrument(skip(self, node, config), fields(node = %node.hostname, brick = %config.name))]
    async fn stop_brick(&self, node: &Node, config: &BrickLaunchConfig) -> Result<()> {
        let was_running = self.supervisor.stop(&config.name).await?;
        debug!(was_running, "Brick stopped");
        Ok(())
    }

    async fn exited_bricks(&self, node: &Node) -> Result<Vec<String>> {
        Ok(self.supervisor.reap(&format!("{}:", node.hostname)))
    }

    #[instrument(skip(self, node), fields(node = %node.hostname))]
    async fn retire_volume(&self, node: &Node, volume: &str) -> Result<()> {
        self.remove_file(&server_volfile_path(volume, &node.hostname))
            .await?;

        let bricks_dir = self.work_dir.join(volume_dir(volume)).join("bricks");
        let prefix = format!("{}:", node.hostname);
        match tokio::fs::read_dir(&bricks_dir).await {
            Ok(mut entries) => {
                while let Some(entry) = entries.next_entry().await? {
                    if entry.file_name().to_string_lossy().starts_with(&prefix) {
                        tokio::fs::remove_file(entry.path()).await?;
                    }
                }
                let _ = tokio::fs::remove_dir(&bricks_dir).await;
            }
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        // The client file is shared; the last node to retire removes it along
        // with the volume directory.
        let dir = self.work_dir.join(volume_dir(volume));
        if let Ok(mut entries) = tokio::fs::read_dir(&dir).await {
            let mut server_files = 0;
            while let Some(entry) = entries.next_entry().await? {
                let name = entry.file_name().to_string_lossy().into_owned();
                if name.ends_with(".vol") && !name.ends_with(".client.vol") {
                    server_files += 1;
                }
            }
            if server_files == 0 {
                self.remove_file(&client_volfile_path(volume)).await?;
                let _ = tokio::fs::remove_dir_all(&dir).await;
            }
        }
        info!(volume = %volume, "Retired volume artifacts");
        Ok(())
    }

    #[instrument(skip(self, node), fields(node = %node.hostname))]
    async fn rebalance(&self, node: &Node, volume: &str) -> Result<()> {
        let marker = volume_dir(volume).join(format!("rebalance.{}", node.hostname));
        self.write_file(&marker, &chrono::Utc::now().to_rfc3339())
            .await?;
        info!(volume = %volume, "Rebalance requested");
        Ok(())
    }

    async fn health_check(&self) -> Result<bool> {
        Ok(tokio::fs::metadata(&self.work_dir).await.is_ok())
    }
}
