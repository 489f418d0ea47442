//! Brick Control Plane
//!
//! Runs the registry, task orchestrator and REST API for a brick-based
//! distributed filesystem cluster.

use anyhow::Context;
use clap::{Parser, ValueEnum};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use brick_control_plane::{
    ApiServer, ControlPlaneConfig, LocalNodeAgent, MemoryNodeAgent, MemoryOptions, NodeAgent,
    Orchestrator, Registry, TopologyPlanner,
};

// =============================================================================
// CLI Arguments
// =============================================================================

/// Node agent implementation the orchestrator drives
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum AgentKind {
    /// Write volfiles under the work directory and supervise brick launchers
    Local,
    /// Keep everything in memory (no processes, no files)
    Memory,
}

/// Brick Control Plane - placement, tasks and volfiles for brick storage
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// YAML configuration file
    #[arg(short, long, env = "BCP_CONFIG")]
    config: Option<PathBuf>,

    /// Cluster name (overrides the config file)
    #[arg(long, env = "BCP_CLUSTER_NAME")]
    cluster_name: Option<String>,

    /// REST API bind address (overrides the config file)
    #[arg(long, env = "API_ADDR")]
    api_addr: Option<String>,

    /// Node agent implementation
    #[arg(long, env = "BCP_AGENT", value_enum, default_value = "local")]
    agent: AgentKind,

    /// Agent work directory (overrides the config file)
    #[arg(long, env = "BCP_WORK_DIR")]
    work_dir: Option<PathBuf>,

    /// Brick launcher program (overrides the config file)
    #[arg(long, env = "BCP_LAUNCHER")]
    launcher: Option<String>,

    /// Mark nodes offline after this many seconds without a heartbeat
    #[arg(long, env = "BCP_STALE_NODE_SECS")]
    stale_node_secs: Option<u64>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,
}

impl Args {
    /// Config file (or defaults) with command line overrides applied
    fn load_config(&self) -> anyhow::Result<ControlPlaneConfig> {
        let mut config = match &self.config {
            Some(path) => ControlPlaneConfig::load(path)
                .with_context(|| format!("loading {}", path.display()))?,
            None => ControlPlaneConfig::default(),
        };

        if let Some(name) = &self.cluster_name {
            config.cluster_name = name.clone();
        }
        if let Some(addr) = &self.api_addr {
            config.api.rest_addr = addr
                .parse()
                .with_context(|| format!("invalid REST API address {}", addr))?;
        }
        if let Some(dir) = &self.work_dir {
            config.agent.work_dir = dir.clone();
        }
        if let Some(launcher) = &self.launcher {
            config.agent.supervisor.launcher = launcher.clone();
        }
        if let Some(secs) = self.stale_node_secs {
            config.stale_node_secs = secs;
        }

        config.validate()?;
        Ok(config)
    }
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    init_logging(&args);

    let config = args.load_config()?;

    info!("Starting Brick Control Plane");
    info!("  Version: {}", brick_control_plane::VERSION);
    info!("  Cluster: {}", config.cluster_name);
    info!("  REST API: {}", config.api.rest_addr);
    info!("  Agent: {:?}", args.agent);

    let registry = Registry::new(config.cluster_name.clone());
    let options = Arc::new(MemoryOptions::new());
    options.follow(registry.subscribe());
    let agent: Arc<dyn NodeAgent> = match args.agent {
        AgentKind::Local => {
            info!("  Work dir: {}", config.agent.work_dir.display());
            tokio::fs::create_dir_all(&config.agent.work_dir)
                .await
                .with_context(|| format!("creating {}", config.agent.work_dir.display()))?;
            Arc::new(LocalNodeAgent::new(config.agent.clone()))
        }
        AgentKind::Memory => Arc::new(MemoryNodeAgent::new()),
    };

    let orchestrator = Orchestrator::new(
        config.orchestrator.clone(),
        registry.clone(),
        TopologyPlanner::new(config.planner.clone()),
        agent,
        options.clone(),
    )?;
    info!("Orchestrator initialized");

    if config.stale_node_secs > 0 {
        let registry = registry.clone();
        let max_age = config.stale_node_secs;
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(max_age.max(2) / 2));
            loop {
                interval.tick().await;
                registry.mark_stale_offline(max_age);
            }
        });
    }

    if config.brick_sweep_secs > 0 {
        let orchestrator = orchestrator.clone();
        let period = Duration::from_secs(config.brick_sweep_secs);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            loop {
                interval.tick().await;
                orchestrator.sweep_exited_bricks().await;
            }
        });
    }

    let api_server = Arc::new(ApiServer::new(config.api.clone(), orchestrator, options));
    let server = {
        let api_server = api_server.clone();
        tokio::spawn(async move { api_server.run().await })
    };

    tokio::select! {
        result = server => {
            match result {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    error!(error = %e, "API server failed");
                    return Err(e.into());
                }
                Err(e) => return Err(e.into()),
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown signal received");
            api_server.shutdown();
        }
    }

    info!("Control plane shutdown complete");
    Ok(())
}

// =============================================================================
// Logging Setup
// =============================================================================

fn init_logging(args: &Args) {
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let default_directives = format!(
        "{},hyper=warn,tower=warn",
        level.as_str().to_lowercase()
    );
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directives));

    if args.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true))
            .init();
    }
}
