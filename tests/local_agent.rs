//! Volume lifecycle against the filesystem-backed node agent.
#![cfg(unix)]

use brick_control_plane::agent::{AgentConfig, LocalNodeAgent, SupervisorConfig};
use brick_control_plane::volfile::{self, BrickLaunchConfig};
use brick_control_plane::{
    MemoryOptions, Operation, Orchestrator, OrchestratorConfig, Registry, TaskState,
    TopologyPlanner, VolumeSpec, VolumeType,
};
use std::sync::Arc;
use tempfile::TempDir;

#[tokio::test]
async fn create_start_delete_writes_and_retires_artifacts() {
    let dir = TempDir::new().unwrap();
    let agent = Arc::new(LocalNodeAgent::new(AgentConfig {
        work_dir: dir.path().to_path_buf(),
        supervisor: SupervisorConfig {
            launcher: "true".into(),
            ready_grace_ms: 200,
            ..SupervisorConfig::default()
        },
    }));
    let registry = Registry::new("local");
    let orchestrator = Orchestrator::new(
        OrchestratorConfig {
            initial_backoff_ms: 10,
            ..OrchestratorConfig::default()
        },
        registry.clone(),
        TopologyPlanner::default(),
        agent,
        Arc::new(MemoryOptions::new()),
    )
    .unwrap();

    let run = |operation: Operation| {
        let orchestrator = orchestrator.clone();
        async move {
            let task = orchestrator.submit(operation).unwrap();
            let done = orchestrator.wait(&task.id).await.unwrap();
            assert_eq!(done.state, TaskState::Succeeded, "{:?}", done.failure);
        }
    };

    for host in ["a1", "a2"] {
        run(Operation::AddNode {
            hostname: host.into(),
            capacity_bytes: 1 << 40,
            fault_domain: None,
        })
        .await;
    }
    run(Operation::CreateVolume {
        spec: VolumeSpec {
            name: "gv0".into(),
            volume_type: VolumeType::Replicate,
            replica_count: 2,
            distribute_count: 1,
            redundancy_count: 0,
            capacity_bytes: 1 << 30,
        },
    })
    .await;

    let root = dir.path();
    for host in ["a1", "a2"] {
        let server = std::fs::read_to_string(root.join(volfile::server_volfile_path("gv0", host)))
            .unwrap();
        assert!(server.contains("type protocol/server"));
    }
    assert!(root.join(volfile::client_volfile_path("gv0")).exists());

    run(Operation::StartVolume {
        volume: "gv0".into(),
    })
    .await;

    let volume = registry.find_volume("gv0").unwrap();
    for brick in registry.volume_bricks(&volume.id).unwrap() {
        let node = registry.get_node(&brick.node_id).unwrap();
        let expected = BrickLaunchConfig::for_brick(&volume, &node, &brick, &Default::default());
        let text =
            std::fs::read_to_string(root.join(volfile::launch_config_path("gv0", &expected.name)))
                .unwrap();
        assert_eq!(BrickLaunchConfig::from_json(&text).unwrap(), expected);
    }

    run(Operation::StopVolume {
        volume: "gv0".into(),
    })
    .await;
    run(Operation::DeleteVolume {
        volume: "gv0".into(),
    })
    .await;
    assert!(!root.join(volfile::volume_dir("gv0")).exists());
}
