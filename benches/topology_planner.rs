//! Benchmarks for brick placement and volfile compilation

use brick_control_plane::domain::{Node, NodeId, NodeStatus, VolumeSpec, VolumeType};
use brick_control_plane::registry::Registry;
use brick_control_plane::topology::TopologyPlanner;
use brick_control_plane::volfile::VolfileCompiler;
use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use std::collections::BTreeMap;
use std::sync::Arc;

fn spec(name: &str, replicas: u32, distribute: u32) -> VolumeSpec {
    VolumeSpec {
        name: name.to_string(),
        volume_type: VolumeType::DistributeReplicate,
        replica_count: replicas,
        distribute_count: distribute,
        redundancy_count: 0,
        capacity_bytes: 64 << 30,
    }
}

/// `nodes` online nodes carrying `volumes` existing 3x4 volumes
fn populated(nodes: usize, volumes: usize) -> Arc<Registry> {
    let registry = Registry::new("bench");
    for i in 0..nodes {
        let node = registry
            .add_node(format!("host-{:03}", i), 16 << 40, Some(format!("rack-{}", i % 8)))
            .unwrap();
        registry.set_node_status(&node.id, NodeStatus::Online).unwrap();
    }

    let planner = TopologyPlanner::default();
    for v in 0..volumes {
        let spec = spec(&format!("vol{}", v), 3, 4);
        let plan = planner.plan(&spec, &registry.snapshot()).unwrap();
        let volume = registry.create_volume(&spec).unwrap();
        registry
            .add_bricks(&volume.id, &plan.to_new_bricks(), plan.distribute_count)
            .unwrap();
    }
    registry
}

fn bench_plan(c: &mut Criterion) {
    let mut group = c.benchmark_group("topology_planner");
    group.throughput(Throughput::Elements(1));

    let planner = TopologyPlanner::default();
    for (nodes, volumes) in [(8, 10), (64, 100)] {
        let snapshot = populated(nodes, volumes).snapshot();
        let request = spec("new", 3, 8);
        group.bench_function(format!("plan_3x8_{}_nodes_{}_volumes", nodes, volumes), |b| {
            b.iter(|| planner.plan(black_box(&request), black_box(&snapshot)))
        });
    }

    group.finish();
}

fn bench_compile(c: &mut Criterion) {
    let mut group = c.benchmark_group("volfile_compiler");
    group.throughput(Throughput::Elements(1));

    let registry = populated(32, 1);
    let volume = registry.find_volume("vol0").unwrap();
    let bricks = registry.volume_bricks(&volume.id).unwrap();
    let nodes: BTreeMap<NodeId, Node> = registry
        .list_nodes()
        .into_iter()
        .map(|n| (n.id.clone(), n))
        .collect();
    let options: BTreeMap<String, String> =
        [("io-threads.thread-count".to_string(), "32".to_string())].into();
    let compiler = VolfileCompiler::new();

    group.bench_function("compile_3x4", |b| {
        b.iter(|| {
            compiler
                .compile(
                    black_box(&volume),
                    black_box(&bricks),
                    black_box(&nodes),
                    black_box(&options),
                )
                .unwrap()
        })
    });

    group.finish();
}

criterion_group!(benches, bench_plan, bench_compile);
criterion_main!(benches);
