//! Scheduler throughput benchmark
//!
//! Measures the hot path: start → run every node → save, against the
//! in-memory store. One group drives short straight-line workflows, the
//! other fans out through a parallel gateway and joins.

use std::sync::Arc;
use std::time::Instant;

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use serde_json::json;
use tokio::runtime::Runtime;

use clinicflow_engine::definition::{Edge, Node, WorkflowDefinition};
use clinicflow_engine::{
    EngineConfig, ExecutionResult, ExecutorRegistry, InMemoryInstanceStore, InstanceStatus,
    WorkflowEngine,
};
use clinicflow_engine::requests::StartWorkflowRequest;

fn executors() -> ExecutorRegistry {
    let mut executors = ExecutorRegistry::new();
    executors.register_fn("step", |input| async move {
        let n = input["n"].as_i64().unwrap_or(0);
        Ok(ExecutionResult::completed(json!({ "n": n + 1 })))
    });
    executors
}

fn straight_line(steps: usize) -> WorkflowDefinition {
    let mut definition = WorkflowDefinition::new("straight", 1).with_node(Node::start("start"));
    let mut previous = "start".to_string();
    for i in 0..steps {
        let id = format!("step-{}", i);
        definition = definition
            .with_node(
                Node::task(id.as_str(), "step")
                    .with_input_mapping("n", "n")
                    .with_output_mapping("n", "output.n"),
            )
            .with_edge(Edge::new(previous.as_str(), id.as_str()));
        previous = id;
    }
    definition
        .with_node(Node::end("end"))
        .with_edge(Edge::new(previous.as_str(), "end"))
}

fn fan_out(branches: usize) -> WorkflowDefinition {
    let mut definition = WorkflowDefinition::new("fan-out", 1)
        .with_node(Node::start("start"))
        .with_node(Node::parallel("fork"))
        .with_node(Node::parallel("join"))
        .with_node(Node::end("end"))
        .with_edge(Edge::new("start", "fork"))
        .with_edge(Edge::new("join", "end"));
    for i in 0..branches {
        let id = format!("branch-{}", i);
        definition = definition
            .with_node(Node::task(id.as_str(), "step"))
            .with_edge(Edge::new("fork", id.as_str()))
            .with_edge(Edge::new(id.as_str(), "join"));
    }
    definition
}

fn engine(definition: WorkflowDefinition) -> WorkflowEngine {
    let engine = WorkflowEngine::new(
        Arc::new(InMemoryInstanceStore::new()),
        executors(),
        EngineConfig::default(),
    );
    engine.publish_definition(definition).unwrap();
    engine
}

/// Benchmark straight-line workflows of increasing length
fn bench_straight_line(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();

    let mut group = c.benchmark_group("scheduler/straight_line");

    for steps in [1usize, 10, 50] {
        group.throughput(Throughput::Elements(steps as u64));
        group.bench_with_input(BenchmarkId::new("steps", steps), &steps, |b, &steps| {
            b.to_async(&rt).iter_custom(|iters| async move {
                let engine = engine(straight_line(steps));

                let start = Instant::now();
                for _ in 0..iters {
                    let result = engine
                        .execute(StartWorkflowRequest::new("straight").with_input(json!({ "n": 0 })))
                        .await
                        .unwrap();
                    debug_assert_eq!(result.status, InstanceStatus::Completed);
                }
                start.elapsed()
            });
        });
    }

    group.finish();
}

/// Benchmark fork and join over a growing number of branches
fn bench_fan_out(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();

    let mut group = c.benchmark_group("scheduler/fan_out");

    for branches in [2usize, 8, 32] {
        group.throughput(Throughput::Elements(branches as u64));
        group.bench_with_input(
            BenchmarkId::new("branches", branches),
            &branches,
            |b, &branches| {
                b.to_async(&rt).iter_custom(|iters| async move {
                    let engine = engine(fan_out(branches));

                    let start = Instant::now();
                    for _ in 0..iters {
                        let result = engine
                            .execute(StartWorkflowRequest::new("fan-out"))
                            .await
                            .unwrap();
                        debug_assert_eq!(result.status, InstanceStatus::Completed);
                    }
                    start.elapsed()
                });
            },
        );
    }

    group.finish();
}

criterion_group!(benches, bench_straight_line, bench_fan_out);
criterion_main!(benches);
