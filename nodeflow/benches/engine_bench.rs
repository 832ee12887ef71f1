//! Benchmarks for plan execution on in-memory persistence.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use std::sync::Arc;

use nodeflow::steps::NoOpStep;
use nodeflow::testing::{fixture_registry, fork_plan, linear_plan, TestEngine};

fn leaf_ids(count: usize) -> Vec<String> {
    (0..count).map(|i| format!("n{i}")).collect()
}

fn engine() -> TestEngine {
    TestEngine::new(fixture_registry().with_step(Arc::new(NoOpStep::new("Shell"))))
}

fn linear_benchmark(c: &mut Criterion) {
    let runtime = tokio::runtime::Runtime::new().unwrap();
    let mut group = c.benchmark_group("linear_plan");

    for len in [1, 10, 50] {
        let ids = leaf_ids(len);
        let ids: Vec<&str> = ids.iter().map(String::as_str).collect();
        group.bench_with_input(BenchmarkId::from_parameter(len), &ids, |b, ids| {
            b.iter(|| {
                runtime.block_on(async {
                    let harness = engine();
                    let pe = harness.start(linear_plan("bench", "Shell", ids)).await.unwrap();
                    black_box(harness.run().await.unwrap());
                    black_box(harness.plan_status(&pe).await.unwrap())
                })
            });
        });
    }
    group.finish();
}

fn fork_benchmark(c: &mut Criterion) {
    let runtime = tokio::runtime::Runtime::new().unwrap();
    let mut group = c.benchmark_group("fork_plan");

    for (width, max_concurrency) in [(10, None), (50, None), (50, Some(4))] {
        let ids = leaf_ids(width);
        let ids: Vec<&str> = ids.iter().map(String::as_str).collect();
        let label = format!("{width}/{}", max_concurrency.map_or("all".to_string(), |m: usize| m.to_string()));
        group.bench_with_input(BenchmarkId::from_parameter(label), &ids, |b, ids| {
            b.iter(|| {
                runtime.block_on(async {
                    let harness = engine();
                    let pe = harness
                        .start(fork_plan("bench", "Shell", ids, max_concurrency))
                        .await
                        .unwrap();
                    black_box(harness.run().await.unwrap());
                    black_box(harness.plan_status(&pe).await.unwrap())
                })
            });
        });
    }
    group.finish();
}

criterion_group!(benches, linear_benchmark, fork_benchmark);
criterion_main!(benches);
