//! Benchmarks for pipeline throughput.

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use flowline::prelude::*;

fn pipeline_benchmark(c: &mut Criterion) {
    let runtime = tokio::runtime::Runtime::new().expect("runtime");

    c.bench_function("two_stage_100_tasks", |b| {
        b.iter(|| {
            runtime.block_on(async {
                let mut pipeline = Pipeline::builder()
                    .ordered(
                        MapTransform::new(|x: u64| x * 2),
                        StageConfig::new("double").with_workers(4),
                    )
                    .unordered(
                        MapTransform::new(|x: u64| x + 1),
                        StageConfig::new("increment").with_workers(2),
                    )
                    .build()
                    .expect("build");

                for task in 0..100u64 {
                    pipeline.put(task).await.expect("put");
                }
                pipeline.shutdown().await;

                let mut total = 0u64;
                while let Some(result) = pipeline.get().await {
                    total += result;
                }
                black_box(total)
            })
        })
    });
}

criterion_group!(benches, pipeline_benchmark);
criterion_main!(benches);
