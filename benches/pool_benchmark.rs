//! Benchmarks for protocol encoding and pool dispatch.

use criterion::{BenchmarkId, Criterion, black_box, criterion_group, criterion_main};
use procpool::pool::protocol::{Message, ParentMessage, ResultEnvelope, WorkerMessage};
use procpool::pool::{Call, Pool, PoolConfig, UnitOfWork, WorkerCommand};
use serde_json::json;
use std::time::Duration;

fn worker() -> WorkerCommand {
    WorkerCommand::new(env!("CARGO_BIN_EXE_procpool"))
}

fn bench_protocol(c: &mut Criterion) {
    let mut group = c.benchmark_group("protocol");

    let call = Call::with_args("add_pair", (1, 2)).expect("valid args");
    let work = ParentMessage::Work(UnitOfWork::new(42, call));
    let work_line = work.to_line();
    group.bench_function("encode_work", |b| b.iter(|| black_box(&work).to_line()));
    group.bench_function("decode_work", |b| {
        b.iter(|| ParentMessage::from_line(black_box(&work_line)).unwrap())
    });

    let result = WorkerMessage::Result(ResultEnvelope::value(42, json!({"values": [1, 2, 3]})));
    let result_line = result.to_line();
    group.bench_function("decode_result", |b| {
        b.iter(|| WorkerMessage::from_line(black_box(&result_line)).unwrap())
    });

    group.finish();
}

fn bench_pool_map(c: &mut Criterion) {
    let runtime = tokio::runtime::Runtime::new().expect("Failed to create runtime");
    let mut group = c.benchmark_group("pool_map");
    group.measurement_time(Duration::from_secs(10));

    for processes in [1usize, 4].iter() {
        let config = PoolConfig::new(worker()).with_processes(*processes);
        let pool = runtime
            .block_on(Pool::new(config))
            .expect("Failed to start pool");

        group.bench_with_input(
            BenchmarkId::new("double_x100", processes),
            processes,
            |b, _| {
                let pool = &pool;
                b.to_async(&runtime)
                    .iter(|| async move { pool.map("double", 0..100).await.unwrap() });
            },
        );

        runtime.block_on(pool.close()).expect("Failed to close pool");
    }

    group.finish();
}

criterion_group!(benches, bench_protocol, bench_pool_map);
criterion_main!(benches);
