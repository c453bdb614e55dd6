//! Mesh throughput benchmark.
//!
//! Measures fetch round trips through a running `Kite`: a direct fetch to
//! the owning worker, and a relay where one service calls another service
//! on a different worker.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use kite::types::shard;
use kite::{Kite, Module, Request, Router, ServiceDefinition};
use serde_json::{json, Value};

const WORKERS: usize = 2;

fn module() -> Module {
    let echo = ServiceDefinition::new()
        .auto_create(true)
        .handler("echo", |_cx, event| async move { Ok(event.body().clone()) });
    let relay = ServiceDefinition::new()
        .auto_create(true)
        .handler("relay", |cx, event| async move {
            let target = Router::from(event.body()["target"].as_str().unwrap_or_default());
            cx.target(target)
                .call("handlers/echo", event.body()["payload"].clone())
                .await
        });
    Module::new("bench").service("echo", echo).service("relay", relay)
}

fn bench_fetch(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let kite = rt.block_on(async {
        let mut kite = Kite::new();
        kite.regist(module()).unwrap();
        kite.start(Some(WORKERS)).await.unwrap();
        kite
    });

    let echo = Router::new("echo", "e");
    let relay = (0u64..)
        .map(|i| Router::new("relay", i))
        .find(|r| shard(r, WORKERS) != shard(&echo, WORKERS))
        .unwrap();

    let mut group = c.benchmark_group("fetch");
    for &size in &[0usize, 64, 1024] {
        let payload = Value::String("x".repeat(size));

        group.bench_with_input(BenchmarkId::new("direct", size), &payload, |b, p| {
            b.iter(|| {
                rt.block_on(async {
                    let request = Request::fetch(echo.clone(), "handlers/echo").body(black_box(p.clone()));
                    kite.fetch(request).await
                })
            });
        });

        let body = json!({ "target": "echo/e", "payload": payload });
        group.bench_with_input(BenchmarkId::new("relay", size), &body, |b, p| {
            b.iter(|| {
                rt.block_on(async {
                    let request = Request::fetch(relay.clone(), "handlers/relay").body(black_box(p.clone()));
                    kite.fetch(request).await
                })
            });
        });
    }
    group.finish();

    rt.block_on(async {
        let mut kite = kite;
        kite.stop().await.unwrap();
    });
}

criterion_group!(benches, bench_fetch);
criterion_main!(benches);
