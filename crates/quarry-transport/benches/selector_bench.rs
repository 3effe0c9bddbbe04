// Criterion benchmarks for quarry-transport
//
// Run benchmarks with:
//   cargo bench -p quarry-transport
//
// For detailed output with plots:
//   cargo bench -p quarry-transport -- --save-baseline main

use async_trait::async_trait;
use bytes::Bytes;
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use hyper::StatusCode;
use quarry_common::{ConnectionFailure, HttpExecutor, HttpRequest, HttpResponse, Node, NodeAddress};
use quarry_transport::{ConnectionPool, PoolConfig, SelectNode, Selector};
use std::collections::HashSet;
use std::sync::Arc;

struct NoopExecutor;

#[async_trait]
impl HttpExecutor for NoopExecutor {
    async fn execute(&self, _request: HttpRequest) -> Result<HttpResponse, ConnectionFailure> {
        Ok(HttpResponse::new(StatusCode::OK, Bytes::new()))
    }
}

fn nodes(count: usize) -> Vec<Node> {
    let executor: Arc<dyn HttpExecutor> = Arc::new(NoopExecutor);
    (0..count)
        .map(|i| {
            let address = NodeAddress::parse(&format!("http://10.0.{}.{}:9200", i / 250, i % 250 + 1))
                .unwrap();
            Node::new(address, executor.clone())
        })
        .collect()
}

fn bench_select(c: &mut Criterion) {
    let mut group = c.benchmark_group("select");

    for node_count in [2, 5, 10, 20].iter() {
        let alive = nodes(*node_count);

        group.bench_with_input(
            BenchmarkId::new("round_robin", node_count),
            &alive,
            |b, alive| {
                let selector = Selector::round_robin();
                b.iter(|| black_box(selector.select(black_box(alive)).unwrap()));
            },
        );

        group.bench_with_input(BenchmarkId::new("random", node_count), &alive, |b, alive| {
            let selector = Selector::random();
            b.iter(|| black_box(selector.select(black_box(alive)).unwrap()));
        });
    }

    group.finish();
}

fn bench_get_connection(c: &mut Criterion) {
    let mut group = c.benchmark_group("get_connection");
    let runtime = tokio::runtime::Runtime::new().unwrap();
    let _guard = runtime.enter();

    for node_count in [2, 10, 50].iter() {
        group.bench_with_input(
            BenchmarkId::new("all_alive", node_count),
            node_count,
            |b, &count| {
                let pool = ConnectionPool::new(nodes(count), PoolConfig::default());
                b.iter(|| black_box(pool.get_connection().unwrap()));
            },
        );

        group.bench_with_input(
            BenchmarkId::new("half_dead", node_count),
            node_count,
            |b, &count| {
                let all = nodes(count);
                let pool = ConnectionPool::new(all.clone(), PoolConfig::default());
                for node in all.iter().step_by(2) {
                    pool.mark_dead(node);
                }
                b.iter(|| black_box(pool.get_connection().unwrap()));
            },
        );

        group.bench_with_input(
            BenchmarkId::new("excluding_tried", node_count),
            node_count,
            |b, &count| {
                let all = nodes(count);
                let pool = ConnectionPool::new(all.clone(), PoolConfig::default());
                let tried: HashSet<NodeAddress> =
                    all.iter().take(2).map(|n| n.address().clone()).collect();
                b.iter(|| black_box(pool.get_connection_excluding(black_box(&tried)).unwrap()));
            },
        );
    }

    group.finish();
}

fn bench_mark_dead_live_cycle(c: &mut Criterion) {
    let runtime = tokio::runtime::Runtime::new().unwrap();
    let _guard = runtime.enter();

    c.bench_function("mark_dead_then_live_10_nodes", |b| {
        let all = nodes(10);
        let pool = ConnectionPool::new(all.clone(), PoolConfig::default());
        b.iter(|| {
            pool.mark_dead(black_box(&all[3]));
            pool.mark_live(black_box(&all[3]));
        });
    });
}

criterion_group!(
    benches,
    bench_select,
    bench_get_connection,
    bench_mark_dead_live_cycle
);
criterion_main!(benches);
