//! Benchmarks for viplb hot paths.

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use std::time::Duration;
use viplb::addressing::AddressPool;
use viplb::backend::BackendPool;
use viplb::config::{BackendConfig, IpPoolConfig};

fn create_pool(num_backends: usize) -> BackendPool {
    let configs: Vec<BackendConfig> = (0..num_backends)
        .map(|i| BackendConfig {
            name: format!("backend-{i}"),
            host: "127.0.0.1".parse().unwrap(),
            poll_interval: Duration::from_secs(10),
            poll_timeout: Duration::from_secs(5),
        })
        .collect();

    let pool = BackendPool::new(&configs);
    for backend in pool.backends() {
        backend.set_healthy(true);
    }
    pool
}

fn benchmark_select(c: &mut Criterion) {
    let pool = create_pool(10);
    c.bench_function("least_conn_select_10", |b| {
        b.iter(|| {
            black_box(pool.select().unwrap());
        })
    });

    let pool = create_pool(100);
    c.bench_function("least_conn_select_100", |b| {
        b.iter(|| {
            black_box(pool.select().unwrap());
        })
    });
}

fn benchmark_connection_accounting(c: &mut Criterion) {
    let pool = create_pool(10);

    c.bench_function("select_count_uncount", |b| {
        b.iter(|| {
            let backend = pool.select().unwrap();
            backend.add_connection();
            backend.remove_connection();
        })
    });
}

fn benchmark_address_allocation(c: &mut Criterion) {
    let pool = AddressPool::new(&IpPoolConfig {
        device: "eth0".to_string(),
        network: "10.0.0.0/16".parse().unwrap(),
        range_start: None,
        range_end: None,
    });

    c.bench_function("allocate_release", |b| {
        b.iter(|| {
            let addr = pool.allocate().unwrap();
            pool.release(black_box(addr.addr()));
        })
    });
}

criterion_group!(
    benches,
    benchmark_select,
    benchmark_connection_accounting,
    benchmark_address_allocation
);
criterion_main!(benches);
