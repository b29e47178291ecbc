use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use memcluster::{key_hash, HashRing, KeyRouter, NodeAddr, DEFAULT_VIRTUAL_NODES};

fn nodes(count: usize) -> Vec<NodeAddr> {
    (0..count)
        .map(|i| NodeAddr::tcp(format!("cache-{i:03}.internal"), 11211))
        .collect()
}

fn keys(count: usize) -> Vec<String> {
    (0..count).map(|i| format!("user:{i}:profile")).collect()
}

fn bench_build(c: &mut Criterion) {
    let mut group = c.benchmark_group("ring_build");
    for count in [3, 12, 64] {
        let nodes = nodes(count);
        group.bench_with_input(BenchmarkId::from_parameter(count), &nodes, |b, nodes| {
            b.iter(|| HashRing::new(nodes.iter().cloned(), DEFAULT_VIRTUAL_NODES))
        });
    }
    group.finish();
}

fn bench_route(c: &mut Criterion) {
    let keys = keys(1000);
    let mut group = c.benchmark_group("ring_route");
    group.throughput(Throughput::Elements(keys.len() as u64));
    for count in [3, 12, 64] {
        let ring = HashRing::new(nodes(count), DEFAULT_VIRTUAL_NODES);
        group.bench_with_input(BenchmarkId::from_parameter(count), &ring, |b, ring| {
            b.iter(|| {
                keys.iter()
                    .filter_map(|key| ring.route(key.as_bytes()))
                    .count()
            })
        });
    }
    group.finish();

    let router = KeyRouter::new(DEFAULT_VIRTUAL_NODES);
    router.rebuild(nodes(12));
    c.bench_function("router_route", |b| {
        b.iter(|| keys.iter().filter_map(|key| router.route(key)).count())
    });
    c.bench_function("key_hash", |b| {
        b.iter(|| keys.iter().map(|key| key_hash(key.as_bytes())).fold(0, u32::wrapping_add))
    });
}

criterion_group!(bench, bench_build, bench_route);
criterion_main!(bench);
