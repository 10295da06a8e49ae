use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use sharder::{get_key, Circle, HashKey};

fn circle(backends: usize) -> Circle {
    Circle::new((0..backends).map(|i| HashKey::Name.identity(i, &format!("backend-{i}"), "")))
}

fn ring_lookup(c: &mut Criterion) {
    let mut group = c.benchmark_group("ring_lookup");
    group.throughput(Throughput::Elements(1));

    for backends in [2usize, 4, 8, 16] {
        let ring = circle(backends);
        let key = get_key("mydb", "cpu");
        group.bench_with_input(BenchmarkId::from_parameter(backends), &ring, |b, ring| {
            b.iter(|| ring.get(&key))
        });
    }
    group.finish();
}

fn ring_construction(c: &mut Criterion) {
    let mut group = c.benchmark_group("ring_construction");
    for backends in [4usize, 16] {
        group.bench_with_input(
            BenchmarkId::from_parameter(backends),
            &backends,
            |b, &backends| b.iter(|| circle(backends)),
        );
    }
    group.finish();
}

criterion_group!(benches, ring_lookup, ring_construction);
criterion_main!(benches);
