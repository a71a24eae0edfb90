//! Throughput Benchmark for segstore
//!
//! This benchmark measures the segmented set under point operations,
//! fetch-by-example scans and multi-threaded load.

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use segstore::codec::{Entity, FieldKind, Schema, Template, TupleCodec, Value};
use segstore::{SegmentedSet, StoreConfig};
use std::sync::Arc;
use std::time::Duration;

fn new_set() -> Arc<SegmentedSet<TupleCodec>> {
    let codec = Arc::new(TupleCodec::new(
        Schema::new("Item", "key", FieldKind::Str)
            .field("group", FieldKind::Int)
            .field("value", FieldKind::Bytes),
    ));
    Arc::new(SegmentedSet::new(codec, StoreConfig::default()).unwrap())
}

fn item(key: String, group: i64, size: usize) -> Entity {
    Entity::new(vec![
        Value::from(key),
        Value::Int(group),
        Value::Bytes(vec![b'x'; size].into()),
    ])
}

/// Benchmark PUT operations
fn bench_put(c: &mut Criterion) {
    let set = new_set();

    let mut group = c.benchmark_group("put");
    group.throughput(Throughput::Elements(1));

    group.bench_function("put_small", |b| {
        let mut i = 0u64;
        b.iter(|| {
            set.put_entity(&item(format!("small:{}", i), 0, 16), None)
                .unwrap();
            i += 1;
        });
    });

    group.bench_function("put_medium", |b| {
        let mut i = 0u64;
        b.iter(|| {
            set.put_entity(&item(format!("medium:{}", i), 0, 1024), None)
                .unwrap();
            i += 1;
        });
    });

    group.bench_function("overwrite", |b| {
        let mut i = 0u64;
        b.iter(|| {
            set.put_entity(&item(format!("hot:{}", i % 100), 0, 64), None)
                .unwrap();
            i += 1;
        });
    });

    group.finish();
}

/// Benchmark GET operations
fn bench_get(c: &mut Criterion) {
    let set = new_set();

    for i in 0..100_000 {
        set.put_entity(&item(format!("key:{}", i), i % 10, 32), None)
            .unwrap();
    }

    let mut group = c.benchmark_group("get");
    group.throughput(Throughput::Elements(1));

    group.bench_function("get_existing", |b| {
        let mut i = 0u64;
        b.iter(|| {
            let key = Value::from(format!("key:{}", i % 100_000));
            black_box(set.get_bytes(&key).unwrap());
            i += 1;
        });
    });

    group.bench_function("get_missing", |b| {
        let mut i = 0u64;
        b.iter(|| {
            let key = Value::from(format!("missing:{}", i));
            black_box(set.get_bytes(&key).unwrap());
            i += 1;
        });
    });

    group.finish();
}

/// Benchmark put followed by remove (exercises the back-shift sweep)
fn bench_remove(c: &mut Criterion) {
    let set = new_set();

    for i in 0..10_000 {
        set.put_entity(&item(format!("base:{}", i), 0, 32), None)
            .unwrap();
    }

    let mut group = c.benchmark_group("remove");
    group.throughput(Throughput::Elements(1));

    group.bench_function("put_remove", |b| {
        let mut i = 0u64;
        b.iter(|| {
            let key = format!("churn:{}", i);
            set.put_entity(&item(key.clone(), 0, 32), None).unwrap();
            black_box(set.remove(&Value::from(key)).unwrap());
            i += 1;
        });
    });

    group.finish();
}

/// Benchmark fetch-by-example scans
fn bench_match(c: &mut Criterion) {
    let set = new_set();

    for i in 0..10_000 {
        set.put_entity(&item(format!("m:{}", i), i % 100, 32), None)
            .unwrap();
    }

    let mut group = c.benchmark_group("match");

    group.bench_function("match_one_group", |b| {
        let template = Template::any().with(1, 42i64);
        b.iter(|| {
            black_box(set.match_bytes(&template).unwrap());
        });
    });

    group.bench_function("match_all", |b| {
        b.iter(|| {
            black_box(set.match_bytes(&Template::any()).unwrap());
        });
    });

    group.finish();
}

/// Benchmark concurrent access
fn bench_concurrent(c: &mut Criterion) {
    use std::thread;

    let mut group = c.benchmark_group("concurrent");
    group.measurement_time(Duration::from_secs(10));

    group.bench_function("4_threads_mixed", |b| {
        b.iter(|| {
            let set = new_set();
            let handles: Vec<_> = (0..4)
                .map(|t| {
                    let set = Arc::clone(&set);
                    thread::spawn(move || {
                        for i in 0..10_000 {
                            let key = format!("key:{}:{}", t, i);
                            set.put_entity(&item(key.clone(), t, 16), None).unwrap();
                            set.get_bytes(&Value::from(key)).unwrap();
                        }
                    })
                })
                .collect();

            for handle in handles {
                handle.join().unwrap();
            }

            black_box(set.len());
        });
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_put,
    bench_get,
    bench_remove,
    bench_match,
    bench_concurrent,
);

criterion_main!(benches);
