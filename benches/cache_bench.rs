use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};

use cachework::cache::Manager;
use cachework::config::{CacheConfig, EvictionPolicy};
use serde_json::json;

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap()
}

fn bench_memory_set_get(c: &mut Criterion) {
    let rt = runtime();
    let manager = rt.block_on(Manager::new(CacheConfig::default())).unwrap();

    let mut group = c.benchmark_group("memory_backend");
    group.bench_function("set", |b| {
        b.iter(|| {
            rt.block_on(manager.set("bench-model", "embed", &json!("input"), &json!({}), json!([0.1, 0.2, 0.3]), None))
                .unwrap();
        });
    });

    rt.block_on(manager.set("bench-model", "embed", &json!("input"), &json!({}), json!([0.1, 0.2, 0.3]), None))
        .unwrap();
    group.bench_function("get_hit", |b| {
        b.iter(|| {
            black_box(rt.block_on(manager.get("bench-model", "embed", &json!("input"), &json!({}))).unwrap());
        });
    });
    group.finish();
}

fn bench_eviction_pressure(c: &mut Criterion) {
    let rt = runtime();
    let mut group = c.benchmark_group("eviction_pressure");

    for size in [16usize, 256, 4096] {
        let mut config = CacheConfig::default();
        config.max_size = size;
        config.eviction_policy = EvictionPolicy::Lru;
        let manager = rt.block_on(Manager::new(config)).unwrap();

        group.bench_with_input(BenchmarkId::new("set_beyond_capacity", size), &size, |b, &size| {
            b.iter(|| {
                for i in 0..size * 2 {
                    rt.block_on(manager.set("m", "op", &json!(i), &json!({}), json!(i), None)).unwrap();
                }
            });
        });
    }
    group.finish();
}

fn bench_key_codec(c: &mut Criterion) {
    use cachework::cache::key::CacheKey;

    c.bench_function("cache_key_build_and_parse", |b| {
        b.iter(|| {
            let key = CacheKey::build("model-x", "generate", &json!(["a", "b", "c"]), &json!({"temp": 0.7})).unwrap();
            let serialized = key.to_string();
            black_box(CacheKey::parse(&serialized).unwrap());
        });
    });
}

criterion_group!(benches, bench_memory_set_get, bench_eviction_pressure, bench_key_codec);
criterion_main!(benches);
