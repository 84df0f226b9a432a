use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};
use resilient_fetch::{
    CacheOptions, CacheStrategy, Client, ClientConfig, DedupeConfig, MemoryBackend, RedisBackend,
    RedisBackendConfig, RequestDescriptor, RetryConfig,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Runtime;

mod common;
use common::{BenchConfig, FakeApi, PathGenerator};

fn cached(path: &str, strategy: CacheStrategy) -> RequestDescriptor {
    RequestDescriptor::get(path).cache(CacheOptions::new(strategy))
}

fn bench_client_config(max_entries: usize) -> ClientConfig {
    let mut config = ClientConfig {
        max_concurrent: 64,
        max_queue_size: 10_000,
        retry: RetryConfig {
            max_attempts: 1,
            ..Default::default()
        },
        ..Default::default()
    };
    config.cache.memory_max_entries = max_entries;
    config
}

/// Setup a client with only the memory tier
fn setup_memory(api: &FakeApi, max_entries: usize) -> Client {
    Client::builder(Arc::new(api.clone()))
        .config(bench_client_config(max_entries))
        .build()
}

/// Setup a client with memory + in-process durable tier
fn setup_memory_durable(api: &FakeApi, max_entries: usize) -> Client {
    Client::builder(Arc::new(api.clone()))
        .config(bench_client_config(max_entries))
        .durable_backend(Arc::new(MemoryBackend::new()))
        .build()
}

/// Setup a client with memory + Redis tier, if Redis is reachable
async fn setup_memory_redis(api: &FakeApi, max_entries: usize, redis_url: &str) -> Option<Client> {
    let backend = RedisBackend::new(RedisBackendConfig {
        url: redis_url.to_string(),
        disable_expiration: false,
    })
    .await
    .ok()?;

    Some(
        Client::builder(Arc::new(api.clone()))
            .config(bench_client_config(max_entries))
            .durable_backend(Arc::new(backend))
            .build(),
    )
}

async fn populate(client: &Client, paths: &[String]) {
    for path in paths {
        let _ = client.execute(cached(path, CacheStrategy::NetworkOnly)).await;
    }
}

/// Benchmark 1: Hot Cache (all hits, pure cache-first read performance)
fn bench_hot_cache(c: &mut Criterion, config: &BenchConfig) {
    let rt = Runtime::new().unwrap();
    let mut group = c.benchmark_group("hot_cache");
    group.sample_size(config.sample_size);

    let api = FakeApi::new(1000, config.origin_latency_ms);
    let paths = PathGenerator::new(1000).sequential();
    group.throughput(Throughput::Elements(paths.len() as u64));

    let mut clients = vec![
        ("memory", setup_memory(&api, 2000)),
        ("memory_durable", setup_memory_durable(&api, 2000)),
    ];
    match rt.block_on(setup_memory_redis(&api, 2000, &config.redis_url)) {
        Some(client) => clients.push(("memory_redis", client)),
        None => eprintln!("Redis not reachable, skipping memory_redis"),
    }

    for (name, client) in clients {
        rt.block_on(populate(&client, &paths));

        group.bench_function(name, |b| {
            b.to_async(&rt).iter(|| async {
                for path in &paths {
                    let _ = black_box(client.execute(cached(path, CacheStrategy::CacheFirst)).await);
                }
            });
        });
    }

    group.finish();
}

/// Benchmark 2: Promotion (memory tier too small, reads fall through to the durable tier)
fn bench_durable_promotion(c: &mut Criterion, config: &BenchConfig) {
    let rt = Runtime::new().unwrap();
    let mut group = c.benchmark_group("durable_promotion");
    group.sample_size(config.sample_size.min(50));

    let api = FakeApi::new(500, config.origin_latency_ms);
    let paths = PathGenerator::new(500);
    let client = setup_memory_durable(&api, 50);
    rt.block_on(populate(&client, &paths.sequential()));

    group.bench_function("mixed_80_20", |b| {
        b.to_async(&rt).iter(|| {
            let client = client.clone();
            let paths = paths.mixed(0.8);
            async move {
                for path in paths.iter().take(100) {
                    let _ = black_box(
                        client
                            .execute(cached(path, CacheStrategy::CacheFirst))
                            .await,
                    );
                }
            }
        });
    });

    group.finish();
}

/// Benchmark 3: Fan-in (N identical concurrent requests, with and without dedupe)
fn bench_dedupe_fan_in(c: &mut Criterion, config: &BenchConfig) {
    let rt = Runtime::new().unwrap();
    let mut group = c.benchmark_group("dedupe_fan_in");
    group.sample_size(config.sample_size.min(20)); // Fewer samples due to origin latency
    group.measurement_time(Duration::from_secs(20));

    let api = FakeApi::new(10, config.origin_latency_ms);

    for callers in [8, 32, 128] {
        group.throughput(Throughput::Elements(callers as u64));

        for (name, enabled) in [("dedupe", true), ("no_dedupe", false)] {
            let mut client_config = bench_client_config(100);
            client_config.dedupe = DedupeConfig {
                enabled,
                ..Default::default()
            };
            let client = Client::builder(Arc::new(api.clone()))
                .config(client_config)
                .build();

            group.bench_with_input(BenchmarkId::new(name, callers), &callers, |b, &n| {
                b.to_async(&rt).iter(|| {
                    let client = client.clone();
                    async move {
                        let calls = (0..n).map(|_| client.get("/notes/1"));
                        black_box(futures::future::join_all(calls).await)
                    }
                });
            });
        }
    }

    group.finish();
}

fn run_benchmarks(c: &mut Criterion) {
    let config = BenchConfig::new();

    eprintln!("\n=== Running Benchmarks ===\n");

    bench_hot_cache(c, &config);
    bench_durable_promotion(c, &config);
    bench_dedupe_fan_in(c, &config);
}

criterion_group!(benches, run_benchmarks);
criterion_main!(benches);
