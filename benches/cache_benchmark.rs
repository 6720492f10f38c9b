use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use pms_gateway_core::cache::CacheManager;
use rand::{seq::SliceRandom, thread_rng, Rng};
use serde_json::json;
use std::sync::Arc;
use std::thread;

const CATEGORIES: [&str; 4] = ["guest_profile", "room_status", "reservation", "rate_codes"];

// Mixed read/write load from several threads against one cache
pub fn cache_benchmark(c: &mut Criterion) {
    let mut group = c.benchmark_group("pms_response_cache");

    for max_entries in [100usize, 1_000, 10_000].iter() {
        group.bench_with_input(
            BenchmarkId::from_parameter(max_entries),
            max_entries,
            |b, &max_entries| {
                let identifiers = (0..500).map(|i| format!("R{i:05}")).collect::<Vec<_>>();
                let arrivals = (1..30)
                    .map(|d| json!({"arrivalDate": format!("2025-06-{d:02}")}))
                    .collect::<Vec<_>>();

                b.iter(|| {
                    let cache = Arc::new(CacheManager::new("HOTEL1", max_entries));

                    let handles = (0..4)
                        .map(|_| {
                            let cache = Arc::clone(&cache);
                            let identifiers = identifiers.clone();
                            let arrivals = arrivals.clone();

                            thread::spawn(move || {
                                let mut rng = thread_rng();
                                for _ in 0..250 {
                                    let category = CATEGORIES.choose(&mut rng).unwrap();
                                    let id = identifiers.choose(&mut rng).unwrap();
                                    let params = arrivals.choose(&mut rng);

                                    if rng.gen_bool(0.3) {
                                        cache.set(
                                            category,
                                            id,
                                            json!({"id": id, "rooms": rng.gen_range(1..5)}),
                                            params,
                                            None,
                                        );
                                    } else {
                                        let _ = cache.get(category, id, params);
                                    }
                                }
                                if rng.gen_bool(0.1) {
                                    cache.invalidate(None, None, Some("cancellations"), &[]);
                                }
                            })
                        })
                        .collect::<Vec<_>>();

                    for handle in handles {
                        handle.join().unwrap();
                    }

                    black_box(cache.stats())
                });
            },
        );
    }

    group.finish();
}

fn key_benchmark(c: &mut Criterion) {
    let cache = CacheManager::new("HOTEL1", 100);
    let params = json!({"arrivalDate": "2025-06-01", "nights": 3, "roomType": "KING"});
    c.bench_function("cache_key_with_params", |b| {
        b.iter(|| black_box(cache.key_for("reservation", "R00001", Some(&params))))
    });
}

criterion_group!(benches, cache_benchmark, key_benchmark);
criterion_main!(benches);
