use criterion::{BatchSize, Criterion, criterion_group, criterion_main};
use partisim_core::EngineConfig;
use partisim_threads::ThreadController;
use std::time::Duration;

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|value| value.parse::<T>().ok())
        .unwrap_or(default)
}

fn bench_threaded_steps(c: &mut Criterion) {
    let mut group = c.benchmark_group("threaded_step");
    group.sample_size(env_or("PS_BENCH_SAMPLES", 20_usize).max(10));
    group.warm_up_time(Duration::from_secs(env_or("PS_BENCH_WARMUP_SECS", 2)));
    group.measurement_time(Duration::from_secs(env_or("PS_BENCH_MEASURE_SECS", 8)));
    let steps: u64 = env_or("PS_BENCH_STEPS", 32_u64).max(1);
    let entities: usize = env_or("PS_BENCH_ENTITIES", 4_000);
    let unit_counts: Vec<usize> = std::env::var("PS_BENCH_UNITS")
        .ok()
        .map(|s| {
            s.split(',')
                .filter_map(|t| t.trim().parse::<usize>().ok())
                .collect::<Vec<_>>()
        })
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| vec![1_usize, 4, 9, 16]);

    for &units in &unit_counts {
        group.bench_function(format!("steps{steps}_entities{entities}_units{units}"), |b| {
            b.iter_batched(
                || {
                    let config = EngineConfig {
                        world_width: 800,
                        world_height: 800,
                        initial_entities: entities,
                        rng_seed: Some(0xBEEF),
                        ..EngineConfig::default()
                    };
                    let mut controller = ThreadController::new(config).expect("config");
                    controller.configure(units).expect("configure");
                    controller.start().expect("start");
                    controller
                },
                |mut controller| {
                    controller
                        .advance(steps)
                        .expect("advance")
                        .wait()
                        .expect("steps");
                    controller.stop().expect("stop");
                },
                BatchSize::LargeInput,
            );
        });
    }
    group.finish();
}

criterion_group!(benches, bench_threaded_steps);
criterion_main!(benches);
