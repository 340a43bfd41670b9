//! Search and probe engine benchmarks
//!
//! Benchmarks for:
//! - Pure search against a linear cost curve, by declared max
//! - Full probe through the residency slot and sampler on the simulated daemon

use criterion::{BenchmarkId, Criterion, criterion_group, criterion_main};
use ctx_probe::client::{CostModel, SimulatedDaemon};
use ctx_probe::probe::SearchSettings;
use ctx_probe::sampler::SamplerConfig;
use ctx_probe::search::{SearchBounds, Trial, find_max_fit};
use ctx_probe::{ModelDescriptor, ProbeEngine, ResidencySlot, ResolvedBudget};
use std::convert::Infallible;
use std::hint::black_box;
use std::sync::Arc;
use tokio::runtime::Runtime;

const GB: u64 = 1_000_000_000;
const KB: u64 = 1_000;

/// Benchmark the search loop alone
fn bench_find_max_fit(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let mut group = c.benchmark_group("find_max_fit");

    for declared_max in [8192u32, 32768, 131072, 1_048_576] {
        let bounds = SearchBounds {
            min: 2048,
            max: declared_max,
            resolution: 256,
            max_iterations: 32,
        };

        group.bench_with_input(
            BenchmarkId::from_parameter(declared_max),
            &bounds,
            |b, &bounds| {
                b.to_async(&rt).iter(|| async move {
                    let outcome = find_max_fit(bounds, |ctx| async move {
                        let vram = 4 * GB + ctx as u64 * 100 * KB;
                        Ok::<_, Infallible>(if vram <= 5 * GB {
                            Trial::fits(ctx, vram)
                        } else {
                            Trial::does_not_fit(ctx, vram)
                        })
                    })
                    .await
                    .unwrap();
                    black_box(outcome.probes())
                });
            },
        );
    }

    group.finish();
}

/// Benchmark a full probe including load/sample/unload bookkeeping
fn bench_probe_engine(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let mut group = c.benchmark_group("probe_engine");

    let daemon = Arc::new(SimulatedDaemon::new(CostModel::linear(4 * GB, 100 * KB)));
    let engine = ProbeEngine::new(
        Arc::new(ResidencySlot::new(daemon)),
        SamplerConfig {
            poll_interval_ms: 1,
            max_wait_ms: 10,
            ..SamplerConfig::default()
        },
        ResolvedBudget::bytes(5 * GB),
        SearchSettings::default(),
    );
    let model = ModelDescriptor::new("bench-model", 131072);

    group.bench_function("linear_5gb", |b| {
        b.to_async(&rt).iter(|| async {
            let result = engine.probe(&model).await.unwrap();
            black_box(result.context_size)
        });
    });

    group.finish();
}

criterion_group!(benches, bench_find_max_fit, bench_probe_engine);
criterion_main!(benches);
