//! Aggregation benchmarks
//!
//! FedAvg / FedProx / FedAdam over a fleet of client updates, plus the
//! two-proportion comparison used on every evaluation tick.
//!
//! Run with: cargo bench --bench aggregation

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use trueno_lab::config::AdamConfig;
use trueno_lab::experiment::stats::{confidence_from_z, z_score};
use trueno_lab::federated::{fed_avg, fed_prox, ClientUpdate, FedAdamState, Tensor};

const LAYER_SIZE: usize = 10_000;
const LAYERS: usize = 4;

fn updates(clients: usize) -> Vec<ClientUpdate> {
    (0..clients)
        .map(|c| ClientUpdate {
            client_id: format!("client-{c}"),
            weights: (0..LAYERS)
                .map(|l| {
                    Tensor::new(
                        (0..LAYER_SIZE)
                            .map(|i| ((c * 31 + l * 7 + i) % 97) as f64 / 97.0)
                            .collect(),
                    )
                })
                .collect(),
            data_size: 100 + (c as u64 * 37) % 900,
            loss: 0.0,
            accuracy: 0.0,
        })
        .collect()
}

fn global() -> Vec<Tensor> {
    (0..LAYERS).map(|_| Tensor::zeros(LAYER_SIZE)).collect()
}

/// Benchmark the three strategies as the fleet grows
fn bench_strategies(c: &mut Criterion) {
    let mut group = c.benchmark_group("federated_aggregation");
    let global = global();
    let adam = AdamConfig::default();

    for clients in [4, 16, 64] {
        let batch = updates(clients);

        group.bench_with_input(BenchmarkId::new("fed_avg", clients), &batch, |b, batch| {
            b.iter(|| fed_avg(black_box(batch)));
        });

        group.bench_with_input(BenchmarkId::new("fed_prox", clients), &batch, |b, batch| {
            b.iter(|| fed_prox(black_box(batch), &global, 0.01));
        });

        group.bench_with_input(BenchmarkId::new("fed_adam", clients), &batch, |b, batch| {
            let mut state = FedAdamState::default();
            b.iter(|| {
                let averaged = fed_avg(black_box(batch))?;
                state.apply(&global, &averaged, &adam)
            });
        });
    }

    group.finish();
}

/// Benchmark the significance approximation
fn bench_confidence(c: &mut Criterion) {
    c.bench_function("two_proportion_confidence", |b| {
        b.iter(|| confidence_from_z(z_score(black_box(0.40), 200, black_box(0.55), 200)));
    });
}

criterion_group!(benches, bench_strategies, bench_confidence);
criterion_main!(benches);
