//! Benchmarks for similarity matrices and novelty scoring.

use criterion::{BenchmarkId, Criterion, black_box, criterion_group, criterion_main};

use prompt_evo::{
    compute::{PopulationSnapshot, PopulationStore},
    compute::evolution::DiversityEngine,
    schema::{Candidate, DiversityConfig, SimilarityStrategy},
};

const FRAGMENTS: &[&str] = &[
    "You are a careful assistant.",
    "Explain your reasoning step by step.",
    "Answer in at most three sentences.",
    "Use a concrete example.",
    "What is the main risk?",
    "- list the assumptions",
    "Never invent citations.",
    "Summarize the input below.",
];

fn snapshot(size: usize) -> PopulationSnapshot {
    let mut store = PopulationStore::new();
    for i in 0..size {
        let prompt: Vec<&str> = (0..4)
            .map(|k| FRAGMENTS[(i * 3 + k * 5) % FRAGMENTS.len()])
            .collect();
        let prompt = format!("{} (variant {i})", prompt.join("\n"));
        store
            .insert(Candidate::new(format!("c{i}"), prompt, 0))
            .expect("unique ids");
    }
    store.snapshot()
}

fn bench_matrix(c: &mut Criterion) {
    let mut group = c.benchmark_group("similarity_matrix");
    let engine = DiversityEngine::new(DiversityConfig::default());

    for strategy in [
        SimilarityStrategy::Text,
        SimilarityStrategy::Structural,
        SimilarityStrategy::Composite,
    ] {
        for size in [16, 64, 128] {
            let snap = snapshot(size);
            group.bench_with_input(
                BenchmarkId::new(strategy.to_string(), size),
                &size,
                |b, _| {
                    b.iter(|| engine.compute_matrix(black_box(&snap), strategy));
                },
            );
        }
    }

    group.finish();
}

fn bench_novelty(c: &mut Criterion) {
    let mut group = c.benchmark_group("novelty");

    for sample in [None, Some(16)] {
        let engine = DiversityEngine::new(DiversityConfig {
            novelty_sample_size: sample,
            ..Default::default()
        })
        .with_seed(42);
        let snap = snapshot(128);
        let label = sample.map_or("exact".to_string(), |s| format!("sample_{s}"));

        group.bench_function(label, |b| {
            b.iter(|| engine.novelty_scores(black_box(&snap), 5));
        });
    }

    group.finish();
}

criterion_group!(benches, bench_matrix, bench_novelty);
criterion_main!(benches);
