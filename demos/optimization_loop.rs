//! Quick optimization loop performance test

use std::sync::Arc;
use std::time::Instant;

use prompt_evo::{
    Optimizer,
    compute::evolution::{EvaluatorRegistry, FnEvaluator},
    schema::{OptimizerConfig, RunConfig, SchedulerConfig, SimilarityStrategy},
};

const SEEDS: &[&str] = &[
    "Explain the answer step by step.",
    "Answer the question directly.",
    "You are an expert reviewer. Point out every flaw.",
    "Summarize the passage in two sentences.",
    "Write a function and include tests.",
];

fn config(workers: usize, strategy: SimilarityStrategy) -> OptimizerConfig {
    let mut config = OptimizerConfig {
        scheduler: SchedulerConfig {
            max_workers: workers,
            batch_size: 4,
            ..Default::default()
        },
        run: RunConfig {
            max_generations: 10,
            ..Default::default()
        },
        random_seed: Some(42),
        ..Default::default()
    };
    config.diversity.strategy = strategy;
    config
}

fn main() -> Result<(), prompt_evo::Error> {
    println!("=== Optimization Loop Performance Test ===\n");

    // Collapsed starting population: every seed repeated
    for strategy in [SimilarityStrategy::Text, SimilarityStrategy::Composite] {
        println!("Strategy: {strategy}");

        let mut optimizer = Optimizer::new(config(0, strategy), EvaluatorRegistry::with_heuristics())?;
        optimizer.seed(SEEDS.iter().cycle().take(40).copied())?;

        let start = Instant::now();
        let result = optimizer.run()?;
        let elapsed = start.elapsed();

        println!("  Generations:    {}", result.stats.generations);
        println!("  Evaluations:    {}", result.stats.total_evaluations);
        println!("  Elapsed:        {:.2}s", elapsed.as_secs_f64());
        println!(
            "  Diversity:      {:.3} -> {:.3}",
            result.history.pairwise_diversity.first().copied().unwrap_or(0.0),
            result.history.pairwise_diversity.last().copied().unwrap_or(0.0)
        );
        println!("  Replaced:       {}", result.history.replaced.iter().sum::<usize>());
        println!(
            "  Best fitness:   {:.4}",
            result.stats.best_fitness.unwrap_or(0.0)
        );
        println!();
    }

    println!("=== Scalability Test (slow evaluator) ===\n");

    // Worker counts against an evaluator with fixed latency
    for workers in [1, 2, 4, 8] {
        let registry = EvaluatorRegistry::new(Arc::new(FnEvaluator::new(|req| {
            std::thread::sleep(std::time::Duration::from_millis(2));
            Ok(req.candidate.prompt.len() as f64 / 100.0)
        })));
        let mut cfg = config(workers, SimilarityStrategy::Text);
        cfg.run.max_generations = 3;

        let mut optimizer = Optimizer::new(cfg, registry)?;
        optimizer.seed(SEEDS.iter().cycle().take(60).copied())?;

        let start = Instant::now();
        let result = optimizer.run()?;
        let elapsed = start.elapsed();

        println!(
            "Workers {}: {} evals in {:.2}s ({:.1} evals/sec)",
            workers,
            result.stats.total_evaluations,
            elapsed.as_secs_f64(),
            result.stats.total_evaluations as f64 / elapsed.as_secs_f64()
        );
    }

    Ok(())
}
