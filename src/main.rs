//! prompt-evo CLI - Run prompt optimization from JSON configuration.

use std::fs;
use std::path::PathBuf;

use serde::Deserialize;

use prompt_evo::{
    compute::evolution::{EvaluatorRegistry, Optimizer},
    schema::{Candidate, OptimizerConfig},
};

/// One entry of the prompts file: bare text or a full candidate.
#[derive(Deserialize)]
#[serde(untagged)]
enum PromptEntry {
    Text(String),
    Candidate(Candidate),
}

fn main() {
    env_logger::init();

    let args: Vec<String> = std::env::args().collect();

    if args.len() > 1 && args[1] == "--example" {
        print_example_config();
        return;
    }

    if args.len() < 3 {
        eprintln!("Usage: {} <config.json> <prompts.json>", args[0]);
        eprintln!();
        eprintln!("Run the prompt optimization loop with the built-in heuristic evaluators.");
        eprintln!();
        eprintln!("Arguments:");
        eprintln!("  config.json   Optimizer configuration (missing fields use defaults)");
        eprintln!("  prompts.json  JSON array of prompt strings or candidate objects");
        eprintln!();
        eprintln!("Example configuration is generated with --example flag.");
        std::process::exit(1);
    }

    let config_path = PathBuf::from(&args[1]);
    let prompts_path = PathBuf::from(&args[2]);

    let config = OptimizerConfig::from_path(&config_path).unwrap_or_else(|e| {
        eprintln!("Error loading config: {}", e);
        std::process::exit(1);
    });

    let prompts_str = fs::read_to_string(&prompts_path).unwrap_or_else(|e| {
        eprintln!("Error reading prompts file: {}", e);
        std::process::exit(1);
    });
    let entries: Vec<PromptEntry> = serde_json::from_str(&prompts_str).unwrap_or_else(|e| {
        eprintln!("Error parsing prompts: {}", e);
        std::process::exit(1);
    });

    let mut optimizer =
        Optimizer::new(config, EvaluatorRegistry::with_heuristics()).unwrap_or_else(|e| {
            eprintln!("Error creating optimizer: {}", e);
            std::process::exit(1);
        });

    for entry in entries {
        let outcome = match entry {
            PromptEntry::Text(prompt) => optimizer.seed([prompt]).map(|_| ()),
            PromptEntry::Candidate(candidate) => optimizer.population().insert(candidate),
        };
        if let Err(e) = outcome {
            eprintln!("Error seeding population: {}", e);
            std::process::exit(1);
        }
    }

    eprintln!("Prompt Evolution");
    eprintln!("================");
    eprintln!("Candidates: {}", optimizer.population().len());
    eprintln!("Workers: {}", optimizer.scheduler().worker_count());
    eprintln!();

    let result = optimizer
        .run_with_callback(|report| {
            eprintln!(
                "  Generation {}: best={}, diversity={:.3} ({}), rate={}, replaced={}",
                report.generation,
                report
                    .population
                    .best_fitness
                    .map_or("-".to_string(), |f| format!("{f:.4}")),
                report.metrics.pairwise_diversity,
                report.metrics.diversity_level,
                report.mutation_rate,
                report.promotion.as_ref().map_or(0, |p| p.replaced.len())
            );
        })
        .unwrap_or_else(|e| {
            eprintln!("Error during optimization: {}", e);
            std::process::exit(1);
        });

    eprintln!();
    eprintln!(
        "Stopped after {} generations ({:?}) in {:.2}s",
        result.stats.generations, result.stats.stop_reason, result.stats.elapsed_seconds
    );

    match serde_json::to_string_pretty(&result) {
        Ok(json) => println!("{}", json),
        Err(e) => {
            eprintln!("Error serializing result: {}", e);
            std::process::exit(1);
        }
    }
}

fn print_example_config() {
    let config = OptimizerConfig::default();
    match serde_json::to_string_pretty(&config) {
        Ok(json) => println!("{}", json),
        Err(e) => eprintln!("Error serializing config: {}", e),
    }
}
