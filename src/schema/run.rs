//! Run-level history and statistics for the optimization loop.

use serde::{Deserialize, Serialize};

use super::DiversityLevel;

/// Per-generation series for plotting.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunHistory {
    /// Best fitness per generation (`None` before anything was evaluated).
    pub best_fitness: Vec<Option<f64>>,
    /// Mean fitness per generation.
    pub mean_fitness: Vec<Option<f64>>,
    /// Standard deviation per generation.
    pub fitness_std: Vec<Option<f64>>,
    /// Pairwise diversity per generation.
    pub pairwise_diversity: Vec<f64>,
    /// Diversity level per generation.
    pub diversity_level: Vec<DiversityLevel>,
    /// Adapted mutation rate per generation.
    pub mutation_rate: Vec<f64>,
    /// Candidates replaced by promotion per generation.
    pub replaced: Vec<usize>,
}

impl RunHistory {
    pub fn len(&self) -> usize {
        self.pairwise_diversity.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pairwise_diversity.is_empty()
    }
}

/// Statistics for a finished run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunStats {
    /// Generations completed.
    pub generations: u64,
    /// Evaluations dispatched (completed and failed).
    pub total_evaluations: u64,
    pub best_fitness: Option<f64>,
    pub final_mean_fitness: Option<f64>,
    pub elapsed_seconds: f64,
    pub evaluations_per_second: f64,
    pub stop_reason: StopReason,
}

/// Reason the loop stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    /// Reached maximum generations.
    MaxGenerations,
    /// Reached target fitness.
    TargetReached,
    /// No improvement for the configured number of generations.
    Stagnation,
    /// Cancelled through the cancel handle.
    Cancelled,
}
