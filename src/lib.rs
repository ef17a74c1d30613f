//! prompt-evo - Evolutionary prompt optimization core.
//!
//! This crate schedules prompt evaluations, tracks a population of candidate
//! prompts, measures how diverse that population is, and intervenes when it
//! collapses onto near-duplicates.
//!
//! # Architecture
//!
//! The crate is split into two main modules:
//!
//! - `schema`: Candidate, task, diversity and configuration types
//! - `compute`: Priority queue, scheduler, population store and the
//!   `evolution` submodule (similarity, diversity, promotion, optimizer)
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use prompt_evo::{
//!     compute::{PopulationHandle, PopulationStore, Scheduler},
//!     compute::evolution::{DiversityEngine, EvaluatorRegistry, FnEvaluator},
//!     schema::{Candidate, OptimizerConfig, Priority},
//! };
//!
//! let config = OptimizerConfig::default();
//! let population = PopulationHandle::new(PopulationStore::new());
//! population.insert(Candidate::new("a", "Explain recursion.", 0))?;
//! population.insert(Candidate::new("b", "Explain recursion simply.", 0))?;
//!
//! // Evaluate every candidate
//! let scheduler = Scheduler::new(config.scheduler.clone())?;
//! let registry = EvaluatorRegistry::new(Arc::new(FnEvaluator::new(|_| Ok(0.5))));
//! scheduler.submit_all(&population, Priority::Normal)?;
//! scheduler.dispatch(&population, &registry);
//!
//! // Measure diversity
//! let engine = DiversityEngine::new(config.diversity.clone());
//! let matrix = engine.compute_matrix(&population.snapshot(), config.diversity.strategy)?;
//! let metrics = engine.compute_metrics(&matrix);
//! println!("Diversity: {:.3} ({})", metrics.pairwise_diversity, metrics.diversity_level);
//! # Ok::<(), prompt_evo::Error>(())
//! ```

pub mod compute;
pub mod error;
pub mod schema;

// Re-export commonly used types
pub use compute::evolution::{DiversityEngine, DiversityPromoter, Optimizer};
pub use compute::{PopulationHandle, PopulationStore, PriorityQueue, Scheduler};
pub use error::{Error, Result};
pub use schema::{Candidate, OptimizerConfig};
