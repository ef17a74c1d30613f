//! Evolutionary prompt optimization: evaluation, diversity analysis and
//! diversity promotion.
//!
//! # Overview
//!
//! - **Evaluators** (`evaluator`): pluggable fitness for prompts, routed by
//!   task type with an explicit fallback
//! - **Similarity** (`similarity`): text, structural, semantic, behavioral and
//!   composite strategies
//! - **Diversity** (`diversity`): similarity matrices, diversity metrics and
//!   novelty scores
//! - **Novelty Archive** (`novelty`): bounded history of novel candidates
//! - **Promotion** (`promoter`): injection, targeted diversification and
//!   adaptive mutation rate
//! - **Optimizer** (`optimizer`): the generation loop tying it together
//!
//! # Example
//!
//! ```rust,no_run
//! use prompt_evo::compute::evolution::{EvaluatorRegistry, Optimizer};
//! use prompt_evo::schema::OptimizerConfig;
//!
//! let mut optimizer =
//!     Optimizer::new(OptimizerConfig::default(), EvaluatorRegistry::with_heuristics())?;
//! optimizer.seed(["Explain the answer step by step.", "Answer in one word."])?;
//!
//! let result = optimizer.run_with_callback(|report| {
//!     println!(
//!         "Generation {}: diversity {:.3} ({})",
//!         report.generation, report.metrics.pairwise_diversity, report.metrics.diversity_level
//!     );
//! })?;
//! println!("Stopped: {:?}", result.stats.stop_reason);
//! # Ok::<(), prompt_evo::Error>(())
//! ```

mod diversity;
mod evaluator;
mod novelty;
mod optimizer;
mod promoter;
mod similarity;

pub use diversity::DiversityEngine;
pub use evaluator::{
    EvaluationRequest, Evaluator, EvaluatorRegistry, FnEvaluator, HeuristicEvaluator,
    MetricResult, PromptMetric, WeightedMetric,
};
pub use novelty::{ArchivedCandidate, NoveltyArchive};
pub use optimizer::{GenerationReport, OptimizationResult, Optimizer};
pub use promoter::{
    DiversityPromoter, PromotionOptions, TemplateVariants, VariantGenerator, detect_clusters,
};
pub use similarity::{
    CandidateFeatures, EmbeddingProvider, SegmentKind, SimilarityEngine, TraceProvider,
    cosine_similarity, levenshtein, segment_prompt,
};
