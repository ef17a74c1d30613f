//! Configuration types for the optimization loop.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use super::{DiversityLevel, Priority, PromotionStrategy, SimilarityStrategy, TaskType};

/// Top-level configuration for an optimization run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OptimizerConfig {
    /// Diversity analysis settings.
    #[serde(default)]
    pub diversity: DiversityConfig,
    /// Diversity intervention settings.
    #[serde(default)]
    pub promotion: PromotionConfig,
    /// Evaluation scheduling settings.
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    /// Generation loop settings.
    #[serde(default)]
    pub run: RunConfig,
    /// Random seed for reproducibility.
    #[serde(default)]
    pub random_seed: Option<u64>,
}

impl OptimizerConfig {
    /// Load and validate a configuration from a JSON file.
    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }
}

/// Thresholds and strategy selection for diversity analysis.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiversityConfig {
    /// Similarity strategy used for matrices and novelty.
    #[serde(default)]
    pub strategy: SimilarityStrategy,
    /// Pairs at or above this score count as near-duplicates.
    #[serde(default = "default_similarity_threshold")]
    pub similarity_threshold: f64,
    /// Pairwise diversity below this is `low`.
    #[serde(default = "default_min_diversity")]
    pub min_diversity: f64,
    /// Pairwise diversity below this is `moderate` and triggers promotion.
    #[serde(default = "default_promotion_threshold")]
    pub diversity_promotion_threshold: f64,
    /// Pairwise diversity below this is `critical`.
    #[serde(default = "default_critical_diversity")]
    pub critical_diversity: f64,
    /// Pairwise diversity at or above this (with low risk) is `excellent`.
    #[serde(default = "default_excellent_diversity")]
    pub excellent_diversity: f64,
    /// Convergence risk bands.
    #[serde(default)]
    pub risk_bands: RiskBands,
    /// Weight of novelty in novelty-adjusted fitness (0.0-1.0).
    #[serde(default = "default_novelty_weight")]
    pub novelty_weight: f64,
    /// Whether novelty contributes to candidate ranking.
    #[serde(default = "default_enable_novelty")]
    pub enable_novelty_rewards: bool,
    /// Number of nearest neighbours for novelty.
    #[serde(default = "default_novelty_k")]
    pub novelty_k: usize,
    /// Neighbour sample size for approximate novelty search. `None` = exact.
    #[serde(default)]
    pub novelty_sample_size: Option<usize>,
    /// Maximum novelty archive size.
    #[serde(default = "default_archive_size")]
    pub archive_size: usize,
    /// Novelty required to enter the archive.
    #[serde(default = "default_archive_threshold")]
    pub archive_threshold: f64,
    /// Component weights for the composite strategy.
    #[serde(default)]
    pub composite_weights: CompositeWeights,
}

impl Default for DiversityConfig {
    fn default() -> Self {
        Self {
            strategy: SimilarityStrategy::default(),
            similarity_threshold: default_similarity_threshold(),
            min_diversity: default_min_diversity(),
            diversity_promotion_threshold: default_promotion_threshold(),
            critical_diversity: default_critical_diversity(),
            excellent_diversity: default_excellent_diversity(),
            risk_bands: RiskBands::default(),
            novelty_weight: default_novelty_weight(),
            enable_novelty_rewards: default_enable_novelty(),
            novelty_k: default_novelty_k(),
            novelty_sample_size: None,
            archive_size: default_archive_size(),
            archive_threshold: default_archive_threshold(),
            composite_weights: CompositeWeights::default(),
        }
    }
}

fn default_similarity_threshold() -> f64 {
    0.8
}
fn default_min_diversity() -> f64 {
    0.3
}
fn default_promotion_threshold() -> f64 {
    0.5
}
fn default_critical_diversity() -> f64 {
    0.1
}
fn default_excellent_diversity() -> f64 {
    0.8
}
fn default_novelty_weight() -> f64 {
    0.3
}
fn default_enable_novelty() -> bool {
    true
}
fn default_novelty_k() -> usize {
    5
}
fn default_archive_size() -> usize {
    100
}
fn default_archive_threshold() -> f64 {
    0.5
}

/// Convergence risk at or above which a level is assigned.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskBands {
    #[serde(default = "default_risk_critical")]
    pub critical: f64,
    #[serde(default = "default_risk_low")]
    pub low: f64,
    #[serde(default = "default_risk_moderate")]
    pub moderate: f64,
    /// Risk must stay below this for `excellent`.
    #[serde(default = "default_risk_excellent")]
    pub excellent: f64,
}

impl Default for RiskBands {
    fn default() -> Self {
        Self {
            critical: default_risk_critical(),
            low: default_risk_low(),
            moderate: default_risk_moderate(),
            excellent: default_risk_excellent(),
        }
    }
}

fn default_risk_critical() -> f64 {
    0.9
}
fn default_risk_low() -> f64 {
    0.7
}
fn default_risk_moderate() -> f64 {
    0.5
}
fn default_risk_excellent() -> f64 {
    0.2
}

/// Component weights for composite similarity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompositeWeights {
    #[serde(default = "default_text_weight")]
    pub text: f64,
    #[serde(default = "default_structural_weight")]
    pub structural: f64,
    #[serde(default = "default_semantic_weight")]
    pub semantic: f64,
    #[serde(default = "default_behavioral_weight")]
    pub behavioral: f64,
}

impl Default for CompositeWeights {
    fn default() -> Self {
        Self {
            text: default_text_weight(),
            structural: default_structural_weight(),
            semantic: default_semantic_weight(),
            behavioral: default_behavioral_weight(),
        }
    }
}

impl CompositeWeights {
    pub fn total(&self) -> f64 {
        self.text + self.structural + self.semantic + self.behavioral
    }
}

fn default_text_weight() -> f64 {
    0.4
}
fn default_structural_weight() -> f64 {
    0.3
}
fn default_semantic_weight() -> f64 {
    0.2
}
fn default_behavioral_weight() -> f64 {
    0.1
}

/// Settings for diversity interventions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromotionConfig {
    /// Strategy applied when diversity drops below the promotion threshold.
    #[serde(default = "default_promotion_strategy")]
    pub strategy: PromotionStrategy,
    /// Base mutation rate handed to the external mutation operator.
    #[serde(default = "default_base_mutation_rate")]
    pub base_mutation_rate: f64,
    /// Upper bound for the adapted mutation rate.
    #[serde(default = "default_max_mutation_rate")]
    pub max_mutation_rate: f64,
    /// Pairwise diversity below this raises the mutation rate.
    #[serde(default = "default_target_diversity")]
    pub target_diversity: f64,
    /// Decimal places the adapted rate is rounded to.
    #[serde(default = "default_rate_precision")]
    pub rate_precision: u32,
    /// Fraction of the population replaced per level.
    #[serde(default)]
    pub injection_fractions: InjectionFractions,
    /// Never replace the best evaluated candidate.
    #[serde(default = "default_protect_elite")]
    pub protect_elite: bool,
    /// Qualifying phrases used by the built-in variant generator.
    #[serde(default = "default_variant_phrases")]
    pub variant_phrases: Vec<String>,
}

impl Default for PromotionConfig {
    fn default() -> Self {
        Self {
            strategy: default_promotion_strategy(),
            base_mutation_rate: default_base_mutation_rate(),
            max_mutation_rate: default_max_mutation_rate(),
            target_diversity: default_target_diversity(),
            rate_precision: default_rate_precision(),
            injection_fractions: InjectionFractions::default(),
            protect_elite: default_protect_elite(),
            variant_phrases: default_variant_phrases(),
        }
    }
}

fn default_promotion_strategy() -> PromotionStrategy {
    PromotionStrategy::All
}
fn default_base_mutation_rate() -> f64 {
    0.1
}
fn default_max_mutation_rate() -> f64 {
    0.5
}
fn default_target_diversity() -> f64 {
    0.5
}
fn default_rate_precision() -> u32 {
    4
}
fn default_protect_elite() -> bool {
    true
}
fn default_variant_phrases() -> Vec<String> {
    [
        "Be concise.",
        "Explain your reasoning step by step.",
        "Consider edge cases.",
        "Use concrete examples.",
        "State your assumptions first.",
        "Answer in a structured format.",
        "Double-check the result before answering.",
        "Focus on the most important points.",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

/// Fraction of the population replaced by injection at each level.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InjectionFractions {
    #[serde(default = "default_critical_fraction")]
    pub critical: f64,
    #[serde(default = "default_low_fraction")]
    pub low: f64,
    #[serde(default = "default_moderate_fraction")]
    pub moderate: f64,
}

impl Default for InjectionFractions {
    fn default() -> Self {
        Self {
            critical: default_critical_fraction(),
            low: default_low_fraction(),
            moderate: default_moderate_fraction(),
        }
    }
}

impl InjectionFractions {
    /// Fraction for a level; healthy and excellent populations get none.
    pub fn for_level(&self, level: DiversityLevel) -> f64 {
        match level {
            DiversityLevel::Critical => self.critical,
            DiversityLevel::Low => self.low,
            DiversityLevel::Moderate => self.moderate,
            DiversityLevel::Healthy | DiversityLevel::Excellent => 0.0,
        }
    }
}

fn default_critical_fraction() -> f64 {
    0.3
}
fn default_low_fraction() -> f64 {
    0.2
}
fn default_moderate_fraction() -> f64 {
    0.1
}

/// Evaluation scheduling settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Number of worker threads (0 = auto-detect).
    #[serde(default)]
    pub max_workers: usize,
    /// Tasks pulled from the queue per worker round.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// When false, every task is routed to `normal`.
    #[serde(default = "default_priority_routing")]
    pub priority_routing: bool,
    /// Time limit handed to evaluators, in milliseconds.
    #[serde(default)]
    pub evaluation_timeout_ms: Option<u64>,
    /// Task type used when submitting without an explicit evaluator.
    #[serde(default)]
    pub default_task_type: TaskType,
    /// Priority for candidates created by injection.
    #[serde(default = "default_injected_priority")]
    pub injected_priority: Priority,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_workers: 0,
            batch_size: default_batch_size(),
            priority_routing: default_priority_routing(),
            evaluation_timeout_ms: None,
            default_task_type: TaskType::default(),
            injected_priority: default_injected_priority(),
        }
    }
}

fn default_batch_size() -> usize {
    1
}
fn default_priority_routing() -> bool {
    true
}
fn default_injected_priority() -> Priority {
    Priority::High
}

/// Generation loop settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunConfig {
    /// Maximum number of generations.
    #[serde(default = "default_max_generations")]
    pub max_generations: u64,
    /// Target fitness to stop early.
    #[serde(default)]
    pub target_fitness: Option<f64>,
    /// Stop if no improvement for N generations.
    #[serde(default)]
    pub stagnation_limit: Option<u64>,
    /// Template prompt for injected variants. Defaults to the best candidate.
    #[serde(default)]
    pub base_prompt: Option<String>,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            max_generations: default_max_generations(),
            target_fitness: None,
            stagnation_limit: None,
            base_prompt: None,
        }
    }
}

fn default_max_generations() -> u64 {
    10
}

// ============================================================================
// Validation
// ============================================================================

/// Configuration validation errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{name} must be within [0, 1], got {value}")]
    OutOfUnitRange { name: &'static str, value: f64 },
    #[error("Diversity bands must be ordered: {0}")]
    UnorderedBands(String),
    #[error("Composite weights must be non-negative and not all zero")]
    InvalidWeights,
    #[error("{0} must be positive")]
    NotPositive(&'static str),
    #[error("Failed to read config: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),
}

fn check_unit(name: &'static str, value: f64) -> Result<(), ConfigError> {
    if (0.0..=1.0).contains(&value) {
        Ok(())
    } else {
        Err(ConfigError::OutOfUnitRange { name, value })
    }
}

impl DiversityConfig {
    /// Validate thresholds and band ordering.
    pub fn validate(&self) -> Result<(), ConfigError> {
        check_unit("similarity_threshold", self.similarity_threshold)?;
        check_unit("min_diversity", self.min_diversity)?;
        check_unit(
            "diversity_promotion_threshold",
            self.diversity_promotion_threshold,
        )?;
        check_unit("critical_diversity", self.critical_diversity)?;
        check_unit("excellent_diversity", self.excellent_diversity)?;
        check_unit("novelty_weight", self.novelty_weight)?;
        check_unit("archive_threshold", self.archive_threshold)?;

        if !(self.critical_diversity <= self.min_diversity
            && self.min_diversity <= self.diversity_promotion_threshold
            && self.diversity_promotion_threshold <= self.excellent_diversity)
        {
            return Err(ConfigError::UnorderedBands(format!(
                "critical ({}) <= min ({}) <= promotion ({}) <= excellent ({})",
                self.critical_diversity,
                self.min_diversity,
                self.diversity_promotion_threshold,
                self.excellent_diversity
            )));
        }

        let r = &self.risk_bands;
        for (name, value) in [
            ("risk_bands.critical", r.critical),
            ("risk_bands.low", r.low),
            ("risk_bands.moderate", r.moderate),
            ("risk_bands.excellent", r.excellent),
        ] {
            check_unit(name, value)?;
        }
        if !(r.excellent <= r.moderate && r.moderate <= r.low && r.low <= r.critical) {
            return Err(ConfigError::UnorderedBands(format!(
                "risk excellent ({}) <= moderate ({}) <= low ({}) <= critical ({})",
                r.excellent, r.moderate, r.low, r.critical
            )));
        }

        let w = &self.composite_weights;
        if w.text < 0.0 || w.structural < 0.0 || w.semantic < 0.0 || w.behavioral < 0.0 {
            return Err(ConfigError::InvalidWeights);
        }
        if w.total() <= 0.0 {
            return Err(ConfigError::InvalidWeights);
        }

        if self.novelty_k == 0 {
            return Err(ConfigError::NotPositive("novelty_k"));
        }

        Ok(())
    }
}

impl PromotionConfig {
    /// Validate rates and fractions.
    pub fn validate(&self) -> Result<(), ConfigError> {
        check_unit("base_mutation_rate", self.base_mutation_rate)?;
        check_unit("max_mutation_rate", self.max_mutation_rate)?;
        check_unit("target_diversity", self.target_diversity)?;

        let f = &self.injection_fractions;
        check_unit("injection_fractions.critical", f.critical)?;
        check_unit("injection_fractions.low", f.low)?;
        check_unit("injection_fractions.moderate", f.moderate)?;
        if !(f.moderate <= f.low && f.low <= f.critical) {
            return Err(ConfigError::UnorderedBands(format!(
                "injection moderate ({}) <= low ({}) <= critical ({})",
                f.moderate, f.low, f.critical
            )));
        }

        Ok(())
    }
}

impl OptimizerConfig {
    /// Validate the full configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.diversity.validate()?;
        self.promotion.validate()?;

        if self.scheduler.batch_size == 0 {
            return Err(ConfigError::NotPositive("scheduler.batch_size"));
        }
        if self.run.max_generations == 0 {
            return Err(ConfigError::NotPositive("run.max_generations"));
        }

        Ok(())
    }
}
