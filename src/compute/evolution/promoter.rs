//! Diversity promotion: reacts to collapsing diversity by replacing
//! near-duplicate candidates and raising the mutation rate.

use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use serde_json::json;

use crate::compute::PopulationStore;
use crate::error::{Error, MutationError, Result};
use crate::schema::{
    Candidate, CandidateId, DiversityLevel, DiversityMetrics, PromotionConfig, PromotionReport,
    PromotionStrategy, SimilarityMatrix,
};

/// Produces prompt variants from a template.
pub trait VariantGenerator: Send {
    /// Generate `count` variants of `template`, one result per variant.
    fn generate(&mut self, template: &str, count: usize) -> Vec<std::result::Result<String, MutationError>>;
}

/// Built-in generator: appends qualifying phrases chosen with a seeded RNG.
pub struct TemplateVariants {
    phrases: Vec<String>,
    rng: StdRng,
}

impl TemplateVariants {
    pub fn new(phrases: Vec<String>, seed: u64) -> Self {
        Self {
            phrases,
            rng: StdRng::seed_from_u64(seed),
        }
    }
}

impl VariantGenerator for TemplateVariants {
    fn generate(&mut self, template: &str, count: usize) -> Vec<std::result::Result<String, MutationError>> {
        (0..count)
            .map(|_| {
                if self.phrases.is_empty() {
                    return Err(MutationError::Failed("no variant phrases configured".into()));
                }
                let take = if self.phrases.len() > 1 { 2 } else { 1 };
                let chosen: Vec<&str> = self
                    .phrases
                    .choose_multiple(&mut self.rng, take)
                    .map(String::as_str)
                    .collect();
                let variant = format!("{} {}", template.trim(), chosen.join(" "));
                let variant = variant.trim().to_string();
                if variant.is_empty() {
                    Err(MutationError::EmptyVariant)
                } else {
                    Ok(variant)
                }
            })
            .collect()
    }
}

/// Per-call options for [`DiversityPromoter::promote`].
#[derive(Debug, Clone, Default)]
pub struct PromotionOptions {
    /// Template for injected variants. Defaults to the best candidate's prompt.
    pub base_prompt: Option<String>,
}

/// Disjoint sets over matrix indices.
struct DisjointSet {
    parent: Vec<usize>,
}

impl DisjointSet {
    fn new(n: usize) -> Self {
        Self {
            parent: (0..n).collect(),
        }
    }

    fn find(&mut self, x: usize) -> usize {
        let mut root = x;
        while self.parent[root] != root {
            root = self.parent[root];
        }
        let mut node = x;
        while self.parent[node] != root {
            let next = self.parent[node];
            self.parent[node] = root;
            node = next;
        }
        root
    }

    fn union(&mut self, a: usize, b: usize) {
        let (ra, rb) = (self.find(a), self.find(b));
        if ra != rb {
            // Lower index becomes the root so clusters keep first-seen order.
            let (lo, hi) = if ra < rb { (ra, rb) } else { (rb, ra) };
            self.parent[hi] = lo;
        }
    }
}

/// Groups of at least two members whose pairwise chain of scores reaches the
/// threshold, each sorted by index, ordered by first member.
pub fn detect_clusters(matrix: &SimilarityMatrix, threshold: f64) -> Vec<Vec<usize>> {
    let n = matrix.len();
    let mut sets = DisjointSet::new(n);
    for (i, j, score) in matrix.pairs() {
        if score >= threshold {
            sets.union(i, j);
        }
    }

    let mut groups: Vec<Vec<usize>> = vec![Vec::new(); n];
    for i in 0..n {
        let root = sets.find(i);
        groups[root].push(i);
    }
    groups.into_iter().filter(|g| g.len() > 1).collect()
}

/// Applies promotion strategies to a population.
pub struct DiversityPromoter {
    config: PromotionConfig,
    similarity_threshold: f64,
    generator: Box<dyn VariantGenerator>,
}

impl DiversityPromoter {
    /// Create a promoter using [`TemplateVariants`] seeded with `seed`.
    pub fn new(config: PromotionConfig, similarity_threshold: f64, seed: u64) -> Self {
        let generator = Box::new(TemplateVariants::new(config.variant_phrases.clone(), seed));
        Self {
            config,
            similarity_threshold,
            generator,
        }
    }

    /// Replace the variant generator.
    pub fn with_generator(mut self, generator: Box<dyn VariantGenerator>) -> Self {
        self.generator = generator;
        self
    }

    pub fn config(&self) -> &PromotionConfig {
        &self.config
    }

    /// Number of candidates to replace by injection for a population of `n`.
    pub fn injection_count(&self, metrics: &DiversityMetrics, n: usize) -> usize {
        let fraction = self
            .config
            .injection_fractions
            .for_level(metrics.diversity_level);
        let mut count = (fraction * n as f64).floor() as usize;
        if count == 0 && fraction > 0.0 && n >= 2 {
            count = 1;
        }
        count.min(n)
    }

    /// Mutation rate scaled up as diversity worsens, rounded and then capped.
    pub fn adaptive_mutation_rate(&self, metrics: &DiversityMetrics, base_rate: f64) -> f64 {
        let multiplier = match metrics.diversity_level {
            DiversityLevel::Critical => 4.0,
            DiversityLevel::Low => 2.5,
            _ if metrics.convergence_risk > 0.7 => 2.0,
            _ if metrics.pairwise_diversity < self.config.target_diversity => 1.5,
            _ => 1.0,
        };
        let scale = 10f64.powi(self.config.rate_precision as i32);
        ((base_rate * multiplier * scale).round() / scale).min(self.config.max_mutation_rate)
    }

    /// Apply a promotion strategy to `store`.
    ///
    /// `matrix` and `metrics` describe an earlier snapshot of the store;
    /// members that have since left the store are skipped.
    pub fn promote(
        &mut self,
        store: &mut PopulationStore,
        matrix: &SimilarityMatrix,
        metrics: &DiversityMetrics,
        strategy: PromotionStrategy,
        opts: &PromotionOptions,
    ) -> Result<PromotionReport> {
        if store.is_empty() {
            return Err(Error::EmptyCollection {
                operation: "promote",
            });
        }

        let mut report = match strategy {
            PromotionStrategy::RandomInjection => self.random_injection(store, matrix, metrics, opts),
            PromotionStrategy::AdaptiveMutation => PromotionReport::new(strategy),
            PromotionStrategy::TargetedDiversification => self.targeted_diversification(store, matrix),
            PromotionStrategy::All => {
                let mut report = self.random_injection(store, matrix, metrics, opts);
                report.absorb(self.targeted_diversification(store, matrix));
                report
            }
        };
        report.strategy = strategy;

        let rate = self.adaptive_mutation_rate(metrics, self.config.base_mutation_rate);
        report.metadata.insert("mutation_rate".into(), json!(rate));
        report
            .metadata
            .insert("diversity_level".into(), json!(metrics.diversity_level));

        if !report.failures.is_empty() {
            log::warn!(
                "Promotion ({strategy}) had {} variant failures",
                report.failures.len()
            );
        }
        log::info!(
            "Promotion ({strategy}) at {} diversity: replaced {}, rate {rate}",
            metrics.diversity_level,
            report.replaced.len()
        );

        Ok(report)
    }

    fn random_injection(
        &mut self,
        store: &mut PopulationStore,
        matrix: &SimilarityMatrix,
        metrics: &DiversityMetrics,
        opts: &PromotionOptions,
    ) -> PromotionReport {
        let mut report = PromotionReport::new(PromotionStrategy::RandomInjection);
        let count = self.injection_count(metrics, store.len());
        if count == 0 {
            return report;
        }

        let elite = if self.config.protect_elite {
            store.best_candidate().map(|c| c.id.clone())
        } else {
            None
        };

        let mut ranked: Vec<(usize, f64)> = (0..matrix.len())
            .filter(|&i| {
                let id = &matrix.members()[i].id;
                store.contains(id) && Some(id) != elite.as_ref()
            })
            .map(|i| (i, matrix.mean_similarity(i)))
            .collect();
        ranked.sort_by(|a, b| b.1.total_cmp(&a.1).then(a.0.cmp(&b.0)));
        let targets: Vec<CandidateId> = ranked
            .into_iter()
            .take(count)
            .map(|(i, _)| matrix.members()[i].id.clone())
            .collect();
        if targets.len() < count {
            report
                .metadata
                .insert("injection_shortfall".into(), json!(count - targets.len()));
        }
        if targets.is_empty() {
            return report;
        }

        let base = opts
            .base_prompt
            .clone()
            .or_else(|| store.best_candidate().map(|c| c.prompt.clone()))
            .or_else(|| store.iter().next().map(|c| c.prompt.clone()));
        let Some(base) = base else {
            return report;
        };

        let variants = self.generator.generate(&base, targets.len());
        let mut variants = variants.into_iter();
        for old in targets {
            let outcome = variants.next().unwrap_or_else(|| {
                Err(MutationError::Failed(
                    "generator returned too few variants".into(),
                ))
            });
            self.apply_variant(store, &old, outcome, "injection", &mut report);
        }
        report
    }

    fn targeted_diversification(
        &mut self,
        store: &mut PopulationStore,
        matrix: &SimilarityMatrix,
    ) -> PromotionReport {
        let mut report = PromotionReport::new(PromotionStrategy::TargetedDiversification);
        let clusters = detect_clusters(matrix, self.similarity_threshold);
        report.clusters_detected = clusters.len();
        let mut skipped = 0usize;

        for cluster in clusters {
            let members = matrix.members();
            let fitness_of = |i: usize| {
                store
                    .get(&members[i].id)
                    .ok()
                    .and_then(|c| c.fitness)
                    .unwrap_or(f64::NEG_INFINITY)
            };
            let representative = cluster
                .iter()
                .copied()
                .filter(|&i| store.contains(&members[i].id))
                .fold(None, |best: Option<usize>, i| match best {
                    Some(b) if fitness_of(b) >= fitness_of(i) => Some(b),
                    _ => Some(i),
                });

            let mut mutated = 0usize;
            let mut left = 0usize;
            for &i in &cluster {
                if Some(i) == representative {
                    continue;
                }
                let id = &members[i].id;
                // Already replaced earlier in this promotion
                let Ok(current) = store.get(id) else {
                    skipped += 1;
                    mutated += 1;
                    continue;
                };
                let template = current.prompt.clone();
                let outcome = self
                    .generator
                    .generate(&template, 1)
                    .into_iter()
                    .next()
                    .unwrap_or(Err(MutationError::EmptyVariant));
                if self.apply_variant(store, id, outcome, "diversification", &mut report) {
                    mutated += 1;
                } else {
                    left += 1;
                }
            }

            if mutated > 0 {
                report.clusters_diversified += 1;
            }
            if left > 0 {
                report.clusters_unmutated += 1;
            }
        }

        if report.clusters_unmutated > 0 {
            report.metadata.insert("targeted_shortcut".into(), json!(true));
        }
        if skipped > 0 {
            report.metadata.insert("skipped_members".into(), json!(skipped));
        }
        log::debug!(
            "Detected {} clusters, diversified {}",
            report.clusters_detected,
            report.clusters_diversified
        );
        report
    }

    /// Swap `old` for a fresh candidate carrying `outcome`'s prompt. Failures
    /// are recorded in the report. Returns whether the swap happened.
    fn apply_variant(
        &self,
        store: &mut PopulationStore,
        old: &CandidateId,
        outcome: std::result::Result<String, MutationError>,
        origin: &str,
        report: &mut PromotionReport,
    ) -> bool {
        let prompt = match outcome {
            Ok(prompt) => prompt,
            Err(e) => {
                log::debug!("Variant for {old} failed: {e}");
                report.failures.push(e);
                return false;
            }
        };

        let candidate = Candidate::new(store.next_id(), prompt, store.generation())
            .with_parents(vec![old.clone()])
            .with_metadata("origin", json!(origin));
        let id = candidate.id.clone();
        match store.replace(old, candidate) {
            Ok(_) => {
                report.replaced.push(old.clone());
                report.injected.push(id);
                true
            }
            Err(e) => {
                report.failures.push(MutationError::Failed(e.to_string()));
                false
            }
        }
    }
}
