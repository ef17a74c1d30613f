//! Diversity analysis: similarity matrices, aggregate metrics and novelty.

use std::collections::HashMap;
use std::sync::Arc;

use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rayon::prelude::*;

use crate::compute::PopulationSnapshot;
use crate::error::Result;
use crate::schema::{
    Candidate, CandidateId, DiversityConfig, DiversityLevel, DiversityMetrics, MatrixMember,
    NoveltyScore, SimilarityMatrix, SimilarityResult, SimilarityStrategy,
};

use super::similarity::{
    CandidateFeatures, EmbeddingProvider, SimilarityEngine, TraceProvider, normalize_text,
};

/// Computes similarity matrices, diversity metrics and novelty scores over
/// population snapshots.
#[derive(Clone)]
pub struct DiversityEngine {
    config: DiversityConfig,
    similarity: SimilarityEngine,
    seed: u64,
}

impl DiversityEngine {
    pub fn new(config: DiversityConfig) -> Self {
        let similarity = SimilarityEngine::new(config.composite_weights.clone());
        Self {
            config,
            similarity,
            seed: 0,
        }
    }

    /// Seed for neighbour sampling.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn with_embeddings(mut self, provider: Arc<dyn EmbeddingProvider>) -> Self {
        self.similarity = self.similarity.with_embeddings(provider);
        self
    }

    pub fn with_traces(mut self, provider: Arc<dyn TraceProvider>) -> Self {
        self.similarity = self.similarity.with_traces(provider);
        self
    }

    pub fn config(&self) -> &DiversityConfig {
        &self.config
    }

    pub fn compute_similarity(
        &self,
        a: &Candidate,
        b: &Candidate,
        strategy: SimilarityStrategy,
    ) -> SimilarityResult {
        self.similarity.compute_similarity(a, b, strategy)
    }

    fn extract_features(
        &self,
        candidates: &[Candidate],
        strategy: SimilarityStrategy,
    ) -> Vec<CandidateFeatures> {
        candidates
            .par_iter()
            .map(|c| self.similarity.features(c, strategy))
            .collect()
    }

    /// Compare every unordered pair of the snapshot.
    pub fn compute_matrix(
        &self,
        snapshot: &PopulationSnapshot,
        strategy: SimilarityStrategy,
    ) -> Result<SimilarityMatrix> {
        let candidates = &snapshot.candidates;
        let n = candidates.len();
        let features = self.extract_features(candidates, strategy);

        let pairs: Vec<(usize, usize)> = (0..n)
            .flat_map(|i| ((i + 1)..n).map(move |j| (i, j)))
            .collect();

        let results: Vec<SimilarityResult> = pairs
            .par_iter()
            .map(|&(i, j)| {
                let (score, breakdown) = self.similarity.compare(&features[i], &features[j], strategy);
                SimilarityResult {
                    first: candidates[i].id.clone(),
                    second: candidates[j].id.clone(),
                    strategy,
                    score,
                    breakdown,
                }
            })
            .collect();

        let members = candidates
            .iter()
            .map(|c| MatrixMember {
                id: c.id.clone(),
                prompt: c.prompt.clone(),
                fitness: c.fitness,
            })
            .collect();

        log::debug!(
            "Computed {strategy} matrix over {n} candidates ({} pairs)",
            results.len()
        );

        SimilarityMatrix::from_results(strategy, snapshot.generation, members, results)
    }

    /// Aggregate a matrix into scalar metrics and a diversity level.
    pub fn compute_metrics(&self, matrix: &SimilarityMatrix) -> DiversityMetrics {
        let n = matrix.len();
        let threshold = self.config.similarity_threshold;

        let mut counts: HashMap<String, usize> = HashMap::new();
        for member in matrix.members() {
            *counts.entry(normalize_text(&member.prompt)).or_default() += 1;
        }
        let coverage = if n == 0 {
            0.0
        } else {
            counts.len() as f64 / n as f64
        };
        let entropy = if n <= 1 {
            0.0
        } else {
            let h: f64 = counts
                .values()
                .map(|&c| {
                    let p = c as f64 / n as f64;
                    -p * p.ln()
                })
                .sum();
            h / (n as f64).ln()
        };

        let pair_count = matrix.pair_count();
        if pair_count == 0 {
            let convergence_risk = 0.5;
            return DiversityMetrics {
                pairwise_diversity: 0.0,
                entropy,
                coverage,
                uniqueness_ratio: 0.0,
                clustering_coefficient: 0.0,
                convergence_risk,
                mean_similarity: 0.0,
                candidate_count: n,
                pair_count,
                diversity_level: self.classify(0.0, convergence_risk),
            };
        }

        let (mut total, mut clustered) = (0.0, 0usize);
        for (_, _, score) in matrix.pairs() {
            total += score;
            if score >= threshold {
                clustered += 1;
            }
        }
        let mean_similarity = total / pair_count as f64;
        let pairwise_diversity = (1.0 - mean_similarity).clamp(0.0, 1.0);
        let clustering_coefficient = clustered as f64 / pair_count as f64;
        let uniqueness_ratio = 1.0 - clustering_coefficient;
        let convergence_risk =
            (0.5 * (1.0 - pairwise_diversity) + 0.5 * clustering_coefficient).clamp(0.0, 1.0);

        DiversityMetrics {
            pairwise_diversity,
            entropy,
            coverage,
            uniqueness_ratio,
            clustering_coefficient,
            convergence_risk,
            mean_similarity,
            candidate_count: n,
            pair_count,
            diversity_level: self.classify(pairwise_diversity, convergence_risk),
        }
    }

    /// Map pairwise diversity and convergence risk to a level, worst band
    /// first.
    pub fn classify(&self, pairwise_diversity: f64, convergence_risk: f64) -> DiversityLevel {
        let c = &self.config;
        let r = &c.risk_bands;
        let (pd, risk) = (pairwise_diversity, convergence_risk);

        if pd.is_nan() || risk.is_nan() || pd < c.critical_diversity || risk >= r.critical {
            DiversityLevel::Critical
        } else if pd < c.min_diversity || risk >= r.low {
            DiversityLevel::Low
        } else if pd < c.diversity_promotion_threshold || risk >= r.moderate {
            DiversityLevel::Moderate
        } else if pd >= c.excellent_diversity && risk < r.excellent {
            DiversityLevel::Excellent
        } else {
            DiversityLevel::Healthy
        }
    }

    /// Novelty of `candidate` against the other members of `snapshot`.
    pub fn compute_novelty(
        &self,
        candidate: &Candidate,
        snapshot: &PopulationSnapshot,
        k: usize,
    ) -> NoveltyScore {
        let strategy = self.config.strategy;
        let target = self.similarity.features(candidate, strategy);
        let others: Vec<&Candidate> = snapshot
            .candidates
            .iter()
            .filter(|c| c.id != candidate.id)
            .collect();
        let sampled = self.sample(others, id_salt(&candidate.id));
        let neighbors: Vec<CandidateFeatures> = sampled
            .par_iter()
            .map(|c| self.similarity.features(c, strategy))
            .collect();
        let (score, used) = self.knn_novelty(&target, neighbors.iter(), k);
        NoveltyScore {
            candidate_id: candidate.id.clone(),
            score,
            neighbors: used,
        }
    }

    /// Novelty of every member of `snapshot`.
    pub fn novelty_scores(&self, snapshot: &PopulationSnapshot, k: usize) -> Vec<NoveltyScore> {
        self.novelty_scores_with_archive(snapshot, &[], k)
    }

    /// Novelty of every member against the rest of the population and the
    /// archived candidates. Features are extracted once per candidate.
    pub fn novelty_scores_with_archive(
        &self,
        snapshot: &PopulationSnapshot,
        archive: &[Candidate],
        k: usize,
    ) -> Vec<NoveltyScore> {
        let strategy = self.config.strategy;
        let population = self.extract_features(&snapshot.candidates, strategy);
        let archived: Vec<CandidateFeatures> = self
            .extract_features(archive, strategy)
            .into_iter()
            .zip(archive)
            .filter(|(_, a)| snapshot.get(&a.id).is_none())
            .map(|(f, _)| f)
            .collect();

        snapshot
            .candidates
            .par_iter()
            .enumerate()
            .map(|(i, candidate)| {
                let others: Vec<&CandidateFeatures> = population
                    .iter()
                    .enumerate()
                    .filter(|&(j, _)| j != i)
                    .map(|(_, f)| f)
                    .chain(archived.iter())
                    .collect();
                let sampled = self.sample(others, id_salt(&candidate.id));
                let (score, used) = self.knn_novelty(&population[i], sampled.into_iter(), k);
                NoveltyScore {
                    candidate_id: candidate.id.clone(),
                    score,
                    neighbors: used,
                }
            })
            .collect()
    }

    /// Restrict neighbours to a seeded random sample when approximate search
    /// is configured.
    fn sample<T>(&self, mut items: Vec<T>, salt: u64) -> Vec<T> {
        match self.config.novelty_sample_size {
            Some(size) if size < items.len() => {
                let mut rng = StdRng::seed_from_u64(self.seed.wrapping_add(salt));
                items.shuffle(&mut rng);
                items.truncate(size);
                items
            }
            _ => items,
        }
    }

    /// Mean distance to the `k` nearest neighbours; 1.0 without neighbours.
    fn knn_novelty<'a>(
        &self,
        target: &CandidateFeatures,
        neighbors: impl Iterator<Item = &'a CandidateFeatures>,
        k: usize,
    ) -> (f64, usize) {
        let mut distances: Vec<f64> = neighbors
            .map(|n| 1.0 - self.similarity.compare(target, n, self.config.strategy).0)
            .collect();
        if distances.is_empty() || k == 0 {
            return (1.0, 0);
        }
        distances.sort_by(|a, b| a.total_cmp(b));
        let used = k.min(distances.len());
        let score = distances[..used].iter().sum::<f64>() / used as f64;
        (score.clamp(0.0, 1.0), used)
    }

    /// Blend fitness with novelty. Returns `fitness` unchanged when novelty
    /// rewards are disabled.
    pub fn novelty_adjusted_fitness(&self, fitness: f64, novelty: f64) -> f64 {
        if !self.config.enable_novelty_rewards {
            return fitness;
        }
        let w = self.config.novelty_weight;
        (1.0 - w) * fitness + w * novelty
    }
}

/// Stable per-candidate salt for neighbour sampling (FNV-1a over the id).
fn id_salt(id: &CandidateId) -> u64 {
    id.as_str()
        .bytes()
        .fold(0xcbf2_9ce4_8422_2325, |h, b| (h ^ b as u64).wrapping_mul(0x0100_0000_01b3))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compute::PopulationStore;
    use crate::error::ProviderError;
    use crate::schema::RiskBands;
    use proptest::prelude::*;

    /// One-hot embedding per distinct prompt, so distinct prompts are
    /// orthogonal.
    struct Orthogonal(Vec<String>);

    impl EmbeddingProvider for Orthogonal {
        fn embed(&self, text: &str) -> std::result::Result<Vec<f32>, ProviderError> {
            let slot = self
                .0
                .iter()
                .position(|p| p == text)
                .ok_or_else(|| ProviderError::Malformed(text.to_string()))?;
            let mut v = vec![0.0; self.0.len()];
            v[slot] = 1.0;
            Ok(v)
        }
    }

    fn snapshot(prompts: &[&str]) -> PopulationSnapshot {
        let mut store = PopulationStore::new();
        for (i, p) in prompts.iter().enumerate() {
            store
                .insert(Candidate::new(format!("c{i}"), *p, 0))
                .unwrap();
        }
        store.snapshot()
    }

    #[test]
    fn test_identical_prompts_are_critical() {
        let engine = DiversityEngine::new(DiversityConfig::default());
        let snap = snapshot(&["Solve the puzzle."; 5]);
        let matrix = engine.compute_matrix(&snap, SimilarityStrategy::Text).unwrap();
        let metrics = engine.compute_metrics(&matrix);

        assert_eq!(metrics.pair_count, 10);
        assert!(metrics.pairwise_diversity.abs() < 1e-9);
        assert_eq!(metrics.clustering_coefficient, 1.0);
        assert_eq!(metrics.uniqueness_ratio, 0.0);
        assert!((metrics.convergence_risk - 1.0).abs() < 1e-9);
        assert!((metrics.coverage - 0.2).abs() < 1e-9);
        assert_eq!(metrics.entropy, 0.0);
        assert_eq!(metrics.diversity_level, DiversityLevel::Critical);
    }

    #[test]
    fn test_orthogonal_prompts_are_diverse() {
        let prompts = ["alpha", "bravo", "charlie", "delta", "echo"];
        let engine = DiversityEngine::new(DiversityConfig::default()).with_embeddings(Arc::new(
            Orthogonal(prompts.iter().map(|p| p.to_string()).collect()),
        ));
        let snap = snapshot(&prompts);
        let matrix = engine
            .compute_matrix(&snap, SimilarityStrategy::Semantic)
            .unwrap();
        assert!(matrix.pairs().all(|(_, _, s)| s == 0.0));

        let metrics = engine.compute_metrics(&matrix);
        assert_eq!(metrics.pairwise_diversity, 1.0);
        assert_eq!(metrics.uniqueness_ratio, 1.0);
        assert_eq!(metrics.convergence_risk, 0.0);
        assert!((metrics.entropy - 1.0).abs() < 1e-9);
        assert_eq!(metrics.coverage, 1.0);
        assert!(metrics.diversity_level >= DiversityLevel::Healthy);
        assert_eq!(metrics.diversity_level, DiversityLevel::Excellent);
    }

    struct NonFinite;

    impl EmbeddingProvider for NonFinite {
        fn embed(&self, _: &str) -> std::result::Result<Vec<f32>, ProviderError> {
            Ok(vec![f32::NAN, 1.0, f32::INFINITY])
        }
    }

    #[test]
    fn test_non_finite_embeddings_fall_back_to_text() {
        let engine =
            DiversityEngine::new(DiversityConfig::default()).with_embeddings(Arc::new(NonFinite));
        let snap = snapshot(&["Solve the puzzle."; 5]);
        let matrix = engine
            .compute_matrix(&snap, SimilarityStrategy::Semantic)
            .unwrap();
        assert!(matrix.pairs().all(|(_, _, s)| s == 1.0));

        let result = engine.compute_similarity(
            &snap.candidates[0],
            &snap.candidates[1],
            SimilarityStrategy::Semantic,
        );
        assert_eq!(result.breakdown.get("fallback"), Some(&1.0));

        let metrics = engine.compute_metrics(&matrix);
        assert!(metrics.pairwise_diversity.is_finite());
        assert_eq!(metrics.diversity_level, DiversityLevel::Critical);
    }

    #[test]
    fn test_classify_nan_is_critical() {
        let engine = DiversityEngine::new(DiversityConfig::default());
        assert_eq!(engine.classify(f64::NAN, 0.0), DiversityLevel::Critical);
        assert_eq!(engine.classify(1.0, f64::NAN), DiversityLevel::Critical);
    }

    #[test]
    fn test_sampled_novelty_agrees_across_entry_points() {
        let engine = DiversityEngine::new(DiversityConfig {
            novelty_sample_size: Some(3),
            ..Default::default()
        })
        .with_seed(11);
        let snap = snapshot(&[
            "Write a poem.",
            "Write a haiku about rain.",
            "Explain gravity to a child.",
            "List three prime numbers.",
            "You are a judge. Rate the essay.",
            "Translate this into French.",
            "What is the capital of Peru?",
        ]);

        let batch = engine.novelty_scores(&snap, 2);
        for (candidate, scored) in snap.candidates.iter().zip(&batch) {
            let single = engine.compute_novelty(candidate, &snap, 2);
            assert_eq!(single.candidate_id, scored.candidate_id);
            assert!((single.score - scored.score).abs() < 1e-12);
            assert_eq!(single.neighbors, scored.neighbors);
        }
    }

    #[test]
    fn test_small_population_metrics() {
        let engine = DiversityEngine::new(DiversityConfig::default());
        let cases: [&[&str]; 2] = [&[], &["only one"]];
        for prompts in cases {
            let snap = snapshot(prompts);
            let matrix = engine.compute_matrix(&snap, SimilarityStrategy::Text).unwrap();
            let metrics = engine.compute_metrics(&matrix);
            assert_eq!(metrics.pair_count, 0);
            assert_eq!(metrics.pairwise_diversity, 0.0);
            assert_eq!(metrics.convergence_risk, 0.5);
            assert_eq!(metrics.entropy, 0.0);
            assert_eq!(metrics.diversity_level, DiversityLevel::Critical);
        }
    }

    #[test]
    fn test_matrix_matches_direct_similarity() {
        let engine = DiversityEngine::new(DiversityConfig::default());
        let snap = snapshot(&[
            "Explain the proof.",
            "Explain the proof briefly.",
            "You are a poet. Write a sonnet.",
        ]);
        let matrix = engine
            .compute_matrix(&snap, SimilarityStrategy::Composite)
            .unwrap();
        let direct = engine.compute_similarity(
            &snap.candidates[0],
            &snap.candidates[2],
            SimilarityStrategy::Composite,
        );
        assert_eq!(matrix.score(0, 2), Some(direct.score));
        assert_eq!(matrix.generation(), 0);
        assert_eq!(matrix.strategy(), SimilarityStrategy::Composite);
    }

    #[test]
    fn test_novelty_prefers_outlier() {
        let engine = DiversityEngine::new(DiversityConfig::default());
        let snap = snapshot(&[
            "Summarize the report.",
            "Summarize the report.",
            "Summarize the report!",
            "Translate the haiku into Portuguese verse.",
        ]);
        let scores = engine.novelty_scores(&snap, 2);
        assert_eq!(scores.len(), 4);
        let outlier = scores[3].score;
        assert!(scores[..3].iter().all(|s| s.score < outlier));
        assert_eq!(scores[0].neighbors, 2);

        let direct = engine.compute_novelty(&snap.candidates[3], &snap, 2);
        assert!((direct.score - outlier).abs() < 1e-12);
    }

    #[test]
    fn test_novelty_without_neighbors() {
        let engine = DiversityEngine::new(DiversityConfig::default());
        let snap = snapshot(&["alone"]);
        let score = engine.compute_novelty(&snap.candidates[0], &snap, 5);
        assert_eq!(score.score, 1.0);
        assert_eq!(score.neighbors, 0);
    }

    #[test]
    fn test_archive_lowers_novelty() {
        let engine = DiversityEngine::new(DiversityConfig::default());
        let snap = snapshot(&["Write a limerick.", "Derive the quadratic formula."]);
        let archive = vec![Candidate::new("old", "Write a limerick.", 0)];

        let plain = engine.novelty_scores(&snap, 1);
        let archived = engine.novelty_scores_with_archive(&snap, &archive, 1);
        assert!(archived[0].score < plain[0].score);
        assert_eq!(archived[0].score, 0.0);
    }

    #[test]
    fn test_sampled_novelty_is_reproducible() {
        let config = DiversityConfig {
            novelty_sample_size: Some(2),
            ..Default::default()
        };
        let engine = DiversityEngine::new(config).with_seed(11);
        let snap = snapshot(&["a b", "c d", "e f g", "h i j k", "l m n o p"]);
        let first = engine.novelty_scores(&snap, 5);
        let second = engine.novelty_scores(&snap, 5);
        assert_eq!(first, second);
        assert!(first.iter().all(|s| s.neighbors == 2));
    }

    #[test]
    fn test_novelty_adjusted_fitness() {
        let engine = DiversityEngine::new(DiversityConfig::default());
        assert!((engine.novelty_adjusted_fitness(1.0, 0.0) - 0.7).abs() < 1e-12);

        let engine = DiversityEngine::new(DiversityConfig {
            enable_novelty_rewards: false,
            ..Default::default()
        });
        assert_eq!(engine.novelty_adjusted_fitness(0.4, 1.0), 0.4);
    }

    #[test]
    fn test_classify_bands() {
        let engine = DiversityEngine::new(DiversityConfig {
            risk_bands: RiskBands::default(),
            ..Default::default()
        });
        assert_eq!(engine.classify(0.05, 0.0), DiversityLevel::Critical);
        assert_eq!(engine.classify(0.9, 0.95), DiversityLevel::Critical);
        assert_eq!(engine.classify(0.2, 0.1), DiversityLevel::Low);
        assert_eq!(engine.classify(0.4, 0.1), DiversityLevel::Moderate);
        assert_eq!(engine.classify(0.6, 0.3), DiversityLevel::Healthy);
        assert_eq!(engine.classify(0.85, 0.1), DiversityLevel::Excellent);
        assert_eq!(engine.classify(0.85, 0.3), DiversityLevel::Healthy);
    }

    proptest! {
        #[test]
        fn prop_level_monotonic(
            pd in 0.0f64..=1.0,
            risk in 0.0f64..=1.0,
            dpd in 0.0f64..=1.0,
            drisk in 0.0f64..=1.0,
        ) {
            let engine = DiversityEngine::new(DiversityConfig::default());
            let better_pd = (pd + dpd).min(1.0);
            let better_risk = (risk - drisk).max(0.0);
            prop_assert!(engine.classify(pd, risk) <= engine.classify(better_pd, better_risk));
        }
    }
}
