//! Similarity and diversity types produced by the diversity engine.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::SystemTime;

use serde::{Deserialize, Serialize};

use super::CandidateId;
use crate::error::{Error, MutationError, Result};

/// Method used to score how alike two candidates are.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SimilarityStrategy {
    /// Edit distance and token overlap on the prompt text.
    #[default]
    Text,
    /// Overlap of segment types and prompt patterns.
    Structural,
    /// Embedding cosine similarity (external provider).
    Semantic,
    /// Execution-trace overlap (external provider).
    Behavioral,
    /// Weighted combination of the four above.
    Composite,
}

impl fmt::Display for SimilarityStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SimilarityStrategy::Text => "text",
            SimilarityStrategy::Structural => "structural",
            SimilarityStrategy::Semantic => "semantic",
            SimilarityStrategy::Behavioral => "behavioral",
            SimilarityStrategy::Composite => "composite",
        };
        f.write_str(name)
    }
}

impl FromStr for SimilarityStrategy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "text" | "lexical" => Ok(SimilarityStrategy::Text),
            "structural" => Ok(SimilarityStrategy::Structural),
            "semantic" => Ok(SimilarityStrategy::Semantic),
            "behavioral" | "behavioural" => Ok(SimilarityStrategy::Behavioral),
            "composite" => Ok(SimilarityStrategy::Composite),
            other => Err(Error::UnknownStrategy {
                kind: "similarity",
                name: other.to_string(),
            }),
        }
    }
}

/// Pairwise comparison of two candidates under one strategy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimilarityResult {
    pub first: CandidateId,
    pub second: CandidateId,
    pub strategy: SimilarityStrategy,
    /// Score in [0, 1]; 1.0 means identical.
    pub score: f64,
    /// Sub-metric scores, for composite and fallback results.
    #[serde(default)]
    pub breakdown: BTreeMap<String, f64>,
}

/// Member of a matrix snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatrixMember {
    pub id: CandidateId,
    pub prompt: String,
    pub fitness: Option<f64>,
}

/// All unordered pairwise similarities for one population snapshot.
///
/// Results are stored row-major over the upper triangle: (0,1), (0,2), ...,
/// (0,n-1), (1,2), ...
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimilarityMatrix {
    strategy: SimilarityStrategy,
    generation: u64,
    computed_at: SystemTime,
    members: Vec<MatrixMember>,
    results: Vec<SimilarityResult>,
}

impl SimilarityMatrix {
    /// Assemble a matrix from results in upper-triangle order.
    pub fn from_results(
        strategy: SimilarityStrategy,
        generation: u64,
        members: Vec<MatrixMember>,
        results: Vec<SimilarityResult>,
    ) -> Result<Self> {
        let n = members.len();
        let expected = n * n.saturating_sub(1) / 2;
        if results.len() != expected {
            return Err(Error::Validation(format!(
                "Matrix over {n} members needs {expected} results, got {}",
                results.len()
            )));
        }
        Ok(Self {
            strategy,
            generation,
            computed_at: SystemTime::now(),
            members,
            results,
        })
    }

    pub fn strategy(&self) -> SimilarityStrategy {
        self.strategy
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn computed_at(&self) -> SystemTime {
        self.computed_at
    }

    pub fn members(&self) -> &[MatrixMember] {
        &self.members
    }

    pub fn results(&self) -> &[SimilarityResult] {
        &self.results
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn pair_count(&self) -> usize {
        self.results.len()
    }

    /// Index of a member by id.
    pub fn position(&self, id: &CandidateId) -> Option<usize> {
        self.members.iter().position(|m| &m.id == id)
    }

    /// Score between members `i` and `j`. The diagonal is 1.0.
    pub fn score(&self, i: usize, j: usize) -> Option<f64> {
        let n = self.members.len();
        if i >= n || j >= n {
            return None;
        }
        if i == j {
            return Some(1.0);
        }
        let (lo, hi) = if i < j { (i, j) } else { (j, i) };
        let idx = lo * n - lo * (lo + 1) / 2 + (hi - lo - 1);
        self.results.get(idx).map(|r| r.score)
    }

    /// Score between two candidates by id.
    pub fn score_between(&self, a: &CandidateId, b: &CandidateId) -> Result<f64> {
        let i = self
            .position(a)
            .ok_or_else(|| Error::candidate_not_found(a.as_str()))?;
        let j = self
            .position(b)
            .ok_or_else(|| Error::candidate_not_found(b.as_str()))?;
        self.score(i, j)
            .ok_or_else(|| Error::candidate_not_found(b.as_str()))
    }

    /// Mean similarity of member `i` to every other member.
    pub fn mean_similarity(&self, i: usize) -> f64 {
        let n = self.members.len();
        if n < 2 || i >= n {
            return 0.0;
        }
        let total: f64 = (0..n)
            .filter(|&j| j != i)
            .filter_map(|j| self.score(i, j))
            .sum();
        total / (n - 1) as f64
    }

    /// Iterate over `(i, j, score)` for every unordered pair.
    pub fn pairs(&self) -> impl Iterator<Item = (usize, usize, f64)> + '_ {
        let n = self.members.len();
        (0..n)
            .flat_map(move |i| ((i + 1)..n).map(move |j| (i, j)))
            .zip(self.results.iter())
            .map(|((i, j), r)| (i, j, r.score))
    }
}

/// Categorical diversity classification, worst first.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum DiversityLevel {
    #[default]
    Critical,
    Low,
    Moderate,
    Healthy,
    Excellent,
}

impl fmt::Display for DiversityLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DiversityLevel::Critical => "critical",
            DiversityLevel::Low => "low",
            DiversityLevel::Moderate => "moderate",
            DiversityLevel::Healthy => "healthy",
            DiversityLevel::Excellent => "excellent",
        };
        f.write_str(name)
    }
}

/// Scalar diversity summary of one snapshot.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct DiversityMetrics {
    /// 1 - mean pairwise similarity.
    pub pairwise_diversity: f64,
    /// Normalized Shannon entropy of the prompt distribution.
    pub entropy: f64,
    /// Distinct prompts / members.
    pub coverage: f64,
    /// Fraction of pairs below the similarity threshold.
    pub uniqueness_ratio: f64,
    /// Fraction of pairs at or above the similarity threshold.
    pub clustering_coefficient: f64,
    /// Estimated risk of collapse onto near-duplicates.
    pub convergence_risk: f64,
    /// Mean pairwise similarity.
    pub mean_similarity: f64,
    pub candidate_count: usize,
    pub pair_count: usize,
    pub diversity_level: DiversityLevel,
}

/// Novelty of one candidate relative to its neighbours.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NoveltyScore {
    pub candidate_id: CandidateId,
    /// Mean distance to the nearest neighbours, in [0, 1].
    pub score: f64,
    /// Neighbours actually used (may be fewer than requested k).
    pub neighbors: usize,
}

/// Intervention applied when diversity collapses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PromotionStrategy {
    RandomInjection,
    AdaptiveMutation,
    TargetedDiversification,
    All,
}

impl fmt::Display for PromotionStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PromotionStrategy::RandomInjection => "random_injection",
            PromotionStrategy::AdaptiveMutation => "adaptive_mutation",
            PromotionStrategy::TargetedDiversification => "targeted_diversification",
            PromotionStrategy::All => "all",
        };
        f.write_str(name)
    }
}

impl FromStr for PromotionStrategy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "random_injection" => Ok(PromotionStrategy::RandomInjection),
            "adaptive_mutation" => Ok(PromotionStrategy::AdaptiveMutation),
            "targeted_diversification" => Ok(PromotionStrategy::TargetedDiversification),
            "all" => Ok(PromotionStrategy::All),
            other => Err(Error::UnknownStrategy {
                kind: "promotion",
                name: other.to_string(),
            }),
        }
    }
}

/// Outcome of one promotion call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PromotionReport {
    pub strategy: PromotionStrategy,
    /// Candidates that were replaced.
    pub replaced: Vec<CandidateId>,
    /// Newly inserted candidates.
    pub injected: Vec<CandidateId>,
    pub clusters_detected: usize,
    pub clusters_diversified: usize,
    /// Clusters with at least one duplicate member left unmutated.
    pub clusters_unmutated: usize,
    /// Per-variant failures; successful peers are still applied.
    pub failures: Vec<MutationError>,
    /// Flags describing shortcuts or partial results.
    pub metadata: BTreeMap<String, serde_json::Value>,
}

impl PromotionReport {
    pub fn new(strategy: PromotionStrategy) -> Self {
        Self {
            strategy,
            replaced: Vec::new(),
            injected: Vec::new(),
            clusters_detected: 0,
            clusters_diversified: 0,
            clusters_unmutated: 0,
            failures: Vec::new(),
            metadata: BTreeMap::new(),
        }
    }

    /// Whether the population was left untouched.
    pub fn is_noop(&self) -> bool {
        self.replaced.is_empty() && self.injected.is_empty()
    }

    /// Fold the outcome of a follow-up step into this report.
    pub fn absorb(&mut self, other: PromotionReport) {
        self.replaced.extend(other.replaced);
        self.injected.extend(other.injected);
        self.clusters_detected += other.clusters_detected;
        self.clusters_diversified += other.clusters_diversified;
        self.clusters_unmutated += other.clusters_unmutated;
        self.failures.extend(other.failures);
        self.metadata.extend(other.metadata);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn member(id: &str) -> MatrixMember {
        MatrixMember {
            id: CandidateId::from(id),
            prompt: id.to_string(),
            fitness: None,
        }
    }

    fn result(a: &str, b: &str, score: f64) -> SimilarityResult {
        SimilarityResult {
            first: a.into(),
            second: b.into(),
            strategy: SimilarityStrategy::Text,
            score,
            breakdown: BTreeMap::new(),
        }
    }

    #[test]
    fn test_matrix_indexing() {
        let members = vec![member("a"), member("b"), member("c")];
        let results = vec![
            result("a", "b", 0.1),
            result("a", "c", 0.2),
            result("b", "c", 0.3),
        ];
        let matrix =
            SimilarityMatrix::from_results(SimilarityStrategy::Text, 0, members, results).unwrap();

        assert_eq!(matrix.score(0, 1), Some(0.1));
        assert_eq!(matrix.score(2, 0), Some(0.2));
        assert_eq!(matrix.score(1, 2), Some(0.3));
        assert_eq!(matrix.score(1, 1), Some(1.0));
        assert_eq!(matrix.score(3, 0), None);
        assert!((matrix.mean_similarity(2) - 0.25).abs() < 1e-12);
        assert_eq!(
            matrix.score_between(&"c".into(), &"b".into()).unwrap(),
            0.3
        );
        assert!(matrix.score_between(&"x".into(), &"b".into()).is_err());

        let pairs: Vec<_> = matrix.pairs().collect();
        assert_eq!(pairs, vec![(0, 1, 0.1), (0, 2, 0.2), (1, 2, 0.3)]);
    }

    #[test]
    fn test_matrix_rejects_wrong_result_count() {
        let members = vec![member("a"), member("b")];
        assert!(
            SimilarityMatrix::from_results(SimilarityStrategy::Text, 0, members, vec![]).is_err()
        );
    }

    #[test]
    fn test_level_ordering() {
        assert!(DiversityLevel::Critical < DiversityLevel::Low);
        assert!(DiversityLevel::Moderate < DiversityLevel::Healthy);
        assert!(DiversityLevel::Healthy < DiversityLevel::Excellent);
    }

    #[test]
    fn test_parse_strategies() {
        assert_eq!(
            "targeted-diversification".parse::<PromotionStrategy>().unwrap(),
            PromotionStrategy::TargetedDiversification
        );
        assert!(matches!(
            "shuffle".parse::<PromotionStrategy>(),
            Err(Error::UnknownStrategy { kind: "promotion", .. })
        ));
        assert_eq!(
            "Composite".parse::<SimilarityStrategy>().unwrap(),
            SimilarityStrategy::Composite
        );
        assert!("fuzzy".parse::<SimilarityStrategy>().is_err());
    }
}
