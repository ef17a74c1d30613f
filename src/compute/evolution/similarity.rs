//! Similarity strategies for comparing candidate prompts.
//!
//! Text and structural similarity are computed locally. Semantic and
//! behavioral similarity delegate to an [`EmbeddingProvider`] or
//! [`TraceProvider`]; without one (or when the provider fails for a
//! candidate) they fall back to text similarity and mark the result with a
//! `fallback` entry in the breakdown.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use crate::error::ProviderError;
use crate::schema::{Candidate, CompositeWeights, SimilarityResult, SimilarityStrategy};

/// Supplies embeddings for prompt text.
pub trait EmbeddingProvider: Send + Sync {
    fn embed(&self, text: &str) -> Result<Vec<f32>, ProviderError>;
}

/// Supplies execution traces for a candidate (tool calls, intermediate
/// outputs, test outcomes, ...).
pub trait TraceProvider: Send + Sync {
    fn trace(&self, candidate: &Candidate) -> Result<Vec<String>, ProviderError>;
}

/// Lower-case and collapse whitespace.
pub(crate) fn normalize_text(text: &str) -> String {
    text.split_whitespace()
        .map(|w| w.to_lowercase())
        .collect::<Vec<_>>()
        .join(" ")
}

/// Split normalized text into alphanumeric tokens.
pub(crate) fn tokenize(normalized: &str) -> Vec<&str> {
    normalized
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .collect()
}

/// Levenshtein distance over chars, two-row.
pub fn levenshtein(a: &[char], b: &[char]) -> usize {
    if a.is_empty() {
        return b.len();
    }
    if b.is_empty() {
        return a.len();
    }

    let mut prev: Vec<usize> = (0..=b.len()).collect();
    let mut curr = vec![0; b.len() + 1];

    for (i, ca) in a.iter().enumerate() {
        curr[0] = i + 1;
        for (j, cb) in b.iter().enumerate() {
            let cost = usize::from(ca != cb);
            curr[j + 1] = (prev[j + 1] + 1).min(curr[j] + 1).min(prev[j] + cost);
        }
        std::mem::swap(&mut prev, &mut curr);
    }

    prev[b.len()]
}

fn jaccard<T: Eq + std::hash::Hash>(a: &HashSet<T>, b: &HashSet<T>) -> f64 {
    if a.is_empty() && b.is_empty() {
        return 1.0;
    }
    let intersection = a.intersection(b).count();
    let union = a.union(b).count();
    intersection as f64 / union as f64
}

/// Cosine similarity clamped to [0, 1]. Non-finite input scores 0.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f64 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let mut dot = 0.0f64;
    let mut na = 0.0f64;
    let mut nb = 0.0f64;
    for (x, y) in a.iter().zip(b) {
        let (x, y) = (*x as f64, *y as f64);
        dot += x * y;
        na += x * x;
        nb += y * y;
    }
    let cosine = dot / (na.sqrt() * nb.sqrt());
    if !(na >= 1e-12 && nb >= 1e-12) || !cosine.is_finite() {
        return 0.0;
    }
    cosine.clamp(0.0, 1.0)
}

/// Coarse role of one prompt segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SegmentKind {
    ListItem,
    Role,
    Question,
    Example,
    Constraint,
    Instruction,
    Context,
}

impl SegmentKind {
    const COUNT: usize = 7;

    fn index(self) -> usize {
        self as usize
    }
}

const IMPERATIVES: &[&str] = &[
    "write", "explain", "list", "describe", "summarize", "classify", "answer", "generate",
    "create", "provide", "give", "identify", "analyze", "translate", "return", "use", "think",
    "consider", "solve", "compute", "reason", "check", "verify", "be", "make", "focus", "state",
    "include", "respond", "output",
];

const CONSTRAINT_MARKERS: &[&str] = &[
    "must", "do not", "don't", "never", "avoid", "only", "at most", "at least",
];

fn is_list_item(line: &str) -> bool {
    if line.starts_with("- ") || line.starts_with("* ") {
        return true;
    }
    let digits = line.chars().take_while(|c| c.is_ascii_digit()).count();
    digits > 0 && matches!(line[digits..].chars().next(), Some('.') | Some(')'))
}

fn classify_segment(segment: &str) -> SegmentKind {
    let s = segment.to_lowercase();
    if s.starts_with("you are") || s.starts_with("act as") || s.contains("your role") {
        SegmentKind::Role
    } else if s.ends_with('?') {
        SegmentKind::Question
    } else if s.starts_with("example")
        || s.starts_with("e.g")
        || s.contains("for example")
        || s.starts_with("input:")
        || s.starts_with("output:")
    {
        SegmentKind::Example
    } else if CONSTRAINT_MARKERS.iter().any(|m| s.contains(m)) {
        SegmentKind::Constraint
    } else if s
        .split_whitespace()
        .next()
        .is_some_and(|w| IMPERATIVES.contains(&w.trim_matches(|c: char| !c.is_alphanumeric())))
    {
        SegmentKind::Instruction
    } else {
        SegmentKind::Context
    }
}

/// Split a prompt into classified segments: one per list line, otherwise one
/// per sentence.
pub fn segment_prompt(prompt: &str) -> Vec<SegmentKind> {
    let mut kinds = Vec::new();
    for line in prompt.lines().map(str::trim).filter(|l| !l.is_empty()) {
        if is_list_item(line) {
            kinds.push(SegmentKind::ListItem);
            continue;
        }
        let mut start = 0;
        for (i, c) in line.char_indices() {
            if matches!(c, '.' | '?' | '!') {
                let end = i + c.len_utf8();
                let sentence = line[start..end].trim();
                if sentence.chars().any(char::is_alphanumeric) {
                    kinds.push(classify_segment(sentence));
                }
                start = end;
            }
        }
        let rest = line[start..].trim();
        if rest.chars().any(char::is_alphanumeric) {
            kinds.push(classify_segment(rest));
        }
    }
    kinds
}

/// Prompt-level patterns compared by the structural strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum PromptPattern {
    Role,
    Examples,
    Steps,
    OutputFormat,
    Constraints,
    Question,
    Delimiters,
}

fn prompt_patterns(prompt: &str, kinds: &[SegmentKind]) -> HashSet<PromptPattern> {
    let lower = prompt.to_lowercase();
    let mut patterns = HashSet::new();
    if kinds.contains(&SegmentKind::Role) {
        patterns.insert(PromptPattern::Role);
    }
    if kinds.contains(&SegmentKind::Example) {
        patterns.insert(PromptPattern::Examples);
    }
    if kinds.contains(&SegmentKind::ListItem) || lower.contains("step") {
        patterns.insert(PromptPattern::Steps);
    }
    if ["format", "json", "output", "markdown"]
        .iter()
        .any(|k| lower.contains(k))
    {
        patterns.insert(PromptPattern::OutputFormat);
    }
    if kinds.contains(&SegmentKind::Constraint) {
        patterns.insert(PromptPattern::Constraints);
    }
    if kinds.contains(&SegmentKind::Question) {
        patterns.insert(PromptPattern::Question);
    }
    if ["```", "\"\"\"", "---", "###"].iter().any(|d| prompt.contains(d)) {
        patterns.insert(PromptPattern::Delimiters);
    }
    patterns
}

/// Per-candidate features, extracted once and reused across pairs.
#[derive(Debug, Clone)]
pub struct CandidateFeatures {
    pub normalized: String,
    chars: Vec<char>,
    tokens: HashSet<String>,
    profile: [f64; SegmentKind::COUNT],
    patterns: HashSet<PromptPattern>,
    embedding: Option<Vec<f32>>,
    trace: Option<HashSet<String>>,
}

/// Computes pairwise similarity under any strategy.
#[derive(Clone)]
pub struct SimilarityEngine {
    weights: CompositeWeights,
    embeddings: Option<Arc<dyn EmbeddingProvider>>,
    traces: Option<Arc<dyn TraceProvider>>,
}

impl SimilarityEngine {
    pub fn new(weights: CompositeWeights) -> Self {
        Self {
            weights,
            embeddings: None,
            traces: None,
        }
    }

    pub fn with_embeddings(mut self, provider: Arc<dyn EmbeddingProvider>) -> Self {
        self.embeddings = Some(provider);
        self
    }

    pub fn with_traces(mut self, provider: Arc<dyn TraceProvider>) -> Self {
        self.traces = Some(provider);
        self
    }

    fn needs_embedding(&self, strategy: SimilarityStrategy) -> bool {
        match strategy {
            SimilarityStrategy::Semantic => true,
            SimilarityStrategy::Composite => self.weights.semantic > 0.0,
            _ => false,
        }
    }

    fn needs_trace(&self, strategy: SimilarityStrategy) -> bool {
        match strategy {
            SimilarityStrategy::Behavioral => true,
            SimilarityStrategy::Composite => self.weights.behavioral > 0.0,
            _ => false,
        }
    }

    /// Extract the features a strategy needs. Provider calls happen here, once
    /// per candidate.
    pub fn features(&self, candidate: &Candidate, strategy: SimilarityStrategy) -> CandidateFeatures {
        let normalized = normalize_text(&candidate.prompt);
        let tokens = tokenize(&normalized)
            .into_iter()
            .map(str::to_string)
            .collect();
        let chars = normalized.chars().collect();

        let kinds = segment_prompt(&candidate.prompt);
        let mut profile = [0.0; SegmentKind::COUNT];
        for kind in &kinds {
            profile[kind.index()] += 1.0;
        }
        let total: f64 = profile.iter().sum();
        if total > 0.0 {
            profile.iter_mut().for_each(|p| *p /= total);
        }
        let patterns = prompt_patterns(&candidate.prompt, &kinds);

        let embedding = match (&self.embeddings, self.needs_embedding(strategy)) {
            (Some(provider), true) => provider
                .embed(&candidate.prompt)
                .and_then(|v| {
                    if v.iter().all(|x| x.is_finite()) {
                        Ok(v)
                    } else {
                        Err(ProviderError::Malformed(
                            "embedding contains non-finite values".to_string(),
                        ))
                    }
                })
                .inspect_err(|e| log::debug!("Embedding failed for {}: {e}", candidate.id))
                .ok(),
            _ => None,
        };
        let trace = match (&self.traces, self.needs_trace(strategy)) {
            (Some(provider), true) => provider
                .trace(candidate)
                .inspect_err(|e| log::debug!("Trace failed for {}: {e}", candidate.id))
                .ok()
                .map(|t| t.into_iter().collect()),
            _ => None,
        };

        CandidateFeatures {
            normalized,
            chars,
            tokens,
            profile,
            patterns,
            embedding,
            trace,
        }
    }

    /// Score two feature sets under a strategy.
    pub fn compare(
        &self,
        a: &CandidateFeatures,
        b: &CandidateFeatures,
        strategy: SimilarityStrategy,
    ) -> (f64, BTreeMap<String, f64>) {
        let mut breakdown = BTreeMap::new();
        let score = match strategy {
            SimilarityStrategy::Text => text_similarity(a, b, &mut breakdown),
            SimilarityStrategy::Structural => structural_similarity(a, b, &mut breakdown),
            SimilarityStrategy::Semantic => semantic_similarity(a, b, &mut breakdown),
            SimilarityStrategy::Behavioral => behavioral_similarity(a, b, &mut breakdown),
            SimilarityStrategy::Composite => {
                let w = &self.weights;
                let mut weighted = 0.0;
                let mut total = 0.0;
                for (name, weight, s) in [
                    ("text", w.text, SimilarityStrategy::Text),
                    ("structural", w.structural, SimilarityStrategy::Structural),
                    ("semantic", w.semantic, SimilarityStrategy::Semantic),
                    ("behavioral", w.behavioral, SimilarityStrategy::Behavioral),
                ] {
                    if weight <= 0.0 {
                        continue;
                    }
                    let (component, _) = self.compare(a, b, s);
                    breakdown.insert(name.to_string(), component);
                    weighted += weight * component;
                    total += weight;
                }
                if total > 0.0 { weighted / total } else { 0.0 }
            }
        };
        let score = if score.is_nan() { 0.0 } else { score.clamp(0.0, 1.0) };
        (score, breakdown)
    }

    /// Compare two candidates directly.
    pub fn compute_similarity(
        &self,
        a: &Candidate,
        b: &Candidate,
        strategy: SimilarityStrategy,
    ) -> SimilarityResult {
        let fa = self.features(a, strategy);
        let fb = self.features(b, strategy);
        let (score, breakdown) = self.compare(&fa, &fb, strategy);
        SimilarityResult {
            first: a.id.clone(),
            second: b.id.clone(),
            strategy,
            score,
            breakdown,
        }
    }
}

fn text_similarity(
    a: &CandidateFeatures,
    b: &CandidateFeatures,
    breakdown: &mut BTreeMap<String, f64>,
) -> f64 {
    let token_overlap = jaccard(&a.tokens, &b.tokens);
    let max_len = a.chars.len().max(b.chars.len());
    let edit_similarity = if max_len == 0 {
        1.0
    } else {
        1.0 - levenshtein(&a.chars, &b.chars) as f64 / max_len as f64
    };
    breakdown.insert("token_overlap".to_string(), token_overlap);
    breakdown.insert("edit_similarity".to_string(), edit_similarity);
    0.5 * token_overlap + 0.5 * edit_similarity
}

fn structural_similarity(
    a: &CandidateFeatures,
    b: &CandidateFeatures,
    breakdown: &mut BTreeMap<String, f64>,
) -> f64 {
    let (mut min_sum, mut max_sum) = (0.0, 0.0);
    for (x, y) in a.profile.iter().zip(&b.profile) {
        min_sum += x.min(*y);
        max_sum += x.max(*y);
    }
    let segment_profile = if max_sum > 0.0 { min_sum / max_sum } else { 1.0 };
    let patterns = jaccard(&a.patterns, &b.patterns);
    breakdown.insert("segment_profile".to_string(), segment_profile);
    breakdown.insert("patterns".to_string(), patterns);
    0.6 * segment_profile + 0.4 * patterns
}

fn semantic_similarity(
    a: &CandidateFeatures,
    b: &CandidateFeatures,
    breakdown: &mut BTreeMap<String, f64>,
) -> f64 {
    match (&a.embedding, &b.embedding) {
        (Some(ea), Some(eb)) => {
            let score = cosine_similarity(ea, eb);
            breakdown.insert("cosine".to_string(), score);
            score
        }
        _ => {
            breakdown.insert("fallback".to_string(), 1.0);
            text_similarity(a, b, breakdown)
        }
    }
}

fn behavioral_similarity(
    a: &CandidateFeatures,
    b: &CandidateFeatures,
    breakdown: &mut BTreeMap<String, f64>,
) -> f64 {
    match (&a.trace, &b.trace) {
        (Some(ta), Some(tb)) => {
            let score = jaccard(ta, tb);
            breakdown.insert("trace_overlap".to_string(), score);
            score
        }
        _ => {
            breakdown.insert("fallback".to_string(), 1.0);
            text_similarity(a, b, breakdown)
        }
    }
}
