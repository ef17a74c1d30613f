//! Evaluator routing and built-in heuristic fitness for prompts.
//!
//! Real evaluators call an inference service; they plug in through the
//! [`Evaluator`] trait. The heuristic evaluator scores prompt text directly and
//! is what the CLI and tests run with.

use std::any::Any;
use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::similarity::{normalize_text, tokenize};
use crate::error::{EntityKind, Error, EvaluationError, Result};
use crate::schema::{Candidate, EvaluatorRef, TaskType};

/// Input to one evaluation.
#[derive(Debug, Clone)]
pub struct EvaluationRequest {
    pub candidate: Candidate,
    pub task_type: TaskType,
    /// Limit the evaluator should honour; exceeding it is reported as
    /// [`EvaluationError::Timeout`].
    pub timeout: Option<Duration>,
}

/// Scores a candidate prompt.
pub trait Evaluator: Send + Sync {
    /// Evaluate one candidate.
    fn evaluate(&self, request: &EvaluationRequest) -> std::result::Result<f64, EvaluationError>;

    /// Evaluate a batch. Must return exactly one result per request, in order.
    fn evaluate_batch(
        &self,
        requests: &[EvaluationRequest],
    ) -> Vec<std::result::Result<f64, EvaluationError>> {
        requests.iter().map(|r| self.evaluate(r)).collect()
    }
}

/// Evaluator backed by a closure.
pub struct FnEvaluator<F>(F);

impl<F> FnEvaluator<F>
where
    F: Fn(&EvaluationRequest) -> std::result::Result<f64, EvaluationError> + Send + Sync,
{
    pub fn new(f: F) -> Self {
        Self(f)
    }
}

impl<F> Evaluator for FnEvaluator<F>
where
    F: Fn(&EvaluationRequest) -> std::result::Result<f64, EvaluationError> + Send + Sync,
{
    fn evaluate(&self, request: &EvaluationRequest) -> std::result::Result<f64, EvaluationError> {
        (self.0)(request)
    }
}

/// Text-level signal used by the heuristic evaluator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum PromptMetric {
    /// Word count close to a target length.
    LengthFit { target_words: usize },
    /// Fraction of task keywords present.
    KeywordCoverage { keywords: Vec<String> },
    /// Presence of steps, output format, role and constraints.
    Structure,
    /// Distinct-token ratio (penalizes repetition).
    Specificity,
}

/// A metric with its weight in the combined score.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WeightedMetric {
    pub metric: PromptMetric,
    pub weight: f64,
}

/// Result of evaluating a single metric.
#[derive(Debug, Clone, PartialEq)]
pub struct MetricResult {
    pub metric: PromptMetric,
    pub score: f64,
    pub weight: f64,
}

/// Scores prompts from their text alone.
#[derive(Debug, Clone)]
pub struct HeuristicEvaluator {
    metrics: Vec<WeightedMetric>,
}

impl HeuristicEvaluator {
    pub fn new(metrics: Vec<WeightedMetric>) -> Self {
        Self { metrics }
    }

    /// Metric set tuned for a task type.
    pub fn for_task(task_type: TaskType) -> Self {
        let (keywords, target_words): (&[&str], usize) = match task_type {
            TaskType::CodeGeneration => (
                &["code", "function", "test", "edge case", "language", "complexity"],
                60,
            ),
            TaskType::Reasoning => (
                &["step", "reason", "assumption", "verify", "conclusion"],
                50,
            ),
            TaskType::Classification => (
                &["label", "category", "classify", "confidence", "example"],
                40,
            ),
            TaskType::QuestionAnswering => (
                &["answer", "question", "source", "concise", "context"],
                40,
            ),
            TaskType::Summarization => (
                &["summary", "key point", "length", "audience", "concise"],
                40,
            ),
            TaskType::Generic => (&["task", "clear", "format", "example"], 40),
        };

        Self::new(vec![
            WeightedMetric {
                metric: PromptMetric::KeywordCoverage {
                    keywords: keywords.iter().map(|k| k.to_string()).collect(),
                },
                weight: 1.0,
            },
            WeightedMetric {
                metric: PromptMetric::Structure,
                weight: 0.75,
            },
            WeightedMetric {
                metric: PromptMetric::LengthFit { target_words },
                weight: 0.5,
            },
            WeightedMetric {
                metric: PromptMetric::Specificity,
                weight: 0.25,
            },
        ])
    }

    /// Individual metric scores for a prompt.
    pub fn score_metrics(&self, prompt: &str) -> Vec<MetricResult> {
        let normalized = normalize_text(prompt);
        let tokens = tokenize(&normalized);
        self.metrics
            .iter()
            .map(|m| MetricResult {
                metric: m.metric.clone(),
                score: compute_metric(&m.metric, prompt, &normalized, &tokens),
                weight: m.weight,
            })
            .collect()
    }

    /// Weighted combination in [0, 1].
    pub fn score(&self, prompt: &str) -> f64 {
        let results = self.score_metrics(prompt);
        let total_weight: f64 = results.iter().map(|r| r.weight).sum();
        let combined: f64 = results.iter().map(|r| r.score * r.weight).sum();
        combined / total_weight.max(1e-9)
    }
}

impl Evaluator for HeuristicEvaluator {
    fn evaluate(&self, request: &EvaluationRequest) -> std::result::Result<f64, EvaluationError> {
        Ok(self.score(&request.candidate.prompt))
    }
}

fn compute_metric(metric: &PromptMetric, raw: &str, normalized: &str, tokens: &[&str]) -> f64 {
    match metric {
        PromptMetric::LengthFit { target_words } => {
            let words = tokens.len() as f64;
            let target = (*target_words).max(1) as f64;
            if words == 0.0 {
                0.0
            } else {
                (words / target).min(target / words)
            }
        }
        PromptMetric::KeywordCoverage { keywords } => {
            if keywords.is_empty() {
                return 0.0;
            }
            let hits = keywords
                .iter()
                .filter(|k| normalized.contains(&normalize_text(k)))
                .count();
            hits as f64 / keywords.len() as f64
        }
        PromptMetric::Structure => {
            let has_steps = raw.lines().any(|l| {
                let l = l.trim_start();
                l.starts_with("- ")
                    || l.starts_with("* ")
                    || l.split_once('.')
                        .is_some_and(|(n, _)| !n.is_empty() && n.chars().all(|c| c.is_ascii_digit()))
            }) || normalized.contains("step");
            let has_format = ["format", "output", "respond", "return"]
                .iter()
                .any(|k| normalized.contains(k));
            let has_role = normalized.contains("you are") || normalized.contains("act as");
            let has_constraints = ["must", "should", "do not", "avoid", "never"]
                .iter()
                .any(|k| normalized.contains(k));
            [has_steps, has_format, has_role, has_constraints]
                .iter()
                .filter(|&&b| b)
                .count() as f64
                / 4.0
        }
        PromptMetric::Specificity => {
            if tokens.is_empty() {
                return 0.0;
            }
            let distinct: std::collections::HashSet<&str> = tokens.iter().copied().collect();
            distinct.len() as f64 / tokens.len() as f64
        }
    }
}

/// Routing table from evaluator references to evaluators, with an explicit
/// fallback for anything unregistered.
#[derive(Clone)]
pub struct EvaluatorRegistry {
    by_task: HashMap<TaskType, Arc<dyn Evaluator>>,
    named: HashMap<String, Arc<dyn Evaluator>>,
    fallback: Arc<dyn Evaluator>,
}

impl Default for EvaluatorRegistry {
    fn default() -> Self {
        Self::with_heuristics()
    }
}

impl EvaluatorRegistry {
    /// Registry with only a fallback evaluator.
    pub fn new(fallback: Arc<dyn Evaluator>) -> Self {
        Self {
            by_task: HashMap::new(),
            named: HashMap::new(),
            fallback,
        }
    }

    /// Registry with a heuristic evaluator for every task type.
    pub fn with_heuristics() -> Self {
        let mut registry = Self::new(Arc::new(HeuristicEvaluator::for_task(TaskType::Generic)));
        for task_type in TaskType::ALL {
            registry.register_task(task_type, Arc::new(HeuristicEvaluator::for_task(task_type)));
        }
        registry
    }

    pub fn register_task(&mut self, task_type: TaskType, evaluator: Arc<dyn Evaluator>) {
        self.by_task.insert(task_type, evaluator);
    }

    pub fn register_named(&mut self, name: impl Into<String>, evaluator: Arc<dyn Evaluator>) {
        self.named.insert(name.into(), evaluator);
    }

    /// Look up a named evaluator without falling back.
    pub fn get_named(&self, name: &str) -> Result<Arc<dyn Evaluator>> {
        self.named.get(name).cloned().ok_or_else(|| Error::NotFound {
            kind: EntityKind::Evaluator,
            id: name.to_string(),
        })
    }

    /// Resolve a reference, falling back to the default evaluator.
    pub fn resolve(&self, reference: &EvaluatorRef) -> Arc<dyn Evaluator> {
        let found = match reference {
            EvaluatorRef::Task(task_type) => self.by_task.get(task_type),
            EvaluatorRef::Named(name) => self.named.get(name),
        };
        match found {
            Some(evaluator) => Arc::clone(evaluator),
            None => {
                log::warn!("No evaluator registered for {reference:?}, using fallback");
                Arc::clone(&self.fallback)
            }
        }
    }

    /// Evaluate a mixed batch. Returns exactly one result per input; a failing
    /// item never affects its peers.
    pub fn evaluate_batch(
        &self,
        items: &[(EvaluatorRef, EvaluationRequest)],
    ) -> Vec<std::result::Result<f64, EvaluationError>> {
        let mut groups: Vec<(&EvaluatorRef, Vec<usize>)> = Vec::new();
        for (i, (reference, _)) in items.iter().enumerate() {
            match groups.iter_mut().find(|(r, _)| *r == reference) {
                Some((_, indices)) => indices.push(i),
                None => groups.push((reference, vec![i])),
            }
        }

        let mut results: Vec<std::result::Result<f64, EvaluationError>> =
            vec![Err(EvaluationError::Failed("not evaluated".to_string())); items.len()];

        for (reference, indices) in groups {
            let evaluator = self.resolve(reference);
            let requests: Vec<EvaluationRequest> =
                indices.iter().map(|&i| items[i].1.clone()).collect();
            let outcome = match panic::catch_unwind(AssertUnwindSafe(|| {
                evaluator.evaluate_batch(&requests)
            })) {
                Ok(outcome) => outcome,
                Err(payload) => {
                    let message = format!("Evaluator panicked: {}", panic_message(&*payload));
                    log::warn!("{message} ({reference:?})");
                    for &i in &indices {
                        results[i] = Err(EvaluationError::Failed(message.clone()));
                    }
                    continue;
                }
            };

            if outcome.len() != indices.len() {
                let message = format!(
                    "Evaluator returned {} results for {} inputs",
                    outcome.len(),
                    indices.len()
                );
                for &i in &indices {
                    results[i] = Err(EvaluationError::Failed(message.clone()));
                }
                continue;
            }

            for (&i, result) in indices.iter().zip(outcome) {
                results[i] = match result {
                    Ok(f) if !f.is_finite() => Err(EvaluationError::NonFinite),
                    other => other,
                };
            }
        }

        results
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("unknown panic")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(prompt: &str) -> EvaluationRequest {
        EvaluationRequest {
            candidate: Candidate::new("c", prompt, 0),
            task_type: TaskType::Generic,
            timeout: None,
        }
    }

    #[test]
    fn test_heuristic_scores_in_unit_range() {
        let evaluator = HeuristicEvaluator::for_task(TaskType::Reasoning);
        for prompt in ["", "x", "Reason step by step and verify each assumption."] {
            let score = evaluator.score(prompt);
            assert!((0.0..=1.0).contains(&score), "{prompt}: {score}");
        }
    }

    #[test]
    fn test_heuristic_prefers_task_keywords() {
        let evaluator = HeuristicEvaluator::for_task(TaskType::Reasoning);
        let weak = evaluator.score("Answer this.");
        let strong = evaluator.score(
            "You are a careful analyst. Reason step by step, state each assumption, \
             verify the intermediate results and finish with a clear conclusion. \
             Do not skip steps. Output format: numbered steps then the conclusion.",
        );
        assert!(strong > weak);
    }

    #[test]
    fn test_resolve_falls_back() {
        let mut registry = EvaluatorRegistry::new(Arc::new(FnEvaluator::new(|_| Ok(0.5))));
        registry.register_named("fixed", Arc::new(FnEvaluator::new(|_| Ok(0.9))));

        let named = registry.resolve(&EvaluatorRef::Named("fixed".into()));
        assert_eq!(named.evaluate(&request("p")).unwrap(), 0.9);

        let missing = registry.resolve(&EvaluatorRef::Named("other".into()));
        assert_eq!(missing.evaluate(&request("p")).unwrap(), 0.5);

        assert!(registry.get_named("other").is_err());
    }

    #[test]
    fn test_batch_isolates_failures() {
        let mut registry = EvaluatorRegistry::with_heuristics();
        registry.register_named(
            "picky",
            Arc::new(FnEvaluator::new(|r| {
                if r.candidate.prompt.contains("bad") {
                    Err(EvaluationError::Timeout {
                        elapsed_ms: 50,
                        limit_ms: 10,
                    })
                } else {
                    Ok(0.7)
                }
            })),
        );
        registry.register_named("nan", Arc::new(FnEvaluator::new(|_| Ok(f64::NAN))));

        let items = vec![
            (EvaluatorRef::Named("picky".into()), request("good")),
            (EvaluatorRef::Named("picky".into()), request("bad")),
            (EvaluatorRef::Task(TaskType::Generic), request("task prompt")),
            (EvaluatorRef::Named("nan".into()), request("any")),
        ];
        let results = registry.evaluate_batch(&items);

        assert_eq!(results.len(), 4);
        assert_eq!(results[0], Ok(0.7));
        assert!(results[1].as_ref().unwrap_err().is_timeout());
        assert!(results[2].is_ok());
        assert_eq!(results[3], Err(EvaluationError::NonFinite));
    }

    #[test]
    fn test_batch_contains_evaluator_panic() {
        let mut registry = EvaluatorRegistry::with_heuristics();
        registry.register_named(
            "fragile",
            Arc::new(FnEvaluator::new(|r| {
                if r.candidate.prompt.contains("explode") {
                    panic!("cannot score {}", r.candidate.prompt);
                }
                Ok(0.6)
            })),
        );

        let items = vec![
            (EvaluatorRef::Task(TaskType::Generic), request("steady")),
            (EvaluatorRef::Named("fragile".into()), request("explode")),
            (EvaluatorRef::Named("fragile".into()), request("calm")),
        ];
        let results = registry.evaluate_batch(&items);

        assert_eq!(results.len(), 3);
        assert!(results[0].is_ok());
        for result in &results[1..] {
            match result {
                Err(EvaluationError::Failed(message)) => {
                    assert!(message.contains("cannot score explode"), "{message}")
                }
                other => panic!("expected failure, got {other:?}"),
            }
        }
    }

    struct ShortBatch;

    impl Evaluator for ShortBatch {
        fn evaluate(&self, _: &EvaluationRequest) -> std::result::Result<f64, EvaluationError> {
            Ok(1.0)
        }

        fn evaluate_batch(
            &self,
            _: &[EvaluationRequest],
        ) -> Vec<std::result::Result<f64, EvaluationError>> {
            vec![Ok(1.0)]
        }
    }

    #[test]
    fn test_batch_length_mismatch_fails_group() {
        let mut registry = EvaluatorRegistry::with_heuristics();
        registry.register_named("short", Arc::new(ShortBatch));
        let items = vec![
            (EvaluatorRef::Named("short".into()), request("a")),
            (EvaluatorRef::Named("short".into()), request("b")),
        ];
        let results = registry.evaluate_batch(&items);
        assert!(results.iter().all(|r| r.is_err()));
    }
}
