//! The generation loop: evaluate, analyze diversity, promote.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::compute::{
    DispatchReport, PopulationHandle, PopulationStats, PopulationStore, Scheduler,
};
use crate::error::{Error, Result};
use crate::schema::{
    Candidate, CandidateId, DiversityMetrics, EvaluatorRef, NoveltyScore, OptimizerConfig,
    Priority, PromotionReport, RunHistory, RunStats, StopReason,
};

use super::diversity::DiversityEngine;
use super::evaluator::EvaluatorRegistry;
use super::novelty::NoveltyArchive;
use super::promoter::{DiversityPromoter, PromotionOptions, VariantGenerator};
use super::similarity::{EmbeddingProvider, TraceProvider};

/// Summary of one generation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationReport {
    pub generation: u64,
    pub dispatch: DispatchReport,
    pub metrics: DiversityMetrics,
    pub population: PopulationStats,
    /// Present when diversity fell below the promotion threshold.
    pub promotion: Option<PromotionReport>,
    pub mutation_rate: f64,
    pub novelty: Vec<NoveltyScore>,
    /// Evaluated candidates by novelty-adjusted fitness, best first.
    pub ranking: Vec<(CandidateId, f64)>,
    pub archive_size: usize,
}

/// Final result of a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptimizationResult {
    /// Best candidate seen across all generations.
    pub best: Option<Candidate>,
    pub population: Vec<Candidate>,
    pub archive: Vec<Candidate>,
    pub stats: RunStats,
    pub history: RunHistory,
}

/// Context object for one optimization run. Owns the scheduler, population,
/// diversity engine, promoter and novelty archive.
pub struct Optimizer {
    config: OptimizerConfig,
    registry: EvaluatorRegistry,
    scheduler: Scheduler,
    population: PopulationHandle,
    engine: DiversityEngine,
    promoter: DiversityPromoter,
    archive: NoveltyArchive,
    history: RunHistory,
    best: Option<Candidate>,
    best_fitness: f64,
    stagnation_count: u64,
    generations_run: u64,
    evaluations: u64,
    mutation_rate: f64,
    cancelled: Arc<AtomicBool>,
}

impl Optimizer {
    /// Validate `config` and build every component of the run.
    pub fn new(config: OptimizerConfig, registry: EvaluatorRegistry) -> Result<Self> {
        config.validate()?;
        let seed = config.random_seed.unwrap_or_else(rand::random);
        let scheduler = Scheduler::new(config.scheduler.clone())?;
        let engine = DiversityEngine::new(config.diversity.clone()).with_seed(seed);
        let promoter = DiversityPromoter::new(
            config.promotion.clone(),
            config.diversity.similarity_threshold,
            seed,
        );
        let archive = NoveltyArchive::new(
            config.diversity.archive_size,
            config.diversity.archive_threshold,
        );
        log::debug!("Optimizer created with seed {seed}");

        Ok(Self {
            mutation_rate: config.promotion.base_mutation_rate,
            config,
            registry,
            scheduler,
            population: PopulationHandle::new(PopulationStore::new()),
            engine,
            promoter,
            archive,
            history: RunHistory::default(),
            best: None,
            best_fitness: f64::NEG_INFINITY,
            stagnation_count: 0,
            generations_run: 0,
            evaluations: 0,
            cancelled: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn with_embeddings(mut self, provider: Arc<dyn EmbeddingProvider>) -> Self {
        self.engine = self.engine.with_embeddings(provider);
        self
    }

    pub fn with_traces(mut self, provider: Arc<dyn TraceProvider>) -> Self {
        self.engine = self.engine.with_traces(provider);
        self
    }

    pub fn with_generator(mut self, generator: Box<dyn VariantGenerator>) -> Self {
        self.promoter = self.promoter.with_generator(generator);
        self
    }

    /// Get cancellation handle.
    pub fn cancel_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancelled)
    }

    pub fn population(&self) -> &PopulationHandle {
        &self.population
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub fn engine(&self) -> &DiversityEngine {
        &self.engine
    }

    pub fn archive(&self) -> &NoveltyArchive {
        &self.archive
    }

    pub fn history(&self) -> &RunHistory {
        &self.history
    }

    /// Mutation rate adapted in the latest generation.
    pub fn mutation_rate(&self) -> f64 {
        self.mutation_rate
    }

    /// Insert initial prompts into the current generation. Nothing is
    /// inserted if any prompt is empty.
    pub fn seed<I, S>(&mut self, prompts: I) -> Result<Vec<CandidateId>>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut store = self.population.lock();
        let generation = store.generation();
        let candidates: Vec<Candidate> = prompts
            .into_iter()
            .map(|prompt| {
                Candidate::new(store.next_id(), prompt, generation)
                    .with_metadata("origin", json!("seed"))
            })
            .collect();
        let ids: Vec<CandidateId> = candidates.iter().map(|c| c.id.clone()).collect();
        store.insert_all(candidates)?;
        log::info!("Seeded {} candidates", ids.len());
        Ok(ids)
    }

    /// Queue every unevaluated candidate. Promoted candidates get the
    /// configured injected priority.
    fn submit_unevaluated(&self) -> Result<usize> {
        let pending: Vec<(CandidateId, Priority)> = {
            let store = self.population.lock();
            store
                .iter()
                .filter(|c| !c.is_evaluated())
                .map(|c| {
                    let promoted = c
                        .metadata
                        .get("origin")
                        .is_some_and(|o| o == "injection" || o == "diversification");
                    let priority = if promoted {
                        self.config.scheduler.injected_priority
                    } else {
                        Priority::Normal
                    };
                    (c.id.clone(), priority)
                })
                .collect()
        };

        let evaluator = EvaluatorRef::Task(self.config.scheduler.default_task_type);
        for (id, priority) in &pending {
            self.scheduler
                .submit(&self.population, id, evaluator.clone(), *priority)?;
        }
        Ok(pending.len())
    }

    /// Run one evaluate -> analyze -> promote cycle and advance the
    /// generation.
    pub fn run_generation(&mut self) -> Result<GenerationReport> {
        if self.population.is_empty() {
            return Err(Error::EmptyCollection { operation: "evolve" });
        }

        let submitted = self.submit_unevaluated()?;
        let dispatch = self.scheduler.dispatch(&self.population, &self.registry);
        self.evaluations += dispatch.total() as u64;
        self.scheduler.prune_finished();
        log::debug!("Evaluated {submitted} candidates");

        let snapshot = self.population.snapshot();
        let generation = snapshot.generation;
        let diversity = &self.config.diversity;
        let matrix = self.engine.compute_matrix(&snapshot, diversity.strategy)?;
        let metrics = self.engine.compute_metrics(&matrix);

        let mut novelty = Vec::new();
        let mut ranking: Vec<(CandidateId, f64)> = Vec::new();
        if diversity.enable_novelty_rewards {
            let archived = self.archive.candidates();
            novelty = self
                .engine
                .novelty_scores_with_archive(&snapshot, &archived, diversity.novelty_k);
            for (candidate, score) in snapshot.candidates.iter().zip(&novelty) {
                self.archive.consider(candidate, score.score, generation);
                if let Some(fitness) = candidate.fitness {
                    ranking.push((
                        candidate.id.clone(),
                        self.engine.novelty_adjusted_fitness(fitness, score.score),
                    ));
                }
            }
        } else {
            ranking = snapshot
                .candidates
                .iter()
                .filter_map(|c| c.fitness.map(|f| (c.id.clone(), f)))
                .collect();
        }
        ranking.sort_by(|a, b| b.1.total_cmp(&a.1));

        let stats = self.population.lock().stats();
        if let Some(best) = self.population.best_candidate()
            && let Some(fitness) = best.fitness
        {
            if fitness > self.best_fitness {
                self.best_fitness = fitness;
                self.best = Some(best);
                self.stagnation_count = 0;
            } else {
                self.stagnation_count += 1;
            }
        }

        let promotion = if metrics.pairwise_diversity < diversity.diversity_promotion_threshold {
            let opts = PromotionOptions {
                base_prompt: self.config.run.base_prompt.clone(),
            };
            let mut store = self.population.lock();
            Some(self.promoter.promote(
                &mut store,
                &matrix,
                &metrics,
                self.config.promotion.strategy,
                &opts,
            )?)
        } else {
            None
        };

        self.mutation_rate = self
            .promoter
            .adaptive_mutation_rate(&metrics, self.config.promotion.base_mutation_rate);

        self.history.best_fitness.push(stats.best_fitness);
        self.history.mean_fitness.push(stats.mean_fitness);
        self.history.fitness_std.push(stats.fitness_std);
        self.history.pairwise_diversity.push(metrics.pairwise_diversity);
        self.history.diversity_level.push(metrics.diversity_level);
        self.history.mutation_rate.push(self.mutation_rate);
        self.history
            .replaced
            .push(promotion.as_ref().map_or(0, |p| p.replaced.len()));

        self.population.lock().advance_generation();
        self.generations_run += 1;

        log::info!(
            "Generation {generation}: best {:?}, diversity {:.3} ({}), rate {}",
            stats.best_fitness,
            metrics.pairwise_diversity,
            metrics.diversity_level,
            self.mutation_rate
        );

        Ok(GenerationReport {
            generation,
            dispatch,
            metrics,
            population: stats,
            promotion,
            mutation_rate: self.mutation_rate,
            novelty,
            ranking,
            archive_size: self.archive.len(),
        })
    }

    /// Check if the loop should stop.
    fn should_stop(&self) -> Option<StopReason> {
        if self.cancelled.load(Ordering::Relaxed) {
            return Some(StopReason::Cancelled);
        }

        if self.generations_run >= self.config.run.max_generations {
            return Some(StopReason::MaxGenerations);
        }

        if let Some(target) = self.config.run.target_fitness
            && self.best_fitness >= target
        {
            return Some(StopReason::TargetReached);
        }

        if let Some(limit) = self.config.run.stagnation_limit
            && self.stagnation_count >= limit
        {
            return Some(StopReason::Stagnation);
        }

        None
    }

    /// Run generations until a stop condition, reporting each one.
    pub fn run_with_callback<F>(&mut self, mut callback: F) -> Result<OptimizationResult>
    where
        F: FnMut(&GenerationReport),
    {
        let start_time = Instant::now();

        let stop_reason = loop {
            if let Some(reason) = self.should_stop() {
                break reason;
            }
            let report = self.run_generation()?;
            callback(&report);
        };

        let elapsed = start_time.elapsed().as_secs_f64();
        let store = self.population.lock();
        let stats = RunStats {
            generations: self.generations_run,
            total_evaluations: self.evaluations,
            best_fitness: self.best.as_ref().and_then(|c| c.fitness),
            final_mean_fitness: store.stats().mean_fitness,
            elapsed_seconds: elapsed,
            evaluations_per_second: if elapsed > 0.0 {
                self.evaluations as f64 / elapsed
            } else {
                0.0
            },
            stop_reason,
        };
        log::info!(
            "Stopped after {} generations: {stop_reason:?}",
            self.generations_run
        );

        Ok(OptimizationResult {
            best: self.best.clone(),
            population: store.iter().cloned().collect(),
            archive: self.archive.candidates(),
            stats,
            history: self.history.clone(),
        })
    }

    /// Run to completion.
    pub fn run(&mut self) -> Result<OptimizationResult> {
        self.run_with_callback(|_| {})
    }
}
