//! Evaluation scheduler: a priority queue drained by a bounded worker pool.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use rayon::prelude::*;
use rayon::{ThreadPool, ThreadPoolBuilder};
use serde::{Deserialize, Serialize};

use super::evolution::{EvaluationRequest, EvaluatorRegistry};
use super::population::PopulationHandle;
use super::queue::PriorityQueue;
use crate::error::{Error, EvaluationError, Result};
use crate::schema::{
    CandidateId, EvaluationTask, EvaluatorRef, Priority, SchedulerConfig, TaskId, TaskStatus,
};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Task counts by status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchedulerStats {
    pub pending: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
    /// Tasks still waiting in the queue.
    pub queued: usize,
}

/// A task that finished with a fitness value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletedTask {
    pub task_id: TaskId,
    pub candidate_id: CandidateId,
    pub fitness: f64,
}

/// A task that finished with an error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailedTask {
    pub task_id: TaskId,
    pub candidate_id: CandidateId,
    pub error: EvaluationError,
}

/// Outcome of one [`Scheduler::dispatch`] call.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DispatchReport {
    pub completed: Vec<CompletedTask>,
    pub failed: Vec<FailedTask>,
    pub elapsed: Duration,
}

impl DispatchReport {
    pub fn total(&self) -> usize {
        self.completed.len() + self.failed.len()
    }

    fn merge(mut self, other: DispatchReport) -> Self {
        self.completed.extend(other.completed);
        self.failed.extend(other.failed);
        self
    }
}

/// Owns the task queue and the lifecycle record of every submitted task.
///
/// Queue and task-table locks are never held while an evaluator runs.
pub struct Scheduler {
    config: SchedulerConfig,
    queue: Mutex<PriorityQueue>,
    tasks: Mutex<HashMap<TaskId, EvaluationTask>>,
    next_id: AtomicU64,
    pool: ThreadPool,
}

impl Scheduler {
    /// Create a scheduler with a pool of `max_workers` threads (0 = one per
    /// core).
    pub fn new(config: SchedulerConfig) -> Result<Self> {
        let pool = ThreadPoolBuilder::new()
            .num_threads(config.max_workers)
            .thread_name(|i| format!("prompt-evo-worker-{i}"))
            .build()?;
        log::debug!(
            "Scheduler started with {} workers, batch size {}",
            pool.current_num_threads(),
            config.batch_size
        );
        Ok(Self {
            queue: Mutex::new(PriorityQueue::new(config.priority_routing)),
            tasks: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(0),
            pool,
            config,
        })
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    pub fn worker_count(&self) -> usize {
        self.pool.current_num_threads()
    }

    /// Queue an evaluation of an existing candidate.
    pub fn submit(
        &self,
        population: &PopulationHandle,
        candidate_id: &CandidateId,
        evaluator: EvaluatorRef,
        priority: Priority,
    ) -> Result<TaskId> {
        if !population.contains(candidate_id) {
            return Err(Error::candidate_not_found(candidate_id.as_str()));
        }

        let id = format!("task-{}", self.next_id.fetch_add(1, Ordering::Relaxed));
        let task = EvaluationTask::new(id, candidate_id.clone(), evaluator)?.with_priority(priority);
        let task_id = task.id.clone();

        let mut tasks = lock(&self.tasks);
        lock(&self.queue).enqueue(task.clone())?;
        tasks.insert(task_id.clone(), task);

        log::debug!("Submitted {task_id} for {candidate_id} at {priority:?}");
        Ok(task_id)
    }

    /// Queue every unevaluated candidate with the default task type.
    pub fn submit_all(&self, population: &PopulationHandle, priority: Priority) -> Result<Vec<TaskId>> {
        let ids = population.lock().unevaluated_ids();
        let evaluator = EvaluatorRef::Task(self.config.default_task_type);
        ids.iter()
            .map(|id| self.submit(population, id, evaluator.clone(), priority))
            .collect()
    }

    /// Cancel a task that is still queued.
    pub fn cancel(&self, id: &TaskId) -> Result<()> {
        let mut tasks = lock(&self.tasks);
        let task = tasks
            .get_mut(id)
            .ok_or_else(|| Error::task_not_found(id.as_str()))?;
        if task.status() != TaskStatus::Pending {
            return task.cancel();
        }
        if lock(&self.queue).remove(id).is_err() {
            // Dequeued by a worker that has not marked it running yet.
            return Err(Error::InvalidTransition {
                id: id.0.clone(),
                from: TaskStatus::Running,
                to: TaskStatus::Cancelled,
            });
        }
        task.cancel()?;
        log::debug!("Cancelled {id}");
        Ok(())
    }

    /// Drain the queue with the worker pool, writing fitness back to
    /// `population`. Per-task failures are reported, never propagated.
    pub fn dispatch(&self, population: &PopulationHandle, registry: &EvaluatorRegistry) -> DispatchReport {
        let start = Instant::now();
        let workers = self.pool.current_num_threads().max(1);

        let mut report = self.pool.install(|| {
            (0..workers)
                .into_par_iter()
                .map(|_| self.worker_loop(population, registry))
                .reduce(DispatchReport::default, DispatchReport::merge)
        });
        report.elapsed = start.elapsed();

        log::info!(
            "Dispatched {} tasks in {:.2?}: {} completed, {} failed",
            report.total(),
            report.elapsed,
            report.completed.len(),
            report.failed.len()
        );
        report
    }

    fn worker_loop(&self, population: &PopulationHandle, registry: &EvaluatorRegistry) -> DispatchReport {
        let mut report = DispatchReport::default();
        loop {
            let batch = lock(&self.queue).dequeue_many(self.config.batch_size);
            if batch.is_empty() {
                return report;
            }
            self.run_batch(batch, population, registry, &mut report);
        }
    }

    fn run_batch(
        &self,
        batch: Vec<EvaluationTask>,
        population: &PopulationHandle,
        registry: &EvaluatorRegistry,
        report: &mut DispatchReport,
    ) {
        {
            let mut tasks = lock(&self.tasks);
            for task in &batch {
                if let Some(record) = tasks.get_mut(&task.id)
                    && let Err(e) = record.start()
                {
                    log::warn!("Could not start {}: {e}", task.id);
                }
            }
        }

        let timeout = self.config.evaluation_timeout_ms.map(Duration::from_millis);
        let mut runnable: Vec<(&EvaluationTask, (EvaluatorRef, EvaluationRequest))> = Vec::new();
        let mut outcomes: Vec<(&EvaluationTask, std::result::Result<f64, EvaluationError>)> =
            Vec::new();

        for task in &batch {
            match population.get(&task.candidate_id) {
                Ok(candidate) => {
                    let task_type = match &task.evaluator {
                        EvaluatorRef::Task(task_type) => *task_type,
                        EvaluatorRef::Named(_) => self.config.default_task_type,
                    };
                    let request = EvaluationRequest {
                        candidate,
                        task_type,
                        timeout,
                    };
                    runnable.push((task, (task.evaluator.clone(), request)));
                }
                Err(_) => outcomes.push((
                    task,
                    Err(EvaluationError::CandidateMissing(task.candidate_id.0.clone())),
                )),
            }
        }

        let items: Vec<(EvaluatorRef, EvaluationRequest)> =
            runnable.iter().map(|(_, item)| item.clone()).collect();
        let results = registry.evaluate_batch(&items);
        outcomes.extend(runnable.into_iter().map(|(task, _)| task).zip(results));

        for (task, outcome) in outcomes {
            let outcome = outcome.and_then(|fitness| {
                population
                    .update_fitness(&task.candidate_id, fitness)
                    .map(|()| fitness)
                    .map_err(|_| EvaluationError::CandidateMissing(task.candidate_id.0.clone()))
            });

            let mut tasks = lock(&self.tasks);
            let record = tasks.get_mut(&task.id);
            match outcome {
                Ok(fitness) => {
                    if let Some(record) = record
                        && let Err(e) = record.complete(fitness)
                    {
                        log::warn!("Could not complete {}: {e}", task.id);
                    }
                    report.completed.push(CompletedTask {
                        task_id: task.id.clone(),
                        candidate_id: task.candidate_id.clone(),
                        fitness,
                    });
                }
                Err(error) => {
                    log::warn!("{} failed for {}: {error}", task.id, task.candidate_id);
                    if let Some(record) = record
                        && let Err(e) = record.fail(error.clone())
                    {
                        log::warn!("Could not fail {}: {e}", task.id);
                    }
                    report.failed.push(FailedTask {
                        task_id: task.id.clone(),
                        candidate_id: task.candidate_id.clone(),
                        error,
                    });
                }
            }
        }
    }

    pub fn status(&self, id: &TaskId) -> Result<TaskStatus> {
        lock(&self.tasks)
            .get(id)
            .map(EvaluationTask::status)
            .ok_or_else(|| Error::task_not_found(id.as_str()))
    }

    /// Copy of a task's lifecycle record.
    pub fn task(&self, id: &TaskId) -> Result<EvaluationTask> {
        lock(&self.tasks)
            .get(id)
            .cloned()
            .ok_or_else(|| Error::task_not_found(id.as_str()))
    }

    pub fn stats(&self) -> SchedulerStats {
        let mut stats = SchedulerStats {
            queued: lock(&self.queue).len(),
            ..Default::default()
        };
        for task in lock(&self.tasks).values() {
            match task.status() {
                TaskStatus::Pending => stats.pending += 1,
                TaskStatus::Running => stats.running += 1,
                TaskStatus::Completed => stats.completed += 1,
                TaskStatus::Failed => stats.failed += 1,
                TaskStatus::Cancelled => stats.cancelled += 1,
            }
        }
        stats
    }

    pub fn queued(&self) -> usize {
        lock(&self.queue).len()
    }

    /// Forget tasks in a terminal state. Returns how many were dropped.
    pub fn prune_finished(&self) -> usize {
        let mut tasks = lock(&self.tasks);
        let before = tasks.len();
        tasks.retain(|_, t| !t.status().is_terminal());
        before - tasks.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::compute::PopulationStore;
    use crate::compute::evolution::FnEvaluator;
    use crate::schema::{Candidate, TaskType};

    fn population(n: usize) -> PopulationHandle {
        let mut store = PopulationStore::new();
        for i in 0..n {
            store
                .insert(Candidate::new(format!("c{i}"), format!("Prompt number {i}."), 0))
                .unwrap();
        }
        PopulationHandle::new(store)
    }

    fn scheduler(workers: usize, batch_size: usize) -> Scheduler {
        Scheduler::new(SchedulerConfig {
            max_workers: workers,
            batch_size,
            ..Default::default()
        })
        .unwrap()
    }

    fn constant(value: f64) -> EvaluatorRegistry {
        EvaluatorRegistry::new(Arc::new(FnEvaluator::new(move |_| Ok(value))))
    }

    #[test]
    fn test_submit_requires_candidate() {
        let pop = population(1);
        let s = scheduler(1, 1);
        let err = s
            .submit(&pop, &"ghost".into(), EvaluatorRef::default(), Priority::Normal)
            .unwrap_err();
        assert!(err.is_not_found());
        assert_eq!(s.queued(), 0);

        let id = s
            .submit(&pop, &"c0".into(), EvaluatorRef::default(), Priority::Normal)
            .unwrap();
        assert_eq!(id.as_str(), "task-0");
        assert_eq!(s.status(&id).unwrap(), TaskStatus::Pending);
    }

    #[test]
    fn test_dispatch_writes_fitness() {
        let pop = population(6);
        let s = scheduler(3, 2);
        let ids = s.submit_all(&pop, Priority::Normal).unwrap();
        assert_eq!(ids.len(), 6);

        let report = s.dispatch(&pop, &constant(0.75));
        assert_eq!(report.completed.len(), 6);
        assert!(report.failed.is_empty());
        assert!(pop.lock().iter().all(|c| c.fitness == Some(0.75)));
        for id in &ids {
            assert_eq!(s.status(id).unwrap(), TaskStatus::Completed);
        }
        let stats = s.stats();
        assert_eq!(stats.completed, 6);
        assert_eq!(stats.queued, 0);
    }

    #[test]
    fn test_dispatch_isolates_failures() {
        let pop = population(4);
        let s = scheduler(2, 4);
        s.submit_all(&pop, Priority::Normal).unwrap();
        let registry = EvaluatorRegistry::new(Arc::new(FnEvaluator::new(|req| {
            if req.candidate.id.as_str() == "c2" {
                Err(EvaluationError::Timeout {
                    elapsed_ms: 20,
                    limit_ms: 10,
                })
            } else {
                Ok(0.5)
            }
        })));

        let report = s.dispatch(&pop, &registry);
        assert_eq!(report.completed.len(), 3);
        assert_eq!(report.failed.len(), 1);
        assert!(report.failed[0].error.is_timeout());
        assert_eq!(report.failed[0].candidate_id.as_str(), "c2");

        let task = s.task(&report.failed[0].task_id).unwrap();
        assert_eq!(task.status(), TaskStatus::Failed);
        assert!(matches!(task.result(), Some(Err(e)) if e.is_timeout()));
        assert!(pop.get(&"c2".into()).unwrap().fitness.is_none());
    }

    #[test]
    fn test_dispatch_survives_panicking_evaluator() {
        let pop = population(3);
        let s = scheduler(1, 1);
        let ids = s.submit_all(&pop, Priority::Normal).unwrap();
        let registry = EvaluatorRegistry::new(Arc::new(FnEvaluator::new(|req| {
            if req.candidate.id.as_str() == "c1" {
                panic!("evaluator crashed");
            }
            Ok(0.5)
        })));

        let report = s.dispatch(&pop, &registry);
        assert_eq!(report.completed.len(), 2);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].candidate_id.as_str(), "c1");

        let statuses: Vec<TaskStatus> = ids.iter().map(|id| s.status(id).unwrap()).collect();
        assert_eq!(
            statuses,
            vec![TaskStatus::Completed, TaskStatus::Failed, TaskStatus::Completed]
        );
        assert_eq!(s.stats().running, 0);
        assert!(pop.get(&"c1".into()).unwrap().fitness.is_none());
    }

    #[test]
    fn test_missing_candidate_fails_task() {
        let pop = population(2);
        let s = scheduler(1, 1);
        let id = s
            .submit(&pop, &"c1".into(), EvaluatorRef::default(), Priority::Normal)
            .unwrap();
        pop.lock().remove(&"c1".into()).unwrap();

        let report = s.dispatch(&pop, &constant(1.0));
        assert_eq!(report.failed.len(), 1);
        assert_eq!(
            report.failed[0].error,
            EvaluationError::CandidateMissing("c1".into())
        );
        assert_eq!(s.status(&id).unwrap(), TaskStatus::Failed);
    }

    #[test]
    fn test_single_worker_follows_priority_order() {
        let pop = population(4);
        let s = scheduler(1, 1);
        let order = Arc::new(Mutex::new(Vec::new()));
        let seen = Arc::clone(&order);
        let registry = EvaluatorRegistry::new(Arc::new(FnEvaluator::new(move |req| {
            lock(&seen).push(req.candidate.id.0.clone());
            Ok(0.1)
        })));

        for (id, priority) in [
            ("c0", Priority::Low),
            ("c1", Priority::Critical),
            ("c2", Priority::Normal),
            ("c3", Priority::High),
        ] {
            s.submit(&pop, &id.into(), EvaluatorRef::default(), priority)
                .unwrap();
        }
        s.dispatch(&pop, &registry);
        assert_eq!(*lock(&order), vec!["c1", "c3", "c2", "c0"]);
    }

    #[test]
    fn test_cancel_lifecycle() {
        let pop = population(2);
        let s = scheduler(1, 1);
        let queued = s
            .submit(&pop, &"c0".into(), EvaluatorRef::default(), Priority::Low)
            .unwrap();
        let done = s
            .submit(&pop, &"c1".into(), EvaluatorRef::default(), Priority::Low)
            .unwrap();

        s.cancel(&queued).unwrap();
        assert_eq!(s.status(&queued).unwrap(), TaskStatus::Cancelled);
        assert_eq!(s.queued(), 1);
        assert!(matches!(s.cancel(&queued), Err(Error::InvalidTransition { .. })));

        s.dispatch(&pop, &constant(0.2));
        assert!(matches!(
            s.cancel(&done),
            Err(Error::InvalidTransition {
                from: TaskStatus::Completed,
                ..
            })
        ));
        assert!(s.cancel(&TaskId::from("task-99")).unwrap_err().is_not_found());
        assert!(pop.get(&"c0".into()).unwrap().fitness.is_none());
    }

    #[test]
    fn test_named_evaluator_and_prune() {
        let pop = population(2);
        let s = scheduler(2, 1);
        let mut registry = constant(0.1);
        registry.register_named("judge", Arc::new(FnEvaluator::new(|_| Ok(0.9))));
        registry.register_task(TaskType::Reasoning, Arc::new(FnEvaluator::new(|_| Ok(0.4))));

        s.submit(&pop, &"c0".into(), EvaluatorRef::Named("judge".into()), Priority::High)
            .unwrap();
        s.submit(&pop, &"c1".into(), EvaluatorRef::Task(TaskType::Reasoning), Priority::High)
            .unwrap();
        s.dispatch(&pop, &registry);

        assert_eq!(pop.get(&"c0".into()).unwrap().fitness, Some(0.9));
        assert_eq!(pop.get(&"c1".into()).unwrap().fitness, Some(0.4));
        assert_eq!(s.prune_finished(), 2);
        assert_eq!(s.stats(), SchedulerStats::default());
    }
}
