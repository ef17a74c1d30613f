//! Multi-level FIFO queue for evaluation tasks.

use std::collections::{HashMap, VecDeque};

use crate::error::{Error, Result};
use crate::schema::{EvaluationTask, Priority, TaskId};

/// Four FIFO sub-queues, drained strictly `Critical > High > Normal > Low`.
///
/// There is no anti-starvation: a steady stream of high-priority work keeps
/// lower levels waiting indefinitely.
#[derive(Debug)]
pub struct PriorityQueue {
    levels: [VecDeque<EvaluationTask>; 4],
    /// Task id -> level the task was routed to.
    index: HashMap<TaskId, Priority>,
    priority_routing: bool,
}

impl Default for PriorityQueue {
    fn default() -> Self {
        Self::new(true)
    }
}

impl PriorityQueue {
    /// Create an empty queue. With routing disabled every task lands in
    /// `Normal`.
    pub fn new(priority_routing: bool) -> Self {
        Self {
            levels: Default::default(),
            index: HashMap::new(),
            priority_routing,
        }
    }

    /// Level a task is routed to.
    fn route(&self, priority: Priority) -> Priority {
        if self.priority_routing {
            priority
        } else {
            Priority::Normal
        }
    }

    /// Append a task to the tail of its level.
    pub fn enqueue(&mut self, task: EvaluationTask) -> Result<()> {
        if self.index.contains_key(&task.id) {
            return Err(Error::Validation(format!("Task {} is already queued", task.id)));
        }
        let level = self.route(task.priority);
        self.index.insert(task.id.clone(), level);
        self.levels[level.index()].push_back(task);
        Ok(())
    }

    /// Pop the head of the highest non-empty level.
    pub fn dequeue(&mut self) -> Option<EvaluationTask> {
        let task = self.levels.iter_mut().find_map(|level| level.pop_front())?;
        self.index.remove(&task.id);
        Some(task)
    }

    /// Dequeue up to `n` tasks.
    pub fn dequeue_many(&mut self, n: usize) -> Vec<EvaluationTask> {
        let mut tasks = Vec::with_capacity(n.min(self.len()));
        while tasks.len() < n {
            match self.dequeue() {
                Some(task) => tasks.push(task),
                None => break,
            }
        }
        tasks
    }

    /// Remove a queued task by id.
    pub fn remove(&mut self, id: &TaskId) -> Result<EvaluationTask> {
        let level = *self
            .index
            .get(id)
            .ok_or_else(|| Error::task_not_found(id.as_str()))?;
        let queue = &mut self.levels[level.index()];
        let pos = queue
            .iter()
            .position(|t| &t.id == id)
            .ok_or_else(|| Error::task_not_found(id.as_str()))?;
        let task = queue
            .remove(pos)
            .ok_or_else(|| Error::task_not_found(id.as_str()))?;
        self.index.remove(id);
        Ok(task)
    }

    /// Whether a task is queued.
    pub fn contains(&self, id: &TaskId) -> bool {
        self.index.contains_key(id)
    }

    /// Peek at the task that would be dequeued next.
    pub fn peek(&self) -> Option<&EvaluationTask> {
        self.levels.iter().find_map(|level| level.front())
    }

    /// Total queued tasks across all levels.
    pub fn len(&self) -> usize {
        self.levels.iter().map(VecDeque::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.levels.iter().all(VecDeque::is_empty)
    }

    /// Queued tasks at one level.
    pub fn len_at(&self, priority: Priority) -> usize {
        self.levels[priority.index()].len()
    }

    /// Drop every queued task, returning them in dequeue order.
    pub fn drain(&mut self) -> Vec<EvaluationTask> {
        self.index.clear();
        self.levels.iter_mut().flat_map(|level| level.drain(..)).collect()
    }
}
