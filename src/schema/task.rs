//! Evaluation task types and their lifecycle.

use std::fmt;
use std::str::FromStr;
use std::time::SystemTime;

use serde::{Deserialize, Serialize};

use super::CandidateId;
use crate::error::{Error, EvaluationError, Result};

/// Identifier of an evaluation task.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(pub String);

impl TaskId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TaskId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Scheduling priority. Dequeue order is `Critical` first, `Low` last.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Critical,
    High,
    #[default]
    Normal,
    Low,
}

impl Priority {
    /// All levels in dequeue order.
    pub const ALL: [Priority; 4] = [
        Priority::Critical,
        Priority::High,
        Priority::Normal,
        Priority::Low,
    ];

    /// Position of this level in dequeue order.
    pub fn index(self) -> usize {
        match self {
            Priority::Critical => 0,
            Priority::High => 1,
            Priority::Normal => 2,
            Priority::Low => 3,
        }
    }
}

impl FromStr for Priority {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "critical" => Ok(Priority::Critical),
            "high" => Ok(Priority::High),
            "normal" => Ok(Priority::Normal),
            "low" => Ok(Priority::Low),
            other => Err(Error::Validation(format!("Unknown priority: {other}"))),
        }
    }
}

/// Kind of task a prompt is evaluated for. Drives evaluator routing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    CodeGeneration,
    Reasoning,
    Classification,
    QuestionAnswering,
    Summarization,
    #[default]
    Generic,
}

impl TaskType {
    pub const ALL: [TaskType; 6] = [
        TaskType::CodeGeneration,
        TaskType::Reasoning,
        TaskType::Classification,
        TaskType::QuestionAnswering,
        TaskType::Summarization,
        TaskType::Generic,
    ];
}

impl FromStr for TaskType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "code_generation" | "code" => Ok(TaskType::CodeGeneration),
            "reasoning" => Ok(TaskType::Reasoning),
            "classification" => Ok(TaskType::Classification),
            "question_answering" | "qa" => Ok(TaskType::QuestionAnswering),
            "summarization" => Ok(TaskType::Summarization),
            "generic" => Ok(TaskType::Generic),
            other => Err(Error::Validation(format!("Unknown task type: {other}"))),
        }
    }
}

/// Reference to the evaluator a task is dispatched to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum EvaluatorRef {
    /// Route by task type.
    Task(TaskType),
    /// A named evaluator registered with the registry.
    Named(String),
}

impl Default for EvaluatorRef {
    fn default() -> Self {
        Self::Task(TaskType::Generic)
    }
}

/// Lifecycle state of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    /// Terminal states admit no further transition.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }
}

/// Unit of scheduled evaluation work.
#[derive(Debug, Clone)]
pub struct EvaluationTask {
    pub id: TaskId,
    pub candidate_id: CandidateId,
    pub priority: Priority,
    pub evaluator: EvaluatorRef,
    status: TaskStatus,
    pub submitted_at: SystemTime,
    started_at: Option<SystemTime>,
    finished_at: Option<SystemTime>,
    result: Option<std::result::Result<f64, EvaluationError>>,
}

impl EvaluationTask {
    /// Create a pending task with normal priority.
    pub fn new(
        id: impl Into<String>,
        candidate_id: CandidateId,
        evaluator: EvaluatorRef,
    ) -> Result<Self> {
        let id = id.into();
        if id.trim().is_empty() {
            return Err(Error::Validation("Task id must be non-empty".to_string()));
        }
        if candidate_id.as_str().trim().is_empty() {
            return Err(Error::Validation(format!(
                "Task {id} must reference a candidate"
            )));
        }
        if let EvaluatorRef::Named(name) = &evaluator
            && name.trim().is_empty()
        {
            return Err(Error::Validation(format!(
                "Task {id} has an empty evaluator name"
            )));
        }

        Ok(Self {
            id: TaskId(id),
            candidate_id,
            priority: Priority::default(),
            evaluator,
            status: TaskStatus::Pending,
            submitted_at: SystemTime::now(),
            started_at: None,
            finished_at: None,
            result: None,
        })
    }

    /// Set the scheduling priority.
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn status(&self) -> TaskStatus {
        self.status
    }

    pub fn started_at(&self) -> Option<SystemTime> {
        self.started_at
    }

    pub fn finished_at(&self) -> Option<SystemTime> {
        self.finished_at
    }

    /// Outcome, once the task has finished running.
    pub fn result(&self) -> Option<&std::result::Result<f64, EvaluationError>> {
        self.result.as_ref()
    }

    /// `pending -> running`.
    pub fn start(&mut self) -> Result<()> {
        self.transition(TaskStatus::Running, &[TaskStatus::Pending])?;
        self.started_at = Some(SystemTime::now());
        Ok(())
    }

    /// `running -> completed`.
    pub fn complete(&mut self, fitness: f64) -> Result<()> {
        self.transition(TaskStatus::Completed, &[TaskStatus::Running])?;
        self.finished_at = Some(SystemTime::now());
        self.result = Some(Ok(fitness));
        Ok(())
    }

    /// `running -> failed`.
    pub fn fail(&mut self, error: EvaluationError) -> Result<()> {
        self.transition(TaskStatus::Failed, &[TaskStatus::Running])?;
        self.finished_at = Some(SystemTime::now());
        self.result = Some(Err(error));
        Ok(())
    }

    /// `pending -> cancelled`. Running tasks cannot be preempted.
    pub fn cancel(&mut self) -> Result<()> {
        self.transition(TaskStatus::Cancelled, &[TaskStatus::Pending])?;
        self.finished_at = Some(SystemTime::now());
        Ok(())
    }

    fn transition(&mut self, to: TaskStatus, allowed_from: &[TaskStatus]) -> Result<()> {
        if !allowed_from.contains(&self.status) {
            return Err(Error::InvalidTransition {
                id: self.id.0.clone(),
                from: self.status,
                to,
            });
        }
        self.status = to;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task(id: &str) -> EvaluationTask {
        EvaluationTask::new(id, CandidateId::from("c1"), EvaluatorRef::default()).unwrap()
    }

    #[test]
    fn test_construction_validates() {
        assert!(EvaluationTask::new("", "c1".into(), EvaluatorRef::default()).is_err());
        assert!(EvaluationTask::new("t1", "".into(), EvaluatorRef::default()).is_err());
        assert!(
            EvaluationTask::new("t1", "c1".into(), EvaluatorRef::Named(" ".into())).is_err()
        );

        let t = task("t1");
        assert_eq!(t.priority, Priority::Normal);
        assert_eq!(t.status(), TaskStatus::Pending);
    }

    #[test]
    fn test_lifecycle() {
        let mut t = task("t1");
        t.start().unwrap();
        assert!(t.started_at().is_some());
        t.complete(0.75).unwrap();
        assert_eq!(t.status(), TaskStatus::Completed);
        assert_eq!(t.result(), Some(&Ok(0.75)));
    }

    #[test]
    fn test_terminal_states_are_final() {
        let mut done = task("t1");
        done.start().unwrap();
        done.fail(EvaluationError::Failed("boom".into())).unwrap();
        assert!(done.start().is_err());
        assert!(done.complete(1.0).is_err());
        assert!(done.cancel().is_err());

        let mut cancelled = task("t2");
        cancelled.cancel().unwrap();
        assert!(matches!(
            cancelled.start(),
            Err(Error::InvalidTransition {
                from: TaskStatus::Cancelled,
                ..
            })
        ));
    }

    #[test]
    fn test_running_task_cannot_be_cancelled() {
        let mut t = task("t1");
        t.start().unwrap();
        assert!(t.cancel().is_err());
        assert_eq!(t.status(), TaskStatus::Running);
    }

    #[test]
    fn test_parse_priority_and_task_type() {
        assert_eq!("HIGH".parse::<Priority>().unwrap(), Priority::High);
        assert!("urgent".parse::<Priority>().is_err());
        assert_eq!(
            "question-answering".parse::<TaskType>().unwrap(),
            TaskType::QuestionAnswering
        );
    }
}
