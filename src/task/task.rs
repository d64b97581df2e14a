//! Core Task type and its lifecycle.
//!
//! # Invariants
//! - `id` is unique within a batch
//! - status only moves forward: `Pending -> Running -> {Passed | Failed}`
//! - `result` is attached exactly once, together with the terminal status

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::result::TaskResult;

/// Identifier for a task, as given by the caller or generated.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(String);

impl TaskId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Create a fresh random identifier.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// File-name-safe form of the identifier, used to namespace per-task artifacts.
    ///
    /// `[A-Za-z0-9.-]` pass through (except a leading `.`); every other byte is
    /// written as `_xx` hex, `_` included, so distinct ids never share a stem.
    /// The empty id maps to `_`.
    pub fn file_stem(&self) -> String {
        if self.0.is_empty() {
            return "_".to_string();
        }
        let mut stem = String::with_capacity(self.0.len());
        for (i, c) in self.0.char_indices() {
            if c.is_ascii_alphanumeric() || c == '-' || (c == '.' && i > 0) {
                stem.push(c);
                continue;
            }
            let mut buf = [0u8; 4];
            for byte in c.encode_utf8(&mut buf).bytes() {
                stem.push_str(&format!("_{byte:02x}"));
            }
        }
        stem
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for TaskId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// Status of a task in its lifecycle.
///
/// # State Machine
/// ```text
/// Pending -> Running -> Passed
///                   \-> Failed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Passed,
    Failed,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Passed | TaskStatus::Failed)
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Passed => "passed",
            TaskStatus::Failed => "failed",
        };
        f.write_str(label)
    }
}

/// A unit of work executed by one agent process.
#[derive(Debug, Clone, Serialize)]
pub struct Task {
    id: TaskId,

    /// Short human-readable label
    title: String,

    /// Instructions handed to the agent
    description: String,

    status: TaskStatus,

    /// 1-based position inside the wave the task ran in (diagnostic only)
    slot: Option<usize>,

    result: Option<TaskResult>,
}

impl Task {
    /// Create a pending task.
    ///
    /// # Errors
    /// Returns `Err` if `description` is blank.
    pub fn new(
        id: TaskId,
        title: impl Into<String>,
        description: impl Into<String>,
    ) -> Result<Self, TaskError> {
        let description = description.into();
        if description.trim().is_empty() {
            return Err(TaskError::EmptyDescription(id.to_string()));
        }

        Ok(Self {
            id,
            title: title.into(),
            description,
            status: TaskStatus::Pending,
            slot: None,
            result: None,
        })
    }

    pub fn id(&self) -> &TaskId {
        &self.id
    }

    pub fn title(&self) -> &str {
        &self.title
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn status(&self) -> TaskStatus {
        self.status
    }

    pub fn slot(&self) -> Option<usize> {
        self.slot
    }

    pub fn result(&self) -> Option<&TaskResult> {
        self.result.as_ref()
    }

    /// Take ownership of the result, leaving the task's status untouched.
    pub fn into_result(self) -> Option<TaskResult> {
        self.result
    }

    /// Transition to Running in the given wave slot.
    ///
    /// # Precondition
    /// `self.status == Pending`
    pub fn start(&mut self, slot: usize) -> Result<(), TaskError> {
        match self.status {
            TaskStatus::Pending => {
                self.status = TaskStatus::Running;
                self.slot = Some(slot);
                Ok(())
            }
            other => Err(TaskError::InvalidTransition {
                id: self.id.to_string(),
                from: other,
                to: TaskStatus::Running,
            }),
        }
    }

    /// Attach the task's result and move to Passed or Failed accordingly.
    ///
    /// # Precondition
    /// `self.status == Running`
    pub fn finish(&mut self, result: TaskResult) -> Result<(), TaskError> {
        let to = if result.pass {
            TaskStatus::Passed
        } else {
            TaskStatus::Failed
        };
        match self.status {
            TaskStatus::Running => {
                self.status = to;
                self.result = Some(result);
                Ok(())
            }
            other => Err(TaskError::InvalidTransition {
                id: self.id.to_string(),
                from: other,
                to,
            }),
        }
    }
}

/// Errors that can occur during task operations.
#[derive(Debug, Clone, thiserror::Error)]
pub enum TaskError {
    #[error("Task {0} has an empty description")]
    EmptyDescription(String),

    #[error("Task {id}: invalid state transition from {from} to {to}")]
    InvalidTransition {
        id: String,
        from: TaskStatus,
        to: TaskStatus,
    },

    #[error("Duplicate task id: {0}")]
    DuplicateId(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task() -> Task {
        Task::new(TaskId::new("t-1"), "Title", "Do the thing").unwrap()
    }

    #[test]
    fn new_task_is_pending_without_slot() {
        let task = task();
        assert_eq!(task.status(), TaskStatus::Pending);
        assert_eq!(task.slot(), None);
        assert!(task.result().is_none());
    }

    #[test]
    fn blank_description_is_rejected() {
        let err = Task::new(TaskId::new("x"), "t", "   ").unwrap_err();
        assert!(matches!(err, TaskError::EmptyDescription(_)));
    }

    #[test]
    fn lifecycle_moves_forward_only() {
        let mut task = task();
        task.start(2).unwrap();
        assert_eq!(task.status(), TaskStatus::Running);
        assert_eq!(task.slot(), Some(2));

        task.finish(TaskResult::failure("boom", None)).unwrap();
        assert_eq!(task.status(), TaskStatus::Failed);

        assert!(task.start(1).is_err());
        assert!(task.finish(TaskResult::failure("again", None)).is_err());
        assert_eq!(task.result().unwrap().summary, "boom");
    }

    #[test]
    fn finish_requires_running() {
        let mut task = task();
        let err = task.finish(TaskResult::failure("early", None)).unwrap_err();
        assert!(matches!(
            err,
            TaskError::InvalidTransition {
                from: TaskStatus::Pending,
                to: TaskStatus::Failed,
                ..
            }
        ));
    }

    #[test]
    fn file_stem_escapes_unsafe_characters() {
        assert_eq!(TaskId::new("auth/login tests").file_stem(), "auth_2flogin_20tests");
        assert_eq!(TaskId::new("../etc").file_stem(), "_2e._2fetc");
        assert_eq!(TaskId::new("").file_stem(), "_");
        assert_eq!(TaskId::new("ok-1.2").file_stem(), "ok-1.2");
        assert_eq!(TaskId::new("é").file_stem(), "_c3_a9");
    }

    #[test]
    fn file_stems_of_distinct_ids_differ() {
        let ids = ["a/b", "a_b", "a b", "a_2fb", "a", "_", "", "task", ".a", "_2ea"];
        let stems: std::collections::HashSet<_> =
            ids.iter().map(|id| TaskId::new(*id).file_stem()).collect();
        assert_eq!(stems.len(), ids.len());
    }
}
