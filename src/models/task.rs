//! Task Model
//!
//! One analysis attempt for an issue. Tasks move through the pipeline states
//! monotonically and end in exactly one terminal state. At most one
//! non-terminal task exists per issue at any time (enforced at admission).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Task lifecycle state.
///
/// Ordering: queued < downloading < decrypting < extracting < analyzing,
/// then one of the absorbing terminal states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskState {
    Queued,
    Downloading,
    Decrypting,
    Extracting,
    Analyzing,
    Done,
    Failed,
    Cancelled,
}

impl std::fmt::Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Queued => write!(f, "queued"),
            Self::Downloading => write!(f, "downloading"),
            Self::Decrypting => write!(f, "decrypting"),
            Self::Extracting => write!(f, "extracting"),
            Self::Analyzing => write!(f, "analyzing"),
            Self::Done => write!(f, "done"),
            Self::Failed => write!(f, "failed"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

impl std::str::FromStr for TaskState {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(Self::Queued),
            "downloading" => Ok(Self::Downloading),
            "decrypting" => Ok(Self::Decrypting),
            "extracting" => Ok(Self::Extracting),
            "analyzing" => Ok(Self::Analyzing),
            "done" => Ok(Self::Done),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            _ => Err(()),
        }
    }
}

impl TaskState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Failed | Self::Cancelled)
    }

    /// Position in the pipeline partial order. Terminal states share the top
    /// rank; a task never moves to a lower-ranked state.
    pub fn rank(&self) -> u8 {
        match self {
            Self::Queued => 0,
            Self::Downloading => 1,
            Self::Decrypting => 2,
            Self::Extracting => 3,
            Self::Analyzing => 4,
            Self::Done | Self::Failed | Self::Cancelled => 5,
        }
    }

    /// Whether a transition to `next` respects the state machine.
    pub fn can_transition_to(&self, next: TaskState) -> bool {
        if self.is_terminal() {
            return false;
        }
        next.rank() >= self.rank()
    }
}

/// A durable task record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub task_id: String,
    pub issue_id: String,
    pub state: TaskState,
    /// 0–100, non-decreasing over the task's lifetime
    pub progress: u8,
    pub message: String,
    /// Set only when state is `failed`; format "<FailureKind>: <message>"
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Provider override requested at creation (e.g. "codex")
    #[serde(skip_serializing_if = "Option::is_none")]
    pub requested_agent: Option<String>,
    #[serde(default)]
    pub requested_by: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    /// Fresh queued task for an issue.
    pub fn new(issue_id: impl Into<String>, requested_agent: Option<String>, requested_by: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            task_id: new_task_id(),
            issue_id: issue_id.into(),
            state: TaskState::Queued,
            progress: 0,
            message: "queued".to_string(),
            error: None,
            requested_agent,
            requested_by: requested_by.into(),
            created_at: now,
            updated_at: now,
        }
    }
}

/// Generate a task identifier: task_ + 12 hex chars.
pub fn new_task_id() -> String {
    let hex = uuid::Uuid::new_v4().simple().to_string();
    format!("task_{}", &hex[..12])
}

/// Request body for `POST /tasks`.
#[derive(Debug, Clone, Deserialize)]
pub struct TaskCreate {
    pub issue_id: String,
    #[serde(default)]
    pub agent_type: Option<String>,
    #[serde(default)]
    pub username: String,
}

/// Request body for `POST /tasks/batch`.
#[derive(Debug, Clone, Deserialize)]
pub struct BatchTaskCreate {
    pub issue_ids: Vec<String>,
    #[serde(default)]
    pub agent_type: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn test_state_display_roundtrip() {
        for state in [
            TaskState::Queued,
            TaskState::Downloading,
            TaskState::Decrypting,
            TaskState::Extracting,
            TaskState::Analyzing,
            TaskState::Done,
            TaskState::Failed,
            TaskState::Cancelled,
        ] {
            assert_eq!(TaskState::from_str(&state.to_string()), Ok(state));
        }
        assert!(TaskState::from_str("bogus").is_err());
    }

    #[test]
    fn test_terminal_states_absorbing() {
        for terminal in [TaskState::Done, TaskState::Failed, TaskState::Cancelled] {
            assert!(terminal.is_terminal());
            assert!(!terminal.can_transition_to(TaskState::Queued));
            assert!(!terminal.can_transition_to(TaskState::Done));
        }
    }

    #[test]
    fn test_state_order_is_monotone() {
        assert!(TaskState::Queued.can_transition_to(TaskState::Downloading));
        assert!(TaskState::Downloading.can_transition_to(TaskState::Analyzing));
        assert!(TaskState::Analyzing.can_transition_to(TaskState::Done));
        assert!(TaskState::Queued.can_transition_to(TaskState::Cancelled));
        // No going backwards
        assert!(!TaskState::Analyzing.can_transition_to(TaskState::Extracting));
        assert!(!TaskState::Extracting.can_transition_to(TaskState::Downloading));
    }

    #[test]
    fn test_new_task_defaults() {
        let task = Task::new("rec_1", Some("codex".into()), "alice");
        assert!(task.task_id.starts_with("task_"));
        assert_eq!(task.task_id.len(), "task_".len() + 12);
        assert_eq!(task.state, TaskState::Queued);
        assert_eq!(task.progress, 0);
        assert!(task.error.is_none());
    }

    #[test]
    fn test_task_ids_unique() {
        assert_ne!(new_task_id(), new_task_id());
    }
}
