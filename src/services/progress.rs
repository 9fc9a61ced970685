//! Progress Bus
//!
//! Per-task progress topics with single-writer (the owning worker) and
//! many-reader semantics. Built on `tokio::sync::watch`, which gives exactly
//! the delivery model the stream needs: subscribers get the current snapshot
//! immediately, slow subscribers see the latest coalesced value instead of a
//! backlog, and dropping the sender closes every stream after the terminal
//! event is observed.

use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use crate::models::task::{Task, TaskState};

/// A snapshot of a task's changing fields, as delivered to subscribers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub task_id: String,
    pub issue_id: String,
    pub state: TaskState,
    pub progress: u8,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl ProgressEvent {
    pub fn from_task(task: &Task) -> Self {
        Self {
            task_id: task.task_id.clone(),
            issue_id: task.issue_id.clone(),
            state: task.state,
            progress: task.progress,
            message: task.message.clone(),
            error: task.error.clone(),
            updated_at: task.updated_at,
        }
    }
}

/// The bus: one watch channel per in-flight task.
#[derive(Default)]
pub struct ProgressBus {
    topics: Mutex<HashMap<String, watch::Sender<ProgressEvent>>>,
}

impl ProgressBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish a snapshot. Progress is clamped so subscribers never observe
    /// a decrease, and events after a terminal one are dropped. Publishing a
    /// terminal event closes the topic: current subscribers read the final
    /// value, late subscribers fall back to the persisted record.
    pub fn publish(&self, event: ProgressEvent) {
        let mut topics = self.topics.lock().expect("progress bus lock poisoned");
        let terminal = event.state.is_terminal();
        let task_id = event.task_id.clone();

        match topics.get(&task_id) {
            Some(sender) => {
                sender.send_modify(|current| {
                    if current.state.is_terminal() {
                        return;
                    }
                    let floor = current.progress;
                    *current = event;
                    if current.progress < floor {
                        current.progress = floor;
                    }
                });
            }
            None => {
                if terminal {
                    // A terminal event with no subscribers needs no topic
                    return;
                }
                let (sender, _) = watch::channel(event);
                topics.insert(task_id.clone(), sender);
            }
        }

        if terminal {
            topics.remove(&task_id);
        }
    }

    /// Subscribe to a task's topic. None when the task has no live topic
    /// (not started yet, or already terminal); callers then serve the
    /// persisted snapshot instead.
    pub fn subscribe(&self, task_id: &str) -> Option<watch::Receiver<ProgressEvent>> {
        let topics = self.topics.lock().expect("progress bus lock poisoned");
        topics.get(task_id).map(|sender| sender.subscribe())
    }

    /// Current in-memory snapshot, when the topic is live.
    pub fn snapshot(&self, task_id: &str) -> Option<ProgressEvent> {
        let topics = self.topics.lock().expect("progress bus lock poisoned");
        topics.get(task_id).map(|sender| sender.borrow().clone())
    }

    /// Number of live topics (health/introspection).
    pub fn live_topics(&self) -> usize {
        self.topics.lock().expect("progress bus lock poisoned").len()
    }
}

impl std::fmt::Debug for ProgressBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProgressBus")
            .field("live_topics", &self.live_topics())
            .finish()
    }
}
