//! Per-user progress on a task and its response view.
//!
//! # Invariants
//! - At most one `ProgressRecord` exists per `(owner, task_id)`
//! - `completed` goes from `false` to `true` once and never back
//! - `started_at`, once set, is never cleared or moved

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::task::TaskRecord;

/// Mutable state of one user's attempt at one task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressRecord {
    pub id: i64,
    pub owner: String,
    pub task_id: i64,
    pub completed: bool,
    pub started_at: Option<DateTime<Utc>>,
}

impl ProgressRecord {
    /// A fresh, not yet started record.
    pub fn new(id: i64, owner: impl Into<String>, task_id: i64) -> Self {
        Self {
            id,
            owner: owner.into(),
            task_id,
            completed: false,
            started_at: None,
        }
    }

    /// Where this record sits on the visit timer at `now`.
    pub fn visit_phase(&self, now: DateTime<Utc>, wait_seconds: u64) -> VisitPhase {
        if self.completed {
            return VisitPhase::Completed;
        }
        let Some(started_at) = self.started_at else {
            return VisitPhase::NotStarted;
        };
        let elapsed_ms = (now - started_at).num_milliseconds();
        let required_ms = i64::try_from(wait_seconds.saturating_mul(1000)).unwrap_or(i64::MAX);
        if elapsed_ms >= required_ms {
            VisitPhase::Elapsed
        } else {
            VisitPhase::Started {
                remaining_ms: required_ms - elapsed_ms.max(0),
            }
        }
    }
}

/// Visit timer states.
///
/// ```text
/// NotStarted -> Started -> Elapsed -> Completed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VisitPhase {
    /// No start time recorded yet
    NotStarted,
    /// Timer running; the wait has not passed
    Started { remaining_ms: i64 },
    /// Wait has passed but the reward is not granted yet
    Elapsed,
    /// Reward granted
    Completed,
}

/// A task joined with the caller's progress, as returned to clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskView {
    pub id: i64,
    pub title: String,
    pub description: String,
    pub reward: i64,
    #[serde(rename = "type")]
    pub task_type: String,
    pub metadata: Value,
    pub completed: bool,
    pub task_started_at: Option<DateTime<Utc>>,
}

impl TaskView {
    /// Join a task with an optional progress record; no record means untouched.
    pub fn new(task: &TaskRecord, progress: Option<&ProgressRecord>) -> Self {
        Self {
            id: task.id,
            title: task.title.clone(),
            description: task.description.clone(),
            reward: task.reward,
            task_type: task.task_type.clone(),
            metadata: task.metadata.clone(),
            completed: progress.map(|p| p.completed).unwrap_or(false),
            task_started_at: progress.and_then(|p| p.started_at),
        }
    }
}
