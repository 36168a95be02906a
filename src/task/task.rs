//! Task definitions and their per-kind metadata.
//!
//! # Invariants
//! - A `TaskDefinition` always carries a `TaskKind` whose metadata parsed
//!   successfully; malformed definitions never reach a verification strategy.
//! - Definitions are read-only here; authoring happens elsewhere.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A task definition exactly as persisted.
///
/// `task_type` and `metadata` are untyped on disk; `TaskDefinition` is the
/// parsed form used by the dispatcher.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRecord {
    pub id: i64,
    pub title: String,
    pub description: String,
    pub reward: i64,
    #[serde(rename = "type")]
    pub task_type: String,
    #[serde(default)]
    pub metadata: Value,
}

/// Closed set of supported task kinds, each with its own metadata.
///
/// # Exhaustive Matching
/// Adding a kind forces every dispatch site to handle it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskKind {
    /// Join a Telegram channel or group
    JoinChannel { chat_id: String },

    /// Accumulate unrewarded referrals
    Referral { required: u64 },

    /// Stay on a page for a minimum duration
    Visit { wait_seconds: u64 },
}

impl TaskKind {
    pub const JOIN_CHANNEL: &'static str = "JOIN_TELEGRAM_CHANNEL";
    pub const REFERRAL: &'static str = "REFERRAL";
    pub const VISIT: &'static str = "VISIT";

    pub const DEFAULT_REQUIRED_REFERRALS: u64 = 1;
    pub const DEFAULT_WAIT_SECONDS: u64 = 10;

    /// Parse a stored type string and metadata bag.
    ///
    /// # Errors
    /// `TaskError::Validation` for an unknown type, a missing channel, or
    /// non-numeric counts.
    pub fn parse(task_type: &str, metadata: &Value) -> Result<Self, TaskError> {
        match task_type {
            Self::JOIN_CHANNEL => {
                let chat_id = match metadata.get("chatId") {
                    Some(Value::String(s)) => s.trim().to_string(),
                    Some(Value::Number(n)) => n.to_string(),
                    _ => String::new(),
                };
                if chat_id.is_empty() {
                    return Err(TaskError::Validation(
                        "Missing Telegram channel/group username in task data".to_string(),
                    ));
                }
                Ok(Self::JoinChannel { chat_id })
            }
            Self::REFERRAL => Ok(Self::Referral {
                required: metadata_u64(metadata, "numFriends", Self::DEFAULT_REQUIRED_REFERRALS)?,
            }),
            Self::VISIT => Ok(Self::Visit {
                wait_seconds: metadata_u64(metadata, "numWaitSeconds", Self::DEFAULT_WAIT_SECONDS)?,
            }),
            _ => Err(TaskError::Validation("Invalid task type".to_string())),
        }
    }

    /// Wire name of this kind.
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::JoinChannel { .. } => Self::JOIN_CHANNEL,
            Self::Referral { .. } => Self::REFERRAL,
            Self::Visit { .. } => Self::VISIT,
        }
    }
}

/// Read a non-negative integer that may be stored as a number or a numeric string.
fn metadata_u64(metadata: &Value, key: &str, default: u64) -> Result<u64, TaskError> {
    let invalid = || TaskError::Validation(format!("Invalid {} in task data", key));
    match metadata.get(key) {
        None | Some(Value::Null) => Ok(default),
        Some(Value::Number(n)) => n
            .as_u64()
            .or_else(|| n.as_f64().and_then(ceil_non_negative))
            .ok_or_else(invalid),
        Some(Value::String(s)) => {
            let s = s.trim();
            s.parse::<u64>()
                .ok()
                .or_else(|| s.parse::<f64>().ok().and_then(ceil_non_negative))
                .ok_or_else(invalid)
        }
        Some(_) => Err(invalid()),
    }
}

/// Fractional counts round up; negative and non-finite values are rejected.
fn ceil_non_negative(f: f64) -> Option<u64> {
    (f.is_finite() && f >= 0.0).then(|| f.ceil() as u64)
}

/// A task definition with validated, typed metadata.
///
/// # Invariants
/// - `kind` was parsed from `record.task_type` and `record.metadata`
#[derive(Debug, Clone, PartialEq)]
pub struct TaskDefinition {
    record: TaskRecord,
    kind: TaskKind,
}

impl TaskDefinition {
    pub fn id(&self) -> i64 {
        self.record.id
    }

    pub fn reward(&self) -> i64 {
        self.record.reward
    }

    pub fn kind(&self) -> &TaskKind {
        &self.kind
    }

    /// The stored form, used when rendering responses.
    pub fn record(&self) -> &TaskRecord {
        &self.record
    }
}

impl TryFrom<TaskRecord> for TaskDefinition {
    type Error = TaskError;

    fn try_from(record: TaskRecord) -> Result<Self, Self::Error> {
        let kind = TaskKind::parse(&record.task_type, &record.metadata)?;
        Ok(Self { record, kind })
    }
}

/// Errors surfaced by a completion check.
///
/// The display string is the short diagnostic returned to callers.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TaskError {
    /// Missing or invalid caller credentials
    #[error("{0}")]
    Unauthorized(String),

    /// Unknown task
    #[error("{0}")]
    NotFound(String),

    /// Malformed input, unsupported task type, or unverifiable signed payload
    #[error("{0}")]
    Validation(String),

    /// Membership service or store call failed or timed out (not retried)
    #[error("{0}")]
    ExternalService(String),

    /// Store write failure
    #[error("{0}")]
    Internal(String),
}
