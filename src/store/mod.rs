//! Progress storage with pluggable backends.
//!
//! Supports:
//! - `memory`: In-memory storage (non-persistent, for testing)
//! - `sqlite`: SQLite database
//!
//! # Reward grant contract
//! `grant_reward` flips `completed` and credits the owner's profile in one
//! conditional write. Concurrent calls for the same progress record apply the
//! reward at most once; losers get `applied == false` and the current record.

mod memory;
mod sqlite;

pub use memory::InMemoryProgressStore;
pub use sqlite::SqliteProgressStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::task::{ProgressRecord, TaskRecord};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("{0} not found")]
    NotFound(String),

    #[error("Database error: {0}")]
    Database(String),
}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        Self::Database(e.to_string())
    }
}

/// Result of a reward grant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Grant {
    /// The record after the grant (always `completed == true`)
    pub record: ProgressRecord,
    /// Whether this call flipped `completed` and credited the reward
    pub applied: bool,
}

/// Progress store trait - implemented by all storage backends.
#[async_trait]
pub trait ProgressStore: Send + Sync {
    /// Whether this store persists data across restarts.
    fn is_persistent(&self) -> bool;

    /// Get a task definition by ID.
    async fn get_task(&self, task_id: i64) -> Result<Option<TaskRecord>, StoreError>;

    /// All tasks, each joined with `owner`'s progress if any. Ordered by task id.
    async fn list_tasks_with_progress(
        &self,
        owner: &str,
    ) -> Result<Vec<(TaskRecord, Option<ProgressRecord>)>, StoreError>;

    /// Look up progress without creating it.
    async fn find_progress(
        &self,
        owner: &str,
        task_id: i64,
    ) -> Result<Option<ProgressRecord>, StoreError>;

    /// Idempotent upsert keyed on `(owner, task_id)`.
    async fn get_or_create_progress(
        &self,
        owner: &str,
        task_id: i64,
    ) -> Result<ProgressRecord, StoreError>;

    /// Set `started_at` if it is still unset, then return the record.
    ///
    /// An existing start time is never overwritten.
    async fn start_progress(
        &self,
        progress_id: i64,
        at: DateTime<Utc>,
    ) -> Result<ProgressRecord, StoreError>;

    /// Referrals by `referrer` whose referrer reward is still outstanding.
    async fn count_unrewarded_referrals(&self, referrer: &str) -> Result<u64, StoreError>;

    /// Mark progress completed and credit `amount` to `owner`, at most once.
    async fn grant_reward(
        &self,
        progress_id: i64,
        owner: &str,
        amount: i64,
    ) -> Result<Grant, StoreError>;

    /// Progress joined with its task.
    async fn get_progress_with_task(
        &self,
        progress_id: i64,
    ) -> Result<Option<(TaskRecord, ProgressRecord)>, StoreError>;
}

/// Store contract checks shared by every backend's tests.
#[cfg(test)]
pub(crate) mod contract {
    use super::*;
    use chrono::{Duration, TimeZone};
    use serde_json::json;

    pub fn visit_task(id: i64) -> TaskRecord {
        TaskRecord {
            id,
            title: "Visit our site".to_string(),
            description: "Keep the page open".to_string(),
            reward: 250,
            task_type: "VISIT".to_string(),
            metadata: json!({"numWaitSeconds": 10}),
        }
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 8, 0, 0).unwrap()
    }

    pub async fn upsert_is_idempotent(store: &dyn ProgressStore) {
        assert!(store.find_progress("alice", 1).await.unwrap().is_none());

        let first = store.get_or_create_progress("alice", 1).await.unwrap();
        let second = store.get_or_create_progress("alice", 1).await.unwrap();
        assert_eq!(first, second);
        assert!(!first.completed);
        assert_eq!(first.started_at, None);

        let other_user = store.get_or_create_progress("bob", 1).await.unwrap();
        assert_ne!(other_user.id, first.id);

        assert_eq!(store.find_progress("alice", 1).await.unwrap(), Some(first));
    }

    pub async fn start_is_monotonic(store: &dyn ProgressStore) {
        let record = store.get_or_create_progress("alice", 1).await.unwrap();

        let started = store.start_progress(record.id, t0()).await.unwrap();
        assert_eq!(started.started_at, Some(t0()));

        let again = store
            .start_progress(record.id, t0() + Duration::seconds(30))
            .await
            .unwrap();
        assert_eq!(again.started_at, Some(t0()));

        assert!(matches!(
            store.start_progress(9999, t0()).await,
            Err(StoreError::NotFound(_))
        ));
    }

    /// Grants the same record twice; callers check the balance moved once.
    pub async fn grant_applies_once(store: &dyn ProgressStore) {
        let record = store.get_or_create_progress("alice", 1).await.unwrap();

        let first = store.grant_reward(record.id, "alice", 250).await.unwrap();
        assert!(first.applied);
        assert!(first.record.completed);

        let second = store.grant_reward(record.id, "alice", 250).await.unwrap();
        assert!(!second.applied);
        assert!(second.record.completed);
        assert_eq!(second.record.id, record.id);
    }

    pub async fn grant_checks_owner(store: &dyn ProgressStore) {
        let record = store.get_or_create_progress("alice", 1).await.unwrap();
        assert!(matches!(
            store.grant_reward(record.id, "mallory", 250).await,
            Err(StoreError::NotFound(_))
        ));
        let unchanged = store.find_progress("alice", 1).await.unwrap().unwrap();
        assert!(!unchanged.completed);
    }

    pub async fn listing_joins_progress(store: &dyn ProgressStore) {
        let record = store.get_or_create_progress("alice", 1).await.unwrap();
        store.start_progress(record.id, t0()).await.unwrap();

        let alice = store.list_tasks_with_progress("alice").await.unwrap();
        assert_eq!(alice.len(), 2);
        assert_eq!(alice[0].0.id, 1);
        assert_eq!(alice[0].1.as_ref().and_then(|p| p.started_at), Some(t0()));
        assert_eq!(alice[1].0.id, 2);
        assert!(alice[1].1.is_none());

        let bob = store.list_tasks_with_progress("bob").await.unwrap();
        assert!(bob.iter().all(|(_, p)| p.is_none()));

        let (task, progress) = store.get_progress_with_task(record.id).await.unwrap().unwrap();
        assert_eq!(task.id, 1);
        assert_eq!(progress.id, record.id);
    }
}
