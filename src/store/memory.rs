//! In-memory progress store (non-persistent).

use super::{Grant, ProgressStore, StoreError};
use crate::task::{ProgressRecord, TaskRecord};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::RwLock;

#[derive(Debug, Clone)]
struct Referral {
    referrer_id: String,
    referrer_rewarded: bool,
}

#[derive(Default)]
struct State {
    tasks: BTreeMap<i64, TaskRecord>,
    progress: HashMap<i64, ProgressRecord>,
    by_owner: HashMap<(String, i64), i64>,
    profiles: HashMap<String, i64>,
    referrals: Vec<Referral>,
    next_progress_id: i64,
}

/// Every operation runs under one lock, so each is atomic with respect to
/// the others.
#[derive(Clone, Default)]
pub struct InMemoryProgressStore {
    state: Arc<RwLock<State>>,
}

impl InMemoryProgressStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert_task(&self, task: TaskRecord) {
        self.state.write().await.tasks.insert(task.id, task);
    }

    /// Create or overwrite a profile balance.
    pub async fn upsert_profile(&self, owner: &str, points: i64) {
        self.state
            .write()
            .await
            .profiles
            .insert(owner.to_string(), points);
    }

    pub async fn add_referral(&self, referrer: &str, referrer_rewarded: bool) {
        self.state.write().await.referrals.push(Referral {
            referrer_id: referrer.to_string(),
            referrer_rewarded,
        });
    }

    pub async fn balance(&self, owner: &str) -> Option<i64> {
        self.state.read().await.profiles.get(owner).copied()
    }

    /// Number of progress records held (for testing).
    pub async fn progress_count(&self) -> usize {
        self.state.read().await.progress.len()
    }
}

#[async_trait]
impl ProgressStore for InMemoryProgressStore {
    fn is_persistent(&self) -> bool {
        false
    }

    async fn get_task(&self, task_id: i64) -> Result<Option<TaskRecord>, StoreError> {
        Ok(self.state.read().await.tasks.get(&task_id).cloned())
    }

    async fn list_tasks_with_progress(
        &self,
        owner: &str,
    ) -> Result<Vec<(TaskRecord, Option<ProgressRecord>)>, StoreError> {
        let state = self.state.read().await;
        Ok(state
            .tasks
            .values()
            .map(|task| {
                let progress = state
                    .by_owner
                    .get(&(owner.to_string(), task.id))
                    .and_then(|id| state.progress.get(id))
                    .cloned();
                (task.clone(), progress)
            })
            .collect())
    }

    async fn find_progress(
        &self,
        owner: &str,
        task_id: i64,
    ) -> Result<Option<ProgressRecord>, StoreError> {
        let state = self.state.read().await;
        Ok(state
            .by_owner
            .get(&(owner.to_string(), task_id))
            .and_then(|id| state.progress.get(id))
            .cloned())
    }

    async fn get_or_create_progress(
        &self,
        owner: &str,
        task_id: i64,
    ) -> Result<ProgressRecord, StoreError> {
        let mut state = self.state.write().await;
        let key = (owner.to_string(), task_id);
        if let Some(existing) = state.by_owner.get(&key).and_then(|id| state.progress.get(id)) {
            return Ok(existing.clone());
        }
        state.next_progress_id += 1;
        let record = ProgressRecord::new(state.next_progress_id, owner, task_id);
        state.by_owner.insert(key, record.id);
        state.progress.insert(record.id, record.clone());
        Ok(record)
    }

    async fn start_progress(
        &self,
        progress_id: i64,
        at: DateTime<Utc>,
    ) -> Result<ProgressRecord, StoreError> {
        let mut state = self.state.write().await;
        let record = state
            .progress
            .get_mut(&progress_id)
            .ok_or_else(|| StoreError::NotFound(format!("Progress {}", progress_id)))?;
        if record.started_at.is_none() {
            record.started_at = Some(at);
        }
        Ok(record.clone())
    }

    async fn count_unrewarded_referrals(&self, referrer: &str) -> Result<u64, StoreError> {
        let state = self.state.read().await;
        Ok(state
            .referrals
            .iter()
            .filter(|r| r.referrer_id == referrer && !r.referrer_rewarded)
            .count() as u64)
    }

    async fn grant_reward(
        &self,
        progress_id: i64,
        owner: &str,
        amount: i64,
    ) -> Result<Grant, StoreError> {
        let mut state = self.state.write().await;
        let record = state
            .progress
            .get(&progress_id)
            .filter(|r| r.owner == owner)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("Progress {}", progress_id)))?;

        if record.completed {
            return Ok(Grant {
                record,
                applied: false,
            });
        }

        let points = state
            .profiles
            .get_mut(owner)
            .ok_or_else(|| StoreError::NotFound(format!("Profile for {}", owner)))?;
        *points += amount;

        let record = match state.progress.get_mut(&progress_id) {
            Some(r) => {
                r.completed = true;
                r.clone()
            }
            None => return Err(StoreError::NotFound(format!("Progress {}", progress_id))),
        };
        Ok(Grant {
            record,
            applied: true,
        })
    }

    async fn get_progress_with_task(
        &self,
        progress_id: i64,
    ) -> Result<Option<(TaskRecord, ProgressRecord)>, StoreError> {
        let state = self.state.read().await;
        Ok(state.progress.get(&progress_id).and_then(|progress| {
            state
                .tasks
                .get(&progress.task_id)
                .map(|task| (task.clone(), progress.clone()))
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::contract;

    async fn seeded() -> InMemoryProgressStore {
        let store = InMemoryProgressStore::new();
        store.insert_task(contract::visit_task(1)).await;
        store.insert_task(contract::visit_task(2)).await;
        store.upsert_profile("alice", 1000).await;
        store.upsert_profile("bob", 0).await;
        store
    }

    #[tokio::test]
    async fn test_upsert_is_idempotent() {
        contract::upsert_is_idempotent(&seeded().await).await;
    }

    #[tokio::test]
    async fn test_start_is_monotonic() {
        contract::start_is_monotonic(&seeded().await).await;
    }

    #[tokio::test]
    async fn test_grant_applies_once() {
        let store = seeded().await;
        contract::grant_applies_once(&store).await;
        assert_eq!(store.balance("alice").await, Some(1250));
    }

    #[tokio::test]
    async fn test_grant_checks_owner() {
        contract::grant_checks_owner(&seeded().await).await;
    }

    #[tokio::test]
    async fn test_listing_joins_progress() {
        contract::listing_joins_progress(&seeded().await).await;
    }

    #[tokio::test]
    async fn test_grant_without_profile_leaves_record_open() {
        let store = seeded().await;
        let record = store.get_or_create_progress("carol", 1).await.unwrap();
        assert!(matches!(
            store.grant_reward(record.id, "carol", 250).await,
            Err(StoreError::NotFound(_))
        ));
        let record = store.find_progress("carol", 1).await.unwrap().unwrap();
        assert!(!record.completed);
    }

    #[tokio::test]
    async fn test_counts_only_unrewarded_referrals() {
        let store = seeded().await;
        store.add_referral("alice", false).await;
        store.add_referral("alice", false).await;
        store.add_referral("alice", true).await;
        store.add_referral("bob", false).await;
        assert_eq!(store.count_unrewarded_referrals("alice").await.unwrap(), 2);
        assert_eq!(store.count_unrewarded_referrals("carol").await.unwrap(), 0);
    }
}
