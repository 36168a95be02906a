//! Routes a completion check to its strategy and grants the reward.
//!
//! # Evaluation order
//! 1. Load the task definition (`NotFound` if absent, `Validation` if malformed)
//! 2. Look up existing progress; a completed record short-circuits
//! 3. Validate strategy input (no store mutation before this point)
//! 4. Fetch or create the progress record
//! 5. Run the strategy for the task kind
//! 6. On `Completed`, grant through the store's conditional write
//!
//! # Invariants
//! - A completed record never reaches a strategy or collaborator again
//! - The reward is applied at most once per record, whatever the interleaving

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::OwnedMutexGuard;

use super::progress::{ProgressRecord, TaskView};
use super::task::{TaskDefinition, TaskError, TaskKind};
use super::verification::{
    JoinChannelStrategy, Outcome, ReferralStrategy, StrategyInput, Verdict, VisitStep,
    VisitStrategy,
};
use crate::clock::Clock;
use crate::store::{ProgressStore, StoreError};
use crate::telegram::{IdentityVerifier, MembershipClient};

impl From<StoreError> for TaskError {
    fn from(e: StoreError) -> Self {
        TaskError::Internal(e.to_string())
    }
}

type LockKey = (String, i64);

/// In-process serialization of evaluations per (user, task).
///
/// Entries are removed once no evaluation holds or waits on them.
#[derive(Default)]
pub struct EvaluationLocks {
    entries: Mutex<HashMap<LockKey, Arc<tokio::sync::Mutex<()>>>>,
}

impl EvaluationLocks {
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<LockKey, Arc<tokio::sync::Mutex<()>>>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Wait for exclusive access to `(owner, task_id)`.
    ///
    /// Cancelling the wait releases the entry like dropping the guard does.
    pub async fn acquire(&self, owner: &str, task_id: i64) -> EvaluationGuard<'_> {
        let key = (owner.to_string(), task_id);
        let mutex = self.entries().entry(key.clone()).or_default().clone();
        let entry = LockEntry {
            locks: self,
            key,
            mutex,
        };
        let guard = Arc::clone(&entry.mutex).lock_owned().await;
        EvaluationGuard {
            _guard: guard,
            _entry: entry,
        }
    }

    /// Number of pairs currently tracked.
    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// One holder's or waiter's claim on a map entry.
struct LockEntry<'a> {
    locks: &'a EvaluationLocks,
    key: LockKey,
    mutex: Arc<tokio::sync::Mutex<()>>,
}

impl Drop for LockEntry<'_> {
    fn drop(&mut self) {
        let mut entries = self.locks.entries();
        // One reference in the map, one here: nobody else holds or waits.
        if Arc::strong_count(&self.mutex) == 2 {
            entries.remove(&self.key);
        }
    }
}

/// Exclusive access to one (user, task) pair.
///
/// Fields drop in order: the lock is released before the entry is checked.
pub struct EvaluationGuard<'a> {
    _guard: OwnedMutexGuard<()>,
    _entry: LockEntry<'a>,
}

/// Evaluates task completion for a caller and grants rewards.
pub struct Dispatcher {
    store: Arc<dyn ProgressStore>,
    membership: Arc<dyn MembershipClient>,
    verifier: Arc<dyn IdentityVerifier>,
    clock: Arc<dyn Clock>,
    store_timeout: Duration,
    locks: Option<EvaluationLocks>,
}

/// A strategy with its validated input, ready to run.
enum Check {
    Membership { chat_id: String, external_user_id: i64 },
    Referrals { required: u64 },
    Visit { wait_seconds: u64 },
}

impl Dispatcher {
    pub const DEFAULT_STORE_TIMEOUT: Duration = Duration::from_secs(5);

    pub fn new(
        store: Arc<dyn ProgressStore>,
        membership: Arc<dyn MembershipClient>,
        verifier: Arc<dyn IdentityVerifier>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            membership,
            verifier,
            clock,
            store_timeout: Self::DEFAULT_STORE_TIMEOUT,
            locks: None,
        }
    }

    pub fn with_store_timeout(mut self, timeout: Duration) -> Self {
        self.store_timeout = timeout;
        self
    }

    /// Serialize evaluations of the same (user, task) within this process.
    pub fn with_serialized_evaluation(mut self, enabled: bool) -> Self {
        self.locks = enabled.then(EvaluationLocks::new);
        self
    }

    pub fn store(&self) -> &Arc<dyn ProgressStore> {
        &self.store
    }

    /// Run one bounded store call.
    ///
    /// A timeout is an external service failure; a store error is internal.
    async fn bounded<T, F>(&self, op: &str, fut: F) -> Result<T, TaskError>
    where
        F: Future<Output = Result<T, StoreError>>,
    {
        match tokio::time::timeout(self.store_timeout, fut).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => {
                tracing::error!("Store call '{}' failed: {}", op, e);
                Err(e.into())
            }
            Err(_) => {
                tracing::warn!("Store call '{}' timed out after {:?}", op, self.store_timeout);
                Err(TaskError::ExternalService(format!("Timed out: {}", op)))
            }
        }
    }

    /// Evaluate `task_id` for `user`.
    ///
    /// # Returns
    /// `Outcome::Completed` with the refreshed view once the task is (or
    /// already was) complete, `Outcome::Pending` otherwise.
    ///
    /// # Errors
    /// See `TaskError`; no failure leaves a partial grant behind.
    pub async fn evaluate(
        &self,
        task_id: i64,
        user: &str,
        input: &StrategyInput,
    ) -> Result<Outcome, TaskError> {
        let _guard = match &self.locks {
            Some(locks) => Some(locks.acquire(user, task_id).await),
            None => None,
        };

        let record = self
            .bounded("load task", self.store.get_task(task_id))
            .await?
            .ok_or_else(|| TaskError::NotFound("Task not found".to_string()))?;
        let task = TaskDefinition::try_from(record).map_err(|e| {
            tracing::warn!("Task {} has invalid definition: {}", task_id, e);
            e
        })?;
        tracing::debug!(
            "Evaluating task {} ({}) for user {}",
            task_id,
            task.kind().type_name(),
            user
        );

        if let Some(progress) = self
            .bounded("find progress", self.store.find_progress(user, task_id))
            .await?
        {
            if progress.completed {
                return Ok(Outcome::Completed(TaskView::new(task.record(), Some(&progress))));
            }
        }

        let now = self.clock.now();
        let check = match task.kind() {
            TaskKind::JoinChannel { chat_id } => Check::Membership {
                chat_id: chat_id.clone(),
                external_user_id: JoinChannelStrategy::external_user_id(
                    self.verifier.as_ref(),
                    input,
                    now,
                )?,
            },
            TaskKind::Referral { required } => Check::Referrals {
                required: *required,
            },
            TaskKind::Visit { wait_seconds } => Check::Visit {
                wait_seconds: *wait_seconds,
            },
        };

        let mut progress = self
            .bounded("create progress", self.store.get_or_create_progress(user, task_id))
            .await?;
        if progress.completed {
            return Ok(Outcome::Completed(TaskView::new(task.record(), Some(&progress))));
        }

        let verdict = match check {
            Check::Membership {
                chat_id,
                external_user_id,
            } => {
                JoinChannelStrategy::new(self.membership.as_ref())
                    .check(&chat_id, external_user_id)
                    .await?
            }
            Check::Referrals { required } => {
                let unrewarded = self
                    .bounded(
                        "count referrals",
                        self.store.count_unrewarded_referrals(user),
                    )
                    .await?;
                ReferralStrategy::check(unrewarded, required)
            }
            Check::Visit { wait_seconds } => {
                let step = VisitStrategy::step(&progress, now, wait_seconds);
                if step == VisitStep::Start {
                    progress = self
                        .bounded("start timer", self.store.start_progress(progress.id, now))
                        .await?;
                    tracing::debug!("Visit timer started for user {} on task {}", user, task_id);
                }
                step.into()
            }
        };

        match verdict {
            Verdict::Pending => Ok(Outcome::Pending(TaskView::new(task.record(), Some(&progress)))),
            Verdict::Completed => self.grant(&task, user, progress).await,
        }
    }

    async fn grant(
        &self,
        task: &TaskDefinition,
        user: &str,
        progress: ProgressRecord,
    ) -> Result<Outcome, TaskError> {
        let grant = match tokio::time::timeout(
            self.store_timeout,
            self.store.grant_reward(progress.id, user, task.reward()),
        )
        .await
        {
            Ok(Ok(grant)) => grant,
            Ok(Err(e)) => {
                tracing::error!("Granting task {} to {} failed: {}", task.id(), user, e);
                return Err(TaskError::Internal(format!("Failed to grant reward: {}", e)));
            }
            Err(_) => {
                tracing::error!("Granting task {} to {} timed out", task.id(), user);
                return Err(TaskError::Internal("Failed to grant reward: timed out".to_string()));
            }
        };

        if grant.applied {
            tracing::info!(
                "Granted {} points to {} for task {}",
                task.reward(),
                user,
                task.id()
            );
        } else {
            tracing::debug!("Task {} for {} was already granted", task.id(), user);
        }

        let view = match self
            .bounded("reload progress", self.store.get_progress_with_task(grant.record.id))
            .await?
        {
            Some((record, progress)) => TaskView::new(&record, Some(&progress)),
            None => TaskView::new(task.record(), Some(&grant.record)),
        };
        Ok(Outcome::Completed(view))
    }

    /// Every task joined with `user`'s progress. Never creates records.
    pub async fn list_tasks(&self, user: &str) -> Result<Vec<TaskView>, TaskError> {
        let rows = self
            .bounded("list tasks", self.store.list_tasks_with_progress(user))
            .await?;
        Ok(rows
            .iter()
            .map(|(task, progress)| TaskView::new(task, progress.as_ref()))
            .collect())
    }
}
