//! SQLite-based progress store.

use super::{Grant, ProgressStore, StoreError};
use crate::task::{ProgressRecord, TaskRecord};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::Error::FromSqlConversionFailure;
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Mutex;

const SCHEMA: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA foreign_keys = ON;

CREATE TABLE IF NOT EXISTS tasks (
    id INTEGER PRIMARY KEY NOT NULL,
    title TEXT NOT NULL,
    description TEXT NOT NULL DEFAULT '',
    reward INTEGER NOT NULL,
    type TEXT NOT NULL,
    metadata TEXT NOT NULL DEFAULT '{}'
);

CREATE TABLE IF NOT EXISTS progress (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    owner TEXT NOT NULL,
    task_id INTEGER NOT NULL,
    completed INTEGER NOT NULL DEFAULT 0,
    task_started_at TEXT,
    UNIQUE (owner, task_id),
    FOREIGN KEY (task_id) REFERENCES tasks(id)
);

CREATE TABLE IF NOT EXISTS profiles (
    owner TEXT PRIMARY KEY NOT NULL,
    points INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS referrals (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    referrer_id TEXT NOT NULL,
    referred_id TEXT NOT NULL,
    referrer_rewarded INTEGER NOT NULL DEFAULT 0
);

CREATE INDEX IF NOT EXISTS idx_referrals_referrer ON referrals(referrer_id, referrer_rewarded);
"#;

const PROGRESS_COLUMNS: &str = "id, owner, task_id, completed, task_started_at";
const TASK_COLUMNS: &str = "id, title, description, reward, type, metadata";

pub struct SqliteProgressStore {
    conn: Arc<Mutex<Connection>>,
}

/// Parse an optional RFC3339 column; garbage is a conversion error, not `None`.
fn parse_timestamp(value: Option<String>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    value
        .map(|s| {
            DateTime::parse_from_rfc3339(&s)
                .map(|dt| dt.with_timezone(&Utc))
                .map_err(|e| FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
        })
        .transpose()
}

/// Reads `PROGRESS_COLUMNS` starting at `offset`.
fn progress_from_row(row: &Row<'_>, offset: usize) -> rusqlite::Result<ProgressRecord> {
    Ok(ProgressRecord {
        id: row.get(offset)?,
        owner: row.get(offset + 1)?,
        task_id: row.get(offset + 2)?,
        completed: row.get::<_, i64>(offset + 3)? != 0,
        started_at: parse_timestamp(row.get(offset + 4)?, offset + 4)?,
    })
}

/// Reads `TASK_COLUMNS` from the start of the row.
fn task_from_row(row: &Row<'_>) -> rusqlite::Result<TaskRecord> {
    let metadata: String = row.get(5)?;
    let metadata: serde_json::Value = serde_json::from_str(&metadata)
        .map_err(|e| FromSqlConversionFailure(5, Type::Text, Box::new(e)))?;
    Ok(TaskRecord {
        id: row.get(0)?,
        title: row.get(1)?,
        description: row.get(2)?,
        reward: row.get(3)?,
        task_type: row.get(4)?,
        metadata,
    })
}

fn select_progress(conn: &Connection, progress_id: i64) -> Result<Option<ProgressRecord>, StoreError> {
    Ok(conn
        .query_row(
            &format!("SELECT {} FROM progress WHERE id = ?1", PROGRESS_COLUMNS),
            params![progress_id],
            |row| progress_from_row(row, 0),
        )
        .optional()?)
}

impl SqliteProgressStore {
    /// Open (or create) the database at `path` and apply the schema.
    pub async fn new(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| StoreError::Database(format!("Failed to create store dir: {}", e)))?;
        }

        let conn = tokio::task::spawn_blocking(move || {
            let conn = Connection::open(&path)?;
            conn.execute_batch(SCHEMA)?;
            Ok::<_, StoreError>(conn)
        })
        .await
        .map_err(|e| StoreError::Database(format!("Task join error: {}", e)))??;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Run `f` against the connection on the blocking pool.
    async fn with_conn<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T, StoreError> + Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = conn.blocking_lock();
            f(&mut *conn)
        })
        .await
        .map_err(|e| StoreError::Database(format!("Task join error: {}", e)))?
    }

    pub async fn insert_task(&self, task: TaskRecord) -> Result<(), StoreError> {
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO tasks (id, title, description, reward, type, metadata)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT(id) DO UPDATE SET
                    title = excluded.title, description = excluded.description,
                    reward = excluded.reward, type = excluded.type, metadata = excluded.metadata",
                params![
                    task.id,
                    task.title,
                    task.description,
                    task.reward,
                    task.task_type,
                    task.metadata.to_string()
                ],
            )?;
            Ok(())
        })
        .await
    }

    /// Create or overwrite a profile balance.
    pub async fn upsert_profile(&self, owner: &str, points: i64) -> Result<(), StoreError> {
        let owner = owner.to_string();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO profiles (owner, points) VALUES (?1, ?2)
                 ON CONFLICT(owner) DO UPDATE SET points = excluded.points",
                params![owner, points],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn add_referral(
        &self,
        referrer: &str,
        referred: &str,
        referrer_rewarded: bool,
    ) -> Result<(), StoreError> {
        let referrer = referrer.to_string();
        let referred = referred.to_string();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO referrals (referrer_id, referred_id, referrer_rewarded) VALUES (?1, ?2, ?3)",
                params![referrer, referred, referrer_rewarded as i64],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn balance(&self, owner: &str) -> Result<Option<i64>, StoreError> {
        let owner = owner.to_string();
        self.with_conn(move |conn| {
            Ok(conn
                .query_row(
                    "SELECT points FROM profiles WHERE owner = ?1",
                    params![owner],
                    |row| row.get(0),
                )
                .optional()?)
        })
        .await
    }
}

#[async_trait]
impl ProgressStore for SqliteProgressStore {
    fn is_persistent(&self) -> bool {
        true
    }

    async fn get_task(&self, task_id: i64) -> Result<Option<TaskRecord>, StoreError> {
        self.with_conn(move |conn| {
            Ok(conn
                .query_row(
                    &format!("SELECT {} FROM tasks WHERE id = ?1", TASK_COLUMNS),
                    params![task_id],
                    task_from_row,
                )
                .optional()?)
        })
        .await
    }

    async fn list_tasks_with_progress(
        &self,
        owner: &str,
    ) -> Result<Vec<(TaskRecord, Option<ProgressRecord>)>, StoreError> {
        let owner = owner.to_string();
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT t.id, t.title, t.description, t.reward, t.type, t.metadata,
                        p.id, p.owner, p.task_id, p.completed, p.task_started_at
                 FROM tasks t
                 LEFT JOIN progress p ON p.task_id = t.id AND p.owner = ?1
                 ORDER BY t.id",
            )?;
            let rows = stmt
                .query_map(params![owner], |row| {
                    let task = task_from_row(row)?;
                    let progress_id: Option<i64> = row.get(6)?;
                    let progress = match progress_id {
                        Some(_) => Some(progress_from_row(row, 6)?),
                        None => None,
                    };
                    Ok((task, progress))
                })?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
        .await
    }

    async fn find_progress(
        &self,
        owner: &str,
        task_id: i64,
    ) -> Result<Option<ProgressRecord>, StoreError> {
        let owner = owner.to_string();
        self.with_conn(move |conn| {
            Ok(conn
                .query_row(
                    &format!(
                        "SELECT {} FROM progress WHERE owner = ?1 AND task_id = ?2",
                        PROGRESS_COLUMNS
                    ),
                    params![owner, task_id],
                    |row| progress_from_row(row, 0),
                )
                .optional()?)
        })
        .await
    }

    async fn get_or_create_progress(
        &self,
        owner: &str,
        task_id: i64,
    ) -> Result<ProgressRecord, StoreError> {
        let owner = owner.to_string();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO progress (owner, task_id) VALUES (?1, ?2)
                 ON CONFLICT(owner, task_id) DO NOTHING",
                params![owner, task_id],
            )?;
            Ok(conn.query_row(
                &format!(
                    "SELECT {} FROM progress WHERE owner = ?1 AND task_id = ?2",
                    PROGRESS_COLUMNS
                ),
                params![owner, task_id],
                |row| progress_from_row(row, 0),
            )?)
        })
        .await
    }

    async fn start_progress(
        &self,
        progress_id: i64,
        at: DateTime<Utc>,
    ) -> Result<ProgressRecord, StoreError> {
        self.with_conn(move |conn| {
            conn.execute(
                "UPDATE progress SET task_started_at = ?1
                 WHERE id = ?2 AND task_started_at IS NULL",
                params![at.to_rfc3339(), progress_id],
            )?;
            select_progress(conn, progress_id)?
                .ok_or_else(|| StoreError::NotFound(format!("Progress {}", progress_id)))
        })
        .await
    }

    async fn count_unrewarded_referrals(&self, referrer: &str) -> Result<u64, StoreError> {
        let referrer = referrer.to_string();
        self.with_conn(move |conn| {
            let count: i64 = conn.query_row(
                "SELECT COUNT(*) FROM referrals WHERE referrer_id = ?1 AND referrer_rewarded = 0",
                params![referrer],
                |row| row.get(0),
            )?;
            Ok(count.max(0) as u64)
        })
        .await
    }

    async fn grant_reward(
        &self,
        progress_id: i64,
        owner: &str,
        amount: i64,
    ) -> Result<Grant, StoreError> {
        let owner = owner.to_string();
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;

            let flipped = tx.execute(
                "UPDATE progress SET completed = 1
                 WHERE id = ?1 AND owner = ?2 AND completed = 0",
                params![progress_id, owner],
            )?;

            if flipped == 1 {
                let credited = tx.execute(
                    "UPDATE profiles SET points = points + ?1 WHERE owner = ?2",
                    params![amount, owner],
                )?;
                if credited != 1 {
                    // Dropping the transaction rolls back the completion flag.
                    return Err(StoreError::NotFound(format!("Profile for {}", owner)));
                }
            }

            let record = select_progress(&tx, progress_id)?
                .filter(|r| r.owner == owner)
                .ok_or_else(|| StoreError::NotFound(format!("Progress {}", progress_id)))?;
            tx.commit()?;

            Ok(Grant {
                record,
                applied: flipped == 1,
            })
        })
        .await
    }

    async fn get_progress_with_task(
        &self,
        progress_id: i64,
    ) -> Result<Option<(TaskRecord, ProgressRecord)>, StoreError> {
        self.with_conn(move |conn| {
            Ok(conn
                .query_row(
                    "SELECT t.id, t.title, t.description, t.reward, t.type, t.metadata,
                            p.id, p.owner, p.task_id, p.completed, p.task_started_at
                     FROM progress p
                     JOIN tasks t ON t.id = p.task_id
                     WHERE p.id = ?1",
                    params![progress_id],
                    |row| Ok((task_from_row(row)?, progress_from_row(row, 6)?)),
                )
                .optional()?)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::contract;
    use tempfile::TempDir;

    async fn seeded() -> (TempDir, SqliteProgressStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteProgressStore::new(dir.path().join("nested").join("tasks.db"))
            .await
            .unwrap();
        store.insert_task(contract::visit_task(1)).await.unwrap();
        store.insert_task(contract::visit_task(2)).await.unwrap();
        store.upsert_profile("alice", 1000).await.unwrap();
        store.upsert_profile("bob", 0).await.unwrap();
        (dir, store)
    }

    #[tokio::test]
    async fn test_upsert_is_idempotent() {
        let (_dir, store) = seeded().await;
        contract::upsert_is_idempotent(&store).await;
    }

    #[tokio::test]
    async fn test_start_is_monotonic() {
        let (_dir, store) = seeded().await;
        contract::start_is_monotonic(&store).await;
    }

    #[tokio::test]
    async fn test_grant_applies_once() {
        let (_dir, store) = seeded().await;
        contract::grant_applies_once(&store).await;
        assert_eq!(store.balance("alice").await.unwrap(), Some(1250));
    }

    #[tokio::test]
    async fn test_grant_checks_owner() {
        let (_dir, store) = seeded().await;
        contract::grant_checks_owner(&store).await;
    }

    #[tokio::test]
    async fn test_listing_joins_progress() {
        let (_dir, store) = seeded().await;
        contract::listing_joins_progress(&store).await;
    }

    #[tokio::test]
    async fn test_grant_without_profile_rolls_back() {
        let (_dir, store) = seeded().await;
        let record = store.get_or_create_progress("carol", 1).await.unwrap();
        assert!(matches!(
            store.grant_reward(record.id, "carol", 250).await,
            Err(StoreError::NotFound(_))
        ));
        let record = store.find_progress("carol", 1).await.unwrap().unwrap();
        assert!(!record.completed, "completion flag must roll back with the credit");
    }

    #[tokio::test]
    async fn test_concurrent_grants_credit_once() {
        let (_dir, store) = seeded().await;
        let store = Arc::new(store);
        let id = store.get_or_create_progress("alice", 1).await.unwrap().id;

        let grants = futures::future::join_all((0..8).map(|_| {
            let store = Arc::clone(&store);
            async move { store.grant_reward(id, "alice", 250).await.unwrap() }
        }))
        .await;

        assert_eq!(grants.iter().filter(|g| g.applied).count(), 1);
        assert!(grants.iter().all(|g| g.record.completed));
        assert_eq!(store.balance("alice").await.unwrap(), Some(1250));
    }

    #[tokio::test]
    async fn test_counts_only_unrewarded_referrals() {
        let (_dir, store) = seeded().await;
        store.add_referral("alice", "u1", false).await.unwrap();
        store.add_referral("alice", "u2", false).await.unwrap();
        store.add_referral("alice", "u3", true).await.unwrap();
        store.add_referral("bob", "u4", false).await.unwrap();
        assert_eq!(store.count_unrewarded_referrals("alice").await.unwrap(), 2);
        assert_eq!(store.count_unrewarded_referrals("carol").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_corrupt_metadata_is_an_error() {
        let (_dir, store) = seeded().await;
        store
            .with_conn(|conn| {
                conn.execute(
                    "INSERT INTO tasks (id, title, reward, type, metadata)
                     VALUES (5, 'Invite five', 100, 'REFERRAL', '{\"numFriends\": 5')",
                    [],
                )?;
                Ok(())
            })
            .await
            .unwrap();

        assert!(matches!(store.get_task(5).await, Err(StoreError::Database(_))));
        assert!(matches!(
            store.list_tasks_with_progress("alice").await,
            Err(StoreError::Database(_))
        ));
    }

    #[tokio::test]
    async fn test_corrupt_start_time_is_an_error() {
        let (_dir, store) = seeded().await;
        let id = store.get_or_create_progress("alice", 1).await.unwrap().id;
        store
            .with_conn(move |conn| {
                conn.execute(
                    "UPDATE progress SET task_started_at = 'yesterday' WHERE id = ?1",
                    params![id],
                )?;
                Ok(())
            })
            .await
            .unwrap();

        assert!(matches!(
            store.find_progress("alice", 1).await,
            Err(StoreError::Database(_))
        ));
    }

    #[tokio::test]
    async fn test_data_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tasks.db");
        {
            let store = SqliteProgressStore::new(&path).await.unwrap();
            store.insert_task(contract::visit_task(1)).await.unwrap();
            store.get_or_create_progress("alice", 1).await.unwrap();
        }
        let store = SqliteProgressStore::new(&path).await.unwrap();
        assert!(store.is_persistent());
        assert!(store.find_progress("alice", 1).await.unwrap().is_some());
        assert_eq!(
            store.get_task(1).await.unwrap().map(|t| t.metadata),
            Some(serde_json::json!({"numWaitSeconds": 10}))
        );
    }
}
