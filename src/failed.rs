//! Dead-letter storage for jobs that failed permanently.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use sqlx::sqlite::SqlitePool;
use sqlx::FromRow;
use tracing::{info, warn};

use crate::connector::PushOptions;
use crate::error::QueueError;
use crate::manager::QueueManager;
use crate::time::Clock;
use crate::types::payload::{reset_attempts, Payload};

/// A permanently failed job, as recorded by [`FailedJobProvider::log`].
#[derive(Clone, Debug, Eq, FromRow, PartialEq, Serialize)]
pub struct FailedJob {
    pub id: i64,
    pub connection: String,
    pub queue: String,
    pub payload: String,
    pub exception: String,
    pub fail_time: i64,
}

impl FailedJob {
    /// The job's human-facing name, or `None` if the payload can't be read.
    pub fn job_name(&self) -> Option<String> {
        Payload::from_json(&self.payload)
            .ok()
            .map(|payload| payload.display_name().to_owned())
    }
}

#[async_trait]
pub trait FailedJobProvider: Send + Sync {
    /// Records a failure. Returns the record id, if the store keeps one.
    async fn log(
        &self,
        connection: &str,
        queue: &str,
        payload: &str,
        exception: &str,
    ) -> Result<Option<i64>, QueueError>;

    /// Every record, newest first.
    async fn all(&self) -> Result<Vec<FailedJob>, QueueError>;

    async fn find(&self, id: i64) -> Result<Option<FailedJob>, QueueError>;

    /// Removes a record. Returns whether it existed.
    async fn forget(&self, id: i64) -> Result<bool, QueueError>;

    /// Removes every record.
    async fn flush(&self) -> Result<(), QueueError>;
}

/// Keeps failed jobs in a SQLite table.
#[derive(Clone)]
pub struct DatabaseFailedJobProvider {
    pool: SqlitePool,
    table: String,
    clock: Arc<dyn Clock>,
}

impl DatabaseFailedJobProvider {
    pub fn new(
        pool: SqlitePool,
        table: impl Into<String>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            pool,
            table: table.into(),
            clock,
        }
    }

    pub async fn create_table(&self) -> Result<(), QueueError> {
        sqlx::query(&format!(
            "CREATE TABLE IF NOT EXISTS {} (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                connection TEXT NOT NULL,
                queue TEXT NOT NULL,
                payload TEXT NOT NULL,
                exception TEXT NOT NULL,
                fail_time INTEGER NOT NULL
            )",
            self.table
        ))
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

#[async_trait]
impl FailedJobProvider for DatabaseFailedJobProvider {
    async fn log(
        &self,
        connection: &str,
        queue: &str,
        payload: &str,
        exception: &str,
    ) -> Result<Option<i64>, QueueError> {
        let id = sqlx::query(&format!(
            "INSERT INTO {} (connection, queue, payload, exception, fail_time) \
             VALUES (?, ?, ?, ?, ?)",
            self.table
        ))
        .bind(connection)
        .bind(queue)
        .bind(payload)
        .bind(exception)
        .bind(self.clock.now())
        .execute(&self.pool)
        .await?
        .last_insert_rowid();

        Ok(Some(id))
    }

    async fn all(&self) -> Result<Vec<FailedJob>, QueueError> {
        Ok(sqlx::query_as(&format!(
            "SELECT id, connection, queue, payload, exception, fail_time \
             FROM {} ORDER BY id DESC",
            self.table
        ))
        .fetch_all(&self.pool)
        .await?)
    }

    async fn find(&self, id: i64) -> Result<Option<FailedJob>, QueueError> {
        Ok(sqlx::query_as(&format!(
            "SELECT id, connection, queue, payload, exception, fail_time \
             FROM {} WHERE id = ?",
            self.table
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?)
    }

    async fn forget(&self, id: i64) -> Result<bool, QueueError> {
        let result =
            sqlx::query(&format!("DELETE FROM {} WHERE id = ?", self.table))
                .bind(id)
                .execute(&self.pool)
                .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn flush(&self) -> Result<(), QueueError> {
        sqlx::query(&format!("DELETE FROM {}", self.table))
            .execute(&self.pool)
            .await?;

        Ok(())
    }
}

/// Discards failed jobs.
#[derive(Clone, Copy, Debug, Default)]
pub struct NullFailedJobProvider;

#[async_trait]
impl FailedJobProvider for NullFailedJobProvider {
    async fn log(
        &self,
        _connection: &str,
        _queue: &str,
        _payload: &str,
        _exception: &str,
    ) -> Result<Option<i64>, QueueError> {
        Ok(None)
    }

    async fn all(&self) -> Result<Vec<FailedJob>, QueueError> {
        Ok(Vec::new())
    }

    async fn find(&self, _id: i64) -> Result<Option<FailedJob>, QueueError> {
        Ok(None)
    }

    async fn forget(&self, _id: i64) -> Result<bool, QueueError> {
        Ok(false)
    }

    async fn flush(&self) -> Result<(), QueueError> {
        Ok(())
    }
}

/// Pushes a failed job back onto its original connection and queue with a
/// fresh attempt counter, then removes it from the store. Returns `false` if
/// no record has that id.
pub async fn retry(
    failer: &dyn FailedJobProvider,
    manager: &QueueManager,
    id: i64,
) -> Result<bool, QueueError> {
    let Some(record) = failer.find(id).await? else {
        warn!(id, "no failed job with that id");
        return Ok(false);
    };

    let payload = reset_attempts(&record.payload)?;
    manager
        .connection(Some(&record.connection))
        .await?
        .push_raw(&payload, Some(&record.queue), PushOptions::default())
        .await?;
    failer.forget(id).await?;

    info!(
        id,
        connection = %record.connection,
        queue = %record.queue,
        "pushed failed job back onto the queue",
    );

    Ok(true)
}

/// Retries every failed job currently in the store. Returns how many were
/// pushed back.
pub async fn retry_all(
    failer: &dyn FailedJobProvider,
    manager: &QueueManager,
) -> Result<usize, QueueError> {
    let mut retried = 0;

    for record in failer.all().await? {
        if retry(failer, manager, record.id).await? {
            retried += 1;
        }
    }

    Ok(retried)
}

#[cfg(test)]
pub(crate) mod tests {
    use serde_json::json;

    use super::*;
    use crate::connector::database;
    use crate::time::ManualClock;

    pub(crate) async fn memory_store(
        clock: Arc<ManualClock>,
    ) -> DatabaseFailedJobProvider {
        let pool = database::connect("sqlite::memory:").await.unwrap();
        let store = DatabaseFailedJobProvider::new(pool, "failed_jobs", clock);
        store.create_table().await.unwrap();
        store
    }

    #[tokio::test]
    async fn test_log_find_forget_flush() {
        let clock = Arc::new(ManualClock::new(1_700_000_000));
        let store = memory_store(clock.clone()).await;

        let first = store
            .log("database", "default", r#"{"job":"a","data":null}"#, "boom")
            .await
            .unwrap()
            .unwrap();
        clock.advance(1);
        let second = store
            .log("redis", "emails", r#"{"job":"b","data":null}"#, "bang")
            .await
            .unwrap()
            .unwrap();

        let all = store.all().await.unwrap();
        assert_eq!(
            all.iter().map(|record| record.id).collect::<Vec<_>>(),
            vec![second, first]
        );

        let found = store.find(first).await.unwrap().unwrap();
        assert_eq!(found.connection, "database");
        assert_eq!(found.queue, "default");
        assert_eq!(found.exception, "boom");
        assert_eq!(found.fail_time, 1_700_000_000);

        assert!(store.forget(first).await.unwrap());
        assert!(!store.forget(first).await.unwrap());
        assert!(store.find(first).await.unwrap().is_none());

        store.flush().await.unwrap();
        assert!(store.all().await.unwrap().is_empty());
    }

    #[test]
    fn test_job_name() {
        let mut record = FailedJob {
            id: 1,
            connection: "database".into(),
            queue: "default".into(),
            payload: json!({
                "job": "CallQueuedHandler@call",
                "data": {"commandName": "send-invoice", "command": {}},
            })
            .to_string(),
            exception: String::new(),
            fail_time: 0,
        };
        assert_eq!(record.job_name().as_deref(), Some("send-invoice"));

        record.payload = json!({"job": "mailer@welcome", "data": {}}).to_string();
        assert_eq!(record.job_name().as_deref(), Some("mailer@welcome"));

        record.payload = "garbage".into();
        assert_eq!(record.job_name(), None);
    }

    #[tokio::test]
    async fn test_null_provider_discards() {
        let store = NullFailedJobProvider;
        assert_eq!(store.log("c", "q", "{}", "e").await.unwrap(), None);
        assert!(store.all().await.unwrap().is_empty());
        assert!(store.find(1).await.unwrap().is_none());
        assert!(!store.forget(1).await.unwrap());
    }
}
