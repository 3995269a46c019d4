//! Relational (SQLite) backend.
//!
//! Jobs live in one table shared by all queues. A row is available when it
//! has never been reserved and its `available_time` has passed, or when its
//! reservation is older than `retry_after` seconds (the worker holding it is
//! assumed dead).

use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions,
};
use sqlx::{FromRow, QueryBuilder, Sqlite};
use tracing::{debug, trace};

use super::{Connector, PushOptions};
use crate::error::QueueError;
use crate::time::{Clock, Delay};
use crate::types::job::{Job, JobId, Reservation};
use crate::types::payload::Payload;

/// Opens a SQLite pool. In-memory databases are pinned to a single
/// connection, since every connection would otherwise see its own database.
pub async fn connect(url: &str) -> Result<SqlitePool, QueueError> {
    let options = SqliteConnectOptions::from_str(url)?
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal);

    let pool = if url.contains(":memory:") {
        SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
    } else {
        SqlitePoolOptions::new()
    };

    Ok(pool.connect_with(options).await?)
}

/// One row of the jobs table.
#[derive(Clone, Debug, FromRow)]
pub struct JobRecord {
    pub id: i64,
    pub queue: String,
    pub attempts: i64,
    pub reserve_time: Option<i64>,
    pub available_time: i64,
    pub create_time: i64,
    pub payload: String,
}

#[derive(Clone)]
pub struct DatabaseConnector {
    pool: SqlitePool,
    table: String,
    default_queue: String,
    retry_after: u64,
    connection: String,
    clock: Arc<dyn Clock>,
}

impl DatabaseConnector {
    pub fn new(
        pool: SqlitePool,
        table: impl Into<String>,
        default_queue: impl Into<String>,
        retry_after: u64,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            pool,
            table: table.into(),
            default_queue: default_queue.into(),
            retry_after,
            connection: "database".to_owned(),
            clock,
        }
    }

    pub fn with_connection_name(mut self, name: impl Into<String>) -> Self {
        self.connection = name.into();
        self
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Creates the jobs table and its queue index if they don't exist yet.
    pub async fn create_table(&self) -> Result<(), QueueError> {
        let table = &self.table;

        sqlx::query(&format!(
            "CREATE TABLE IF NOT EXISTS {table} (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                queue TEXT NOT NULL,
                attempts INTEGER NOT NULL DEFAULT 0,
                reserve_time INTEGER NULL,
                available_time INTEGER NOT NULL,
                create_time INTEGER NOT NULL,
                payload TEXT NOT NULL
            )"
        ))
        .execute(&self.pool)
        .await?;

        sqlx::query(&format!(
            "CREATE INDEX IF NOT EXISTS {table}_queue_index ON {table} (queue)"
        ))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// The named queue, or the default one when unnamed or blank.
    fn queue_name<'a>(&'a self, queue: Option<&'a str>) -> &'a str {
        queue
            .filter(|queue| !queue.is_empty())
            .unwrap_or(&self.default_queue)
    }

    async fn push_to_database(
        &self,
        queue: &str,
        payload: &str,
        delay: Option<Delay>,
        attempts: i64,
    ) -> Result<JobId, QueueError> {
        let now = self.clock.now();
        let available_at = delay.map_or(now, |delay| delay.available_at(now));

        let id = sqlx::query(&format!(
            "INSERT INTO {} (queue, attempts, reserve_time, available_time, \
             create_time, payload) VALUES (?, ?, NULL, ?, ?, ?)",
            self.table
        ))
        .bind(queue)
        .bind(attempts)
        .bind(available_at)
        .bind(now)
        .bind(payload)
        .execute(&self.pool)
        .await?
        .last_insert_rowid();

        trace!(id, queue, available_at, "inserted job row");

        Ok(JobId::Row(id))
    }

    /// Inserts many jobs in a single statement. Each payload is serialised on
    /// its own.
    pub async fn bulk(
        &self,
        payloads: &[Payload],
        queue: Option<&str>,
    ) -> Result<u64, QueueError> {
        if payloads.is_empty() {
            return Ok(0);
        }

        let queue = self.queue_name(queue).to_owned();
        let now = self.clock.now();
        let rows = payloads
            .iter()
            .map(Payload::to_json)
            .collect::<Result<Vec<_>, _>>()?;

        let mut builder = QueryBuilder::<Sqlite>::new(format!(
            "INSERT INTO {} (queue, attempts, reserve_time, available_time, \
             create_time, payload) ",
            self.table
        ));
        builder.push_values(rows, |mut row, payload| {
            row.push_bind(queue.clone())
                .push_bind(0_i64)
                .push_bind(None::<i64>)
                .push_bind(now)
                .push_bind(now)
                .push_bind(payload);
        });

        Ok(builder.build().execute(&self.pool).await?.rows_affected())
    }

    /// Deletes a reserved row. Deleting a row that is already gone is not an
    /// error.
    pub async fn delete_reserved(&self, id: i64) -> Result<(), QueueError> {
        sqlx::query(&format!("DELETE FROM {} WHERE id = ?", self.table))
            .bind(id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    /// Replaces a reserved row with a fresh one available after `delay`
    /// seconds, keeping its attempt count.
    pub async fn release(
        &self,
        queue: &str,
        record: &JobRecord,
        delay: u64,
    ) -> Result<JobId, QueueError> {
        self.delete_reserved(record.id).await?;
        self.push_to_database(
            queue,
            &record.payload,
            Some(Delay::Seconds(delay)),
            record.attempts,
        )
        .await
    }

    /// Atomically claims the oldest available row, stamping its reservation
    /// time and bumping its attempt count. This runs as one statement, so it
    /// holds the database's write lock from selection to update and two
    /// callers can never claim the same row.
    async fn reserve_next(
        &self,
        queue: &str,
    ) -> Result<Option<JobRecord>, QueueError> {
        let now = self.clock.now();
        let expiration = now - i64::try_from(self.retry_after).unwrap_or(0);
        let table = &self.table;

        let record = sqlx::query_as::<_, JobRecord>(&format!(
            "UPDATE {table} SET reserve_time = ?, attempts = attempts + 1
             WHERE id = (
                 SELECT id FROM {table}
                 WHERE queue = ?
                   AND ((reserve_time IS NULL AND available_time <= ?)
                        OR reserve_time <= ?)
                 ORDER BY id ASC
                 LIMIT 1
             )
             RETURNING id, queue, attempts, reserve_time, available_time,
                       create_time, payload"
        ))
        .bind(now)
        .bind(queue)
        .bind(now)
        .bind(expiration)
        .fetch_optional(&self.pool)
        .await?;

        Ok(record)
    }
}

#[async_trait]
impl Connector for DatabaseConnector {
    fn connection_name(&self) -> &str {
        &self.connection
    }

    async fn size(&self, queue: Option<&str>) -> Result<u64, QueueError> {
        let count: i64 = sqlx::query_scalar(&format!(
            "SELECT COUNT(*) FROM {} WHERE queue = ?",
            self.table
        ))
        .bind(self.queue_name(queue))
        .fetch_one(&self.pool)
        .await?;

        Ok(u64::try_from(count).unwrap_or(0))
    }

    async fn push(
        &self,
        payload: Payload,
        queue: Option<&str>,
    ) -> Result<Option<JobId>, QueueError> {
        let raw = payload.to_json()?;
        let id = self
            .push_to_database(self.queue_name(queue), &raw, None, 0)
            .await?;

        Ok(Some(id))
    }

    async fn push_raw(
        &self,
        payload: &str,
        queue: Option<&str>,
        options: PushOptions,
    ) -> Result<Option<JobId>, QueueError> {
        let id = self
            .push_to_database(self.queue_name(queue), payload, options.delay, 0)
            .await?;

        Ok(Some(id))
    }

    async fn later(
        &self,
        delay: Delay,
        payload: Payload,
        queue: Option<&str>,
    ) -> Result<Option<JobId>, QueueError> {
        let raw = payload.to_json()?;
        let id = self
            .push_to_database(self.queue_name(queue), &raw, Some(delay), 0)
            .await?;

        Ok(Some(id))
    }

    async fn pop(&self, queue: Option<&str>) -> Result<Option<Job>, QueueError> {
        let queue = self.queue_name(queue);

        let Some(record) = self.reserve_next(queue).await? else {
            return Ok(None);
        };

        debug!(id = record.id, queue, attempts = record.attempts, "reserved job");

        let raw = record.payload.clone();
        let reservation = DatabaseReservation {
            connector: self.clone(),
            queue: queue.to_owned(),
            record,
        };

        Ok(Some(Job::reserved(
            &self.connection,
            queue,
            raw,
            Box::new(reservation),
        )))
    }
}

struct DatabaseReservation {
    connector: DatabaseConnector,
    queue: String,
    record: JobRecord,
}

#[async_trait]
impl Reservation for DatabaseReservation {
    async fn delete(&self) -> Result<(), QueueError> {
        self.connector.delete_reserved(self.record.id).await
    }

    async fn release(&self, delay: u64) -> Result<(), QueueError> {
        self.connector
            .release(&self.queue, &self.record, delay)
            .await?;

        Ok(())
    }

    fn attempts(&self) -> u32 {
        u32::try_from(self.record.attempts).unwrap_or(u32::MAX)
    }

    fn job_id(&self) -> Option<JobId> {
        Some(JobId::Row(self.record.id))
    }
}
