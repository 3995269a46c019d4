//! Redis backend.
//!
//! Each queue `q` uses three keys: the ready list `{queues:q}`, a sorted set of
//! delayed jobs `{queues:q}:delayed` and a sorted set of reserved jobs
//! `{queues:q}:reserved`, both scored by the unix time at which the job becomes
//! available again. Moving jobs between them is done in Lua so each move is
//! atomic on the server.

use std::sync::Arc;

use async_trait::async_trait;
use rand::distributions::Alphanumeric;
use rand::Rng;
use redis::aio::MultiplexedConnection;
use redis::{AsyncCommands, Script};
use serde_json::Value;
use tracing::{debug, trace};

use super::{Connector, PushOptions};
use crate::error::QueueError;
use crate::time::{Clock, Delay};
use crate::types::job::{Job, JobId, Reservation};
use crate::types::payload::Payload;

/// Moves every member of `KEYS[1]` scored at or before `ARGV[1]` onto the
/// list `KEYS[2]`, preserving score order.
const MIGRATE_EXPIRED: &str = r"
local val = redis.call('zrangebyscore', KEYS[1], '-inf', ARGV[1])
if(next(val) ~= nil) then
    redis.call('zremrangebyrank', KEYS[1], 0, #val - 1)
    for i = 1, #val, 100 do
        redis.call('rpush', KEYS[2], unpack(val, i, math.min(i+99, #val)))
    end
end
return #val
";

/// Moves the head of `KEYS[1]` into `KEYS[2]` as `ARGV[3]`, scored `ARGV[2]`,
/// provided the head is still `ARGV[1]`. Returns 1 if it moved.
const RESERVE: &str = r"
if redis.call('lindex', KEYS[1], 0) == ARGV[1] then
    redis.call('lpop', KEYS[1])
    redis.call('zadd', KEYS[2], ARGV[2], ARGV[3])
    return 1
end
return 0
";

/// Length of `KEYS[1]` plus the cardinality of `KEYS[2]` and `KEYS[3]`.
const SIZE: &str = r"
return redis.call('llen', KEYS[1]) + redis.call('zcard', KEYS[2]) + redis.call('zcard', KEYS[3])
";

pub async fn connect(url: &str) -> Result<MultiplexedConnection, QueueError> {
    let client = redis::Client::open(url)?;
    Ok(client.get_multiplexed_async_connection().await?)
}

/// Key of a queue's ready list. The braces keep all three keys of a queue in
/// the same cluster slot.
pub fn queue_key(queue: &str) -> String {
    format!("{{queues:{queue}}}")
}

/// The copy of a raw payload kept while it is reserved: the same document
/// with `attempts` one higher. Everything else is carried over as written.
/// A payload that isn't a JSON object is kept as is.
pub fn reserved_copy(raw: &str) -> String {
    let Ok(Value::Object(mut payload)) = serde_json::from_str::<Value>(raw) else {
        return raw.to_owned();
    };

    let attempts = payload.get("attempts").and_then(Value::as_u64).unwrap_or(0);
    payload.insert("attempts".to_owned(), Value::from(attempts + 1));

    serde_json::to_string(&payload).unwrap_or_else(|_| raw.to_owned())
}

/// A random 32 character token identifying one pushed job.
pub fn random_id() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(32)
        .map(char::from)
        .collect()
}

#[derive(Clone)]
pub struct RedisConnector {
    conn: MultiplexedConnection,
    default_queue: String,
    retry_after: Option<u64>,
    block_for: Option<u64>,
    connection: String,
    clock: Arc<dyn Clock>,
}

impl RedisConnector {
    pub fn new(
        conn: MultiplexedConnection,
        default_queue: impl Into<String>,
        retry_after: Option<u64>,
        block_for: Option<u64>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            conn,
            default_queue: default_queue.into(),
            retry_after,
            block_for,
            connection: "redis".to_owned(),
            clock,
        }
    }

    pub fn with_connection_name(mut self, name: impl Into<String>) -> Self {
        self.connection = name.into();
        self
    }

    /// The named queue, or the default one when unnamed or blank.
    fn queue_name<'a>(&'a self, queue: Option<&'a str>) -> &'a str {
        queue
            .filter(|queue| !queue.is_empty())
            .unwrap_or(&self.default_queue)
    }

    fn queue_key(&self, queue: Option<&str>) -> String {
        queue_key(self.queue_name(queue))
    }

    /// Serialises a payload with a fresh id and a zeroed attempt counter.
    fn create_payload(payload: Payload) -> Result<(String, String), QueueError> {
        let id = random_id();
        let payload = Payload {
            id: Some(id.clone()),
            attempts: Some(0),
            ..payload
        };

        Ok((id, payload.to_json()?))
    }

    fn payload_id(raw: &str) -> Option<JobId> {
        let value: Value = serde_json::from_str(raw).ok()?;
        value
            .get("id")
            .and_then(Value::as_str)
            .map(|id| JobId::Token(id.to_owned()))
    }

    async fn push_delayed(
        &self,
        key: &str,
        raw: &str,
        delay: Delay,
    ) -> Result<(), QueueError> {
        let available_at = delay.available_at(self.clock.now());
        let mut conn = self.conn.clone();
        let _: () = conn
            .zadd(format!("{key}:delayed"), raw, available_at)
            .await?;

        trace!(key, available_at, "delayed job");
        Ok(())
    }

    async fn migrate(&self, from: &str, to: &str) -> Result<(), QueueError> {
        let mut conn = self.conn.clone();
        let moved: u64 = Script::new(MIGRATE_EXPIRED)
            .key(from)
            .key(to)
            .arg(self.clock.now())
            .invoke_async(&mut conn)
            .await?;

        if moved > 0 {
            debug!(from, to, moved, "migrated jobs");
        }
        Ok(())
    }

    fn lease_expiry(&self) -> i64 {
        let retry_after = self.retry_after.unwrap_or(0);
        Delay::Seconds(retry_after).available_at(self.clock.now())
    }

    /// Takes the next job off the ready list, returning it together with its
    /// reserved copy.
    async fn retrieve_next_job(
        &self,
        key: &str,
    ) -> Result<Option<(String, String)>, QueueError> {
        let mut conn = self.conn.clone();
        let reserved_key = format!("{key}:reserved");

        let Some(block_for) = self.block_for else {
            return self.reserve_head(&mut conn, key, &reserved_key).await;
        };

        let popped: Option<(String, String)> =
            conn.blpop(key, block_for as f64).await?;
        let Some((_, job)) = popped else {
            return Ok(None);
        };

        let reserved = reserved_copy(&job);
        let _: () = conn
            .zadd(&reserved_key, &reserved, self.lease_expiry())
            .await?;

        Ok(Some((job, reserved)))
    }

    /// Reserves the head of the list without blocking. Another worker taking
    /// the head first just means trying again with the new head.
    async fn reserve_head(
        &self,
        conn: &mut MultiplexedConnection,
        key: &str,
        reserved_key: &str,
    ) -> Result<Option<(String, String)>, QueueError> {
        let script = Script::new(RESERVE);

        loop {
            let head: Option<String> = conn.lindex(key, 0).await?;
            let Some(job) = head else {
                return Ok(None);
            };

            let reserved = reserved_copy(&job);
            let moved: u8 = script
                .key(key)
                .key(reserved_key)
                .arg(&job)
                .arg(self.lease_expiry())
                .arg(&reserved)
                .invoke_async(conn)
                .await?;

            if moved == 1 {
                return Ok(Some((job, reserved)));
            }
            trace!(key, "list head taken by another worker, retrying");
        }
    }
}

#[async_trait]
impl Connector for RedisConnector {
    fn connection_name(&self) -> &str {
        &self.connection
    }

    async fn size(&self, queue: Option<&str>) -> Result<u64, QueueError> {
        let key = self.queue_key(queue);
        let mut conn = self.conn.clone();

        Ok(Script::new(SIZE)
            .key(&key)
            .key(format!("{key}:delayed"))
            .key(format!("{key}:reserved"))
            .invoke_async(&mut conn)
            .await?)
    }

    async fn push(
        &self,
        payload: Payload,
        queue: Option<&str>,
    ) -> Result<Option<JobId>, QueueError> {
        let (_, raw) = Self::create_payload(payload)?;
        self.push_raw(&raw, queue, PushOptions::default()).await
    }

    async fn push_raw(
        &self,
        payload: &str,
        queue: Option<&str>,
        options: PushOptions,
    ) -> Result<Option<JobId>, QueueError> {
        let key = self.queue_key(queue);

        match options.delay {
            Some(delay) => self.push_delayed(&key, payload, delay).await?,
            None => {
                let mut conn = self.conn.clone();
                let _: () = conn.rpush(&key, payload).await?;
            },
        }

        Ok(Self::payload_id(payload))
    }

    async fn later(
        &self,
        delay: Delay,
        payload: Payload,
        queue: Option<&str>,
    ) -> Result<Option<JobId>, QueueError> {
        let (id, raw) = Self::create_payload(payload)?;
        self.push_delayed(&self.queue_key(queue), &raw, delay).await?;

        Ok(Some(JobId::Token(id)))
    }

    async fn pop(&self, queue: Option<&str>) -> Result<Option<Job>, QueueError> {
        let key = self.queue_key(queue);

        self.migrate(&format!("{key}:delayed"), &key).await?;
        if self.retry_after.is_some() {
            self.migrate(&format!("{key}:reserved"), &key).await?;
        }

        let Some((job, reserved)) = self.retrieve_next_job(&key).await? else {
            return Ok(None);
        };

        let reservation = RedisReservation::new(
            self.conn.clone(),
            key,
            reserved,
            self.clock.clone(),
        );

        Ok(Some(Job::reserved(
            &self.connection,
            self.queue_name(queue),
            job,
            Box::new(reservation),
        )))
    }
}

struct RedisReservation {
    conn: MultiplexedConnection,
    key: String,
    reserved: String,
    attempts: u32,
    id: Option<JobId>,
    clock: Arc<dyn Clock>,
}

impl RedisReservation {
    fn new(
        conn: MultiplexedConnection,
        key: String,
        reserved: String,
        clock: Arc<dyn Clock>,
    ) -> Self {
        // An undecodable payload has no counter; it is on its first run here.
        let attempts = serde_json::from_str::<Value>(&reserved)
            .ok()
            .and_then(|value| value.get("attempts").and_then(Value::as_u64))
            .map_or(1, |n| u32::try_from(n).unwrap_or(u32::MAX));
        let id = RedisConnector::payload_id(&reserved);

        Self {
            conn,
            key,
            reserved,
            attempts,
            id,
            clock,
        }
    }
}

#[async_trait]
impl Reservation for RedisReservation {
    async fn delete(&self) -> Result<(), QueueError> {
        let mut conn = self.conn.clone();
        let _: () = conn
            .zrem(format!("{}:reserved", self.key), &self.reserved)
            .await?;

        Ok(())
    }

    async fn release(&self, delay: u64) -> Result<(), QueueError> {
        let available_at = Delay::Seconds(delay).available_at(self.clock.now());
        let mut conn = self.conn.clone();

        let _: () = redis::pipe()
            .atomic()
            .zrem(format!("{}:reserved", self.key), &self.reserved)
            .ignore()
            .zadd(format!("{}:delayed", self.key), &self.reserved, available_at)
            .ignore()
            .query_async(&mut conn)
            .await?;

        Ok(())
    }

    fn attempts(&self) -> u32 {
        self.attempts
    }

    fn job_id(&self) -> Option<JobId> {
        self.id.clone()
    }
}
