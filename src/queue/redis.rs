//! Redis-backed queue backend
//!
//! Each queue maps to three Redis keys: the task name itself (a list of
//! ready jobs), `name:delayed` (a sorted set scored by eligibility time) and
//! `name:reserved` (a sorted set scored by reservation deadline). Multiple
//! worker processes can compete for jobs from the same queue; reservation is
//! kept atomic by the server-side scripts in [`super::scripts`].
//!
//! Sorted set membership is byte-exact, so handles keep the reserved entry
//! verbatim as the script encoded it and pass it back unchanged to release
//! and delete.

use crate::error::{MillraceError, Result};
use crate::queue::JobFlags;
use crate::queue::scripts::LuaScripts;
use crate::traits::backend::{Backend, JobHandle, delayed_key, reserved_key};
use crate::traits::task::Payload;
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

/// Redis queue backend
#[derive(Clone)]
pub struct RedisBackend {
    client: redis::Client,
    scripts: Arc<LuaScripts>,
}

impl RedisBackend {
    /// Create a Redis backend from a connection URL.
    pub fn new(url: &str) -> Result<Self> {
        let client = redis::Client::open(url)
            .map_err(|e| MillraceError::backend(format!("failed to create redis client: {}", e)))?;

        Ok(Self {
            client,
            scripts: Arc::new(LuaScripts::new()),
        })
    }

    async fn connection(&self) -> Result<redis::aio::MultiplexedConnection> {
        self.client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| MillraceError::backend(format!("failed to get redis connection: {}", e)))
    }
}

#[async_trait]
impl Backend for RedisBackend {
    async fn size(&self, queue: &str) -> Result<i64> {
        let mut conn = self.connection().await?;
        let size: i64 = self
            .scripts
            .size
            .key(queue)
            .key(delayed_key(queue))
            .key(reserved_key(queue))
            .invoke_async(&mut conn)
            .await
            .map_err(|e| MillraceError::backend(format!("size script failed: {}", e)))?;
        Ok(size)
    }

    async fn push(&self, queue: &str, payload: &Payload) -> Result<()> {
        let encoded = serde_json::to_string(payload)?;
        let mut conn = self.connection().await?;
        redis::cmd("RPUSH")
            .arg(queue)
            .arg(&encoded)
            .query_async::<()>(&mut conn)
            .await
            .map_err(|e| MillraceError::backend(format!("failed to push job: {}", e)))
    }

    async fn later(&self, queue: &str, delay: Duration, payload: &Payload) -> Result<()> {
        let at = Utc::now() + chrono::Duration::seconds(delay.as_secs() as i64);
        self.later_at(queue, at, payload).await
    }

    async fn later_at(&self, queue: &str, at: DateTime<Utc>, payload: &Payload) -> Result<()> {
        let encoded = serde_json::to_string(payload)?;
        let mut conn = self.connection().await?;
        redis::cmd("ZADD")
            .arg(delayed_key(queue))
            .arg(at.timestamp())
            .arg(&encoded)
            .query_async::<()>(&mut conn)
            .await
            .map_err(|e| MillraceError::backend(format!("failed to push delayed job: {}", e)))
    }

    async fn pop(&self, queue: &str) -> Result<Option<Arc<dyn JobHandle>>> {
        let mut conn = self.connection().await?;
        let now = Utc::now();
        let now_ts = now.timestamp();

        // due delayed entries first, then expired reservations
        for source in [delayed_key(queue), reserved_key(queue)] {
            let _migrated: Vec<String> = self
                .scripts
                .migrate
                .key(&source)
                .key(queue)
                .arg(now_ts)
                .invoke_async(&mut conn)
                .await
                .map_err(|e| MillraceError::backend(format!("migrate script failed: {}", e)))?;
        }

        let (raw, reserved): (Option<String>, Option<String>) = self
            .scripts
            .pop
            .key(queue)
            .key(reserved_key(queue))
            .arg(now_ts)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| MillraceError::backend(format!("pop script failed: {}", e)))?;

        let (Some(raw), Some(reserved)) = (raw, reserved) else {
            return Ok(None);
        };

        // undecodable entries are skipped; operators remove the poisoned key
        // out of band
        let payload: Payload = match serde_json::from_str(&raw) {
            Ok(payload) => payload,
            Err(err) => {
                tracing::warn!(queue = %queue, error = %err, "skipping undecodable job payload");
                return Ok(None);
            }
        };
        let reserved_payload: Payload = match serde_json::from_str(&reserved) {
            Ok(payload) => payload,
            Err(err) => {
                tracing::warn!(queue = %queue, error = %err, "skipping undecodable reserved payload");
                return Ok(None);
            }
        };

        let timeout = Duration::from_secs(reserved_payload.timeout.max(0) as u64);
        let handle = RedisJob {
            client: self.client.clone(),
            scripts: Arc::clone(&self.scripts),
            queue: queue.to_string(),
            reserved_blob: reserved,
            payload,
            flags: StdMutex::new(JobFlags::default()),
            pop_time: Utc
                .timestamp_opt(reserved_payload.pop_time, 0)
                .single()
                .unwrap_or(now),
            timeout,
            timeout_at: now + chrono::Duration::seconds(reserved_payload.timeout.max(0)),
        };

        Ok(Some(Arc::new(handle)))
    }
}

/// Reservation handle produced by [`RedisBackend::pop`]
struct RedisJob {
    client: redis::Client,
    scripts: Arc<LuaScripts>,
    queue: String,
    /// The reserved entry byte-exact as the pop script encoded it.
    reserved_blob: String,
    /// Envelope as popped, before the attempt increment.
    payload: Payload,
    flags: StdMutex<JobFlags>,
    pop_time: DateTime<Utc>,
    timeout: Duration,
    timeout_at: DateTime<Utc>,
}

impl RedisJob {
    async fn connection(&self) -> Result<redis::aio::MultiplexedConnection> {
        self.client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| MillraceError::backend(format!("failed to get redis connection: {}", e)))
    }
}

#[async_trait]
impl JobHandle for RedisJob {
    async fn release(&self, delay_secs: i64) -> Result<()> {
        self.flags.lock().unwrap().released = true;

        let when = (Utc::now() + chrono::Duration::seconds(delay_secs.max(0))).timestamp();
        let mut conn = self.connection().await?;
        let _: i64 = self
            .scripts
            .release
            .key(delayed_key(&self.queue))
            .key(reserved_key(&self.queue))
            .arg(&self.reserved_blob)
            .arg(when)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| MillraceError::backend(format!("release script failed: {}", e)))?;
        Ok(())
    }

    async fn delete(&self) -> Result<()> {
        self.flags.lock().unwrap().deleted = true;

        let mut conn = self.connection().await?;
        redis::cmd("ZREM")
            .arg(reserved_key(&self.queue))
            .arg(&self.reserved_blob)
            .query_async::<()>(&mut conn)
            .await
            .map_err(|e| MillraceError::backend(format!("failed to delete reserved job: {}", e)))
    }

    fn is_deleted(&self) -> bool {
        self.flags.lock().unwrap().deleted
    }

    fn is_released(&self) -> bool {
        self.flags.lock().unwrap().released
    }

    fn attempts(&self) -> i64 {
        self.payload.attempts + 1
    }

    fn pop_time(&self) -> DateTime<Utc> {
        self.pop_time
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    fn timeout_at(&self) -> DateTime<Utc> {
        self.timeout_at
    }

    fn has_failed(&self) -> bool {
        self.flags.lock().unwrap().failed
    }

    fn mark_as_failed(&self) {
        self.flags.lock().unwrap().failed = true;
    }

    fn name(&self) -> &str {
        &self.queue
    }

    fn payload(&self) -> &Payload {
        &self.payload
    }
}
