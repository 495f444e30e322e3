//! Task contract and the payload envelope stored in queue backends
//!
//! A [`Task`] is the user-supplied unit of work: a unique name, retry tuning
//! and an `execute` method. Published jobs travel as a [`Payload`] envelope;
//! `execute` receives the opaque body back as a [`RawBody`].

use crate::error::{MillraceError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

/// Default maximum attempts per job: run once, no retry.
pub const DEFAULT_MAX_TRIES: i64 = 1;

/// Default interval between retry attempts, in seconds.
pub const DEFAULT_RETRY_INTERVAL: i64 = 60;

/// Default per-attempt execution deadline.
pub const DEFAULT_EXECUTE_TIMEOUT: Duration = Duration::from_secs(900);

/// A unit of background work executed by the queue
///
/// The trait methods carry per-task tuning; all of them except `name` and
/// `execute` have defaults. `name` must be unique within a process, it is
/// used as the backend queue key.
#[async_trait]
pub trait Task: Send + Sync {
    /// Queue name for this task. Must be unique within a process.
    fn name(&self) -> &str;

    /// Maximum number of execute attempts for one job. Minimum 1.
    fn max_tries(&self) -> i64 {
        DEFAULT_MAX_TRIES
    }

    /// Seconds to wait before re-attempting a failed job.
    fn retry_interval(&self) -> i64 {
        DEFAULT_RETRY_INTERVAL
    }

    /// Per-attempt execution deadline.
    fn timeout(&self) -> Duration {
        DEFAULT_EXECUTE_TIMEOUT
    }

    /// Execute one attempt of a job.
    ///
    /// The context is cancelled when the attempt deadline elapses; the worker
    /// never force-kills an attempt, so long-running task code should observe
    /// [`AttemptContext::cancelled`] and bail out. Because delivery is
    /// at-least-once, task code must be idempotent on [`RawBody::id`].
    async fn execute(&self, ctx: AttemptContext, body: RawBody) -> Result<()>;

    /// Human-readable description of the task, for operators.
    fn remark(&self) -> &str {
        ""
    }
}

/// The serialized job envelope stored in queue backends
///
/// Field names are fixed by the wire format (sorted set membership is
/// byte-exact on the encoded JSON), so the struct serializes with the
/// original PascalCase keys.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Payload {
    /// Queue name.
    #[serde(rename = "Name")]
    pub name: String,
    /// Globally unique job id.
    #[serde(rename = "ID")]
    pub id: String,
    /// Maximum execute attempts, minimum 1.
    #[serde(rename = "MaxTries")]
    pub max_tries: i64,
    /// Seconds between retry attempts.
    #[serde(rename = "RetryInterval")]
    pub retry_interval: i64,
    /// Attempts already observed by the backend.
    #[serde(rename = "Attempts")]
    pub attempts: i64,
    /// Publisher-supplied body, carried as serialized JSON text.
    #[serde(rename = "Payload")]
    pub body: String,
    /// Unix seconds of the first reservation, 0 until first popped.
    #[serde(rename = "PopTime")]
    pub pop_time: i64,
    /// Maximum per-attempt runtime in seconds.
    #[serde(rename = "Timeout")]
    pub timeout: i64,
    /// Unix seconds deadline of the current reservation, 0 until reserved.
    #[serde(rename = "TimeoutAt")]
    pub timeout_at: i64,
}

impl Payload {
    /// Build a fresh envelope for one publish of `task`.
    pub(crate) fn for_task(task: &dyn Task, body: String) -> Self {
        Self {
            name: task.name().to_string(),
            id: crate::utils::unique_id(),
            max_tries: task.max_tries().max(1),
            retry_interval: task.retry_interval().max(0),
            attempts: 0,
            body,
            pop_time: 0,
            timeout: task.timeout().as_secs() as i64,
            timeout_at: 0,
        }
    }

    /// The opaque body wrapper handed to [`Task::execute`].
    pub fn raw_body(&self) -> RawBody {
        RawBody {
            queue: self.name.clone(),
            id: self.id.clone(),
            body: self.body.clone(),
        }
    }
}

/// The job body as delivered to [`Task::execute`]
///
/// Wraps the serialized bytes the publisher supplied, together with the
/// queue name and the job id for idempotency checks.
#[derive(Debug, Clone)]
pub struct RawBody {
    queue: String,
    id: String,
    body: String,
}

impl RawBody {
    /// Name of the queue this job was popped from.
    pub fn queue(&self) -> &str {
        &self.queue
    }

    /// Unique job id. At-least-once delivery means task code should
    /// deduplicate on this value.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// The body as serialized JSON text.
    pub fn as_str(&self) -> &str {
        &self.body
    }

    /// The body as raw bytes.
    pub fn as_bytes(&self) -> &[u8] {
        self.body.as_bytes()
    }

    /// Parse a scalar integer body. Returns 0 when the body is not a number.
    pub fn to_i64(&self) -> i64 {
        self.body.trim().parse().unwrap_or(0)
    }

    /// Parse a scalar unsigned integer body. Returns 0 when the body is not
    /// a number.
    pub fn to_u64(&self) -> u64 {
        self.body.trim().parse().unwrap_or(0)
    }

    /// Deserialize the body into the type the publisher dispatched.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_str(&self.body)?)
    }
}

/// Per-attempt context handed to [`Task::execute`]
///
/// Carries the attempt deadline and a cooperative cancellation signal that
/// fires when the deadline elapses.
#[derive(Debug, Clone)]
pub struct AttemptContext {
    deadline: DateTime<Utc>,
    cancelled: watch::Receiver<bool>,
}

impl AttemptContext {
    pub(crate) fn new(deadline: DateTime<Utc>, cancelled: watch::Receiver<bool>) -> Self {
        Self { deadline, cancelled }
    }

    /// Wall-clock instant at which this attempt times out.
    pub fn deadline(&self) -> DateTime<Utc> {
        self.deadline
    }

    /// Whether the attempt deadline has already elapsed.
    pub fn is_cancelled(&self) -> bool {
        *self.cancelled.borrow()
    }

    /// Resolves once the attempt deadline elapses.
    ///
    /// If the worker stopped waiting on this attempt without cancelling it
    /// (the attempt finished in time), the future never resolves.
    pub async fn cancelled(&self) {
        let mut cancelled = self.cancelled.clone();
        if cancelled.wait_for(|c| *c).await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

/// Terminal-failure sink invoked with the full payload once a job will never
/// run again (attempts exhausted, pre-execute attempt check failed, or a
/// duplicate reservation was re-scheduled). The returned error is advisory
/// and is ignored by the queue.
pub type FailedJobHandler =
    Arc<dyn Fn(&Payload, &MillraceError) -> Result<()> + Send + Sync>;
