//! Queue backend contract
//!
//! A backend stores the jobs of each named queue in three places: a ready
//! list (FIFO), a delayed set scored by the unix time at which an entry
//! becomes eligible, and a reserved set scored by the deadline of the
//! reservation. [`Backend::pop`] is the reserve-pop: it migrates eligible
//! delayed and expired reserved entries back into the ready list, then
//! atomically moves the head of the ready list into the reserved set.

use crate::error::{MillraceError, Result};
use crate::traits::task::Payload;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;

/// Key of the delayed sorted set for a queue.
pub fn delayed_key(queue: &str) -> String {
    format!("{}:delayed", queue)
}

/// Key of the reserved sorted set for a queue.
pub fn reserved_key(queue: &str) -> String {
    format!("{}:reserved", queue)
}

/// Pluggable store of jobs for named queues
#[async_trait]
pub trait Backend: Send + Sync {
    /// Total backlog of a queue: ready plus delayed plus reserved entries.
    async fn size(&self, queue: &str) -> Result<i64>;

    /// Append a job to the tail of the ready list.
    async fn push(&self, queue: &str, payload: &Payload) -> Result<()>;

    /// Insert a job into the delayed set, eligible after `delay`.
    async fn later(&self, queue: &str, delay: Duration, payload: &Payload) -> Result<()>;

    /// Insert a job into the delayed set, eligible at `at`.
    async fn later_at(&self, queue: &str, at: DateTime<Utc>, payload: &Payload) -> Result<()>;

    /// Reserve-pop one job from the head of the ready list.
    ///
    /// Migrates eligible delayed entries and expired reservations into the
    /// ready list first, then reserves the head entry: its attempt count is
    /// incremented, its pop time is fixed on the first reservation, and its
    /// reservation deadline is set to now plus its timeout. Returns `None`
    /// when the queue is empty after migrations.
    async fn pop(&self, queue: &str) -> Result<Option<Arc<dyn JobHandle>>>;
}

/// Exclusive control surface for one reservation
///
/// A handle is produced by [`Backend::pop`] and owned by a worker for the
/// duration of one attempt. Handles are single-use: a job ends up either
/// released (retry via the delayed set) or deleted (success or terminal
/// failure). State flags are internally synchronized so that the worker and
/// its deadline watchdog can share the handle.
#[async_trait]
pub trait JobHandle: Send + Sync {
    /// Move the reservation into the delayed set, eligible after
    /// `delay_secs`. Used for retries.
    async fn release(&self, delay_secs: i64) -> Result<()>;

    /// Remove the reservation. The job will not run again.
    async fn delete(&self) -> Result<()>;

    fn is_deleted(&self) -> bool;

    fn is_released(&self) -> bool;

    /// 1-based number of the attempt currently being executed.
    fn attempts(&self) -> i64;

    /// Wall-clock time of the first reservation of this job.
    fn pop_time(&self) -> DateTime<Utc>;

    /// Per-attempt execution deadline duration.
    fn timeout(&self) -> Duration;

    /// Wall-clock deadline of the current reservation.
    fn timeout_at(&self) -> DateTime<Utc>;

    fn has_failed(&self) -> bool;

    fn mark_as_failed(&self);

    /// Backend-specific terminal failure hook. Both built-in backends leave
    /// this as a no-op; terminal failures are reported through the
    /// process-wide failure sink.
    fn failed(&self, _err: &MillraceError) {}

    /// Name of the queue this job belongs to.
    fn name(&self) -> &str;

    /// The envelope as it looked when this reservation was popped, before
    /// the attempt count was incremented.
    fn payload(&self) -> &Payload;
}
