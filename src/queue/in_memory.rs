//! In-memory queue backend
//!
//! Stores jobs in process memory behind a single async mutex. Suitable for
//! development, testing and single-instance deployments; behavior matches
//! the Redis backend on a single process.

use crate::error::{MillraceError, Result};
use crate::queue::JobFlags;
use crate::traits::backend::{Backend, JobHandle};
use crate::traits::task::Payload;
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::Mutex;

/// One stored job. `time_at` is 0 for ready entries; for delayed entries it
/// is the unix time the entry becomes eligible, for reserved entries the
/// unix time the reservation expires.
#[derive(Debug, Clone)]
struct QueuedEntry {
    payload: Payload,
    time_at: i64,
}

#[derive(Debug, Default)]
struct MemoryState {
    ready: HashMap<String, VecDeque<QueuedEntry>>,
    delayed: HashMap<String, HashMap<String, QueuedEntry>>,
    reserved: HashMap<String, HashMap<String, QueuedEntry>>,
}

/// Move every entry of `source[queue]` whose time has come onto the tail of
/// the ready list. Iteration order over the map is unspecified.
fn migrate_due(
    source: &mut HashMap<String, HashMap<String, QueuedEntry>>,
    ready: &mut HashMap<String, VecDeque<QueuedEntry>>,
    queue: &str,
    now_ts: i64,
) {
    let Some(entries) = source.get_mut(queue) else {
        return;
    };
    let due: Vec<String> = entries
        .iter()
        .filter(|(_, entry)| entry.time_at <= now_ts)
        .map(|(id, _)| id.clone())
        .collect();
    for id in due {
        if let Some(mut entry) = entries.remove(&id) {
            entry.time_at = 0;
            ready.entry(queue.to_string()).or_default().push_back(entry);
        }
    }
}

/// In-memory queue backend
#[derive(Clone, Default)]
pub struct MemoryBackend {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Backend for MemoryBackend {
    async fn size(&self, queue: &str) -> Result<i64> {
        let state = self.state.lock().await;
        let ready = state.ready.get(queue).map_or(0, |q| q.len());
        let delayed = state.delayed.get(queue).map_or(0, |m| m.len());
        let reserved = state.reserved.get(queue).map_or(0, |m| m.len());
        Ok((ready + delayed + reserved) as i64)
    }

    async fn push(&self, queue: &str, payload: &Payload) -> Result<()> {
        let mut state = self.state.lock().await;
        state
            .ready
            .entry(queue.to_string())
            .or_default()
            .push_back(QueuedEntry {
                payload: payload.clone(),
                time_at: 0,
            });
        Ok(())
    }

    async fn later(&self, queue: &str, delay: Duration, payload: &Payload) -> Result<()> {
        let at = Utc::now() + chrono::Duration::seconds(delay.as_secs() as i64);
        self.later_at(queue, at, payload).await
    }

    async fn later_at(&self, queue: &str, at: DateTime<Utc>, payload: &Payload) -> Result<()> {
        let mut state = self.state.lock().await;
        state
            .delayed
            .entry(queue.to_string())
            .or_default()
            .insert(
                payload.id.clone(),
                QueuedEntry {
                    payload: payload.clone(),
                    time_at: at.timestamp(),
                },
            );
        Ok(())
    }

    async fn pop(&self, queue: &str) -> Result<Option<Arc<dyn JobHandle>>> {
        let mut state = self.state.lock().await;
        let now = Utc::now();
        let now_ts = now.timestamp();

        let MemoryState {
            ready,
            delayed,
            reserved,
        } = &mut *state;

        // due delayed entries first, then expired reservations
        migrate_due(delayed, ready, queue, now_ts);
        migrate_due(reserved, ready, queue, now_ts);

        let Some(mut entry) = ready.get_mut(queue).and_then(|q| q.pop_front()) else {
            return Ok(None);
        };

        // snapshot before the reservation mutates the stored copy
        let original = entry.payload.clone();

        entry.time_at = now_ts + entry.payload.timeout.max(0);
        entry.payload.attempts += 1;
        if entry.payload.pop_time <= 0 {
            entry.payload.pop_time = now_ts;
        }
        entry.payload.timeout_at = entry.time_at;

        let reserved_copy = entry.payload.clone();
        reserved
            .entry(queue.to_string())
            .or_default()
            .insert(entry.payload.id.clone(), entry);

        let timeout = Duration::from_secs(reserved_copy.timeout.max(0) as u64);
        let handle = MemoryJob {
            state: Arc::clone(&self.state),
            queue: queue.to_string(),
            payload: original,
            reserved: reserved_copy.clone(),
            flags: StdMutex::new(JobFlags::default()),
            pop_time: Utc
                .timestamp_opt(reserved_copy.pop_time, 0)
                .single()
                .unwrap_or(now),
            timeout,
            timeout_at: now + chrono::Duration::seconds(reserved_copy.timeout.max(0)),
        };

        Ok(Some(Arc::new(handle)))
    }
}

/// Reservation handle produced by [`MemoryBackend::pop`]
struct MemoryJob {
    state: Arc<Mutex<MemoryState>>,
    queue: String,
    /// Envelope as popped, before the attempt increment.
    payload: Payload,
    /// Envelope as stored in the reserved map.
    reserved: Payload,
    flags: StdMutex<JobFlags>,
    pop_time: DateTime<Utc>,
    timeout: Duration,
    timeout_at: DateTime<Utc>,
}

#[async_trait]
impl JobHandle for MemoryJob {
    async fn release(&self, delay_secs: i64) -> Result<()> {
        self.flags.lock().unwrap().released = true;

        let mut state = self.state.lock().await;
        let MemoryState {
            delayed, reserved, ..
        } = &mut *state;

        let removed = reserved
            .get_mut(&self.queue)
            .and_then(|entries| entries.remove(&self.reserved.id));
        if removed.is_none() {
            return Err(MillraceError::backend(format!(
                "job {} is not reserved in queue {}",
                self.reserved.id, self.queue
            )));
        }

        let time_at = (Utc::now() + chrono::Duration::seconds(delay_secs.max(0))).timestamp();
        delayed.entry(self.queue.clone()).or_default().insert(
            self.reserved.id.clone(),
            QueuedEntry {
                payload: self.reserved.clone(),
                time_at,
            },
        );

        Ok(())
    }

    async fn delete(&self) -> Result<()> {
        self.flags.lock().unwrap().deleted = true;

        let mut state = self.state.lock().await;
        let removed = state
            .reserved
            .get_mut(&self.queue)
            .and_then(|entries| entries.remove(&self.reserved.id));
        if removed.is_none() {
            return Err(MillraceError::backend(format!(
                "job {} is not reserved in queue {}",
                self.reserved.id, self.queue
            )));
        }

        Ok(())
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
