//! Background job queue
//!
//! This module provides the queue facade plus the built-in backends
//! (in-memory, Redis) and the manager that schedules registered tasks onto
//! a bounded worker pool.

mod in_memory;
mod manager;

#[cfg(feature = "redis-backend")]
mod redis;
#[cfg(feature = "redis-backend")]
mod scripts;

#[cfg(test)]
mod tests;

pub use in_memory::MemoryBackend;
#[cfg(feature = "redis-backend")]
pub use redis::RedisBackend;

use crate::config::{QueueConfig, QueueDriver};
use crate::error::{MillraceError, Result};
use crate::traits::backend::Backend;
use crate::traits::task::{FailedJobHandler, Payload, Task};
use chrono::{DateTime, Utc};
use manager::Manager;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;

/// Single-use status flags shared by the backend job handles.
#[derive(Debug, Default)]
pub(crate) struct JobFlags {
    pub(crate) released: bool,
    pub(crate) deleted: bool,
    pub(crate) failed: bool,
}

/// A named-task job queue over a pluggable backend
///
/// The queue registers tasks, publishes jobs (immediately, after a delay, or
/// at an absolute time) and runs a dispatcher plus a bounded worker pool that
/// executes reserved jobs with timeout and retry control.
#[derive(Clone)]
pub struct Queue {
    backend: Arc<dyn Backend>,
    manager: Arc<Manager>,
}

impl std::fmt::Debug for Queue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Queue").finish_non_exhaustive()
    }
}

impl Queue {
    /// Construct a queue from configuration.
    ///
    /// Fails when the Redis driver is selected without a `redis_url`.
    pub fn new(config: QueueConfig) -> Result<Self> {
        let backend: Arc<dyn Backend> = match config.driver {
            QueueDriver::Memory => Arc::new(MemoryBackend::new()),
            #[cfg(feature = "redis-backend")]
            QueueDriver::Redis => {
                let url = config.redis_url.as_deref().ok_or_else(|| {
                    MillraceError::backend("redis driver selected but no redis_url configured")
                })?;
                Arc::new(RedisBackend::new(url)?)
            }
        };

        Ok(Self::with_backend(backend, config.concurrent))
    }

    /// Construct a queue over an existing backend.
    pub fn with_backend(backend: Arc<dyn Backend>, concurrent: usize) -> Self {
        let manager = Manager::new(Arc::clone(&backend), concurrent.max(1));
        Self { backend, manager }
    }

    /// Register one task under its `name`.
    pub fn bootstrap_one(&self, task: Arc<dyn Task>) -> Result<()> {
        self.manager.bootstrap_one(task)
    }

    /// Register several tasks.
    pub fn bootstrap(&self, tasks: Vec<Arc<dyn Task>>) -> Result<()> {
        for task in tasks {
            self.manager.bootstrap_one(task)?;
        }
        Ok(())
    }

    /// Move a task into the high-priority tier, polled before regular tasks
    /// on every dispatcher sweep. The regular tier has no starvation
    /// guarantee, so keep this tier small.
    pub fn set_high_priority_task(&self, task: Arc<dyn Task>) -> Result<()> {
        self.manager.set_priority_task(task)
    }

    /// Restrict polling to the given task names. Blank names are skipped.
    pub fn set_allow_tasks(&self, names: &[&str]) {
        self.manager.set_allow_tasks(names);
    }

    /// Exclude the given task names from polling. Blank names are skipped.
    pub fn set_exclude_tasks(&self, names: &[&str]) {
        self.manager.set_exclude_tasks(names);
    }

    /// Install the terminal-failure sink. It receives the full payload of
    /// every job that will never run again.
    pub fn set_failed_job_handler(&self, handler: FailedJobHandler) {
        self.manager.set_failed_job_handler(handler);
    }

    /// Publish a job for immediate execution.
    pub async fn dispatch<T: Serialize + ?Sized>(&self, task: &dyn Task, body: &T) -> Result<()> {
        let payload = self.make_payload(task, body)?;
        self.backend.push(task.name(), &payload).await
    }

    /// Publish a job to run after `delay`.
    pub async fn delay<T: Serialize + ?Sized>(
        &self,
        task: &dyn Task,
        body: &T,
        delay: Duration,
    ) -> Result<()> {
        let payload = self.make_payload(task, body)?;
        self.backend.later(task.name(), delay, &payload).await
    }

    /// Publish a job to run at the absolute time `at`.
    pub async fn delay_at<T: Serialize + ?Sized>(
        &self,
        task: &dyn Task,
        body: &T,
        at: DateTime<Utc>,
    ) -> Result<()> {
        let payload = self.make_payload(task, body)?;
        self.backend.later_at(task.name(), at, &payload).await
    }

    /// Publish a job by registered task name. Fails with
    /// [`MillraceError::TaskNotRegistered`] when the name was never
    /// bootstrapped.
    pub async fn dispatch_by_name<T: Serialize + ?Sized>(
        &self,
        name: &str,
        body: &T,
    ) -> Result<()> {
        let task = self.registered(name)?;
        self.dispatch(task.as_ref(), body).await
    }

    /// Publish a delayed job by registered task name.
    pub async fn delay_by_name<T: Serialize + ?Sized>(
        &self,
        name: &str,
        body: &T,
        delay: Duration,
    ) -> Result<()> {
        let task = self.registered(name)?;
        self.delay(task.as_ref(), body, delay).await
    }

    /// Publish an at-time job by registered task name.
    pub async fn delay_at_by_name<T: Serialize + ?Sized>(
        &self,
        name: &str,
        body: &T,
        at: DateTime<Utc>,
    ) -> Result<()> {
        let task = self.registered(name)?;
        self.delay_at(task.as_ref(), body, at).await
    }

    /// Current backlog of a task: ready plus delayed plus reserved jobs.
    /// Returns 0 for tasks that were never bootstrapped.
    pub async fn size(&self, task: &dyn Task) -> i64 {
        if self.manager.task_by_name(task.name()).is_none() {
            return 0;
        }
        self.backend.size(task.name()).await.unwrap_or(0)
    }

    /// Spawn the dispatcher and the worker pool.
    ///
    /// Fails with [`MillraceError::QueueClosed`] once a shutdown has begun.
    pub fn start(&self) -> Result<()> {
        self.manager.start()
    }

    /// Gracefully shut down the queue.
    ///
    /// Stops the dispatcher (no new jobs are handed to workers) and waits up
    /// to `wait` for in-flight attempts to finish. Attempts that have not
    /// returned by then are abandoned in the reserved set and will be
    /// re-delivered once their reservation deadline lapses.
    pub async fn shut_down(&self, wait: Duration) -> Result<()> {
        self.manager.shut_down(wait).await
    }

    fn registered(&self, name: &str) -> Result<Arc<dyn Task>> {
        self.manager
            .task_by_name(name)
            .ok_or_else(|| MillraceError::task_not_registered(name))
    }

    fn make_payload<T: Serialize + ?Sized>(&self, task: &dyn Task, body: &T) -> Result<Payload> {
        let body = serde_json::to_string(body)?;
        Ok(Payload::for_task(task, body))
    }
}
