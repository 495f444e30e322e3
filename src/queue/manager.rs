//! Queue manager: dispatcher, worker pool and per-job execution control
//!
//! The manager owns the registered task maps and the scheduling state. One
//! dispatcher task polls every registered queue (priority tier first) and
//! hands reserved jobs to workers over a one-slot channel, which is the only
//! back-pressure mechanism. Each worker executes jobs under a per-attempt
//! deadline, applying the retry and failure rules.

use crate::error::{MillraceError, Result};
use crate::traits::backend::{Backend, JobHandle};
use crate::traits::task::{AttemptContext, FailedJobHandler, Payload, Task};
use chrono::Utc;
use rand::Rng;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::sync::{Mutex as AsyncMutex, mpsc, watch};

/// Dispatcher sleep after an idle sweep starts here and grows with jitter.
const JITTER_BASE: Duration = Duration::from_millis(450);
/// Upper clamp of the idle dispatcher sleep.
const JITTER_MAX: Duration = Duration::from_secs(1);
/// Upper clamp of the shutdown drain poll interval.
const SHUTDOWN_POLL_INTERVAL_MAX: Duration = Duration::from_millis(500);

type JobReceiver = Arc<AsyncMutex<mpsc::Receiver<Arc<dyn JobHandle>>>>;

pub(crate) struct Manager {
    backend: Arc<dyn Backend>,
    concurrent: usize,
    tasks: RwLock<HashMap<String, Arc<dyn Task>>>,
    priority_tasks: RwLock<HashMap<String, Arc<dyn Task>>>,
    allow_tasks: RwLock<HashSet<String>>,
    exclude_tasks: RwLock<HashSet<String>>,
    failed_job_handler: RwLock<Option<FailedJobHandler>>,
    /// Job id to worker id, for every attempt whose execute has not returned.
    in_flight: Mutex<HashMap<String, usize>>,
    worker_status: Mutex<HashMap<usize, Arc<AtomicBool>>>,
    in_shutdown: AtomicBool,
    done: watch::Sender<bool>,
    jitter: Mutex<Duration>,
}

impl Manager {
    pub(crate) fn new(backend: Arc<dyn Backend>, concurrent: usize) -> Arc<Self> {
        let (done, _) = watch::channel(false);
        Arc::new(Self {
            backend,
            concurrent,
            tasks: RwLock::new(HashMap::new()),
            priority_tasks: RwLock::new(HashMap::new()),
            allow_tasks: RwLock::new(HashSet::new()),
            exclude_tasks: RwLock::new(HashSet::new()),
            failed_job_handler: RwLock::new(None),
            in_flight: Mutex::new(HashMap::new()),
            worker_status: Mutex::new(HashMap::new()),
            in_shutdown: AtomicBool::new(false),
            done,
            jitter: Mutex::new(JITTER_BASE),
        })
    }

    pub(crate) fn bootstrap_one(&self, task: Arc<dyn Task>) -> Result<()> {
        tracing::debug!(
            name = %task.name(),
            max_tries = task.max_tries(),
            retry_interval = task.retry_interval(),
            "bootstrap task"
        );
        self.tasks
            .write()
            .unwrap()
            .insert(task.name().to_string(), task);
        Ok(())
    }

    pub(crate) fn set_priority_task(&self, task: Arc<dyn Task>) -> Result<()> {
        tracing::debug!(
            name = %task.name(),
            max_tries = task.max_tries(),
            retry_interval = task.retry_interval(),
            "set high priority task"
        );
        self.tasks.write().unwrap().remove(task.name());
        self.priority_tasks
            .write()
            .unwrap()
            .insert(task.name().to_string(), task);
        Ok(())
    }

    pub(crate) fn set_allow_tasks(&self, names: &[&str]) {
        let mut allow = self.allow_tasks.write().unwrap();
        for name in names {
            if name.trim().is_empty() {
                continue;
            }
            tracing::info!(task = %name, "queue allow task");
            allow.insert(name.to_string());
        }
    }

    pub(crate) fn set_exclude_tasks(&self, names: &[&str]) {
        let mut exclude = self.exclude_tasks.write().unwrap();
        for name in names {
            if name.trim().is_empty() {
                continue;
            }
            tracing::info!(task = %name, "queue exclude task");
            exclude.insert(name.to_string());
        }
    }

    pub(crate) fn set_failed_job_handler(&self, handler: FailedJobHandler) {
        *self.failed_job_handler.write().unwrap() = Some(handler);
    }

    /// Look a task up in both tiers.
    pub(crate) fn task_by_name(&self, name: &str) -> Option<Arc<dyn Task>> {
        if let Some(task) = self.priority_tasks.read().unwrap().get(name) {
            return Some(Arc::clone(task));
        }
        self.tasks.read().unwrap().get(name).map(Arc::clone)
    }

    pub(crate) fn start(self: &Arc<Self>) -> Result<()> {
        if self.shutting_down() {
            return Err(MillraceError::QueueClosed);
        }

        let (tx, rx) = mpsc::channel::<Arc<dyn JobHandle>>(1);
        let rx: JobReceiver = Arc::new(AsyncMutex::new(rx));

        tokio::spawn(Arc::clone(self).dispatcher_loop(tx));
        for worker_id in 0..self.concurrent {
            tokio::spawn(Arc::clone(self).worker_loop(worker_id, Arc::clone(&rx)));
        }

        Ok(())
    }

    /// Stop the dispatcher and wait for workers to drain, polling the idle
    /// predicate with exponential back-off. In-flight attempts that outlive
    /// `wait` are abandoned in the reserved set and re-delivered later.
    pub(crate) async fn shut_down(&self, wait: Duration) -> Result<()> {
        self.in_shutdown.store(true, Ordering::SeqCst);
        self.done.send_replace(true);

        tracing::info!("attempting graceful queue shutdown");

        let deadline = tokio::time::Instant::now() + wait;
        let mut poll_interval = Duration::from_millis(1);
        loop {
            if self.workers_idle() {
                return Ok(());
            }
            let now = tokio::time::Instant::now();
            if now >= deadline {
                return Err(MillraceError::DeadlineExceeded);
            }

            // 10% jitter on top of the doubling interval
            let spread = poll_interval.as_micros() as u64 / 10;
            let jitter = if spread > 0 {
                Duration::from_micros(rand::thread_rng().gen_range(0..spread))
            } else {
                Duration::ZERO
            };
            tokio::time::sleep((poll_interval + jitter).min(deadline - now)).await;
            poll_interval = (poll_interval * 2).min(SHUTDOWN_POLL_INTERVAL_MAX);
        }
    }

    pub(crate) fn shutting_down(&self) -> bool {
        self.in_shutdown.load(Ordering::SeqCst)
    }

    async fn dispatcher_loop(self: Arc<Self>, tx: mpsc::Sender<Arc<dyn JobHandle>>) {
        let mut done = self.done.subscribe();

        loop {
            if *done.borrow_and_update() {
                break;
            }

            if self.sweep(&tx, &mut done).await {
                self.reset_jitter();
            } else {
                if *done.borrow_and_update() {
                    break;
                }
                tracing::debug!("no job popped, looper sleeping");
                let pause = self.next_jitter();
                tokio::select! {
                    _ = done.changed() => {}
                    _ = tokio::time::sleep(pause) => {}
                }
            }
        }

        tracing::info!("shutdown, queue looper exited");
        // dropping tx closes the job channel and stops draining workers
    }

    /// Poll every runnable queue once, priority tier first. Returns whether
    /// any job was handed to a worker.
    async fn sweep(
        &self,
        tx: &mpsc::Sender<Arc<dyn JobHandle>>,
        done: &mut watch::Receiver<bool>,
    ) -> bool {
        let mut names: Vec<String> = self
            .priority_tasks
            .read()
            .unwrap()
            .keys()
            .cloned()
            .collect();
        names.extend(self.tasks.read().unwrap().keys().cloned());

        let mut dispatched = false;
        for name in names {
            if !self.allow_run(&name) {
                continue;
            }

            match self.backend.pop(&name).await {
                Ok(Some(job)) => {
                    tokio::select! {
                        biased;
                        _ = done.changed() => {
                            // leave the reservation in place, it will be
                            // re-delivered once its deadline lapses
                            tracing::debug!(queue = %name, "shutdown during dispatch, abandoning reservation");
                            return dispatched;
                        }
                        sent = tx.send(job) => {
                            if sent.is_err() {
                                return dispatched;
                            }
                            dispatched = true;
                        }
                    }
                }
                Ok(None) => {}
                Err(err) => {
                    tracing::debug!(queue = %name, error = %err, "pop failed, treating queue as empty");
                }
            }
        }
        dispatched
    }

    fn allow_run(&self, name: &str) -> bool {
        let allow = self.allow_tasks.read().unwrap();
        if !allow.is_empty() && !allow.contains(name) {
            return false;
        }
        drop(allow);
        !self.exclude_tasks.read().unwrap().contains(name)
    }

    fn next_jitter(&self) -> Duration {
        let mut jitter = self.jitter.lock().unwrap();
        let step_millis = rand::thread_rng().gen_range(0..JITTER_BASE.as_millis() as u64 / 3);
        *jitter = (*jitter + Duration::from_millis(step_millis)).min(JITTER_MAX);
        *jitter
    }

    fn reset_jitter(&self) {
        *self.jitter.lock().unwrap() = JITTER_BASE;
    }

    async fn worker_loop(self: Arc<Self>, worker_id: usize, rx: JobReceiver) {
        tracing::info!(worker_id, "queue worker started");

        loop {
            let job = {
                let mut rx = rx.lock().await;
                rx.recv().await
            };
            let Some(job) = job else { break };

            if self.shutting_down() {
                // received after the done channel closed: do not start new
                // work, the reservation will be re-delivered
                tracing::debug!(
                    worker_id,
                    queue = %job.name(),
                    id = %job.payload().id,
                    "dropping job received after shutdown"
                );
                continue;
            }

            self.run_job(job, worker_id).await;
        }

        tracing::info!(worker_id, "queue worker exited");
    }

    /// Execute one reserved job: duplicate suppression, attempt bounds,
    /// deadline control and failure routing.
    async fn run_job(self: &Arc<Self>, handle: Arc<dyn JobHandle>, worker_id: usize) {
        self.set_worker_status(worker_id, true);

        let queue = handle.name().to_string();
        let Some(task) = self.task_by_name(&queue) else {
            tracing::debug!(queue = %queue, "no task bootstrapped for popped job, leaving reservation");
            self.set_worker_status(worker_id, false);
            return;
        };
        let payload = handle.payload().clone();

        // A reservation of this id expired on the store while its execute is
        // still running. Execution cannot be interrupted from outside, so the
        // duplicate is re-scheduled instead of run twice concurrently. Task
        // bodies must be idempotent on the job id regardless.
        let duplicate = {
            let mut in_flight = self.in_flight.lock().unwrap();
            if in_flight.contains_key(&payload.id) {
                true
            } else {
                in_flight.insert(payload.id.clone(), worker_id);
                false
            }
        };
        if duplicate {
            tracing::warn!(
                queue = %queue,
                id = %payload.id,
                pop_time = %handle.pop_time(),
                "previous run of this job has not finished, rescheduling"
            );
            let delay = Duration::from_secs(payload.retry_interval.max(0) as u64);
            if let Err(err) = self.backend.later(&queue, delay, &payload).await {
                tracing::warn!(queue = %queue, id = %payload.id, error = %err, "failed to reschedule duplicate job");
            }
            self.record_failed_job(&payload, &MillraceError::WaitingPrevJobFinish);
            self.set_worker_status(worker_id, false);
            return;
        }

        if self
            .mark_job_as_failed_if_already_exceeds_max_attempts(&handle)
            .await
        {
            self.in_flight.lock().unwrap().remove(&payload.id);
            self.set_worker_status(worker_id, false);
            return;
        }

        tracing::info!(
            queue = %queue,
            worker_id,
            id = %payload.id,
            attempt = handle.attempts(),
            "job processing"
        );

        let timeout = handle.timeout();
        let (cancel, cancelled) = watch::channel(false);
        let deadline = Utc::now()
            + chrono::Duration::milliseconds(timeout.as_millis().min(i64::MAX as u128) as i64);
        let ctx = AttemptContext::new(deadline, cancelled);

        // The attempt runs on its own task so the worker can time out
        // independently. It keeps running past the deadline (cancellation is
        // cooperative) and reports its own outcome to the handle; the
        // in-flight entry is cleared only once execute has returned.
        let attempt = tokio::spawn({
            let manager = Arc::clone(self);
            let handle = Arc::clone(&handle);
            let task = Arc::clone(&task);
            let body = payload.raw_body();
            let queue = queue.clone();
            let id = payload.id.clone();
            async move {
                match task.execute(ctx, body).await {
                    Ok(()) => {
                        let elapsed = Utc::now().signed_duration_since(handle.pop_time());
                        if let Err(err) = handle.delete().await {
                            tracing::warn!(queue = %queue, id = %id, error = %err, "failed to delete finished job");
                        }
                        tracing::info!(
                            queue = %queue,
                            worker_id,
                            id = %id,
                            duration_ms = elapsed.num_milliseconds(),
                            "job processed"
                        );
                    }
                    Err(err) => {
                        tracing::error!(queue = %queue, worker_id, id = %id, error = %err, "job failed");
                        manager
                            .mark_job_as_failed_if_will_exceed_max_attempts(&handle, &err)
                            .await;
                    }
                }
                manager.in_flight.lock().unwrap().remove(&id);
            }
        });

        match tokio::time::timeout(timeout, attempt).await {
            Ok(Ok(())) => {}
            Ok(Err(join_err)) => {
                // the attempt task never reached its own cleanup
                let reason = match join_err.try_into_panic() {
                    Ok(panic) => {
                        if let Some(s) = panic.downcast_ref::<&str>() {
                            (*s).to_string()
                        } else if let Some(s) = panic.downcast_ref::<String>() {
                            s.clone()
                        } else {
                            "unknown panic".to_string()
                        }
                    }
                    Err(err) => err.to_string(),
                };
                tracing::error!(
                    queue = %queue,
                    worker_id,
                    id = %payload.id,
                    panic = %reason,
                    "job execute panicked"
                );
                self.mark_job_as_failed_if_will_exceed_max_attempts(
                    &handle,
                    &MillraceError::Panic(reason),
                )
                .await;
                self.in_flight.lock().unwrap().remove(&payload.id);
            }
            Err(_elapsed) => {
                let _ = cancel.send(true);
                self.mark_job_as_failed_if_will_exceed_max_attempts(
                    &handle,
                    &MillraceError::DeadlineExceeded,
                )
                .await;
            }
        }

        self.set_worker_status(worker_id, false);
    }

    /// Pre-execute attempt check. Returns true when the job must not run
    /// (poisoned or hand-edited entries already past their maximum attempts).
    async fn mark_job_as_failed_if_already_exceeds_max_attempts(
        &self,
        handle: &Arc<dyn JobHandle>,
    ) -> bool {
        self.warn_if_running_too_long(handle);

        if handle.attempts() <= handle.payload().max_tries {
            return false;
        }

        self.fail_job(handle, &MillraceError::MaxAttemptsExceeded)
            .await;
        true
    }

    /// Post-attempt failure routing: retry while attempts remain, otherwise
    /// terminal failure.
    async fn mark_job_as_failed_if_will_exceed_max_attempts(
        &self,
        handle: &Arc<dyn JobHandle>,
        err: &MillraceError,
    ) {
        if handle.is_deleted() {
            return;
        }

        self.warn_if_running_too_long(handle);

        if handle.attempts() >= handle.payload().max_tries {
            self.fail_job(handle, err).await;
        } else if let Err(release_err) = handle.release(handle.payload().retry_interval).await {
            tracing::warn!(
                queue = %handle.name(),
                id = %handle.payload().id,
                error = %release_err,
                "failed to release job for retry"
            );
        }
    }

    async fn fail_job(&self, handle: &Arc<dyn JobHandle>, err: &MillraceError) {
        handle.mark_as_failed();

        if handle.is_deleted() {
            return;
        }
        if let Err(delete_err) = handle.delete().await {
            tracing::warn!(
                queue = %handle.name(),
                id = %handle.payload().id,
                error = %delete_err,
                "failed to delete failed job"
            );
        }

        tracing::error!(
            queue = %handle.name(),
            id = %handle.payload().id,
            error = %err,
            "job permanently failed"
        );

        handle.failed(err);
        self.record_failed_job(handle.payload(), err);
    }

    fn record_failed_job(&self, payload: &Payload, err: &MillraceError) {
        let handler = self.failed_job_handler.read().unwrap().clone();
        if let Some(handler) = handler {
            let _ = handler(payload, err);
        }
    }

    fn warn_if_running_too_long(&self, handle: &Arc<dyn JobHandle>) {
        let running_secs = Utc::now().timestamp() - handle.pop_time().timestamp();
        if running_secs >= handle.timeout().as_secs() as i64 {
            tracing::warn!(
                queue = %handle.name(),
                id = %handle.payload().id,
                pop_time = %handle.pop_time(),
                "job has been executing longer than its timeout"
            );
        }
    }

    fn set_worker_status(&self, worker_id: usize, busy: bool) {
        let mut status = self.worker_status.lock().unwrap();
        let flag = status
            .entry(worker_id)
            .or_insert_with(|| Arc::new(AtomicBool::new(false)));
        flag.store(busy, Ordering::SeqCst);
    }

    fn workers_idle(&self) -> bool {
        self.worker_status
            .lock()
            .unwrap()
            .values()
            .all(|flag| !flag.load(Ordering::SeqCst))
    }
}
