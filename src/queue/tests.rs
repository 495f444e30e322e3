use crate::error::Result;
use crate::queue::MemoryBackend;
use crate::traits::backend::{Backend, JobHandle};
use crate::traits::task::{
    AttemptContext, DEFAULT_EXECUTE_TIMEOUT, DEFAULT_MAX_TRIES, DEFAULT_RETRY_INTERVAL, Payload,
    RawBody, Task,
};
use async_trait::async_trait;
use chrono::Utc;
use serde::Deserialize;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

struct NoopTask;

#[async_trait]
impl Task for NoopTask {
    fn name(&self) -> &str {
        "noop"
    }

    async fn execute(&self, _ctx: AttemptContext, _body: RawBody) -> Result<()> {
        Ok(())
    }
}

fn payload(id: &str, timeout_secs: i64) -> Payload {
    Payload {
        name: "noop".to_string(),
        id: id.to_string(),
        max_tries: 3,
        retry_interval: 1,
        attempts: 0,
        body: "{}".to_string(),
        pop_time: 0,
        timeout: timeout_secs,
        timeout_at: 0,
    }
}

#[test]
fn test_payload_wire_field_names() {
    let value = serde_json::to_value(payload("job-1", 5)).unwrap();
    let object = value.as_object().unwrap();

    let keys: HashSet<&str> = object.keys().map(String::as_str).collect();
    let expected: HashSet<&str> = [
        "Name",
        "ID",
        "MaxTries",
        "RetryInterval",
        "Attempts",
        "Payload",
        "PopTime",
        "Timeout",
        "TimeoutAt",
    ]
    .into_iter()
    .collect();
    assert_eq!(keys, expected);

    // the reserved copy must round-trip byte-exactly through the store
    let encoded = serde_json::to_string(&payload("job-1", 5)).unwrap();
    let decoded: Payload = serde_json::from_str(&encoded).unwrap();
    assert_eq!(serde_json::to_string(&decoded).unwrap(), encoded);
}

#[test]
fn test_payload_for_task_defaults() {
    let payload = Payload::for_task(&NoopTask, "\"hi\"".to_string());

    assert_eq!(payload.name, "noop");
    assert!(!payload.id.is_empty());
    assert_eq!(payload.max_tries, DEFAULT_MAX_TRIES);
    assert_eq!(payload.retry_interval, DEFAULT_RETRY_INTERVAL);
    assert_eq!(payload.timeout, DEFAULT_EXECUTE_TIMEOUT.as_secs() as i64);
    assert_eq!(payload.attempts, 0);
    assert_eq!(payload.pop_time, 0);
    assert_eq!(payload.timeout_at, 0);
}

#[test]
fn test_raw_body_accessors() {
    #[derive(Debug, Deserialize, PartialEq)]
    struct Body {
        x: i64,
    }

    let mut envelope = payload("job-1", 5);
    envelope.body = r#"{"x":42}"#.to_string();
    let body = envelope.raw_body();

    assert_eq!(body.queue(), "noop");
    assert_eq!(body.id(), "job-1");
    assert_eq!(body.as_str(), r#"{"x":42}"#);
    assert_eq!(body.as_bytes(), r#"{"x":42}"#.as_bytes());
    assert_eq!(body.decode::<Body>().unwrap(), Body { x: 42 });

    envelope.body = "17".to_string();
    let scalar = envelope.raw_body();
    assert_eq!(scalar.to_i64(), 17);
    assert_eq!(scalar.to_u64(), 17);
    assert!(scalar.decode::<Body>().is_err());
}

#[tokio::test]
async fn test_memory_pop_reserves_and_counts_attempts() {
    let backend = MemoryBackend::new();
    backend.push("noop", &payload("job-1", 60)).await.unwrap();
    assert_eq!(backend.size("noop").await.unwrap(), 1);

    let handle = backend.pop("noop").await.unwrap().expect("job expected");
    assert_eq!(handle.attempts(), 1);
    assert_eq!(handle.payload().attempts, 0);
    assert_eq!(handle.payload().id, "job-1");
    assert!(handle.pop_time().timestamp() > 0);
    assert_eq!(handle.timeout(), Duration::from_secs(60));
    assert!(handle.timeout_at() > handle.pop_time());

    // reserved entries still count toward the backlog
    assert_eq!(backend.size("noop").await.unwrap(), 1);

    // and are not re-delivered while the reservation is live
    assert!(backend.pop("noop").await.unwrap().is_none());

    handle.delete().await.unwrap();
    assert!(handle.is_deleted());
    assert_eq!(backend.size("noop").await.unwrap(), 0);
}

#[tokio::test]
async fn test_memory_release_moves_job_to_delayed() {
    let backend = MemoryBackend::new();
    backend.push("noop", &payload("job-1", 60)).await.unwrap();

    let first = backend.pop("noop").await.unwrap().unwrap();
    let first_pop_time = first.pop_time();
    first.release(0).await.unwrap();
    assert!(first.is_released());
    assert_eq!(backend.size("noop").await.unwrap(), 1);

    // releasing twice is an error, the reservation is gone
    assert!(first.release(0).await.is_err());

    // a zero delay is due immediately, the next pop migrates and re-reserves
    let second = backend.pop("noop").await.unwrap().expect("redelivery");
    assert_eq!(second.attempts(), 2);
    // the first reservation fixed the pop time for good
    assert_eq!(second.pop_time(), first_pop_time);
}

#[tokio::test]
async fn test_memory_expired_reservation_is_redelivered() {
    let backend = MemoryBackend::new();
    // timeout 0 makes the reservation expire the instant it is taken
    backend.push("noop", &payload("job-1", 0)).await.unwrap();

    let first = backend.pop("noop").await.unwrap().unwrap();
    assert_eq!(first.attempts(), 1);

    let second = backend.pop("noop").await.unwrap().expect("redelivery");
    assert_eq!(second.attempts(), 2);
    assert_eq!(second.payload().id, "job-1");
}

#[tokio::test]
async fn test_memory_delayed_not_delivered_early() {
    let backend = MemoryBackend::new();
    let at = Utc::now() + chrono::Duration::seconds(60);
    backend
        .later_at("noop", at, &payload("job-1", 60))
        .await
        .unwrap();

    assert_eq!(backend.size("noop").await.unwrap(), 1);
    assert!(backend.pop("noop").await.unwrap().is_none());
}

#[tokio::test]
async fn test_memory_pop_is_fifo() {
    let backend = MemoryBackend::new();
    for i in 0..5 {
        backend
            .push("noop", &payload(&format!("job-{}", i), 60))
            .await
            .unwrap();
    }

    for i in 0..5 {
        let handle = backend.pop("noop").await.unwrap().unwrap();
        assert_eq!(handle.payload().id, format!("job-{}", i));
    }
}

#[tokio::test]
async fn test_concurrent_pops_reserve_each_job_once() {
    let backend = Arc::new(MemoryBackend::new());
    let published = 5usize;
    for i in 0..published {
        backend
            .push("noop", &payload(&format!("job-{}", i), 60))
            .await
            .unwrap();
    }

    let mut joins = Vec::new();
    for _ in 0..10 {
        let backend = Arc::clone(&backend);
        joins.push(tokio::spawn(
            async move { backend.pop("noop").await.unwrap() },
        ));
    }

    let mut ids = Vec::new();
    for join in joins {
        if let Some(handle) = join.await.unwrap() {
            ids.push(handle.payload().id.clone());
        }
    }

    // min(N, K) reservations, no id handed out twice
    assert_eq!(ids.len(), published);
    let unique: HashSet<&String> = ids.iter().collect();
    assert_eq!(unique.len(), published);
}

#[tokio::test]
async fn test_attempt_context_cancellation() {
    let (cancel, cancelled) = watch::channel(false);
    let deadline = Utc::now() + chrono::Duration::seconds(1);
    let ctx = AttemptContext::new(deadline, cancelled);

    assert_eq!(ctx.deadline(), deadline);
    assert!(!ctx.is_cancelled());

    cancel.send(true).unwrap();
    assert!(ctx.is_cancelled());

    // resolves promptly once the signal fired
    tokio::time::timeout(Duration::from_secs(1), ctx.cancelled())
        .await
        .expect("cancelled() should resolve");
}

#[test]
fn test_queue_driver_serde_lowercase() {
    use crate::config::QueueDriver;

    assert_eq!(
        serde_json::to_string(&QueueDriver::Memory).unwrap(),
        "\"memory\""
    );
    let driver: QueueDriver = serde_json::from_str("\"memory\"").unwrap();
    assert_eq!(driver, QueueDriver::Memory);

    #[cfg(feature = "redis-backend")]
    {
        assert_eq!(
            serde_json::to_string(&QueueDriver::Redis).unwrap(),
            "\"redis\""
        );
    }
}

#[cfg(feature = "redis-backend")]
mod redis_backend {
    use super::*;
    use crate::queue::RedisBackend;

    // These tests require a running Redis instance and are ignored by
    // default; backend equivalence is asserted on the memory implementation.

    fn test_queue() -> String {
        format!("millrace-test-{}", crate::utils::unique_id())
    }

    #[tokio::test]
    #[ignore] // Requires Redis
    async fn test_redis_push_pop_round_trip() {
        let backend = RedisBackend::new("redis://127.0.0.1/").unwrap();
        let queue = test_queue();

        let mut published = payload("redis-job-1", 60);
        published.name = queue.clone();
        backend.push(&queue, &published).await.unwrap();
        assert_eq!(backend.size(&queue).await.unwrap(), 1);

        let handle = backend.pop(&queue).await.unwrap().expect("job expected");
        assert_eq!(handle.attempts(), 1);
        assert_eq!(handle.payload().body, published.body);

        handle.delete().await.unwrap();
        assert_eq!(backend.size(&queue).await.unwrap(), 0);
    }

    #[tokio::test]
    #[ignore] // Requires Redis
    async fn test_redis_release_redelivers() {
        let backend = RedisBackend::new("redis://127.0.0.1/").unwrap();
        let queue = test_queue();

        let mut published = payload("redis-job-2", 60);
        published.name = queue.clone();
        backend.push(&queue, &published).await.unwrap();

        let first = backend.pop(&queue).await.unwrap().unwrap();
        first.release(0).await.unwrap();

        let second = backend.pop(&queue).await.unwrap().expect("redelivery");
        assert_eq!(second.attempts(), 2);
        assert_eq!(second.pop_time(), first.pop_time());

        second.delete().await.unwrap();
        assert_eq!(backend.size(&queue).await.unwrap(), 0);
    }
}

#[test]
fn test_queue_config_from_env() {
    use crate::config::QueueConfig;

    let config = QueueConfig::default();
    assert_eq!(config.driver, crate::config::QueueDriver::Memory);
    assert_eq!(config.concurrent, 4);
    assert!(config.redis_url.is_none());

    unsafe {
        std::env::set_var("MILLRACE_QUEUE_CONCURRENT", "9");
        std::env::set_var("MILLRACE_QUEUE_REDIS_URL", "redis://127.0.0.1/");
    }
    let config = QueueConfig::from_env();
    assert_eq!(config.concurrent, 9);
    assert_eq!(config.redis_url.as_deref(), Some("redis://127.0.0.1/"));
    unsafe {
        std::env::remove_var("MILLRACE_QUEUE_CONCURRENT");
        std::env::remove_var("MILLRACE_QUEUE_REDIS_URL");
    }
}
