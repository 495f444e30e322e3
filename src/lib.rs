//! Millrace - a distributed background job queue
//!
//! Millrace executes named, user-defined tasks against a shared backing store
//! with at-least-once delivery. A single polling dispatcher feeds a bounded
//! pool of workers; each attempt runs under its own deadline, failed attempts
//! are retried with a per-task interval, and reservations that expire on the
//! store (for example after a worker crash) are re-delivered automatically.
//!
//! # Features
//!
//! - **Backends**: in-process memory queue for development and testing, and a
//!   Redis queue (one list plus two sorted sets per task, driven by atomic
//!   Lua scripts) for multi-process deployments
//! - **Submission**: immediate dispatch, delayed by duration, or scheduled at
//!   an absolute time, by task reference or by registered name
//! - **Execution control**: bounded worker concurrency, per-attempt timeouts,
//!   bounded retries, duplicate-reservation suppression
//! - **Operations**: priority tier, allow/deny task filters, a terminal
//!   failure sink, graceful shutdown that drains in-flight work
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use async_trait::async_trait;
//! use millrace::{AttemptContext, Queue, QueueConfig, RawBody, Task};
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! struct SendEmail;
//!
//! #[async_trait]
//! impl Task for SendEmail {
//!     fn name(&self) -> &str {
//!         "send_email"
//!     }
//!
//!     async fn execute(&self, _ctx: AttemptContext, body: RawBody) -> millrace::Result<()> {
//!         println!("emailing {}", body.as_str());
//!         Ok(())
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> millrace::Result<()> {
//!     millrace::init_tracing();
//!
//!     let queue = Queue::new(QueueConfig::default())?;
//!     queue.bootstrap_one(Arc::new(SendEmail))?;
//!     queue.start()?;
//!
//!     queue.dispatch(&SendEmail, &"ops@example.com").await?;
//!
//!     queue.shut_down(Duration::from_secs(10)).await?;
//!     Ok(())
//! }
//! ```

mod config;
mod error;
pub mod queue;
pub mod traits;
mod utils;

// Re-exports for public API
pub use config::{QueueConfig, QueueDriver};
pub use error::{MillraceError, Result};
#[cfg(feature = "redis-backend")]
pub use queue::RedisBackend;
pub use queue::{MemoryBackend, Queue};
pub use traits::backend::{Backend, JobHandle};
pub use traits::task::{
    AttemptContext, DEFAULT_EXECUTE_TIMEOUT, DEFAULT_MAX_TRIES, DEFAULT_RETRY_INTERVAL,
    FailedJobHandler, Payload, RawBody, Task,
};

use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// Initialize tracing/logging with sensible defaults
///
/// This should be called early in your application, typically in main()
/// before constructing a [`Queue`].
///
/// # Environment Variables
///
/// - `RUST_LOG`: Set log level (e.g., "info", "debug", "millrace=debug")
/// - `MILLRACE_LOG_JSON`: Set to "true" for JSON formatted logs
pub fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let json_logs = std::env::var("MILLRACE_LOG_JSON")
        .map(|v| v.parse::<bool>().unwrap_or(false))
        .unwrap_or(false);

    if json_logs {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
}
