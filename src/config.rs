//! Configuration for the job queue

use crate::utils::get_env_with_prefix;
use serde::{Deserialize, Serialize};

/// Queue backend driver
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueDriver {
    /// In-memory queue (for development/testing)
    Memory,
    /// Redis-backed queue (for production, shared across processes)
    #[cfg(feature = "redis-backend")]
    Redis,
}

impl Default for QueueDriver {
    fn default() -> Self {
        Self::Memory
    }
}

/// Configuration for a [`Queue`](crate::Queue)
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct QueueConfig {
    /// Queue backend driver
    #[serde(default)]
    pub driver: QueueDriver,

    /// Redis connection URL (only used for the Redis driver)
    #[serde(default)]
    pub redis_url: Option<String>,

    /// Number of concurrent workers to spawn
    #[serde(default = "default_concurrent")]
    pub concurrent: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            driver: QueueDriver::default(),
            redis_url: None,
            concurrent: default_concurrent(),
        }
    }
}

impl QueueConfig {
    /// Load queue configuration from environment variables
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Some(driver) = get_env_with_prefix("QUEUE_DRIVER") {
            config.driver = match driver.to_lowercase().as_str() {
                #[cfg(feature = "redis-backend")]
                "redis" => QueueDriver::Redis,
                _ => QueueDriver::Memory,
            };
        }

        if let Some(url) = get_env_with_prefix("QUEUE_REDIS_URL") {
            config.redis_url = Some(url);
        }

        if let Some(concurrent) = get_env_with_prefix("QUEUE_CONCURRENT") {
            if let Ok(c) = concurrent.parse() {
                config.concurrent = c;
            }
        }

        config
    }
}

fn default_concurrent() -> usize {
    4
}
