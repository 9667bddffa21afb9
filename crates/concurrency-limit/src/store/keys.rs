//! Store key layout
//!
//! | Key Pattern | Type | Purpose |
//! |-------------|------|---------|
//! | `{prefix}:{worker}:current_limit` | Scalar (TTL) | Limit override |
//! | `{prefix}:throttled_jobs:{worker}` | List | Overflow queue |
//! | `{prefix}:throttled_jobs_dead:{worker}` | List | Undecodable queue entries |
//! | `{prefix}:{worker}:executing` | Hash | Execution tracker |
//! | `{prefix}:{worker}:deferred_total` | Scalar | Deferred job counter |
//! | `{prefix}:queue_manager:{worker}` | Scalar (TTL) | Resume lease |
//!
//! `{worker}` is [`WorkerType::key_component`].

use crate::job::WorkerType;

/// Default key namespace
pub const DEFAULT_KEY_PREFIX: &str = "concurrency_limit";

/// Derives every per-worker-type store key from a fixed prefix
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreKeys {
    prefix: String,
}

impl StoreKeys {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn current_limit(&self, worker_type: &WorkerType) -> String {
        format!("{}:{}:current_limit", self.prefix, worker_type.key_component())
    }

    pub fn overflow_queue(&self, worker_type: &WorkerType) -> String {
        format!("{}:throttled_jobs:{}", self.prefix, worker_type.key_component())
    }

    pub fn dead_letters(&self, worker_type: &WorkerType) -> String {
        format!(
            "{}:throttled_jobs_dead:{}",
            self.prefix,
            worker_type.key_component()
        )
    }

    pub fn executing(&self, worker_type: &WorkerType) -> String {
        format!("{}:{}:executing", self.prefix, worker_type.key_component())
    }

    pub fn deferred_total(&self, worker_type: &WorkerType) -> String {
        format!("{}:{}:deferred_total", self.prefix, worker_type.key_component())
    }

    pub fn resume_lease(&self, worker_type: &WorkerType) -> String {
        format!("{}:queue_manager:{}", self.prefix, worker_type.key_component())
    }
}

impl Default for StoreKeys {
    fn default() -> Self {
        Self::new(DEFAULT_KEY_PREFIX)
    }
}
