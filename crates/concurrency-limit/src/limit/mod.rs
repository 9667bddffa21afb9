//! Concurrency limits per worker type
//!
//! This module provides:
//! - [`ConcurrencyLimit`] - the numeric limit and its three meanings
//! - [`LimitSource`] - strategy for resolving a worker type's current limit
//! - [`StoreBackedLimitSource`] - TTL-bounded store override over declared defaults
//! - [`StaticRegistryLimitSource`] - process-local capacity functions
//! - [`LimitStore`] - the override record in the keyed store
//!
//! The source is chosen once, when the service is constructed.

mod registry;
mod source;
mod store;

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::job::WorkerType;
use crate::store::StoreError;

pub use registry::{CapacityFn, StaticWorkerRegistry, WorkerDeclaration, WorkerDeclarations};
pub use source::{StaticRegistryLimitSource, StoreBackedLimitSource};
pub use store::LimitStore;

/// Concurrency limit for one worker type
///
/// - `0`: unlimited, no admission control
/// - negative: hard block, every job is deferred
/// - `N > 0`: at most N jobs executing at once
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct ConcurrencyLimit(i64);

impl ConcurrencyLimit {
    pub const UNLIMITED: Self = Self(0);

    pub fn new(value: i64) -> Self {
        Self(value)
    }

    pub fn value(&self) -> i64 {
        self.0
    }

    pub fn is_unlimited(&self) -> bool {
        self.0 == 0
    }

    pub fn is_blocked(&self) -> bool {
        self.0 < 0
    }

    /// Whether any admission control applies
    pub fn is_limited(&self) -> bool {
        self.0 != 0
    }

    /// Maximum concurrent executions, for positive limits only
    pub fn max_concurrency(&self) -> Option<u64> {
        (self.0 > 0).then_some(self.0 as u64)
    }

    /// Whether `in_flight` executions leave no room for another
    pub fn is_exceeded_by(&self, in_flight: u64) -> bool {
        match self.max_concurrency() {
            Some(max) => in_flight >= max,
            None => self.is_blocked(),
        }
    }

    /// Slots left given `in_flight` executions; `None` when unlimited
    pub fn remaining(&self, in_flight: u64) -> Option<u64> {
        if self.is_unlimited() {
            return None;
        }
        Some(
            self.max_concurrency()
                .map_or(0, |max| max.saturating_sub(in_flight)),
        )
    }
}

impl fmt::Display for ConcurrencyLimit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i64> for ConcurrencyLimit {
    fn from(value: i64) -> Self {
        Self(value)
    }
}

/// Resolves the current limit for a worker type
///
/// Unresolvable worker types must report [`ConcurrencyLimit::UNLIMITED`]
/// rather than an error: a misconfiguration never freezes a job type.
#[async_trait]
pub trait LimitSource: Send + Sync + 'static {
    /// Current limit for the worker type
    async fn current_limit(&self, worker_type: &WorkerType)
        -> Result<ConcurrencyLimit, StoreError>;

    /// Whether the worker type maps to a known declaration
    fn resolves(&self, worker_type: &WorkerType) -> bool;

    /// Every worker type this source knows about
    fn worker_types(&self) -> Vec<WorkerType>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_limit_semantics() {
        let unlimited = ConcurrencyLimit::UNLIMITED;
        assert!(unlimited.is_unlimited());
        assert!(!unlimited.is_limited());
        assert!(!unlimited.is_exceeded_by(1_000_000));
        assert_eq!(unlimited.remaining(10), None);

        let blocked = ConcurrencyLimit::new(-1);
        assert!(blocked.is_blocked());
        assert!(blocked.is_exceeded_by(0));
        assert_eq!(blocked.remaining(0), Some(0));
        assert_eq!(blocked.max_concurrency(), None);

        let two = ConcurrencyLimit::new(2);
        assert!(!two.is_exceeded_by(1));
        assert!(two.is_exceeded_by(2));
        assert!(two.is_exceeded_by(3));
        assert_eq!(two.remaining(1), Some(1));
        assert_eq!(two.remaining(5), Some(0));
    }
}
