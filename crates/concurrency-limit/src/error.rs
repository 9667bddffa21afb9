//! Error types for concurrency limiting

use crate::broker::BrokerError;
use crate::job::WorkerType;
use crate::resume::ResumeMetadataError;
use crate::store::StoreError;

/// Errors returned by the service, queue manager and tracker
///
/// The middleware never surfaces these to job submitters; they fail open
/// and log instead.
#[derive(Debug, thiserror::Error)]
pub enum ConcurrencyLimitError {
    /// Store error
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// Bulk resubmission failed; the overflow queue was left untouched
    #[error("broker error: {0}")]
    Broker(#[from] BrokerError),

    /// Deferred job could not be serialized
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Resume metadata side channel rejected a record
    #[error("resume metadata error: {0}")]
    ResumeMetadata(#[from] ResumeMetadataError),

    /// Resume lease expired or was taken over mid-cycle
    #[error("resume lease lost for worker type {0}")]
    LeaseLost(WorkerType),

    /// Maintenance scheduler was started twice
    #[error("maintenance scheduler already running")]
    AlreadyRunning,

    /// Invalid configuration
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}
