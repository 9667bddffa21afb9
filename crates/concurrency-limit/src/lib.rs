//! # Distributed Job Concurrency Limiting
//!
//! Admission control for background jobs: caps how many jobs of one worker
//! type run at once across a fleet of worker processes, parking the excess in
//! a durable overflow queue until capacity frees up.
//!
//! ## Features
//!
//! - **Per-worker-type limits**: TTL-bounded store overrides over declared defaults
//! - **Durable FIFO overflow**: deferred jobs keep their arguments, context and replication markers
//! - **Fleet-wide execution tracking**: one store hash per worker type, self-healing after crashes
//! - **Batch resume**: lease-protected, time-boxed drain back into the broker
//! - **Fail open**: store outages never block or drop a job
//!
//! ## Architecture
//!
//! ```text
//! submit ──► SubmissionMiddleware ──► broker ──► ExecutionMiddleware ──► job body
//!                   │                   ▲               │
//!                   │ defer             │ bulk_submit   │ defer / track
//!                   ▼                   │               ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                  ConcurrencyLimitService                     │
//! │   LimitSource · ExecutionTracker · QueueManager              │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      KeyValueStore                           │
//! │  (limits, overflow queues, executing hashes, resume leases)  │
//! └─────────────────────────────────────────────────────────────┘
//!                              ▲
//!                              │ every maintenance_interval
//!                   MaintenanceScheduler (cleanup_stale + resume)
//! ```
//!
//! ## Example
//!
//! ```
//! use std::sync::Arc;
//! use everruns_concurrency_limit::prelude::*;
//!
//! # tokio_test::block_on(async {
//! let registry = Arc::new(ResumeMetadataRegistry::new());
//! let broker = Arc::new(InMemoryJobBroker::new(ResumeMetadataInjector::new(registry.clone())));
//!
//! let service = Arc::new(
//!     ConcurrencyLimitService::builder(Arc::new(InMemoryKeyValueStore::new()), broker)
//!         .with_config(ConcurrencyLimitConfig::default())
//!         .with_declarations(WorkerDeclarations::new().declare_with_limit("ExportWorker", || 2))
//!         .with_resume_registry(registry)
//!         .build()
//!         .unwrap(),
//! );
//!
//! let submission = SubmissionMiddleware::new(service.clone());
//! let job = match submission.call(Job::new("ExportWorker", vec![])).await {
//!     Submission::Proceed(job) => job,
//!     Submission::Deferred { .. } => return,
//! };
//!
//! let execution = ExecutionMiddleware::new(service);
//! let outcome = execution
//!     .perform(job, &ExecutionSlot::current(), |job| async move { job.args.len() })
//!     .await;
//! assert_eq!(outcome, Execution::Performed(0));
//! # });
//! ```

pub mod broker;
pub mod config;
pub mod error;
pub mod job;
pub mod limit;
pub mod middleware;
pub mod queue;
pub mod resume;
pub mod scheduler;
pub mod service;
pub mod store;
pub mod tracker;

/// Prelude for common imports
pub mod prelude {
    pub use crate::broker::{BrokerError, InMemoryJobBroker, JobBroker};
    pub use crate::config::ConcurrencyLimitConfig;
    pub use crate::error::ConcurrencyLimitError;
    pub use crate::job::{Job, WorkerType};
    pub use crate::limit::{ConcurrencyLimit, StaticWorkerRegistry, WorkerDeclarations};
    pub use crate::middleware::{
        Execution, ExecutionMiddleware, ResumeMetadataInjector, Submission, SubmissionMiddleware,
    };
    pub use crate::queue::ResumeOutcome;
    pub use crate::resume::ResumeMetadataRegistry;
    pub use crate::scheduler::MaintenanceScheduler;
    pub use crate::service::ConcurrencyLimitService;
    pub use crate::store::{InMemoryKeyValueStore, KeyValueStore, StoreError};
    pub use crate::tracker::{ExecutionSlot, LivenessProbe};
}

// Re-export key types at crate root
pub use broker::{BrokerError, InMemoryJobBroker, JobBroker};
pub use config::ConcurrencyLimitConfig;
pub use error::ConcurrencyLimitError;
pub use job::{Job, JobContext, WorkerType};
pub use limit::{ConcurrencyLimit, LimitSource, StaticWorkerRegistry, WorkerDeclarations};
pub use middleware::{
    DeferReason, Execution, ExecutionMiddleware, Injection, ResumeMetadataInjector, Submission,
    SubmissionMiddleware,
};
pub use queue::{DeferredJobRecord, ResumeOutcome};
pub use resume::ResumeMetadataRegistry;
pub use scheduler::{MaintenanceReport, MaintenanceScheduler};
pub use service::{ConcurrencyLimitService, WorkerTypeStats};
pub use store::{InMemoryKeyValueStore, KeyValueStore, StoreError};
#[cfg(feature = "redis")]
pub use store::RedisKeyValueStore;
pub use tracker::{ExecutionSlot, ExecutionTracker, LivenessProbe, LocalWorkRegistry};
