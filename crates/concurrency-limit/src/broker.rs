//! Job broker interface
//!
//! The broker that dispatches and executes jobs is external. The resume
//! protocol needs exactly one thing from it: bulk resubmission of argument
//! lists for one worker type.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;

use crate::job::{Job, WorkerType};
use crate::middleware::ResumeMetadataInjector;

/// Broker errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum BrokerError {
    /// Broker could not be reached
    #[error("broker unavailable: {0}")]
    Unavailable(String),

    /// Broker refused the submission
    #[error("broker rejected submission: {0}")]
    Rejected(String),
}

/// Bulk submission into the job broker
///
/// Implementations must build one job per argument list, in order, and run
/// each through the [`ResumeMetadataInjector`] before `bulk_submit` returns.
/// Resume metadata is paired with jobs by position, so reordering the batch
/// attaches metadata to the wrong job.
#[async_trait]
pub trait JobBroker: Send + Sync + 'static {
    async fn bulk_submit(
        &self,
        worker_type: &WorkerType,
        args: Vec<Vec<Value>>,
    ) -> Result<(), BrokerError>;
}

/// In-memory broker
///
/// Collects submitted jobs in order after running them through the injector.
/// Primarily for testing; `fail_next` makes the next bulk submissions fail.
pub struct InMemoryJobBroker {
    injector: ResumeMetadataInjector,
    submitted: Mutex<VecDeque<Job>>,
    bulk_calls: AtomicUsize,
    failures_pending: AtomicUsize,
}

impl InMemoryJobBroker {
    pub fn new(injector: ResumeMetadataInjector) -> Self {
        Self {
            injector,
            submitted: Mutex::new(VecDeque::new()),
            bulk_calls: AtomicUsize::new(0),
            failures_pending: AtomicUsize::new(0),
        }
    }

    /// Fail the next `n` bulk submissions
    pub fn fail_next(&self, n: usize) {
        self.failures_pending.store(n, Ordering::SeqCst);
    }

    /// Remove and return every submitted job, oldest first
    pub fn take_jobs(&self) -> Vec<Job> {
        self.submitted.lock().drain(..).collect()
    }

    /// Number of jobs waiting to be taken
    pub fn pending_count(&self) -> usize {
        self.submitted.lock().len()
    }

    /// Number of successful `bulk_submit` calls
    pub fn bulk_calls(&self) -> usize {
        self.bulk_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl JobBroker for InMemoryJobBroker {
    async fn bulk_submit(
        &self,
        worker_type: &WorkerType,
        args: Vec<Vec<Value>>,
    ) -> Result<(), BrokerError> {
        let should_fail = self
            .failures_pending
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if should_fail {
            return Err(BrokerError::Unavailable("injected failure".into()));
        }

        let jobs: Vec<Job> = args
            .into_iter()
            .map(|args| {
                let mut job = Job::new(worker_type.clone(), args);
                self.injector.inject(&mut job);
                job
            })
            .collect();

        self.submitted.lock().extend(jobs);
        self.bulk_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
