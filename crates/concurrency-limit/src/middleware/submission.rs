//! Submission-time interception

use std::sync::Arc;

use tracing::{debug, instrument, warn};

use crate::job::Job;
use crate::service::ConcurrencyLimitService;
use crate::store::StoreError;

/// Outcome of submitting a job
#[derive(Debug, Clone, PartialEq)]
pub enum Submission {
    /// Hand the job to the broker
    Proceed(Job),
    /// The job was written to the overflow queue instead
    Deferred { queue_size: u64 },
}

impl Submission {
    pub fn is_deferred(&self) -> bool {
        matches!(self, Self::Deferred { .. })
    }
}

/// Defers jobs at submission when their worker type is known to be backed up
///
/// A fresh job is deferred when its worker type has a limit and either
/// other jobs are already waiting in the overflow queue or the limit is a
/// hard block. It never checks the live concurrency count: that is the
/// execution middleware's job, once the broker actually runs the job.
///
/// Store failures pass the job through.
#[derive(Clone)]
pub struct SubmissionMiddleware {
    service: Arc<ConcurrencyLimitService>,
}

impl SubmissionMiddleware {
    pub fn new(service: Arc<ConcurrencyLimitService>) -> Self {
        Self { service }
    }

    #[instrument(skip(self, job), fields(worker_type = %job.worker_type, jid = %job.jid))]
    pub async fn call(&self, job: Job) -> Submission {
        if job.is_resumed() {
            return Submission::Proceed(job);
        }

        match self.should_defer(&job).await {
            Ok(true) => {}
            Ok(false) => return Submission::Proceed(job),
            Err(e) => {
                warn!(error = %e, "Limit check failed, submitting without deferral");
                return Submission::Proceed(job);
            }
        }

        match self.service.add_to_queue(&job).await {
            Ok(queue_size) => {
                debug!(queue_size, "Job deferred at submission");
                Submission::Deferred { queue_size }
            }
            Err(e) => {
                warn!(error = %e, "Failed to defer job, submitting anyway");
                Submission::Proceed(job)
            }
        }
    }

    async fn should_defer(&self, job: &Job) -> Result<bool, StoreError> {
        let limit = self.service.current_limit(&job.worker_type).await?;
        if limit.is_unlimited() {
            return Ok(false);
        }
        if limit.is_blocked() {
            return Ok(true);
        }
        self.service.has_queued_jobs(&job.worker_type).await
    }
}
