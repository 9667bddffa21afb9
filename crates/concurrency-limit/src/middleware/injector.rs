//! Resume metadata injection on bulk resubmission

use std::sync::Arc;

use tracing::{debug, error};

use crate::job::Job;
use crate::resume::{MetadataLookup, ResumeMetadataRegistry};

/// What the injector did with a job
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Injection {
    /// No resume cycle is submitting this worker type
    NotResumed,
    /// Metadata merged; the job is marked resumed
    Injected,
    /// A cycle is running but had no metadata left for this job
    MissingMetadata,
}

/// Attaches resume metadata to jobs as the broker builds them
///
/// Brokers call [`inject`](Self::inject) once per job produced by
/// `bulk_submit`, in submission order.
#[derive(Debug, Clone)]
pub struct ResumeMetadataInjector {
    registry: Arc<ResumeMetadataRegistry>,
}

impl ResumeMetadataInjector {
    pub fn new(registry: Arc<ResumeMetadataRegistry>) -> Self {
        Self { registry }
    }

    pub fn inject(&self, job: &mut Job) -> Injection {
        match self.registry.take(&job.worker_type) {
            MetadataLookup::NotExpected => Injection::NotResumed,
            MetadataLookup::Found(metadata) => {
                metadata.apply_to(job);
                debug!(worker_type = %job.worker_type, jid = %job.jid, "Resume metadata injected");
                Injection::Injected
            }
            MetadataLookup::Missing => {
                self.registry.record_integrity_error();
                error!(
                    worker_type = %job.worker_type,
                    jid = %job.jid,
                    "Resume metadata missing for resubmitted job"
                );
                Injection::MissingMetadata
            }
        }
    }
}
