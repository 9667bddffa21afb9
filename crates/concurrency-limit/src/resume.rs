//! Resume metadata side channel
//!
//! The broker's bulk-submit call takes bare argument lists, with no room for
//! per-job metadata. During a resume cycle the queue manager therefore pushes
//! one [`ResumeMetadata`] per job onto a bounded FIFO, in submission order,
//! and the [`ResumeMetadataInjector`](crate::middleware::ResumeMetadataInjector)
//! pops one record per job as the broker processes the batch.
//!
//! The channel lives in process memory and exists only while a cycle for that
//! worker type is running. Its registration in [`ResumeMetadataRegistry`] is
//! the signal that incoming jobs of that worker type expect metadata.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::job::{Job, JobContext, WorkerType};
use crate::queue::DeferredJobRecord;

/// Side channel errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ResumeMetadataError {
    /// More records pushed than the channel was sized for
    #[error("resume metadata channel full (capacity {capacity})")]
    ChannelFull { capacity: usize },
}

/// Metadata re-attached to a resumed job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResumeMetadata {
    /// When the job was originally deferred, in unix seconds
    pub buffered_at: f64,
    pub resume_flag: bool,
    #[serde(default)]
    pub replication_markers: JobContext,
    /// Original submission context, merged flat into the job's context
    #[serde(default)]
    pub context: JobContext,
}

impl ResumeMetadata {
    /// Merge into a job payload
    ///
    /// The original submission context wins over whatever context the broker
    /// attached on resubmission.
    pub fn apply_to(self, job: &mut Job) {
        job.resumed = self.resume_flag;
        job.buffered_at = Some(self.buffered_at);
        job.replication_markers.extend(self.replication_markers);
        job.context.extend(self.context);
    }
}

impl From<&DeferredJobRecord> for ResumeMetadata {
    fn from(record: &DeferredJobRecord) -> Self {
        Self {
            buffered_at: record.buffered_at,
            resume_flag: true,
            replication_markers: record.replication_markers.clone(),
            context: record.context.clone(),
        }
    }
}

/// Bounded FIFO of metadata for one resume cycle
#[derive(Debug)]
pub struct ResumeMetadataChannel {
    records: Mutex<VecDeque<ResumeMetadata>>,
    capacity: usize,
}

impl ResumeMetadataChannel {
    pub fn new(capacity: usize) -> Self {
        Self {
            records: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
        }
    }

    pub fn push(&self, record: ResumeMetadata) -> Result<(), ResumeMetadataError> {
        let mut records = self.records.lock();
        if records.len() >= self.capacity {
            return Err(ResumeMetadataError::ChannelFull {
                capacity: self.capacity,
            });
        }
        records.push_back(record);
        Ok(())
    }

    pub fn pop(&self) -> Option<ResumeMetadata> {
        self.records.lock().pop_front()
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }

    /// Discard unconsumed records, returning how many there were
    pub fn clear(&self) -> usize {
        let mut records = self.records.lock();
        let n = records.len();
        records.clear();
        n
    }
}

/// Result of asking the registry for a job's metadata
#[derive(Debug, Clone, PartialEq)]
pub enum MetadataLookup {
    /// No resume cycle is submitting this worker type
    NotExpected,
    /// Next record in submission order
    Found(ResumeMetadata),
    /// A cycle is submitting this worker type but the channel is empty
    Missing,
}

/// Process-local map of active resume channels
#[derive(Debug, Default)]
pub struct ResumeMetadataRegistry {
    channels: DashMap<WorkerType, Arc<ResumeMetadataChannel>>,
    integrity_errors: AtomicU64,
}

impl ResumeMetadataRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a channel for `worker_type`, closed when the guard drops
    pub fn open(
        self: &Arc<Self>,
        worker_type: &WorkerType,
        capacity: usize,
    ) -> ResumeChannelGuard {
        let channel = Arc::new(ResumeMetadataChannel::new(capacity));
        self.channels
            .insert(worker_type.clone(), Arc::clone(&channel));
        ResumeChannelGuard {
            registry: Arc::clone(self),
            worker_type: worker_type.clone(),
            channel,
        }
    }

    /// Pop the next record for a job of `worker_type`
    pub fn take(&self, worker_type: &WorkerType) -> MetadataLookup {
        let Some(channel) = self.channels.get(worker_type).map(|c| Arc::clone(c.value())) else {
            return MetadataLookup::NotExpected;
        };
        match channel.pop() {
            Some(record) => MetadataLookup::Found(record),
            None => MetadataLookup::Missing,
        }
    }

    pub fn is_open(&self, worker_type: &WorkerType) -> bool {
        self.channels.contains_key(worker_type)
    }

    /// Count a pairing failure between jobs and metadata
    pub fn record_integrity_error(&self) {
        self.integrity_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Pairing failures seen by this process
    pub fn integrity_errors(&self) -> u64 {
        self.integrity_errors.load(Ordering::Relaxed)
    }
}

/// Open channel for one resume cycle
///
/// Dropping the guard unregisters the channel, so jobs submitted after the
/// cycle are not mistaken for resumed ones.
pub struct ResumeChannelGuard {
    registry: Arc<ResumeMetadataRegistry>,
    worker_type: WorkerType,
    channel: Arc<ResumeMetadataChannel>,
}

impl ResumeChannelGuard {
    pub fn channel(&self) -> &ResumeMetadataChannel {
        &self.channel
    }
}

impl Drop for ResumeChannelGuard {
    fn drop(&mut self) {
        // Only remove our own channel; a newer cycle may have replaced it
        self.registry
            .channels
            .remove_if(&self.worker_type, |_, c| Arc::ptr_eq(c, &self.channel));
    }
}
