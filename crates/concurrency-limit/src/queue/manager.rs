//! Queue manager: deferral and the batch-resume protocol

use std::sync::Arc;

use tokio::time::Instant;
use tracing::{debug, error, info, instrument, warn};

use super::lease::ExclusiveLease;
use super::overflow::OverflowQueue;
use super::record::DeferredJobRecord;
use crate::broker::JobBroker;
use crate::config::ConcurrencyLimitConfig;
use crate::error::ConcurrencyLimitError;
use crate::job::{epoch_seconds_now, Job, WorkerType};
use crate::limit::LimitSource;
use crate::resume::{ResumeMetadata, ResumeMetadataChannel, ResumeMetadataRegistry};
use crate::store::{KeyValueStore, StoreError, StoreKeys};
use crate::tracker::ExecutionTracker;

/// Result of a resume call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResumeOutcome {
    /// The cycle ran; `timed_out` is set when it stopped at the deadline
    Resumed { count: usize, timed_out: bool },
    /// Another process holds the resume lease for this worker type
    Skipped,
    /// Worker type has no declaration; its jobs stay queued
    Unresolved,
}

impl ResumeOutcome {
    /// Jobs resubmitted by this call
    pub fn resumed_count(&self) -> usize {
        match self {
            Self::Resumed { count, .. } => *count,
            Self::Skipped | Self::Unresolved => 0,
        }
    }
}

/// Owns the overflow queue and drains it back into the broker
pub struct QueueManager {
    store: Arc<dyn KeyValueStore>,
    keys: StoreKeys,
    config: ConcurrencyLimitConfig,
    queue: OverflowQueue,
    limit_source: Arc<dyn LimitSource>,
    tracker: Arc<ExecutionTracker>,
    broker: Arc<dyn JobBroker>,
    resume_registry: Arc<ResumeMetadataRegistry>,
}

impl QueueManager {
    pub fn new(
        store: Arc<dyn KeyValueStore>,
        config: ConcurrencyLimitConfig,
        limit_source: Arc<dyn LimitSource>,
        tracker: Arc<ExecutionTracker>,
        broker: Arc<dyn JobBroker>,
        resume_registry: Arc<ResumeMetadataRegistry>,
    ) -> Self {
        let keys = StoreKeys::new(config.key_prefix.clone());
        Self {
            queue: OverflowQueue::new(Arc::clone(&store), keys.clone()),
            store,
            keys,
            config,
            limit_source,
            tracker,
            broker,
            resume_registry,
        }
    }

    /// Append a job to the tail of its worker type's overflow queue
    ///
    /// Returns the queue length after the append.
    #[instrument(skip(self, job), fields(worker_type = %job.worker_type, jid = %job.jid))]
    pub async fn enqueue(&self, job: &Job) -> Result<u64, ConcurrencyLimitError> {
        let encoded = DeferredJobRecord::from_job(job, epoch_seconds_now()).encode()?;
        let queue_size = self.queue.push(&job.worker_type, &encoded).await?;

        // Counter is observability only; never fail the deferral over it
        if let Err(e) = self.queue.increment_deferred(&job.worker_type).await {
            warn!(error = %e, "Failed to increment deferred job counter");
        }

        debug!(queue_size, "Job deferred to overflow queue");
        Ok(queue_size)
    }

    pub async fn queue_size(&self, worker_type: &WorkerType) -> Result<u64, StoreError> {
        self.queue.len(worker_type).await
    }

    pub async fn has_queued_jobs(&self, worker_type: &WorkerType) -> Result<bool, StoreError> {
        Ok(self.queue_size(worker_type).await? > 0)
    }

    /// Decoded records at the head of the queue, for inspection
    pub async fn queued_records(
        &self,
        worker_type: &WorkerType,
        count: usize,
    ) -> Result<Vec<DeferredJobRecord>, StoreError> {
        self.queue.records(worker_type, count).await
    }

    /// Jobs deferred for this worker type since the counter was created
    pub async fn deferred_total(&self, worker_type: &WorkerType) -> Result<u64, StoreError> {
        self.queue.deferred_total(worker_type).await
    }

    /// Entries parked because they could not be decoded
    pub async fn dead_letter_count(&self, worker_type: &WorkerType) -> Result<u64, StoreError> {
        self.queue.dead_letter_count(worker_type).await
    }

    /// Drain the overflow queue back into the broker
    ///
    /// Runs under an exclusive lease so at most one cycle per worker type is
    /// active cluster-wide; if the lease is taken the call returns
    /// [`ResumeOutcome::Skipped`] without touching the queue. Batches are
    /// resubmitted in FIFO order and trimmed from the queue only after the
    /// broker accepted them, so a broker failure leaves the queue unchanged
    /// and the same jobs are retried next cycle (at-least-once).
    ///
    /// `capacity_hint` caps the total resumed by this call.
    #[instrument(skip(self, worker_type), fields(worker_type = %worker_type))]
    pub async fn resume(
        &self,
        worker_type: &WorkerType,
        capacity_hint: Option<u64>,
    ) -> Result<ResumeOutcome, ConcurrencyLimitError> {
        if !self.limit_source.resolves(worker_type) {
            debug!("Worker type not resolvable, leaving jobs queued");
            return Ok(ResumeOutcome::Unresolved);
        }

        let lease = ExclusiveLease::new(
            Arc::clone(&self.store),
            self.keys.resume_lease(worker_type),
            self.config.lease_ttl,
        );
        if !lease.try_obtain().await? {
            debug!("Resume lease held elsewhere, skipping cycle");
            return Ok(ResumeOutcome::Skipped);
        }

        let result = self.drain(worker_type, capacity_hint, &lease).await;

        match lease.release().await {
            Ok(true) => {}
            Ok(false) => warn!("Resume lease expired before release"),
            Err(e) => warn!(error = %e, "Failed to release resume lease"),
        }

        result
    }

    async fn drain(
        &self,
        worker_type: &WorkerType,
        capacity_hint: Option<u64>,
        lease: &ExclusiveLease,
    ) -> Result<ResumeOutcome, ConcurrencyLimitError> {
        let deadline = Instant::now() + self.config.loop_timeout;
        let guard = self
            .resume_registry
            .open(worker_type, self.config.max_batch_size);
        let mut resumed = 0usize;
        let mut timed_out = false;

        loop {
            if Instant::now() >= deadline {
                timed_out = true;
                break;
            }

            let step = self
                .drain_batch(worker_type, resumed, capacity_hint, lease, guard.channel())
                .await;
            match step {
                Ok(Some(count)) => {
                    resumed += count;
                    debug!(batch = count, total = resumed, "Resumed batch");
                }
                Ok(None) => break,
                Err(e) => {
                    warn!(resumed, error = %e, "Resume cycle aborted");
                    return Err(e);
                }
            }
        }

        if resumed > 0 {
            info!(count = resumed, timed_out, "Resumed deferred jobs");
        }
        Ok(ResumeOutcome::Resumed {
            count: resumed,
            timed_out,
        })
    }

    /// One read-submit-trim round; `None` when there is nothing left to do
    async fn drain_batch(
        &self,
        worker_type: &WorkerType,
        resumed: usize,
        capacity_hint: Option<u64>,
        lease: &ExclusiveLease,
        channel: &ResumeMetadataChannel,
    ) -> Result<Option<usize>, ConcurrencyLimitError> {
        let batch_limit = self
            .batch_limit(worker_type, resumed as u64, capacity_hint)
            .await?;
        if batch_limit == 0 {
            return Ok(None);
        }

        let entries = self.queue.peek(worker_type, batch_limit).await?;
        if entries.is_empty() {
            return Ok(None);
        }

        channel.clear();
        let mut args = Vec::with_capacity(entries.len());
        let mut undecodable = Vec::new();
        for raw in &entries {
            match DeferredJobRecord::decode(raw) {
                Ok(record) => {
                    channel.push(ResumeMetadata::from(&record))?;
                    args.push(record.args);
                }
                Err(e) => {
                    warn!(error = %e, "Undecodable overflow queue entry");
                    undecodable.push(raw);
                }
            }
        }

        let submitted = args.len();
        if submitted > 0 {
            if let Err(e) = self.broker.bulk_submit(worker_type, args).await {
                channel.clear();
                return Err(e.into());
            }

            let unconsumed = channel.clear();
            if unconsumed > 0 {
                error!(unconsumed, "Broker left resume metadata unconsumed");
                self.resume_registry.record_integrity_error();
            }
        }

        // Another cycle may be reading the same head once our lease is gone;
        // trimming then could drop jobs it has not submitted
        if !lease.is_held().await? {
            return Err(ConcurrencyLimitError::LeaseLost(worker_type.clone()));
        }

        // Parked only when the head is about to be trimmed, so each entry is
        // dead-lettered once
        for raw in undecodable {
            self.queue.push_dead_letter(worker_type, raw).await?;
        }
        self.queue.trim(worker_type, entries.len()).await?;

        Ok(Some(submitted))
    }

    /// How many jobs the next batch may resume
    ///
    /// Jobs already resumed in this cycle count as in flight: they may not
    /// have started executing yet, and resumed jobs bypass the limit check.
    async fn batch_limit(
        &self,
        worker_type: &WorkerType,
        resumed: u64,
        capacity_hint: Option<u64>,
    ) -> Result<usize, StoreError> {
        let limit = self.limit_source.current_limit(worker_type).await?;
        let ceiling = self.config.max_batch_size as u64;

        let available = match limit.max_concurrency() {
            Some(_) => {
                let executing = self.tracker.concurrent_count(worker_type).await?;
                limit
                    .remaining(executing.saturating_add(resumed))
                    .unwrap_or(0)
            }
            None if limit.is_blocked() => 0,
            None => ceiling,
        };

        let mut batch = available.min(ceiling);
        if let Some(hint) = capacity_hint {
            batch = batch.min(hint.saturating_sub(resumed));
        }
        Ok(batch as usize)
    }
}
