//! Perform-time interception

use std::future::Future;
use std::sync::Arc;

use tokio::runtime::Handle;
use tracing::{debug, instrument, warn};

use crate::job::{Job, WorkerType};
use crate::limit::ConcurrencyLimit;
use crate::service::ConcurrencyLimitService;
use crate::store::StoreError;
use crate::tracker::{ExecutionSlot, ExecutionTracker};

/// Why a job was sent back to the overflow queue
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeferReason {
    /// Older jobs of this worker type are still waiting
    QueueNotEmpty,
    /// The fleet is already running `limit` jobs of this worker type
    AtCapacity { limit: ConcurrencyLimit, concurrent: u64 },
    /// The worker type is hard-blocked
    Blocked,
}

/// Outcome of [`ExecutionMiddleware::perform`]
#[derive(Debug, Clone, PartialEq)]
pub enum Execution<T> {
    /// The body ran and produced this output
    Performed(T),
    /// The body did not run; the job is in the overflow queue
    Deferred(DeferReason),
}

impl<T> Execution<T> {
    pub fn is_deferred(&self) -> bool {
        matches!(self, Self::Deferred(_))
    }

    pub fn into_output(self) -> Option<T> {
        match self {
            Self::Performed(output) => Some(output),
            Self::Deferred(_) => None,
        }
    }
}

/// Admits, defers and tracks jobs immediately before they run
///
/// Decision order for a job about to run:
/// 1. resumed jobs always run
/// 2. unlimited worker types always run
/// 3. a non-empty overflow queue defers the job behind the waiting ones
/// 4. a hard block, or a positive limit already reached, defers the job
///
/// Admitted jobs are tracked for the duration of the body. The tracking
/// record is removed when the body completes, panics or is cancelled.
/// Store failures fail open: the job runs, untracked if need be.
#[derive(Clone)]
pub struct ExecutionMiddleware {
    service: Arc<ConcurrencyLimitService>,
}

impl ExecutionMiddleware {
    pub fn new(service: Arc<ConcurrencyLimitService>) -> Self {
        Self { service }
    }

    #[instrument(skip_all, fields(worker_type = %job.worker_type, jid = %job.jid, slot = %slot))]
    pub async fn perform<F, Fut, T>(&self, job: Job, slot: &ExecutionSlot, body: F) -> Execution<T>
    where
        F: FnOnce(Job) -> Fut,
        Fut: Future<Output = T>,
    {
        if !job.is_resumed() {
            match self.defer_reason(&job.worker_type).await {
                Ok(Some(reason)) => match self.service.add_to_queue(&job).await {
                    Ok(queue_size) => {
                        debug!(?reason, queue_size, "Job deferred before execution");
                        return Execution::Deferred(reason);
                    }
                    Err(e) => warn!(error = %e, "Failed to defer job, running it anyway"),
                },
                Ok(None) => {}
                Err(e) => warn!(error = %e, "Limit check failed, running job"),
            }
        }

        let tracking = self.start_tracking(&job.worker_type, slot).await;
        let output = body(job).await;
        if let Some(tracking) = tracking {
            tracking.finish().await;
        }

        Execution::Performed(output)
    }

    async fn defer_reason(&self, worker_type: &WorkerType) -> Result<Option<DeferReason>, StoreError> {
        let limit = self.service.current_limit(worker_type).await?;
        if limit.is_unlimited() {
            return Ok(None);
        }

        if self.service.has_queued_jobs(worker_type).await? {
            return Ok(Some(DeferReason::QueueNotEmpty));
        }
        if limit.is_blocked() {
            return Ok(Some(DeferReason::Blocked));
        }

        let concurrent = self.service.concurrent_count(worker_type).await?;
        if limit.is_exceeded_by(concurrent) {
            return Ok(Some(DeferReason::AtCapacity { limit, concurrent }));
        }
        Ok(None)
    }

    async fn start_tracking(
        &self,
        worker_type: &WorkerType,
        slot: &ExecutionSlot,
    ) -> Option<TrackingGuard> {
        match self.service.track_execution_start(worker_type, slot).await {
            Ok(()) => Some(TrackingGuard {
                pending: Some(PendingRelease {
                    tracker: Arc::clone(self.service.tracker()),
                    worker_type: worker_type.clone(),
                    slot: slot.clone(),
                }),
            }),
            Err(e) => {
                warn!(error = %e, "Failed to track execution start, running untracked");
                None
            }
        }
    }
}

struct PendingRelease {
    tracker: Arc<ExecutionTracker>,
    worker_type: WorkerType,
    slot: ExecutionSlot,
}

impl PendingRelease {
    async fn release(self) {
        if let Err(e) = self.tracker.track_end(&self.worker_type, &self.slot).await {
            // Left for stale cleanup
            warn!(
                worker_type = %self.worker_type,
                slot = %self.slot,
                error = %e,
                "Failed to track execution end"
            );
        }
    }
}

/// Releases the execution record even if the body never returns
struct TrackingGuard {
    pending: Option<PendingRelease>,
}

impl TrackingGuard {
    async fn finish(mut self) {
        if let Some(pending) = self.pending.take() {
            pending.release().await;
        }
    }
}

impl Drop for TrackingGuard {
    fn drop(&mut self) {
        let Some(pending) = self.pending.take() else {
            return;
        };
        match Handle::try_current() {
            Ok(handle) => {
                handle.spawn(pending.release());
            }
            Err(_) => warn!(
                worker_type = %pending.worker_type,
                slot = %pending.slot,
                "No runtime to release execution record, leaving it for stale cleanup"
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::InMemoryJobBroker;
    use crate::limit::WorkerDeclarations;
    use crate::middleware::ResumeMetadataInjector;
    use crate::resume::ResumeMetadataRegistry;
    use crate::store::{InMemoryKeyValueStore, KeyValueStore};
    use serde_json::json;
    use std::time::Duration;

    fn setup(limit: i64) -> (Arc<InMemoryKeyValueStore>, Arc<ConcurrencyLimitService>) {
        let store = Arc::new(InMemoryKeyValueStore::new());
        let registry = Arc::new(ResumeMetadataRegistry::new());
        let broker = Arc::new(InMemoryJobBroker::new(ResumeMetadataInjector::new(
            registry.clone(),
        )));
        let service = ConcurrencyLimitService::builder(
            store.clone() as Arc<dyn KeyValueStore>,
            broker,
        )
        .with_declarations(WorkerDeclarations::new().declare_with_limit("ExportWorker", move || limit))
        .with_resume_registry(registry)
        .build()
        .unwrap();
        (store, Arc::new(service))
    }

    fn worker() -> WorkerType {
        WorkerType::new("ExportWorker")
    }

    async fn wait_for_untracked(service: &ConcurrencyLimitService) {
        for _ in 0..100 {
            if service.concurrent_count(&worker()).await.unwrap() == 0 {
                return;
            }
            tokio::task::yield_now().await;
        }
        panic!("execution record was not released");
    }

    #[tokio::test]
    async fn test_tracks_while_running() {
        let (_, service) = setup(2);
        let mw = ExecutionMiddleware::new(service.clone());
        let slot = ExecutionSlot::new("host:1", "1");

        let svc = service.clone();
        let outcome = mw
            .perform(Job::new("ExportWorker", vec![json!(1)]), &slot, |job| async move {
                let running = svc.concurrent_count(&job.worker_type).await.unwrap();
                (job.args[0].clone(), running)
            })
            .await;

        assert_eq!(outcome, Execution::Performed((json!(1), 1)));
        assert_eq!(service.concurrent_count(&worker()).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_defers_at_capacity() {
        let (_, service) = setup(1);
        service
            .track_execution_start(&worker(), &ExecutionSlot::new("host:2", "9"))
            .await
            .unwrap();
        let mw = ExecutionMiddleware::new(service.clone());

        let outcome = mw
            .perform(Job::new("ExportWorker", vec![json!(1)]), &ExecutionSlot::new("host:1", "1"), |_| async {})
            .await;

        assert_eq!(
            outcome,
            Execution::Deferred(DeferReason::AtCapacity {
                limit: ConcurrencyLimit::new(1),
                concurrent: 1,
            })
        );
        let queued = service.queued_records(&worker(), 10).await.unwrap();
        assert_eq!(queued.len(), 1);
        assert_eq!(queued[0].args, vec![json!(1)]);
    }

    #[tokio::test]
    async fn test_defers_behind_queue_and_when_blocked() {
        let (_, service) = setup(5);
        let mw = ExecutionMiddleware::new(service.clone());
        let slot = ExecutionSlot::new("host:1", "1");

        service
            .add_to_queue(&Job::new("ExportWorker", vec![json!(0)]))
            .await
            .unwrap();
        let outcome = mw.perform(Job::new("ExportWorker", vec![]), &slot, |_| async {}).await;
        assert_eq!(outcome, Execution::Deferred(DeferReason::QueueNotEmpty));

        let (_, blocked) = setup(-1);
        let mw = ExecutionMiddleware::new(blocked);
        let outcome = mw.perform(Job::new("ExportWorker", vec![]), &slot, |_| async {}).await;
        assert_eq!(outcome, Execution::Deferred(DeferReason::Blocked));
    }

    #[tokio::test]
    async fn test_resumed_job_bypasses_limit() {
        let (_, service) = setup(1);
        service
            .track_execution_start(&worker(), &ExecutionSlot::new("host:2", "9"))
            .await
            .unwrap();
        service
            .add_to_queue(&Job::new("ExportWorker", vec![json!(0)]))
            .await
            .unwrap();
        let mw = ExecutionMiddleware::new(service.clone());

        let mut job = Job::new("ExportWorker", vec![json!(1)]);
        job.resumed = true;
        let outcome = mw
            .perform(job, &ExecutionSlot::new("host:1", "1"), |_| async { "done" })
            .await;

        assert_eq!(outcome.into_output(), Some("done"));
        assert_eq!(service.queue_size(&worker()).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_untracks_on_panic() {
        let (_, service) = setup(2);
        let mw = ExecutionMiddleware::new(service.clone());

        let handle = tokio::spawn(async move {
            mw.perform(Job::new("ExportWorker", vec![]), &ExecutionSlot::new("host:1", "1"), |_| async {
                panic!("job failed");
            })
            .await
        });
        assert!(handle.await.unwrap_err().is_panic());

        wait_for_untracked(&service).await;
    }

    #[tokio::test]
    async fn test_untracks_on_cancellation() {
        let (_, service) = setup(2);
        let mw = ExecutionMiddleware::new(service.clone());
        let slot = ExecutionSlot::new("host:1", "1");

        let perform = mw.perform(Job::new("ExportWorker", vec![]), &slot, |_| {
            std::future::pending::<()>()
        });
        let result = tokio::time::timeout(Duration::from_millis(20), perform).await;
        assert!(result.is_err());

        wait_for_untracked(&service).await;
    }

    #[test_log::test(tokio::test)]
    async fn test_store_outage_runs_untracked() {
        let (store, service) = setup(1);
        store.set_available(false);
        let mw = ExecutionMiddleware::new(service);

        let outcome = mw
            .perform(Job::new("ExportWorker", vec![]), &ExecutionSlot::new("host:1", "1"), |_| async { 42 })
            .await;
        assert_eq!(outcome, Execution::Performed(42));
    }
}
