//! Concurrency limit service facade
//!
//! Wires the limit source, execution tracker and queue manager over one keyed
//! store and exposes the operations the middleware and the maintenance
//! scheduler need.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, instrument};

use crate::broker::JobBroker;
use crate::config::ConcurrencyLimitConfig;
use crate::error::ConcurrencyLimitError;
use crate::job::{Job, WorkerType};
use crate::limit::{
    ConcurrencyLimit, LimitSource, LimitStore, StaticRegistryLimitSource, StaticWorkerRegistry,
    StoreBackedLimitSource, WorkerDeclarations,
};
use crate::middleware::ResumeMetadataInjector;
use crate::queue::{DeferredJobRecord, QueueManager, ResumeOutcome};
use crate::resume::ResumeMetadataRegistry;
use crate::store::{KeyValueStore, StoreError, StoreKeys};
use crate::tracker::{ExecutionRecord, ExecutionSlot, ExecutionTracker, LivenessProbe, LocalWorkRegistry};

/// Operator-facing gauges for one worker type
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WorkerTypeStats {
    pub worker_type: WorkerType,
    pub limit: ConcurrencyLimit,
    pub concurrent: u64,
    pub queued: u64,
    pub deferred_total: u64,
}

/// Facade over limits, execution tracking and the overflow queue
///
/// # Example
///
/// ```ignore
/// let registry = Arc::new(ResumeMetadataRegistry::new());
/// let broker = Arc::new(MyBroker::new(ResumeMetadataInjector::new(registry.clone())));
///
/// let service = ConcurrencyLimitService::builder(store, broker)
///     .with_declarations(
///         WorkerDeclarations::new().declare_with_limit("ExportWorker", || 2),
///     )
///     .with_resume_registry(registry)
///     .build()?;
/// ```
pub struct ConcurrencyLimitService {
    config: ConcurrencyLimitConfig,
    limits: LimitStore,
    limit_source: Arc<dyn LimitSource>,
    tracker: Arc<ExecutionTracker>,
    queue: QueueManager,
    resume_registry: Arc<ResumeMetadataRegistry>,
}

impl ConcurrencyLimitService {
    /// Start building a service over `store`, resubmitting through `broker`
    pub fn builder(
        store: Arc<dyn KeyValueStore>,
        broker: Arc<dyn JobBroker>,
    ) -> ConcurrencyLimitServiceBuilder {
        ConcurrencyLimitServiceBuilder::new(store, broker)
    }

    pub fn config(&self) -> &ConcurrencyLimitConfig {
        &self.config
    }

    /// Registry the broker's injector must share with this service
    pub fn resume_registry(&self) -> &Arc<ResumeMetadataRegistry> {
        &self.resume_registry
    }

    /// Injector bound to this service's resume registry
    pub fn injector(&self) -> ResumeMetadataInjector {
        ResumeMetadataInjector::new(Arc::clone(&self.resume_registry))
    }

    /// Worker types known to the limit source
    pub fn worker_types(&self) -> Vec<WorkerType> {
        self.limit_source.worker_types()
    }

    // =========================================================================
    // Limits
    // =========================================================================

    pub async fn current_limit(
        &self,
        worker_type: &WorkerType,
    ) -> Result<ConcurrencyLimit, StoreError> {
        self.limit_source.current_limit(worker_type).await
    }

    /// Override the limit for `ttl`
    ///
    /// Only the store-backed limit source reads overrides; with a static
    /// registry the value is written but has no effect.
    #[instrument(skip(self, worker_type), fields(worker_type = %worker_type))]
    pub async fn set_limit(
        &self,
        worker_type: &WorkerType,
        limit: ConcurrencyLimit,
        ttl: Duration,
    ) -> Result<(), StoreError> {
        self.limits.set(worker_type, limit, ttl).await?;
        debug!(%limit, ?ttl, "Limit override set");
        Ok(())
    }

    /// Drop the override, falling back to the declared default
    pub async fn clear_limit(&self, worker_type: &WorkerType) -> Result<bool, StoreError> {
        self.limits.clear(worker_type).await
    }

    // =========================================================================
    // Execution tracking
    // =========================================================================

    pub async fn concurrent_count(&self, worker_type: &WorkerType) -> Result<u64, StoreError> {
        self.tracker.concurrent_count(worker_type).await
    }

    pub async fn track_execution_start(
        &self,
        worker_type: &WorkerType,
        slot: &ExecutionSlot,
    ) -> Result<(), StoreError> {
        self.tracker.track_start(worker_type, slot).await
    }

    pub async fn track_execution_end(
        &self,
        worker_type: &WorkerType,
        slot: &ExecutionSlot,
    ) -> Result<bool, StoreError> {
        self.tracker.track_end(worker_type, slot).await
    }

    pub async fn executions(
        &self,
        worker_type: &WorkerType,
    ) -> Result<Vec<ExecutionRecord>, StoreError> {
        self.tracker.executions(worker_type).await
    }

    pub async fn cleanup_stale(&self, worker_type: &WorkerType) -> Result<usize, StoreError> {
        self.tracker.cleanup_stale(worker_type).await
    }

    pub(crate) fn tracker(&self) -> &Arc<ExecutionTracker> {
        &self.tracker
    }

    // =========================================================================
    // Overflow queue
    // =========================================================================

    /// Defer a job to the tail of its overflow queue
    pub async fn add_to_queue(&self, job: &Job) -> Result<u64, ConcurrencyLimitError> {
        self.queue.enqueue(job).await
    }

    pub async fn queue_size(&self, worker_type: &WorkerType) -> Result<u64, StoreError> {
        self.queue.queue_size(worker_type).await
    }

    pub async fn has_queued_jobs(&self, worker_type: &WorkerType) -> Result<bool, StoreError> {
        self.queue.has_queued_jobs(worker_type).await
    }

    pub async fn queued_records(
        &self,
        worker_type: &WorkerType,
        count: usize,
    ) -> Result<Vec<DeferredJobRecord>, StoreError> {
        self.queue.queued_records(worker_type, count).await
    }

    pub async fn dead_letter_count(&self, worker_type: &WorkerType) -> Result<u64, StoreError> {
        self.queue.dead_letter_count(worker_type).await
    }

    /// Run one resume cycle for `worker_type`
    pub async fn resume_processing(
        &self,
        worker_type: &WorkerType,
        capacity_hint: Option<u64>,
    ) -> Result<ResumeOutcome, ConcurrencyLimitError> {
        self.queue.resume(worker_type, capacity_hint).await
    }

    pub async fn stats(&self, worker_type: &WorkerType) -> Result<WorkerTypeStats, StoreError> {
        Ok(WorkerTypeStats {
            worker_type: worker_type.clone(),
            limit: self.current_limit(worker_type).await?,
            concurrent: self.concurrent_count(worker_type).await?,
            queued: self.queue_size(worker_type).await?,
            deferred_total: self.queue.deferred_total(worker_type).await?,
        })
    }
}

/// Builder for [`ConcurrencyLimitService`]
pub struct ConcurrencyLimitServiceBuilder {
    store: Arc<dyn KeyValueStore>,
    broker: Arc<dyn JobBroker>,
    config: ConcurrencyLimitConfig,
    limits: LimitChoice,
    probe: Option<Arc<dyn LivenessProbe>>,
    resume_registry: Option<Arc<ResumeMetadataRegistry>>,
}

enum LimitChoice {
    Declarations(WorkerDeclarations),
    StaticRegistry(StaticWorkerRegistry),
    Custom(Arc<dyn LimitSource>),
}

impl ConcurrencyLimitServiceBuilder {
    fn new(store: Arc<dyn KeyValueStore>, broker: Arc<dyn JobBroker>) -> Self {
        Self {
            store,
            broker,
            config: ConcurrencyLimitConfig::default(),
            limits: LimitChoice::Declarations(WorkerDeclarations::new()),
            probe: None,
            resume_registry: None,
        }
    }

    pub fn with_config(mut self, config: ConcurrencyLimitConfig) -> Self {
        self.config = config;
        self
    }

    /// Resolve limits from store overrides over these declarations
    pub fn with_declarations(mut self, declarations: WorkerDeclarations) -> Self {
        self.limits = LimitChoice::Declarations(declarations);
        self
    }

    /// Resolve limits from process-local capacity functions
    pub fn with_static_registry(mut self, registry: StaticWorkerRegistry) -> Self {
        self.limits = LimitChoice::StaticRegistry(registry);
        self
    }

    pub fn with_limit_source(mut self, source: Arc<dyn LimitSource>) -> Self {
        self.limits = LimitChoice::Custom(source);
        self
    }

    /// Live-work registry consulted by stale cleanup
    ///
    /// Defaults to an empty [`LocalWorkRegistry`], which treats every stale
    /// record as abandoned.
    pub fn with_liveness_probe(mut self, probe: Arc<dyn LivenessProbe>) -> Self {
        self.probe = Some(probe);
        self
    }

    /// Share a resume registry with the broker's injector
    pub fn with_resume_registry(mut self, registry: Arc<ResumeMetadataRegistry>) -> Self {
        self.resume_registry = Some(registry);
        self
    }

    pub fn build(self) -> Result<ConcurrencyLimitService, ConcurrencyLimitError> {
        self.config.validate()?;

        let keys = StoreKeys::new(self.config.key_prefix.clone());
        let limits = LimitStore::new(Arc::clone(&self.store), keys.clone());
        let limit_source: Arc<dyn LimitSource> = match self.limits {
            LimitChoice::Declarations(declarations) => Arc::new(StoreBackedLimitSource::new(
                Arc::new(declarations),
                limits.clone(),
            )),
            LimitChoice::StaticRegistry(registry) => {
                Arc::new(StaticRegistryLimitSource::new(Arc::new(registry)))
            }
            LimitChoice::Custom(source) => source,
        };

        let probe = self
            .probe
            .unwrap_or_else(|| Arc::new(LocalWorkRegistry::new()));
        let tracker = Arc::new(ExecutionTracker::new(
            Arc::clone(&self.store),
            keys,
            self.config.tracking_ttl,
            probe,
        ));
        let resume_registry = self
            .resume_registry
            .unwrap_or_else(|| Arc::new(ResumeMetadataRegistry::new()));

        let queue = QueueManager::new(
            self.store,
            self.config.clone(),
            Arc::clone(&limit_source),
            Arc::clone(&tracker),
            self.broker,
            Arc::clone(&resume_registry),
        );

        Ok(ConcurrencyLimitService {
            config: self.config,
            limits,
            limit_source,
            tracker,
            queue,
            resume_registry,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::InMemoryJobBroker;
    use crate::store::InMemoryKeyValueStore;
    use serde_json::json;

    fn service(declarations: WorkerDeclarations) -> ConcurrencyLimitService {
        let registry = Arc::new(ResumeMetadataRegistry::new());
        let broker = Arc::new(InMemoryJobBroker::new(ResumeMetadataInjector::new(
            registry.clone(),
        )));
        ConcurrencyLimitService::builder(Arc::new(InMemoryKeyValueStore::new()), broker)
            .with_declarations(declarations)
            .with_resume_registry(registry)
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn test_limit_override_and_fallback() {
        let svc = service(WorkerDeclarations::new().declare_with_limit("ExportWorker", || 3));
        let worker = WorkerType::new("ExportWorker");

        assert_eq!(svc.current_limit(&worker).await.unwrap(), ConcurrencyLimit::new(3));

        svc.set_limit(&worker, ConcurrencyLimit::new(1), Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(svc.current_limit(&worker).await.unwrap(), ConcurrencyLimit::new(1));

        assert!(svc.clear_limit(&worker).await.unwrap());
        assert_eq!(svc.current_limit(&worker).await.unwrap(), ConcurrencyLimit::new(3));
    }

    #[tokio::test]
    async fn test_undeclared_worker_is_unlimited() {
        let svc = service(WorkerDeclarations::new());
        let worker = WorkerType::new("Unknown::Worker");

        assert!(svc.current_limit(&worker).await.unwrap().is_unlimited());
        assert_eq!(
            svc.resume_processing(&worker, None).await.unwrap(),
            ResumeOutcome::Unresolved
        );
    }

    #[tokio::test]
    async fn test_stats() {
        let svc = service(WorkerDeclarations::new().declare_with_limit("ExportWorker", || 2));
        let worker = WorkerType::new("ExportWorker");

        svc.track_execution_start(&worker, &ExecutionSlot::new("host:1", "7"))
            .await
            .unwrap();
        svc.add_to_queue(&Job::new("ExportWorker", vec![json!(1)]))
            .await
            .unwrap();
        svc.add_to_queue(&Job::new("ExportWorker", vec![json!(2)]))
            .await
            .unwrap();

        let stats = svc.stats(&worker).await.unwrap();
        assert_eq!(
            stats,
            WorkerTypeStats {
                worker_type: worker.clone(),
                limit: ConcurrencyLimit::new(2),
                concurrent: 1,
                queued: 2,
                deferred_total: 2,
            }
        );
        assert_eq!(
            serde_json::to_value(&stats).unwrap()["limit"],
            json!(2)
        );
    }

    #[test]
    fn test_build_rejects_invalid_config() {
        let registry = Arc::new(ResumeMetadataRegistry::new());
        let broker = Arc::new(InMemoryJobBroker::new(ResumeMetadataInjector::new(registry)));
        let result = ConcurrencyLimitService::builder(Arc::new(InMemoryKeyValueStore::new()), broker)
            .with_config(ConcurrencyLimitConfig::default().with_key_prefix(""))
            .build();

        assert!(matches!(result, Err(ConcurrencyLimitError::InvalidConfig(_))));
    }
}
