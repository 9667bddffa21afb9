//! Shared fixtures for the integration tests
#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use everruns_concurrency_limit::limit::WorkerDeclarations;
use everruns_concurrency_limit::store::StoreKeys;
use everruns_concurrency_limit::{
    BrokerError, ConcurrencyLimitConfig, ConcurrencyLimitService, InMemoryJobBroker,
    InMemoryKeyValueStore, Job, JobBroker, KeyValueStore, ResumeMetadataInjector,
    ResumeMetadataRegistry, StaticWorkerRegistry, WorkerType,
};

pub const WORKER: &str = "Reports::ExportWorker";

pub fn worker() -> WorkerType {
    WorkerType::new(WORKER)
}

/// Broker that takes `delay` per bulk call, to exercise the resume deadline
pub struct DelayedBroker {
    pub inner: Arc<InMemoryJobBroker>,
    pub delay: Duration,
}

#[async_trait]
impl JobBroker for DelayedBroker {
    async fn bulk_submit(
        &self,
        worker_type: &WorkerType,
        args: Vec<Vec<Value>>,
    ) -> Result<(), BrokerError> {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.inner.bulk_submit(worker_type, args).await
    }
}

pub struct Harness {
    pub store: Arc<InMemoryKeyValueStore>,
    pub broker: Arc<InMemoryJobBroker>,
    pub registry: Arc<ResumeMetadataRegistry>,
    pub service: Arc<ConcurrencyLimitService>,
}

pub enum Limits {
    Declared(WorkerDeclarations),
    Static(StaticWorkerRegistry),
}

impl Harness {
    /// Store-backed limits with `WORKER` declared at `limit`
    pub fn with_limit(limit: i64) -> Self {
        Self::build(
            Limits::Declared(WorkerDeclarations::new().declare_with_limit(WORKER, move || limit)),
            ConcurrencyLimitConfig::default(),
            Duration::ZERO,
        )
    }

    pub fn build(limits: Limits, config: ConcurrencyLimitConfig, broker_delay: Duration) -> Self {
        let store = Arc::new(InMemoryKeyValueStore::new());
        let registry = Arc::new(ResumeMetadataRegistry::new());
        let broker = Arc::new(InMemoryJobBroker::new(ResumeMetadataInjector::new(
            registry.clone(),
        )));
        let delayed = Arc::new(DelayedBroker {
            inner: broker.clone(),
            delay: broker_delay,
        });

        let builder = ConcurrencyLimitService::builder(store.clone() as Arc<dyn KeyValueStore>, delayed)
            .with_config(config)
            .with_resume_registry(registry.clone());
        let builder = match limits {
            Limits::Declared(declarations) => builder.with_declarations(declarations),
            Limits::Static(static_registry) => builder.with_static_registry(static_registry),
        };

        Self {
            store,
            broker,
            registry,
            service: Arc::new(builder.build().unwrap()),
        }
    }

    pub fn keys(&self) -> StoreKeys {
        StoreKeys::new(self.service.config().key_prefix.clone())
    }

    /// Defer `count` jobs whose single argument is their sequence number
    pub async fn enqueue_numbered(&self, count: usize) {
        for i in 0..count {
            let job = Job::new(WORKER, vec![json!(i)])
                .with_context_field("correlation_id", format!("req-{}", i));
            self.service.add_to_queue(&job).await.unwrap();
        }
    }

    pub async fn queued_args(&self) -> Vec<Value> {
        self.service
            .queued_records(&worker(), usize::MAX)
            .await
            .unwrap()
            .into_iter()
            .map(|record| record.args[0].clone())
            .collect()
    }
}
