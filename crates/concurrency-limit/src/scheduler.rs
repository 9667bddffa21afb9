//! Periodic maintenance: stale cleanup and overflow resume
//!
//! One background task ticks every `maintenance_interval`. Each tick first
//! removes abandoned execution records for every known worker type, then runs
//! a resume cycle for each worker type with queued jobs. A failing worker type is
//! logged and retried on the next tick; it never stops the others.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, instrument, warn};

use crate::error::ConcurrencyLimitError;
use crate::queue::ResumeOutcome;
use crate::service::ConcurrencyLimitService;

/// Totals from one maintenance pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MaintenanceReport {
    /// Execution records removed by stale cleanup
    pub stale_removed: usize,
    /// Jobs resubmitted from overflow queues
    pub resumed: usize,
    /// Resume cycles skipped because another process held the lease
    pub skipped: usize,
    /// Worker types whose cleanup or resume failed
    pub failures: usize,
}

/// Background driver for [`ConcurrencyLimitService`] maintenance
///
/// # Example
///
/// ```ignore
/// let scheduler = MaintenanceScheduler::new(service.clone());
/// scheduler.start()?;
///
/// // ... later
/// scheduler.shutdown().await;
/// ```
pub struct MaintenanceScheduler {
    service: Arc<ConcurrencyLimitService>,
    interval: Duration,
    shutdown_tx: watch::Sender<bool>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl MaintenanceScheduler {
    /// Scheduler ticking at the service's configured `maintenance_interval`
    pub fn new(service: Arc<ConcurrencyLimitService>) -> Self {
        let interval = service.config().maintenance_interval;
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            service,
            interval,
            shutdown_tx,
            handle: Mutex::new(None),
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn is_running(&self) -> bool {
        self.handle
            .lock()
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    /// Run a single maintenance pass in the caller's task
    pub async fn run_once(&self) -> MaintenanceReport {
        run_pass(&self.service).await
    }

    /// Spawn the maintenance loop
    pub fn start(&self) -> Result<(), ConcurrencyLimitError> {
        let mut slot = self.handle.lock();
        if slot.as_ref().is_some_and(|handle| !handle.is_finished()) {
            return Err(ConcurrencyLimitError::AlreadyRunning);
        }

        self.shutdown_tx.send_replace(false);
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let service = Arc::clone(&self.service);
        let interval = self.interval;

        info!(interval_ms = interval.as_millis() as u64, "Starting maintenance scheduler");

        *slot = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let report = run_pass(&service).await;
                        if report.resumed > 0 || report.stale_removed > 0 {
                            info!(
                                resumed = report.resumed,
                                stale_removed = report.stale_removed,
                                "Maintenance pass completed"
                            );
                        }
                    }
                    _ = shutdown_rx.changed() => {
                        debug!("Maintenance loop: shutdown requested");
                        break;
                    }
                }
            }

            debug!("Maintenance loop exited");
        }));

        Ok(())
    }

    /// Stop the loop, waiting for an in-progress pass to finish
    pub async fn shutdown(&self) {
        let handle = self.handle.lock().take();
        let Some(handle) = handle else {
            return;
        };

        let _ = self.shutdown_tx.send(true);
        if let Err(e) = handle.await {
            error!("Maintenance loop terminated abnormally: {}", e);
        }
        info!("Maintenance scheduler stopped");
    }
}

#[instrument(skip_all)]
async fn run_pass(service: &ConcurrencyLimitService) -> MaintenanceReport {
    let mut report = MaintenanceReport::default();
    let worker_types = service.worker_types();

    // Cleanup is cheap; a long resume for one worker type must not hold it
    // back for the others
    for worker_type in &worker_types {
        match service.cleanup_stale(worker_type).await {
            Ok(removed) => report.stale_removed += removed,
            Err(e) => {
                report.failures += 1;
                warn!(%worker_type, error = %e, "Stale execution cleanup failed");
            }
        }
    }

    for worker_type in &worker_types {
        match service.has_queued_jobs(worker_type).await {
            Ok(true) => {}
            Ok(false) => continue,
            Err(e) => {
                report.failures += 1;
                warn!(%worker_type, error = %e, "Failed to read overflow queue size");
                continue;
            }
        }

        match service.resume_processing(worker_type, None).await {
            Ok(ResumeOutcome::Resumed { count, .. }) => report.resumed += count,
            Ok(ResumeOutcome::Skipped) => report.skipped += 1,
            Ok(ResumeOutcome::Unresolved) => {}
            Err(e) => {
                report.failures += 1;
                error!(%worker_type, error = %e, "Resume cycle failed");
            }
        }
    }

    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{BrokerError, InMemoryJobBroker, JobBroker};
    use crate::job::{Job, WorkerType};
    use crate::limit::WorkerDeclarations;
    use crate::middleware::ResumeMetadataInjector;
    use crate::resume::ResumeMetadataRegistry;
    use crate::store::{InMemoryKeyValueStore, KeyValueStore, StoreKeys};
    use crate::tracker::LivenessProbe;
    use serde_json::json;

    fn setup() -> (Arc<InMemoryJobBroker>, Arc<ConcurrencyLimitService>) {
        let registry = Arc::new(ResumeMetadataRegistry::new());
        let broker = Arc::new(InMemoryJobBroker::new(ResumeMetadataInjector::new(
            registry.clone(),
        )));
        let service = ConcurrencyLimitService::builder(
            Arc::new(InMemoryKeyValueStore::new()),
            broker.clone(),
        )
        .with_declarations(
            WorkerDeclarations::new()
                .declare_with_limit("ExportWorker", || 2)
                .declare("MailerWorker"),
        )
        .with_resume_registry(registry)
        .build()
        .unwrap();
        (broker, Arc::new(service))
    }

    #[tokio::test]
    async fn test_run_once_resumes_every_worker_type() {
        let (broker, service) = setup();
        for i in 0..3 {
            service
                .add_to_queue(&Job::new("ExportWorker", vec![json!(i)]))
                .await
                .unwrap();
        }
        service
            .add_to_queue(&Job::new("MailerWorker", vec![json!("hello")]))
            .await
            .unwrap();

        let report = MaintenanceScheduler::new(service.clone()).run_once().await;

        // Export is capped at its limit of 2; mailer is unlimited
        assert_eq!(report.resumed, 3);
        assert_eq!(report.failures, 0);
        assert_eq!(service.queue_size(&WorkerType::new("ExportWorker")).await.unwrap(), 1);
        assert_eq!(broker.pending_count(), 3);
    }

    /// Logs probe calls and submissions in the order they happen
    struct EventLog(Arc<parking_lot::Mutex<Vec<String>>>);

    #[async_trait::async_trait]
    impl LivenessProbe for EventLog {
        async fn is_still_executing(&self, _: &str, _: &str, worker_type: &WorkerType) -> bool {
            self.0.lock().push(format!("probe:{}", worker_type));
            false
        }
    }

    struct LoggingBroker {
        events: Arc<parking_lot::Mutex<Vec<String>>>,
        injector: ResumeMetadataInjector,
    }

    #[async_trait::async_trait]
    impl JobBroker for LoggingBroker {
        async fn bulk_submit(
            &self,
            worker_type: &WorkerType,
            args: Vec<Vec<serde_json::Value>>,
        ) -> Result<(), BrokerError> {
            for args in args {
                let mut job = Job::new(worker_type.clone(), args);
                self.injector.inject(&mut job);
            }
            self.events.lock().push(format!("submit:{}", worker_type));
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_cleanup_runs_for_all_worker_types_before_resume() {
        let events = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let registry = Arc::new(ResumeMetadataRegistry::new());
        let broker = Arc::new(LoggingBroker {
            events: events.clone(),
            injector: ResumeMetadataInjector::new(registry.clone()),
        });
        let store = Arc::new(InMemoryKeyValueStore::new());
        let service = ConcurrencyLimitService::builder(store.clone(), broker)
            .with_declarations(
                WorkerDeclarations::new()
                    .declare("ExportWorker")
                    .declare("MailerWorker"),
            )
            .with_liveness_probe(Arc::new(EventLog(events.clone())))
            .with_resume_registry(registry)
            .build()
            .unwrap();

        let keys = StoreKeys::default();
        for name in ["ExportWorker", "MailerWorker"] {
            let worker = WorkerType::new(name);
            store
                .hash_set(&keys.executing(&worker), "host:1:tid:1", "1000.0")
                .await
                .unwrap();
            service
                .add_to_queue(&Job::new(name, vec![json!(1)]))
                .await
                .unwrap();
        }

        let report = MaintenanceScheduler::new(Arc::new(service)).run_once().await;
        assert_eq!(report.stale_removed, 2);
        assert_eq!(report.resumed, 2);

        let events = events.lock().clone();
        let last_probe = events.iter().rposition(|e| e.starts_with("probe:")).unwrap();
        let first_submit = events.iter().position(|e| e.starts_with("submit:")).unwrap();
        assert!(last_probe < first_submit, "events: {:?}", events);
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_and_shutdown() {
        let (broker, service) = setup();
        service
            .add_to_queue(&Job::new("MailerWorker", vec![json!(1)]))
            .await
            .unwrap();

        let scheduler = MaintenanceScheduler::new(service.clone())
            .with_interval(Duration::from_millis(100));
        scheduler.start().unwrap();
        assert!(matches!(
            scheduler.start(),
            Err(ConcurrencyLimitError::AlreadyRunning)
        ));

        tokio::time::sleep(Duration::from_millis(250)).await;
        assert_eq!(broker.pending_count(), 1);

        scheduler.shutdown().await;
        assert!(!scheduler.is_running());

        // Restartable after shutdown
        scheduler.start().unwrap();
        scheduler.shutdown().await;
    }
}
