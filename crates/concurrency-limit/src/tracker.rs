//! Live execution tracking
//!
//! One store hash per worker type maps `<processId>:tid:<threadId>` to the
//! start time (unix seconds) of the job running in that slot. Each running
//! job owns its own slot. The hash size
//! is the fleet-wide concurrent count.
//!
//! Records left behind by crashed workers are removed by
//! [`ExecutionTracker::cleanup_stale`]. Age alone never deletes a record: a
//! record past `tracking_ttl` is only a candidate, and is removed once the
//! job runtime's live-work registry confirms the slot is no longer running
//! the worker type.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tracing::{debug, info, instrument, warn};

use crate::job::{epoch_seconds_now, WorkerType};
use crate::store::{KeyValueStore, StoreError, StoreKeys};

const THREAD_SEPARATOR: &str = ":tid:";

/// Identity of one execution slot
///
/// A `(process, thread)` pair as written to the store. The thread component
/// names one running job, not an OS thread: many jobs share a runtime
/// worker thread, and each of them needs its own record.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ExecutionSlot {
    process_id: String,
    thread_id: String,
}

static NEXT_SLOT: AtomicU64 = AtomicU64::new(1);

impl ExecutionSlot {
    pub fn new(process_id: impl Into<String>, thread_id: impl Into<String>) -> Self {
        Self {
            process_id: process_id.into(),
            thread_id: thread_id.into(),
        }
    }

    /// A fresh slot for one job run in this process
    ///
    /// The process id is `<hostname>:<pid>`, using `HOSTNAME` when set. The
    /// thread id combines the current tokio task id (or the OS thread id
    /// outside a runtime) with a process-wide sequence number, so every call
    /// returns a distinct slot. Keep the returned slot for the whole run and
    /// register that same value with the [`LivenessProbe`].
    pub fn current() -> Self {
        let host = std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string());
        let seq = NEXT_SLOT.fetch_add(1, Ordering::Relaxed);
        let owner = match tokio::task::try_id() {
            Some(task) => format!("task-{}", task),
            None => {
                let thread: String = format!("{:?}", std::thread::current().id())
                    .chars()
                    .filter(char::is_ascii_digit)
                    .collect();
                format!("thread-{}", thread)
            }
        };
        Self::new(
            format!("{}:{}", host, std::process::id()),
            format!("{}.{}", owner, seq),
        )
    }

    pub fn process_id(&self) -> &str {
        &self.process_id
    }

    pub fn thread_id(&self) -> &str {
        &self.thread_id
    }

    /// Hash field for this slot
    pub fn field(&self) -> String {
        format!("{}{}{}", self.process_id, THREAD_SEPARATOR, self.thread_id)
    }

    /// Parse a hash field back into a slot
    ///
    /// The process id may itself contain `:`; the last `:tid:` separates it
    /// from the thread id.
    pub fn parse(field: &str) -> Option<Self> {
        let (process_id, thread_id) = field.rsplit_once(THREAD_SEPARATOR)?;
        if process_id.is_empty() || thread_id.is_empty() {
            return None;
        }
        Some(Self::new(process_id, thread_id))
    }
}

impl fmt::Display for ExecutionSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}{}", self.process_id, THREAD_SEPARATOR, self.thread_id)
    }
}

/// One tracked execution
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionRecord {
    pub slot: ExecutionSlot,
    /// Start time in unix seconds
    pub started_at: f64,
}

/// The job runtime's live-work registry
///
/// Implementations answer whether a slot is still executing a job of the
/// given worker type. When the answer is uncertain (e.g. the registry itself
/// is unreachable) they must return `true`; the tracker only ever deletes on
/// a definite `false`.
#[async_trait]
pub trait LivenessProbe: Send + Sync + 'static {
    async fn is_still_executing(
        &self,
        process_id: &str,
        thread_id: &str,
        worker_type: &WorkerType,
    ) -> bool;
}

/// Process-local live-work registry
///
/// For single-process deployments and tests: the runtime registers a slot
/// when it starts a job and unregisters it when the job ends.
#[derive(Debug, Default)]
pub struct LocalWorkRegistry {
    running: DashMap<ExecutionSlot, WorkerType>,
}

impl LocalWorkRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, slot: ExecutionSlot, worker_type: WorkerType) {
        self.running.insert(slot, worker_type);
    }

    pub fn unregister(&self, slot: &ExecutionSlot) {
        self.running.remove(slot);
    }

    pub fn len(&self) -> usize {
        self.running.len()
    }

    pub fn is_empty(&self) -> bool {
        self.running.is_empty()
    }
}

#[async_trait]
impl LivenessProbe for LocalWorkRegistry {
    async fn is_still_executing(
        &self,
        process_id: &str,
        thread_id: &str,
        worker_type: &WorkerType,
    ) -> bool {
        self.running
            .get(&ExecutionSlot::new(process_id, thread_id))
            .is_some_and(|running| running.value() == worker_type)
    }
}

/// Durable registry of running job slots per worker type
pub struct ExecutionTracker {
    store: Arc<dyn KeyValueStore>,
    keys: StoreKeys,
    tracking_ttl: Duration,
    probe: Arc<dyn LivenessProbe>,
}

impl ExecutionTracker {
    pub fn new(
        store: Arc<dyn KeyValueStore>,
        keys: StoreKeys,
        tracking_ttl: Duration,
        probe: Arc<dyn LivenessProbe>,
    ) -> Self {
        Self {
            store,
            keys,
            tracking_ttl,
            probe,
        }
    }

    /// Record that `slot` started a job of `worker_type`
    pub async fn track_start(
        &self,
        worker_type: &WorkerType,
        slot: &ExecutionSlot,
    ) -> Result<(), StoreError> {
        self.store
            .hash_set(
                &self.keys.executing(worker_type),
                &slot.field(),
                &epoch_seconds_now().to_string(),
            )
            .await
    }

    /// Remove the record for `slot`
    pub async fn track_end(
        &self,
        worker_type: &WorkerType,
        slot: &ExecutionSlot,
    ) -> Result<bool, StoreError> {
        self.store
            .hash_delete(&self.keys.executing(worker_type), &slot.field())
            .await
    }

    /// Number of jobs currently executing fleet-wide
    pub async fn concurrent_count(&self, worker_type: &WorkerType) -> Result<u64, StoreError> {
        self.store.hash_len(&self.keys.executing(worker_type)).await
    }

    /// Every tracked execution, oldest first
    ///
    /// Fields that cannot be parsed are skipped here; `cleanup_stale` still
    /// sees them.
    pub async fn executions(
        &self,
        worker_type: &WorkerType,
    ) -> Result<Vec<ExecutionRecord>, StoreError> {
        let raw = self
            .store
            .hash_get_all(&self.keys.executing(worker_type))
            .await?;
        let mut records: Vec<_> = raw
            .iter()
            .filter_map(|(field, started)| {
                Some(ExecutionRecord {
                    slot: ExecutionSlot::parse(field)?,
                    started_at: started.parse().ok()?,
                })
            })
            .collect();
        records.sort_by(|a, b| a.started_at.total_cmp(&b.started_at));
        Ok(records)
    }

    /// Remove records for slots that stopped running without `track_end`
    ///
    /// Returns the number of records removed.
    #[instrument(skip(self, worker_type), fields(worker_type = %worker_type))]
    pub async fn cleanup_stale(&self, worker_type: &WorkerType) -> Result<usize, StoreError> {
        let key = self.keys.executing(worker_type);
        let raw: HashMap<String, String> = self.store.hash_get_all(&key).await?;
        if raw.is_empty() {
            return Ok(0);
        }

        let cutoff = epoch_seconds_now() - self.tracking_ttl.as_secs_f64();
        let mut removed = 0;

        for (field, started) in raw {
            // Unparsable timestamps are always candidates
            let is_candidate = started.parse::<f64>().map_or(true, |t| t < cutoff);
            if !is_candidate {
                continue;
            }

            let still_running = match ExecutionSlot::parse(&field) {
                Some(slot) => {
                    self.probe
                        .is_still_executing(slot.process_id(), slot.thread_id(), worker_type)
                        .await
                }
                None => {
                    warn!(field = %field, "Malformed execution record field");
                    false
                }
            };

            if still_running {
                debug!(field = %field, "Execution record past TTL but still running");
                continue;
            }

            // The slot may have started a new job since the read
            if self.store.hash_delete_if_equals(&key, &field, &started).await? {
                removed += 1;
            } else {
                debug!(field = %field, "Execution record changed during cleanup, kept");
            }
        }

        if removed > 0 {
            info!(removed, "Removed stale execution records");
        }
        Ok(removed)
    }
}
