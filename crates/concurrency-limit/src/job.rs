//! Job payload types seen by the middleware

use std::fmt;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// Free-form JSON object carried alongside a job
///
/// Holds the submission context (correlation id, caller, tracing fields) and
/// replication markers.
pub type JobContext = Map<String, Value>;

/// Context key holding the request correlation id
pub const CORRELATION_ID_KEY: &str = "correlation_id";

/// Named class of background job sharing one concurrency limit
///
/// The name is case-sensitive. Store keys derive from
/// [`key_component`](Self::key_component).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkerType(String);

impl WorkerType {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Normalized form used inside store keys
    ///
    /// `::` becomes `/`, camel case becomes snake case and dashes become
    /// underscores: `Export::CsvWorker` maps to `export/csv_worker`.
    pub fn key_component(&self) -> String {
        let source = self.0.replace("::", "/");
        let chars: Vec<char> = source.chars().collect();
        let mut out = String::with_capacity(source.len() + 4);

        for (i, &c) in chars.iter().enumerate() {
            if c.is_ascii_uppercase() && i > 0 {
                let prev = chars[i - 1];
                let next_is_lower = chars.get(i + 1).is_some_and(|n| n.is_ascii_lowercase());
                if prev.is_ascii_lowercase()
                    || prev.is_ascii_digit()
                    || (prev.is_ascii_uppercase() && next_is_lower)
                {
                    out.push('_');
                }
            }
            if c == '-' {
                out.push('_');
            } else {
                out.push(c.to_ascii_lowercase());
            }
        }

        out
    }
}

impl fmt::Display for WorkerType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for WorkerType {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

impl From<String> for WorkerType {
    fn from(name: String) -> Self {
        Self(name)
    }
}

/// A job as it passes through the middleware
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    /// Job identifier, assigned at submission
    pub jid: String,

    /// Worker type that performs this job
    pub worker_type: WorkerType,

    /// Positional arguments
    pub args: Vec<Value>,

    /// Submission context
    #[serde(default)]
    pub context: JobContext,

    /// Write-position markers for consistent replica reads
    #[serde(default)]
    pub replication_markers: JobContext,

    /// Set when the job was resubmitted by a resume cycle
    #[serde(default)]
    pub resumed: bool,

    /// When the job was deferred, in unix seconds (resumed jobs only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub buffered_at: Option<f64>,
}

impl Job {
    /// Create a job with a fresh identifier
    pub fn new(worker_type: impl Into<WorkerType>, args: Vec<Value>) -> Self {
        Self {
            jid: Uuid::now_v7().to_string(),
            worker_type: worker_type.into(),
            args,
            context: JobContext::new(),
            replication_markers: JobContext::new(),
            resumed: false,
            buffered_at: None,
        }
    }

    /// Set the submission context
    pub fn with_context(mut self, context: JobContext) -> Self {
        self.context = context;
        self
    }

    /// Set a single context field
    pub fn with_context_field(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }

    /// Set the replication markers
    pub fn with_replication_markers(mut self, markers: JobContext) -> Self {
        self.replication_markers = markers;
        self
    }

    /// Whether this job was resubmitted by a resume cycle
    pub fn is_resumed(&self) -> bool {
        self.resumed
    }

    /// Correlation id from the submission context, if any
    pub fn correlation_id(&self) -> Option<&str> {
        self.context.get(CORRELATION_ID_KEY).and_then(Value::as_str)
    }
}

/// Current wall-clock time in fractional unix seconds
pub(crate) fn epoch_seconds_now() -> f64 {
    Utc::now().timestamp_millis() as f64 / 1000.0
}
