//! Deferred job wire format

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::job::{Job, JobContext};

/// One entry in the overflow queue
///
/// Stored as a single JSON object:
///
/// ```json
/// { "args": [...], "context": {...}, "buffered_at": 1700000000.25, "replication_markers": {...} }
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeferredJobRecord {
    pub args: Vec<Value>,
    #[serde(default)]
    pub context: JobContext,
    /// Unix seconds at defer time
    pub buffered_at: f64,
    #[serde(default)]
    pub replication_markers: JobContext,
}

impl DeferredJobRecord {
    pub fn from_job(job: &Job, buffered_at: f64) -> Self {
        Self {
            args: job.args.clone(),
            context: job.context.clone(),
            buffered_at,
            replication_markers: job.replication_markers.clone(),
        }
    }

    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn decode(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }
}
