//! Job middleware
//!
//! This module provides:
//! - [`SubmissionMiddleware`] - defers jobs as they are handed to the broker
//! - [`ExecutionMiddleware`] - defers or tracks jobs immediately before they run
//! - [`ResumeMetadataInjector`] - re-attaches resume metadata during bulk resubmission
//!
//! None of them ever return an error to the caller: store failures are logged
//! and the job is let through.

mod execution;
mod injector;
mod submission;

pub use execution::{DeferReason, Execution, ExecutionMiddleware};
pub use injector::{Injection, ResumeMetadataInjector};
pub use submission::{Submission, SubmissionMiddleware};
