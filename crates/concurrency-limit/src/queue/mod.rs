//! Overflow queue and batch resume
//!
//! This module provides:
//! - [`QueueManager`] - deferral and the lease-protected resume protocol
//! - [`DeferredJobRecord`] - the overflow queue wire format
//! - [`OverflowQueue`] - raw list operations against the store
//! - [`ExclusiveLease`] - TTL-bounded cluster-wide lease
//!
//! # Resume protocol
//!
//! ```text
//!  acquire lease ──(held elsewhere)──► skip
//!       │
//!       ▼
//!  ┌─► batch = limit - executing - resumed   (max_batch_size if unlimited)
//!  │    │
//!  │    ▼
//!  │   peek head[0..batch] ──(empty)──► done
//!  │    │
//!  │    ▼
//!  │   metadata ──► side channel      args ──► broker.bulk_submit
//!  │    │
//!  │    ▼
//!  │   trim head[0..batch]   (only after submit succeeded)
//!  │    │
//!  └────┘  until loop_timeout
//! ```

mod lease;
mod manager;
mod overflow;
mod record;

pub use lease::ExclusiveLease;
pub use manager::{QueueManager, ResumeOutcome};
pub use overflow::OverflowQueue;
pub use record::DeferredJobRecord;
