//! Worker declarations and the static capacity registry
//!
//! Both are built once by the process bootstrap and injected; neither is
//! global state.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::job::WorkerType;

/// Zero-argument capacity function
///
/// Called on every lookup, so it may read process-local settings that change
/// between calls.
pub type CapacityFn = Arc<dyn Fn() -> i64 + Send + Sync>;

/// A worker type's own declaration
#[derive(Clone)]
pub struct WorkerDeclaration {
    worker_type: WorkerType,
    default_limit: Option<CapacityFn>,
}

impl WorkerDeclaration {
    pub fn worker_type(&self) -> &WorkerType {
        &self.worker_type
    }

    /// Static fallback limit, if the worker type declares one
    pub fn default_limit(&self) -> Option<i64> {
        self.default_limit.as_ref().map(|f| f())
    }
}

impl fmt::Debug for WorkerDeclaration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerDeclaration")
            .field("worker_type", &self.worker_type)
            .field("default_limit", &self.default_limit())
            .finish()
    }
}

/// Catalog of known worker types
///
/// A worker type that is not declared here cannot be resolved and is treated
/// as unlimited.
///
/// # Example
///
/// ```
/// use everruns_concurrency_limit::limit::WorkerDeclarations;
///
/// let declarations = WorkerDeclarations::new()
///     .declare("Export::CsvWorker")
///     .declare_with_limit("MailerWorker", || 25);
///
/// assert_eq!(declarations.len(), 2);
/// ```
#[derive(Clone, Default)]
pub struct WorkerDeclarations {
    declarations: HashMap<WorkerType, WorkerDeclaration>,
}

impl WorkerDeclarations {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare a worker type with no static default limit
    pub fn declare(mut self, worker_type: impl Into<WorkerType>) -> Self {
        let worker_type = worker_type.into();
        self.declarations.insert(
            worker_type.clone(),
            WorkerDeclaration {
                worker_type,
                default_limit: None,
            },
        );
        self
    }

    /// Declare a worker type whose static default comes from `limit`
    pub fn declare_with_limit<F>(mut self, worker_type: impl Into<WorkerType>, limit: F) -> Self
    where
        F: Fn() -> i64 + Send + Sync + 'static,
    {
        let worker_type = worker_type.into();
        self.declarations.insert(
            worker_type.clone(),
            WorkerDeclaration {
                worker_type,
                default_limit: Some(Arc::new(limit)),
            },
        );
        self
    }

    pub fn get(&self, worker_type: &WorkerType) -> Option<&WorkerDeclaration> {
        self.declarations.get(worker_type)
    }

    pub fn contains(&self, worker_type: &WorkerType) -> bool {
        self.declarations.contains_key(worker_type)
    }

    /// Declared worker types, sorted by name
    pub fn worker_types(&self) -> Vec<WorkerType> {
        let mut types: Vec<_> = self.declarations.keys().cloned().collect();
        types.sort();
        types
    }

    pub fn len(&self) -> usize {
        self.declarations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.declarations.is_empty()
    }
}

impl fmt::Debug for WorkerDeclarations {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerDeclarations")
            .field("worker_types", &self.worker_types())
            .finish()
    }
}

/// Static worker registry: worker type to capacity function
///
/// The simpler limit model. Its only state lives in process memory; there is
/// no durable override and no TTL.
#[derive(Clone, Default)]
pub struct StaticWorkerRegistry {
    capacities: HashMap<WorkerType, CapacityFn>,
}

impl StaticWorkerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a capacity function for a worker type
    pub fn register<F>(mut self, worker_type: impl Into<WorkerType>, capacity: F) -> Self
    where
        F: Fn() -> i64 + Send + Sync + 'static,
    {
        self.capacities.insert(worker_type.into(), Arc::new(capacity));
        self
    }

    /// Evaluate the capacity function, if registered
    pub fn capacity(&self, worker_type: &WorkerType) -> Option<i64> {
        self.capacities.get(worker_type).map(|f| f())
    }

    pub fn contains(&self, worker_type: &WorkerType) -> bool {
        self.capacities.contains_key(worker_type)
    }

    /// Registered worker types, sorted by name
    pub fn worker_types(&self) -> Vec<WorkerType> {
        let mut types: Vec<_> = self.capacities.keys().cloned().collect();
        types.sort();
        types
    }

    pub fn len(&self) -> usize {
        self.capacities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.capacities.is_empty()
    }
}

impl fmt::Debug for StaticWorkerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StaticWorkerRegistry")
            .field("worker_types", &self.worker_types())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicI64, Ordering};

    #[test]
    fn test_declarations() {
        let declarations = WorkerDeclarations::new()
            .declare("BWorker")
            .declare_with_limit("AWorker", || 5);

        let a = declarations.get(&"AWorker".into()).unwrap();
        assert_eq!(a.default_limit(), Some(5));

        let b = declarations.get(&"BWorker".into()).unwrap();
        assert_eq!(b.default_limit(), None);

        assert!(!declarations.contains(&"CWorker".into()));
        assert_eq!(
            declarations.worker_types(),
            vec![WorkerType::new("AWorker"), WorkerType::new("BWorker")]
        );
    }

    #[test]
    fn test_registry_evaluates_on_each_lookup() {
        let setting = Arc::new(AtomicI64::new(3));
        let read = Arc::clone(&setting);
        let registry =
            StaticWorkerRegistry::new().register("ImportWorker", move || read.load(Ordering::SeqCst));

        let worker = WorkerType::new("ImportWorker");
        assert_eq!(registry.capacity(&worker), Some(3));

        setting.store(7, Ordering::SeqCst);
        assert_eq!(registry.capacity(&worker), Some(7));

        assert_eq!(registry.capacity(&"Other".into()), None);
    }
}
