//! LimitSource implementations

use std::sync::Arc;

use async_trait::async_trait;
use tracing::trace;

use super::registry::{StaticWorkerRegistry, WorkerDeclarations};
use super::store::LimitStore;
use super::{ConcurrencyLimit, LimitSource};
use crate::job::WorkerType;
use crate::store::StoreError;

/// Limits from the process-local static registry
///
/// Never touches the store, so it cannot fail.
pub struct StaticRegistryLimitSource {
    registry: Arc<StaticWorkerRegistry>,
}

impl StaticRegistryLimitSource {
    pub fn new(registry: Arc<StaticWorkerRegistry>) -> Self {
        Self { registry }
    }
}

#[async_trait]
impl LimitSource for StaticRegistryLimitSource {
    async fn current_limit(
        &self,
        worker_type: &WorkerType,
    ) -> Result<ConcurrencyLimit, StoreError> {
        Ok(self
            .registry
            .capacity(worker_type)
            .map(ConcurrencyLimit::new)
            .unwrap_or(ConcurrencyLimit::UNLIMITED))
    }

    fn resolves(&self, worker_type: &WorkerType) -> bool {
        self.registry.contains(worker_type)
    }

    fn worker_types(&self) -> Vec<WorkerType> {
        self.registry.worker_types()
    }
}

/// Limits from the store override, falling back to the declared default
///
/// Resolution order: store override, then the declaration's static default,
/// then unlimited. Undeclared worker types are unlimited without a store
/// round-trip.
pub struct StoreBackedLimitSource {
    declarations: Arc<WorkerDeclarations>,
    limits: LimitStore,
}

impl StoreBackedLimitSource {
    pub fn new(declarations: Arc<WorkerDeclarations>, limits: LimitStore) -> Self {
        Self {
            declarations,
            limits,
        }
    }
}

#[async_trait]
impl LimitSource for StoreBackedLimitSource {
    async fn current_limit(
        &self,
        worker_type: &WorkerType,
    ) -> Result<ConcurrencyLimit, StoreError> {
        let Some(declaration) = self.declarations.get(worker_type) else {
            trace!(%worker_type, "Worker type not declared, treating as unlimited");
            return Ok(ConcurrencyLimit::UNLIMITED);
        };

        if let Some(limit) = self.limits.get(worker_type).await? {
            return Ok(limit);
        }

        Ok(declaration
            .default_limit()
            .map(ConcurrencyLimit::new)
            .unwrap_or(ConcurrencyLimit::UNLIMITED))
    }

    fn resolves(&self, worker_type: &WorkerType) -> bool {
        self.declarations.contains(worker_type)
    }

    fn worker_types(&self) -> Vec<WorkerType> {
        self.declarations.worker_types()
    }
}
