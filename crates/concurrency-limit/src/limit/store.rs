//! Limit override record in the keyed store

use std::sync::Arc;
use std::time::Duration;

use tracing::warn;

use super::ConcurrencyLimit;
use crate::job::WorkerType;
use crate::store::{KeyValueStore, StoreError, StoreKeys};

/// TTL-bounded limit override per worker type
///
/// When the override expires the worker type reverts to its declared default.
#[derive(Clone)]
pub struct LimitStore {
    store: Arc<dyn KeyValueStore>,
    keys: StoreKeys,
}

impl LimitStore {
    pub fn new(store: Arc<dyn KeyValueStore>, keys: StoreKeys) -> Self {
        Self { store, keys }
    }

    /// Read the override, if one is present and well-formed
    pub async fn get(&self, worker_type: &WorkerType) -> Result<Option<ConcurrencyLimit>, StoreError> {
        let key = self.keys.current_limit(worker_type);
        let Some(raw) = self.store.get(&key).await? else {
            return Ok(None);
        };

        match raw.trim().parse::<i64>() {
            Ok(value) => Ok(Some(ConcurrencyLimit::new(value))),
            Err(_) => {
                warn!(%worker_type, key = %key, value = %raw, "Ignoring malformed limit override");
                Ok(None)
            }
        }
    }

    /// Write an override that expires after `ttl`
    pub async fn set(
        &self,
        worker_type: &WorkerType,
        limit: ConcurrencyLimit,
        ttl: Duration,
    ) -> Result<(), StoreError> {
        self.store
            .set(
                &self.keys.current_limit(worker_type),
                &limit.value().to_string(),
                Some(ttl),
            )
            .await
    }

    /// Remove the override
    pub async fn clear(&self, worker_type: &WorkerType) -> Result<bool, StoreError> {
        self.store
            .delete(&self.keys.current_limit(worker_type))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryKeyValueStore;

    fn limit_store() -> (Arc<InMemoryKeyValueStore>, LimitStore) {
        let store = Arc::new(InMemoryKeyValueStore::new());
        let limits = LimitStore::new(store.clone(), StoreKeys::default());
        (store, limits)
    }

    #[tokio::test(start_paused = true)]
    async fn test_override_expires() {
        let (_, limits) = limit_store();
        let worker = WorkerType::new("ExportWorker");

        limits
            .set(&worker, ConcurrencyLimit::new(4), Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(limits.get(&worker).await.unwrap(), Some(ConcurrencyLimit::new(4)));

        tokio::time::advance(Duration::from_secs(61)).await;
        assert_eq!(limits.get(&worker).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_malformed_override_is_ignored() {
        let (store, limits) = limit_store();
        let worker = WorkerType::new("ExportWorker");
        store
            .set(&StoreKeys::default().current_limit(&worker), "lots", None)
            .await
            .unwrap();

        assert_eq!(limits.get(&worker).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_clear() {
        let (_, limits) = limit_store();
        let worker = WorkerType::new("ExportWorker");
        limits
            .set(&worker, ConcurrencyLimit::new(1), Duration::from_secs(60))
            .await
            .unwrap();

        assert!(limits.clear(&worker).await.unwrap());
        assert_eq!(limits.get(&worker).await.unwrap(), None);
    }
}
