//! Exclusive, TTL-bounded lease in the keyed store

use std::sync::Arc;
use std::time::Duration;

use uuid::Uuid;

use crate::store::{KeyValueStore, StoreError};

/// Cluster-wide mutual exclusion for one key
///
/// Acquisition is a single `SET NX` with expiry; release only deletes the key
/// if it still holds this lease's token, so a holder whose lease already
/// expired cannot release someone else's.
pub struct ExclusiveLease {
    store: Arc<dyn KeyValueStore>,
    key: String,
    ttl: Duration,
    token: String,
}

impl ExclusiveLease {
    pub fn new(store: Arc<dyn KeyValueStore>, key: String, ttl: Duration) -> Self {
        Self {
            store,
            key,
            ttl,
            token: Uuid::now_v7().to_string(),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Try to take the lease; `false` if someone else holds it
    pub async fn try_obtain(&self) -> Result<bool, StoreError> {
        self.store
            .set_if_absent(&self.key, &self.token, self.ttl)
            .await
    }

    /// Whether the lease is still ours
    pub async fn is_held(&self) -> Result<bool, StoreError> {
        Ok(self.store.get(&self.key).await?.as_deref() == Some(self.token.as_str()))
    }

    /// Give the lease up; `false` if it had already expired or changed hands
    pub async fn release(&self) -> Result<bool, StoreError> {
        self.store.delete_if_equals(&self.key, &self.token).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryKeyValueStore;

    #[tokio::test]
    async fn test_exclusive() {
        let store: Arc<dyn KeyValueStore> = Arc::new(InMemoryKeyValueStore::new());
        let ttl = Duration::from_secs(60);
        let a = ExclusiveLease::new(store.clone(), "lease".into(), ttl);
        let b = ExclusiveLease::new(store.clone(), "lease".into(), ttl);

        assert!(a.try_obtain().await.unwrap());
        assert!(!b.try_obtain().await.unwrap());
        assert!(a.is_held().await.unwrap());
        assert!(!b.is_held().await.unwrap());

        // b cannot release a's lease
        assert!(!b.release().await.unwrap());
        assert!(a.release().await.unwrap());
        assert!(b.try_obtain().await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_lease_can_be_taken_over() {
        let store: Arc<dyn KeyValueStore> = Arc::new(InMemoryKeyValueStore::new());
        let a = ExclusiveLease::new(store.clone(), "lease".into(), Duration::from_secs(5));
        let b = ExclusiveLease::new(store.clone(), "lease".into(), Duration::from_secs(5));

        assert!(a.try_obtain().await.unwrap());
        tokio::time::advance(Duration::from_secs(6)).await;

        assert!(b.try_obtain().await.unwrap());
        assert!(!a.is_held().await.unwrap());
        assert!(!a.release().await.unwrap());
        assert!(b.is_held().await.unwrap());
    }
}
