//! In-process object store

use super::{check_tag, validate_key, ETag, Object, ObjectStore, PutCondition, StoreError, StoreResult};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::BTreeMap;

/// Object store held in memory
///
/// Conditional puts check and write under one lock, so they are linearizable
/// across every task sharing the store.
#[derive(Debug, Default)]
pub struct MemoryStore {
    objects: RwLock<BTreeMap<String, Object>>,
}

impl MemoryStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored objects
    pub fn len(&self) -> usize {
        self.objects.read().len()
    }

    /// Whether the store is empty
    pub fn is_empty(&self) -> bool {
        self.objects.read().is_empty()
    }
}

#[async_trait]
impl ObjectStore for MemoryStore {
    async fn get(&self, key: &str) -> StoreResult<Object> {
        validate_key(key)?;
        self.objects
            .read()
            .get(key)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(key.to_string()))
    }

    async fn head(&self, key: &str) -> StoreResult<Option<ETag>> {
        validate_key(key)?;
        Ok(self.objects.read().get(key).map(|o| o.etag.clone()))
    }

    async fn put_as(&self, key: &str, bytes: Vec<u8>, condition: PutCondition, etag: ETag) -> StoreResult<ETag> {
        validate_key(key)?;
        check_tag(key, &bytes, &etag)?;
        let mut objects = self.objects.write();
        condition.check(key, objects.get(key).map(|o| &o.etag))?;
        objects.insert(
            key.to_string(),
            Object {
                bytes,
                etag: etag.clone(),
            },
        );
        Ok(etag)
    }

    async fn list(&self, prefix: &str) -> StoreResult<Vec<String>> {
        Ok(self
            .objects
            .read()
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, _)| k.clone())
            .collect())
    }

    async fn delete(&self, key: &str) -> StoreResult<()> {
        validate_key(key)?;
        self.objects.write().remove(key);
        Ok(())
    }
}
