//! Key-value store used to persist mesh objects and proxies
//!
//! - `Store`: async trait every backend implements
//! - `MemoryStore`: DashMap-backed store, clones share their content
//! - `NoopStore`: forgets everything, used by ephemeral mesh bases such as shadows
//! - `StoreValue`: transparent bincode conversion for persisted types

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::{mapref::entry::Entry, DashMap};
use serde::{de::DeserializeOwned, Serialize};

use crate::{
    error::{StoreError, StoreResult},
    identifier::{MeshBaseIdentifier, MeshObjectIdentifier},
};

pub const OBJECT_KEY_PREFIX: &str = "object/";
pub const PROXY_KEY_PREFIX: &str = "proxy/";

pub fn object_key(identifier: &MeshObjectIdentifier) -> String {
    format!("{OBJECT_KEY_PREFIX}{}", identifier.to_external_form())
}

pub fn proxy_key(partner: &MeshBaseIdentifier) -> String {
    format!("{PROXY_KEY_PREFIX}{partner}")
}

// ============================================================================
// Type-Safe Serialization Layer
// ============================================================================

/// Values that can be written to a store
pub trait StoreValue: Serialize + DeserializeOwned {
    fn to_bytes(&self) -> StoreResult<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    fn from_bytes(bytes: &[u8]) -> StoreResult<Self> {
        Ok(bincode::deserialize(bytes)?)
    }
}

impl<T> StoreValue for T where T: Serialize + DeserializeOwned {}

// ============================================================================
// Store Trait
// ============================================================================

#[async_trait]
pub trait Store: Send + Sync + 'static {
    async fn get(&self, key: &str) -> StoreResult<Option<Vec<u8>>>;

    /// Fails with `KeyExistsAlready` if `key` is present
    async fn put(&self, key: &str, value: Vec<u8>) -> StoreResult<()>;

    /// Fails with `KeyDoesNotExist` if `key` is absent
    async fn update(&self, key: &str, value: Vec<u8>) -> StoreResult<()>;

    /// Returns true if the key was newly created
    async fn put_or_update(&self, key: &str, value: Vec<u8>) -> StoreResult<bool>;

    /// Returns true if something was removed
    async fn remove(&self, key: &str) -> StoreResult<bool>;

    async fn keys_with_prefix(&self, prefix: &str) -> StoreResult<Vec<String>>;
}

// ============================================================================
// In-Memory Store
// ============================================================================

#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    entries: Arc<DashMap<String, Vec<u8>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn get(&self, key: &str) -> StoreResult<Option<Vec<u8>>> {
        Ok(self.entries.get(key).map(|v| v.value().clone()))
    }

    async fn put(&self, key: &str, value: Vec<u8>) -> StoreResult<()> {
        match self.entries.entry(key.to_string()) {
            Entry::Occupied(_) => Err(StoreError::KeyExistsAlready(key.to_string())),
            Entry::Vacant(entry) => {
                entry.insert(value);
                Ok(())
            }
        }
    }

    async fn update(&self, key: &str, value: Vec<u8>) -> StoreResult<()> {
        match self.entries.get_mut(key) {
            Some(mut entry) => {
                *entry.value_mut() = value;
                Ok(())
            }
            None => Err(StoreError::KeyDoesNotExist(key.to_string())),
        }
    }

    async fn put_or_update(&self, key: &str, value: Vec<u8>) -> StoreResult<bool> {
        Ok(self.entries.insert(key.to_string(), value).is_none())
    }

    async fn remove(&self, key: &str) -> StoreResult<bool> {
        Ok(self.entries.remove(key).is_some())
    }

    async fn keys_with_prefix(&self, prefix: &str) -> StoreResult<Vec<String>> {
        let mut keys: Vec<String> = self
            .entries
            .iter()
            .filter(|entry| entry.key().starts_with(prefix))
            .map(|entry| entry.key().clone())
            .collect();
        keys.sort();
        Ok(keys)
    }
}

// ============================================================================
// No-Op Store
// ============================================================================

#[derive(Debug, Clone, Copy, Default)]
pub struct NoopStore;

#[async_trait]
impl Store for NoopStore {
    async fn get(&self, _key: &str) -> StoreResult<Option<Vec<u8>>> {
        Ok(None)
    }

    async fn put(&self, _key: &str, _value: Vec<u8>) -> StoreResult<()> {
        Ok(())
    }

    async fn update(&self, _key: &str, _value: Vec<u8>) -> StoreResult<()> {
        Ok(())
    }

    async fn put_or_update(&self, _key: &str, _value: Vec<u8>) -> StoreResult<bool> {
        Ok(true)
    }

    async fn remove(&self, _key: &str) -> StoreResult<bool> {
        Ok(false)
    }

    async fn keys_with_prefix(&self, _prefix: &str) -> StoreResult<Vec<String>> {
        Ok(Vec::new())
    }
}

#[cfg(test)]
mod tests {
    use serde::Deserialize;

    use super::*;

    #[tokio::test]
    async fn test_put_update_semantics() {
        let store = MemoryStore::new();
        store.put("a", vec![1]).await.unwrap();
        assert!(matches!(
            store.put("a", vec![2]).await,
            Err(StoreError::KeyExistsAlready(_))
        ));
        assert!(matches!(
            store.update("b", vec![2]).await,
            Err(StoreError::KeyDoesNotExist(_))
        ));
        store.update("a", vec![3]).await.unwrap();
        assert_eq!(store.get("a").await.unwrap(), Some(vec![3]));

        assert!(store.put_or_update("b", vec![4]).await.unwrap());
        assert!(!store.put_or_update("b", vec![5]).await.unwrap());
        assert!(store.remove("b").await.unwrap());
        assert!(!store.remove("b").await.unwrap());
        assert_eq!(store.get("b").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_keys_with_prefix() {
        let store = MemoryStore::new();
        let shared = store.clone();
        store.put("object/x", Vec::new()).await.unwrap();
        store.put("object/y", Vec::new()).await.unwrap();
        store.put("proxy/p", Vec::new()).await.unwrap();

        assert_eq!(
            shared.keys_with_prefix(OBJECT_KEY_PREFIX).await.unwrap(),
            vec!["object/x".to_string(), "object/y".to_string()]
        );
        assert_eq!(shared.len(), 3);
    }

    #[test]
    fn test_store_value_codec() {
        #[derive(Debug, PartialEq, Serialize, Deserialize)]
        struct Sample {
            name: String,
            values: Vec<i64>,
        }

        let sample = Sample {
            name: "s".to_string(),
            values: vec![1, -2],
        };
        let bytes = sample.to_bytes().unwrap();
        assert_eq!(Sample::from_bytes(&bytes).unwrap(), sample);
        assert!(matches!(
            Sample::from_bytes(&[0xff]),
            Err(StoreError::Codec(_))
        ));
    }
}
