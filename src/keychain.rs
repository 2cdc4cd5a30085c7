//! Durable map from an opaque tag (public key or topic) to a hex-encoded
//! secret. Every mutation writes through to storage before returning.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::RwLock;

use crate::constants::storage_key;
use crate::error::{Error, Result};
use crate::storage::{self, KeyValueStorage};

const STORE: &str = "keychain";

pub struct KeyChain {
    storage: Arc<dyn KeyValueStorage>,
    keys: RwLock<HashMap<String, String>>,
    initialized: AtomicBool,
}

impl KeyChain {
    pub fn new(storage: Arc<dyn KeyValueStorage>) -> Self {
        Self {
            storage,
            keys: RwLock::new(HashMap::new()),
            initialized: AtomicBool::new(false),
        }
    }

    pub async fn init(&self) -> Result<()> {
        let persisted: Option<HashMap<String, String>> =
            storage::get_item(&*self.storage, &storage_key(STORE)).await?;

        if let Some(persisted) = persisted {
            let mut keys = self.keys.write().await;
            if !keys.is_empty() {
                return Err(Error::RestoreWillOverride(STORE.to_string()));
            }
            *keys = persisted;
        }
        self.initialized.store(true, Ordering::SeqCst);
        Ok(())
    }

    pub async fn has(&self, tag: &str) -> Result<bool> {
        self.check_initialized()?;
        Ok(self.keys.read().await.contains_key(tag))
    }

    pub async fn set(&self, tag: &str, key: &str) -> Result<()> {
        self.check_initialized()?;
        self.keys
            .write()
            .await
            .insert(tag.to_string(), key.to_string());
        self.persist().await
    }

    pub async fn get(&self, tag: &str) -> Result<String> {
        self.check_initialized()?;
        self.keys
            .read()
            .await
            .get(tag)
            .cloned()
            .ok_or_else(|| Error::NoMatchingKey(STORE.to_string(), tag.to_string()))
    }

    pub async fn delete(&self, tag: &str) -> Result<()> {
        self.check_initialized()?;
        self.keys.write().await.remove(tag);
        self.persist().await
    }

    async fn persist(&self) -> Result<()> {
        let keys = self.keys.read().await.clone();
        storage::set_item(&*self.storage, &storage_key(STORE), &keys).await
    }

    fn check_initialized(&self) -> Result<()> {
        if !self.initialized.load(Ordering::SeqCst) {
            return Err(Error::NotInitialized(STORE.to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorage;

    #[tokio::test]
    async fn requires_init() {
        let keychain = KeyChain::new(Arc::new(MemoryStorage::new()));
        assert!(matches!(
            keychain.get("tag").await,
            Err(Error::NotInitialized(_))
        ));
    }

    #[tokio::test]
    async fn set_persists_and_restores() {
        let storage = Arc::new(MemoryStorage::new());

        let keychain = KeyChain::new(storage.clone());
        keychain.init().await.unwrap();
        keychain.set("topic", "aabb").await.unwrap();

        // A fresh instance over the same storage sees the key.
        let restored = KeyChain::new(storage);
        restored.init().await.unwrap();
        assert_eq!(restored.get("topic").await.unwrap(), "aabb");
    }

    #[tokio::test]
    async fn restore_over_populated_state_fails() {
        let storage = Arc::new(MemoryStorage::new());
        let keychain = KeyChain::new(storage);
        keychain.init().await.unwrap();
        keychain.set("topic", "aabb").await.unwrap();

        assert!(matches!(
            keychain.init().await,
            Err(Error::RestoreWillOverride(_))
        ));
    }

    #[tokio::test]
    async fn missing_tag_is_no_matching_key() {
        let keychain = KeyChain::new(Arc::new(MemoryStorage::new()));
        keychain.init().await.unwrap();
        assert!(matches!(
            keychain.get("absent").await,
            Err(Error::NoMatchingKey(_, _))
        ));
    }
}
