//! Generic persisted collection backing the pairing, session and proposal
//! maps. Every mutation writes the whole map through storage; hydration is
//! restore-once.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::sync::RwLock;

use crate::constants::storage_key;
use crate::error::{Error, Result};
use crate::storage::{KeyValueStorage, get_item, set_item};

pub struct Store<T> {
    name: String,
    storage: Arc<dyn KeyValueStorage>,
    map: RwLock<HashMap<String, T>>,
    initialized: AtomicBool,
}

impl<T> Store<T>
where
    T: Clone + Serialize + DeserializeOwned + Send + Sync,
{
    pub fn new(name: &str, storage: Arc<dyn KeyValueStorage>) -> Self {
        Self {
            name: name.to_string(),
            storage,
            map: RwLock::new(HashMap::new()),
            initialized: AtomicBool::new(false),
        }
    }

    pub async fn init(&self) -> Result<()> {
        if let Some(persisted) =
            get_item::<HashMap<String, T>>(self.storage.as_ref(), &storage_key(&self.name))
                .await?
        {
            let mut map = self.map.write().await;
            if !map.is_empty() {
                return Err(Error::RestoreWillOverride(self.name.clone()));
            }
            *map = persisted;
        }
        self.initialized.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn check_initialized(&self) -> Result<()> {
        if !self.initialized.load(Ordering::SeqCst) {
            return Err(Error::NotInitialized(self.name.clone()));
        }
        Ok(())
    }

    pub async fn has(&self, key: &str) -> bool {
        self.map.read().await.contains_key(key)
    }

    pub async fn get(&self, key: &str) -> Result<T> {
        self.check_initialized()?;
        self.map
            .read()
            .await
            .get(key)
            .cloned()
            .ok_or_else(|| Error::MissingOrInvalid(format!("{}: {key}", self.name)))
    }

    pub async fn set(&self, key: &str, value: T) -> Result<()> {
        self.check_initialized()?;
        self.map.write().await.insert(key.to_string(), value);
        self.persist().await
    }

    pub async fn delete(&self, key: &str) -> Result<()> {
        self.check_initialized()?;
        self.map.write().await.remove(key);
        self.persist().await
    }

    pub async fn keys(&self) -> Vec<String> {
        self.map.read().await.keys().cloned().collect()
    }

    pub async fn values(&self) -> Vec<T> {
        self.map.read().await.values().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.map.read().await.len()
    }

    async fn persist(&self) -> Result<()> {
        let map = self.map.read().await.clone();
        set_item(self.storage.as_ref(), &storage_key(&self.name), &map).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorage;
    use crate::types::{PairingPatch, PairingStruct, Relay};

    fn pairing(topic: &str) -> PairingStruct {
        PairingStruct {
            topic: topic.to_string(),
            expiry: 1_000,
            relay: Relay::default(),
            active: false,
            peer_metadata: None,
        }
    }

    #[tokio::test]
    async fn requires_init() {
        let store: Store<PairingStruct> =
            Store::new("pairing", Arc::new(MemoryStorage::new()));
        assert!(matches!(
            store.get("topic").await,
            Err(Error::NotInitialized(_))
        ));
    }

    #[tokio::test]
    async fn set_get_patch_delete() {
        let store: Store<PairingStruct> =
            Store::new("pairing", Arc::new(MemoryStorage::new()));
        store.init().await.unwrap();

        store.set("topic", pairing("topic")).await.unwrap();
        let mut record = store.get("topic").await.unwrap();
        assert!(!record.active);

        PairingPatch {
            active: Some(true),
            expiry: Some(2_000),
            peer_metadata: None,
        }
        .apply(&mut record);
        store.set("topic", record).await.unwrap();
        let record = store.get("topic").await.unwrap();
        assert!(record.active);
        assert_eq!(record.expiry, 2_000);

        store.delete("topic").await.unwrap();
        assert!(!store.has("topic").await);
        assert!(store.get("topic").await.is_err());
    }

    #[tokio::test]
    async fn restores_once() {
        let storage = Arc::new(MemoryStorage::new());
        let store: Store<PairingStruct> = Store::new("pairing", storage.clone());
        store.init().await.unwrap();
        store.set("topic", pairing("topic")).await.unwrap();

        let restored: Store<PairingStruct> = Store::new("pairing", storage.clone());
        restored.init().await.unwrap();
        assert_eq!(restored.len().await, 1);

        // Hydrating over live state is refused, including a repeated init.
        let hostile: Store<PairingStruct> = Store::new("pairing", storage);
        hostile.init().await.unwrap();
        hostile.set("other", pairing("other")).await.unwrap();
        assert!(matches!(
            hostile.init().await,
            Err(Error::RestoreWillOverride(_))
        ));
    }
}
