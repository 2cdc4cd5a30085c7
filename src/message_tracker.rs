//! Per-topic record of message hashes, used to drop relay-delivered
//! duplicates before they reach the protocol engine.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::RwLock;

use crate::constants::storage_key;
use crate::error::{Error, Result};
use crate::storage::{self, KeyValueStorage};
use crate::utils::sha256_hex;

const STORE: &str = "messages";

pub struct MessageTracker {
    storage: Arc<dyn KeyValueStorage>,
    messages: RwLock<HashMap<String, BTreeSet<String>>>,
    initialized: AtomicBool,
}

impl MessageTracker {
    pub fn new(storage: Arc<dyn KeyValueStorage>) -> Self {
        Self {
            storage,
            messages: RwLock::new(HashMap::new()),
            initialized: AtomicBool::new(false),
        }
    }

    pub async fn init(&self) -> Result<()> {
        let persisted: Option<HashMap<String, BTreeSet<String>>> =
            storage::get_item(&*self.storage, &storage_key(STORE)).await?;

        if let Some(persisted) = persisted {
            let mut messages = self.messages.write().await;
            if !messages.is_empty() {
                return Err(Error::RestoreWillOverride(STORE.to_string()));
            }
            *messages = persisted;
        }
        self.initialized.store(true, Ordering::SeqCst);
        Ok(())
    }

    /// Records a message and returns its hash. Idempotent: recording a
    /// message already seen on the topic returns the existing hash without a
    /// second persist.
    pub async fn set(&self, topic: &str, message: &str) -> Result<String> {
        self.check_initialized()?;
        let hash = sha256_hex(message);

        let inserted = self
            .messages
            .write()
            .await
            .entry(topic.to_string())
            .or_default()
            .insert(hash.clone());
        if inserted {
            self.persist().await?;
        }
        Ok(hash)
    }

    pub async fn has(&self, topic: &str, message: &str) -> Result<bool> {
        self.check_initialized()?;
        let hash = sha256_hex(message);
        Ok(self
            .messages
            .read()
            .await
            .get(topic)
            .is_some_and(|hashes| hashes.contains(&hash)))
    }

    pub async fn delete(&self, topic: &str) -> Result<()> {
        self.check_initialized()?;
        self.messages.write().await.remove(topic);
        self.persist().await
    }

    async fn persist(&self) -> Result<()> {
        let messages = self.messages.read().await.clone();
        storage::set_item(&*self.storage, &storage_key(STORE), &messages).await
    }

    fn check_initialized(&self) -> Result<()> {
        if !self.initialized.load(Ordering::SeqCst) {
            return Err(Error::NotInitialized(STORE.to_string()));
        }
        Ok(())
    }
}
