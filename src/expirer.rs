//! TTL tracking for pairings, sessions and proposals. Targets are normalized
//! to `topic:<topic>` or `id:<number>`; each target holds at most one active
//! expiration. The heartbeat sweep evicts anything past its expiry and emits
//! an event the engine routes back into entity deletion.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use log::debug;
use serde::{Deserialize, Serialize};
use tokio::sync::{RwLock, broadcast};

use crate::constants::storage_key;
use crate::error::{Error, Result};
use crate::heartbeat::HeartBeat;
use crate::storage::{self, KeyValueStorage};
use crate::utils::unix_timestamp_ms;

const STORE: &str = "expirer";
const EVENT_CAPACITY: usize = 64;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Expiration {
    pub target: String,
    /// Unix seconds.
    pub expiry: u64,
}

#[derive(Clone, Debug)]
pub enum ExpirerEvent {
    Created(Expiration),
    Deleted(Expiration),
    Expired(Expiration),
}

/// Either side of a normalized target. Numeric keys become `id:` targets,
/// everything else `topic:`; passing an already-normalized string through is
/// idempotent.
pub fn format_target(key: &str) -> String {
    if key.starts_with("topic:") || key.starts_with("id:") {
        return key.to_string();
    }
    if !key.is_empty() && key.bytes().all(|b| b.is_ascii_digit()) {
        format!("id:{key}")
    } else {
        format!("topic:{key}")
    }
}

/// Splits a normalized target back into its kind and value.
pub fn parse_target(target: &str) -> Result<(&str, &str)> {
    target
        .split_once(':')
        .filter(|(kind, _)| *kind == "topic" || *kind == "id")
        .ok_or_else(|| {
            Error::MissingOrInvalid(format!("expirer target {target}"))
        })
}

pub struct Expirer {
    storage: Arc<dyn KeyValueStorage>,
    expirations: RwLock<HashMap<String, Expiration>>,
    events: broadcast::Sender<ExpirerEvent>,
    initialized: AtomicBool,
}

impl Expirer {
    pub fn new(storage: Arc<dyn KeyValueStorage>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            storage,
            expirations: RwLock::new(HashMap::new()),
            events,
            initialized: AtomicBool::new(false),
        }
    }

    pub async fn init(&self) -> Result<()> {
        let persisted: Option<Vec<Expiration>> =
            storage::get_item(&*self.storage, &storage_key(STORE)).await?;

        if let Some(persisted) = persisted {
            let mut expirations = self.expirations.write().await;
            if !expirations.is_empty() {
                return Err(Error::RestoreWillOverride(STORE.to_string()));
            }
            for expiration in persisted {
                expirations.insert(expiration.target.clone(), expiration);
            }
        }
        self.initialized.store(true, Ordering::SeqCst);
        Ok(())
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ExpirerEvent> {
        self.events.subscribe()
    }

    /// Runs the sweep on every heartbeat pulse.
    pub fn attach(self: &Arc<Self>, heartbeat: &HeartBeat) {
        let expirer = self.clone();
        let mut ticks = heartbeat.subscribe();
        tokio::spawn(async move {
            while ticks.recv().await.is_ok() {
                let expirer = expirer.clone();
                tokio::spawn(async move {
                    if let Err(e) = expirer.sweep().await {
                        debug!("expirer sweep failed: {e}");
                    }
                });
            }
        });
    }

    /// Stores or overwrites an expiration and immediately checks it, which
    /// may evict synchronously if the expiry is already past.
    pub async fn set(&self, key: &str, expiry: u64) -> Result<()> {
        self.check_initialized()?;
        let target = format_target(key);
        let expiration = Expiration {
            target: target.clone(),
            expiry,
        };

        self.expirations
            .write()
            .await
            .insert(target.clone(), expiration.clone());
        self.persist().await?;
        let _ = self.events.send(ExpirerEvent::Created(expiration));

        self.check(&target).await
    }

    pub async fn has(&self, key: &str) -> Result<bool> {
        self.check_initialized()?;
        let target = format_target(key);
        Ok(self.expirations.read().await.contains_key(&target))
    }

    pub async fn get(&self, key: &str) -> Result<Expiration> {
        self.check_initialized()?;
        let target = format_target(key);
        self.expirations
            .read()
            .await
            .get(&target)
            .cloned()
            .ok_or(Error::NoMatchingKey(STORE.to_string(), target))
    }

    pub async fn delete(&self, key: &str) -> Result<()> {
        self.check_initialized()?;
        let target = format_target(key);
        let removed = self.expirations.write().await.remove(&target);
        if let Some(expiration) = removed {
            self.persist().await?;
            let _ = self.events.send(ExpirerEvent::Deleted(expiration));
        }
        Ok(())
    }

    /// Re-checks every tracked expiration against the clock. Idempotent: a
    /// second sweep after eviction emits nothing.
    pub async fn sweep(&self) -> Result<()> {
        self.check_initialized()?;
        let targets: Vec<String> =
            self.expirations.read().await.keys().cloned().collect();
        for target in targets {
            self.check(&target).await?;
        }
        Ok(())
    }

    async fn check(&self, target: &str) -> Result<()> {
        let now_ms = unix_timestamp_ms()?;
        let expired = {
            let expirations = self.expirations.read().await;
            match expirations.get(target) {
                Some(expiration) => {
                    u128::from(expiration.expiry) * 1000 < now_ms
                }
                None => false,
            }
        };
        if expired {
            let removed = self.expirations.write().await.remove(target);
            if let Some(expiration) = removed {
                debug!("expired: {}", expiration.target);
                self.persist().await?;
                let _ = self.events.send(ExpirerEvent::Expired(expiration));
            }
        }
        Ok(())
    }

    async fn persist(&self) -> Result<()> {
        let values: Vec<Expiration> =
            self.expirations.read().await.values().cloned().collect();
        storage::set_item(&*self.storage, &storage_key(STORE), &values).await
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
    use crate::utils::unix_timestamp;

    async fn expirer() -> Expirer {
        let expirer = Expirer::new(Arc::new(MemoryStorage::new()));
        expirer.init().await.unwrap();
        expirer
    }

    #[test]
    fn target_normalization() {
        assert_eq!(format_target("abc123"), "topic:abc123");
        assert_eq!(format_target("1693"), "id:1693");
        assert_eq!(format_target("topic:abc"), "topic:abc");
        assert_eq!(format_target("id:42"), "id:42");
    }

    #[tokio::test]
    async fn set_twice_keeps_one_record() {
        let expirer = expirer().await;
        let expiry = unix_timestamp().unwrap() + 60;
        expirer.set("topicA", expiry).await.unwrap();
        expirer.set("topicA", expiry + 5).await.unwrap();

        assert_eq!(expirer.expirations.read().await.len(), 1);
        assert_eq!(expirer.get("topicA").await.unwrap().expiry, expiry + 5);
    }

    #[tokio::test]
    async fn sweep_emits_exactly_one_expired_event() {
        let expirer = expirer().await;
        let mut events = expirer.subscribe();

        expirer
            .set("gone", unix_timestamp().unwrap() + 60)
            .await
            .unwrap();
        // Force the entry into the past without triggering the set-check.
        expirer
            .expirations
            .write()
            .await
            .get_mut("topic:gone")
            .unwrap()
            .expiry = 1;

        expirer.sweep().await.unwrap();
        expirer.sweep().await.unwrap();

        let mut expired = 0;
        while let Ok(event) = events.try_recv() {
            if matches!(event, ExpirerEvent::Expired(_)) {
                expired += 1;
            }
        }
        assert_eq!(expired, 1);
        assert!(!expirer.has("gone").await.unwrap());
    }

    #[tokio::test]
    async fn set_in_the_past_evicts_synchronously() {
        let expirer = expirer().await;
        let mut events = expirer.subscribe();

        expirer.set("stale", 1).await.unwrap();
        assert!(!expirer.has("stale").await.unwrap());

        let mut saw_expired = false;
        while let Ok(event) = events.try_recv() {
            if matches!(event, ExpirerEvent::Expired(_)) {
                saw_expired = true;
            }
        }
        assert!(saw_expired);
    }

    #[tokio::test]
    async fn restore_over_populated_state_fails() {
        let storage = Arc::new(MemoryStorage::new());
        let expirer = Expirer::new(storage);
        expirer.init().await.unwrap();
        expirer
            .set("keep", unix_timestamp().unwrap() + 60)
            .await
            .unwrap();

        assert!(matches!(
            expirer.init().await,
            Err(Error::RestoreWillOverride(_))
        ));
    }
}
