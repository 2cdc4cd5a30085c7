//! Relay subscription bookkeeping. Active subscriptions are persisted so a
//! restarted client can resubscribe to every topic it was listening on.
//! Subscribe calls that fail stay in a pending set retried on each heartbeat,
//! and all calls are gated behind a restart flag so they cannot race a
//! resubscribe pass after reconnection.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use log::{debug, warn};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::{RwLock, watch};

use crate::constants::{BATCH_SUBSCRIBE_SIZE, SUBSCRIBE_TIMEOUT, storage_key};
use crate::error::{Error, Result};
use crate::heartbeat::HeartBeat;
use crate::rpc::{
    BatchSubscribeParams, JsonRpcRequest, RelayMethod, SubscribeParams,
    UnsubscribeParams,
};
use crate::storage::{KeyValueStorage, get_item, set_item};
use crate::transport::RelayTransport;
use crate::utils::sha256_hex;

const STORE: &str = "subscription";

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Subscription {
    pub topic: String,
    pub id: String,
}

pub struct Subscriber {
    transport: Arc<dyn RelayTransport>,
    storage: Arc<dyn KeyValueStorage>,
    client_id: String,
    subscriptions: RwLock<HashMap<String, Subscription>>,
    pending: RwLock<HashSet<String>>,
    // false while a resubscribe pass is in flight
    ready_tx: watch::Sender<bool>,
    ready_rx: watch::Receiver<bool>,
    initialized: AtomicBool,
}

impl Subscriber {
    pub fn new(
        transport: Arc<dyn RelayTransport>,
        storage: Arc<dyn KeyValueStorage>,
        client_id: String,
    ) -> Self {
        let (ready_tx, ready_rx) = watch::channel(true);
        Self {
            transport,
            storage,
            client_id,
            subscriptions: RwLock::new(HashMap::new()),
            pending: RwLock::new(HashSet::new()),
            ready_tx,
            ready_rx,
            initialized: AtomicBool::new(false),
        }
    }

    pub async fn init(&self) -> Result<()> {
        if let Some(persisted) =
            get_item::<Vec<Subscription>>(self.storage.as_ref(), &storage_key(STORE)).await?
        {
            let mut subscriptions = self.subscriptions.write().await;
            if !subscriptions.is_empty() {
                return Err(Error::RestoreWillOverride(STORE.to_string()));
            }
            for sub in persisted {
                subscriptions.insert(sub.topic.clone(), sub);
            }
        }
        self.initialized.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn check_initialized(&self) -> Result<()> {
        if !self.initialized.load(Ordering::SeqCst) {
            return Err(Error::NotInitialized(STORE.to_string()));
        }
        Ok(())
    }

    /// Retries subscribe RPCs that previously failed.
    pub fn attach(self: &Arc<Self>, heartbeat: &HeartBeat) {
        let subscriber = self.clone();
        let mut ticks = heartbeat.subscribe();
        tokio::spawn(async move {
            while ticks.recv().await.is_ok() {
                let subscriber = subscriber.clone();
                tokio::spawn(async move {
                    subscriber.retry_pending().await;
                });
            }
        });
    }

    /// Deterministic per-client subscription id.
    fn subscription_id(&self, topic: &str) -> String {
        sha256_hex(&format!("{topic}{}", self.client_id))
    }

    pub async fn is_subscribed(&self, topic: &str) -> bool {
        self.subscriptions.read().await.contains_key(topic)
            || self.pending.read().await.contains(topic)
    }

    pub async fn topics(&self) -> Vec<String> {
        let mut topics: Vec<String> =
            self.subscriptions.read().await.keys().cloned().collect();
        for topic in self.pending.read().await.iter() {
            if !topics.contains(topic) {
                topics.push(topic.clone());
            }
        }
        topics
    }

    /// Subscribes to a topic on the relay. Blocks while a restart pass is in
    /// flight so the ack cannot interleave with a batch resubscribe. A failed
    /// RPC leaves the topic pending for the heartbeat retry; the returned id
    /// is valid either way.
    pub async fn subscribe(&self, topic: &str) -> Result<String> {
        self.check_initialized()?;
        self.wait_ready().await?;

        let id = self.subscription_id(topic);
        self.pending.write().await.insert(topic.to_string());
        match self.subscribe_rpc(topic).await {
            Ok(()) => self.confirm(topic).await?,
            Err(e) => warn!("subscribe on {topic} failed, will retry: {e}"),
        }
        Ok(id)
    }

    /// Drops a subscription locally first, then tells the relay. Held back
    /// while a restart pass is in flight so the removal cannot be undone by
    /// a concurrent batch resubscribe.
    pub async fn unsubscribe(&self, topic: &str) -> Result<()> {
        self.check_initialized()?;
        self.wait_ready().await?;
        self.pending.write().await.remove(topic);
        let removed = self.subscriptions.write().await.remove(topic);
        let Some(subscription) = removed else {
            return Ok(());
        };
        self.persist().await?;

        let request = JsonRpcRequest::new(
            RelayMethod::Unsubscribe,
            json!(UnsubscribeParams {
                topic: topic.to_string(),
                id: subscription.id,
            }),
        );
        // Local state is already clean; a relay failure here is not fatal.
        if let Err(e) = self.transport.request(request).await {
            warn!("unsubscribe on {topic} failed: {e}");
        }
        Ok(())
    }

    /// Re-establishes every known subscription after a reconnect. New
    /// subscribe calls are held until the pass completes.
    pub async fn restart(&self) -> Result<()> {
        self.check_initialized()?;
        let _ = self.ready_tx.send(false);
        let result = self.resubscribe_all().await;
        let _ = self.ready_tx.send(true);
        result
    }

    async fn retry_pending(&self) {
        let pending: Vec<String> = self.pending.read().await.iter().cloned().collect();
        for topic in pending {
            match self.subscribe_rpc(&topic).await {
                Ok(()) => {
                    if let Err(e) = self.confirm(&topic).await {
                        warn!("recording subscription on {topic} failed: {e}");
                    }
                }
                Err(e) => warn!("pending subscribe on {topic} failed: {e}"),
            }
        }
    }

    async fn subscribe_rpc(&self, topic: &str) -> Result<()> {
        let request = JsonRpcRequest::new(
            RelayMethod::Subscribe,
            json!(SubscribeParams {
                topic: topic.to_string(),
            }),
        );
        tokio::time::timeout(
            Duration::from_secs(SUBSCRIBE_TIMEOUT),
            self.transport.request(request),
        )
        .await
        .map_err(|_| Error::Internal(format!("subscribe on {topic} timed out")))??;
        Ok(())
    }

    async fn confirm(&self, topic: &str) -> Result<()> {
        self.pending.write().await.remove(topic);
        self.subscriptions.write().await.insert(
            topic.to_string(),
            Subscription {
                topic: topic.to_string(),
                id: self.subscription_id(topic),
            },
        );
        self.persist().await?;
        debug!("subscribed to {topic}");
        Ok(())
    }

    async fn resubscribe_all(&self) -> Result<()> {
        let topics = self.topics().await;
        if topics.is_empty() {
            return Ok(());
        }
        for chunk in topics.chunks(BATCH_SUBSCRIBE_SIZE) {
            let request = JsonRpcRequest::new(
                RelayMethod::BatchSubscribe,
                json!(BatchSubscribeParams {
                    topics: chunk.to_vec(),
                }),
            );
            tokio::time::timeout(
                Duration::from_secs(SUBSCRIBE_TIMEOUT),
                self.transport.request(request),
            )
            .await
            .map_err(|_| Error::Internal("batch subscribe timed out".to_string()))??;
        }
        for topic in &topics {
            self.confirm(topic).await?;
        }
        debug!("resubscribed to {} topics", topics.len());
        Ok(())
    }

    async fn wait_ready(&self) -> Result<()> {
        let mut rx = self.ready_rx.clone();
        rx.wait_for(|ready| *ready)
            .await
            .map_err(|_| Error::Internal("subscriber gate closed".to_string()))?;
        Ok(())
    }

    async fn persist(&self) -> Result<()> {
        let subscriptions: Vec<Subscription> =
            self.subscriptions.read().await.values().cloned().collect();
        set_item(self.storage.as_ref(), &storage_key(STORE), &subscriptions).await
    }
}
