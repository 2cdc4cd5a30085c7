//! At-least-once outbound publishing. Envelopes are queued by content hash
//! (an identical resend replaces the pending entry), attempted immediately
//! with a 45 second bound, and retried on every heartbeat until the relay
//! acknowledges. RPC failures never reach the publish caller; they raise the
//! connection-stalled signal that drives reconnection.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, warn};
use serde_json::json;
use tokio::sync::{Mutex, broadcast, mpsc};

use crate::constants::PUBLISH_TIMEOUT;
use crate::error::Result;
use crate::heartbeat::HeartBeat;
use crate::rpc::{JsonRpcRequest, PublishParams, RelayMethod};
use crate::transport::RelayTransport;
use crate::utils::sha256_hex;

const EVENT_CAPACITY: usize = 64;

#[derive(Clone, Debug)]
pub struct PublishOptions {
    pub ttl: u64,
    pub tag: u32,
    pub prompt: bool,
}

#[derive(Clone, Debug)]
pub struct PublishedEvent {
    pub topic: String,
    pub hash: String,
}

pub struct Publisher {
    transport: Arc<dyn RelayTransport>,
    // Keyed by message hash; the heartbeat sweep runs from its own task, so
    // the queue is lock-protected rather than owned by a single task.
    queue: Mutex<HashMap<String, PublishParams>>,
    stall_tx: mpsc::UnboundedSender<()>,
    events: broadcast::Sender<PublishedEvent>,
}

impl Publisher {
    pub fn new(
        transport: Arc<dyn RelayTransport>,
        stall_tx: mpsc::UnboundedSender<()>,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            transport,
            queue: Mutex::new(HashMap::new()),
            stall_tx,
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PublishedEvent> {
        self.events.subscribe()
    }

    /// Retries everything still queued on every heartbeat pulse.
    pub fn attach(self: &Arc<Self>, heartbeat: &HeartBeat) {
        let publisher = self.clone();
        let mut ticks = heartbeat.subscribe();
        tokio::spawn(async move {
            while ticks.recv().await.is_ok() {
                let publisher = publisher.clone();
                tokio::spawn(async move {
                    publisher.retry_queued().await;
                });
            }
        });
    }

    /// Queues and immediately attempts the publish. Does not error on relay
    /// failure; the entry stays queued for the next sweep.
    pub async fn publish(
        &self,
        topic: &str,
        message: &str,
        opts: PublishOptions,
    ) -> Result<()> {
        let hash = sha256_hex(message);
        let params = PublishParams {
            topic: topic.to_string(),
            message: message.to_string(),
            ttl: opts.ttl,
            tag: opts.tag,
            prompt: opts.prompt,
        };

        self.queue.lock().await.insert(hash.clone(), params.clone());
        self.attempt(&hash, params).await;
        Ok(())
    }

    /// Drops a queued entry without publishing it.
    pub async fn remove(&self, message: &str) {
        self.queue.lock().await.remove(&sha256_hex(message));
    }

    pub async fn queued_count(&self) -> usize {
        self.queue.lock().await.len()
    }

    async fn retry_queued(&self) {
        let queued: Vec<(String, PublishParams)> = self
            .queue
            .lock()
            .await
            .iter()
            .map(|(hash, params)| (hash.clone(), params.clone()))
            .collect();
        for (hash, params) in queued {
            self.attempt(&hash, params).await;
        }
    }

    async fn attempt(&self, hash: &str, params: PublishParams) {
        let topic = params.topic.clone();
        let request = JsonRpcRequest::new(
            RelayMethod::Publish,
            json!(params),
        );

        let result = tokio::time::timeout(
            Duration::from_secs(PUBLISH_TIMEOUT),
            self.transport.request(request),
        )
        .await;

        match result {
            Ok(Ok(_)) => {
                self.queue.lock().await.remove(hash);
                debug!("published on {topic}");
                let _ = self.events.send(PublishedEvent {
                    topic,
                    hash: hash.to_string(),
                });
            }
            Ok(Err(e)) => {
                warn!("publish on {topic} failed, will retry: {e}");
                let _ = self.stall_tx.send(());
            }
            Err(_elapsed) => {
                warn!("publish on {topic} timed out, will retry");
                let _ = self.stall_tx.send(());
            }
        }
    }
}
