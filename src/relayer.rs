//! Relay orchestration. Owns the transport and wires the publisher,
//! subscriber and message tracker together: inbound `irn_subscription`
//! notifications are acknowledged, deduplicated and fanned out to listeners,
//! and disconnects or publish stalls drive a reconnect-then-resubscribe pass.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use log::{debug, warn};
use serde_json::Value;
use tokio::sync::{Mutex, broadcast, mpsc};

use crate::constants::RECONNECT_DELAY;
use crate::error::{Error, Result};
use crate::message_tracker::MessageTracker;
use crate::publisher::{PublishOptions, Publisher};
use crate::rpc::{JsonRpcRequest, RelayMethod, SubscriptionParams};
use crate::storage::KeyValueStorage;
use crate::subscriber::Subscriber;
use crate::transport::{RelayTransport, TransportEvent};

const EVENT_CAPACITY: usize = 256;

/// An inbound relay message on a subscribed topic, after acknowledgement and
/// deduplication.
#[derive(Clone, Debug)]
pub struct MessageEvent {
    pub topic: String,
    pub message: String,
    pub published_at: Option<u64>,
    pub tag: Option<u32>,
}

pub struct Relayer {
    transport: Arc<dyn RelayTransport>,
    pub publisher: Arc<Publisher>,
    pub subscriber: Arc<Subscriber>,
    pub messages: Arc<MessageTracker>,
    events: broadcast::Sender<MessageEvent>,
    stall_rx: Mutex<Option<mpsc::UnboundedReceiver<()>>>,
    initialized: AtomicBool,
}

impl Relayer {
    pub fn new(
        transport: Arc<dyn RelayTransport>,
        storage: Arc<dyn KeyValueStorage>,
        client_id: String,
    ) -> Arc<Self> {
        let (stall_tx, stall_rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Arc::new(Self {
            publisher: Arc::new(Publisher::new(transport.clone(), stall_tx)),
            subscriber: Arc::new(Subscriber::new(
                transport.clone(),
                storage.clone(),
                client_id,
            )),
            messages: Arc::new(MessageTracker::new(storage)),
            transport,
            events,
            stall_rx: Mutex::new(Some(stall_rx)),
            initialized: AtomicBool::new(false),
        })
    }

    pub async fn init(self: &Arc<Self>) -> Result<()> {
        if self.initialized.load(Ordering::SeqCst) {
            return Ok(());
        }
        self.subscriber.init().await?;
        self.messages.init().await?;
        self.transport.connect().await?;
        self.spawn_event_loop();
        self.initialized.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn check_initialized(&self) -> Result<()> {
        if !self.initialized.load(Ordering::SeqCst) {
            return Err(Error::NotInitialized("relayer".to_string()));
        }
        Ok(())
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<MessageEvent> {
        self.events.subscribe()
    }

    pub async fn publish(
        &self,
        topic: &str,
        message: &str,
        opts: PublishOptions,
    ) -> Result<()> {
        self.check_initialized()?;
        self.publisher.publish(topic, message, opts).await
    }

    pub async fn subscribe(&self, topic: &str) -> Result<String> {
        self.check_initialized()?;
        self.subscriber.subscribe(topic).await
    }

    pub async fn unsubscribe(&self, topic: &str) -> Result<()> {
        self.check_initialized()?;
        self.subscriber.unsubscribe(topic).await?;
        self.messages.delete(topic).await
    }

    fn spawn_event_loop(self: &Arc<Self>) {
        let relayer = self.clone();
        // Subscribe before spawning so frames delivered between init()
        // returning and the task's first poll are not lost.
        let mut transport_events = self.transport.subscribe_events();
        tokio::spawn(async move {
            let mut stall_rx = relayer
                .stall_rx
                .lock()
                .await
                .take()
                .unwrap_or_else(|| mpsc::unbounded_channel().1);
            loop {
                tokio::select! {
                    event = transport_events.recv() => match event {
                        Ok(TransportEvent::Message(raw)) => {
                            if let Err(e) = relayer.handle_inbound(&raw).await {
                                warn!("dropping inbound relay frame: {e}");
                            }
                        }
                        Ok(TransportEvent::Disconnected) => {
                            relayer.reconnect().await;
                        }
                        Ok(TransportEvent::Error(message)) => {
                            warn!("transport error: {message}");
                        }
                        Ok(TransportEvent::Connected) => {}
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            warn!("transport event stream lagged by {n}");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                    stall = stall_rx.recv() => match stall {
                        Some(()) => relayer.reconnect().await,
                        None => break,
                    },
                }
            }
        });
    }

    async fn handle_inbound(&self, raw: &str) -> Result<()> {
        let request: JsonRpcRequest<SubscriptionParams> = serde_json::from_str(raw)?;
        if request.method != RelayMethod::Subscription {
            debug!("ignoring relay method {:?}", request.method);
            return Ok(());
        }
        let data = request.params.data;

        // Ack before anything else so the relay stops redelivering.
        self.transport.respond(request.id, Value::Bool(true)).await?;

        if !self.subscriber.is_subscribed(&data.topic).await {
            debug!("message on unsubscribed topic {}", data.topic);
            return Ok(());
        }
        if self.messages.has(&data.topic, &data.message).await? {
            debug!("duplicate message on {}", data.topic);
            return Ok(());
        }
        self.messages.set(&data.topic, &data.message).await?;

        let _ = self.events.send(MessageEvent {
            topic: data.topic,
            message: data.message,
            published_at: data.published_at,
            tag: data.tag,
        });
        Ok(())
    }

    /// Reconnects with a fixed delay between attempts, then re-establishes
    /// every subscription before new traffic is allowed through.
    async fn reconnect(&self) {
        loop {
            tokio::time::sleep(Duration::from_secs(RECONNECT_DELAY)).await;
            match self.transport.connect().await {
                Ok(()) => break,
                Err(e) => warn!("reconnect failed, retrying: {e}"),
            }
        }
        if let Err(e) = self.subscriber.restart().await {
            warn!("resubscribe after reconnect failed: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;

    use super::*;
    use crate::rpc::SubscriptionData;
    use crate::storage::MemoryStorage;

    struct ChannelTransport {
        events: broadcast::Sender<TransportEvent>,
        responses: std::sync::Mutex<Vec<u64>>,
    }

    impl ChannelTransport {
        fn new() -> Arc<Self> {
            let (events, _) = broadcast::channel(16);
            Arc::new(Self {
                events,
                responses: std::sync::Mutex::new(Vec::new()),
            })
        }

        fn deliver(&self, topic: &str, message: &str) {
            let request = JsonRpcRequest::new(
                RelayMethod::Subscription,
                serde_json::json!(SubscriptionParams {
                    id: "sub-id".to_string(),
                    data: SubscriptionData {
                        topic: topic.to_string(),
                        message: message.to_string(),
                        published_at: None,
                        tag: Some(1100),
                    },
                }),
            );
            let raw = serde_json::to_string(&request).unwrap();
            let _ = self.events.send(TransportEvent::Message(raw));
        }
    }

    #[async_trait]
    impl RelayTransport for ChannelTransport {
        async fn connect(&self) -> Result<()> {
            Ok(())
        }

        async fn disconnect(&self) -> Result<()> {
            Ok(())
        }

        async fn request(&self, _request: JsonRpcRequest) -> Result<Value> {
            Ok(Value::Bool(true))
        }

        async fn respond(&self, id: u64, _result: Value) -> Result<()> {
            self.responses.lock().unwrap().push(id);
            Ok(())
        }

        fn subscribe_events(&self) -> broadcast::Receiver<TransportEvent> {
            self.events.subscribe()
        }
    }

    async fn relayer(transport: Arc<ChannelTransport>) -> Arc<Relayer> {
        let relayer = Relayer::new(
            transport,
            Arc::new(MemoryStorage::new()),
            "client-id".to_string(),
        );
        relayer.init().await.unwrap();
        relayer
    }

    #[tokio::test]
    async fn inbound_message_is_acked_and_emitted() {
        let transport = ChannelTransport::new();
        let relayer = relayer(transport.clone()).await;
        relayer.subscribe("topic").await.unwrap();
        let mut events = relayer.subscribe_events();

        transport.deliver("topic", "payload");
        let event = events.recv().await.unwrap();
        assert_eq!(event.topic, "topic");
        assert_eq!(event.message, "payload");
        assert_eq!(event.tag, Some(1100));
        assert_eq!(transport.responses.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn duplicate_delivery_is_acked_but_not_reemitted() {
        let transport = ChannelTransport::new();
        let relayer = relayer(transport.clone()).await;
        relayer.subscribe("topic").await.unwrap();
        let mut events = relayer.subscribe_events();

        transport.deliver("topic", "payload");
        events.recv().await.unwrap();

        transport.deliver("topic", "payload");
        transport.deliver("topic", "other");
        let event = events.recv().await.unwrap();
        assert_eq!(event.message, "other");
        // Both redeliveries were still acknowledged.
        assert_eq!(transport.responses.lock().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn malformed_frames_are_ignored() {
        let transport = ChannelTransport::new();
        let relayer = relayer(transport.clone()).await;
        relayer.subscribe("topic").await.unwrap();
        let mut events = relayer.subscribe_events();

        let _ = transport.events.send(TransportEvent::Message("not json".into()));
        transport.deliver("topic", "payload");
        let event = events.recv().await.unwrap();
        assert_eq!(event.message, "payload");
    }

    #[tokio::test]
    async fn unsubscribed_topic_is_acked_but_dropped() {
        let transport = ChannelTransport::new();
        let relayer = relayer(transport.clone()).await;
        relayer.subscribe("known").await.unwrap();
        let mut events = relayer.subscribe_events();

        transport.deliver("unknown", "payload");
        transport.deliver("known", "payload");
        let event = events.recv().await.unwrap();
        assert_eq!(event.topic, "known");
        assert_eq!(transport.responses.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn publish_requires_init() {
        let relayer = Relayer::new(
            ChannelTransport::new(),
            Arc::new(MemoryStorage::new()),
            "client-id".to_string(),
        );
        let result = relayer
            .publish(
                "topic",
                "msg",
                PublishOptions {
                    ttl: 300,
                    tag: 1100,
                    prompt: false,
                },
            )
            .await;
        assert!(matches!(result, Err(Error::NotInitialized(_))));
    }
}
