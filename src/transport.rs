//! The connection to the relay is an external collaborator: a persistent
//! bidirectional message link with connect/disconnect/error events and raw
//! inbound delivery. The core consumes only the JSON-RPC request/response
//! framing and the raw-message event defined here.

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::broadcast;

use crate::error::Result;
use crate::rpc::JsonRpcRequest;

#[derive(Clone, Debug)]
pub enum TransportEvent {
    Connected,
    Disconnected,
    /// Raw payload pushed by the relay (a relay-initiated JSON-RPC request).
    Message(String),
    Error(String),
}

#[async_trait]
pub trait RelayTransport: Send + Sync {
    async fn connect(&self) -> Result<()>;

    async fn disconnect(&self) -> Result<()>;

    /// Sends a JSON-RPC request and resolves with its result. Correlation of
    /// the response is the transport's concern.
    async fn request(&self, request: JsonRpcRequest) -> Result<Value>;

    /// Answers a relay-initiated request (e.g. acknowledges a subscription
    /// delivery).
    async fn respond(&self, id: u64, result: Value) -> Result<()>;

    fn subscribe_events(&self) -> broadcast::Receiver<TransportEvent>;
}
