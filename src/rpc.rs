//! JSON-RPC framing towards the relay.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::utils::unix_timestamp_ms;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum RelayMethod {
    #[serde(rename = "irn_publish")]
    Publish,

    #[serde(rename = "irn_subscribe")]
    Subscribe,

    #[serde(rename = "irn_batchSubscribe")]
    BatchSubscribe,

    #[serde(rename = "irn_unsubscribe")]
    Unsubscribe,

    /// Relay-initiated delivery of a message on a subscribed topic.
    #[serde(rename = "irn_subscription")]
    Subscription,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct JsonRpcRequest<ParamType = Value> {
    pub jsonrpc: String,
    pub method: RelayMethod,
    pub params: ParamType,
    pub id: u64,
}

impl JsonRpcRequest {
    pub fn new(method: RelayMethod, params: Value) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            method,
            params,
            id: generate_id(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct JsonRpcResponse<ResultType = Value> {
    pub jsonrpc: String,
    #[serde(default)]
    pub result: Option<ResultType>,
    #[serde(default)]
    pub error: Option<JsonRpcError>,
    #[serde(default)]
    pub id: Option<u64>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct JsonRpcError {
    pub code: i64,
    pub message: String,
    #[serde(default)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PublishParams {
    pub topic: String,
    pub message: String,
    pub ttl: u64,
    pub tag: u32,
    pub prompt: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SubscribeParams {
    pub topic: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BatchSubscribeParams {
    pub topics: Vec<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct UnsubscribeParams {
    pub topic: String,
    pub id: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SubscriptionParams {
    pub id: String,
    pub data: SubscriptionData,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SubscriptionData {
    pub topic: String,
    pub message: String,
    #[serde(rename = "publishedAt")]
    #[serde(default)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub published_at: Option<u64>,
    #[serde(default)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tag: Option<u32>,
}

static ID_ENTROPY: AtomicU64 = AtomicU64::new(0);

/// Millisecond-timestamp based id with a rolling low-order component, unique
/// within a process and monotonic enough for correlation by id.
pub fn generate_id() -> u64 {
    let now_ms = unix_timestamp_ms().unwrap_or_default() as u64;
    let extra = ID_ENTROPY.fetch_add(1, Ordering::Relaxed) % 1000;
    now_ms * 1000 + extra
}
