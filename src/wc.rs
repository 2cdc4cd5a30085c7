//! Typed sign-protocol payloads carried inside envelopes, plus the static
//! publish policy (relay tag and TTL) for each method.

use std::fmt::Display;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::rpc::generate_id;
use crate::types::{Namespaces, Participant, Relay};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WcMethod {
    #[serde(rename = "wc_pairingDelete")]
    PairingDelete,

    #[serde(rename = "wc_pairingPing")]
    PairingPing,

    #[serde(rename = "wc_sessionPropose")]
    SessionPropose,

    #[serde(rename = "wc_sessionSettle")]
    SessionSettle,

    #[serde(rename = "wc_sessionUpdate")]
    SessionUpdate,

    #[serde(rename = "wc_sessionExtend")]
    SessionExtend,

    #[serde(rename = "wc_sessionRequest")]
    SessionRequest,

    #[serde(rename = "wc_sessionEvent")]
    SessionEvent,

    #[serde(rename = "wc_sessionDelete")]
    SessionDelete,

    #[serde(rename = "wc_sessionPing")]
    SessionPing,
}

impl Display for WcMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", serde_plain::to_string(self).unwrap())
    }
}

impl FromStr for WcMethod {
    type Err = crate::error::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        serde_plain::from_str(s).map_err(|_| {
            crate::error::Error::MissingOrInvalid(format!("unknown method {s}"))
        })
    }
}

impl WcMethod {
    /// Relay tag for the request carrying this method.
    pub fn request_tag(self) -> u32 {
        match self {
            WcMethod::PairingDelete => 1000,
            WcMethod::PairingPing => 1002,
            WcMethod::SessionPropose => 1100,
            WcMethod::SessionSettle => 1102,
            WcMethod::SessionUpdate => 1104,
            WcMethod::SessionExtend => 1106,
            WcMethod::SessionRequest => 1108,
            WcMethod::SessionEvent => 1110,
            WcMethod::SessionDelete => 1112,
            WcMethod::SessionPing => 1114,
        }
    }

    /// Relay tag for the response to this method.
    pub fn response_tag(self) -> u32 {
        self.request_tag() + 1
    }

    /// Relay TTL, in seconds, for both directions of this method.
    pub fn ttl(self) -> u64 {
        match self {
            WcMethod::PairingPing | WcMethod::SessionPing => 30,
            WcMethod::SessionPropose
            | WcMethod::SessionSettle
            | WcMethod::SessionRequest
            | WcMethod::SessionEvent => 300,
            WcMethod::PairingDelete
            | WcMethod::SessionUpdate
            | WcMethod::SessionExtend
            | WcMethod::SessionDelete => 86400,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WcRequest {
    pub id: u64,
    pub jsonrpc: String,
    pub method: WcMethod,
    pub params: Value,
}

impl WcRequest {
    pub fn new(method: WcMethod, params: Value) -> Self {
        Self {
            id: generate_id(),
            jsonrpc: "2.0".to_string(),
            method,
            params,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WcResponse {
    pub id: u64,
    pub jsonrpc: String,
    #[serde(default)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorResponse>,
}

impl WcResponse {
    pub fn result(id: u64, result: Value) -> Self {
        Self {
            id,
            jsonrpc: "2.0".to_string(),
            result: Some(result),
            error: None,
        }
    }

    pub fn error(id: u64, error: ErrorResponse) -> Self {
        Self {
            id,
            jsonrpc: "2.0".to_string(),
            result: None,
            error: Some(error),
        }
    }
}

/// A decrypted payload is either a request to handle or a response to
/// correlate by id.
#[derive(Clone, Debug)]
pub enum WcPayload {
    Request(WcRequest),
    Response(WcResponse),
}

impl WcPayload {
    pub fn parse(raw: &str) -> crate::error::Result<WcPayload> {
        let value: Value = serde_json::from_str(raw)?;
        if value.get("method").is_some() {
            Ok(WcPayload::Request(serde_json::from_value(value)?))
        } else {
            Ok(WcPayload::Response(serde_json::from_value(value)?))
        }
    }
}

/// Error shape shared by peer error responses and delete reasons.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub code: i64,
    pub message: String,
    #[serde(default)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SessionProposeParams {
    pub relays: Vec<Relay>,
    pub proposer: Participant,
    #[serde(rename = "requiredNamespaces")]
    pub required_namespaces: Namespaces,
    #[serde(rename = "optionalNamespaces")]
    #[serde(default)]
    pub optional_namespaces: Namespaces,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SessionProposeResponse {
    pub relay: Relay,
    #[serde(rename = "responderPublicKey")]
    pub responder_public_key: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SessionSettleParams {
    pub relay: Relay,
    pub controller: Participant,
    pub namespaces: Namespaces,
    pub expiry: u64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SessionUpdateParams {
    pub namespaces: Namespaces,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SessionRequestParams {
    pub request: RequestPayload,
    #[serde(rename = "chainId")]
    pub chain_id: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RequestPayload {
    pub method: String,
    pub params: Value,
    #[serde(default)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expiry: Option<u64>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SessionEventParams {
    pub event: EventPayload,
    #[serde(rename = "chainId")]
    pub chain_id: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EventPayload {
    pub name: String,
    pub data: Value,
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn method_names_serialize_to_wire_form() {
        assert_eq!(
            serde_json::to_string(&WcMethod::SessionPropose).unwrap(),
            "\"wc_sessionPropose\""
        );
        let back: WcMethod = serde_json::from_str("\"wc_pairingPing\"").unwrap();
        assert_eq!(back, WcMethod::PairingPing);
        assert_eq!(WcMethod::SessionDelete.to_string(), "wc_sessionDelete");
        assert_eq!(
            "wc_sessionExtend".parse::<WcMethod>().unwrap(),
            WcMethod::SessionExtend
        );
        assert!("wc_bogus".parse::<WcMethod>().is_err());
    }

    #[test]
    fn publish_policy_matches_protocol_table() {
        assert_eq!(WcMethod::PairingDelete.request_tag(), 1000);
        assert_eq!(WcMethod::PairingDelete.response_tag(), 1001);
        assert_eq!(WcMethod::PairingDelete.ttl(), 86400);
        assert_eq!(WcMethod::SessionPropose.request_tag(), 1100);
        assert_eq!(WcMethod::SessionPropose.ttl(), 300);
        assert_eq!(WcMethod::SessionRequest.request_tag(), 1108);
        assert_eq!(WcMethod::SessionPing.request_tag(), 1114);
        assert_eq!(WcMethod::SessionPing.ttl(), 30);
    }

    #[test]
    fn payload_parse_distinguishes_request_and_response() {
        let request = WcRequest::new(WcMethod::SessionPing, json!({}));
        let raw = serde_json::to_string(&request).unwrap();
        assert!(matches!(
            WcPayload::parse(&raw).unwrap(),
            WcPayload::Request(_)
        ));

        let response = WcResponse::result(request.id, json!(true));
        let raw = serde_json::to_string(&response).unwrap();
        match WcPayload::parse(&raw).unwrap() {
            WcPayload::Response(r) => assert_eq!(r.id, request.id),
            WcPayload::Request(_) => panic!("parsed as request"),
        }
    }

    #[test]
    fn error_response_round_trips() {
        let response = WcResponse::error(
            7,
            ErrorResponse {
                code: 5104,
                message: "non conforming namespaces".into(),
                data: None,
            },
        );
        let raw = serde_json::to_string(&response).unwrap();
        match WcPayload::parse(&raw).unwrap() {
            WcPayload::Response(r) => {
                assert_eq!(r.error.unwrap().code, 5104);
                assert!(r.result.is_none());
            }
            WcPayload::Request(_) => panic!("parsed as request"),
        }
    }
}
