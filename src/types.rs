//! Protocol data model: pairings, sessions, proposals and the serde shapes
//! they share with the wire payloads.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Relay protocol options carried in URIs, proposals and settled sessions.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Relay {
    pub protocol: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
}

impl Default for Relay {
    fn default() -> Self {
        Relay {
            protocol: crate::constants::RELAY_PROTOCOL.to_string(),
            data: None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Metadata {
    pub name: String,
    pub description: String,
    pub url: String,
    pub icons: Vec<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Participant {
    #[serde(rename = "publicKey")]
    pub public_key: String,
    pub metadata: Metadata,
}

/// A CAIP-scoped capability set. Proposals carry it without accounts;
/// approval fills the accounts in.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Namespace {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub accounts: Option<Vec<String>>,
    pub chains: Vec<String>,
    pub methods: Vec<String>,
    pub events: Vec<String>,
}

pub type Namespaces = HashMap<String, Namespace>;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PairingStruct {
    pub topic: String,
    pub expiry: u64,
    pub relay: Relay,
    pub active: bool,
    #[serde(rename = "peerMetadata")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub peer_metadata: Option<Metadata>,
}

/// Explicit partial update for a pairing; merged field by field.
#[derive(Clone, Debug, Default)]
pub struct PairingPatch {
    pub expiry: Option<u64>,
    pub active: Option<bool>,
    pub peer_metadata: Option<Metadata>,
}

impl PairingPatch {
    pub fn apply(self, pairing: &mut PairingStruct) {
        if let Some(expiry) = self.expiry {
            pairing.expiry = expiry;
        }
        if let Some(active) = self.active {
            pairing.active = active;
        }
        if let Some(peer_metadata) = self.peer_metadata {
            pairing.peer_metadata = Some(peer_metadata);
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ProposalStruct {
    pub id: u64,
    #[serde(rename = "pairingTopic")]
    pub pairing_topic: String,
    pub expiry: u64,
    pub proposer: Participant,
    pub relays: Vec<Relay>,
    #[serde(rename = "requiredNamespaces")]
    pub required_namespaces: Namespaces,
    #[serde(rename = "optionalNamespaces")]
    #[serde(default)]
    pub optional_namespaces: Namespaces,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SessionStruct {
    pub topic: String,
    pub relay: Relay,
    pub expiry: u64,
    pub acknowledged: bool,
    /// Public key of the controlling participant.
    pub controller: String,
    pub namespaces: Namespaces,
    #[serde(rename = "requiredNamespaces")]
    pub required_namespaces: Namespaces,
    #[serde(rename = "self")]
    pub self_participant: Participant,
    pub peer: Participant,
}

/// Explicit partial update for a session; merged field by field.
#[derive(Clone, Debug, Default)]
pub struct SessionPatch {
    pub expiry: Option<u64>,
    pub acknowledged: Option<bool>,
    pub namespaces: Option<Namespaces>,
}

impl SessionPatch {
    pub fn apply(self, session: &mut SessionStruct) {
        if let Some(expiry) = self.expiry {
            session.expiry = expiry;
        }
        if let Some(acknowledged) = self.acknowledged {
            session.acknowledged = acknowledged;
        }
        if let Some(namespaces) = self.namespaces {
            session.namespaces = namespaces;
        }
    }
}
