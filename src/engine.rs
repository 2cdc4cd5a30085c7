//! Pairing and session state machine on top of [`Core`]. One engine instance
//! serves both roles: propose sessions over a pairing (dapp side) and approve
//! or reject incoming proposals (wallet side). Inbound envelopes arriving
//! from the relayer are decrypted, recorded into history and dispatched here;
//! validation failures become JSON-RPC error responses to the peer.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use log::{debug, warn};
use serde_json::{Value, json};
use tokio::sync::{Mutex, broadcast, oneshot};

use crate::constants::{
    PAIRING_ACTIVE_EXPIRY, PAIRING_PENDING_EXPIRY, PROPOSAL_EXPIRY,
    SESSION_EXPIRY, URI_VERSION,
};
use crate::core::Core;
use crate::crypto::{DecodeOptions, EncodeOptions};
use crate::error::{Error, Result};
use crate::expirer::{ExpirerEvent, parse_target};
use crate::history::JsonRpcHistory;
use crate::namespaces::{assert_conforming, namespace_chains};
use crate::publisher::PublishOptions;
use crate::relayer::MessageEvent;
use crate::store::Store;
use crate::types::{
    Metadata, Namespaces, PairingPatch, PairingStruct, Participant,
    ProposalStruct, Relay, SessionPatch, SessionStruct,
};
use crate::utils::{format_uri, parse_uri, random_bytes32, unix_timestamp};
use crate::wc::{
    ErrorResponse, EventPayload, RequestPayload, SessionEventParams,
    SessionProposeParams, SessionProposeResponse, SessionRequestParams,
    SessionSettleParams, SessionUpdateParams, WcMethod, WcPayload, WcRequest,
    WcResponse,
};

const EVENT_CAPACITY: usize = 256;

/// Application-facing engine notifications.
#[derive(Clone, Debug)]
pub enum EngineEvent {
    SessionProposal(ProposalStruct),
    /// A peer settled a session we proposed.
    SessionConnected(SessionStruct),
    /// The peer acknowledged a session we settled.
    SessionAcknowledged { topic: String },
    SessionRequest {
        topic: String,
        id: u64,
        chain_id: String,
        request: RequestPayload,
    },
    SessionEvent {
        topic: String,
        chain_id: String,
        event: EventPayload,
    },
    SessionUpdated { topic: String, namespaces: Namespaces },
    SessionExtended { topic: String, expiry: u64 },
    SessionDeleted {
        topic: String,
        reason: Option<ErrorResponse>,
    },
    PairingDeleted { topic: String },
    PairingPing { topic: String },
    SessionPing { topic: String },
    ProposalExpired { id: u64 },
    ProposalRejected { id: u64, error: ErrorResponse },
}

#[derive(Clone, Debug, Default)]
pub struct ConnectParams {
    pub required_namespaces: Namespaces,
    pub optional_namespaces: Namespaces,
    /// Reuse an existing pairing instead of minting a new one.
    pub pairing_topic: Option<String>,
}

#[derive(Clone, Debug)]
pub struct Connection {
    pub pairing_topic: String,
    /// Present only when a fresh pairing was created for this proposal.
    pub uri: Option<String>,
    pub proposal_id: u64,
}

/// Wallet-side bookkeeping between sending `wc_sessionSettle` and receiving
/// its acknowledgement.
#[derive(Clone, Debug)]
struct Settlement {
    session_topic: String,
    pairing_topic: String,
    proposal_id: u64,
}

pub struct Engine {
    pub core: Arc<Core>,
    metadata: Metadata,
    pub pairings: Store<PairingStruct>,
    pub sessions: Store<SessionStruct>,
    pub proposals: Store<ProposalStruct>,
    pub history: JsonRpcHistory,
    events: broadcast::Sender<EngineEvent>,
    waiters: Mutex<HashMap<u64, oneshot::Sender<WcResponse>>>,
    /// Proposer side: session topic -> proposal id, set once the propose
    /// response arrives, consumed when the settle request lands.
    pending_sessions: Mutex<HashMap<String, u64>>,
    /// Responder side: settle request id -> settlement context.
    settlements: Mutex<HashMap<u64, Settlement>>,
    initialized: AtomicBool,
}

impl Engine {
    pub fn new(core: Arc<Core>, metadata: Metadata) -> Arc<Self> {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Arc::new(Self {
            pairings: Store::new("pairing", core.storage.clone()),
            sessions: Store::new("session", core.storage.clone()),
            proposals: Store::new("proposal", core.storage.clone()),
            history: JsonRpcHistory::new(core.storage.clone()),
            core,
            metadata,
            events,
            waiters: Mutex::new(HashMap::new()),
            pending_sessions: Mutex::new(HashMap::new()),
            settlements: Mutex::new(HashMap::new()),
            initialized: AtomicBool::new(false),
        })
    }

    pub async fn init(self: &Arc<Self>) -> Result<()> {
        if self.initialized.load(Ordering::SeqCst) {
            return Ok(());
        }
        self.pairings.init().await?;
        self.sessions.init().await?;
        self.proposals.init().await?;
        self.history.init().await?;
        self.spawn_message_loop();
        self.spawn_expirer_loop();
        self.initialized.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn check_initialized(&self) -> Result<()> {
        if !self.initialized.load(Ordering::SeqCst) {
            return Err(Error::NotInitialized("engine".to_string()));
        }
        Ok(())
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<EngineEvent> {
        self.events.subscribe()
    }

    // ---- pairing ----

    /// Mints an inactive pairing and the URI to hand to the peer out of band.
    pub async fn create_pairing(&self) -> Result<(String, String)> {
        self.check_initialized()?;
        let sym_key = random_bytes32();
        let topic = self.core.crypto.set_sym_key(sym_key, None).await?;
        let relay = Relay::default();
        let expiry = unix_timestamp()? + PAIRING_PENDING_EXPIRY;

        self.pairings
            .set(
                &topic,
                PairingStruct {
                    topic: topic.clone(),
                    expiry,
                    relay: relay.clone(),
                    active: false,
                    peer_metadata: None,
                },
            )
            .await?;
        self.core.expirer.set(&topic, expiry).await?;
        self.core.relayer.subscribe(&topic).await?;

        let uri = format_uri(&topic, &sym_key, &relay);
        Ok((topic, uri))
    }

    /// Joins a pairing from a URI received out of band.
    pub async fn pair(&self, uri: &str) -> Result<PairingStruct> {
        self.check_initialized()?;
        let params = parse_uri(uri)?;
        if params.version != URI_VERSION {
            return Err(Error::MissingOrInvalid(format!(
                "unsupported uri version {}",
                params.version
            )));
        }

        self.core
            .crypto
            .set_sym_key(params.sym_key, Some(params.topic.clone()))
            .await?;
        let expiry = unix_timestamp()? + PAIRING_PENDING_EXPIRY;
        let pairing = PairingStruct {
            topic: params.topic.clone(),
            expiry,
            relay: params.relay,
            active: false,
            peer_metadata: None,
        };
        self.pairings.set(&params.topic, pairing.clone()).await?;
        self.core.expirer.set(&params.topic, expiry).await?;
        self.core.relayer.subscribe(&params.topic).await?;
        Ok(pairing)
    }

    /// Promotes a pairing to active with the long expiry. Runs on the first
    /// acknowledged exchange over it.
    pub async fn activate_pairing(&self, topic: &str) -> Result<()> {
        let mut pairing = self.pairings.get(topic).await?;
        let expiry = unix_timestamp()? + PAIRING_ACTIVE_EXPIRY;
        PairingPatch {
            active: Some(true),
            expiry: Some(expiry),
            peer_metadata: None,
        }
        .apply(&mut pairing);
        self.pairings.set(topic, pairing).await?;
        self.core.expirer.set(topic, expiry).await
    }

    /// Round-trip liveness probe; resolves when the peer answers. Dispatches
    /// on whether the topic names a session or a pairing.
    pub async fn ping(&self, topic: &str) -> Result<()> {
        self.check_initialized()?;
        let method = if self.sessions.has(topic).await {
            self.live_session(topic).await?;
            WcMethod::SessionPing
        } else if self.pairings.has(topic).await {
            self.live_pairing(topic).await?;
            WcMethod::PairingPing
        } else {
            return Err(Error::NoMatchingKey("engine".to_string(), topic.to_string()));
        };
        let request = WcRequest::new(method, json!({}));
        let rx = self.register_waiter(request.id).await;
        self.publish_prepared(topic, &request, None).await?;
        self.await_response(rx).await?;
        Ok(())
    }

    /// Tears the pairing down on both ends.
    pub async fn disconnect_pairing(&self, topic: &str) -> Result<()> {
        self.check_initialized()?;
        self.live_pairing(topic).await?;
        let reason = Error::UserDisconnected.to_error_response();
        self.publish_request(topic, WcMethod::PairingDelete, json!(reason), None)
            .await?;
        self.cleanup_pairing(topic).await
    }

    // ---- session proposal ----

    /// Proposes a session, minting a pairing when none is supplied.
    pub async fn connect(&self, params: ConnectParams) -> Result<Connection> {
        self.check_initialized()?;
        let (pairing_topic, uri) = match params.pairing_topic {
            Some(topic) => {
                // Must be a pairing we know, and still alive.
                self.live_pairing(&topic).await?;
                (topic, None)
            }
            None => {
                let (topic, uri) = self.create_pairing().await?;
                (topic, Some(uri))
            }
        };

        let public_key = self.core.crypto.generate_key_pair().await?;
        let proposer = Participant {
            public_key,
            metadata: self.metadata.clone(),
        };
        let propose = SessionProposeParams {
            relays: vec![Relay::default()],
            proposer: proposer.clone(),
            required_namespaces: params.required_namespaces.clone(),
            optional_namespaces: params.optional_namespaces.clone(),
        };

        let proposal_id = self
            .publish_request(&pairing_topic, WcMethod::SessionPropose, json!(propose), None)
            .await?;

        let expiry = unix_timestamp()? + PROPOSAL_EXPIRY;
        self.proposals
            .set(
                &proposal_id.to_string(),
                ProposalStruct {
                    id: proposal_id,
                    pairing_topic: pairing_topic.clone(),
                    expiry,
                    proposer,
                    relays: vec![Relay::default()],
                    required_namespaces: params.required_namespaces,
                    optional_namespaces: params.optional_namespaces,
                },
            )
            .await?;
        self.core.expirer.set(&proposal_id.to_string(), expiry).await?;

        Ok(Connection {
            pairing_topic,
            uri,
            proposal_id,
        })
    }

    /// Approves a proposal: derives the session topic, answers on the pairing
    /// topic and settles on the session topic. The pairing only activates
    /// once the peer acknowledges the settlement.
    pub async fn approve(
        &self,
        proposal_id: u64,
        namespaces: Namespaces,
    ) -> Result<String> {
        self.check_initialized()?;
        let proposal = self.proposals.get(&proposal_id.to_string()).await?;
        if proposal.expiry < unix_timestamp()? {
            self.drop_proposal(proposal_id).await?;
            return Err(Error::Expired(format!("proposal {proposal_id}")));
        }
        assert_conforming(&proposal.required_namespaces, &namespaces)?;

        let self_public_key = self.core.crypto.generate_key_pair().await?;
        let session_topic = self
            .core
            .crypto
            .generate_shared_key(&self_public_key, &proposal.proposer.public_key, None)
            .await?;
        self.core.relayer.subscribe(&session_topic).await?;

        // Propose response travels on the pairing topic.
        self.send_response(
            &proposal.pairing_topic,
            WcMethod::SessionPropose,
            WcResponse::result(
                proposal_id,
                json!(SessionProposeResponse {
                    relay: Relay::default(),
                    responder_public_key: self_public_key.clone(),
                }),
            ),
        )
        .await?;

        let expiry = unix_timestamp()? + SESSION_EXPIRY;
        let controller = Participant {
            public_key: self_public_key.clone(),
            metadata: self.metadata.clone(),
        };
        let session = SessionStruct {
            topic: session_topic.clone(),
            relay: Relay::default(),
            expiry,
            acknowledged: false,
            controller: self_public_key,
            namespaces: namespaces.clone(),
            required_namespaces: proposal.required_namespaces.clone(),
            self_participant: controller.clone(),
            peer: proposal.proposer.clone(),
        };
        self.sessions.set(&session_topic, session).await?;
        self.core.expirer.set(&session_topic, expiry).await?;

        let settle_id = self
            .publish_request(
                &session_topic,
                WcMethod::SessionSettle,
                json!(SessionSettleParams {
                    relay: Relay::default(),
                    controller,
                    namespaces,
                    expiry,
                }),
                None,
            )
            .await?;
        self.settlements.lock().await.insert(
            settle_id,
            Settlement {
                session_topic: session_topic.clone(),
                pairing_topic: proposal.pairing_topic,
                proposal_id,
            },
        );
        Ok(session_topic)
    }

    /// Rejects a proposal with an error response on its pairing topic.
    pub async fn reject(&self, proposal_id: u64, reason: ErrorResponse) -> Result<()> {
        self.check_initialized()?;
        let proposal = self.proposals.get(&proposal_id.to_string()).await?;
        self.send_response(
            &proposal.pairing_topic,
            WcMethod::SessionPropose,
            WcResponse::error(proposal_id, reason),
        )
        .await?;
        self.drop_proposal(proposal_id).await
    }

    // ---- settled session operations ----

    /// Replaces the session namespaces after a conformance check.
    pub async fn update(&self, topic: &str, namespaces: Namespaces) -> Result<()> {
        self.check_initialized()?;
        let mut session = self.live_session(topic).await?;
        assert_conforming(&session.required_namespaces, &namespaces)?;

        self.publish_request(
            topic,
            WcMethod::SessionUpdate,
            json!(SessionUpdateParams {
                namespaces: namespaces.clone(),
            }),
            None,
        )
        .await?;
        SessionPatch {
            namespaces: Some(namespaces),
            ..Default::default()
        }
        .apply(&mut session);
        self.sessions.set(topic, session).await
    }

    /// Renews the session to the full expiry window.
    pub async fn extend(&self, topic: &str) -> Result<u64> {
        self.check_initialized()?;
        let mut session = self.live_session(topic).await?;
        let expiry = unix_timestamp()? + SESSION_EXPIRY;

        self.publish_request(topic, WcMethod::SessionExtend, json!({}), None)
            .await?;
        SessionPatch {
            expiry: Some(expiry),
            ..Default::default()
        }
        .apply(&mut session);
        self.sessions.set(topic, session).await?;
        self.core.expirer.set(topic, expiry).await?;
        Ok(expiry)
    }

    /// Sends a chain RPC request to the peer and awaits its answer. The call
    /// carries no internal timeout; bound it externally if needed.
    pub async fn request(
        &self,
        topic: &str,
        chain_id: &str,
        method: &str,
        params: Value,
    ) -> Result<Value> {
        self.check_initialized()?;
        let session = self.live_session(topic).await?;
        authorize_method(&session, chain_id, method)?;

        let request = WcRequest::new(
            WcMethod::SessionRequest,
            json!(SessionRequestParams {
                request: RequestPayload {
                    method: method.to_string(),
                    params,
                    expiry: None,
                },
                chain_id: chain_id.to_string(),
            }),
        );
        let rx = self.register_waiter(request.id).await;
        self.publish_prepared(topic, &request, Some(chain_id.to_string()))
            .await?;
        let response = self.await_response(rx).await?;
        match (response.result, response.error) {
            (Some(result), _) => Ok(result),
            (None, Some(error)) => Err(Error::Peer(error)),
            (None, None) => Err(Error::MissingOrInvalid(
                "response carries neither result nor error".into(),
            )),
        }
    }

    /// Answers an inbound session request with a result.
    pub async fn respond(&self, topic: &str, id: u64, result: Value) -> Result<()> {
        self.check_initialized()?;
        self.history.get(topic, id).await?;
        self.send_response(topic, WcMethod::SessionRequest, WcResponse::result(id, result))
            .await
    }

    /// Answers an inbound session request with an error.
    pub async fn respond_error(
        &self,
        topic: &str,
        id: u64,
        error: ErrorResponse,
    ) -> Result<()> {
        self.check_initialized()?;
        self.history.get(topic, id).await?;
        self.send_response(topic, WcMethod::SessionRequest, WcResponse::error(id, error))
            .await
    }

    /// Notifies the peer of a chain event the session authorizes.
    pub async fn emit_event(
        &self,
        topic: &str,
        chain_id: &str,
        event: EventPayload,
    ) -> Result<()> {
        self.check_initialized()?;
        let session = self.live_session(topic).await?;
        authorize_event(&session, chain_id, &event.name)?;
        self.publish_request(
            topic,
            WcMethod::SessionEvent,
            json!(SessionEventParams {
                event,
                chain_id: chain_id.to_string(),
            }),
            Some(chain_id.to_string()),
        )
        .await?;
        Ok(())
    }

    /// Tears the session down on both ends.
    pub async fn disconnect_session(&self, topic: &str) -> Result<()> {
        self.check_initialized()?;
        if !self.sessions.has(topic).await {
            return Err(Error::NoMatchingKey("session".to_string(), topic.to_string()));
        }
        let reason = Error::UserDisconnected.to_error_response();
        self.publish_request(topic, WcMethod::SessionDelete, json!(reason), None)
            .await?;
        self.cleanup_session(topic).await
    }

    // ---- inbound dispatch ----

    fn spawn_message_loop(self: &Arc<Self>) {
        let engine = self.clone();
        let mut messages = self.core.relayer.subscribe_events();
        tokio::spawn(async move {
            loop {
                match messages.recv().await {
                    Ok(event) => {
                        if let Err(e) = engine.on_message(event).await {
                            warn!("inbound payload dropped: {e}");
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!("relayer event stream lagged by {n}");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
    }

    fn spawn_expirer_loop(self: &Arc<Self>) {
        let engine = self.clone();
        let mut expirations = self.core.expirer.subscribe();
        tokio::spawn(async move {
            loop {
                match expirations.recv().await {
                    Ok(ExpirerEvent::Expired(expiration)) => {
                        if let Err(e) = engine.on_expired(&expiration.target).await {
                            warn!("expiry cascade for {} failed: {e}", expiration.target);
                        }
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!("expirer event stream lagged by {n}");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
    }

    async fn on_message(&self, event: MessageEvent) -> Result<()> {
        let plaintext = self
            .core
            .crypto
            .decode(&event.topic, &event.message, DecodeOptions::default())
            .await?;
        match WcPayload::parse(&plaintext)? {
            WcPayload::Request(request) => self.on_request(&event.topic, request).await,
            WcPayload::Response(response) => self.on_response(response).await,
        }
    }

    async fn on_request(&self, topic: &str, request: WcRequest) -> Result<()> {
        if self.history.exists(topic, request.id).await {
            debug!("request {} already handled", request.id);
            return Ok(());
        }
        let chain_id = request.params.get("chainId").and_then(Value::as_str);
        self.history
            .set(
                topic,
                request.id,
                &request.method.to_string(),
                request.params.clone(),
                chain_id.map(str::to_string),
            )
            .await?;

        if let Err(e) = self.handle_request(topic, &request).await {
            warn!("request {} rejected: {e}", request.id);
            self.send_response(
                topic,
                request.method,
                WcResponse::error(request.id, e.to_error_response()),
            )
            .await?;
        }
        Ok(())
    }

    async fn handle_request(&self, topic: &str, request: &WcRequest) -> Result<()> {
        match request.method {
            WcMethod::PairingPing => {
                self.ack(topic, request).await?;
                self.emit(EngineEvent::PairingPing {
                    topic: topic.to_string(),
                });
            }
            WcMethod::PairingDelete => {
                self.ack(topic, request).await?;
                self.cleanup_pairing(topic).await?;
                self.emit(EngineEvent::PairingDeleted {
                    topic: topic.to_string(),
                });
            }
            WcMethod::SessionPropose => {
                self.handle_session_propose(topic, request).await?;
            }
            WcMethod::SessionSettle => {
                self.handle_session_settle(topic, request).await?;
            }
            WcMethod::SessionUpdate => {
                let params: SessionUpdateParams =
                    serde_json::from_value(request.params.clone())?;
                let mut session = self.live_session(topic).await?;
                assert_conforming(&session.required_namespaces, &params.namespaces)?;
                SessionPatch {
                    namespaces: Some(params.namespaces.clone()),
                    ..Default::default()
                }
                .apply(&mut session);
                self.sessions.set(topic, session).await?;
                self.ack(topic, request).await?;
                self.emit(EngineEvent::SessionUpdated {
                    topic: topic.to_string(),
                    namespaces: params.namespaces,
                });
            }
            WcMethod::SessionExtend => {
                let mut session = self.live_session(topic).await?;
                let expiry = unix_timestamp()? + SESSION_EXPIRY;
                SessionPatch {
                    expiry: Some(expiry),
                    ..Default::default()
                }
                .apply(&mut session);
                self.sessions.set(topic, session).await?;
                self.core.expirer.set(topic, expiry).await?;
                self.ack(topic, request).await?;
                self.emit(EngineEvent::SessionExtended {
                    topic: topic.to_string(),
                    expiry,
                });
            }
            WcMethod::SessionRequest => {
                let params: SessionRequestParams =
                    serde_json::from_value(request.params.clone())?;
                let session = self.live_session(topic).await?;
                if let Some(expiry) = params.request.expiry
                    && expiry < unix_timestamp()?
                {
                    return Err(Error::Expired(format!("request {}", request.id)));
                }
                authorize_method(&session, &params.chain_id, &params.request.method)?;
                // The application answers through respond().
                self.emit(EngineEvent::SessionRequest {
                    topic: topic.to_string(),
                    id: request.id,
                    chain_id: params.chain_id,
                    request: params.request,
                });
            }
            WcMethod::SessionEvent => {
                let params: SessionEventParams =
                    serde_json::from_value(request.params.clone())?;
                let session = self.live_session(topic).await?;
                authorize_event(&session, &params.chain_id, &params.event.name)?;
                self.ack(topic, request).await?;
                self.emit(EngineEvent::SessionEvent {
                    topic: topic.to_string(),
                    chain_id: params.chain_id,
                    event: params.event,
                });
            }
            WcMethod::SessionDelete => {
                let reason: Option<ErrorResponse> =
                    serde_json::from_value(request.params.clone()).ok();
                self.ack(topic, request).await?;
                self.cleanup_session(topic).await?;
                self.emit(EngineEvent::SessionDeleted {
                    topic: topic.to_string(),
                    reason,
                });
            }
            WcMethod::SessionPing => {
                self.ack(topic, request).await?;
                self.emit(EngineEvent::SessionPing {
                    topic: topic.to_string(),
                });
            }
        }
        Ok(())
    }

    async fn handle_session_propose(&self, topic: &str, request: &WcRequest) -> Result<()> {
        let params: SessionProposeParams =
            serde_json::from_value(request.params.clone())?;
        let mut pairing = self.pairings.get(topic).await?;
        PairingPatch {
            peer_metadata: Some(params.proposer.metadata.clone()),
            ..Default::default()
        }
        .apply(&mut pairing);
        self.pairings.set(topic, pairing).await?;

        let expiry = unix_timestamp()? + PROPOSAL_EXPIRY;
        let proposal = ProposalStruct {
            id: request.id,
            pairing_topic: topic.to_string(),
            expiry,
            proposer: params.proposer,
            relays: params.relays,
            required_namespaces: params.required_namespaces,
            optional_namespaces: params.optional_namespaces,
        };
        self.proposals
            .set(&request.id.to_string(), proposal.clone())
            .await?;
        self.core.expirer.set(&request.id.to_string(), expiry).await?;
        self.emit(EngineEvent::SessionProposal(proposal));
        Ok(())
    }

    /// Proposer side of settlement: the responder opened the session topic we
    /// derived from the propose response.
    async fn handle_session_settle(&self, topic: &str, request: &WcRequest) -> Result<()> {
        let params: SessionSettleParams =
            serde_json::from_value(request.params.clone())?;
        let proposal_id = self
            .pending_sessions
            .lock()
            .await
            .remove(topic)
            .ok_or_else(|| {
                Error::MissingOrInvalid(format!("no pending session on {topic}"))
            })?;
        let proposal = self.proposals.get(&proposal_id.to_string()).await?;
        assert_conforming(&proposal.required_namespaces, &params.namespaces)?;

        let session = SessionStruct {
            topic: topic.to_string(),
            relay: params.relay,
            expiry: params.expiry,
            acknowledged: true,
            controller: params.controller.public_key.clone(),
            namespaces: params.namespaces,
            required_namespaces: proposal.required_namespaces.clone(),
            self_participant: Participant {
                public_key: proposal.proposer.public_key.clone(),
                metadata: self.metadata.clone(),
            },
            peer: params.controller,
        };
        self.sessions.set(topic, session.clone()).await?;
        self.core.expirer.set(topic, params.expiry).await?;
        self.ack(topic, request).await?;

        self.activate_pairing(&proposal.pairing_topic).await?;
        self.drop_proposal(proposal_id).await?;
        self.emit(EngineEvent::SessionConnected(session));
        Ok(())
    }

    async fn on_response(&self, response: WcResponse) -> Result<()> {
        let record = self
            .history
            .resolve(response.id, json!(response))
            .await?;

        match record.method.as_str() {
            "wc_sessionPropose" => {
                self.handle_propose_response(&response).await?;
            }
            "wc_sessionSettle" => {
                self.handle_settle_response(&response).await?;
            }
            _ => {}
        }

        if let Some(waiter) = self.waiters.lock().await.remove(&response.id) {
            let _ = waiter.send(response);
        }
        Ok(())
    }

    /// Proposer side: on approval, derive the session topic from the
    /// responder key and start listening for the settle request.
    async fn handle_propose_response(&self, response: &WcResponse) -> Result<()> {
        if let Some(error) = &response.error {
            self.drop_proposal(response.id).await?;
            self.emit(EngineEvent::ProposalRejected {
                id: response.id,
                error: error.clone(),
            });
            return Ok(());
        }
        let result: SessionProposeResponse = serde_json::from_value(
            response
                .result
                .clone()
                .ok_or_else(|| Error::MissingOrInvalid("empty propose response".into()))?,
        )?;
        let proposal = self.proposals.get(&response.id.to_string()).await?;
        let session_topic = self
            .core
            .crypto
            .generate_shared_key(
                &proposal.proposer.public_key,
                &result.responder_public_key,
                None,
            )
            .await?;
        self.core.relayer.subscribe(&session_topic).await?;
        self.pending_sessions
            .lock()
            .await
            .insert(session_topic, response.id);
        Ok(())
    }

    /// Responder side: the settle acknowledgement completes the handshake.
    async fn handle_settle_response(&self, response: &WcResponse) -> Result<()> {
        let Some(settlement) = self.settlements.lock().await.remove(&response.id) else {
            return Ok(());
        };
        if response.error.is_some() {
            self.cleanup_session(&settlement.session_topic).await?;
            return Ok(());
        }

        let mut session = self.sessions.get(&settlement.session_topic).await?;
        SessionPatch {
            acknowledged: Some(true),
            ..Default::default()
        }
        .apply(&mut session);
        self.sessions.set(&settlement.session_topic, session).await?;

        self.activate_pairing(&settlement.pairing_topic).await?;
        self.drop_proposal(settlement.proposal_id).await?;
        self.emit(EngineEvent::SessionAcknowledged {
            topic: settlement.session_topic,
        });
        Ok(())
    }

    async fn on_expired(&self, target: &str) -> Result<()> {
        let (kind, value) = parse_target(target)?;
        match kind {
            "topic" => {
                if self.sessions.has(value).await {
                    self.cleanup_session(value).await?;
                    self.emit(EngineEvent::SessionDeleted {
                        topic: value.to_string(),
                        reason: None,
                    });
                } else if self.pairings.has(value).await {
                    self.cleanup_pairing(value).await?;
                    self.emit(EngineEvent::PairingDeleted {
                        topic: value.to_string(),
                    });
                }
            }
            _ => {
                let id: u64 = value.parse()?;
                if self.proposals.has(&id.to_string()).await {
                    self.proposals.delete(&id.to_string()).await?;
                    self.emit(EngineEvent::ProposalExpired { id });
                }
            }
        }
        Ok(())
    }

    // ---- internals ----

    async fn live_pairing(&self, topic: &str) -> Result<PairingStruct> {
        let pairing = self.pairings.get(topic).await?;
        if pairing.expiry < unix_timestamp()? {
            self.cleanup_pairing(topic).await?;
            return Err(Error::Expired(format!("pairing {topic}")));
        }
        Ok(pairing)
    }

    async fn live_session(&self, topic: &str) -> Result<SessionStruct> {
        let session = self.sessions.get(topic).await?;
        if session.expiry < unix_timestamp()? {
            self.cleanup_session(topic).await?;
            return Err(Error::Expired(format!("session {topic}")));
        }
        Ok(session)
    }

    async fn publish_request(
        &self,
        topic: &str,
        method: WcMethod,
        params: Value,
        chain_id: Option<String>,
    ) -> Result<u64> {
        let request = WcRequest::new(method, params);
        self.publish_prepared(topic, &request, chain_id).await?;
        Ok(request.id)
    }

    async fn publish_prepared(
        &self,
        topic: &str,
        request: &WcRequest,
        chain_id: Option<String>,
    ) -> Result<()> {
        let method = request.method;
        self.history
            .set(topic, request.id, &method.to_string(), request.params.clone(), chain_id)
            .await?;
        let message = self
            .core
            .crypto
            .encode(topic, &serde_json::to_string(&request)?, EncodeOptions::default())
            .await?;
        self.core
            .relayer
            .publish(
                topic,
                &message,
                PublishOptions {
                    ttl: method.ttl(),
                    tag: method.request_tag(),
                    prompt: false,
                },
            )
            .await?;
        Ok(())
    }

    async fn send_response(
        &self,
        topic: &str,
        method: WcMethod,
        response: WcResponse,
    ) -> Result<()> {
        self.history.resolve(response.id, json!(response)).await?;
        let message = self
            .core
            .crypto
            .encode(topic, &serde_json::to_string(&response)?, EncodeOptions::default())
            .await?;
        self.core
            .relayer
            .publish(
                topic,
                &message,
                PublishOptions {
                    ttl: method.ttl(),
                    tag: method.response_tag(),
                    prompt: false,
                },
            )
            .await
    }

    async fn ack(&self, topic: &str, request: &WcRequest) -> Result<()> {
        self.send_response(
            topic,
            request.method,
            WcResponse::result(request.id, Value::Bool(true)),
        )
        .await
    }

    /// Must be registered before the request is published so the response
    /// cannot slip past the waiter.
    async fn register_waiter(&self, id: u64) -> oneshot::Receiver<WcResponse> {
        let (tx, rx) = oneshot::channel();
        self.waiters.lock().await.insert(id, tx);
        rx
    }

    async fn await_response(&self, rx: oneshot::Receiver<WcResponse>) -> Result<WcResponse> {
        rx.await
            .map_err(|_| Error::Internal("response waiter dropped".to_string()))
    }

    async fn cleanup_pairing(&self, topic: &str) -> Result<()> {
        self.pairings.delete(topic).await?;
        self.core.crypto.delete_sym_key(topic).await?;
        self.core.expirer.delete(topic).await?;
        self.core.relayer.unsubscribe(topic).await?;
        self.history.delete(topic, None).await
    }

    async fn cleanup_session(&self, topic: &str) -> Result<()> {
        self.sessions.delete(topic).await?;
        self.core.crypto.delete_sym_key(topic).await?;
        self.core.expirer.delete(topic).await?;
        self.core.relayer.unsubscribe(topic).await?;
        self.history.delete(topic, None).await
    }

    async fn drop_proposal(&self, id: u64) -> Result<()> {
        self.proposals.delete(&id.to_string()).await?;
        self.core.expirer.delete(&id.to_string()).await
    }

    fn emit(&self, event: EngineEvent) {
        let _ = self.events.send(event);
    }
}

fn session_namespace<'a>(
    session: &'a SessionStruct,
    chain_id: &str,
) -> Option<&'a crate::types::Namespace> {
    let key = chain_id.split(':').next().unwrap_or_default();
    session.namespaces.get(key)
}

fn authorize_method(session: &SessionStruct, chain_id: &str, method: &str) -> Result<()> {
    let Some(namespace) = session_namespace(session, chain_id) else {
        return Err(Error::UnauthorizedMethod(method.to_string()));
    };
    let chains = namespace_chains(namespace)?;
    if !chains.contains(chain_id) || !namespace.methods.iter().any(|m| m == method) {
        return Err(Error::UnauthorizedMethod(method.to_string()));
    }
    Ok(())
}

fn authorize_event(session: &SessionStruct, chain_id: &str, event: &str) -> Result<()> {
    let Some(namespace) = session_namespace(session, chain_id) else {
        return Err(Error::UnauthorizedEvent(event.to_string()));
    };
    let chains = namespace_chains(namespace)?;
    if !chains.contains(chain_id) || !namespace.events.iter().any(|e| e == event) {
        return Err(Error::UnauthorizedEvent(event.to_string()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;

    use super::*;
    use crate::rpc::JsonRpcRequest;
    use crate::storage::MemoryStorage;
    use crate::transport::{RelayTransport, TransportEvent};

    struct NullTransport;

    #[async_trait]
    impl RelayTransport for NullTransport {
        async fn connect(&self) -> Result<()> {
            Ok(())
        }

        async fn disconnect(&self) -> Result<()> {
            Ok(())
        }

        async fn request(&self, _request: JsonRpcRequest) -> Result<Value> {
            Ok(Value::Bool(true))
        }

        async fn respond(&self, _id: u64, _result: Value) -> Result<()> {
            Ok(())
        }

        fn subscribe_events(&self) -> broadcast::Receiver<TransportEvent> {
            broadcast::channel(1).0.subscribe()
        }
    }

    fn metadata(name: &str) -> Metadata {
        Metadata {
            name: name.to_string(),
            description: "test client".to_string(),
            url: "https://example.com".to_string(),
            icons: vec![],
        }
    }

    async fn engine() -> Arc<Engine> {
        let core = Core::new(Arc::new(NullTransport), Arc::new(MemoryStorage::new()))
            .await
            .unwrap();
        let engine = Engine::new(core, metadata("test"));
        engine.init().await.unwrap();
        engine
    }

    #[test]
    fn method_and_event_authorization() {
        let namespaces: Namespaces = HashMap::from([(
            "eip155".to_string(),
            crate::types::Namespace {
                accounts: Some(vec!["eip155:1:0xab".to_string()]),
                chains: vec!["eip155:1".to_string()],
                methods: vec!["eth_sign".to_string()],
                events: vec!["chainChanged".to_string()],
            },
        )]);
        let session = SessionStruct {
            topic: "t".into(),
            relay: Relay::default(),
            expiry: u64::MAX,
            acknowledged: true,
            controller: "c".into(),
            namespaces,
            required_namespaces: HashMap::new(),
            self_participant: Participant {
                public_key: "a".into(),
                metadata: metadata("a"),
            },
            peer: Participant {
                public_key: "b".into(),
                metadata: metadata("b"),
            },
        };

        assert!(authorize_method(&session, "eip155:1", "eth_sign").is_ok());
        assert!(matches!(
            authorize_method(&session, "eip155:1", "eth_sendTransaction"),
            Err(Error::UnauthorizedMethod(_))
        ));
        assert!(matches!(
            authorize_method(&session, "eip155:137", "eth_sign"),
            Err(Error::UnauthorizedMethod(_))
        ));
        assert!(authorize_event(&session, "eip155:1", "chainChanged").is_ok());
        assert!(matches!(
            authorize_event(&session, "eip155:1", "accountsChanged"),
            Err(Error::UnauthorizedEvent(_))
        ));
    }

    #[tokio::test]
    async fn create_pairing_yields_joinable_uri() {
        let engine = engine().await;
        let (topic, uri) = engine.create_pairing().await.unwrap();
        let params = parse_uri(&uri).unwrap();
        assert_eq!(params.topic, topic);
        assert!(engine.pairings.has(&topic).await);
        assert!(!engine.pairings.get(&topic).await.unwrap().active);
        assert!(engine.core.expirer.has(&topic).await.unwrap());
    }

    #[tokio::test]
    async fn pair_records_pairing_and_key() {
        let proposer = engine().await;
        let (_, uri) = proposer.create_pairing().await.unwrap();

        let responder = engine().await;
        let pairing = responder.pair(&uri).await.unwrap();
        assert!(responder.pairings.has(&pairing.topic).await);
        assert!(responder.core.crypto.has_keys(&pairing.topic).await.unwrap());

        // Malformed URIs fail before any state changes.
        assert!(responder.pair("wc:deadbeef@2").await.is_err());
    }

    #[tokio::test]
    async fn expired_pairing_is_unusable_and_evicted() {
        let engine = engine().await;

        let expire = |engine: Arc<Engine>, topic: String| async move {
            let mut pairing = engine.pairings.get(&topic).await.unwrap();
            pairing.expiry = 1;
            engine.pairings.set(&topic, pairing).await.unwrap();
        };

        let (topic, _uri) = engine.create_pairing().await.unwrap();
        expire(engine.clone(), topic.clone()).await;
        assert!(matches!(engine.ping(&topic).await, Err(Error::Expired(_))));
        assert!(!engine.pairings.has(&topic).await);
        assert!(!engine.core.crypto.has_keys(&topic).await.unwrap());

        // Proposing over a dead pairing fails the same way.
        let (topic, _uri) = engine.create_pairing().await.unwrap();
        expire(engine.clone(), topic.clone()).await;
        let result = engine
            .connect(ConnectParams {
                pairing_topic: Some(topic.clone()),
                ..Default::default()
            })
            .await;
        assert!(matches!(result, Err(Error::Expired(_))));

        let (topic, _uri) = engine.create_pairing().await.unwrap();
        expire(engine.clone(), topic.clone()).await;
        assert!(matches!(
            engine.disconnect_pairing(&topic).await,
            Err(Error::Expired(_))
        ));
    }

    #[tokio::test]
    async fn connect_stores_proposal_and_history() {
        let engine = engine().await;
        let connection = engine.connect(ConnectParams::default()).await.unwrap();
        assert!(connection.uri.is_some());
        assert!(
            engine
                .proposals
                .has(&connection.proposal_id.to_string())
                .await
        );
        assert!(
            engine
                .history
                .exists(&connection.pairing_topic, connection.proposal_id)
                .await
        );
        assert_eq!(engine.history.pending().await.len(), 1);
    }

    #[tokio::test]
    async fn approve_requires_conforming_namespaces() {
        let engine = engine().await;
        let required: Namespaces = HashMap::from([(
            "eip155".to_string(),
            crate::types::Namespace {
                accounts: None,
                chains: vec!["eip155:1".to_string()],
                methods: vec!["eth_sign".to_string()],
                events: vec![],
            },
        )]);
        let connection = engine
            .connect(ConnectParams {
                required_namespaces: required,
                ..Default::default()
            })
            .await
            .unwrap();

        // Approving with empty namespaces fails conformance.
        let result = engine.approve(connection.proposal_id, HashMap::new()).await;
        assert!(matches!(result, Err(Error::NonConformingNamespaces(_))));
    }

    #[tokio::test]
    async fn reject_drops_proposal() {
        let engine = engine().await;
        let connection = engine.connect(ConnectParams::default()).await.unwrap();
        engine
            .reject(
                connection.proposal_id,
                Error::UserDisconnected.to_error_response(),
            )
            .await
            .unwrap();
        assert!(
            !engine
                .proposals
                .has(&connection.proposal_id.to_string())
                .await
        );
        assert!(
            !engine
                .core
                .expirer
                .has(&connection.proposal_id.to_string())
                .await
                .unwrap()
        );
    }

    #[tokio::test]
    async fn operations_on_unknown_topics_fail() {
        let engine = engine().await;
        assert!(matches!(
            engine.ping("missing").await,
            Err(Error::NoMatchingKey(_, _))
        ));
        assert!(engine.extend("missing").await.is_err());
        assert!(engine.disconnect_session("missing").await.is_err());
    }
}
