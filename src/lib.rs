//! # walletconnect-core
//!
//! Client core for the [WalletConnect v2 protocol](https://specs.walletconnect.com/2.0/):
//! encrypted envelopes, relay plumbing with at-least-once publishing and
//! resilient subscriptions, TTL bookkeeping, and the pairing/session state
//! machine.
//!
//! ## Features
//! - Pairing over `wc:` URIs, session propose/approve/settle
//! - ChaCha20-Poly1305 envelopes over X25519 ECDH keys
//! - Pluggable storage and relay transport collaborators
//!
//! ## Example
//!
//! ```ignore
//! let storage = Arc::new(MemoryStorage::new());
//! let transport = Arc::new(MyRelayTransport::connect(relay_url).await?);
//!
//! let core = Core::new(transport, storage).await?;
//! let engine = Engine::new(core, Metadata {
//!     name: "My Wallet".to_string(),
//!     description: "My wallet interacts with dapps".to_string(),
//!     url: "https://my-wallet-site.com".to_string(),
//!     icons: vec![],
//! });
//! engine.init().await?;
//!
//! let uri_from_dapp = "wc:e4b9…64@2?relay-protocol=irn&symKey=d743…2d";
//! engine.pair(uri_from_dapp).await?;
//!
//! let mut events = engine.subscribe_events();
//! while let Ok(event) = events.recv().await {
//!     if let EngineEvent::SessionProposal(proposal) = event {
//!         engine.approve(proposal.id, namespaces.clone()).await?;
//!     }
//! }
//! ```
//!
//! ## License
//! MIT OR Apache-2.0

pub mod constants;
pub mod core;
pub mod crypto;
pub mod engine;
pub mod error;
pub mod expirer;
pub mod heartbeat;
pub mod history;
pub mod keychain;
pub mod message_tracker;
pub mod namespaces;
pub mod publisher;
pub mod relay_auth;
pub mod relayer;
pub mod rpc;
pub mod storage;
pub mod store;
pub mod subscriber;
pub mod transport;
pub mod types;
pub mod utils;
pub mod wc;

/// Exposed for easy access
pub use crate::core::Core;
pub use engine::{ConnectParams, Engine, EngineEvent};
pub use error::{Error, Result};
pub use storage::{KeyValueStorage, MemoryStorage};
pub use transport::{RelayTransport, TransportEvent};
pub use types::Metadata;
