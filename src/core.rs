//! Assembly of the shared client modules (crypto, relayer, expirer,
//! heartbeat) over a storage collaborator and an abstract relay transport.

use std::sync::Arc;

use log::debug;

use crate::crypto::Crypto;
use crate::error::Result;
use crate::expirer::Expirer;
use crate::heartbeat::HeartBeat;
use crate::relayer::Relayer;
use crate::storage::KeyValueStorage;
use crate::transport::RelayTransport;

pub struct Core {
    pub storage: Arc<dyn KeyValueStorage>,
    pub crypto: Arc<Crypto>,
    pub relayer: Arc<Relayer>,
    pub expirer: Arc<Expirer>,
    pub heartbeat: Arc<HeartBeat>,
}

impl Core {
    /// Builds and hydrates the whole module stack. Order matters: crypto
    /// first, because the relayer identifies itself with the client id, and
    /// the heartbeat last so sweeps only start over initialized state.
    pub async fn new(
        transport: Arc<dyn RelayTransport>,
        storage: Arc<dyn KeyValueStorage>,
    ) -> Result<Arc<Self>> {
        let crypto = Arc::new(Crypto::new(storage.clone()));
        crypto.init().await?;
        let client_id = crypto.get_client_id().await?;
        debug!("client id {client_id}");

        let relayer = Relayer::new(transport, storage.clone(), client_id);
        relayer.init().await?;

        let expirer = Arc::new(Expirer::new(storage.clone()));
        expirer.init().await?;

        let heartbeat = Arc::new(HeartBeat::default());
        expirer.attach(&heartbeat);
        relayer.publisher.attach(&heartbeat);
        relayer.subscriber.attach(&heartbeat);
        heartbeat.start();

        Ok(Arc::new(Self {
            storage,
            crypto,
            relayer,
            expirer,
            heartbeat,
        }))
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use serde_json::Value;
    use tokio::sync::broadcast;

    use super::*;
    use crate::rpc::JsonRpcRequest;
    use crate::storage::MemoryStorage;
    use crate::transport::TransportEvent;

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

    #[tokio::test]
    async fn initializes_all_modules_and_keeps_identity() {
        let storage = Arc::new(MemoryStorage::new());
        let core = Core::new(Arc::new(NullTransport), storage.clone())
            .await
            .unwrap();
        let id = core.crypto.get_client_id().await.unwrap();
        assert!(id.starts_with("did:key:z"));

        // Same storage, same identity.
        let again = Core::new(Arc::new(NullTransport), storage).await.unwrap();
        assert_eq!(again.crypto.get_client_id().await.unwrap(), id);
    }
}
