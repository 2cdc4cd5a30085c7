//! Ledger of protocol JSON-RPC exchanges. Outgoing and incoming requests are
//! recorded before their handlers run; responses resolve records strictly by
//! id. A record with no response yet is pending.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use log::debug;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::RwLock;

use crate::constants::storage_key;
use crate::error::{Error, Result};
use crate::storage::{KeyValueStorage, get_item, set_item};

const STORE: &str = "history";

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct JsonRpcRecord {
    pub id: u64,
    pub topic: String,
    pub method: String,
    pub params: Value,
    #[serde(rename = "chainId")]
    #[serde(default)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chain_id: Option<String>,
    #[serde(default)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response: Option<Value>,
}

pub struct JsonRpcHistory {
    storage: Arc<dyn KeyValueStorage>,
    records: RwLock<HashMap<u64, JsonRpcRecord>>,
    initialized: AtomicBool,
}

impl JsonRpcHistory {
    pub fn new(storage: Arc<dyn KeyValueStorage>) -> Self {
        Self {
            storage,
            records: RwLock::new(HashMap::new()),
            initialized: AtomicBool::new(false),
        }
    }

    pub async fn init(&self) -> Result<()> {
        if let Some(persisted) =
            get_item::<Vec<JsonRpcRecord>>(self.storage.as_ref(), &storage_key(STORE)).await?
        {
            let mut records = self.records.write().await;
            if !records.is_empty() {
                return Err(Error::RestoreWillOverride(STORE.to_string()));
            }
            for record in persisted {
                records.insert(record.id, record);
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

    /// Records a request. A second insert under the same id is rejected so a
    /// redelivered request cannot be handled twice.
    pub async fn set(
        &self,
        topic: &str,
        id: u64,
        method: &str,
        params: Value,
        chain_id: Option<String>,
    ) -> Result<()> {
        self.check_initialized()?;
        let mut records = self.records.write().await;
        if records.contains_key(&id) {
            return Err(Error::MissingOrInvalid(format!(
                "history already has a record for id {id}"
            )));
        }
        records.insert(
            id,
            JsonRpcRecord {
                id,
                topic: topic.to_string(),
                method: method.to_string(),
                params,
                chain_id,
                response: None,
            },
        );
        drop(records);
        self.persist().await
    }

    /// Attaches a response to its pending record. Unknown ids and double
    /// resolution are both errors so stray responses are detectable.
    pub async fn resolve(&self, id: u64, response: Value) -> Result<JsonRpcRecord> {
        self.check_initialized()?;
        let mut records = self.records.write().await;
        let record = records
            .get_mut(&id)
            .ok_or_else(|| Error::MissingOrInvalid(format!("history record {id}")))?;
        if record.response.is_some() {
            return Err(Error::MissingOrInvalid(format!(
                "history record {id} already resolved"
            )));
        }
        record.response = Some(response);
        let resolved = record.clone();
        drop(records);
        self.persist().await?;
        debug!("resolved history record {id}");
        Ok(resolved)
    }

    pub async fn exists(&self, topic: &str, id: u64) -> bool {
        self.records
            .read()
            .await
            .get(&id)
            .is_some_and(|r| r.topic == topic)
    }

    pub async fn get(&self, topic: &str, id: u64) -> Result<JsonRpcRecord> {
        self.check_initialized()?;
        let records = self.records.read().await;
        let record = records
            .get(&id)
            .ok_or_else(|| Error::MissingOrInvalid(format!("history record {id}")))?;
        if record.topic != topic {
            return Err(Error::MissingOrInvalid(format!(
                "history record {id} does not belong to topic {topic}"
            )));
        }
        Ok(record.clone())
    }

    /// Deletes all records of a topic, or a single one when an id is given.
    pub async fn delete(&self, topic: &str, id: Option<u64>) -> Result<()> {
        self.check_initialized()?;
        self.records
            .write()
            .await
            .retain(|record_id, record| {
                record.topic != topic || id.is_some_and(|id| *record_id != id)
            });
        self.persist().await
    }

    /// Records still awaiting a response.
    pub async fn pending(&self) -> Vec<JsonRpcRecord> {
        self.records
            .read()
            .await
            .values()
            .filter(|r| r.response.is_none())
            .cloned()
            .collect()
    }

    async fn persist(&self) -> Result<()> {
        let records: Vec<JsonRpcRecord> =
            self.records.read().await.values().cloned().collect();
        set_item(self.storage.as_ref(), &storage_key(STORE), &records).await
    }
}
