//! In-memory DocumentStore
//!
//! Reference adapter holding both collections in process memory. Every call
//! takes the collection lock once, so each call is atomic with respect to the
//! others, which is exactly the guarantee the engine assumes of a real store.
//!
//! Besides serving embedders that keep the tree in memory, the adapter supports
//! the failure-path tests of the engine:
//!
//! - [`InMemoryStore::inject_fault`] makes a chosen call fail
//! - [`InMemoryStore::with_latency`] delays every call, widening race windows
//! - [`InMemoryStore::operation_count`] exposes how many calls of each kind ran

use crate::db::{Collection, Document, DocumentStore, Filter, Patch, StoreError, StoreOperation};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::RwLock;

/// A planned failure of a store call
///
/// Matches calls by collection and operation. The first `skip` matching calls
/// succeed, the following `times` matching calls fail with
/// `StoreError::FaultInjected`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fault {
    pub collection: Collection,
    pub operation: StoreOperation,
    pub skip: usize,
    pub times: usize,
}

impl Fault {
    /// Fail the next matching call
    pub fn on(collection: Collection, operation: StoreOperation) -> Self {
        Self {
            collection,
            operation,
            skip: 0,
            times: 1,
        }
    }

    /// Let `skip` matching calls through before failing
    pub fn after(mut self, skip: usize) -> Self {
        self.skip = skip;
        self
    }

    /// Fail `times` consecutive matching calls
    pub fn times(mut self, times: usize) -> Self {
        self.times = times;
        self
    }
}

/// Document store kept entirely in memory
pub struct InMemoryStore {
    collections: RwLock<HashMap<Collection, HashMap<String, Document>>>,
    faults: Mutex<Vec<Fault>>,
    counters: Mutex<HashMap<StoreOperation, u64>>,
    latency: Option<Duration>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            collections: RwLock::new(HashMap::new()),
            faults: Mutex::new(Vec::new()),
            counters: Mutex::new(HashMap::new()),
            latency: None,
        }
    }

    /// Create a store that sleeps for `latency` before serving each call
    pub fn with_latency(latency: Duration) -> Self {
        Self {
            latency: Some(latency),
            ..Self::new()
        }
    }

    /// Plan a failure (see [`Fault`])
    pub fn inject_fault(&self, fault: Fault) {
        if let Ok(mut faults) = self.faults.lock() {
            faults.push(fault);
        }
    }

    /// Drop every planned failure that has not fired yet
    pub fn clear_faults(&self) {
        if let Ok(mut faults) = self.faults.lock() {
            faults.clear();
        }
    }

    /// Number of calls of `operation` served so far (including failed ones)
    pub fn operation_count(&self, operation: StoreOperation) -> u64 {
        self.counters
            .lock()
            .map(|counters| counters.get(&operation).copied().unwrap_or(0))
            .unwrap_or(0)
    }

    /// Total number of documents in `collection`
    pub async fn len(&self, collection: Collection) -> usize {
        let collections = self.collections.read().await;
        collections.get(&collection).map_or(0, HashMap::len)
    }

    pub async fn is_empty(&self, collection: Collection) -> bool {
        self.len(collection).await == 0
    }

    async fn enter(
        &self,
        collection: Collection,
        operation: StoreOperation,
    ) -> Result<(), StoreError> {
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }

        let mut counters = self
            .counters
            .lock()
            .map_err(|_| StoreError::unavailable(operation, "counter lock poisoned"))?;
        *counters.entry(operation).or_insert(0) += 1;
        drop(counters);

        let mut faults = self
            .faults
            .lock()
            .map_err(|_| StoreError::unavailable(operation, "fault lock poisoned"))?;
        let Some(index) = faults
            .iter()
            .position(|f| f.collection == collection && f.operation == operation)
        else {
            return Ok(());
        };

        let fault = &mut faults[index];
        if fault.skip > 0 {
            fault.skip -= 1;
            return Ok(());
        }
        fault.times = fault.times.saturating_sub(1);
        if fault.times == 0 {
            faults.remove(index);
        }
        tracing::debug!("Injected fault fired: {} on {}", operation, collection);
        Err(StoreError::FaultInjected {
            collection,
            operation,
        })
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

fn patched_copy(
    collection: Collection,
    document: &Document,
    patch: &Patch,
) -> Result<Document, StoreError> {
    let mut updated = document.clone();
    patch
        .apply(&mut updated)
        .map_err(|reason| StoreError::InvalidDocument { collection, reason })?;
    Ok(updated)
}

#[async_trait]
impl DocumentStore for InMemoryStore {
    async fn insert(
        &self,
        collection: Collection,
        mut document: Document,
    ) -> Result<Document, StoreError> {
        self.enter(collection, StoreOperation::Insert).await?;

        let provided = match document.get("id") {
            Some(Value::String(id)) if !id.is_empty() => Some(id.clone()),
            Some(Value::String(_)) | Some(Value::Null) | None => None,
            Some(other) => {
                return Err(StoreError::InvalidDocument {
                    collection,
                    reason: format!("id must be a string, got {}", other),
                })
            }
        };
        let id = match provided {
            Some(id) => id,
            None => {
                let id = uuid::Uuid::new_v4().to_string();
                document.insert("id".to_string(), Value::String(id.clone()));
                id
            }
        };

        let mut collections = self.collections.write().await;
        let docs = collections.entry(collection).or_default();
        if docs.contains_key(&id) {
            return Err(StoreError::DuplicateId { collection, id });
        }
        docs.insert(id, document.clone());
        Ok(document)
    }

    async fn get(&self, collection: Collection, id: &str) -> Result<Option<Document>, StoreError> {
        self.enter(collection, StoreOperation::Get).await?;

        let collections = self.collections.read().await;
        Ok(collections
            .get(&collection)
            .and_then(|docs| docs.get(id))
            .cloned())
    }

    async fn find(
        &self,
        collection: Collection,
        filter: &Filter,
    ) -> Result<Vec<Document>, StoreError> {
        self.enter(collection, StoreOperation::Find).await?;

        let collections = self.collections.read().await;
        Ok(collections
            .get(&collection)
            .map(|docs| {
                docs.values()
                    .filter(|doc| filter.matches(doc))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn update_one(
        &self,
        collection: Collection,
        filter: &Filter,
        patch: &Patch,
    ) -> Result<Option<Document>, StoreError> {
        self.enter(collection, StoreOperation::UpdateOne).await?;

        let mut collections = self.collections.write().await;
        let Some(docs) = collections.get_mut(&collection) else {
            return Ok(None);
        };
        let Some((id, current)) = docs.iter().find(|(_, doc)| filter.matches(doc)) else {
            return Ok(None);
        };

        let id = id.clone();
        let updated = patched_copy(collection, current, patch)?;
        docs.insert(id, updated.clone());
        Ok(Some(updated))
    }

    async fn update_many(
        &self,
        collection: Collection,
        filter: &Filter,
        patch: &Patch,
    ) -> Result<u64, StoreError> {
        self.enter(collection, StoreOperation::UpdateMany).await?;

        let mut collections = self.collections.write().await;
        let Some(docs) = collections.get_mut(&collection) else {
            return Ok(0);
        };

        // Patch copies first so a type mismatch leaves the collection untouched
        let mut updates = Vec::new();
        for (id, doc) in docs.iter().filter(|(_, doc)| filter.matches(doc)) {
            updates.push((id.clone(), patched_copy(collection, doc, patch)?));
        }

        let matched = updates.len() as u64;
        for (id, doc) in updates {
            docs.insert(id, doc);
        }
        Ok(matched)
    }

    async fn count(&self, collection: Collection, filter: &Filter) -> Result<u64, StoreError> {
        self.enter(collection, StoreOperation::Count).await?;

        let collections = self.collections.read().await;
        Ok(collections
            .get(&collection)
            .map(|docs| docs.values().filter(|doc| filter.matches(doc)).count() as u64)
            .unwrap_or(0))
    }

    async fn delete_many(
        &self,
        collection: Collection,
        filter: &Filter,
    ) -> Result<u64, StoreError> {
        self.enter(collection, StoreOperation::DeleteMany).await?;

        let mut collections = self.collections.write().await;
        let Some(docs) = collections.get_mut(&collection) else {
            return Ok(0);
        };
        let before = docs.len();
        docs.retain(|_, doc| !filter.matches(doc));
        Ok((before - docs.len()) as u64)
    }
}
