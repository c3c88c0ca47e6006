//! In-memory [`RemoteStore`] (tests/dev).
//!
//! Deduplicates writes by idempotency key like a real backend would, and can be
//! scripted to fail, hang or be unreachable.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use tillsync_core::{MutationId, Query, RemoteError, RemoteId, RemoteRecord};

use super::RemoteStore;

#[derive(Debug, Default)]
struct State {
    collections: HashMap<String, Vec<RemoteRecord>>,
    by_key: HashMap<MutationId, RemoteId>,
    scripted: HashMap<MutationId, VecDeque<RemoteError>>,
    rejected: HashMap<MutationId, RemoteError>,
    rejected_collections: HashMap<String, RemoteError>,
    hanging: HashSet<MutationId>,
    unreachable: bool,
    attempts: Vec<MutationId>,
    next_id: u64,
}

#[derive(Debug, Default)]
pub struct InMemoryRemoteStore {
    state: Mutex<State>,
}

enum Outcome {
    Done(Result<RemoteId, RemoteError>),
    Hang,
}

impl InMemoryRemoteStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Every call fails with a transient error while set.
    pub fn set_unreachable(&self, unreachable: bool) {
        self.state().unreachable = unreachable;
    }

    /// Fail the next write carrying `key` with `err` (queued, one per call).
    pub fn fail_next(&self, key: MutationId, err: RemoteError) {
        self.state().scripted.entry(key).or_default().push_back(err);
    }

    /// Fail every write carrying `key` with `err` until cleared.
    pub fn reject(&self, key: MutationId, err: RemoteError) {
        self.state().rejected.insert(key, err);
    }

    /// Fail every write into `collection` with `err`.
    pub fn reject_collection(&self, collection: &str, err: RemoteError) {
        self.state().rejected_collections.insert(collection.to_string(), err);
    }

    /// Writes carrying `key` never complete until cleared.
    pub fn hang(&self, key: MutationId) {
        self.state().hanging.insert(key);
    }

    pub fn clear_failures(&self, key: MutationId) {
        let mut state = self.state();
        state.scripted.remove(&key);
        state.rejected.remove(&key);
        state.hanging.remove(&key);
    }

    /// Insert a record as if another device had written it.
    pub fn seed(&self, collection: &str, payload: Value) -> RemoteId {
        let mut state = self.state();
        let id = state.allocate_id(collection);
        state
            .collections
            .entry(collection.to_string())
            .or_default()
            .push(RemoteRecord {
                id: id.clone(),
                idempotency_key: None,
                payload,
                created_at: Utc::now(),
            });
        id
    }

    /// Records accepted so far, in write order.
    pub fn records(&self, collection: &str) -> Vec<RemoteRecord> {
        self.state()
            .collections
            .get(collection)
            .cloned()
            .unwrap_or_default()
    }

    /// Idempotency keys of every write that reached the store, in call order.
    pub fn attempts(&self) -> Vec<MutationId> {
        self.state().attempts.clone()
    }

    fn try_write(&self, collection: &str, key: MutationId, payload: &Value) -> Outcome {
        let mut state = self.state();
        if state.unreachable {
            return Outcome::Done(Err(RemoteError::transient("remote store unreachable")));
        }
        state.attempts.push(key);

        if state.hanging.contains(&key) {
            return Outcome::Hang;
        }
        if let Some(err) = state.scripted.get_mut(&key).and_then(VecDeque::pop_front) {
            return Outcome::Done(Err(err));
        }
        if let Some(err) = state
            .rejected
            .get(&key)
            .or_else(|| state.rejected_collections.get(collection))
        {
            return Outcome::Done(Err(err.clone()));
        }
        if let Some(existing) = state.by_key.get(&key) {
            return Outcome::Done(Ok(existing.clone()));
        }

        let id = state.allocate_id(collection);
        state.by_key.insert(key, id.clone());
        state
            .collections
            .entry(collection.to_string())
            .or_default()
            .push(RemoteRecord {
                id: id.clone(),
                idempotency_key: Some(key),
                payload: payload.clone(),
                created_at: Utc::now(),
            });
        Outcome::Done(Ok(id))
    }
}

impl State {
    fn allocate_id(&mut self, collection: &str) -> RemoteId {
        self.next_id += 1;
        RemoteId::new(format!("{collection}-{}", self.next_id))
    }
}

#[async_trait]
impl RemoteStore for InMemoryRemoteStore {
    async fn write(
        &self,
        collection: &str,
        idempotency_key: MutationId,
        payload: &Value,
    ) -> Result<RemoteId, RemoteError> {
        match self.try_write(collection, idempotency_key, payload) {
            Outcome::Done(result) => result,
            Outcome::Hang => std::future::pending().await,
        }
    }

    async fn query(&self, collection: &str, query: &Query) -> Result<Vec<RemoteRecord>, RemoteError> {
        let state = self.state();
        if state.unreachable {
            return Err(RemoteError::transient("remote store unreachable"));
        }
        let records = state.collections.get(collection).cloned().unwrap_or_default();
        Ok(query.apply(records))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn same_key_yields_same_remote_id() {
        let remote = InMemoryRemoteStore::new();
        let key = MutationId::new();

        let a = remote.write("sales", key, &json!({ "n": 1 })).await.unwrap();
        let b = remote.write("sales", key, &json!({ "n": 1 })).await.unwrap();
        assert_eq!(a, b);
        assert_eq!(remote.records("sales").len(), 1);
        assert_eq!(remote.attempts(), vec![key, key]);
    }

    #[tokio::test]
    async fn scripted_failures_are_consumed_in_order() {
        let remote = InMemoryRemoteStore::new();
        let key = MutationId::new();
        remote.fail_next(key, RemoteError::transient("reset by peer"));
        remote.reject(MutationId::new(), RemoteError::permanent(Some(422), "unrelated"));

        assert!(remote.write("sales", key, &json!({})).await.unwrap_err().is_transient());
        assert!(remote.write("sales", key, &json!({})).await.is_ok());
    }

    #[tokio::test]
    async fn unreachable_store_rejects_reads_and_writes() {
        let remote = InMemoryRemoteStore::new();
        remote.seed("sales", json!({ "n": 1 }));
        remote.set_unreachable(true);

        assert!(remote.write("sales", MutationId::new(), &json!({})).await.unwrap_err().is_transient());
        assert!(remote.query("sales", &Query::all()).await.unwrap_err().is_transient());
        assert!(remote.attempts().is_empty());

        remote.set_unreachable(false);
        assert_eq!(remote.query("sales", &Query::all()).await.unwrap().len(), 1);
    }
}
