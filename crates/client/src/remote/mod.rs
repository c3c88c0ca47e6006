//! Interface to the authoritative backend.
//!
//! Implementations classify every failure as transient (network, timeout,
//! overload) or permanent (validation, auth); the sync engine decides what to do
//! with each.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tillsync_core::{MutationId, Query, RemoteError, RemoteId, RemoteRecord};

pub mod http;
pub mod in_memory;

pub use http::HttpRemoteStore;
pub use in_memory::InMemoryRemoteStore;

#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Create a record. `idempotency_key` is the local mutation id; writing the
    /// same key twice must yield the same remote id.
    async fn write(
        &self,
        collection: &str,
        idempotency_key: MutationId,
        payload: &Value,
    ) -> Result<RemoteId, RemoteError>;

    async fn query(&self, collection: &str, query: &Query) -> Result<Vec<RemoteRecord>, RemoteError>;
}

#[async_trait]
impl<T: RemoteStore + ?Sized> RemoteStore for Arc<T> {
    async fn write(
        &self,
        collection: &str,
        idempotency_key: MutationId,
        payload: &Value,
    ) -> Result<RemoteId, RemoteError> {
        (**self).write(collection, idempotency_key, payload).await
    }

    async fn query(&self, collection: &str, query: &Query) -> Result<Vec<RemoteRecord>, RemoteError> {
        (**self).query(collection, query).await
    }
}
