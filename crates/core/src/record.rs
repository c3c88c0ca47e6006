//! Records exchanged with the remote store and cached locally.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::id::{MutationId, RecordId, RemoteId};

/// A record as returned by the remote store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteRecord {
    pub id: RemoteId,
    /// Local mutation id the record was created from, when the backend keeps it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idempotency_key: Option<MutationId>,
    pub payload: Value,
    /// Timestamp used for display ordering.
    pub created_at: DateTime<Utc>,
}

/// Whether a cached record is confirmed by the remote store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordOrigin {
    /// Copied from (or confirmed by) the remote store.
    Remote,
    /// Written on this device and still waiting in the mutation queue.
    Pending,
}

/// A record served to UI collaborators from the local snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub id: RecordId,
    pub remote_id: Option<RemoteId>,
    /// Local mutation this record was written by, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mutation_id: Option<MutationId>,
    pub payload: Value,
    pub updated_at: DateTime<Utc>,
    pub origin: RecordOrigin,
}

impl Record {
    pub fn new(payload: Value) -> Self {
        Self {
            id: RecordId::new(),
            remote_id: None,
            mutation_id: None,
            payload,
            updated_at: Utc::now(),
            origin: RecordOrigin::Remote,
        }
    }

    pub fn with_remote_id(mut self, remote_id: RemoteId) -> Self {
        self.remote_id = Some(remote_id);
        self
    }

    pub fn with_mutation_id(mut self, mutation_id: MutationId) -> Self {
        self.mutation_id = Some(mutation_id);
        self
    }

    pub fn with_updated_at(mut self, at: DateTime<Utc>) -> Self {
        self.updated_at = at;
        self
    }
}

impl From<RemoteRecord> for Record {
    fn from(remote: RemoteRecord) -> Self {
        let record = Record::new(remote.payload)
            .with_remote_id(remote.id)
            .with_updated_at(remote.created_at);
        match remote.idempotency_key {
            Some(key) => record.with_mutation_id(key),
            None => record,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn remote_record_keeps_its_idempotency_key() {
        let key = MutationId::new();
        let record = Record::from(RemoteRecord {
            id: RemoteId::new("sales-1"),
            idempotency_key: Some(key),
            payload: json!({ "total": 12 }),
            created_at: Utc::now(),
        });

        assert_eq!(record.mutation_id, Some(key));
        assert_eq!(record.remote_id, Some(RemoteId::new("sales-1")));
        assert_eq!(record.origin, RecordOrigin::Remote);
    }
}
