//! Queued mutations and their synchronization status.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::id::{MutationId, RemoteId};

/// Synchronization status of a mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MutationStatus {
    /// Not yet accepted by the remote store.
    Pending,
    /// Accepted by the remote store; `remote_id` is set.
    Synced,
}

impl MutationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MutationStatus::Pending => "pending",
            MutationStatus::Synced => "synced",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(MutationStatus::Pending),
            "synced" => Some(MutationStatus::Synced),
            _ => None,
        }
    }
}

/// Classification of the last failed remote attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailureKind {
    Transient,
    Permanent,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::Transient => "transient",
            FailureKind::Permanent => "permanent",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "transient" => Some(FailureKind::Transient),
            "permanent" => Some(FailureKind::Permanent),
            _ => None,
        }
    }
}

/// A write that must eventually be applied at the remote store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MutationRecord {
    pub id: MutationId,
    /// Target collection at the remote store (e.g. `sales`).
    pub collection: String,
    /// Snapshot of the domain record to write.
    pub payload: Value,
    pub status: MutationStatus,
    pub created_at: DateTime<Utc>,
    pub remote_id: Option<RemoteId>,
    /// Number of failed remote attempts so far.
    pub attempts: u32,
    pub last_error: Option<String>,
    pub failure: Option<FailureKind>,
    /// Earliest time an automatic retry may run.
    pub next_attempt_at: Option<DateTime<Utc>>,
    pub synced_at: Option<DateTime<Utc>>,
}

impl MutationRecord {
    /// Create a fresh pending mutation with a newly generated local id.
    pub fn new(collection: impl Into<String>, payload: Value) -> Self {
        Self {
            id: MutationId::new(),
            collection: collection.into(),
            payload,
            status: MutationStatus::Pending,
            created_at: Utc::now(),
            remote_id: None,
            attempts: 0,
            last_error: None,
            failure: None,
            next_attempt_at: None,
            synced_at: None,
        }
    }

    pub fn is_pending(&self) -> bool {
        self.status == MutationStatus::Pending
    }

    /// Whether an automatic drain may attempt this mutation at `now`.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.next_attempt_at.is_none_or(|at| at <= now)
    }

    /// Whether the mutation is excluded from automatic retries.
    pub fn is_stuck(&self, max_attempts: u32) -> bool {
        self.is_pending()
            && (self.failure == Some(FailureKind::Permanent) || self.attempts >= max_attempts)
    }
}

/// Status reported to UI collaborators after `submit`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubmitStatus {
    /// Written to the remote store.
    Synced,
    /// Persisted locally; will be replayed when connectivity returns.
    Queued,
}

/// Result of a successful `submit`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitOutcome {
    pub status: SubmitStatus,
    pub local_id: MutationId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remote_id: Option<RemoteId>,
}

impl SubmitOutcome {
    pub fn synced(local_id: MutationId, remote_id: RemoteId) -> Self {
        Self {
            status: SubmitStatus::Synced,
            local_id,
            remote_id: Some(remote_id),
        }
    }

    pub fn queued(local_id: MutationId) -> Self {
        Self {
            status: SubmitStatus::Queued,
            local_id,
            remote_id: None,
        }
    }
}
