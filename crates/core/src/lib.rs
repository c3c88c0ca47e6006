//! `tillsync-core`: shared building blocks of the offline sync subsystem.
//!
//! This crate contains **pure** types (no storage or network concerns):
//! identifiers, mutation and record models, remote queries and the error
//! taxonomy used by the client.

pub mod error;
pub mod id;
pub mod mutation;
pub mod query;
pub mod record;

pub use error::{RemoteError, SyncError, SyncResult};
pub use id::{MutationId, RecordId, RemoteId};
pub use mutation::{FailureKind, MutationRecord, MutationStatus, SubmitOutcome, SubmitStatus};
pub use query::{Direction, Order, Query};
pub use record::{Record, RecordOrigin, RemoteRecord};
