//! `tillsync-client`
//!
//! **Responsibility:** Offline-first synchronization for the point-of-sale client.
//!
//! This crate provides:
//! - Connectivity detection (OS signal + health probe, debounced, with hysteresis)
//! - A durable on-device store for queued mutations and cached read snapshots
//! - The sync engine (write-through with queue fallback, FIFO replay)
//! - A background worker that drains the queue on reconnect and on a timer
//! - A network-first asset cache for the application shell
//!
//! The remote store stays the authority; this crate only makes sure no write
//! taken while offline is lost or applied twice.

pub mod asset_cache;
pub mod config;
pub mod connectivity;
pub mod engine;
pub mod remote;
pub mod retry;
pub mod store;
pub mod worker;

pub use asset_cache::{
    AssetCache, AssetCacheError, AssetRequest, AssetResponse, AssetStore, BroadcastMessage,
    ControlMessage, FetchError, Fetcher, HttpFetcher, InstallOutcome, Interception,
};
pub use config::{ClientConfig, ConfigError};
pub use connectivity::{ConnectivityConfig, ConnectivityMonitor, ConnectivityState, HttpProbe, Probe, StaticProbe};
pub use engine::{DrainReport, SyncEngine};
pub use remote::{HttpRemoteStore, InMemoryRemoteStore, RemoteStore};
pub use retry::{BackoffStrategy, RetryPolicy};
pub use store::{LocalStore, QuarantinedMutation, StoreError};
pub use worker::{SyncEvent, SyncWorker, SyncWorkerHandle};
