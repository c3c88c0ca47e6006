//! Sync engine: write-through with queue fallback, and queue replay.
//!
//! A submitted write walks an ordered chain of strategies:
//!
//! 1. [`WriteStrategy::Remote`] writes straight to the remote store. It declines
//!    when the client is offline, when older mutations are still queued (a
//!    direct write would overtake them) or when the attempt fails transiently.
//! 2. [`WriteStrategy::LocalQueue`] appends the mutation to the durable queue.
//!
//! A permanent rejection is not something a later retry can fix, so it stops
//! the chain and is returned to the caller instead of being queued.
//!
//! `drain_queue` replays pending mutations strictly in FIFO order, one at a
//! time, each attempt bounded by the remote timeout. A failed mutation stays
//! pending and the drain moves on; the retry policy decides when it becomes
//! eligible again and when it is considered stuck.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use serde_json::Value;
use tillsync_core::{
    FailureKind, MutationId, MutationRecord, Query, Record, RecordId, RecordOrigin, RemoteError,
    RemoteId, SubmitOutcome, SyncError, SyncResult,
};

use crate::connectivity::ConnectivityMonitor;
use crate::remote::RemoteStore;
use crate::retry::RetryPolicy;
use crate::store::{LocalStore, QuarantinedMutation};

/// One way of taking a submitted write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteStrategy {
    Remote,
    LocalQueue,
}

/// Order in which `submit` tries the strategies.
pub const SUBMIT_CHAIN: [WriteStrategy; 2] = [WriteStrategy::Remote, WriteStrategy::LocalQueue];

/// Result of trying a single strategy.
#[derive(Debug)]
pub enum StrategyOutcome {
    Taken(SubmitOutcome),
    Declined(Declined),
}

#[derive(Debug, thiserror::Error)]
pub enum Declined {
    #[error("client is offline")]
    Offline,
    #[error("{0} older mutation(s) still queued")]
    QueueNotEmpty(usize),
    #[error("{0}")]
    Transient(RemoteError),
}

/// Summary of one drain pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DrainReport {
    /// Mutations written during this pass, in FIFO order.
    pub synced: Vec<(MutationId, RemoteId)>,
    /// Mutations whose attempt failed during this pass.
    pub failed: Vec<MutationId>,
    /// Pending mutations skipped because their backoff has not elapsed.
    pub deferred: usize,
    /// Mutations excluded from automatic retries (including ones that just became stuck).
    pub stuck: Vec<MutationId>,
    /// The pass did not run (or stopped early) because the client is offline.
    pub skipped_offline: bool,
}

impl DrainReport {
    pub fn attempted(&self) -> usize {
        self.synced.len() + self.failed.len()
    }

    /// Mutations that became stuck during this pass.
    pub fn newly_stuck(&self) -> impl Iterator<Item = MutationId> + '_ {
        self.stuck.iter().copied().filter(|id| self.failed.contains(id))
    }
}

/// Coordinates the local store, the remote store and the connectivity monitor.
pub struct SyncEngine {
    store: LocalStore,
    remote: Arc<dyn RemoteStore>,
    connectivity: Arc<ConnectivityMonitor>,
    retry: RetryPolicy,
    remote_timeout: Duration,
    retention: chrono::Duration,
    drain_lock: tokio::sync::Mutex<()>,
    /// Collections whose snapshot was found corrupt and must be refreshed.
    stale: Mutex<HashSet<String>>,
}

impl std::fmt::Debug for SyncEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncEngine")
            .field("store", &self.store)
            .field("retry", &self.retry)
            .field("remote_timeout", &self.remote_timeout)
            .finish_non_exhaustive()
    }
}

impl SyncEngine {
    pub fn new(
        store: LocalStore,
        remote: Arc<dyn RemoteStore>,
        connectivity: Arc<ConnectivityMonitor>,
    ) -> Self {
        Self {
            store,
            remote,
            connectivity,
            retry: RetryPolicy::default(),
            remote_timeout: Duration::from_secs(8),
            retention: chrono::Duration::days(7),
            drain_lock: tokio::sync::Mutex::new(()),
            stale: Mutex::new(HashSet::new()),
        }
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_remote_timeout(mut self, timeout: Duration) -> Self {
        self.remote_timeout = timeout;
        self
    }

    pub fn with_retention(mut self, retention: chrono::Duration) -> Self {
        self.retention = retention;
        self
    }

    pub fn store(&self) -> &LocalStore {
        &self.store
    }

    pub fn connectivity(&self) -> &Arc<ConnectivityMonitor> {
        &self.connectivity
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    /// Submit a write.
    ///
    /// Returns `synced` when the remote store took it directly and `queued`
    /// when it was persisted for a later drain. Fails only when the remote store
    /// rejected it permanently or the local store cannot take it.
    pub async fn submit(&self, collection: &str, payload: Value) -> SyncResult<SubmitOutcome> {
        let mutation = MutationRecord::new(collection, payload);
        let mut last_decline = None;

        for strategy in SUBMIT_CHAIN {
            match self.try_strategy(strategy, &mutation).await? {
                StrategyOutcome::Taken(outcome) => return Ok(outcome),
                StrategyOutcome::Declined(reason) => {
                    tracing::debug!(local_id = %mutation.id, ?strategy, %reason, "write strategy declined");
                    last_decline = Some(reason);
                }
            }
        }

        Err(SyncError::Storage(format!(
            "no write strategy took mutation {}: {}",
            mutation.id,
            last_decline.map(|d| d.to_string()).unwrap_or_default()
        )))
    }

    /// Try a single strategy of the submit chain.
    pub async fn try_strategy(
        &self,
        strategy: WriteStrategy,
        mutation: &MutationRecord,
    ) -> SyncResult<StrategyOutcome> {
        match strategy {
            WriteStrategy::Remote => self.write_through(mutation).await,
            WriteStrategy::LocalQueue => {
                let id = self.store.enqueue_mutation(mutation).await.inspect_err(|e| {
                    tracing::error!(local_id = %mutation.id, error = %e, "failed to queue mutation");
                })?;
                tracing::info!(local_id = %id, collection = %mutation.collection, "mutation queued for later sync");
                Ok(StrategyOutcome::Taken(SubmitOutcome::queued(id)))
            }
        }
    }

    async fn write_through(&self, mutation: &MutationRecord) -> SyncResult<StrategyOutcome> {
        if !self.connectivity.is_online() {
            return Ok(StrategyOutcome::Declined(Declined::Offline));
        }
        // Stuck mutations wait for a manual retry and do not hold up new writes.
        let stuck = self.store.list_stuck(self.retry.max_attempts).await?.len();
        let queued = self.store.pending_count().await?.saturating_sub(stuck);
        if queued > 0 {
            return Ok(StrategyOutcome::Declined(Declined::QueueNotEmpty(queued)));
        }

        let remote_id = match self.attempt_write(mutation).await {
            Ok(remote_id) => remote_id,
            Err(err) if err.is_transient() => {
                tracing::warn!(local_id = %mutation.id, error = %err, "remote write failed, falling back to queue");
                return Ok(StrategyOutcome::Declined(Declined::Transient(err)));
            }
            Err(err) => {
                tracing::error!(local_id = %mutation.id, error = %err, "remote store rejected the write");
                return Err(err.into());
            }
        };

        // The remote store has the write now; local bookkeeping failures must
        // not turn it into a queued duplicate.
        if let Err(err) = self.store.record_synced(mutation, &remote_id).await {
            tracing::error!(local_id = %mutation.id, error = %err, "failed to record synced mutation");
        }
        self.cache_written(mutation, &remote_id).await;

        tracing::info!(local_id = %mutation.id, remote_id = %remote_id, "mutation written to remote store");
        Ok(StrategyOutcome::Taken(SubmitOutcome::synced(mutation.id, remote_id)))
    }

    /// One remote write bounded by the remote timeout.
    async fn attempt_write(&self, mutation: &MutationRecord) -> Result<RemoteId, RemoteError> {
        let write = self
            .remote
            .write(&mutation.collection, mutation.id, &mutation.payload);
        match tokio::time::timeout(self.remote_timeout, write).await {
            Ok(result) => result,
            Err(_) => Err(RemoteError::transient(format!(
                "remote write timed out after {:?}",
                self.remote_timeout
            ))),
        }
    }

    async fn cache_written(&self, mutation: &MutationRecord, remote_id: &RemoteId) {
        let record = Record::new(mutation.payload.clone())
            .with_remote_id(remote_id.clone())
            .with_mutation_id(mutation.id);
        if let Err(err) = self.store.put(&mutation.collection, &record).await {
            tracing::warn!(collection = %mutation.collection, error = %err, "failed to cache written record");
        }
    }

    /// Replay pending mutations against the remote store.
    ///
    /// Concurrent calls are serialized; mutations enqueued while a drain is
    /// running are picked up by the next one.
    pub async fn drain_queue(&self) -> SyncResult<DrainReport> {
        let _guard = self.drain_lock.lock().await;
        let mut report = DrainReport::default();

        if !self.connectivity.is_online() {
            tracing::debug!("skipping drain while offline");
            report.skipped_offline = true;
            return Ok(report);
        }

        self.refresh_stale().await;

        let pending = self.store.list_pending_mutations().await?;
        if pending.is_empty() {
            return Ok(report);
        }

        let now = Utc::now();
        for mutation in pending {
            if mutation.is_stuck(self.retry.max_attempts) {
                report.stuck.push(mutation.id);
                continue;
            }
            if !mutation.is_due(now) {
                report.deferred += 1;
                continue;
            }
            if !self.connectivity.is_online() {
                tracing::info!("connectivity lost during drain, stopping");
                report.skipped_offline = true;
                break;
            }

            match self.replay(&mutation).await {
                Ok(remote_id) => report.synced.push((mutation.id, remote_id)),
                Err(Some(now_stuck)) => {
                    report.failed.push(mutation.id);
                    if now_stuck {
                        report.stuck.push(mutation.id);
                    }
                }
                Err(None) => report.failed.push(mutation.id),
            }
        }

        tracing::info!(
            synced = report.synced.len(),
            failed = report.failed.len(),
            deferred = report.deferred,
            stuck = report.stuck.len(),
            "drain completed"
        );
        Ok(report)
    }

    /// Replay one mutation.
    ///
    /// On failure returns whether the mutation is stuck now, or `None` when the
    /// failure could not be recorded.
    async fn replay(&self, mutation: &MutationRecord) -> Result<RemoteId, Option<bool>> {
        let remote_id = match &mutation.remote_id {
            // Already accepted remotely; only the local bookkeeping is missing.
            Some(remote_id) => remote_id.clone(),
            None => match self.attempt_write(mutation).await {
                Ok(remote_id) => remote_id,
                Err(err) => return Err(self.record_failure(mutation, &err).await),
            },
        };

        if let Err(err) = self.store.mark_synced(mutation.id, &remote_id).await {
            tracing::error!(local_id = %mutation.id, error = %err, "failed to mark mutation synced");
            return Err(None);
        }
        self.cache_written(mutation, &remote_id).await;
        tracing::debug!(local_id = %mutation.id, remote_id = %remote_id, "queued mutation synced");
        Ok(remote_id)
    }

    async fn record_failure(&self, mutation: &MutationRecord, err: &RemoteError) -> Option<bool> {
        let failures = mutation.attempts.saturating_add(1);
        let (kind, next_attempt_at) = if err.is_transient() {
            (
                FailureKind::Transient,
                self.retry.next_attempt_at(failures, Utc::now()),
            )
        } else {
            (FailureKind::Permanent, None)
        };

        match kind {
            FailureKind::Transient => tracing::warn!(
                local_id = %mutation.id,
                attempts = failures,
                error = %err,
                "replay failed, will retry"
            ),
            FailureKind::Permanent => tracing::error!(
                local_id = %mutation.id,
                attempts = failures,
                error = %err,
                "replay rejected by remote store"
            ),
        }

        match self
            .store
            .record_failure(mutation.id, &err.to_string(), kind, next_attempt_at)
            .await
        {
            Ok(attempts) => {
                let stuck = kind == FailureKind::Permanent || attempts >= self.retry.max_attempts;
                if stuck {
                    tracing::warn!(local_id = %mutation.id, attempts, "mutation is stuck and needs attention");
                }
                Some(stuck)
            }
            Err(store_err) => {
                tracing::error!(local_id = %mutation.id, error = %store_err, "failed to record replay failure");
                None
            }
        }
    }

    /// Records of a collection: the snapshot plus writes still waiting in the queue.
    ///
    /// Online, the snapshot is refreshed from the remote store first; a failed
    /// refresh falls back to the cached copy. A queued write the snapshot
    /// already holds (accepted remotely but not yet marked synced) is listed once.
    pub async fn get_all(&self, collection: &str) -> SyncResult<Vec<Record>> {
        if self.connectivity.is_online() {
            if let Err(err) = self.refresh_collection(collection).await {
                tracing::warn!(collection, error = %err, "refresh failed, serving cached snapshot");
            }
        }

        let mut records = match self.store.get_all(collection).await {
            Ok(records) => records,
            Err(err) if err.is_corruption() => {
                tracing::error!(collection, error = %err, "cached snapshot is corrupt, discarding it");
                self.store.clear_snapshot(collection).await?;
                self.stale().insert(collection.to_string());
                Vec::new()
            }
            Err(err) => return Err(err.into()),
        };

        let confirmed: HashSet<MutationId> = records.iter().filter_map(|r| r.mutation_id).collect();
        let pending = self.store.list_pending_mutations().await?;
        records.extend(
            pending
                .into_iter()
                .filter(|m| m.collection == collection && !confirmed.contains(&m.id))
                .map(pending_record),
        );
        Ok(records)
    }

    /// Replace the cached snapshot of a collection with the remote contents.
    pub async fn refresh_collection(&self, collection: &str) -> SyncResult<usize> {
        let records = tokio::time::timeout(
            self.remote_timeout,
            self.remote.query(collection, &Query::all()),
        )
        .await
        .map_err(|_| SyncError::transient(format!("query of '{collection}' timed out")))??;

        let snapshot: Vec<Record> = records.into_iter().map(Record::from).collect();
        self.store.replace_snapshot(collection, &snapshot).await?;
        self.stale().remove(collection);

        tracing::debug!(collection, count = snapshot.len(), "snapshot refreshed");
        Ok(snapshot.len())
    }

    /// Collections waiting for a refresh after their snapshot was discarded.
    pub fn stale_collections(&self) -> Vec<String> {
        let mut stale: Vec<String> = self.stale().iter().cloned().collect();
        stale.sort();
        stale
    }

    async fn refresh_stale(&self) {
        for collection in self.stale_collections() {
            match self.refresh_collection(&collection).await {
                Ok(count) => tracing::info!(collection = %collection, count, "discarded snapshot rebuilt"),
                Err(err) => {
                    tracing::warn!(collection = %collection, error = %err, "snapshot rebuild failed")
                }
            }
        }
    }

    pub async fn pending_count(&self) -> SyncResult<usize> {
        Ok(self.store.pending_count().await?)
    }

    /// Pending mutations excluded from automatic retries.
    pub async fn stuck_mutations(&self) -> SyncResult<Vec<MutationRecord>> {
        Ok(self.store.list_stuck(self.retry.max_attempts).await?)
    }

    /// Queue rows that were set aside because they no longer decode.
    pub async fn quarantined_mutations(&self) -> SyncResult<Vec<QuarantinedMutation>> {
        Ok(self.store.list_quarantined().await?)
    }

    /// Make a stuck mutation eligible for the next drain again.
    ///
    /// Returns `false` when the mutation is already synced.
    pub async fn retry(&self, id: MutationId) -> SyncResult<bool> {
        let reset = self.store.reset_attempts(id).await?;
        if reset {
            tracing::info!(local_id = %id, "mutation re-armed for retry");
        }
        Ok(reset)
    }

    /// Delete synced mutations older than the retention period.
    pub async fn prune_synced(&self) -> SyncResult<u64> {
        let pruned = self.store.prune_synced(Utc::now() - self.retention).await?;
        if pruned > 0 {
            tracing::info!(pruned, "pruned synced mutations");
        }
        Ok(pruned)
    }

    fn stale(&self) -> MutexGuard<'_, HashSet<String>> {
        self.stale.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn pending_record(mutation: MutationRecord) -> Record {
    Record {
        id: RecordId::from_uuid(*mutation.id.as_uuid()),
        remote_id: None,
        mutation_id: Some(mutation.id),
        payload: mutation.payload,
        updated_at: mutation.created_at,
        origin: RecordOrigin::Pending,
    }
}
