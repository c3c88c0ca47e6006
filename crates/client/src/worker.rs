//! Background worker driving queue drains.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tillsync_core::MutationId;
use tokio::sync::{Notify, broadcast};
use tokio::task::JoinHandle;

use crate::connectivity::ConnectivityState;
use crate::engine::SyncEngine;

const EVENT_CAPACITY: usize = 64;

/// Notifications for UI collaborators.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SyncEvent {
    ConnectivityChanged { state: ConnectivityState },
    DrainCompleted { synced: usize, failed: usize, deferred: usize },
    /// Mutations that newly became stuck and need manual attention.
    MutationsStuck { ids: Vec<MutationId> },
    DrainFailed { error: String },
}

/// Background sync worker.
///
/// Drains the queue when connectivity is restored and on a timer; the timer
/// pass also applies the retention policy.
pub struct SyncWorker {
    engine: Arc<SyncEngine>,
    drain_interval: Duration,
    shutdown: Arc<Notify>,
    events: broadcast::Sender<SyncEvent>,
}

pub struct SyncWorkerHandle {
    shutdown: Arc<Notify>,
    events: broadcast::Sender<SyncEvent>,
    task: JoinHandle<()>,
}

impl SyncWorkerHandle {
    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.events.subscribe()
    }

    /// Stop the worker and wait for the loop to exit.
    pub async fn shutdown(self) {
        self.shutdown.notify_one();
        if let Err(err) = self.task.await {
            tracing::error!("sync worker task failed: {err}");
        }
    }
}

impl SyncWorker {
    pub fn new(engine: Arc<SyncEngine>, drain_interval: Duration) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            engine,
            drain_interval,
            shutdown: Arc::new(Notify::new()),
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.events.subscribe()
    }

    /// Start the background loop.
    ///
    /// The first timer tick fires immediately, so mutations persisted by a
    /// previous run are replayed as soon as the client is online.
    pub fn start(self) -> SyncWorkerHandle {
        let SyncWorker {
            engine,
            drain_interval,
            shutdown,
            events,
        } = self;
        let mut connectivity = engine.connectivity().subscribe();
        let handle_shutdown = shutdown.clone();
        let handle_events = events.clone();

        let task = tokio::spawn(async move {
            tracing::info!(interval = ?drain_interval, "sync worker started");

            let mut ticker = tokio::time::interval(drain_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            let mut reported_stuck = HashSet::new();

            loop {
                tokio::select! {
                    _ = shutdown.notified() => {
                        tracing::info!("sync worker received shutdown signal");
                        break;
                    }
                    changed = connectivity.changed() => {
                        if changed.is_err() {
                            tracing::warn!("connectivity monitor dropped, stopping sync worker");
                            break;
                        }
                        let state = *connectivity.borrow_and_update();
                        let _ = events.send(SyncEvent::ConnectivityChanged { state });
                        if state.is_online() {
                            tracing::info!("connectivity restored, draining queue");
                            drain(&engine, &events, &mut reported_stuck).await;
                        }
                    }
                    _ = ticker.tick() => {
                        if !engine.connectivity().is_online() {
                            tracing::debug!("skipping timed drain while offline");
                            continue;
                        }
                        drain(&engine, &events, &mut reported_stuck).await;
                        if let Err(err) = engine.prune_synced().await {
                            tracing::warn!(error = %err, "failed to prune synced mutations");
                        }
                    }
                }
            }

            tracing::info!("sync worker stopped");
        });

        SyncWorkerHandle {
            shutdown: handle_shutdown,
            events: handle_events,
            task,
        }
    }
}

async fn drain(
    engine: &SyncEngine,
    events: &broadcast::Sender<SyncEvent>,
    reported_stuck: &mut HashSet<MutationId>,
) {
    match engine.drain_queue().await {
        Ok(report) if report.skipped_offline && report.attempted() == 0 => {}
        Ok(report) => {
            let _ = events.send(SyncEvent::DrainCompleted {
                synced: report.synced.len(),
                failed: report.failed.len(),
                deferred: report.deferred,
            });

            for (id, _) in &report.synced {
                reported_stuck.remove(id);
            }
            // A mutation that failed into the stuck state this pass is news even
            // if it was reported before a manual retry.
            let fresh: HashSet<MutationId> = report.newly_stuck().collect();
            let newly_stuck: Vec<MutationId> = report
                .stuck
                .iter()
                .copied()
                .filter(|id| reported_stuck.insert(*id) || fresh.contains(id))
                .collect();
            if !newly_stuck.is_empty() {
                tracing::warn!(count = newly_stuck.len(), "mutations need manual attention");
                let _ = events.send(SyncEvent::MutationsStuck { ids: newly_stuck });
            }
        }
        Err(err) => {
            tracing::error!(error = %err, "drain failed");
            let _ = events.send(SyncEvent::DrainFailed {
                error: err.to_string(),
            });
        }
    }
}
