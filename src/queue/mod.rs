//! Durable, strictly ordered broadcast of signed transitions.
//!
//! At most one artifact is `Submitting` at any time, and only the head of the
//! queue is ever submitted: a transition spending an output of the previous
//! one waits until that output exists on the network.

mod journal;

pub use journal::{replay, unresolved, FileQueueJournal, JournalEntry, MemoryQueueJournal, QueueJournal};

use crate::engine::TransitionArtifact;
use crate::error::{CustodyError, Result};
use crate::id::{Outpoint, RecordId, Txid};
use crate::interfaces::{Broadcaster, Wallet};
use crate::storage_traits::TokenStore;
use crate::token::{Stage, TOKEN_OUTPUT_INDEX};
use log::{debug, error, info, warn};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::{broadcast, watch, Mutex, Notify};

const EVENT_CAPACITY: usize = 64;
// final states remembered for `state_of` after an artifact leaves the queue
const RESOLVED_CAPACITY: usize = 1024;

/// Lifecycle of one queued artifact
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ArtifactState {
    Pending,
    Submitting,
    Accepted,
    Rejected,
}

/// Queue progress published to subscribers
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueueEvent {
    Submitting {
        txid: Txid,
    },
    Accepted {
        txid: Txid,
        record_id: RecordId,
        stage: Stage,
    },
    /// The network refused the artifact; it has left the queue and may be resubmitted
    Rejected {
        artifact: TransitionArtifact,
        status: String,
    },
}

impl QueueEvent {
    pub fn txid(&self) -> Txid {
        match self {
            QueueEvent::Submitting { txid } | QueueEvent::Accepted { txid, .. } => *txid,
            QueueEvent::Rejected { artifact, .. } => artifact.txid,
        }
    }

    /// The rejection as an error for the caller layer
    pub fn to_error(&self) -> Option<CustodyError> {
        match self {
            QueueEvent::Rejected { artifact, status } => Some(CustodyError::BroadcastRejected {
                txid: artifact.txid,
                status: status.clone(),
            }),
            _ => None,
        }
    }
}

struct QueuedArtifact {
    artifact: TransitionArtifact,
    state: ArtifactState,
}

#[derive(Default)]
struct QueueState {
    entries: VecDeque<QueuedArtifact>,
    // final state of the most recent artifacts that have left the queue
    resolved: HashMap<Txid, ArtifactState>,
    resolved_order: VecDeque<Txid>,
}

impl QueueState {
    fn remember(&mut self, txid: Txid, state: ArtifactState) {
        if self.resolved.insert(txid, state).is_none() {
            self.resolved_order.push_back(txid);
        }
        while self.resolved_order.len() > RESOLVED_CAPACITY {
            if let Some(oldest) = self.resolved_order.pop_front() {
                self.resolved.remove(&oldest);
            }
        }
    }

    fn forget(&mut self, txid: &Txid) {
        if self.resolved.remove(txid).is_some() {
            self.resolved_order.retain(|t| t != txid);
        }
    }

    /// Pull every queued artifact that spends, directly or through another
    /// pulled artifact, an output of `rejected`
    fn take_dependents(&mut self, rejected: Txid) -> Vec<TransitionArtifact> {
        let mut doomed = vec![rejected];
        let mut dependents = Vec::new();
        let mut kept = VecDeque::with_capacity(self.entries.len());

        // successors are always queued after what they spend
        for queued in self.entries.drain(..) {
            let spends_doomed = queued
                .artifact
                .spends
                .map_or(false, |outpoint| doomed.contains(&outpoint.txid));
            if spends_doomed && queued.state == ArtifactState::Pending {
                doomed.push(queued.artifact.txid);
                dependents.push(queued.artifact);
            } else {
                kept.push_back(queued);
            }
        }
        self.entries = kept;
        dependents
    }
}

/// FIFO dispatcher of transition artifacts
pub struct BroadcastQueue {
    broadcaster: Arc<dyn Broadcaster>,
    wallet: Arc<dyn Wallet>,
    store: Arc<dyn TokenStore>,
    journal: Arc<dyn QueueJournal>,
    state: Mutex<QueueState>,
    notify: Notify,
    events: broadcast::Sender<QueueEvent>,
}

impl BroadcastQueue {
    /// Build a queue, restoring every unresolved artifact from the journal as `Pending`
    pub fn open(
        broadcaster: Arc<dyn Broadcaster>,
        wallet: Arc<dyn Wallet>,
        store: Arc<dyn TokenStore>,
        journal: Arc<dyn QueueJournal>,
    ) -> Result<Self> {
        let restored = replay(journal.as_ref())?;
        if !restored.is_empty() {
            info!("Restored {} unresolved artifacts from journal", restored.len());
        }

        let state = QueueState {
            entries: restored
                .into_iter()
                .map(|artifact| QueuedArtifact {
                    artifact,
                    state: ArtifactState::Pending,
                })
                .collect(),
            ..QueueState::default()
        };
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        Ok(Self {
            broadcaster,
            wallet,
            store,
            journal,
            state: Mutex::new(state),
            notify: Notify::new(),
            events,
        })
    }

    /// Append an artifact; it is journaled before it becomes visible
    pub async fn enqueue(&self, artifact: TransitionArtifact) -> Result<()> {
        let mut state = self.state.lock().await;
        if state.entries.iter().any(|q| q.artifact.txid == artifact.txid) {
            debug!("Artifact {} is already queued", artifact.txid);
            return Ok(());
        }

        self.journal.append(&JournalEntry::Enqueued(artifact.clone()))?;
        debug!(
            "Queued {} transition {} for record {}",
            artifact.stage, artifact.txid, artifact.record_id
        );
        state.forget(&artifact.txid);
        state.entries.push_back(QueuedArtifact {
            artifact,
            state: ArtifactState::Pending,
        });
        drop(state);

        self.notify.notify_one();
        Ok(())
    }

    /// Queue a previously rejected artifact again
    pub async fn resubmit(&self, artifact: TransitionArtifact) -> Result<()> {
        info!("Resubmitting transition {}", artifact.txid);
        self.enqueue(artifact).await
    }

    /// Artifacts waiting or in flight
    pub async fn pending_count(&self) -> usize {
        self.state.lock().await.entries.len()
    }

    pub async fn state_of(&self, txid: &Txid) -> Option<ArtifactState> {
        let state = self.state.lock().await;
        state
            .entries
            .iter()
            .find(|q| q.artifact.txid == *txid)
            .map(|q| q.state)
            .or_else(|| state.resolved.get(txid).copied())
    }

    /// Token outputs being spent by the submitting artifact
    pub async fn in_flight_spends(&self) -> Vec<Outpoint> {
        self.state
            .lock()
            .await
            .entries
            .iter()
            .filter(|q| q.state == ArtifactState::Submitting)
            .filter_map(|q| q.artifact.spends)
            .collect()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.events.subscribe()
    }

    /// Drop every queued artifact; only for an explicit out-of-band reset
    pub async fn clear(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        self.journal.clear()?;
        state.entries.clear();
        state.resolved.clear();
        state.resolved_order.clear();
        Ok(())
    }

    /// Submit the head of the queue
    ///
    /// # Returns
    /// The outcome, or `None` when the queue is empty or its head is already in flight
    pub async fn process_next(&self) -> Result<Option<QueueEvent>> {
        let artifact = {
            let mut state = self.state.lock().await;
            match state.entries.front_mut() {
                None => return Ok(None),
                Some(head) if head.state == ArtifactState::Submitting => return Ok(None),
                Some(head) => {
                    head.state = ArtifactState::Submitting;
                    head.artifact.clone()
                }
            }
        };

        debug!("Submitting transition {}", artifact.txid);
        self.publish(QueueEvent::Submitting {
            txid: artifact.txid,
        });

        let (accepted, status) = match self.broadcaster.submit(&artifact.raw_tx).await {
            Ok(response) => (response.accepted, response.status),
            Err(e) => (false, e.to_string()),
        };

        let event = if accepted {
            info!(
                "Transition {} accepted ({} for record {})",
                artifact.txid, artifact.stage, artifact.record_id
            );
            self.after_acceptance(&artifact).await;
            QueueEvent::Accepted {
                txid: artifact.txid,
                record_id: artifact.record_id,
                stage: artifact.stage,
            }
        } else {
            warn!("Transition {} rejected: {}", artifact.txid, status);
            QueueEvent::Rejected {
                artifact: artifact.clone(),
                status,
            }
        };

        let dependents = {
            let mut state = self.state.lock().await;
            state.entries.pop_front();
            if accepted {
                state.remember(artifact.txid, ArtifactState::Accepted);
                Vec::new()
            } else {
                state.remember(artifact.txid, ArtifactState::Rejected);
                let dependents = state.take_dependents(artifact.txid);
                for dependent in &dependents {
                    state.remember(dependent.txid, ArtifactState::Rejected);
                }
                dependents
            }
        };
        self.publish(event.clone());

        self.journal.append(&JournalEntry::Resolved {
            txid: artifact.txid,
            accepted,
        })?;

        // their inputs will never exist, so they are never submitted
        for dependent in dependents {
            warn!(
                "Transition {} dropped: it spends rejected transition {}",
                dependent.txid, artifact.txid
            );
            self.journal.append(&JournalEntry::Resolved {
                txid: dependent.txid,
                accepted: false,
            })?;
            self.publish(QueueEvent::Rejected {
                status: format!("predecessor {} rejected", artifact.txid),
                artifact: dependent,
            });
        }
        Ok(Some(event))
    }

    /// Level-triggered worker: drain the queue, then sleep until something is enqueued
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        info!("Broadcast queue worker started");
        loop {
            if *shutdown.borrow() {
                break;
            }

            match self.process_next().await {
                Ok(Some(_)) => continue,
                Ok(None) => {}
                Err(e) => {
                    error!("Broadcast queue step failed: {}", e);
                    continue;
                }
            }

            tokio::select! {
                _ = self.notify.notified() => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
        info!("Broadcast queue worker stopped");
    }

    // Bookkeeping failures here are logged; the network has already accepted the spend
    async fn after_acceptance(&self, artifact: &TransitionArtifact) {
        let outpoint = Outpoint::new(artifact.txid, TOKEN_OUTPUT_INDEX);
        match self.store.set_outpoint(&artifact.txid, &outpoint).await {
            Ok(true) => {}
            Ok(false) => warn!("No stored token for accepted transition {}", artifact.txid),
            Err(e) => error!("Failed to record outpoint {}: {}", outpoint, e),
        }

        for item in &artifact.relinquish {
            match self
                .wallet
                .relinquish_output(&item.basket, &item.outpoint)
                .await
            {
                Ok(()) => debug!("Relinquished {} from {}", item.outpoint, item.basket),
                Err(e) => error!(
                    "Failed to relinquish {} from {}: {}",
                    item.outpoint, item.basket, e
                ),
            }
        }
    }

    fn publish(&self, event: QueueEvent) {
        // no subscribers is fine
        let _ = self.events.send(event);
    }
}
