use crate::commitment::StagePayload;
use crate::config::CustodyConfig;
use crate::engine::{Transition, TransitionArtifact, TransitionEngine};
use crate::error::{CustodyError, Result};
use crate::id::{HolderKey, RecordId};
use crate::interfaces::{Broadcaster, Indexer, Wallet};
use crate::queue::{BroadcastQueue, FileQueueJournal, MemoryQueueJournal, QueueEvent, QueueJournal};
use crate::reconcile::{ReconciliationReport, ReconciliationScanner};
use crate::selector::{self, CustodySelector};
use crate::storage::{open_store, TokenStore};
use crate::token::{Stage, StageData, Token};
use log::{debug, error, info, warn};
use std::sync::Arc;
use tokio::sync::{broadcast, watch, Mutex};
use tokio::task::JoinHandle;

struct Worker {
    handle: JoinHandle<()>,
    shutdown: watch::Sender<bool>,
}

/// Entry point for moving records along their custody chains
///
/// The token store is the single source of truth; the service keeps no
/// token state of its own.
pub struct CustodyService {
    store: Arc<dyn TokenStore>,
    engine: TransitionEngine,
    selector: CustodySelector,
    queue: Arc<BroadcastQueue>,
    scanner: ReconciliationScanner,
    // serializes every operation that spends or creates tokens
    advance_lock: Mutex<()>,
    worker: Mutex<Option<Worker>>,
}

impl CustodyService {
    /// Open the configured store and journal and wire up the service
    pub async fn open(
        config: CustodyConfig,
        wallet: Arc<dyn Wallet>,
        broadcaster: Arc<dyn Broadcaster>,
        indexer: Arc<dyn Indexer>,
    ) -> Result<Self> {
        let store = open_store(&config.store).await?;
        let journal: Arc<dyn QueueJournal> = match &config.queue_journal {
            Some(path) => Arc::new(FileQueueJournal::open(path)?),
            None => Arc::new(MemoryQueueJournal::new()),
        };
        Self::with_parts(config, wallet, broadcaster, indexer, store, journal)
    }

    /// Wire up the service over an already opened store and journal
    pub fn with_parts(
        config: CustodyConfig,
        wallet: Arc<dyn Wallet>,
        broadcaster: Arc<dyn Broadcaster>,
        indexer: Arc<dyn Indexer>,
        store: Arc<dyn TokenStore>,
        journal: Arc<dyn QueueJournal>,
    ) -> Result<Self> {
        let queue = Arc::new(BroadcastQueue::open(
            broadcaster,
            wallet.clone(),
            store.clone(),
            journal,
        )?);

        Ok(Self {
            engine: TransitionEngine::new(wallet, config),
            selector: CustodySelector::new(store.clone()),
            scanner: ReconciliationScanner::new(store.clone(), indexer),
            store,
            queue,
            advance_lock: Mutex::new(()),
            worker: Mutex::new(None),
        })
    }

    /// Issue a new custody chain at the first stage
    pub async fn create_first_stage(
        &self,
        payload: StagePayload,
        next_holder: HolderKey,
    ) -> Result<Token> {
        let _guard = self.advance_lock.lock().await;
        let transition = self
            .engine
            .transition(None, StageData::new(Stage::first(), payload), next_holder)
            .await?;
        self.persist(None, transition).await
    }

    /// Spend the record's current token into `next`
    ///
    /// Fails with `NoActiveToken` when the record has no spendable token, and
    /// with `InvalidPredecessor` when its chain has already terminated or
    /// `next.stage` does not follow the current stage.
    pub async fn advance_stage(
        &self,
        record_id: &RecordId,
        next: StageData,
        next_holder: HolderKey,
    ) -> Result<Token> {
        let _guard = self.advance_lock.lock().await;

        let tokens = self.store.get_by_record(record_id).await?;
        let in_flight = self.queue.in_flight_spends().await;
        let current = match selector::select_from(&tokens, record_id, &in_flight) {
            Some(token) => token,
            None => {
                return Err(match selector::current_stage(&tokens, record_id) {
                    Some(stage) if stage.is_terminal() => CustodyError::InvalidPredecessor {
                        requested: next.stage,
                        found: Some(stage),
                    },
                    _ => CustodyError::NoActiveToken(*record_id),
                })
            }
        };

        let transition = self
            .engine
            .transition(Some(&current), next, next_holder)
            .await?;
        self.persist(Some(&current), transition).await
    }

    /// Advance to whatever stage follows the current one
    pub async fn advance(
        &self,
        record_id: &RecordId,
        payload: StagePayload,
        next_holder: HolderKey,
    ) -> Result<Token> {
        let current = self
            .current_stage(record_id)
            .await?
            .ok_or(CustodyError::NoActiveToken(*record_id))?;
        // a terminated chain has nothing after it; advance_stage reports that
        let stage = current.next().unwrap_or(current);
        self.advance_stage(record_id, StageData::new(stage, payload), next_holder)
            .await
    }

    // The token and the spent predecessor are committed together before the
    // artifact can reach the network. If the artifact cannot be journaled the
    // commit is reverted, so a failed advance leaves the chain as it was.
    async fn persist(&self, predecessor: Option<&Token>, transition: Transition) -> Result<Token> {
        let Transition { artifact, token } = transition;
        let spent = predecessor.map(|p| p.txid);

        if !self.store.commit_transition(&token, spent.as_ref()).await? {
            warn!("Predecessor of {} vanished from the store", token.txid);
        }

        if let Err(e) = self.queue.enqueue(artifact).await {
            warn!("Failed to queue transition {}: {}", token.txid, e);
            if let Err(revert) = self.store.revert_transition(&token.txid, spent.as_ref()).await {
                error!("Failed to revert transition {}: {}", token.txid, revert);
            }
            return Err(e);
        }

        info!(
            "Record {} advanced to {} in {}",
            token.record_id, token.stage, token.txid
        );
        Ok(token)
    }

    pub async fn current_stage(&self, record_id: &RecordId) -> Result<Option<Stage>> {
        self.selector.current_stage(record_id).await
    }

    /// Every token of the chain, oldest first
    pub async fn history(&self, record_id: &RecordId) -> Result<Vec<Token>> {
        self.store.get_by_record(record_id).await
    }

    pub async fn pending_count(&self) -> usize {
        self.queue.pending_count().await
    }

    pub async fn reconcile(&self) -> Result<ReconciliationReport> {
        let _guard = self.advance_lock.lock().await;
        self.scanner.scan().await
    }

    pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.queue.subscribe()
    }

    /// Put a rejected artifact back on the queue
    pub async fn resubmit(&self, artifact: TransitionArtifact) -> Result<()> {
        self.queue.resubmit(artifact).await
    }

    pub fn queue(&self) -> &Arc<BroadcastQueue> {
        &self.queue
    }

    /// Spawn the broadcast worker; a no-op when it is already running
    pub async fn start(&self) {
        let mut worker = self.worker.lock().await;
        if worker.is_some() {
            return;
        }
        let (shutdown, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(self.queue.clone().run(shutdown_rx));
        *worker = Some(Worker { handle, shutdown });
        debug!("Custody service started");
    }

    /// Stop the broadcast worker and wait for it to finish its current step
    pub async fn shutdown(&self) {
        let Some(worker) = self.worker.lock().await.take() else {
            return;
        };
        let _ = worker.shutdown.send(true);
        if let Err(e) = worker.handle.await {
            warn!("Broadcast worker ended abnormally: {}", e);
        }
        debug!("Custody service stopped");
    }

    /// Forget every token and queued artifact
    pub async fn reset(&self) -> Result<()> {
        let _guard = self.advance_lock.lock().await;
        self.queue.clear().await?;
        self.store.clear().await?;
        warn!("Custody state reset");
        Ok(())
    }
}
