//! In-process stand-ins for the wallet, broadcaster and indexer.
//!
//! The mock wallet keeps no private keys. A lock key is derived from the
//! public identities of the locking party and its counterparty, so only the
//! intended counterparty can reproduce it when unlocking.

use crate::config::ProtocolId;
use crate::error::{CustodyError, Result};
use crate::id::{HolderKey, KeyId, Outpoint, Txid};
use crate::interfaces::{
    ActionRequest, BroadcastResponse, Broadcaster, CustomInstructions, Indexer, LockRequest,
    OutputFilter, SignedAction, TxStatus, UnlockRequest, Wallet, WalletOutput,
};
use crate::script::{LockingScript, UnlockTemplate};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};
use tokio::sync::Semaphore;

fn guard<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    // a panicking test thread must not wedge the others
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Transaction format produced by [`MockWallet::create_action`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MockTransaction {
    pub inputs: Vec<(Outpoint, Vec<u8>)>,
    pub outputs: Vec<(Vec<u8>, u64)>,
    pub funding: Vec<Outpoint>,
    pub nonce: u64,
}

impl MockTransaction {
    pub fn decode(raw_tx: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(raw_tx)?)
    }
}

fn lock_key(protocol: &ProtocolId, key_id: &KeyId, locker: &HolderKey, counterparty: &HolderKey) -> HolderKey {
    let mut seed = Vec::new();
    seed.push(protocol.security_level);
    seed.extend_from_slice(protocol.name.as_bytes());
    seed.extend_from_slice(key_id.as_str().as_bytes());
    seed.extend_from_slice(locker.as_ref());
    seed.extend_from_slice(counterparty.as_ref());
    HolderKey::derive(&seed)
}

#[derive(Default)]
struct WalletState {
    baskets: HashMap<String, Vec<WalletOutput>>,
    relinquished: Vec<(String, Outpoint)>,
    actions: Vec<ActionRequest>,
    nonce: u64,
}

/// Mock implementation of the Wallet trait for testing purposes
pub struct MockWallet {
    identity: Mutex<HolderKey>,
    state: Mutex<WalletState>,
    fail_signing: AtomicBool,
}

impl MockWallet {
    /// Create a wallet signing as the identity derived from `seed`
    pub fn new(seed: &[u8]) -> Self {
        Self {
            identity: Mutex::new(HolderKey::derive(seed)),
            state: Mutex::new(WalletState::default()),
            fail_signing: AtomicBool::new(false),
        }
    }

    /// Switch the signing identity, as if a different party took over the device
    pub fn act_as(&self, seed: &[u8]) {
        *guard(&self.identity) = HolderKey::derive(seed);
    }

    /// Make every lock, unlock and signing call fail
    pub fn fail_signing(&self, fail: bool) {
        self.fail_signing.store(fail, Ordering::SeqCst);
    }

    /// Every action signed so far, oldest first
    pub fn actions(&self) -> Vec<ActionRequest> {
        guard(&self.state).actions.clone()
    }

    pub fn relinquished(&self) -> Vec<(String, Outpoint)> {
        guard(&self.state).relinquished.clone()
    }

    pub fn basket(&self, name: &str) -> Vec<WalletOutput> {
        guard(&self.state).baskets.get(name).cloned().unwrap_or_default()
    }

    fn check_signer(&self) -> Result<()> {
        if self.fail_signing.load(Ordering::SeqCst) {
            Err(CustodyError::SigningFailed("mock signer offline".to_string()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl Wallet for MockWallet {
    fn identity_key(&self) -> HolderKey {
        *guard(&self.identity)
    }

    async fn lock(&self, request: &LockRequest) -> Result<LockingScript> {
        self.check_signer()?;
        let key = lock_key(
            &request.protocol,
            &request.key_id,
            &self.identity_key(),
            &request.counterparty,
        );
        Ok(LockingScript::pushdrop(&request.fields, key.as_ref(), request.position))
    }

    async fn unlock(&self, request: &UnlockRequest) -> Result<UnlockTemplate> {
        self.check_signer()?;
        let source = MockTransaction::decode(&request.source_tx)?;
        let (script, _) = source
            .outputs
            .get(request.outpoint.vout as usize)
            .ok_or_else(|| {
                CustodyError::SigningFailed(format!("no output {} in source", request.outpoint))
            })?;
        let (_, locked_to) = LockingScript::from_bytes(script.clone())
            .decode_pushdrop()
            .ok_or_else(|| CustodyError::SigningFailed("source output is not key-locked".to_string()))?;

        let identity = self.identity_key();
        let expected = lock_key(&request.protocol, &request.key_id, &request.counterparty, &identity);
        if locked_to != expected.to_bytes() {
            return Err(CustodyError::SigningFailed(format!(
                "{} cannot unlock {}",
                identity, request.outpoint
            )));
        }

        let mut template = expected.to_bytes().to_vec();
        template.extend_from_slice(identity.as_ref());
        Ok(UnlockTemplate(template))
    }

    async fn create_action(&self, request: ActionRequest) -> Result<SignedAction> {
        self.check_signer()?;
        let mut state = guard(&self.state);
        state.nonce += 1;
        let nonce = state.nonce;

        let funding = vec![Outpoint::new(
            Txid::of_raw(format!("funding {}", nonce).as_bytes()),
            0,
        )];
        let tx = MockTransaction {
            inputs: request
                .inputs
                .iter()
                .map(|i| (i.outpoint, i.unlock.0.clone()))
                .collect(),
            outputs: request
                .outputs
                .iter()
                .map(|o| (o.script.as_bytes().to_vec(), o.satoshis))
                .collect(),
            funding: funding.clone(),
            nonce,
        };
        let raw_tx = bincode::serialize(&tx)?;
        let txid = Txid::of_raw(&raw_tx);

        for (vout, output) in request.outputs.iter().enumerate() {
            if let Some(basket) = &output.basket {
                state.baskets.entry(basket.clone()).or_default().push(WalletOutput {
                    outpoint: Outpoint::new(txid, vout as u32),
                    satoshis: output.satoshis,
                    script: output.script.clone(),
                    custom_instructions: output.custom_instructions.clone(),
                    source_tx: raw_tx.clone(),
                });
            }
        }
        state.actions.push(request);

        Ok(SignedAction {
            txid,
            raw_tx,
            funding,
        })
    }

    async fn list_outputs(&self, basket: &str, filter: &OutputFilter) -> Result<Vec<WalletOutput>> {
        let outputs = self.basket(basket);
        Ok(outputs
            .into_iter()
            .filter(|output| match &filter.key_id {
                None => true,
                Some(key_id) => output
                    .custom_instructions
                    .as_deref()
                    .and_then(|text| serde_json::from_str::<CustomInstructions>(text).ok())
                    .map_or(false, |ci| ci.key_id == *key_id),
            })
            .collect())
    }

    async fn relinquish_output(&self, basket: &str, outpoint: &Outpoint) -> Result<()> {
        let mut state = guard(&self.state);
        if let Some(outputs) = state.baskets.get_mut(basket) {
            outputs.retain(|o| o.outpoint != *outpoint);
        }
        state.relinquished.push((basket.to_string(), *outpoint));
        Ok(())
    }
}

/// Mock implementation of the Broadcaster trait for testing purposes
///
/// Accepts everything unless told otherwise. While held, each submission
/// waits for a [`MockBroadcaster::release`] permit before answering.
pub struct MockBroadcaster {
    responses: Mutex<VecDeque<BroadcastResponse>>,
    submitted: Mutex<Vec<Txid>>,
    held: AtomicBool,
    gate: Semaphore,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl MockBroadcaster {
    pub fn new() -> Self {
        Self {
            responses: Mutex::new(VecDeque::new()),
            submitted: Mutex::new(Vec::new()),
            held: AtomicBool::new(false),
            gate: Semaphore::new(0),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        }
    }

    /// Answer the next unscripted submission with a rejection
    pub fn reject_next(&self, status: &str) {
        guard(&self.responses).push_back(BroadcastResponse {
            accepted: false,
            status: status.to_string(),
        });
    }

    pub fn hold(&self) {
        self.held.store(true, Ordering::SeqCst);
    }

    /// Let `count` held submissions complete
    pub fn release(&self, count: usize) {
        self.gate.add_permits(count);
    }

    /// Txids in submission order
    pub fn submitted(&self) -> Vec<Txid> {
        guard(&self.submitted).clone()
    }

    /// Highest number of submissions ever awaiting an answer at once
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

impl Default for MockBroadcaster {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Broadcaster for MockBroadcaster {
    async fn submit(&self, raw_tx: &[u8]) -> Result<BroadcastResponse> {
        guard(&self.submitted).push(Txid::of_raw(raw_tx));
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);

        if self.held.load(Ordering::SeqCst) {
            if let Ok(permit) = self.gate.acquire().await {
                permit.forget();
            }
        }

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        let scripted = guard(&self.responses).pop_front();
        Ok(scripted.unwrap_or(BroadcastResponse {
            accepted: true,
            status: "success".to_string(),
        }))
    }
}

/// Mock implementation of the Indexer trait for testing purposes
#[derive(Default)]
pub struct MockIndexer {
    known: Mutex<HashMap<Txid, Vec<u32>>>,
    calls: AtomicUsize,
}

impl MockIndexer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `txid` known to the network with the given outputs spent
    pub fn set_status(&self, txid: Txid, spent_outputs: Vec<u32>) {
        guard(&self.known).insert(txid, spent_outputs);
    }

    /// Number of batch queries answered
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Indexer for MockIndexer {
    async fn batch_status(&self, txids: &[Txid]) -> Result<Vec<TxStatus>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let known = guard(&self.known);
        Ok(txids
            .iter()
            .filter_map(|txid| {
                known.get(txid).map(|spent| TxStatus {
                    txid: *txid,
                    spent_outputs: spent.clone(),
                })
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interfaces::{ActionInput, ActionOutput};
    use crate::script::LockPosition;

    fn lock_request(counterparty: HolderKey) -> LockRequest {
        LockRequest {
            fields: vec![b"created".to_vec()],
            protocol: ProtocolId::default(),
            key_id: KeyId::for_record(&crate::id::RecordId::new([1u8; 32])),
            counterparty,
            position: LockPosition::After,
        }
    }

    #[tokio::test]
    async fn test_only_counterparty_can_unlock() {
        let wallet = MockWallet::new(b"issuer");
        let issuer = wallet.identity_key();
        let holder = HolderKey::derive(b"holder");
        let request = lock_request(holder);

        let script = wallet.lock(&request).await.unwrap();
        let signed = wallet
            .create_action(ActionRequest {
                description: "lock".to_string(),
                inputs: Vec::new(),
                outputs: vec![ActionOutput {
                    script,
                    satoshis: 3,
                    description: "token".to_string(),
                    basket: None,
                    custom_instructions: None,
                }],
            })
            .await
            .unwrap();

        let unlock = UnlockRequest {
            protocol: request.protocol.clone(),
            key_id: request.key_id.clone(),
            counterparty: issuer,
            outpoint: Outpoint::new(signed.txid, 0),
            source_tx: signed.raw_tx.clone(),
        };

        // The issuer itself is not the counterparty the output was locked for
        assert!(matches!(
            wallet.unlock(&unlock).await,
            Err(CustodyError::SigningFailed(_))
        ));

        wallet.act_as(b"holder");
        let template = wallet.unlock(&unlock).await.unwrap();
        assert!(!template.0.is_empty());

        let spend = wallet
            .create_action(ActionRequest {
                description: "spend".to_string(),
                inputs: vec![ActionInput {
                    outpoint: unlock.outpoint,
                    unlock: template,
                    source_tx: signed.raw_tx,
                    description: "token".to_string(),
                }],
                outputs: Vec::new(),
            })
            .await
            .unwrap();
        let decoded = MockTransaction::decode(&spend.raw_tx).unwrap();
        assert_eq!(decoded.inputs[0].0, unlock.outpoint);
    }

    #[tokio::test]
    async fn test_broadcaster_scripted_rejection() {
        let broadcaster = MockBroadcaster::new();
        broadcaster.reject_next("double spend");

        let first = broadcaster.submit(b"one").await.unwrap();
        let second = broadcaster.submit(b"two").await.unwrap();
        assert!(!first.accepted);
        assert_eq!(first.status, "double spend");
        assert!(second.accepted);
        assert_eq!(
            broadcaster.submitted(),
            vec![Txid::of_raw(b"one"), Txid::of_raw(b"two")]
        );
    }

    #[tokio::test]
    async fn test_indexer_omits_unknown_txids() {
        let indexer = MockIndexer::new();
        let known = Txid::of_raw(b"known");
        indexer.set_status(known, vec![0]);

        let statuses = indexer
            .batch_status(&[known, Txid::of_raw(b"unknown")])
            .await
            .unwrap();
        assert_eq!(statuses.len(), 1);
        assert!(statuses[0].is_output_spent(0));
        assert_eq!(indexer.calls(), 1);
    }
}
