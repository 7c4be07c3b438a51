//! Narrow contracts for the collaborators the custody engine consumes:
//! the signing wallet, the network broadcaster and the spend-status indexer.

use crate::config::ProtocolId;
use crate::error::Result;
use crate::id::{HolderKey, KeyId, Outpoint, Txid};
use crate::script::{LockPosition, LockingScript, UnlockTemplate};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Parameters for a key-locked output carrying data fields
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockRequest {
    pub fields: Vec<Vec<u8>>,
    pub protocol: ProtocolId,
    pub key_id: KeyId,
    /// Party the derived key is shared with; the only identity able to unlock
    pub counterparty: HolderKey,
    pub position: LockPosition,
}

/// Parameters for unlocking an output previously locked with a [`LockRequest`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnlockRequest {
    pub protocol: ProtocolId,
    pub key_id: KeyId,
    /// Identity that created the lock
    pub counterparty: HolderKey,
    pub outpoint: Outpoint,
    pub source_tx: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActionInput {
    pub outpoint: Outpoint,
    pub unlock: UnlockTemplate,
    pub source_tx: Vec<u8>,
    pub description: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActionOutput {
    pub script: LockingScript,
    pub satoshis: u64,
    pub description: String,
    pub basket: Option<String>,
    pub custom_instructions: Option<String>,
}

/// A transaction for the wallet to fund and sign, outputs kept in order
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActionRequest {
    pub description: String,
    pub inputs: Vec<ActionInput>,
    pub outputs: Vec<ActionOutput>,
}

/// A fully signed transaction, not yet broadcast
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedAction {
    pub txid: Txid,
    pub raw_tx: Vec<u8>,
    /// Wallet outputs consumed to fund the transaction
    pub funding: Vec<Outpoint>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OutputFilter {
    /// Match outputs whose custom instructions name this key id
    pub key_id: Option<KeyId>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WalletOutput {
    pub outpoint: Outpoint,
    pub satoshis: u64,
    pub script: LockingScript,
    pub custom_instructions: Option<String>,
    pub source_tx: Vec<u8>,
}

/// Instructions stored with each token output so its wallet can find and unlock it again
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CustomInstructions {
    pub protocol: ProtocolId,
    pub key_id: KeyId,
    pub counterparty: HolderKey,
}

/// Signing wallet of the local party
#[async_trait]
pub trait Wallet: Send + Sync {
    /// Identity this wallet signs as
    fn identity_key(&self) -> HolderKey;

    async fn lock(&self, request: &LockRequest) -> Result<LockingScript>;

    async fn unlock(&self, request: &UnlockRequest) -> Result<UnlockTemplate>;

    /// Fund and sign the transaction; nothing is broadcast
    async fn create_action(&self, request: ActionRequest) -> Result<SignedAction>;

    async fn list_outputs(&self, basket: &str, filter: &OutputFilter) -> Result<Vec<WalletOutput>>;

    async fn relinquish_output(&self, basket: &str, outpoint: &Outpoint) -> Result<()>;
}

/// Network reply to a submission
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BroadcastResponse {
    pub accepted: bool,
    pub status: String,
}

#[async_trait]
pub trait Broadcaster: Send + Sync {
    async fn submit(&self, raw_tx: &[u8]) -> Result<BroadcastResponse>;
}

/// Spend status of one transaction's outputs
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxStatus {
    pub txid: Txid,
    pub spent_outputs: Vec<u32>,
}

impl TxStatus {
    pub fn is_output_spent(&self, vout: u32) -> bool {
        self.spent_outputs.contains(&vout)
    }
}

#[async_trait]
pub trait Indexer: Send + Sync {
    /// Status of every known txid in one round trip; unknown txids are omitted
    async fn batch_status(&self, txids: &[Txid]) -> Result<Vec<TxStatus>>;
}
