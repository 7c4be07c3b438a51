pub mod commitment;
pub mod config;
pub mod engine;
pub mod error;
pub mod id;
pub mod interfaces;
pub mod mock;
pub mod queue;
pub mod reconcile;
pub mod script;
pub mod selector;
pub mod service;
pub mod storage;
pub mod storage_traits;
pub mod token;

// Re-export the main types for convenience
pub use commitment::{commit, verify, verify_preimage, Commitment, ContentHash, StagePayload};
pub use config::{CustodyConfig, OutputValues, ProtocolId, RelinquishPolicy, StoreBackend, StoreConfig};
pub use engine::{Relinquish, Transition, TransitionArtifact, TransitionEngine};
pub use error::{CustodyError, Result};
pub use id::{HolderKey, KeyId, Outpoint, RecordId, Txid};
pub use interfaces::{Broadcaster, Indexer, Wallet};
pub use queue::{
    ArtifactState,
    BroadcastQueue,
    FileQueueJournal,
    JournalEntry,
    MemoryQueueJournal,
    QueueEvent,
    QueueJournal,
};
pub use reconcile::{ReconciliationReport, ReconciliationScanner};
pub use selector::CustodySelector;
pub use service::CustodyService;
pub use storage::{open_store, MemoryTokenStore, TokenStore};
pub use token::{Stage, StageData, Token, STAGE_ORDER, TOKEN_OUTPUT_INDEX};

// Re-export the storage implementations
#[cfg(feature = "sqlite")]
pub use storage::SqliteTokenStore;

#[cfg(feature = "rocksdb")]
pub use storage::RocksDbTokenStore;
