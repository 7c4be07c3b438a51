use crate::id::{HolderKey, RecordId, Txid};
use crate::token::Stage;
use std::io;
use thiserror::Error;

/// Represents all possible errors that can occur while moving a record along its custody chain
#[derive(Error, Debug)]
pub enum CustodyError {
    /// The requested stage does not immediately follow the predecessor's stage
    #[error("Invalid predecessor: stage {requested} cannot follow {found:?}")]
    InvalidPredecessor {
        requested: Stage,
        found: Option<Stage>,
    },

    /// The predecessor token has already been consumed
    #[error("Token {0} is already spent")]
    AlreadySpent(Txid),

    /// The signing identity is not the holder of the token being spent
    #[error("Not authorized: token is held by {holder}, caller is {caller}")]
    NotAuthorized { holder: HolderKey, caller: HolderKey },

    /// Local signing failed; nothing was persisted
    #[error("Signing failed: {0}")]
    SigningFailed(String),

    /// The network refused the transition
    #[error("Broadcast of {txid} rejected: {status}")]
    BroadcastRejected { txid: Txid, status: String },

    /// The token store could not serve the request
    #[error("Token store unavailable: {0}")]
    StoreUnavailable(String),

    /// More than one unspent token exists for a single record
    #[error("Consistency warning: {count} unspent tokens for record {record_id}")]
    ConsistencyWarning { record_id: RecordId, count: usize },

    /// No unspent token exists for the record
    #[error("No active token for record {0}")]
    NoActiveToken(RecordId),

    /// Key material that is not a valid identity key
    #[error("Invalid key: {0}")]
    InvalidKey(String),

    /// Serialization/deserialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Errors that occur while reading or writing the broadcast journal
    #[error("Journal error: {0}")]
    Journal(String),

    /// Invalid or unreadable configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO errors that occur when reading/writing files
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Anyhow error wrapper for error context
    #[error(transparent)]
    Context(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, CustodyError>;

impl From<bincode::Error> for CustodyError {
    fn from(err: bincode::Error) -> Self {
        CustodyError::Serialization(err.to_string())
    }
}

impl From<serde_json::Error> for CustodyError {
    fn from(err: serde_json::Error) -> Self {
        CustodyError::Serialization(err.to_string())
    }
}

impl From<toml::de::Error> for CustodyError {
    fn from(err: toml::de::Error) -> Self {
        CustodyError::Config(err.to_string())
    }
}

#[cfg(feature = "rocksdb")]
impl From<rocksdb::Error> for CustodyError {
    fn from(err: rocksdb::Error) -> Self {
        CustodyError::StoreUnavailable(err.to_string())
    }
}

#[cfg(feature = "sqlite")]
impl From<sqlx::Error> for CustodyError {
    fn from(err: sqlx::Error) -> Self {
        CustodyError::StoreUnavailable(err.to_string())
    }
}

impl CustodyError {
    /// Whether the error leaves durable state untouched and the caller may try again later
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            CustodyError::BroadcastRejected { .. }
                | CustodyError::StoreUnavailable(_)
                | CustodyError::ConsistencyWarning { .. }
                | CustodyError::SigningFailed(_)
        )
    }
}
