use crate::error::Result;
use crate::id::{Outpoint, RecordId, Txid};
use crate::token::Token;
use async_trait::async_trait;

/// Durable storage of custody tokens, keyed by transaction id
///
/// Tokens are historical records: they are never deleted except by `clear`,
/// and the `spent` flag only ever moves from false to true.
#[async_trait]
pub trait TokenStore: Send + Sync {
    /// Store a token
    ///
    /// # Parameters
    /// * `token` - The token to store; replaces any token with the same txid
    ///   except that an existing `spent = true` is preserved
    async fn put(&self, token: &Token) -> Result<()>;

    /// Get a token by the txid of the transition that created it
    async fn get(&self, txid: &Txid) -> Result<Option<Token>>;

    /// All tokens, oldest first
    async fn get_all(&self) -> Result<Vec<Token>>;

    /// Tokens of one custody chain, oldest first
    async fn get_by_record(&self, record_id: &RecordId) -> Result<Vec<Token>> {
        // Default implementation filters the full scan
        Ok(self
            .get_all()
            .await?
            .into_iter()
            .filter(|t| t.record_id == *record_id)
            .collect())
    }

    /// Mark a token spent
    ///
    /// # Returns
    /// `true` if a token with this txid exists
    async fn mark_spent(&self, txid: &Txid) -> Result<bool>;

    /// Record the outpoint once the network has accepted the token
    ///
    /// # Returns
    /// `true` if a token with this txid exists
    async fn set_outpoint(&self, txid: &Txid, outpoint: &Outpoint) -> Result<bool>;

    /// Store a new token and mark its predecessor spent as one atomic write
    ///
    /// Either both changes become durable or neither does.
    ///
    /// # Returns
    /// `false` if `predecessor` names no stored token; the new token is stored regardless
    async fn commit_transition(&self, token: &Token, predecessor: Option<&Txid>) -> Result<bool>;

    /// Undo a `commit_transition` whose artifact never reached the broadcast queue
    ///
    /// Removes the token and clears the predecessor's `spent` flag atomically.
    /// This is the only path on which `spent` goes back to false.
    async fn revert_transition(&self, token: &Txid, predecessor: Option<&Txid>) -> Result<()>;

    /// Remove every token; only for an explicit out-of-band reset
    async fn clear(&self) -> Result<()>;
}
