use crate::error::{CustodyError, Result};
use crate::id::{Outpoint, Txid};
use crate::storage_traits::TokenStore;
use crate::token::Token;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::RwLock;

#[derive(Default)]
struct Inner {
    tokens: HashMap<Txid, Token>,
    // insertion order, so get_all is oldest first
    order: Vec<Txid>,
}

/// Process-local token store
pub struct MemoryTokenStore {
    inner: RwLock<Inner>,
    available: AtomicBool,
    writable: AtomicBool,
}

impl MemoryTokenStore {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
            available: AtomicBool::new(true),
            writable: AtomicBool::new(true),
        }
    }

    /// Simulate the backing store going away; every call fails with `StoreUnavailable` while false
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Keep serving reads but fail every write with `StoreUnavailable` while false
    pub fn set_writable(&self, writable: bool) {
        self.writable.store(writable, Ordering::SeqCst);
    }

    fn check_available(&self) -> Result<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(CustodyError::StoreUnavailable("memory store offline".to_string()))
        }
    }

    fn check_writable(&self) -> Result<()> {
        self.check_available()?;
        if self.writable.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(CustodyError::StoreUnavailable("memory store is read-only".to_string()))
        }
    }
}

impl Inner {
    fn upsert(&mut self, token: &Token) {
        let mut token = token.clone();
        match self.tokens.get(&token.txid) {
            Some(existing) => {
                token.spent |= existing.spent;
                token.outpoint = token.outpoint.or(existing.outpoint);
            }
            None => self.order.push(token.txid),
        }
        self.tokens.insert(token.txid, token);
    }

    fn set_spent(&mut self, txid: &Txid, spent: bool) -> bool {
        match self.tokens.get_mut(txid) {
            Some(token) => {
                token.spent = spent;
                true
            }
            None => false,
        }
    }
}

impl Default for MemoryTokenStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TokenStore for MemoryTokenStore {
    async fn put(&self, token: &Token) -> Result<()> {
        self.check_writable()?;
        self.inner.write().await.upsert(token);
        Ok(())
    }

    async fn get(&self, txid: &Txid) -> Result<Option<Token>> {
        self.check_available()?;
        Ok(self.inner.read().await.tokens.get(txid).cloned())
    }

    async fn get_all(&self) -> Result<Vec<Token>> {
        self.check_available()?;
        let inner = self.inner.read().await;
        Ok(inner
            .order
            .iter()
            .filter_map(|txid| inner.tokens.get(txid).cloned())
            .collect())
    }

    async fn mark_spent(&self, txid: &Txid) -> Result<bool> {
        self.check_writable()?;
        Ok(self.inner.write().await.set_spent(txid, true))
    }

    async fn set_outpoint(&self, txid: &Txid, outpoint: &Outpoint) -> Result<bool> {
        self.check_writable()?;
        let mut inner = self.inner.write().await;
        match inner.tokens.get_mut(txid) {
            Some(token) => {
                token.outpoint = Some(*outpoint);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn commit_transition(&self, token: &Token, predecessor: Option<&Txid>) -> Result<bool> {
        self.check_writable()?;
        let mut inner = self.inner.write().await;
        let found = match predecessor {
            Some(txid) => inner.set_spent(txid, true),
            None => true,
        };
        inner.upsert(token);
        Ok(found)
    }

    async fn revert_transition(&self, token: &Txid, predecessor: Option<&Txid>) -> Result<()> {
        self.check_writable()?;
        let mut inner = self.inner.write().await;
        if inner.tokens.remove(token).is_some() {
            inner.order.retain(|txid| txid != token);
        }
        if let Some(txid) = predecessor {
            inner.set_spent(txid, false);
        }
        Ok(())
    }

    async fn clear(&self) -> Result<()> {
        self.check_writable()?;
        let mut inner = self.inner.write().await;
        inner.tokens.clear();
        inner.order.clear();
        Ok(())
    }
}
