use crate::{
    error::{CustodyError, Result},
    id::{Outpoint, Txid},
    storage_traits::TokenStore,
    token::Token,
};
use async_trait::async_trait;
use rocksdb::{ColumnFamily, IteratorMode, Options, WriteBatch, DB};
use std::{
    fmt::Debug,
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
};

// Column family holding bincode-encoded tokens keyed by txid
const CF_TOKENS: &str = "tokens";

/// RocksDB implementation of TokenStore
pub struct RocksDbTokenStore {
    db: Arc<DB>,
    db_path: PathBuf,
    // serializes read-modify-write updates
    write_lock: Mutex<()>,
}

impl RocksDbTokenStore {
    /// Creates a new RocksDB store at the specified path
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        let db_path = path.as_ref().to_path_buf();

        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);

        let db = DB::open_cf(&opts, &db_path, [CF_TOKENS])?;
        log::debug!("Opened RocksDB token store at {}", db_path.display());

        Ok(Self {
            db: Arc::new(db),
            db_path,
            write_lock: Mutex::new(()),
        })
    }

    fn tokens_cf(&self) -> Result<&ColumnFamily> {
        self.db
            .cf_handle(CF_TOKENS)
            .ok_or_else(|| CustodyError::StoreUnavailable("tokens column family missing".to_string()))
    }

    fn read(&self, txid: &Txid) -> Result<Option<Token>> {
        let cf = self.tokens_cf()?;
        match self.db.get_cf(cf, &txid[..])? {
            Some(bytes) => Ok(Some(bincode::deserialize(&bytes)?)),
            None => Ok(None),
        }
    }

    fn write(&self, token: &Token) -> Result<()> {
        let cf = self.tokens_cf()?;
        let bytes = bincode::serialize(token)?;
        self.db.put_cf(cf, &token.txid[..], bytes)?;
        Ok(())
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, ()>> {
        self.write_lock
            .lock()
            .map_err(|e| CustodyError::StoreUnavailable(format!("Failed to acquire lock: {}", e)))
    }

    /// `token` merged with its stored copy: spent and a known outpoint survive
    fn merged(&self, token: &Token) -> Result<Token> {
        let mut token = token.clone();
        if let Some(existing) = self.read(&token.txid)? {
            token.spent |= existing.spent;
            token.outpoint = token.outpoint.or(existing.outpoint);
        }
        Ok(token)
    }

    /// Apply `update` to the stored token, if any
    fn update<F: FnOnce(&mut Token)>(&self, txid: &Txid, update: F) -> Result<bool> {
        let _guard = self.lock()?;

        match self.read(txid)? {
            Some(mut token) => {
                update(&mut token);
                self.write(&token)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

#[async_trait]
impl TokenStore for RocksDbTokenStore {
    async fn put(&self, token: &Token) -> Result<()> {
        let _guard = self.lock()?;
        let token = self.merged(token)?;
        self.write(&token)
    }

    async fn get(&self, txid: &Txid) -> Result<Option<Token>> {
        self.read(txid)
    }

    async fn get_all(&self) -> Result<Vec<Token>> {
        let cf = self.tokens_cf()?;
        let mut tokens = Vec::new();
        for item in self.db.iterator_cf(cf, IteratorMode::Start) {
            let (_, value) = item?;
            tokens.push(bincode::deserialize::<Token>(&value)?);
        }
        // keys are txids, so restore creation order
        tokens.sort_by_key(|t| t.created_at);
        Ok(tokens)
    }

    async fn mark_spent(&self, txid: &Txid) -> Result<bool> {
        self.update(txid, |token| token.spent = true)
    }

    async fn set_outpoint(&self, txid: &Txid, outpoint: &Outpoint) -> Result<bool> {
        let outpoint = *outpoint;
        self.update(txid, move |token| token.outpoint = Some(outpoint))
    }

    async fn commit_transition(&self, token: &Token, predecessor: Option<&Txid>) -> Result<bool> {
        let _guard = self.lock()?;
        let cf = self.tokens_cf()?;
        let mut batch = WriteBatch::default();

        let mut found = true;
        if let Some(txid) = predecessor {
            match self.read(txid)? {
                Some(mut spent) => {
                    spent.spent = true;
                    batch.put_cf(cf, &txid[..], bincode::serialize(&spent)?);
                }
                None => found = false,
            }
        }
        let token = self.merged(token)?;
        batch.put_cf(cf, &token.txid[..], bincode::serialize(&token)?);

        self.db.write(batch)?;
        Ok(found)
    }

    async fn revert_transition(&self, token: &Txid, predecessor: Option<&Txid>) -> Result<()> {
        let _guard = self.lock()?;
        let cf = self.tokens_cf()?;
        let mut batch = WriteBatch::default();

        batch.delete_cf(cf, &token[..]);
        if let Some(txid) = predecessor {
            if let Some(mut restored) = self.read(txid)? {
                restored.spent = false;
                batch.put_cf(cf, &txid[..], bincode::serialize(&restored)?);
            }
        }

        self.db.write(batch)?;
        log::warn!("Reverted transition {}", token);
        Ok(())
    }

    async fn clear(&self) -> Result<()> {
        let cf = self.tokens_cf()?;
        let mut batch = WriteBatch::default();
        for item in self.db.iterator_cf(cf, IteratorMode::Start) {
            let (key, _) = item?;
            batch.delete_cf(cf, key);
        }
        self.db.write(batch)?;
        log::info!("Cleared token store at {}", self.db_path.display());
        Ok(())
    }
}

impl Debug for RocksDbTokenStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RocksDbTokenStore")
            .field("db_path", &self.db_path)
            .finish()
    }
}
