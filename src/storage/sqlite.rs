use crate::{
    commitment::{Commitment, StagePayload},
    error::{CustodyError, Result},
    id::{HolderKey, Outpoint, RecordId, Txid},
    storage_traits::TokenStore,
    token::{Stage, Token},
};
use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::{
    query::Query,
    sqlite::{SqliteArguments, SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow},
    Row, Sqlite,
};
use std::{
    path::{Path, PathBuf},
    str::FromStr,
};

const TOKEN_COLUMNS: &str = "txid, record_id, stage, payload, commitment, holder, issuer, \
                             outpoint, source_artifact, spent, created_at";

// spent never goes back to 0 and a known outpoint is never forgotten
const UPSERT_TOKEN: &str = "INSERT INTO tokens (txid, record_id, stage, payload, commitment, holder, \
                            issuer, outpoint, source_artifact, spent, created_at)
     VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
     ON CONFLICT(txid) DO UPDATE SET
        record_id = excluded.record_id,
        stage = excluded.stage,
        payload = excluded.payload,
        commitment = excluded.commitment,
        holder = excluded.holder,
        issuer = excluded.issuer,
        outpoint = COALESCE(excluded.outpoint, tokens.outpoint),
        source_artifact = excluded.source_artifact,
        spent = MAX(tokens.spent, excluded.spent),
        created_at = excluded.created_at";

/// A SQLite-based implementation of the TokenStore interface using sqlx.
pub struct SqliteTokenStore {
    pool: SqlitePool,
    db_path: PathBuf,
}

fn unavailable(err: anyhow::Error) -> CustodyError {
    CustodyError::StoreUnavailable(format!("{:#}", err))
}

fn blob_32(row: &SqliteRow, column: &str) -> Result<[u8; 32]> {
    let blob: Vec<u8> = row.try_get(column)?;
    blob.try_into().map_err(|b: Vec<u8>| {
        CustodyError::Serialization(format!("column {} holds {} bytes, expected 32", column, b.len()))
    })
}

impl SqliteTokenStore {
    /// Opens (creating if needed) the database at `path`
    pub async fn open<P: AsRef<Path>>(path: P, max_connections: u32) -> Result<Self> {
        let db_path = path.as_ref().to_path_buf();
        let db_url = format!("sqlite:{}", db_path.to_string_lossy());

        let options = SqliteConnectOptions::from_str(&db_url)
            .with_context(|| format!("Invalid database URL: {}", db_url))
            .map_err(unavailable)?
            .create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await
            .with_context(|| format!("Failed to connect to database at {}", db_path.display()))
            .map_err(unavailable)?;

        Self::initialize_schema(&pool)
            .await
            .with_context(|| "Failed to initialize database schema")
            .map_err(unavailable)?;

        log::debug!("Opened token store at {}", db_path.display());
        Ok(Self { pool, db_path })
    }

    pub fn path(&self) -> &Path {
        &self.db_path
    }

    /// Creates the necessary tables in the database
    async fn initialize_schema(pool: &SqlitePool) -> std::result::Result<(), sqlx::Error> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS tokens (
                txid BLOB PRIMARY KEY,
                record_id BLOB NOT NULL,
                stage INTEGER NOT NULL,
                payload TEXT NOT NULL,
                commitment BLOB NOT NULL,
                holder BLOB NOT NULL,
                issuer BLOB NOT NULL,
                outpoint TEXT,
                source_artifact BLOB NOT NULL,
                spent INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL
            )",
        )
        .execute(pool)
        .await?;

        // Chains are looked up by record
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_tokens_record_id ON tokens(record_id)")
            .execute(pool)
            .await?;

        Ok(())
    }

    fn upsert(token: &Token) -> Query<'static, Sqlite, SqliteArguments<'static>> {
        sqlx::query(UPSERT_TOKEN)
            .bind(token.txid.to_vec())
            .bind(token.record_id.to_vec())
            .bind(token.stage.to_int())
            .bind(token.payload.to_canonical_json())
            .bind(token.commitment.as_bytes().to_vec())
            .bind(token.holder.to_bytes().to_vec())
            .bind(token.issuer.to_bytes().to_vec())
            .bind(token.outpoint.map(|o| o.to_string()))
            .bind(token.source_artifact.clone())
            .bind(token.spent as i64)
            .bind(token.created_at.to_rfc3339_opts(SecondsFormat::Nanos, true))
    }

    fn token_from_row(row: &SqliteRow) -> Result<Token> {
        let stage_int: i64 = row.try_get("stage")?;
        let stage = Stage::from_int(stage_int)
            .ok_or_else(|| CustodyError::Serialization(format!("Invalid stage value: {}", stage_int)))?;

        let payload: String = row.try_get("payload")?;
        let outpoint: Option<String> = row.try_get("outpoint")?;
        let spent: i64 = row.try_get("spent")?;
        let created_at: String = row.try_get("created_at")?;
        let created_at = DateTime::parse_from_rfc3339(&created_at)
            .map_err(|e| CustodyError::Serialization(format!("Invalid timestamp {}: {}", created_at, e)))?
            .with_timezone(&Utc);

        Ok(Token {
            txid: Txid::new(blob_32(row, "txid")?),
            record_id: RecordId::new(blob_32(row, "record_id")?),
            stage,
            payload: StagePayload::from_json(&payload)?,
            commitment: Commitment::new(blob_32(row, "commitment")?),
            holder: HolderKey::from_bytes(blob_32(row, "holder")?)?,
            issuer: HolderKey::from_bytes(blob_32(row, "issuer")?)?,
            outpoint: outpoint.map(|o| o.parse::<Outpoint>()).transpose()?,
            source_artifact: row.try_get("source_artifact")?,
            spent: spent != 0,
            created_at,
        })
    }
}

#[async_trait]
impl TokenStore for SqliteTokenStore {
    async fn put(&self, token: &Token) -> Result<()> {
        Self::upsert(token)
            .execute(&self.pool)
            .await
            .with_context(|| format!("Failed to store token {}", token.txid))
            .map_err(unavailable)?;

        Ok(())
    }

    async fn get(&self, txid: &Txid) -> Result<Option<Token>> {
        let query = format!("SELECT {} FROM tokens WHERE txid = ?", TOKEN_COLUMNS);

        let row = sqlx::query(&query)
            .bind(txid.to_vec())
            .fetch_optional(&self.pool)
            .await
            .with_context(|| format!("Failed to fetch token {}", txid))
            .map_err(unavailable)?;

        row.as_ref().map(Self::token_from_row).transpose()
    }

    async fn get_all(&self) -> Result<Vec<Token>> {
        let query = format!("SELECT {} FROM tokens ORDER BY rowid", TOKEN_COLUMNS);

        let rows = sqlx::query(&query)
            .fetch_all(&self.pool)
            .await
            .with_context(|| "Failed to fetch tokens")
            .map_err(unavailable)?;

        rows.iter().map(Self::token_from_row).collect()
    }

    async fn get_by_record(&self, record_id: &RecordId) -> Result<Vec<Token>> {
        let query = format!(
            "SELECT {} FROM tokens WHERE record_id = ? ORDER BY rowid",
            TOKEN_COLUMNS
        );

        let rows = sqlx::query(&query)
            .bind(record_id.to_vec())
            .fetch_all(&self.pool)
            .await
            .with_context(|| format!("Failed to fetch tokens of record {}", record_id))
            .map_err(unavailable)?;

        rows.iter().map(Self::token_from_row).collect()
    }

    async fn mark_spent(&self, txid: &Txid) -> Result<bool> {
        let result = sqlx::query("UPDATE tokens SET spent = 1 WHERE txid = ?")
            .bind(txid.to_vec())
            .execute(&self.pool)
            .await
            .with_context(|| format!("Failed to mark token {} spent", txid))
            .map_err(unavailable)?;

        Ok(result.rows_affected() > 0)
    }

    async fn set_outpoint(&self, txid: &Txid, outpoint: &Outpoint) -> Result<bool> {
        let result = sqlx::query("UPDATE tokens SET outpoint = ? WHERE txid = ?")
            .bind(outpoint.to_string())
            .bind(txid.to_vec())
            .execute(&self.pool)
            .await
            .with_context(|| format!("Failed to set outpoint of token {}", txid))
            .map_err(unavailable)?;

        Ok(result.rows_affected() > 0)
    }

    async fn commit_transition(&self, token: &Token, predecessor: Option<&Txid>) -> Result<bool> {
        let mut tx = self
            .pool
            .begin()
            .await
            .with_context(|| format!("Failed to begin transition {}", token.txid))
            .map_err(unavailable)?;

        let found = match predecessor {
            Some(txid) => {
                sqlx::query("UPDATE tokens SET spent = 1 WHERE txid = ?")
                    .bind(txid.to_vec())
                    .execute(&mut *tx)
                    .await
                    .with_context(|| format!("Failed to mark token {} spent", txid))
                    .map_err(unavailable)?
                    .rows_affected()
                    > 0
            }
            None => true,
        };

        Self::upsert(token)
            .execute(&mut *tx)
            .await
            .with_context(|| format!("Failed to store token {}", token.txid))
            .map_err(unavailable)?;

        // dropping the transaction on any error above rolls both writes back
        tx.commit()
            .await
            .with_context(|| format!("Failed to commit transition {}", token.txid))
            .map_err(unavailable)?;

        Ok(found)
    }

    async fn revert_transition(&self, token: &Txid, predecessor: Option<&Txid>) -> Result<()> {
        let mut tx = self
            .pool
            .begin()
            .await
            .with_context(|| format!("Failed to begin revert of {}", token))
            .map_err(unavailable)?;

        sqlx::query("DELETE FROM tokens WHERE txid = ?")
            .bind(token.to_vec())
            .execute(&mut *tx)
            .await
            .with_context(|| format!("Failed to remove token {}", token))
            .map_err(unavailable)?;

        if let Some(txid) = predecessor {
            sqlx::query("UPDATE tokens SET spent = 0 WHERE txid = ?")
                .bind(txid.to_vec())
                .execute(&mut *tx)
                .await
                .with_context(|| format!("Failed to restore token {}", txid))
                .map_err(unavailable)?;
        }

        tx.commit()
            .await
            .with_context(|| format!("Failed to commit revert of {}", token))
            .map_err(unavailable)?;

        log::warn!("Reverted transition {}", token);
        Ok(())
    }

    async fn clear(&self) -> Result<()> {
        sqlx::query("DELETE FROM tokens")
            .execute(&self.pool)
            .await
            .with_context(|| "Failed to clear tokens")
            .map_err(unavailable)?;

        log::info!("Cleared token store at {}", self.db_path.display());
        Ok(())
    }
}

impl std::fmt::Debug for SqliteTokenStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteTokenStore")
            .field("db_path", &self.db_path)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::token::tests::sample_token;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_basic_storage_operations() {
        // Create temporary directory for test database
        let temp_dir = tempdir().unwrap();
        let db_path = temp_dir.path().join("test.db");

        let store = SqliteTokenStore::open(&db_path, 5).await.unwrap();

        let record = RecordId::new([1u8; 32]);
        let token = sample_token(record, Stage::Created, b"first");

        store.put(&token).await.unwrap();
        let retrieved = store.get(&token.txid).await.unwrap().unwrap();
        assert_eq!(retrieved, token);
        assert!(retrieved.verify_commitment());

        assert!(store.get(&Txid::new([0u8; 32])).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_scan_operations() {
        let temp_dir = tempdir().unwrap();
        let store = SqliteTokenStore::open(temp_dir.path().join("scan.db"), 5)
            .await
            .unwrap();

        let record = RecordId::new([1u8; 32]);
        for i in 0..5u8 {
            let token = sample_token(record, Stage::Created, &[i]);
            store.put(&token).await.unwrap();
        }
        let other = sample_token(RecordId::new([2u8; 32]), Stage::Created, b"x");
        store.put(&other).await.unwrap();

        let all = store.get_all().await.unwrap();
        assert_eq!(all.len(), 6);
        assert_eq!(all[0].txid, Txid::of_raw(&[0u8]));
        assert_eq!(store.get_by_record(&record).await.unwrap().len(), 5);
    }

    #[tokio::test]
    async fn test_spent_and_outpoint_updates() {
        let temp_dir = tempdir().unwrap();
        let store = SqliteTokenStore::open(temp_dir.path().join("spent.db"), 5)
            .await
            .unwrap();

        let token = sample_token(RecordId::new([1u8; 32]), Stage::Presented, b"t");
        store.put(&token).await.unwrap();

        let outpoint = Outpoint::new(token.txid, 0);
        assert!(store.set_outpoint(&token.txid, &outpoint).await.unwrap());
        assert!(store.mark_spent(&token.txid).await.unwrap());
        assert!(!store.mark_spent(&Txid::new([9u8; 32])).await.unwrap());

        // Re-putting the stale copy keeps spent and outpoint
        store.put(&token).await.unwrap();
        let stored = store.get(&token.txid).await.unwrap().unwrap();
        assert!(stored.spent);
        assert_eq!(stored.outpoint, Some(outpoint));
    }

    #[tokio::test]
    async fn test_commit_and_revert_transition() {
        let temp_dir = tempdir().unwrap();
        let store = SqliteTokenStore::open(temp_dir.path().join("commit.db"), 5)
            .await
            .unwrap();

        let record = RecordId::new([1u8; 32]);
        let first = sample_token(record, Stage::Created, b"first");
        let second = sample_token(record, Stage::Presented, b"second");
        store.put(&first).await.unwrap();

        assert!(store.commit_transition(&second, Some(&first.txid)).await.unwrap());
        let chain = store.get_by_record(&record).await.unwrap();
        assert_eq!(chain.len(), 2);
        assert!(chain[0].spent);
        assert!(!chain[1].spent);

        store
            .revert_transition(&second.txid, Some(&first.txid))
            .await
            .unwrap();
        assert_eq!(store.get_all().await.unwrap(), vec![first]);

        let orphan = sample_token(RecordId::new([2u8; 32]), Stage::Presented, b"orphan");
        assert!(!store
            .commit_transition(&orphan, Some(&Txid::new([9u8; 32])))
            .await
            .unwrap());
        assert!(store.get(&orphan.txid).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_survives_reopen_and_clear() {
        let temp_dir = tempdir().unwrap();
        let db_path = temp_dir.path().join("reopen.db");
        let token = sample_token(RecordId::new([1u8; 32]), Stage::Created, b"t");

        {
            let store = SqliteTokenStore::open(&db_path, 1).await.unwrap();
            store.put(&token).await.unwrap();
            store.mark_spent(&token.txid).await.unwrap();
        }

        let store = SqliteTokenStore::open(&db_path, 1).await.unwrap();
        let stored = store.get(&token.txid).await.unwrap().unwrap();
        assert!(stored.spent);
        assert_eq!(stored.created_at, token.created_at);

        store.clear().await.unwrap();
        assert!(store.get_all().await.unwrap().is_empty());
    }
}
