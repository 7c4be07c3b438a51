use crate::error::Result;
use crate::id::{Outpoint, RecordId, Txid};
use crate::interfaces::{Indexer, TxStatus};
use crate::storage_traits::TokenStore;
use crate::token::{Stage, Token};
use log::{debug, info};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

/// Active-stage view rebuilt from the store and the network
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconciliationReport {
    /// Unspent tokens per stage, terminal receipts included
    pub active: BTreeMap<Stage, Vec<Token>>,

    /// Tokens the network reports spent that were unspent locally
    pub corrected: Vec<Txid>,

    /// Tokens whose transition the network does not know
    pub unbroadcast: Vec<Txid>,

    /// Tokens whose outpoint was filled in from the network
    pub confirmed: Vec<Txid>,
}

impl ReconciliationReport {
    /// Stage of the active token for `record_id`, if any
    pub fn stage_of(&self, record_id: &RecordId) -> Option<Stage> {
        self.active
            .iter()
            .rev()
            .find(|(_, tokens)| tokens.iter().any(|t| t.record_id == *record_id))
            .map(|(stage, _)| *stage)
    }

    pub fn active_count(&self) -> usize {
        self.active.values().map(Vec::len).sum()
    }
}

/// Startup pass reconciling local spent flags with the indexer
pub struct ReconciliationScanner {
    store: Arc<dyn TokenStore>,
    indexer: Arc<dyn Indexer>,
}

impl ReconciliationScanner {
    pub fn new(store: Arc<dyn TokenStore>, indexer: Arc<dyn Indexer>) -> Self {
        Self { store, indexer }
    }

    /// Query every unspent token in one indexer round trip and correct the store
    pub async fn scan(&self) -> Result<ReconciliationReport> {
        // spent is final, so spent tokens are never queried
        let unspent: Vec<Token> = self
            .store
            .get_all()
            .await?
            .into_iter()
            .filter(|t| !t.spent)
            .collect();

        let mut report = ReconciliationReport::default();
        if unspent.is_empty() {
            return Ok(report);
        }

        let txids: Vec<Txid> = unspent.iter().map(|t| t.txid).collect();
        let statuses: HashMap<Txid, TxStatus> = self
            .indexer
            .batch_status(&txids)
            .await?
            .into_iter()
            .map(|status| (status.txid, status))
            .collect();

        for mut token in unspent {
            let Some(status) = statuses.get(&token.txid) else {
                debug!("Transition {} unknown to the indexer", token.txid);
                report.unbroadcast.push(token.txid);
                report.active.entry(token.stage).or_default().push(token);
                continue;
            };

            let outpoint = token.token_outpoint();
            if status.is_output_spent(outpoint.vout) {
                self.store.mark_spent(&token.txid).await?;
                report.corrected.push(token.txid);
                continue;
            }

            if token.outpoint.is_none() {
                let confirmed = Outpoint::new(token.txid, outpoint.vout);
                self.store.set_outpoint(&token.txid, &confirmed).await?;
                token.outpoint = Some(confirmed);
                report.confirmed.push(token.txid);
            }
            report.active.entry(token.stage).or_default().push(token);
        }

        info!(
            "Reconciled {} tokens: {} active, {} corrected, {} unbroadcast",
            txids.len(),
            report.active_count(),
            report.corrected.len(),
            report.unbroadcast.len()
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockIndexer;
    use crate::storage::MemoryTokenStore;
    use crate::token::tests::sample_token;

    #[tokio::test]
    async fn test_scan_partitions_and_corrects() {
        let store = Arc::new(MemoryTokenStore::new());
        let indexer = Arc::new(MockIndexer::new());
        let scanner = ReconciliationScanner::new(store.clone(), indexer.clone());

        let record = RecordId::new([1u8; 32]);
        let mut created = sample_token(record, Stage::Created, b"created");
        created.spent = true;
        let presented = sample_token(record, Stage::Presented, b"presented");
        let other = sample_token(RecordId::new([2u8; 32]), Stage::Created, b"other");
        let fresh = sample_token(RecordId::new([3u8; 32]), Stage::Created, b"fresh");
        for token in [&created, &presented, &other, &fresh] {
            store.put(token).await.unwrap();
        }

        // presented was spent elsewhere, other is live, fresh never reached the network
        indexer.set_status(presented.txid, vec![0]);
        indexer.set_status(other.txid, vec![]);

        let report = scanner.scan().await.unwrap();
        assert_eq!(indexer.calls(), 1);
        assert_eq!(report.corrected, vec![presented.txid]);
        assert_eq!(report.confirmed, vec![other.txid]);
        assert_eq!(report.unbroadcast, vec![fresh.txid]);
        assert_eq!(report.active[&Stage::Created].len(), 2);
        assert!(report.active.get(&Stage::Presented).is_none());
        assert_eq!(report.stage_of(&record), None);
        assert_eq!(report.stage_of(&other.record_id), Some(Stage::Created));

        assert!(store.get(&presented.txid).await.unwrap().unwrap().spent);
        assert_eq!(
            store.get(&other.txid).await.unwrap().unwrap().outpoint,
            Some(Outpoint::new(other.txid, 0))
        );

        // a second pass skips the corrected token
        let again = scanner.scan().await.unwrap();
        assert!(again.corrected.is_empty());
        assert!(again.confirmed.is_empty());
        assert_eq!(again.active_count(), 2);
        assert_eq!(indexer.calls(), 2);
    }

    #[tokio::test]
    async fn test_empty_store_skips_indexer() {
        let store = Arc::new(MemoryTokenStore::new());
        let indexer = Arc::new(MockIndexer::new());
        let scanner = ReconciliationScanner::new(store, indexer.clone());

        let report = scanner.scan().await.unwrap();
        assert_eq!(report, ReconciliationReport::default());
        assert_eq!(indexer.calls(), 0);
    }
}
