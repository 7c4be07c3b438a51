use crate::error::{CustodyError, Result};
use crate::id::{Outpoint, RecordId};
use crate::storage_traits::TokenStore;
use crate::token::{Stage, Token};
use log::warn;
use std::sync::Arc;

/// Pick the token of `record_id` that may be spent next
///
/// Tokens whose output is being spent by a submitting artifact count as spent.
/// More than one candidate breaks the single-unspent-token invariant; the most
/// recently created one wins and the inconsistency is logged.
pub fn select_from(tokens: &[Token], record_id: &RecordId, in_flight: &[Outpoint]) -> Option<Token> {
    let candidates: Vec<&Token> = tokens
        .iter()
        .filter(|t| t.record_id == *record_id)
        .filter(|t| t.is_spendable())
        .filter(|t| !in_flight.contains(&t.token_outpoint()))
        .collect();

    if candidates.len() > 1 {
        let warning = CustodyError::ConsistencyWarning {
            record_id: *record_id,
            count: candidates.len(),
        };
        warn!("{}; selecting the most recent", warning);
    }

    candidates
        .into_iter()
        .max_by_key(|t| t.created_at)
        .cloned()
}

/// Latest stage reached by a custody chain
pub fn current_stage(tokens: &[Token], record_id: &RecordId) -> Option<Stage> {
    tokens
        .iter()
        .filter(|t| t.record_id == *record_id)
        .map(|t| t.stage)
        .max()
}

/// Store-backed custody selector
pub struct CustodySelector {
    store: Arc<dyn TokenStore>,
}

impl CustodySelector {
    pub fn new(store: Arc<dyn TokenStore>) -> Self {
        Self { store }
    }

    pub async fn select_spendable(
        &self,
        record_id: &RecordId,
        in_flight: &[Outpoint],
    ) -> Result<Option<Token>> {
        let tokens = self.store.get_by_record(record_id).await?;
        Ok(select_from(&tokens, record_id, in_flight))
    }

    pub async fn current_stage(&self, record_id: &RecordId) -> Result<Option<Stage>> {
        let tokens = self.store.get_by_record(record_id).await?;
        Ok(current_stage(&tokens, record_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryTokenStore;
    use crate::token::tests::sample_token;
    use chrono::Duration;

    #[test]
    fn test_selects_single_unspent_token() {
        let record = RecordId::new([1u8; 32]);
        let mut created = sample_token(record, Stage::Created, b"created");
        created.spent = true;
        let presented = sample_token(record, Stage::Presented, b"presented");
        let other = sample_token(RecordId::new([2u8; 32]), Stage::Created, b"other");
        let tokens = vec![created, presented.clone(), other];

        assert_eq!(select_from(&tokens, &record, &[]), Some(presented));
        assert_eq!(current_stage(&tokens, &record), Some(Stage::Presented));
        assert_eq!(select_from(&tokens, &RecordId::new([9u8; 32]), &[]), None);
        assert_eq!(current_stage(&tokens, &RecordId::new([9u8; 32])), None);
    }

    #[test]
    fn test_tie_break_prefers_most_recent() {
        let record = RecordId::new([1u8; 32]);
        let older = sample_token(record, Stage::Created, b"older");
        let mut newer = sample_token(record, Stage::Created, b"newer");
        newer.created_at = older.created_at + Duration::seconds(5);
        let tokens = vec![newer.clone(), older];

        assert_eq!(select_from(&tokens, &record, &[]), Some(newer));
    }

    #[test]
    fn test_spent_terminal_and_in_flight_are_excluded() {
        let record = RecordId::new([1u8; 32]);
        let mut dispensed = sample_token(record, Stage::Dispensed, b"dispensed");
        dispensed.spent = true;
        let acknowledged = sample_token(record, Stage::Acknowledged, b"acknowledged");
        let tokens = vec![dispensed.clone(), acknowledged];
        assert_eq!(select_from(&tokens, &record, &[]), None);
        assert_eq!(current_stage(&tokens, &record), Some(Stage::Acknowledged));

        let presented = sample_token(record, Stage::Presented, b"presented");
        let in_flight = [presented.token_outpoint()];
        assert_eq!(select_from(&[presented.clone()], &record, &in_flight), None);
        assert_eq!(select_from(&[presented.clone()], &record, &[]), Some(presented));
    }

    #[tokio::test]
    async fn test_spent_token_never_reselected() {
        let store = Arc::new(MemoryTokenStore::new());
        let selector = CustodySelector::new(store.clone());
        let record = RecordId::new([1u8; 32]);
        let token = sample_token(record, Stage::Created, b"created");
        store.put(&token).await.unwrap();

        let first = selector.select_spendable(&record, &[]).await.unwrap();
        let again = selector.select_spendable(&record, &[]).await.unwrap();
        assert_eq!(first, again);
        assert_eq!(first.map(|t| t.txid), Some(token.txid));

        store.mark_spent(&token.txid).await.unwrap();
        store.put(&token).await.unwrap();
        assert!(selector.select_spendable(&record, &[]).await.unwrap().is_none());
        assert_eq!(
            selector.current_stage(&record).await.unwrap(),
            Some(Stage::Created)
        );
    }
}
