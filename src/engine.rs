use crate::commitment::{Commitment, ContentHash};
use crate::config::{CustodyConfig, RelinquishPolicy};
use crate::error::{CustodyError, Result};
use crate::id::{HolderKey, KeyId, Outpoint, RecordId, Txid};
use crate::interfaces::{
    ActionInput, ActionOutput, ActionRequest, CustomInstructions, LockRequest, OutputFilter,
    UnlockRequest, Wallet,
};
use crate::script::{LockPosition, LockingScript};
use crate::token::{Stage, StageData, Token};
use chrono::{DateTime, Utc};
use log::debug;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// A wallet output to release once its transition is accepted
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Relinquish {
    pub basket: String,
    pub outpoint: Outpoint,
}

/// A signed, not yet broadcast transition
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransitionArtifact {
    /// Id of the signed transaction
    pub txid: Txid,

    /// Raw signed transaction handed to the broadcaster
    pub raw_tx: Vec<u8>,

    /// Custody chain this transition belongs to
    pub record_id: RecordId,

    /// Stage produced by this transition
    pub stage: Stage,

    /// Token output consumed, absent for the first stage
    pub spends: Option<Outpoint>,

    /// Outputs released after acceptance
    pub relinquish: Vec<Relinquish>,

    pub signed_at: DateTime<Utc>,
}

/// Result of a successful transition: the artifact to broadcast and the token it creates
#[derive(Debug, Clone)]
pub struct Transition {
    pub artifact: TransitionArtifact,
    pub token: Token,
}

/// Builds and signs stage transitions
///
/// The engine never touches storage; persisting the returned token and
/// enqueueing the artifact is left to the caller.
pub struct TransitionEngine {
    wallet: Arc<dyn Wallet>,
    config: CustodyConfig,
}

impl TransitionEngine {
    pub fn new(wallet: Arc<dyn Wallet>, config: CustodyConfig) -> Self {
        Self { wallet, config }
    }

    /// Spend `current` (if any) into a new token at `next.stage` held by `next_holder`
    pub async fn transition(
        &self,
        current: Option<&Token>,
        next: StageData,
        next_holder: HolderKey,
    ) -> Result<Transition> {
        check_order(current, next.stage)?;

        let caller = self.wallet.identity_key();
        if let Some(token) = current {
            if token.holder != caller {
                return Err(CustodyError::NotAuthorized {
                    holder: token.holder,
                    caller,
                });
            }
        }

        let created_at = Utc::now();
        let content_hash = ContentHash::of(&next.payload);
        let commitment = Commitment::from_preimage(&content_hash);
        let record_id = match current {
            Some(token) => token.record_id,
            None => RecordId::derive(
                &caller,
                content_hash.as_bytes(),
                created_at.timestamp_nanos_opt().unwrap_or_default(),
            ),
        };
        let key_id = KeyId::for_record(&record_id);

        let mut inputs = Vec::new();
        if let Some(token) = current {
            inputs.push(self.spend_input(token, &key_id).await?);
        }

        let output = self
            .token_output(&next, &record_id, &key_id, &commitment, next_holder, caller, created_at)
            .await?;

        let signed = self
            .wallet
            .create_action(ActionRequest {
                description: format!("Custody {} for record {}", next.stage, record_id),
                inputs,
                outputs: vec![output],
            })
            .await
            .map_err(signing_error)?;

        let spends = current.map(Token::token_outpoint);
        let relinquish = self.relinquish_list(next.stage, &signed.funding, spends);

        debug!(
            "Signed {} transition {} for record {}",
            next.stage, signed.txid, record_id
        );

        let token = Token {
            record_id,
            stage: next.stage,
            payload: next.payload,
            commitment,
            holder: next_holder,
            issuer: caller,
            txid: signed.txid,
            outpoint: None,
            source_artifact: signed.raw_tx.clone(),
            spent: false,
            created_at,
        };

        let artifact = TransitionArtifact {
            txid: signed.txid,
            raw_tx: signed.raw_tx,
            record_id,
            stage: token.stage,
            spends,
            relinquish,
            signed_at: Utc::now(),
        };

        Ok(Transition { artifact, token })
    }

    async fn spend_input(&self, token: &Token, key_id: &KeyId) -> Result<ActionInput> {
        let outpoint = token.token_outpoint();
        let source_tx = self.source_for(token, key_id).await?;

        let unlock = self
            .wallet
            .unlock(&UnlockRequest {
                protocol: self.config.protocol.clone(),
                key_id: key_id.clone(),
                counterparty: token.issuer,
                outpoint,
                source_tx: source_tx.clone(),
            })
            .await
            .map_err(signing_error)?;

        Ok(ActionInput {
            outpoint,
            unlock,
            source_tx,
            description: format!("Spend {} token", token.stage),
        })
    }

    /// Raw transaction holding the token's output, from the token or the wallet's basket
    async fn source_for(&self, token: &Token, key_id: &KeyId) -> Result<Vec<u8>> {
        if !token.source_artifact.is_empty() {
            return Ok(token.source_artifact.clone());
        }

        let outpoint = token.token_outpoint();
        let filter = OutputFilter {
            key_id: Some(key_id.clone()),
        };
        let outputs = self
            .wallet
            .list_outputs(&self.config.token_basket, &filter)
            .await?;

        outputs
            .into_iter()
            .find(|o| o.outpoint == outpoint)
            .map(|o| o.source_tx)
            .filter(|tx| !tx.is_empty())
            .ok_or_else(|| {
                CustodyError::SigningFailed(format!("source transaction for {} unavailable", outpoint))
            })
    }

    #[allow(clippy::too_many_arguments)]
    async fn token_output(
        &self,
        next: &StageData,
        record_id: &RecordId,
        key_id: &KeyId,
        commitment: &Commitment,
        next_holder: HolderKey,
        caller: HolderKey,
        created_at: DateTime<Utc>,
    ) -> Result<ActionOutput> {
        let tag = next.stage.tag();

        if next.stage.is_terminal() {
            let script = LockingScript::op_return(&[
                tag.as_bytes().to_vec(),
                record_id.to_vec(),
                commitment.as_bytes().to_vec(),
            ]);
            return Ok(ActionOutput {
                script,
                satoshis: 0,
                description: format!("{} receipt", tag),
                basket: None,
                custom_instructions: None,
            });
        }

        let fields = vec![
            format!("{} {}", tag, created_at.to_rfc3339()).into_bytes(),
            commitment.as_bytes().to_vec(),
        ];
        let script = self
            .wallet
            .lock(&LockRequest {
                fields,
                protocol: self.config.protocol.clone(),
                key_id: key_id.clone(),
                counterparty: next_holder,
                position: LockPosition::After,
            })
            .await
            .map_err(signing_error)?;

        let instructions = CustomInstructions {
            protocol: self.config.protocol.clone(),
            key_id: key_id.clone(),
            counterparty: caller,
        };

        Ok(ActionOutput {
            script,
            satoshis: self.config.output_values.for_stage(next.stage),
            description: format!("{} custody token", tag),
            basket: Some(self.config.token_basket.clone()),
            custom_instructions: Some(serde_json::to_string(&instructions)?),
        })
    }

    fn relinquish_list(
        &self,
        stage: Stage,
        funding: &[Outpoint],
        spends: Option<Outpoint>,
    ) -> Vec<Relinquish> {
        let funding_outputs = funding.iter().map(|outpoint| Relinquish {
            basket: self.config.funding_basket.clone(),
            outpoint: *outpoint,
        });

        match self.config.relinquish {
            RelinquishPolicy::Never => Vec::new(),
            RelinquishPolicy::OriginOnly if stage == Stage::first() => funding_outputs.collect(),
            RelinquishPolicy::OriginOnly => Vec::new(),
            RelinquishPolicy::Always => funding_outputs
                .chain(spends.map(|outpoint| Relinquish {
                    basket: self.config.token_basket.clone(),
                    outpoint,
                }))
                .collect(),
        }
    }
}

/// The requested stage must be the first stage, or the one right after the predecessor's
fn check_order(current: Option<&Token>, requested: Stage) -> Result<()> {
    let allowed = match current {
        Some(token) if token.spent => return Err(CustodyError::AlreadySpent(token.txid)),
        Some(token) => token.stage.next(),
        None => Some(Stage::first()),
    };

    if allowed == Some(requested) {
        Ok(())
    } else {
        Err(CustodyError::InvalidPredecessor {
            requested,
            found: current.map(|t| t.stage),
        })
    }
}

// Keep authorization failures distinct; anything else from the signer is a signing failure
fn signing_error(err: CustodyError) -> CustodyError {
    match err {
        e @ (CustodyError::NotAuthorized { .. } | CustodyError::SigningFailed(_)) => e,
        other => CustodyError::SigningFailed(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commitment::{self, StagePayload};
    use crate::mock::MockWallet;

    fn engine_with(wallet: Arc<MockWallet>, policy: RelinquishPolicy) -> TransitionEngine {
        let config = CustodyConfig {
            relinquish: policy,
            ..CustodyConfig::in_memory()
        };
        TransitionEngine::new(wallet, config)
    }

    fn prescription() -> StageData {
        StageData::new(
            Stage::Created,
            StagePayload::new().with("drug", "Amoxicillin"),
        )
    }

    #[tokio::test]
    async fn test_first_stage_transition() {
        let wallet = Arc::new(MockWallet::new(b"prescriber"));
        let engine = engine_with(wallet.clone(), RelinquishPolicy::OriginOnly);
        let patient = HolderKey::derive(b"patient");

        let Transition { artifact, token } =
            engine.transition(None, prescription(), patient).await.unwrap();

        assert_eq!(token.stage, Stage::Created);
        assert_eq!(token.holder, patient);
        assert_eq!(token.issuer, wallet.identity_key());
        assert!(!token.spent);
        assert!(token.outpoint.is_none());
        assert!(token.verify_commitment());
        assert_eq!(token.txid, artifact.txid);
        assert_eq!(artifact.record_id, token.record_id);
        assert!(artifact.spends.is_none());
        assert_eq!(artifact.relinquish.len(), 1);
        assert_eq!(artifact.relinquish[0].basket, "default");

        // Only the stage tag, a timestamp and the commitment go on-chain
        let action = wallet.actions().pop().unwrap();
        assert!(action.inputs.is_empty());
        let output = &action.outputs[0];
        assert_eq!(output.satoshis, 3);
        assert_eq!(output.basket.as_deref(), Some("prescription"));
        let (fields, _key) = output.script.decode_pushdrop().unwrap();
        assert_eq!(fields.len(), 2);
        assert!(String::from_utf8_lossy(&fields[0]).starts_with("created "));
        assert_eq!(fields[1], token.commitment.as_bytes().to_vec());
        assert!(!String::from_utf8_lossy(output.script.as_bytes()).contains("Amoxicillin"));

        let instructions: CustomInstructions =
            serde_json::from_str(output.custom_instructions.as_ref().unwrap()).unwrap();
        assert_eq!(instructions.key_id, KeyId::for_record(&token.record_id));
        assert_eq!(instructions.counterparty, wallet.identity_key());
    }

    #[tokio::test]
    async fn test_advance_spends_predecessor() {
        let wallet = Arc::new(MockWallet::new(b"prescriber"));
        let engine = engine_with(wallet.clone(), RelinquishPolicy::Always);
        let patient = HolderKey::derive(b"patient");
        let pharmacy = HolderKey::derive(b"pharmacy");

        let first = engine.transition(None, prescription(), patient).await.unwrap();

        wallet.act_as(b"patient");
        let next = StageData::new(Stage::Presented, StagePayload::new().with("pharmacy", "X"));
        let second = engine
            .transition(Some(&first.token), next, pharmacy)
            .await
            .unwrap();

        assert_eq!(second.token.record_id, first.token.record_id);
        assert_eq!(second.token.stage, Stage::Presented);
        assert_eq!(second.token.issuer, patient);
        assert_eq!(second.artifact.spends, Some(first.token.token_outpoint()));

        let action = wallet.actions().pop().unwrap();
        assert_eq!(action.inputs.len(), 1);
        assert_eq!(action.inputs[0].outpoint, first.token.token_outpoint());
        assert_eq!(action.outputs[0].satoshis, 2);

        // funding output plus the spent token output
        assert_eq!(second.artifact.relinquish.len(), 2);
        assert_eq!(second.artifact.relinquish[1].basket, "prescription");
        assert_eq!(
            second.artifact.relinquish[1].outpoint,
            first.token.token_outpoint()
        );
    }

    #[tokio::test]
    async fn test_stage_order_is_enforced() {
        let wallet = Arc::new(MockWallet::new(b"prescriber"));
        let engine = engine_with(wallet.clone(), RelinquishPolicy::Never);
        let patient = HolderKey::derive(b"patient");

        // No predecessor but not the first stage
        let skip = StageData::new(Stage::Presented, StagePayload::new());
        let err = engine.transition(None, skip, patient).await.unwrap_err();
        assert!(matches!(
            err,
            CustodyError::InvalidPredecessor {
                requested: Stage::Presented,
                found: None
            }
        ));

        let first = engine.transition(None, prescription(), patient).await.unwrap();
        wallet.act_as(b"patient");

        // Created -> Dispensed skips a stage
        let skip = StageData::new(Stage::Dispensed, StagePayload::new());
        let err = engine
            .transition(Some(&first.token), skip, patient)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            CustodyError::InvalidPredecessor {
                requested: Stage::Dispensed,
                found: Some(Stage::Created)
            }
        ));

        // Restarting the chain on top of an existing token
        let err = engine
            .transition(Some(&first.token), prescription(), patient)
            .await
            .unwrap_err();
        assert!(matches!(err, CustodyError::InvalidPredecessor { .. }));
    }

    #[tokio::test]
    async fn test_spent_and_unauthorized_predecessors() {
        let wallet = Arc::new(MockWallet::new(b"prescriber"));
        let engine = engine_with(wallet.clone(), RelinquishPolicy::Never);
        let patient = HolderKey::derive(b"patient");
        let next = || StageData::new(Stage::Presented, StagePayload::new());

        let mut first = engine.transition(None, prescription(), patient).await.unwrap();

        // The prescriber is not the holder
        let err = engine
            .transition(Some(&first.token), next(), patient)
            .await
            .unwrap_err();
        assert!(matches!(err, CustodyError::NotAuthorized { holder, .. } if holder == patient));

        first.token.spent = true;
        wallet.act_as(b"patient");
        let err = engine
            .transition(Some(&first.token), next(), patient)
            .await
            .unwrap_err();
        assert!(matches!(err, CustodyError::AlreadySpent(txid) if txid == first.token.txid));
    }

    #[tokio::test]
    async fn test_terminal_transition_is_unspendable_marker() {
        let wallet = Arc::new(MockWallet::new(b"prescriber"));
        let engine = engine_with(wallet.clone(), RelinquishPolicy::Never);
        let empty = || StagePayload::new();

        let created = engine
            .transition(None, prescription(), HolderKey::derive(b"patient"))
            .await
            .unwrap();
        wallet.act_as(b"patient");
        let presented = engine
            .transition(
                Some(&created.token),
                StageData::new(Stage::Presented, empty()),
                HolderKey::derive(b"pharmacy"),
            )
            .await
            .unwrap();
        wallet.act_as(b"pharmacy");
        let mut dispensed = engine
            .transition(
                Some(&presented.token),
                StageData::new(Stage::Dispensed, empty()),
                HolderKey::derive(b"pharmacy"),
            )
            .await
            .unwrap()
            .token;
        assert_eq!(wallet.actions().last().unwrap().outputs[0].satoshis, 1);

        // Source transaction comes from the wallet basket when not kept locally
        let raw_dispensed = std::mem::take(&mut dispensed.source_artifact);

        let receipt = StageData::new(Stage::Acknowledged, StagePayload::new().with("ok", true));
        let transition = engine
            .transition(Some(&dispensed), receipt, HolderKey::derive(b"patient"))
            .await
            .unwrap();
        assert_eq!(transition.token.stage, Stage::Acknowledged);
        assert!(!transition.token.is_spendable());

        let action = wallet.actions().pop().unwrap();
        assert_eq!(action.inputs[0].source_tx, raw_dispensed);
        let output = &action.outputs[0];
        assert_eq!(output.satoshis, 0);
        assert!(output.basket.is_none());
        assert!(output.script.is_unspendable());
        let fields = output.script.data_fields().unwrap();
        assert_eq!(fields[0], b"acknowledged".to_vec());
        assert_eq!(fields[1], dispensed.record_id.to_vec());
        assert_eq!(
            fields[2],
            commitment::commit(&transition.token.payload).as_bytes().to_vec()
        );
    }

    #[tokio::test]
    async fn test_missing_source_transaction() {
        let wallet = Arc::new(MockWallet::new(b"patient"));
        let engine = engine_with(wallet.clone(), RelinquishPolicy::Never);
        let mut token =
            crate::token::tests::sample_token(RecordId::new([3u8; 32]), Stage::Created, b"c");
        token.holder = wallet.identity_key();
        token.source_artifact.clear();

        let next = StageData::new(Stage::Presented, StagePayload::new());
        let err = engine
            .transition(Some(&token), next, HolderKey::derive(b"pharmacy"))
            .await
            .unwrap_err();
        assert!(matches!(err, CustodyError::SigningFailed(_)));
    }

    #[tokio::test]
    async fn test_signing_failure() {
        let wallet = Arc::new(MockWallet::new(b"prescriber"));
        let engine = engine_with(wallet.clone(), RelinquishPolicy::Never);
        wallet.fail_signing(true);

        let err = engine
            .transition(None, prescription(), HolderKey::derive(b"patient"))
            .await
            .unwrap_err();
        assert!(matches!(err, CustodyError::SigningFailed(_)));
        assert!(wallet.actions().is_empty());
    }

    #[test]
    fn test_check_order_on_terminal_token() {
        let token = crate::token::tests::sample_token(
            RecordId::new([1u8; 32]),
            Stage::Acknowledged,
            b"done",
        );
        for stage in crate::token::STAGE_ORDER {
            assert!(check_order(Some(&token), stage).is_err());
        }
    }
}
