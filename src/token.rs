use crate::commitment::{self, Commitment, StagePayload};
use crate::id::{HolderKey, Outpoint, RecordId, Txid};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Index of the custody-token output inside every transition transaction
pub const TOKEN_OUTPUT_INDEX: u32 = 0;

/// Position of a record in its custody sequence
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Stage {
    /// Issued by the originating party
    Created,
    /// Presented by the holder to the next custodian
    Presented,
    /// Fulfilled by the custodian
    Dispensed,
    /// Receipt acknowledged; the chain ends here
    Acknowledged,
}

/// Stage-order table every transition is checked against
pub const STAGE_ORDER: [Stage; 4] = [
    Stage::Created,
    Stage::Presented,
    Stage::Dispensed,
    Stage::Acknowledged,
];

impl Stage {
    pub fn first() -> Stage {
        STAGE_ORDER[0]
    }

    pub fn position(self) -> usize {
        STAGE_ORDER
            .iter()
            .position(|s| *s == self)
            .unwrap_or(STAGE_ORDER.len())
    }

    pub fn next(self) -> Option<Stage> {
        STAGE_ORDER.get(self.position() + 1).copied()
    }

    pub fn previous(self) -> Option<Stage> {
        self.position().checked_sub(1).map(|i| STAGE_ORDER[i])
    }

    pub fn is_terminal(self) -> bool {
        self.next().is_none()
    }

    /// Short human-readable tag written on-chain next to the commitment
    pub fn tag(self) -> &'static str {
        match self {
            Stage::Created => "created",
            Stage::Presented => "presented",
            Stage::Dispensed => "dispensed",
            Stage::Acknowledged => "acknowledged",
        }
    }

    pub fn from_tag(tag: &str) -> Option<Stage> {
        STAGE_ORDER.iter().copied().find(|s| s.tag() == tag)
    }

    pub(crate) fn to_int(self) -> i64 {
        self.position() as i64
    }

    pub(crate) fn from_int(value: i64) -> Option<Stage> {
        usize::try_from(value).ok().and_then(|i| STAGE_ORDER.get(i).copied())
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

/// The stage a transition should produce, together with that stage's payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageData {
    pub stage: Stage,
    pub payload: StagePayload,
}

impl StageData {
    pub fn new(stage: Stage, payload: StagePayload) -> Self {
        Self { stage, payload }
    }
}

/// One custody proof: a record at one stage, held by one party
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Token {
    pub record_id: RecordId,
    pub stage: Stage,
    pub payload: StagePayload,
    pub commitment: Commitment,
    /// Identity allowed to spend this token
    pub holder: HolderKey,
    /// Identity that locked this token; the counterparty when unlocking it
    pub issuer: HolderKey,
    pub txid: Txid,
    /// Set once the network has accepted the transition
    pub outpoint: Option<Outpoint>,
    pub source_artifact: Vec<u8>,
    pub spent: bool,
    pub created_at: DateTime<Utc>,
}

impl Token {
    /// Output this token lives at, whether or not the network has seen it yet
    pub fn token_outpoint(&self) -> Outpoint {
        self.outpoint
            .unwrap_or_else(|| Outpoint::new(self.txid, TOKEN_OUTPUT_INDEX))
    }

    /// Whether the payload still hashes to the recorded commitment
    pub fn verify_commitment(&self) -> bool {
        commitment::verify(&self.payload, &self.commitment)
    }

    /// Terminal tokens are receipt markers and can never be spent
    pub fn is_spendable(&self) -> bool {
        !self.spent && !self.stage.is_terminal()
    }

    pub fn is_broadcast(&self) -> bool {
        self.outpoint.is_some()
    }
}

#[cfg(test)]
pub mod tests {
    use super::*;
    use crate::commitment::commit;

    /// Build a token for tests without going through the engine
    pub fn sample_token(record_id: RecordId, stage: Stage, seed: &[u8]) -> Token {
        let payload = StagePayload::new().with("seed", hex::encode(seed));
        Token {
            record_id,
            stage,
            commitment: commit(&payload),
            payload,
            holder: HolderKey::derive(b"holder"),
            issuer: HolderKey::derive(b"issuer"),
            txid: Txid::of_raw(seed),
            outpoint: None,
            source_artifact: seed.to_vec(),
            spent: false,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_stage_order() {
        assert_eq!(Stage::first(), Stage::Created);
        assert_eq!(Stage::Created.next(), Some(Stage::Presented));
        assert_eq!(Stage::Presented.next(), Some(Stage::Dispensed));
        assert_eq!(Stage::Dispensed.next(), Some(Stage::Acknowledged));
        assert_eq!(Stage::Acknowledged.next(), None);
        assert_eq!(Stage::Created.previous(), None);
        assert_eq!(Stage::Acknowledged.previous(), Some(Stage::Dispensed));

        assert!(Stage::Acknowledged.is_terminal());
        assert!(!Stage::Created.is_terminal());
        assert!(Stage::Created < Stage::Acknowledged);
    }

    #[test]
    fn test_stage_tags_and_ints() {
        for stage in STAGE_ORDER {
            assert_eq!(Stage::from_tag(stage.tag()), Some(stage));
            assert_eq!(Stage::from_int(stage.to_int()), Some(stage));
        }
        assert_eq!(Stage::from_tag("shipped"), None);
        assert_eq!(Stage::from_int(-1), None);
        assert_eq!(Stage::from_int(4), None);
    }

    #[test]
    fn test_token_outpoint_before_broadcast() {
        let mut token = sample_token(RecordId::new([1u8; 32]), Stage::Created, b"a");
        assert_eq!(token.token_outpoint(), Outpoint::new(token.txid, TOKEN_OUTPUT_INDEX));
        assert!(!token.is_broadcast());

        token.outpoint = Some(Outpoint::new(token.txid, TOKEN_OUTPUT_INDEX));
        assert!(token.is_broadcast());
        assert!(token.verify_commitment());
    }

    #[test]
    fn test_terminal_token_not_spendable() {
        let token = sample_token(RecordId::new([1u8; 32]), Stage::Acknowledged, b"t");
        assert!(!token.is_spendable());

        let mut token = sample_token(RecordId::new([1u8; 32]), Stage::Dispensed, b"d");
        assert!(token.is_spendable());
        token.spent = true;
        assert!(!token.is_spendable());
    }
}
