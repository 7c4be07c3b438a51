use crate::error::{CustodyError, Result};
use curve25519_dalek::edwards::{CompressedEdwardsY, EdwardsPoint};
use curve25519_dalek::scalar::Scalar;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::ops::Deref;
use std::str::FromStr;

fn decode_32(s: &str) -> Result<[u8; 32]> {
    let bytes = hex::decode(s).map_err(|e| CustodyError::Serialization(e.to_string()))?;
    bytes
        .try_into()
        .map_err(|b: Vec<u8>| CustodyError::Serialization(format!("expected 32 bytes, got {}", b.len())))
}

// RecordId is shared by every token of one custody chain and never changes across stages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RecordId([u8; 32]);

impl Deref for RecordId {
    type Target = [u8; 32];

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl RecordId {
    pub fn new(bytes: [u8; 32]) -> Self {
        RecordId(bytes)
    }

    /// Derive the identifier of a new custody chain from its creator and first payload
    pub fn derive(creator: &HolderKey, content: &[u8], created_at_nanos: i64) -> Self {
        let mut hasher = Sha256::new();

        // Domain separator
        hasher.update(b"CUSTODY_Record");
        hasher.update(creator.as_ref());
        hasher.update(content);
        hasher.update(created_at_nanos.to_le_bytes());

        RecordId(hasher.finalize().into())
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl FromStr for RecordId {
    type Err = CustodyError;

    fn from_str(s: &str) -> Result<Self> {
        decode_32(s).map(RecordId)
    }
}

/// Transaction id of a signed transition, also the key tokens are stored under
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Txid([u8; 32]);

impl Deref for Txid {
    type Target = [u8; 32];

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl Txid {
    pub fn new(bytes: [u8; 32]) -> Self {
        Txid(bytes)
    }

    /// Double SHA-256 of raw transaction bytes
    pub fn of_raw(raw_tx: &[u8]) -> Self {
        let first = Sha256::digest(raw_tx);
        Txid(Sha256::digest(first).into())
    }
}

impl fmt::Display for Txid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl FromStr for Txid {
    type Err = CustodyError;

    fn from_str(s: &str) -> Result<Self> {
        decode_32(s).map(Txid)
    }
}

/// Reference to one output of a transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Outpoint {
    pub txid: Txid,
    pub vout: u32,
}

impl Outpoint {
    pub fn new(txid: Txid, vout: u32) -> Self {
        Self { txid, vout }
    }
}

impl fmt::Display for Outpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.txid, self.vout)
    }
}

impl FromStr for Outpoint {
    type Err = CustodyError;

    fn from_str(s: &str) -> Result<Self> {
        let (txid, vout) = s
            .split_once('.')
            .ok_or_else(|| CustodyError::Serialization(format!("malformed outpoint: {}", s)))?;
        let vout = vout
            .parse::<u32>()
            .map_err(|e| CustodyError::Serialization(format!("malformed outpoint index: {}", e)))?;
        Ok(Outpoint::new(txid.parse()?, vout))
    }
}

// HolderKey is a party's identity: a compressed ed25519 point.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct HolderKey([u8; 32]);

impl AsRef<[u8]> for HolderKey {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl HolderKey {
    /// Accepts the bytes only if they decompress to a point on the curve
    pub fn from_bytes(bytes: [u8; 32]) -> Result<Self> {
        if !Self::is_on_curve(&bytes) {
            return Err(CustodyError::InvalidKey(format!(
                "{} is not a valid identity key",
                hex::encode(bytes)
            )));
        }
        Ok(HolderKey(bytes))
    }

    pub fn is_on_curve(bytes: &[u8; 32]) -> bool {
        let Ok(compressed_edwards_y) = CompressedEdwardsY::from_slice(bytes.as_ref()) else {
            return false;
        };
        compressed_edwards_y.decompress().is_some()
    }

    /// Deterministic identity derived from a seed
    pub fn derive(seed: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(b"CUSTODY_Identity");
        hasher.update(seed);
        let scalar = Scalar::from_bytes_mod_order(hasher.finalize().into());
        HolderKey(EdwardsPoint::mul_base(&scalar).compress().to_bytes())
    }

    pub fn to_bytes(&self) -> [u8; 32] {
        self.0
    }
}

impl fmt::Display for HolderKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl FromStr for HolderKey {
    type Err = CustodyError;

    fn from_str(s: &str) -> Result<Self> {
        HolderKey::from_bytes(decode_32(s).map_err(|e| CustodyError::InvalidKey(e.to_string()))?)
    }
}

/// Per-record key identifier handed to the wallet when locking and unlocking
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct KeyId(String);

impl KeyId {
    pub fn for_record(record_id: &RecordId) -> Self {
        KeyId(record_id.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for KeyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
