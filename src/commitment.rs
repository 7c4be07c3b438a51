//! Commitment codec
//!
//! Binds an off-chain stage payload to the on-chain script without revealing it.
//! The payload's canonical JSON is hashed once to obtain the [`ContentHash`], which
//! can be disclosed on its own during a dispute, and hashed again to obtain the
//! [`Commitment`] that is written into the token output.

use crate::error::{CustodyError, Result};
use serde::de::{self, Deserializer};
use serde::ser::Serializer;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use std::fmt;

/// Structured data attached to one custody stage
///
/// Always a JSON object. Keys are kept in canonical (sorted) order so the
/// same logical payload always produces the same bytes.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct StagePayload(Map<String, Value>);

fn canonicalize(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let mut sorted = Map::new();
            for key in keys {
                sorted.insert(key.clone(), canonicalize(&map[key]));
            }
            Value::Object(sorted)
        }
        Value::Array(items) => Value::Array(items.iter().map(canonicalize).collect()),
        other => other.clone(),
    }
}

impl StagePayload {
    pub fn new() -> Self {
        Self(Map::new())
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.insert(key, value);
        self
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn fields(&self) -> &Map<String, Value> {
        &self.0
    }

    /// Accepts any JSON object
    pub fn from_value(value: Value) -> Result<Self> {
        match canonicalize(&value) {
            Value::Object(map) => Ok(Self(map)),
            other => Err(CustodyError::Serialization(format!(
                "stage payload must be a JSON object, got {}",
                other
            ))),
        }
    }

    pub fn from_json(text: &str) -> Result<Self> {
        Self::from_value(serde_json::from_str(text)?)
    }

    /// Canonical JSON text: sorted keys, no insignificant whitespace
    pub fn to_canonical_json(&self) -> String {
        canonicalize(&Value::Object(self.0.clone())).to_string()
    }

    pub fn canonical_bytes(&self) -> Vec<u8> {
        self.to_canonical_json().into_bytes()
    }
}

// Carried as canonical JSON text so non-self-describing codecs (bincode) can store it.
impl Serialize for StagePayload {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_canonical_json())
    }
}

impl<'de> Deserialize<'de> for StagePayload {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        StagePayload::from_json(&text).map_err(de::Error::custom)
    }
}

/// First-level hash of a payload; the disclosable pre-image of its commitment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContentHash([u8; 32]);

impl ContentHash {
    pub fn of(payload: &StagePayload) -> Self {
        ContentHash(Sha256::digest(payload.canonical_bytes()).into())
    }

    pub fn new(bytes: [u8; 32]) -> Self {
        ContentHash(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

/// Digest written on-chain: SHA-256 of the [`ContentHash`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Commitment([u8; 32]);

impl Commitment {
    pub fn new(bytes: [u8; 32]) -> Self {
        Commitment(bytes)
    }

    pub fn from_preimage(content_hash: &ContentHash) -> Self {
        Commitment(Sha256::digest(content_hash.as_bytes()).into())
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Display for Commitment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

/// Derive the commitment for a payload
pub fn commit(payload: &StagePayload) -> Commitment {
    Commitment::from_preimage(&ContentHash::of(payload))
}

/// Check that a payload hashes to the given commitment
pub fn verify(payload: &StagePayload, commitment: &Commitment) -> bool {
    commit(payload) == *commitment
}

/// Check a disclosed first-level hash against a commitment, without the payload
pub fn verify_preimage(content_hash: &ContentHash, commitment: &Commitment) -> bool {
    Commitment::from_preimage(content_hash) == *commitment
}
