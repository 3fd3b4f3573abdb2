//! Wire payload shapes for the verbs that carry a length-prefixed payload.
//!
//! Serialization is `bincode` over these `serde`-derived structs; the
//! `serde_json::Value` fields are the JSON-encodable map/reduce keys and
//! values described by the specification's data model. `bincode` was chosen
//! because it is the concrete serialization the teacher crate already reaches
//! for (`t51core`'s `Cargo.toml`); the spec leaves the wire format as an
//! implementation choice subject only to lossless round-tripping.

use crate::error::NetworkResult;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Reduce keys are either the bare `k_mid` (basic/persistent mode) or a
/// composite `(k_mid, slice_no, depth)` tuple (batched mode). The worker
/// echoes whichever form it is given back verbatim in `reducedone`,
/// extracting only `base_key()` to hand to `reducefn`.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub enum ReduceKey {
    Simple(Value),
    Sliced { key: Value, slice: u32, depth: u32 },
}

impl ReduceKey {
    /// The underlying `k_mid`, common to both forms.
    pub fn base_key(&self) -> &Value {
        match self {
            ReduceKey::Simple(key) => key,
            ReduceKey::Sliced { key, .. } => key,
        }
    }

    /// Canonical JSON text identity, used by task managers to key the
    /// outstanding/intermediate-store maps (mirrors the durable store's
    /// `TEXT` key column, which is `json.dumps(k_mid)` in the original
    /// implementation).
    pub fn canonical(&self) -> String {
        match self {
            ReduceKey::Simple(key) => canonical_key(key),
            ReduceKey::Sliced { key, slice, depth } => {
                format!("{}#{}#{}", canonical_key(key), slice, depth)
            }
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct MapPayload {
    pub k_in: Value,
    pub v_in: Value,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct ReducePayload {
    pub key: ReduceKey,
    pub values: Vec<Value>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct MapDonePayload {
    pub k_in: Value,
    pub groups: BTreeMap<String, Vec<Value>>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct ReduceDonePayload {
    pub key: ReduceKey,
    pub value: Value,
}

/// Canonicalizes a `k_mid` value to the JSON text used as its grouping key,
/// mirroring the `json.dumps(key)` the original implementation stores as the
/// durable store's `TEXT` column.
pub fn canonical_key(value: &Value) -> String {
    serde_json::to_string(value).expect("serde_json::Value serialization is infallible")
}

pub fn encode<T: Serialize>(value: &T) -> NetworkResult<Vec<u8>> {
    Ok(bincode::serialize(value)?)
}

pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> NetworkResult<T> {
    Ok(bincode::deserialize(bytes)?)
}
