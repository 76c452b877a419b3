//! Snapshot codecs.
//!
//! A snapshot is always encoded as a whole; there is no per-entry framing.
//! `Json` needs keys that serde_json can write as map keys (strings and
//! integers).

use std::collections::HashMap;
use std::hash::Hash;

use serde::de::DeserializeOwned;
use serde_derive::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("bincode: {0}")]
    Bincode(#[from] bincode::Error),

    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Codec {
    #[default]
    Bincode,
    Json,
}

impl Codec {
    pub fn encode<K, V>(&self, entries: &HashMap<K, V>) -> Result<Vec<u8>, CodecError>
    where
        K: serde::Serialize + Eq + Hash,
        V: serde::Serialize,
    {
        let bytes = match self {
            Codec::Bincode => bincode::serialize(entries)?,
            Codec::Json => serde_json::to_vec(entries)?,
        };
        Ok(bytes)
    }

    pub fn decode<K, V>(&self, bytes: &[u8]) -> Result<HashMap<K, V>, CodecError>
    where
        K: DeserializeOwned + Eq + Hash,
        V: DeserializeOwned,
    {
        let entries = match self {
            Codec::Bincode => bincode::deserialize(bytes)?,
            Codec::Json => serde_json::from_slice(bytes)?,
        };
        Ok(entries)
    }
}
