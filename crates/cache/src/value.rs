//! Payload contract for cached values.

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::level::EntryMeta;
use crate::CacheError;

/// A value that can be stored in a [`CacheLevel`](crate::CacheLevel).
///
/// Values must be serializable so that persistent levels can write them to a
/// backing store. `estimated_size` feeds byte-based capacity accounting and is
/// only an estimate.
pub trait CacheValue: Clone + Serialize + DeserializeOwned + Send + 'static {
    /// Approximate memory footprint of the value in bytes.
    fn estimated_size(&self) -> usize;

    /// Called on the copy handed out by a cache hit, after the level has
    /// updated `meta`.
    fn on_hit(&mut self, _meta: &EntryMeta) {}
}

impl CacheValue for Vec<u8> {
    fn estimated_size(&self) -> usize {
        self.len()
    }
}

impl CacheValue for String {
    fn estimated_size(&self) -> usize {
        self.len()
    }
}

pub(crate) fn encode<V: Serialize>(value: &V) -> Result<Vec<u8>, CacheError> {
    Ok(serde_json::to_vec(value)?)
}

pub(crate) fn decode<V: DeserializeOwned>(bytes: &[u8]) -> Result<V, CacheError> {
    Ok(serde_json::from_slice(bytes)?)
}

/// Serde adapter storing optional byte payloads as base64 strings.
pub(crate) mod base64_bytes {
    use base64::{engine::general_purpose::STANDARD, Engine};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &Option<Vec<u8>>, serializer: S) -> Result<S::Ok, S::Error> {
        match bytes {
            Some(bytes) => serializer.serialize_some(&STANDARD.encode(bytes)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<Vec<u8>>, D::Error> {
        let encoded: Option<String> = Option::deserialize(deserializer)?;
        encoded
            .map(|text| STANDARD.decode(text).map_err(serde::de::Error::custom))
            .transpose()
    }
}
