use std::collections::HashMap;

use parking_lot::RwLock;
use serde::Deserialize;

use crate::error::ConfigError;

/// Fully qualifies one collection inside a bucket.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CollectionIdentifier {
    bucket: String,
    scope: Option<String>,
    collection: Option<String>,
}

impl CollectionIdentifier {
    pub fn new(
        bucket: impl Into<String>,
        scope: Option<String>,
        collection: Option<String>,
    ) -> Self {
        Self {
            bucket: bucket.into(),
            scope,
            collection,
        }
    }

    #[inline]
    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    #[inline]
    pub fn scope(&self) -> Option<&str> {
        self.scope.as_deref()
    }

    #[inline]
    pub fn collection(&self) -> Option<&str> {
        self.collection.as_deref()
    }
}

/// A threadsafe cache of collection identifiers to their wire encoded ids.
///
/// The stored value is the unsigned LEB128 encoding of the collection id,
/// ready to be spliced into key-value request keys.
#[derive(Debug, Default)]
pub struct CollectionMap {
    inner: RwLock<HashMap<CollectionIdentifier, Vec<u8>>>,
}

impl CollectionMap {
    /// Fetches the encoded id for the given identifier, if known.
    pub fn get(&self, identifier: &CollectionIdentifier) -> Option<Vec<u8>> {
        self.inner.read().get(identifier).cloned()
    }

    pub fn put(&self, identifier: CollectionIdentifier, encoded_id: Vec<u8>) {
        self.inner.write().insert(identifier, encoded_id);
    }

    /// True if at least one entry for the bucket is cached.
    pub fn has_bucket_map(&self, bucket: &str) -> bool {
        self.inner
            .read()
            .keys()
            .any(|identifier| identifier.bucket() == bucket)
    }

    /// Replaces every cached entry of the bucket with a fresh set.
    pub fn replace_bucket(
        &self,
        bucket: &str,
        entries: Vec<(CollectionIdentifier, Vec<u8>)>,
    ) {
        let mut guard = self.inner.write();
        guard.retain(|identifier, _| identifier.bucket() != bucket);
        guard.extend(entries);
    }
}

/// The decoded collections manifest of one bucket.
#[derive(Debug, Clone, Deserialize)]
pub struct CollectionsManifest {
    #[serde(default)]
    pub uid: String,
    #[serde(default)]
    pub scopes: Vec<ManifestScope>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ManifestScope {
    pub name: String,
    #[serde(default)]
    pub uid: String,
    #[serde(default)]
    pub collections: Vec<ManifestCollection>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ManifestCollection {
    pub name: String,
    pub uid: String,
}

pub fn parse_collections_manifest(raw: &str) -> Result<CollectionsManifest, ConfigError> {
    serde_json::from_str(raw).map_err(ConfigError::InvalidJson)
}

/// Encodes a value as unsigned LEB128, the format collection ids travel in
/// on the key-value wire protocol.
pub fn encode_unsigned_leb128(mut value: u64) -> Vec<u8> {
    let mut encoded = Vec::with_capacity(4);
    loop {
        let mut byte = (value & 0x7f) as u8;
        value >>= 7;
        if value != 0 {
            byte |= 0x80;
        }
        encoded.push(byte);
        if value == 0 {
            return encoded;
        }
    }
}

/// Decodes an unsigned LEB128 value, returning the value and the number of
/// bytes consumed.
pub fn decode_unsigned_leb128(input: &[u8]) -> Option<(u64, usize)> {
    let mut value = 0u64;
    let mut shift = 0u32;
    for (consumed, byte) in input.iter().enumerate() {
        if shift >= 64 {
            return None;
        }
        value |= u64::from(byte & 0x7f) << shift;
        if byte & 0x80 == 0 {
            return Some((value, consumed + 1));
        }
        shift += 7;
    }
    None
}
