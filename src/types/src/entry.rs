// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Cache entries, their metadata, and the key/value trait bounds.

use std::fmt;
use std::hash::Hash;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::version::ClusteredVersion;

/// Types usable as cache keys.
///
/// This is a blanket alias: anything clonable, orderable, hashable,
/// printable and serializable qualifies. Commands and containers are generic
/// over it.
pub trait CacheKey:
    Clone + Eq + Ord + Hash + fmt::Debug + Send + Sync + Serialize + DeserializeOwned + 'static
{
}

impl<T> CacheKey for T where
    T: Clone + Eq + Ord + Hash + fmt::Debug + Send + Sync + Serialize + DeserializeOwned + 'static
{
}

/// Types usable as cache values.
///
/// Equality is required because conditional writes compare values.
pub trait CacheValue:
    Clone + Eq + fmt::Debug + Send + Sync + Serialize + DeserializeOwned + 'static
{
}

impl<T> CacheValue for T where
    T: Clone + Eq + fmt::Debug + Send + Sync + Serialize + DeserializeOwned + 'static
{
}

/// Expiry and versioning metadata attached to a cache entry.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Metadata {
    /// Maximum lifetime of the entry; `None` means immortal.
    pub lifespan: Option<Duration>,
    /// Maximum time between touches; `None` means never idles out.
    pub max_idle: Option<Duration>,
    /// The clustered version stamped by the last write, when the cache is
    /// configured for versioned replication.
    pub version: Option<ClusteredVersion>,
}

impl Metadata {
    /// Metadata for an entry that never expires and carries no version.
    pub const IMMORTAL: Metadata = Metadata {
        lifespan: None,
        max_idle: None,
        version: None,
    };

    /// Whether the entry can never expire.
    pub fn is_immortal(&self) -> bool {
        self.lifespan.is_none() && self.max_idle.is_none()
    }

    /// Returns this metadata stamped with `version`.
    pub fn with_version(mut self, version: ClusteredVersion) -> Metadata {
        self.version = Some(version);
        self
    }
}

/// One slot of the cache: an optional value plus its metadata.
///
/// An entry with no value represents "key absent"; write commands and
/// functional views mutate entries in place and the surrounding container
/// decides what to do with emptied ones.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry<V> {
    value: Option<V>,
    metadata: Metadata,
}

impl<V> CacheEntry<V> {
    /// An entry for an absent key.
    pub fn absent() -> CacheEntry<V> {
        CacheEntry {
            value: None,
            metadata: Metadata::IMMORTAL,
        }
    }

    /// An entry holding `value` with default metadata.
    pub fn with_value(value: V) -> CacheEntry<V> {
        CacheEntry {
            value: Some(value),
            metadata: Metadata::IMMORTAL,
        }
    }

    /// An entry holding `value` (possibly absent) and `metadata`.
    pub fn new(value: Option<V>, metadata: Metadata) -> CacheEntry<V> {
        CacheEntry { value, metadata }
    }

    /// The present value, if any.
    pub fn value(&self) -> Option<&V> {
        self.value.as_ref()
    }

    /// The entry's metadata.
    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    /// Whether a value is present.
    pub fn is_present(&self) -> bool {
        self.value.is_some()
    }

    /// Stores `value` with `metadata`, returning the previous value.
    pub fn store(&mut self, value: V, metadata: Metadata) -> Option<V> {
        self.metadata = metadata;
        self.value.replace(value)
    }

    /// Removes the value, returning it. Metadata is reset: a removed entry
    /// carries no expiry and no version.
    pub fn remove(&mut self) -> Option<V> {
        self.metadata = Metadata::IMMORTAL;
        self.value.take()
    }

    /// Consumes the entry, yielding the value.
    pub fn into_value(self) -> Option<V> {
        self.value
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::topology::TopologyId;

    #[test]
    fn entry_lifecycle() {
        let mut entry: CacheEntry<String> = CacheEntry::absent();
        assert!(!entry.is_present());
        assert_eq!(entry.value(), None);

        let previous = entry.store("a".into(), Metadata::IMMORTAL);
        assert_eq!(previous, None);
        assert_eq!(entry.value(), Some(&"a".to_string()));

        let version = ClusteredVersion::new(TopologyId(1), 1);
        let previous = entry.store("b".into(), Metadata::IMMORTAL.with_version(version));
        assert_eq!(previous, Some("a".to_string()));
        assert_eq!(entry.metadata().version, Some(version));

        let removed = entry.remove();
        assert_eq!(removed, Some("b".to_string()));
        assert!(!entry.is_present());
        assert_eq!(entry.metadata(), &Metadata::IMMORTAL);
    }

    #[test]
    fn metadata_serde_roundtrip() {
        let metadata = Metadata {
            lifespan: Some(Duration::from_secs(60)),
            max_idle: None,
            version: Some(ClusteredVersion::new(TopologyId(7), 3)),
        };
        let json = serde_json::to_string(&metadata).unwrap();
        let back: Metadata = serde_json::from_str(&json).unwrap();
        assert_eq!(back, metadata);
        assert!(!metadata.is_immortal());
        assert!(Metadata::IMMORTAL.is_immortal());
    }
}
