// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Entry views handed to user functions.
//!
//! A view scopes what a function may do to an entry: read-only functions see
//! a [`ReadView`], write-only functions a [`WriteView`] (no read access, so
//! write-only commands never force owners to load prior state), and
//! read-modify-write functions a [`ReadWriteView`]. Views are constructed
//! fresh on whichever node executes or replays the function; they carry no
//! node-local identity.

use hoard_types::entry::{CacheEntry, Metadata};

/// Read-only access to one entry.
#[derive(Debug)]
pub struct ReadView<'a, K, V> {
    key: &'a K,
    entry: &'a CacheEntry<V>,
}

impl<'a, K, V> ReadView<'a, K, V> {
    /// Constructs a view of `entry` under `key`.
    pub fn new(key: &'a K, entry: &'a CacheEntry<V>) -> ReadView<'a, K, V> {
        ReadView { key, entry }
    }

    /// The entry's key.
    pub fn key(&self) -> &K {
        self.key
    }

    /// The current value, if present.
    pub fn find(&self) -> Option<&V> {
        self.entry.value()
    }

    /// The entry's metadata.
    pub fn metadata(&self) -> &Metadata {
        self.entry.metadata()
    }
}

/// Write-only access to one entry. Deliberately provides no way to observe
/// the current value.
#[derive(Debug)]
pub struct WriteView<'a, K, V> {
    key: &'a K,
    entry: &'a mut CacheEntry<V>,
}

impl<'a, K, V> WriteView<'a, K, V> {
    /// Constructs a view of `entry` under `key`.
    pub fn new(key: &'a K, entry: &'a mut CacheEntry<V>) -> WriteView<'a, K, V> {
        WriteView { key, entry }
    }

    /// The entry's key.
    pub fn key(&self) -> &K {
        self.key
    }

    /// Stores `value`, preserving the entry's current metadata.
    pub fn set(&mut self, value: V) {
        let metadata = self.entry.metadata().clone();
        self.entry.store(value, metadata);
    }

    /// Stores `value` with `metadata`.
    pub fn set_with_metadata(&mut self, value: V, metadata: Metadata) {
        self.entry.store(value, metadata);
    }

    /// Removes the value. The view cannot report whether one was present.
    pub fn remove(&mut self) {
        self.entry.remove();
    }
}

/// Combined read and write access to one entry.
#[derive(Debug)]
pub struct ReadWriteView<'a, K, V> {
    key: &'a K,
    entry: &'a mut CacheEntry<V>,
}

impl<'a, K, V> ReadWriteView<'a, K, V> {
    /// Constructs a view of `entry` under `key`.
    pub fn new(key: &'a K, entry: &'a mut CacheEntry<V>) -> ReadWriteView<'a, K, V> {
        ReadWriteView { key, entry }
    }

    /// The entry's key.
    pub fn key(&self) -> &K {
        self.key
    }

    /// The current value, if present.
    pub fn find(&self) -> Option<&V> {
        self.entry.value()
    }

    /// The entry's metadata.
    pub fn metadata(&self) -> &Metadata {
        self.entry.metadata()
    }

    /// Stores `value`, preserving the entry's current metadata. Returns the
    /// previous value.
    pub fn set(&mut self, value: V) -> Option<V> {
        let metadata = self.entry.metadata().clone();
        self.entry.store(value, metadata)
    }

    /// Stores `value` with `metadata`. Returns the previous value.
    pub fn set_with_metadata(&mut self, value: V, metadata: Metadata) -> Option<V> {
        self.entry.store(value, metadata)
    }

    /// Removes the value, returning it.
    pub fn remove(&mut self) -> Option<V> {
        self.entry.remove()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn views_scope_access() {
        let key = "k".to_string();
        let mut entry: CacheEntry<u64> = CacheEntry::with_value(1);

        let read = ReadView::new(&key, &entry);
        assert_eq!(read.key(), &key);
        assert_eq!(read.find(), Some(&1));

        let mut write = WriteView::new(&key, &mut entry);
        write.set(2);
        drop(write);
        assert_eq!(entry.value(), Some(&2));

        let mut rw = ReadWriteView::new(&key, &mut entry);
        assert_eq!(rw.find(), Some(&2));
        assert_eq!(rw.set(3), Some(2));
        assert_eq!(rw.remove(), Some(3));
        assert_eq!(rw.find(), None);
    }

    #[test]
    fn set_preserves_metadata() {
        use hoard_types::topology::TopologyId;
        use hoard_types::version::ClusteredVersion;

        let key = 1u32;
        let version = ClusteredVersion::new(TopologyId(2), 9);
        let mut entry = CacheEntry::new(Some(10u64), Metadata::IMMORTAL.with_version(version));

        let mut rw = ReadWriteView::new(&key, &mut entry);
        rw.set(11);
        drop(rw);
        assert_eq!(entry.metadata().version, Some(version));

        let mut rw = ReadWriteView::new(&key, &mut entry);
        rw.set_with_metadata(12, Metadata::IMMORTAL);
        drop(rw);
        assert_eq!(entry.metadata().version, None);
    }
}
