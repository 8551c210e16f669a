// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! The write command family: put, remove, replace, remove-expired, compute,
//! compute-if-absent, and put-map.
//!
//! Each command is a thin, immutable-after-build binding of payload to
//! matcher, invocation id, flags and topology id. The primary owner calls
//! [`DataWriteCommand::perform`] to evaluate the matcher and apply the
//! write; a rejected condition marks the command unsuccessful and returns
//! normally. The copy produced by [`WriteCommand::for_backup`] carries
//! [`ValueMatcher::PrimaryDecided`], so backup owners apply without
//! re-evaluating the race the primary resolved.

use std::collections::BTreeMap;
use std::marker::PhantomData;
use std::time::Duration;

use hoard_types::entry::{CacheEntry, CacheKey, CacheValue, Metadata};
use hoard_types::matcher::ValueMatcher;
use hoard_types::topology::SegmentId;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::command::{DataWriteCommand, LoadType, WriteCommand, WriteHeader, WriteResult};
use crate::functional::{ComponentRegistry, Injectable, MappingFunction, RemappingFunction};

/// Load classification shared by the overwrite-style commands: the primary
/// loads prior state only when a return value or a condition needs it, and
/// an already-decided backup copy never loads.
fn overwrite_load_type(matcher: ValueMatcher, returns_value: bool) -> LoadType {
    if matches!(matcher, ValueMatcher::PrimaryDecided) || !returns_value {
        LoadType::DontLoad
    } else {
        LoadType::PrimaryOnly
    }
}

/// Stores a value under a key, unconditionally or only if the key is
/// absent.
///
/// A plain put carries [`ValueMatcher::Always`]; `put_if_absent` carries
/// [`ValueMatcher::Expected`] with an absent expectation, so the matcher
/// alone expresses the condition. A rejected put-if-absent returns the
/// value currently in the cache, mirroring the map contract.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Put<K, V> {
    key: K,
    value: V,
    segment: SegmentId,
    metadata: Metadata,
    matcher: ValueMatcher,
    header: WriteHeader,
}

impl<K: CacheKey, V: CacheValue> Put<K, V> {
    /// Builds an unconditional put.
    pub fn new(
        key: K,
        value: V,
        segment: SegmentId,
        metadata: Metadata,
        header: WriteHeader,
    ) -> Put<K, V> {
        Put {
            key,
            value,
            segment,
            metadata,
            matcher: ValueMatcher::Always,
            header,
        }
    }

    /// Builds a put that applies only if the key is absent.
    pub fn if_absent(
        key: K,
        value: V,
        segment: SegmentId,
        metadata: Metadata,
        header: WriteHeader,
    ) -> Put<K, V> {
        Put {
            key,
            value,
            segment,
            metadata,
            matcher: ValueMatcher::Expected,
            header,
        }
    }

    /// The value to store.
    pub fn value(&self) -> &V {
        &self.value
    }

    /// The metadata to stamp on the entry.
    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }
}

impl<K: CacheKey, V: CacheValue> WriteCommand<K, V> for Put<K, V> {
    const NAME: &'static str = "put";

    fn header(&self) -> &WriteHeader {
        &self.header
    }

    fn header_mut(&mut self) -> &mut WriteHeader {
        &mut self.header
    }

    fn matcher(&self) -> ValueMatcher {
        self.matcher
    }

    fn set_matcher(&mut self, matcher: ValueMatcher) {
        self.matcher = matcher;
    }

    fn load_type(&self) -> LoadType {
        overwrite_load_type(self.matcher, self.returns_value())
    }

    fn keys_to_lock(&self) -> Vec<&K> {
        vec![&self.key]
    }
}

impl<K: CacheKey, V: CacheValue> DataWriteCommand<K, V> for Put<K, V> {
    fn key(&self) -> &K {
        &self.key
    }

    fn segment(&self) -> SegmentId {
        self.segment
    }

    fn perform(&mut self, entry: &mut CacheEntry<V>) -> WriteResult<V> {
        let returns = self.returns_value();
        if !self
            .matcher
            .allows_write(entry.value(), None, Some(&self.value))
        {
            self.header.fail();
            let current = if returns { entry.value().cloned() } else { None };
            return WriteResult::rejected(current);
        }
        let previous = entry.store(self.value.clone(), self.metadata.clone());
        WriteResult::applied(if returns { previous } else { None })
    }
}

/// Removes a key, unconditionally or only if its value matches.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Remove<K, V> {
    key: K,
    expected: Option<V>,
    segment: SegmentId,
    matcher: ValueMatcher,
    header: WriteHeader,
}

impl<K: CacheKey, V: CacheValue> Remove<K, V> {
    /// Builds an unconditional remove.
    pub fn new(key: K, segment: SegmentId, header: WriteHeader) -> Remove<K, V> {
        Remove {
            key,
            expected: None,
            segment,
            matcher: ValueMatcher::Always,
            header,
        }
    }

    /// Builds a remove that applies only if the current value equals
    /// `expected`.
    pub fn if_equals(key: K, expected: V, segment: SegmentId, header: WriteHeader) -> Remove<K, V> {
        Remove {
            key,
            expected: Some(expected),
            segment,
            matcher: ValueMatcher::Expected,
            header,
        }
    }

    /// The value the remove is conditioned on, if any.
    pub fn expected(&self) -> Option<&V> {
        self.expected.as_ref()
    }
}

impl<K: CacheKey, V: CacheValue> WriteCommand<K, V> for Remove<K, V> {
    const NAME: &'static str = "remove";

    fn header(&self) -> &WriteHeader {
        &self.header
    }

    fn header_mut(&mut self) -> &mut WriteHeader {
        &mut self.header
    }

    fn matcher(&self) -> ValueMatcher {
        self.matcher
    }

    fn set_matcher(&mut self, matcher: ValueMatcher) {
        self.matcher = matcher;
    }

    fn load_type(&self) -> LoadType {
        overwrite_load_type(self.matcher, self.returns_value())
    }

    fn keys_to_lock(&self) -> Vec<&K> {
        vec![&self.key]
    }
}

impl<K: CacheKey, V: CacheValue> DataWriteCommand<K, V> for Remove<K, V> {
    fn key(&self) -> &K {
        &self.key
    }

    fn segment(&self) -> SegmentId {
        self.segment
    }

    fn perform(&mut self, entry: &mut CacheEntry<V>) -> WriteResult<V> {
        let returns = self.returns_value();
        if !self
            .matcher
            .allows_write(entry.value(), self.expected.as_ref(), None)
        {
            self.header.fail();
            return WriteResult::rejected(None);
        }
        let previous = entry.remove();
        WriteResult::applied(if returns { previous } else { None })
    }
}

/// Removes an entry the expiry reaper observed to be expired.
///
/// The entry may have been explicitly removed, or overwritten with a fresh
/// value, between the observation and this command's arrival at the
/// primary. The matcher absorbs both races: already-gone counts as success
/// (expiry and removal are the same event arriving by two paths), and a
/// changed value rejects the command silently so the fresh write survives.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoveExpired<K, V> {
    key: K,
    observed: Option<V>,
    /// The lifespan that expired the entry, for diagnostics. Absent for
    /// max-idle expiry.
    lifespan: Option<Duration>,
    segment: SegmentId,
    matcher: ValueMatcher,
    header: WriteHeader,
}

impl<K: CacheKey, V: CacheValue> RemoveExpired<K, V> {
    /// Builds a removal for an entry whose lifespan elapsed, conditioned on
    /// the observed value.
    pub fn new(
        key: K,
        observed: V,
        lifespan: Option<Duration>,
        segment: SegmentId,
        header: WriteHeader,
    ) -> RemoveExpired<K, V> {
        RemoveExpired {
            key,
            observed: Some(observed),
            lifespan,
            segment,
            matcher: ValueMatcher::ExpectedOrAbsent,
            header,
        }
    }

    /// Builds a removal for an entry that idled out. No value condition:
    /// max-idle expiry does not know which value it observed.
    pub fn for_max_idle(key: K, segment: SegmentId, header: WriteHeader) -> RemoveExpired<K, V> {
        RemoveExpired {
            key,
            observed: None,
            lifespan: None,
            segment,
            matcher: ValueMatcher::Always,
            header,
        }
    }

    /// The lifespan that expired the entry, if this is lifespan expiry.
    pub fn lifespan(&self) -> Option<Duration> {
        self.lifespan
    }
}

impl<K: CacheKey, V: CacheValue> WriteCommand<K, V> for RemoveExpired<K, V> {
    const NAME: &'static str = "remove_expired";

    fn header(&self) -> &WriteHeader {
        &self.header
    }

    fn header_mut(&mut self) -> &mut WriteHeader {
        &mut self.header
    }

    fn matcher(&self) -> ValueMatcher {
        self.matcher
    }

    fn set_matcher(&mut self, matcher: ValueMatcher) {
        self.matcher = matcher;
    }

    fn load_type(&self) -> LoadType {
        if matches!(self.matcher, ValueMatcher::PrimaryDecided) {
            LoadType::DontLoad
        } else {
            // The matcher always needs the current value, return value or
            // not.
            LoadType::PrimaryOnly
        }
    }

    fn keys_to_lock(&self) -> Vec<&K> {
        vec![&self.key]
    }
}

impl<K: CacheKey, V: CacheValue> DataWriteCommand<K, V> for RemoveExpired<K, V> {
    fn key(&self) -> &K {
        &self.key
    }

    fn segment(&self) -> SegmentId {
        self.segment
    }

    fn perform(&mut self, entry: &mut CacheEntry<V>) -> WriteResult<V> {
        let returns = self.returns_value();
        if !self
            .matcher
            .allows_write(entry.value(), self.observed.as_ref(), None)
        {
            // Lost the race to a concurrent write; the fresh value stays.
            debug!(key = ?self.key, "expired removal lost to a concurrent write");
            self.header.fail();
            return WriteResult::rejected(None);
        }
        let previous = entry.remove();
        WriteResult::applied(if returns { previous } else { None })
    }
}

/// Replaces a key's value: any present value (two-argument form) or one
/// specific expected value (three-argument form).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Replace<K, V> {
    key: K,
    expected: Option<V>,
    value: V,
    segment: SegmentId,
    metadata: Metadata,
    matcher: ValueMatcher,
    header: WriteHeader,
}

impl<K: CacheKey, V: CacheValue> Replace<K, V> {
    /// Builds a replace that applies whenever any value is present.
    pub fn new(
        key: K,
        value: V,
        segment: SegmentId,
        metadata: Metadata,
        header: WriteHeader,
    ) -> Replace<K, V> {
        Replace {
            key,
            expected: None,
            value,
            segment,
            metadata,
            matcher: ValueMatcher::Present,
            header,
        }
    }

    /// Builds a replace that applies only if the current value equals
    /// `expected`.
    pub fn if_equals(
        key: K,
        expected: V,
        value: V,
        segment: SegmentId,
        metadata: Metadata,
        header: WriteHeader,
    ) -> Replace<K, V> {
        Replace {
            key,
            expected: Some(expected),
            value,
            segment,
            metadata,
            matcher: ValueMatcher::Expected,
            header,
        }
    }

    /// The replacement value.
    pub fn value(&self) -> &V {
        &self.value
    }
}

impl<K: CacheKey, V: CacheValue> WriteCommand<K, V> for Replace<K, V> {
    const NAME: &'static str = "replace";

    fn header(&self) -> &WriteHeader {
        &self.header
    }

    fn header_mut(&mut self) -> &mut WriteHeader {
        &mut self.header
    }

    fn matcher(&self) -> ValueMatcher {
        self.matcher
    }

    fn set_matcher(&mut self, matcher: ValueMatcher) {
        self.matcher = matcher;
    }

    fn load_type(&self) -> LoadType {
        overwrite_load_type(self.matcher, self.returns_value())
    }

    fn keys_to_lock(&self) -> Vec<&K> {
        vec![&self.key]
    }
}

impl<K: CacheKey, V: CacheValue> DataWriteCommand<K, V> for Replace<K, V> {
    fn key(&self) -> &K {
        &self.key
    }

    fn segment(&self) -> SegmentId {
        self.segment
    }

    fn perform(&mut self, entry: &mut CacheEntry<V>) -> WriteResult<V> {
        let returns = self.returns_value();
        if !self
            .matcher
            .allows_write(entry.value(), self.expected.as_ref(), Some(&self.value))
        {
            self.header.fail();
            return WriteResult::rejected(None);
        }
        let previous = entry.store(self.value.clone(), self.metadata.clone());
        WriteResult::applied(if returns { previous } else { None })
    }
}

/// Derives a key's new value from its current one with a remapping
/// function. The function returning `None` removes the entry.
///
/// All owners load prior state: backups re-run the function against their
/// own (identical, by apply-order) prior value rather than shipping the
/// computed result.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Compute<K, V, F> {
    key: K,
    remapping: F,
    segment: SegmentId,
    metadata: Metadata,
    matcher: ValueMatcher,
    header: WriteHeader,
    _values: PhantomData<V>,
}

impl<K: CacheKey, V: CacheValue, F: RemappingFunction<K, V>> Compute<K, V, F> {
    /// Builds a compute command.
    pub fn new(
        key: K,
        remapping: F,
        segment: SegmentId,
        metadata: Metadata,
        header: WriteHeader,
    ) -> Compute<K, V, F> {
        Compute {
            key,
            remapping,
            segment,
            metadata,
            matcher: ValueMatcher::Always,
            header,
            _values: PhantomData,
        }
    }

    /// The remapping function.
    pub fn remapping(&self) -> &F {
        &self.remapping
    }
}

impl<K: CacheKey, V: CacheValue, F: RemappingFunction<K, V>> Injectable for Compute<K, V, F> {
    fn inject(&mut self, registry: &ComponentRegistry) {
        self.remapping.inject(registry);
    }
}

impl<K: CacheKey, V: CacheValue, F: RemappingFunction<K, V>> WriteCommand<K, V>
    for Compute<K, V, F>
{
    const NAME: &'static str = "compute";

    fn header(&self) -> &WriteHeader {
        &self.header
    }

    fn header_mut(&mut self) -> &mut WriteHeader {
        &mut self.header
    }

    fn matcher(&self) -> ValueMatcher {
        self.matcher
    }

    fn set_matcher(&mut self, matcher: ValueMatcher) {
        self.matcher = matcher;
    }

    fn load_type(&self) -> LoadType {
        LoadType::AllOwners
    }

    fn keys_to_lock(&self) -> Vec<&K> {
        vec![&self.key]
    }
}

impl<K: CacheKey, V: CacheValue, F: RemappingFunction<K, V>> DataWriteCommand<K, V>
    for Compute<K, V, F>
{
    fn key(&self) -> &K {
        &self.key
    }

    fn segment(&self) -> SegmentId {
        self.segment
    }

    fn perform(&mut self, entry: &mut CacheEntry<V>) -> WriteResult<V> {
        let returns = self.returns_value();
        if !self.matcher.allows_write(entry.value(), None, None) {
            self.header.fail();
            return WriteResult::rejected(None);
        }
        match self.remapping.apply(&self.key, entry.value()) {
            Some(computed) => {
                entry.store(computed.clone(), self.metadata.clone());
                WriteResult::applied(if returns { Some(computed) } else { None })
            }
            None => {
                entry.remove();
                WriteResult::applied(None)
            }
        }
    }
}

/// Computes and stores a value only if the key is absent.
///
/// The condition lives in the operation, not the matcher: an existing value
/// rejects the command (returning that value), and a mapping function that
/// produces nothing stores nothing.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ComputeIfAbsent<K, V, F> {
    key: K,
    mapping: F,
    segment: SegmentId,
    metadata: Metadata,
    matcher: ValueMatcher,
    header: WriteHeader,
    _values: PhantomData<V>,
}

impl<K: CacheKey, V: CacheValue, F: MappingFunction<K, V>> ComputeIfAbsent<K, V, F> {
    /// Builds a compute-if-absent command.
    pub fn new(
        key: K,
        mapping: F,
        segment: SegmentId,
        metadata: Metadata,
        header: WriteHeader,
    ) -> ComputeIfAbsent<K, V, F> {
        ComputeIfAbsent {
            key,
            mapping,
            segment,
            metadata,
            matcher: ValueMatcher::Always,
            header,
            _values: PhantomData,
        }
    }

    /// The mapping function.
    pub fn mapping(&self) -> &F {
        &self.mapping
    }
}

impl<K: CacheKey, V: CacheValue, F: MappingFunction<K, V>> Injectable for ComputeIfAbsent<K, V, F> {
    fn inject(&mut self, registry: &ComponentRegistry) {
        self.mapping.inject(registry);
    }
}

impl<K: CacheKey, V: CacheValue, F: MappingFunction<K, V>> WriteCommand<K, V>
    for ComputeIfAbsent<K, V, F>
{
    const NAME: &'static str = "compute_if_absent";

    fn header(&self) -> &WriteHeader {
        &self.header
    }

    fn header_mut(&mut self) -> &mut WriteHeader {
        &mut self.header
    }

    fn matcher(&self) -> ValueMatcher {
        self.matcher
    }

    fn set_matcher(&mut self, matcher: ValueMatcher) {
        self.matcher = matcher;
    }

    fn is_conditional(&self) -> bool {
        true
    }

    fn load_type(&self) -> LoadType {
        LoadType::AllOwners
    }

    fn keys_to_lock(&self) -> Vec<&K> {
        vec![&self.key]
    }
}

impl<K: CacheKey, V: CacheValue, F: MappingFunction<K, V>> DataWriteCommand<K, V>
    for ComputeIfAbsent<K, V, F>
{
    fn key(&self) -> &K {
        &self.key
    }

    fn segment(&self) -> SegmentId {
        self.segment
    }

    fn perform(&mut self, entry: &mut CacheEntry<V>) -> WriteResult<V> {
        if let Some(existing) = entry.value() {
            self.header.fail();
            return WriteResult::rejected(Some(existing.clone()));
        }
        match self.mapping.apply(&self.key) {
            Some(computed) => {
                entry.store(computed.clone(), self.metadata.clone());
                WriteResult::applied(Some(computed))
            }
            None => {
                // Nothing to store; nothing to replicate.
                self.header.fail();
                WriteResult::rejected(None)
            }
        }
    }
}

/// Stores a map of entries in one command.
///
/// The only multi-key member of the family: its keys span segments, its
/// backups acknowledge per segment, and a copy forwarded after locking
/// elsewhere reports no keys to lock.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PutMap<K: Ord, V> {
    entries: BTreeMap<K, V>,
    metadata: Metadata,
    forwarded: bool,
    matcher: ValueMatcher,
    header: WriteHeader,
}

impl<K: CacheKey, V: CacheValue> PutMap<K, V> {
    /// Builds a put-map command.
    pub fn new(entries: BTreeMap<K, V>, metadata: Metadata, header: WriteHeader) -> PutMap<K, V> {
        PutMap {
            entries,
            metadata,
            forwarded: false,
            matcher: ValueMatcher::Always,
            header,
        }
    }

    /// The entries to store.
    pub fn entries(&self) -> &BTreeMap<K, V> {
        &self.entries
    }

    /// Whether this copy was forwarded after being locked elsewhere.
    pub fn is_forwarded(&self) -> bool {
        self.forwarded
    }

    /// Applies every binding to the matching entry in `entries`, creating
    /// absent slots on demand. Returns the previous values (only those that
    /// existed) when a return value is expected.
    pub fn perform(
        &mut self,
        entries: &mut BTreeMap<K, CacheEntry<V>>,
    ) -> BTreeMap<K, V> {
        let returns = self.returns_value();
        let mut previous = BTreeMap::new();
        for (key, value) in &self.entries {
            let entry = entries.entry(key.clone()).or_insert_with(CacheEntry::absent);
            let prior = entry.store(value.clone(), self.metadata.clone());
            if returns {
                if let Some(prior) = prior {
                    previous.insert(key.clone(), prior);
                }
            }
        }
        previous
    }
}

impl<K: CacheKey, V: CacheValue> WriteCommand<K, V> for PutMap<K, V> {
    const NAME: &'static str = "put_map";

    fn header(&self) -> &WriteHeader {
        &self.header
    }

    fn header_mut(&mut self) -> &mut WriteHeader {
        &mut self.header
    }

    fn matcher(&self) -> ValueMatcher {
        self.matcher
    }

    fn set_matcher(&mut self, matcher: ValueMatcher) {
        self.matcher = matcher;
    }

    fn load_type(&self) -> LoadType {
        overwrite_load_type(self.matcher, self.returns_value())
    }

    fn keys_to_lock(&self) -> Vec<&K> {
        if self.forwarded {
            Vec::new()
        } else {
            self.entries.keys().collect()
        }
    }

    fn for_backup(&self) -> Self {
        let mut backup = self.clone();
        backup.matcher = ValueMatcher::PrimaryDecided;
        backup.forwarded = true;
        backup.header = self.header.remotable();
        backup
    }
}

#[cfg(test)]
mod tests {
    use hoard_types::flags::{Flag, FlagSet};
    use hoard_types::id::{CommandInvocationId, LockOwner, NodeId};
    use hoard_types::topology::TopologyId;
    use proptest::prelude::*;

    use super::*;

    fn header() -> WriteHeader {
        WriteHeader::new(
            CommandInvocationId::generate(NodeId::random()),
            TopologyId(1),
            FlagSet::EMPTY,
        )
    }

    fn header_with(flags: FlagSet) -> WriteHeader {
        WriteHeader::new(
            CommandInvocationId::generate(NodeId::random()),
            TopologyId(1),
            flags,
        )
    }

    #[derive(Clone, Debug, Serialize, Deserialize)]
    struct Increment(u64);

    impl Injectable for Increment {
        fn inject(&mut self, _: &ComponentRegistry) {}
    }

    impl RemappingFunction<String, u64> for Increment {
        fn apply(&self, _: &String, current: Option<&u64>) -> Option<u64> {
            Some(current.copied().unwrap_or(0) + self.0)
        }
    }

    #[derive(Clone, Debug, Serialize, Deserialize)]
    struct KeyLength;

    impl Injectable for KeyLength {
        fn inject(&mut self, _: &ComponentRegistry) {}
    }

    impl MappingFunction<String, u64> for KeyLength {
        fn apply(&self, key: &String) -> Option<u64> {
            if key.is_empty() {
                None
            } else {
                Some(key.len() as u64)
            }
        }
    }

    #[test]
    fn put_returns_previous_value() {
        let mut entry = CacheEntry::with_value(1u64);
        let mut put = Put::new("k".to_string(), 2, SegmentId(0), Metadata::IMMORTAL, header());

        let result = put.perform(&mut entry);
        assert_eq!(result, WriteResult::applied(Some(1)));
        assert!(put.header().is_successful());
        assert_eq!(entry.value(), Some(&2));
    }

    #[test]
    fn put_suppresses_return_value_when_ignored() {
        let mut entry = CacheEntry::with_value(1u64);
        let mut put = Put::new(
            "k".to_string(),
            2,
            SegmentId(0),
            Metadata::IMMORTAL,
            header_with(FlagSet::from(Flag::IgnoreReturnValues)),
        );

        assert_eq!(put.load_type(), LoadType::DontLoad);
        let result = put.perform(&mut entry);
        assert_eq!(result, WriteResult::applied(None));
        assert_eq!(entry.value(), Some(&2));
    }

    #[test]
    fn put_if_absent_is_conditional_despite_ignored_returns() {
        let mut entry = CacheEntry::with_value(7u64);
        let mut put = Put::if_absent(
            "k".to_string(),
            2,
            SegmentId(0),
            Metadata::IMMORTAL,
            header_with(FlagSet::from(Flag::IgnoreReturnValues)),
        );

        assert!(put.is_conditional());
        assert!(put.returns_value());
        assert_eq!(put.load_type(), LoadType::PrimaryOnly);

        let result = put.perform(&mut entry);
        assert_eq!(result, WriteResult::rejected(Some(7)));
        assert!(!put.header().is_successful());
        assert_eq!(entry.value(), Some(&7));
    }

    #[test]
    fn put_if_absent_applies_when_absent() {
        let mut entry: CacheEntry<u64> = CacheEntry::absent();
        let mut put = Put::if_absent("k".to_string(), 2, SegmentId(0), Metadata::IMMORTAL, header());

        let result = put.perform(&mut entry);
        assert_eq!(result, WriteResult::applied(None));
        assert!(put.header().is_successful());
        assert_eq!(entry.value(), Some(&2));
    }

    #[test]
    fn retried_put_if_absent_accepts_its_own_first_attempt() {
        let put = Put::if_absent("k".to_string(), 2u64, SegmentId(0), Metadata::IMMORTAL, header());
        let mut retry = put.for_retry();
        assert_eq!(retry.matcher(), ValueMatcher::ExpectedOrNew);
        assert!(retry.header().flags().contains(Flag::CommandRetry));

        // The first attempt applied before its response was lost.
        let mut entry = CacheEntry::with_value(2u64);
        let result = retry.perform(&mut entry);
        assert!(result.applied);
        assert!(retry.header().is_successful());
    }

    #[test]
    fn conditional_remove() {
        let mut entry = CacheEntry::with_value(5u64);
        let mut wrong = Remove::if_equals("k".to_string(), 4, SegmentId(0), header());
        let result = wrong.perform(&mut entry);
        assert!(!result.applied);
        assert!(!wrong.header().is_successful());
        assert_eq!(entry.value(), Some(&5));

        let mut right = Remove::if_equals("k".to_string(), 5, SegmentId(0), header());
        let result = right.perform(&mut entry);
        assert_eq!(result, WriteResult::applied(Some(5)));
        assert!(!entry.is_present());
    }

    #[test]
    fn replace_requires_presence() {
        let mut entry: CacheEntry<u64> = CacheEntry::absent();
        let mut replace = Replace::new("k".to_string(), 9, SegmentId(0), Metadata::IMMORTAL, header());
        let result = replace.perform(&mut entry);
        assert!(!result.applied);
        assert!(!replace.header().is_successful());
        assert!(!entry.is_present());

        let mut entry = CacheEntry::with_value(1u64);
        let mut replace = Replace::new("k".to_string(), 9, SegmentId(0), Metadata::IMMORTAL, header());
        let result = replace.perform(&mut entry);
        assert_eq!(result, WriteResult::applied(Some(1)));
        assert_eq!(entry.value(), Some(&9));
    }

    #[test]
    fn three_argument_replace_compares_values() {
        let mut entry = CacheEntry::with_value(1u64);
        let mut replace =
            Replace::if_equals("k".to_string(), 2, 9, SegmentId(0), Metadata::IMMORTAL, header());
        assert!(!replace.perform(&mut entry).applied);
        assert_eq!(entry.value(), Some(&1));

        let mut replace =
            Replace::if_equals("k".to_string(), 1, 9, SegmentId(0), Metadata::IMMORTAL, header());
        assert!(replace.perform(&mut entry).applied);
        assert_eq!(entry.value(), Some(&9));
    }

    #[test]
    fn remove_expired_treats_already_gone_as_success() {
        let mut entry: CacheEntry<u64> = CacheEntry::absent();
        let mut cmd = RemoveExpired::new(
            "k".to_string(),
            3,
            Some(Duration::from_secs(60)),
            SegmentId(0),
            header(),
        );
        let result = cmd.perform(&mut entry);
        assert!(result.applied);
        assert!(cmd.header().is_successful());
    }

    #[test]
    fn remove_expired_loses_to_concurrent_write_silently() {
        // A fresh value landed between the expiry observation and this
        // command.
        let mut entry = CacheEntry::with_value(10u64);
        let mut cmd = RemoveExpired::new(
            "k".to_string(),
            3,
            Some(Duration::from_secs(60)),
            SegmentId(0),
            header(),
        );
        let result = cmd.perform(&mut entry);
        assert!(!result.applied);
        assert!(!cmd.header().is_successful());
        assert_eq!(entry.value(), Some(&10), "fresh value must survive");
    }

    #[test]
    fn remove_expired_removes_matching_value() {
        let mut entry = CacheEntry::with_value(3u64);
        let mut cmd = RemoveExpired::new(
            "k".to_string(),
            3,
            Some(Duration::from_secs(60)),
            SegmentId(0),
            header(),
        );
        let result = cmd.perform(&mut entry);
        assert_eq!(result, WriteResult::applied(Some(3)));
        assert!(!entry.is_present());
    }

    #[test]
    fn max_idle_removal_has_no_value_condition() {
        let mut entry = CacheEntry::with_value(42u64);
        let mut cmd: RemoveExpired<String, u64> =
            RemoveExpired::for_max_idle("k".to_string(), SegmentId(0), header());
        assert!(cmd.perform(&mut entry).applied);
        assert!(!entry.is_present());
    }

    #[test]
    fn max_idle_removal_suppresses_return_value_when_ignored() {
        let mut entry = CacheEntry::with_value(42u64);
        let mut cmd: RemoveExpired<String, u64> = RemoveExpired::for_max_idle(
            "k".to_string(),
            SegmentId(0),
            header_with(FlagSet::from(Flag::IgnoreReturnValues)),
        );
        assert!(!cmd.returns_value());
        assert_eq!(cmd.perform(&mut entry), WriteResult::applied(None));
        assert!(!entry.is_present());

        // Lifespan expiry stays conditional, so the flag does not silence it.
        let mut entry = CacheEntry::with_value(3u64);
        let mut cmd = RemoveExpired::new(
            "k".to_string(),
            3,
            Some(Duration::from_secs(60)),
            SegmentId(0),
            header_with(FlagSet::from(Flag::IgnoreReturnValues)),
        );
        assert!(cmd.returns_value());
        assert_eq!(cmd.perform(&mut entry), WriteResult::applied(Some(3)));
    }

    #[test]
    fn compute_derives_and_removes() {
        let mut entry: CacheEntry<u64> = CacheEntry::absent();
        let mut cmd = Compute::new(
            "k".to_string(),
            Increment(5),
            SegmentId(0),
            Metadata::IMMORTAL,
            header(),
        );
        let result = cmd.perform(&mut entry);
        assert_eq!(result, WriteResult::applied(Some(5)));
        assert_eq!(entry.value(), Some(&5));

        let mut again = Compute::new(
            "k".to_string(),
            Increment(5),
            SegmentId(0),
            Metadata::IMMORTAL,
            header(),
        );
        let result = again.perform(&mut entry);
        assert_eq!(result, WriteResult::applied(Some(10)));
        assert_eq!(entry.value(), Some(&10));
    }

    #[test]
    fn compute_if_absent_respects_existing_value() {
        let mut entry = CacheEntry::with_value(99u64);
        let mut cmd = ComputeIfAbsent::new(
            "key".to_string(),
            KeyLength,
            SegmentId(0),
            Metadata::IMMORTAL,
            header(),
        );
        assert!(cmd.is_conditional());
        let result = cmd.perform(&mut entry);
        assert_eq!(result, WriteResult::rejected(Some(99)));
        assert!(!cmd.header().is_successful());
        assert_eq!(entry.value(), Some(&99));
    }

    #[test]
    fn compute_if_absent_stores_mapped_value() {
        let mut entry: CacheEntry<u64> = CacheEntry::absent();
        let mut cmd = ComputeIfAbsent::new(
            "key".to_string(),
            KeyLength,
            SegmentId(0),
            Metadata::IMMORTAL,
            header(),
        );
        let result = cmd.perform(&mut entry);
        assert_eq!(result, WriteResult::applied(Some(3)));
        assert_eq!(entry.value(), Some(&3));
    }

    #[test]
    fn put_map_applies_all_and_reports_previous() {
        let mut container: BTreeMap<String, CacheEntry<u64>> = BTreeMap::new();
        container.insert("a".to_string(), CacheEntry::with_value(1));

        let entries = BTreeMap::from([("a".to_string(), 10u64), ("b".to_string(), 20u64)]);
        let mut cmd = PutMap::new(entries, Metadata::IMMORTAL, header());

        let previous = cmd.perform(&mut container);
        assert_eq!(previous, BTreeMap::from([("a".to_string(), 1u64)]));
        assert_eq!(container["a"].value(), Some(&10));
        assert_eq!(container["b"].value(), Some(&20));
    }

    #[test]
    fn forwarded_put_map_locks_nothing() {
        let entries = BTreeMap::from([("a".to_string(), 1u64), ("b".to_string(), 2u64)]);
        let cmd = PutMap::new(entries, Metadata::IMMORTAL, header());
        assert_eq!(cmd.keys_to_lock().len(), 2);

        let backup = cmd.for_backup();
        assert!(backup.is_forwarded());
        assert!(backup.keys_to_lock().is_empty());
        assert_eq!(backup.matcher(), ValueMatcher::PrimaryDecided);
    }

    #[test]
    fn backup_copy_is_decided_and_remotable() {
        let put = Put::if_absent(
            "k".to_string(),
            2u64,
            SegmentId(4),
            Metadata::IMMORTAL,
            header_with(Flag::FailSilently | Flag::SkipCacheStore),
        );
        let backup = put.for_backup();
        assert_eq!(backup.matcher(), ValueMatcher::PrimaryDecided);
        assert!(!backup.header().flags().contains(Flag::FailSilently));
        assert!(backup.header().flags().contains(Flag::SkipCacheStore));
        assert_eq!(backup.header().invocation(), put.header().invocation());
        // The original is untouched.
        assert_eq!(put.matcher(), ValueMatcher::Expected);
    }

    #[test]
    fn backup_applies_against_arbitrary_local_state() {
        // The primary decided a put-if-absent applies; a backup holding any
        // other value must overwrite without re-evaluating.
        let put = Put::if_absent("k".to_string(), 2u64, SegmentId(0), Metadata::IMMORTAL, header());
        let mut backup = put.for_backup();

        let mut backup_entry = CacheEntry::with_value(777u64);
        let result = backup.perform(&mut backup_entry);
        assert!(result.applied);
        assert!(backup.header().is_successful());
        assert_eq!(backup_entry.value(), Some(&2));
    }

    #[test]
    fn lock_owner_is_the_invocation() {
        let cmd = Remove::<String, u64>::new("k".to_string(), SegmentId(0), header());
        match cmd.lock_owner() {
            LockOwner::Invocation(id) => assert_eq!(id, cmd.header().invocation()),
            other => panic!("unexpected lock owner {other:?}"),
        }
        assert_eq!(cmd.keys_to_lock(), vec![&"k".to_string()]);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        // Whatever matcher the original carried and whatever value the
        // backup holds, the forwarded copy applies unconditionally.
        #[test]
        fn forwarded_copies_apply_against_any_backup_state(
            matcher: ValueMatcher,
            backup_value in proptest::option::of(any::<u64>()),
        ) {
            let mut put =
                Put::new("k".to_string(), 2u64, SegmentId(0), Metadata::IMMORTAL, header());
            put.set_matcher(matcher);
            let mut backup = put.for_backup();
            prop_assert_eq!(backup.matcher(), ValueMatcher::PrimaryDecided);

            let mut entry = CacheEntry::new(backup_value, Metadata::IMMORTAL);
            let result = backup.perform(&mut entry);
            prop_assert!(result.applied);
            prop_assert_eq!(entry.value(), Some(&2));
        }
    }
}
