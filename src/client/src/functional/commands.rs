// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! The functional command family.
//!
//! Read-only, write-only and read-modify-write operations over one or many
//! keys, each carrying a serializable user function. Write-capable
//! single-key commands convert to [`Mutation`] replay tokens; transactional
//! read-only commands carry per-key mutation lists that replay a
//! transaction's pending writes over a copy of the committed state before
//! the read function runs.
//!
//! Many-key commands expose their affected keys as an explicit collection,
//! and all per-key state (arguments, mutation lists, outputs) is paired
//! with that collection positionally. Pairing is never by value equality:
//! duplicate or unsorted keys must not change which argument applies where.

use std::collections::BTreeMap;
use std::marker::PhantomData;

use hoard_types::entry::{CacheEntry, CacheKey, CacheValue};
use hoard_types::flags::FlagSet;
use hoard_types::matcher::ValueMatcher;
use hoard_types::topology::{SegmentId, TopologyId};
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::command::{LoadType, WriteCommand, WriteHeader};
use crate::functional::mutation::{
    Mutation, ReadWriteMutation, ReadWriteWithValueMutation, WriteMutation, WriteWithValueMutation,
};
use crate::functional::views::{ReadView, ReadWriteView, WriteView};
use crate::functional::{
    ComponentRegistry, DataConversions, Injectable, Params, ReadFunction, ReadWriteFunction,
    ReadWriteWithValueFunction, WriteFunction, WriteWithValueFunction,
};

/// A per-key mutation list whose length does not match its key collection.
#[derive(Error, Debug, PartialEq, Eq)]
#[error("{mutation_lists} mutation lists for {keys} keys")]
pub struct MutationListMismatch {
    /// Number of keys in the command.
    pub keys: usize,
    /// Number of per-key mutation lists supplied.
    pub mutation_lists: usize,
}

/// Reads one entry through a user function.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ReadOnlyKey<K, V, F> {
    key: K,
    f: F,
    segment: SegmentId,
    topology: TopologyId,
    flags: FlagSet,
    params: Params,
    conversions: DataConversions,
    _values: PhantomData<V>,
}

impl<K: CacheKey, V: CacheValue, F: ReadFunction<K, V>> ReadOnlyKey<K, V, F> {
    /// Builds a read-only command.
    pub fn new(
        key: K,
        f: F,
        segment: SegmentId,
        topology: TopologyId,
        flags: FlagSet,
        conversions: DataConversions,
    ) -> ReadOnlyKey<K, V, F> {
        ReadOnlyKey {
            key,
            f,
            segment,
            topology,
            flags,
            params: Params::from_flags(flags),
            conversions,
            _values: PhantomData,
        }
    }

    /// The key to read.
    pub fn key(&self) -> &K {
        &self.key
    }

    /// The segment the key hashes to.
    pub fn segment(&self) -> SegmentId {
        self.segment
    }

    /// The topology generation the command was built against.
    pub fn topology(&self) -> TopologyId {
        self.topology
    }

    /// The functional params.
    pub fn params(&self) -> Params {
        self.params
    }

    /// Which owners must load prior state before the read runs.
    pub fn load_type(&self) -> LoadType {
        LoadType::PrimaryOnly
    }

    /// Runs the function against the entry.
    pub fn perform(&self, entry: &CacheEntry<V>) -> F::Out {
        self.f.apply(ReadView::new(&self.key, entry))
    }
}

impl<K: CacheKey, V: CacheValue, F: ReadFunction<K, V>> Injectable for ReadOnlyKey<K, V, F> {
    fn inject(&mut self, registry: &ComponentRegistry) {
        self.f.inject(registry);
    }
}

/// Reads a set of entries through one user function.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ReadOnlyMany<K, V, F> {
    keys: Vec<K>,
    f: F,
    topology: TopologyId,
    flags: FlagSet,
    params: Params,
    conversions: DataConversions,
    _values: PhantomData<V>,
}

impl<K: CacheKey, V: CacheValue, F: ReadFunction<K, V>> ReadOnlyMany<K, V, F> {
    /// Builds a read-only command over `keys`.
    pub fn new(
        keys: Vec<K>,
        f: F,
        topology: TopologyId,
        flags: FlagSet,
        conversions: DataConversions,
    ) -> ReadOnlyMany<K, V, F> {
        ReadOnlyMany {
            keys,
            f,
            topology,
            flags,
            params: Params::from_flags(flags),
            conversions,
            _values: PhantomData,
        }
    }

    /// The keys to read, in output order.
    pub fn keys(&self) -> &[K] {
        &self.keys
    }

    /// The topology generation the command was built against.
    pub fn topology(&self) -> TopologyId {
        self.topology
    }

    /// Which owners must load prior state before the read runs.
    pub fn load_type(&self) -> LoadType {
        LoadType::PrimaryOnly
    }

    /// Runs the function against each key's entry, absent entries included.
    /// Outputs are positionally aligned with [`ReadOnlyMany::keys`].
    pub fn perform(&self, entries: &BTreeMap<K, CacheEntry<V>>) -> Vec<F::Out> {
        let absent = CacheEntry::absent();
        self.keys
            .iter()
            .map(|key| {
                let entry = entries.get(key).unwrap_or(&absent);
                self.f.apply(ReadView::new(key, entry))
            })
            .collect()
    }
}

impl<K: CacheKey, V: CacheValue, F: ReadFunction<K, V>> Injectable for ReadOnlyMany<K, V, F> {
    fn inject(&mut self, registry: &ComponentRegistry) {
        self.f.inject(registry);
    }
}

/// Applies a write-only function to one entry.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WriteOnlyKey<K, V, F> {
    key: K,
    f: F,
    segment: SegmentId,
    params: Params,
    conversions: DataConversions,
    matcher: ValueMatcher,
    header: WriteHeader,
    _values: PhantomData<V>,
}

impl<K: CacheKey, V: CacheValue, F: WriteFunction<K, V>> WriteOnlyKey<K, V, F> {
    /// Builds a write-only command.
    pub fn new(
        key: K,
        f: F,
        segment: SegmentId,
        conversions: DataConversions,
        header: WriteHeader,
    ) -> WriteOnlyKey<K, V, F> {
        WriteOnlyKey {
            key,
            f,
            segment,
            params: Params::from_flags(header.flags()),
            conversions,
            matcher: ValueMatcher::Always,
            header,
            _values: PhantomData,
        }
    }

    /// The affected key.
    pub fn key(&self) -> &K {
        &self.key
    }

    /// The segment the key hashes to.
    pub fn segment(&self) -> SegmentId {
        self.segment
    }

    /// Runs the function against the entry.
    pub fn perform(&self, entry: &mut CacheEntry<V>) {
        self.f.apply(&mut WriteView::new(&self.key, entry));
    }

    /// The replay token for this command.
    pub fn to_mutation(&self) -> WriteMutation<F> {
        WriteMutation::new(self.f.clone(), self.conversions)
    }
}

impl<K: CacheKey, V: CacheValue, F: WriteFunction<K, V>> Injectable for WriteOnlyKey<K, V, F> {
    fn inject(&mut self, registry: &ComponentRegistry) {
        self.f.inject(registry);
    }
}

impl<K: CacheKey, V: CacheValue, F: WriteFunction<K, V>> WriteCommand<K, V>
    for WriteOnlyKey<K, V, F>
{
    const NAME: &'static str = "write_only_key";

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
        LoadType::DontLoad
    }

    fn keys_to_lock(&self) -> Vec<&K> {
        vec![&self.key]
    }
}

/// Applies a write-only function with an argument to one entry.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WriteOnlyKeyValue<K, V, F> {
    key: K,
    argument: V,
    f: F,
    segment: SegmentId,
    params: Params,
    conversions: DataConversions,
    matcher: ValueMatcher,
    header: WriteHeader,
}

impl<K: CacheKey, V: CacheValue, F: WriteWithValueFunction<K, V>> WriteOnlyKeyValue<K, V, F> {
    /// Builds the command.
    pub fn new(
        key: K,
        argument: V,
        f: F,
        segment: SegmentId,
        conversions: DataConversions,
        header: WriteHeader,
    ) -> WriteOnlyKeyValue<K, V, F> {
        WriteOnlyKeyValue {
            key,
            argument,
            f,
            segment,
            params: Params::from_flags(header.flags()),
            conversions,
            matcher: ValueMatcher::Always,
            header,
        }
    }

    /// The affected key.
    pub fn key(&self) -> &K {
        &self.key
    }

    /// The argument passed to the function.
    pub fn argument(&self) -> &V {
        &self.argument
    }

    /// Runs the function against the entry.
    pub fn perform(&self, entry: &mut CacheEntry<V>) {
        self.f
            .apply(&self.argument, &mut WriteView::new(&self.key, entry));
    }

    /// The replay token for this command.
    pub fn to_mutation(&self) -> WriteWithValueMutation<V, F> {
        WriteWithValueMutation::new(self.argument.clone(), self.f.clone(), self.conversions)
    }
}

impl<K: CacheKey, V: CacheValue, F: WriteWithValueFunction<K, V>> Injectable
    for WriteOnlyKeyValue<K, V, F>
{
    fn inject(&mut self, registry: &ComponentRegistry) {
        self.f.inject(registry);
    }
}

impl<K: CacheKey, V: CacheValue, F: WriteWithValueFunction<K, V>> WriteCommand<K, V>
    for WriteOnlyKeyValue<K, V, F>
{
    const NAME: &'static str = "write_only_key_value";

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
        LoadType::DontLoad
    }

    fn keys_to_lock(&self) -> Vec<&K> {
        vec![&self.key]
    }
}

/// Applies a read-modify-write function to one entry.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ReadWriteKey<K, V, F> {
    key: K,
    f: F,
    segment: SegmentId,
    params: Params,
    conversions: DataConversions,
    matcher: ValueMatcher,
    header: WriteHeader,
    _values: PhantomData<V>,
}

impl<K: CacheKey, V: CacheValue, F: ReadWriteFunction<K, V>> ReadWriteKey<K, V, F> {
    /// Builds the command.
    pub fn new(
        key: K,
        f: F,
        segment: SegmentId,
        conversions: DataConversions,
        header: WriteHeader,
    ) -> ReadWriteKey<K, V, F> {
        ReadWriteKey {
            key,
            f,
            segment,
            params: Params::from_flags(header.flags()),
            conversions,
            matcher: ValueMatcher::Always,
            header,
            _values: PhantomData,
        }
    }

    /// The affected key.
    pub fn key(&self) -> &K {
        &self.key
    }

    /// Runs the function against the entry.
    pub fn perform(&self, entry: &mut CacheEntry<V>) -> F::Out {
        self.f.apply(&mut ReadWriteView::new(&self.key, entry))
    }

    /// The replay token for this command.
    pub fn to_mutation(&self) -> ReadWriteMutation<F> {
        ReadWriteMutation::new(self.f.clone(), self.conversions)
    }
}

impl<K: CacheKey, V: CacheValue, F: ReadWriteFunction<K, V>> Injectable for ReadWriteKey<K, V, F> {
    fn inject(&mut self, registry: &ComponentRegistry) {
        self.f.inject(registry);
    }
}

impl<K: CacheKey, V: CacheValue, F: ReadWriteFunction<K, V>> WriteCommand<K, V>
    for ReadWriteKey<K, V, F>
{
    const NAME: &'static str = "read_write_key";

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

/// Applies a read-modify-write function with an argument to one entry.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ReadWriteKeyValue<K, V, F> {
    key: K,
    argument: V,
    f: F,
    segment: SegmentId,
    params: Params,
    conversions: DataConversions,
    matcher: ValueMatcher,
    header: WriteHeader,
}

impl<K: CacheKey, V: CacheValue, F: ReadWriteWithValueFunction<K, V>> ReadWriteKeyValue<K, V, F> {
    /// Builds the command.
    pub fn new(
        key: K,
        argument: V,
        f: F,
        segment: SegmentId,
        conversions: DataConversions,
        header: WriteHeader,
    ) -> ReadWriteKeyValue<K, V, F> {
        ReadWriteKeyValue {
            key,
            argument,
            f,
            segment,
            params: Params::from_flags(header.flags()),
            conversions,
            matcher: ValueMatcher::Always,
            header,
        }
    }

    /// The affected key.
    pub fn key(&self) -> &K {
        &self.key
    }

    /// The argument passed to the function.
    pub fn argument(&self) -> &V {
        &self.argument
    }

    /// Runs the function against the entry.
    pub fn perform(&self, entry: &mut CacheEntry<V>) -> F::Out {
        self.f
            .apply(&self.argument, &mut ReadWriteView::new(&self.key, entry))
    }

    /// The replay token for this command.
    pub fn to_mutation(&self) -> ReadWriteWithValueMutation<V, F> {
        ReadWriteWithValueMutation::new(self.argument.clone(), self.f.clone(), self.conversions)
    }
}

impl<K: CacheKey, V: CacheValue, F: ReadWriteWithValueFunction<K, V>> Injectable
    for ReadWriteKeyValue<K, V, F>
{
    fn inject(&mut self, registry: &ComponentRegistry) {
        self.f.inject(registry);
    }
}

impl<K: CacheKey, V: CacheValue, F: ReadWriteWithValueFunction<K, V>> WriteCommand<K, V>
    for ReadWriteKeyValue<K, V, F>
{
    const NAME: &'static str = "read_write_key_value";

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

/// Applies a write-only function to a set of entries.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WriteOnlyMany<K, V, F> {
    keys: Vec<K>,
    f: F,
    forwarded: bool,
    params: Params,
    conversions: DataConversions,
    matcher: ValueMatcher,
    header: WriteHeader,
    _values: PhantomData<V>,
}

impl<K: CacheKey, V: CacheValue, F: WriteFunction<K, V>> WriteOnlyMany<K, V, F> {
    /// Builds the command over `keys`.
    pub fn new(
        keys: Vec<K>,
        f: F,
        conversions: DataConversions,
        header: WriteHeader,
    ) -> WriteOnlyMany<K, V, F> {
        WriteOnlyMany {
            keys,
            f,
            forwarded: false,
            params: Params::from_flags(header.flags()),
            conversions,
            matcher: ValueMatcher::Always,
            header,
            _values: PhantomData,
        }
    }

    /// The affected keys.
    pub fn keys(&self) -> &[K] {
        &self.keys
    }

    /// Whether this copy was forwarded after being locked elsewhere.
    pub fn is_forwarded(&self) -> bool {
        self.forwarded
    }

    /// Runs the function against each key's entry, creating absent slots on
    /// demand.
    pub fn perform(&self, entries: &mut BTreeMap<K, CacheEntry<V>>) {
        for key in &self.keys {
            let entry = entries.entry(key.clone()).or_insert_with(CacheEntry::absent);
            self.f.apply(&mut WriteView::new(key, entry));
        }
    }

    /// The replay token this command contributes for any one of its keys.
    pub fn to_mutation(&self) -> WriteMutation<F> {
        WriteMutation::new(self.f.clone(), self.conversions)
    }
}

impl<K: CacheKey, V: CacheValue, F: WriteFunction<K, V>> Injectable for WriteOnlyMany<K, V, F> {
    fn inject(&mut self, registry: &ComponentRegistry) {
        self.f.inject(registry);
    }
}

impl<K: CacheKey, V: CacheValue, F: WriteFunction<K, V>> WriteCommand<K, V>
    for WriteOnlyMany<K, V, F>
{
    const NAME: &'static str = "write_only_many";

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
        LoadType::DontLoad
    }

    fn keys_to_lock(&self) -> Vec<&K> {
        if self.forwarded {
            Vec::new()
        } else {
            self.keys.iter().collect()
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

/// Applies a write-only function with per-key arguments to a set of
/// entries.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WriteOnlyManyEntries<K: Ord, V, F> {
    arguments: BTreeMap<K, V>,
    f: F,
    forwarded: bool,
    params: Params,
    conversions: DataConversions,
    matcher: ValueMatcher,
    header: WriteHeader,
}

impl<K: CacheKey, V: CacheValue, F: WriteWithValueFunction<K, V>> WriteOnlyManyEntries<K, V, F> {
    /// Builds the command from a key→argument mapping.
    pub fn new(
        arguments: BTreeMap<K, V>,
        f: F,
        conversions: DataConversions,
        header: WriteHeader,
    ) -> WriteOnlyManyEntries<K, V, F> {
        WriteOnlyManyEntries {
            arguments,
            f,
            forwarded: false,
            params: Params::from_flags(header.flags()),
            conversions,
            matcher: ValueMatcher::Always,
            header,
        }
    }

    /// The key→argument mapping.
    pub fn arguments(&self) -> &BTreeMap<K, V> {
        &self.arguments
    }

    /// Whether this copy was forwarded after being locked elsewhere.
    pub fn is_forwarded(&self) -> bool {
        self.forwarded
    }

    /// Runs the function against each key's entry with that key's argument.
    pub fn perform(&self, entries: &mut BTreeMap<K, CacheEntry<V>>) {
        for (key, argument) in &self.arguments {
            let entry = entries.entry(key.clone()).or_insert_with(CacheEntry::absent);
            self.f.apply(argument, &mut WriteView::new(key, entry));
        }
    }

    /// The replay token this command contributes for `key`, if `key` is one
    /// of its entries.
    pub fn to_mutation(&self, key: &K) -> Option<WriteWithValueMutation<V, F>> {
        self.arguments.get(key).map(|argument| {
            WriteWithValueMutation::new(argument.clone(), self.f.clone(), self.conversions)
        })
    }
}

impl<K: CacheKey, V: CacheValue, F: WriteWithValueFunction<K, V>> Injectable
    for WriteOnlyManyEntries<K, V, F>
{
    fn inject(&mut self, registry: &ComponentRegistry) {
        self.f.inject(registry);
    }
}

impl<K: CacheKey, V: CacheValue, F: WriteWithValueFunction<K, V>> WriteCommand<K, V>
    for WriteOnlyManyEntries<K, V, F>
{
    const NAME: &'static str = "write_only_many_entries";

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
        LoadType::DontLoad
    }

    fn keys_to_lock(&self) -> Vec<&K> {
        if self.forwarded {
            Vec::new()
        } else {
            self.arguments.keys().collect()
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

/// Applies a read-modify-write function to a set of entries.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ReadWriteMany<K, V, F> {
    keys: Vec<K>,
    f: F,
    forwarded: bool,
    params: Params,
    conversions: DataConversions,
    matcher: ValueMatcher,
    header: WriteHeader,
    _values: PhantomData<V>,
}

impl<K: CacheKey, V: CacheValue, F: ReadWriteFunction<K, V>> ReadWriteMany<K, V, F> {
    /// Builds the command over `keys`.
    pub fn new(
        keys: Vec<K>,
        f: F,
        conversions: DataConversions,
        header: WriteHeader,
    ) -> ReadWriteMany<K, V, F> {
        ReadWriteMany {
            keys,
            f,
            forwarded: false,
            params: Params::from_flags(header.flags()),
            conversions,
            matcher: ValueMatcher::Always,
            header,
            _values: PhantomData,
        }
    }

    /// The affected keys, in output order.
    pub fn keys(&self) -> &[K] {
        &self.keys
    }

    /// Whether this copy was forwarded after being locked elsewhere.
    pub fn is_forwarded(&self) -> bool {
        self.forwarded
    }

    /// Runs the function against each key's entry. Outputs are positionally
    /// aligned with [`ReadWriteMany::keys`].
    pub fn perform(&self, entries: &mut BTreeMap<K, CacheEntry<V>>) -> Vec<F::Out> {
        self.keys
            .iter()
            .map(|key| {
                let entry = entries.entry(key.clone()).or_insert_with(CacheEntry::absent);
                self.f.apply(&mut ReadWriteView::new(key, entry))
            })
            .collect()
    }

    /// The replay token this command contributes for any one of its keys.
    pub fn to_mutation(&self) -> ReadWriteMutation<F> {
        ReadWriteMutation::new(self.f.clone(), self.conversions)
    }
}

impl<K: CacheKey, V: CacheValue, F: ReadWriteFunction<K, V>> Injectable for ReadWriteMany<K, V, F> {
    fn inject(&mut self, registry: &ComponentRegistry) {
        self.f.inject(registry);
    }
}

impl<K: CacheKey, V: CacheValue, F: ReadWriteFunction<K, V>> WriteCommand<K, V>
    for ReadWriteMany<K, V, F>
{
    const NAME: &'static str = "read_write_many";

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
        if self.forwarded {
            Vec::new()
        } else {
            self.keys.iter().collect()
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

/// Applies a read-modify-write function with per-key arguments to a set of
/// entries.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ReadWriteManyEntries<K: Ord, V, F> {
    arguments: BTreeMap<K, V>,
    f: F,
    forwarded: bool,
    params: Params,
    conversions: DataConversions,
    matcher: ValueMatcher,
    header: WriteHeader,
}

impl<K: CacheKey, V: CacheValue, F: ReadWriteWithValueFunction<K, V>>
    ReadWriteManyEntries<K, V, F>
{
    /// Builds the command from a key→argument mapping.
    pub fn new(
        arguments: BTreeMap<K, V>,
        f: F,
        conversions: DataConversions,
        header: WriteHeader,
    ) -> ReadWriteManyEntries<K, V, F> {
        ReadWriteManyEntries {
            arguments,
            f,
            forwarded: false,
            params: Params::from_flags(header.flags()),
            conversions,
            matcher: ValueMatcher::Always,
            header,
        }
    }

    /// The key→argument mapping.
    pub fn arguments(&self) -> &BTreeMap<K, V> {
        &self.arguments
    }

    /// Whether this copy was forwarded after being locked elsewhere.
    pub fn is_forwarded(&self) -> bool {
        self.forwarded
    }

    /// Runs the function against each key's entry with that key's
    /// argument. Outputs follow the mapping's key order.
    pub fn perform(&self, entries: &mut BTreeMap<K, CacheEntry<V>>) -> Vec<F::Out> {
        self.arguments
            .iter()
            .map(|(key, argument)| {
                let entry = entries.entry(key.clone()).or_insert_with(CacheEntry::absent);
                self.f.apply(argument, &mut ReadWriteView::new(key, entry))
            })
            .collect()
    }

    /// The replay token this command contributes for `key`, if `key` is one
    /// of its entries.
    pub fn to_mutation(&self, key: &K) -> Option<ReadWriteWithValueMutation<V, F>> {
        self.arguments.get(key).map(|argument| {
            ReadWriteWithValueMutation::new(argument.clone(), self.f.clone(), self.conversions)
        })
    }
}

impl<K: CacheKey, V: CacheValue, F: ReadWriteWithValueFunction<K, V>> Injectable
    for ReadWriteManyEntries<K, V, F>
{
    fn inject(&mut self, registry: &ComponentRegistry) {
        self.f.inject(registry);
    }
}

impl<K: CacheKey, V: CacheValue, F: ReadWriteWithValueFunction<K, V>> WriteCommand<K, V>
    for ReadWriteManyEntries<K, V, F>
{
    const NAME: &'static str = "read_write_many_entries";

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
        if self.forwarded {
            Vec::new()
        } else {
            self.arguments.keys().collect()
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

/// A transactional read of one key.
///
/// Carries the transaction's pending mutations for the key, to be replayed
/// over a copy of the committed entry before the read function runs; the
/// read must observe the transaction's own writes without publishing them.
/// The mutation list is populated only when the command ships to another
/// node; purely local execution reads the transaction context directly and
/// never builds this command.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TxReadOnlyKey<K, V, F, M> {
    read: ReadOnlyKey<K, V, F>,
    mutations: Vec<M>,
}

impl<K, V, F, M> TxReadOnlyKey<K, V, F, M>
where
    K: CacheKey,
    V: CacheValue,
    F: ReadFunction<K, V>,
    M: Mutation<K, V>,
{
    /// Builds the command from a read and the transaction's pending
    /// mutations for the key, oldest first.
    pub fn new(read: ReadOnlyKey<K, V, F>, mutations: Vec<M>) -> TxReadOnlyKey<K, V, F, M> {
        TxReadOnlyKey { read, mutations }
    }

    /// The key to read.
    pub fn key(&self) -> &K {
        self.read.key()
    }

    /// Which owners must load prior state before the read runs.
    pub fn load_type(&self) -> LoadType {
        self.read.load_type()
    }

    /// Replays the pending mutations over a copy of `entry`, then runs the
    /// read function on the result. `entry` itself is never modified.
    pub fn perform(&self, entry: &CacheEntry<V>) -> F::Out {
        let mut staged = entry.clone();
        for mutation in &self.mutations {
            mutation.apply(self.read.key(), &mut staged);
        }
        self.read.perform(&staged)
    }
}

impl<K, V, F, M> Injectable for TxReadOnlyKey<K, V, F, M>
where
    K: CacheKey,
    V: CacheValue,
    F: ReadFunction<K, V>,
    M: Mutation<K, V>,
{
    fn inject(&mut self, registry: &ComponentRegistry) {
        self.read.inject(registry);
        for mutation in &mut self.mutations {
            mutation.inject(registry);
        }
    }
}

/// A transactional read of many keys.
///
/// Like [`TxReadOnlyKey`], but with one mutation list per key, paired
/// positionally with the key collection.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TxReadOnlyMany<K, V, F, M> {
    read: ReadOnlyMany<K, V, F>,
    mutations: Vec<Vec<M>>,
}

impl<K, V, F, M> TxReadOnlyMany<K, V, F, M>
where
    K: CacheKey,
    V: CacheValue,
    F: ReadFunction<K, V>,
    M: Mutation<K, V>,
{
    /// Builds the command. `mutations[i]` is the pending-mutation list for
    /// `read.keys()[i]`; the lists must align with the keys exactly.
    pub fn new(
        read: ReadOnlyMany<K, V, F>,
        mutations: Vec<Vec<M>>,
    ) -> Result<TxReadOnlyMany<K, V, F, M>, MutationListMismatch> {
        if read.keys().len() != mutations.len() {
            return Err(MutationListMismatch {
                keys: read.keys().len(),
                mutation_lists: mutations.len(),
            });
        }
        Ok(TxReadOnlyMany { read, mutations })
    }

    /// The keys to read, in output order.
    pub fn keys(&self) -> &[K] {
        self.read.keys()
    }

    /// Which owners must load prior state before the read runs.
    pub fn load_type(&self) -> LoadType {
        self.read.load_type()
    }

    /// Replays each key's pending mutations over a copy of its entry, then
    /// runs the read function. Outputs are positionally aligned with
    /// [`TxReadOnlyMany::keys`]; `entries` is never modified.
    pub fn perform(&self, entries: &BTreeMap<K, CacheEntry<V>>) -> Vec<F::Out> {
        let absent = CacheEntry::absent();
        self.read
            .keys()
            .iter()
            .zip_eq(&self.mutations)
            .map(|(key, mutations)| {
                let mut staged = entries.get(key).unwrap_or(&absent).clone();
                for mutation in mutations {
                    mutation.apply(key, &mut staged);
                }
                self.read.f.apply(ReadView::new(key, &staged))
            })
            .collect()
    }
}

impl<K, V, F, M> Injectable for TxReadOnlyMany<K, V, F, M>
where
    K: CacheKey,
    V: CacheValue,
    F: ReadFunction<K, V>,
    M: Mutation<K, V>,
{
    fn inject(&mut self, registry: &ComponentRegistry) {
        self.read.inject(registry);
        for list in &mut self.mutations {
            for mutation in list {
                mutation.inject(registry);
            }
        }
    }
}
