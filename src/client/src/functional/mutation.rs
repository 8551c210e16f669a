// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Replayable records of what a write-capable function did.
//!
//! A [`Mutation`] is the marshallable essence of a functional write: the
//! function, its auxiliary argument if it had one, and the data-conversion
//! context it ran under, and nothing else. Applied on another node to a
//! freshly-constructed view of an entry holding the same prior value, it
//! reproduces the same resulting value and the same return value. No
//! node-local object identity is captured, so a mutation replays correctly
//! on any node after [`Injectable::inject`] re-binds its dependencies.

use hoard_types::entry::{CacheEntry, CacheKey, CacheValue};
use serde::{Deserialize, Serialize};

use crate::command::Message;
use crate::functional::views::{ReadWriteView, WriteView};
use crate::functional::{
    ComponentRegistry, DataConversions, Injectable, ReadWriteFunction,
    ReadWriteWithValueFunction, WriteFunction, WriteWithValueFunction,
};

/// A replayable functional write.
pub trait Mutation<K: CacheKey, V: CacheValue>: Message + Clone + Injectable {
    /// What applying the mutation returns (what the original command would
    /// have returned).
    type Out;

    /// Applies the mutation to `entry` under `key`.
    fn apply(&self, key: &K, entry: &mut CacheEntry<V>) -> Self::Out;
}

/// Replay token for a write-only function.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WriteMutation<F> {
    f: F,
    conversions: DataConversions,
}

impl<F> WriteMutation<F> {
    /// Constructs the token from the command's function and conversions.
    pub fn new(f: F, conversions: DataConversions) -> WriteMutation<F> {
        WriteMutation { f, conversions }
    }

    /// The conversions the function ran under.
    pub fn conversions(&self) -> DataConversions {
        self.conversions
    }
}

impl<F: Injectable> Injectable for WriteMutation<F> {
    fn inject(&mut self, registry: &ComponentRegistry) {
        self.f.inject(registry);
    }
}

impl<K: CacheKey, V: CacheValue, F: WriteFunction<K, V>> Mutation<K, V> for WriteMutation<F> {
    type Out = ();

    fn apply(&self, key: &K, entry: &mut CacheEntry<V>) {
        self.f.apply(&mut WriteView::new(key, entry));
    }
}

/// Replay token for a write-only function with an argument.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WriteWithValueMutation<V, F> {
    argument: V,
    f: F,
    conversions: DataConversions,
}

impl<V, F> WriteWithValueMutation<V, F> {
    /// Constructs the token.
    pub fn new(argument: V, f: F, conversions: DataConversions) -> WriteWithValueMutation<V, F> {
        WriteWithValueMutation {
            argument,
            f,
            conversions,
        }
    }
}

impl<V, F: Injectable> Injectable for WriteWithValueMutation<V, F> {
    fn inject(&mut self, registry: &ComponentRegistry) {
        self.f.inject(registry);
    }
}

impl<K: CacheKey, V: CacheValue, F: WriteWithValueFunction<K, V>> Mutation<K, V>
    for WriteWithValueMutation<V, F>
{
    type Out = ();

    fn apply(&self, key: &K, entry: &mut CacheEntry<V>) {
        self.f.apply(&self.argument, &mut WriteView::new(key, entry));
    }
}

/// Replay token for a read-modify-write function.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ReadWriteMutation<F> {
    f: F,
    conversions: DataConversions,
}

impl<F> ReadWriteMutation<F> {
    /// Constructs the token.
    pub fn new(f: F, conversions: DataConversions) -> ReadWriteMutation<F> {
        ReadWriteMutation { f, conversions }
    }
}

impl<F: Injectable> Injectable for ReadWriteMutation<F> {
    fn inject(&mut self, registry: &ComponentRegistry) {
        self.f.inject(registry);
    }
}

impl<K: CacheKey, V: CacheValue, F: ReadWriteFunction<K, V>> Mutation<K, V>
    for ReadWriteMutation<F>
{
    type Out = F::Out;

    fn apply(&self, key: &K, entry: &mut CacheEntry<V>) -> F::Out {
        self.f.apply(&mut ReadWriteView::new(key, entry))
    }
}

/// Replay token for a read-modify-write function with an argument.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ReadWriteWithValueMutation<V, F> {
    argument: V,
    f: F,
    conversions: DataConversions,
}

impl<V, F> ReadWriteWithValueMutation<V, F> {
    /// Constructs the token.
    pub fn new(
        argument: V,
        f: F,
        conversions: DataConversions,
    ) -> ReadWriteWithValueMutation<V, F> {
        ReadWriteWithValueMutation {
            argument,
            f,
            conversions,
        }
    }
}

impl<V, F: Injectable> Injectable for ReadWriteWithValueMutation<V, F> {
    fn inject(&mut self, registry: &ComponentRegistry) {
        self.f.inject(registry);
    }
}

impl<K: CacheKey, V: CacheValue, F: ReadWriteWithValueFunction<K, V>> Mutation<K, V>
    for ReadWriteWithValueMutation<V, F>
{
    type Out = F::Out;

    fn apply(&self, key: &K, entry: &mut CacheEntry<V>) -> F::Out {
        self.f.apply(&self.argument, &mut ReadWriteView::new(key, entry))
    }
}
