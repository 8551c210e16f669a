// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Function-carrying cache operations.
//!
//! The functional API lets callers ship a function to the data instead of
//! moving the data to the function: read-only, write-only and
//! read-modify-write operations over one or many keys, each parameterized by
//! a user-supplied function that runs against an entry view on the owning
//! node.
//!
//! Functions here are values: they serialize, cross the wire, and come back
//! to life on another node. Anything a function needs beyond its own
//! captured state is re-bound after deserialization through the
//! [`Injectable`] hook; object identity never survives marshalling, so
//! functions must not capture live cache components.
//!
//! Submodules: [`views`] (the entry views functions run against),
//! [`commands`] (the command types), [`mutation`] (replayable records of
//! what a write-capable function did).

use std::fmt;

use hoard_types::flags::{Flag, FlagSet};
use hoard_types::id::NodeId;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::command::Message;

pub mod commands;
pub mod mutation;
pub mod views;

/// Ambient cache components a deserialized function may need.
///
/// Handed to [`Injectable::inject`] after a function value is deserialized
/// on a receiving node.
#[derive(Clone, Debug)]
pub struct ComponentRegistry {
    cache_name: String,
    node: NodeId,
}

impl ComponentRegistry {
    /// Constructs a registry for the named cache on `node`.
    pub fn new(cache_name: impl Into<String>, node: NodeId) -> ComponentRegistry {
        ComponentRegistry {
            cache_name: cache_name.into(),
            node,
        }
    }

    /// The cache the command targets.
    pub fn cache_name(&self) -> &str {
        &self.cache_name
    }

    /// The local node's identity.
    pub fn node(&self) -> NodeId {
        self.node
    }
}

/// The post-deserialization rebind hook.
///
/// Invoked exactly once on every function value (and on every command or
/// mutation carrying one) after it arrives on a node, before it first runs.
/// Implementations re-acquire whatever node-local dependencies they need;
/// functions without dependencies implement this as a no-op.
pub trait Injectable {
    /// Re-binds node-local dependencies.
    fn inject(&mut self, registry: &ComponentRegistry);
}

/// Umbrella bound for user functions carried by commands: cloneable,
/// printable, serializable, and re-bindable after deserialization.
pub trait SerializableFunction:
    fmt::Debug + Clone + Send + Sync + Serialize + DeserializeOwned + Injectable + 'static
{
}

impl<T> SerializableFunction for T where
    T: fmt::Debug + Clone + Send + Sync + Serialize + DeserializeOwned + Injectable + 'static
{
}

/// Computes a value for an absent key. Used by compute-if-absent.
pub trait MappingFunction<K, V>: SerializableFunction {
    /// Produces the value to store for `key`, or `None` to store nothing.
    fn apply(&self, key: &K) -> Option<V>;
}

/// Derives a new value from a key and its current value. Used by compute.
pub trait RemappingFunction<K, V>: SerializableFunction {
    /// Produces the value to store, or `None` to remove the entry.
    fn apply(&self, key: &K, current: Option<&V>) -> Option<V>;
}

/// A read-only function over an entry view.
pub trait ReadFunction<K, V>: SerializableFunction {
    /// What the function returns to the caller.
    type Out: Message + Clone;

    /// Runs against a read view of the entry.
    fn apply(&self, view: views::ReadView<'_, K, V>) -> Self::Out;
}

/// A write-only function over an entry view. It cannot observe the current
/// value, so no owner needs to load prior state before running it.
pub trait WriteFunction<K, V>: SerializableFunction {
    /// Runs against a write-only view of the entry.
    fn apply(&self, view: &mut views::WriteView<'_, K, V>);
}

/// A write-only function taking an auxiliary argument.
pub trait WriteWithValueFunction<K, V>: SerializableFunction {
    /// Runs against a write-only view with the command's argument.
    fn apply(&self, argument: &V, view: &mut views::WriteView<'_, K, V>);
}

/// A read-modify-write function over an entry view.
pub trait ReadWriteFunction<K, V>: SerializableFunction {
    /// What the function returns to the caller.
    type Out: Message + Clone;

    /// Runs against a read-write view of the entry.
    fn apply(&self, view: &mut views::ReadWriteView<'_, K, V>) -> Self::Out;
}

/// A read-modify-write function taking an auxiliary argument.
pub trait ReadWriteWithValueFunction<K, V>: SerializableFunction {
    /// What the function returns to the caller.
    type Out: Message + Clone;

    /// Runs against a read-write view with the command's argument.
    fn apply(&self, argument: &V, view: &mut views::ReadWriteView<'_, K, V>) -> Self::Out;
}

/// MIME-style tag describing how keys or values are represented.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum MediaType {
    /// In-process objects; no conversion.
    #[default]
    ApplicationObject,
    /// JSON text.
    ApplicationJson,
    /// Raw bytes.
    ApplicationOctetStream,
}

impl fmt::Display for MediaType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MediaType::ApplicationObject => "application/x-hoard-object",
            MediaType::ApplicationJson => "application/json",
            MediaType::ApplicationOctetStream => "application/octet-stream",
        };
        f.write_str(name)
    }
}

/// How one side (key or value) converts between the caller's representation
/// and storage. Captured at command build time and preserved into mutations
/// so replay uses the caller's conversions, not the replaying node's
/// defaults.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataConversion {
    /// The representation the caller requested, if any.
    pub requested: Option<MediaType>,
}

/// The key and value conversions of one functional operation.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataConversions {
    /// Key-side conversion.
    pub key: DataConversion,
    /// Value-side conversion.
    pub value: DataConversion,
}

/// Whether an operation contributes to cache statistics.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum StatisticsMode {
    /// Count the operation.
    #[default]
    Track,
    /// Leave statistics untouched.
    Skip,
}

/// How an operation interacts with the persistent store.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum PersistenceMode {
    /// Read through and write through.
    #[default]
    LoadPersist,
    /// Write through, but never read from the store.
    SkipLoad,
    /// Read through, but never write to the store.
    SkipPersist,
    /// Ignore the store entirely.
    Skip,
}

/// How an operation acquires key locks.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum LockingMode {
    /// Wait for the lock up to the configured timeout.
    #[default]
    Lock,
    /// Fail immediately if the lock is contended.
    TryLock,
    /// Do not lock at all.
    Skip,
}

/// Where an operation executes.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExecutionMode {
    /// On the owning nodes, wherever they are.
    #[default]
    Cluster,
    /// On the local node only; never replicate.
    Local,
}

/// Per-operation controls for the functional API.
///
/// Commands carry `Params` instead of re-reading flags at each decision
/// point; [`Params::from_flags`] is the single translation from the flag
/// world.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Params {
    /// Statistics behavior.
    pub statistics: StatisticsMode,
    /// Store behavior.
    pub persistence: PersistenceMode,
    /// Locking behavior.
    pub locking: LockingMode,
    /// Execution locality.
    pub execution: ExecutionMode,
}

impl Params {
    /// Derives functional params from a command flag set.
    pub fn from_flags(flags: FlagSet) -> Params {
        let statistics = if flags.contains(Flag::SkipStatistics) {
            StatisticsMode::Skip
        } else {
            StatisticsMode::Track
        };
        let persistence = match (
            flags.contains(Flag::SkipCacheLoad),
            flags.contains(Flag::SkipCacheStore),
        ) {
            (true, true) => PersistenceMode::Skip,
            (true, false) => PersistenceMode::SkipLoad,
            (false, true) => PersistenceMode::SkipPersist,
            (false, false) => PersistenceMode::LoadPersist,
        };
        let locking = if flags.contains(Flag::SkipLocking) {
            LockingMode::Skip
        } else if flags.contains(Flag::ZeroLockAcquisitionTimeout) {
            LockingMode::TryLock
        } else {
            LockingMode::Lock
        };
        let execution = if flags.contains(Flag::CacheModeLocal) {
            ExecutionMode::Local
        } else {
            ExecutionMode::Cluster
        };
        Params {
            statistics,
            persistence,
            locking,
            execution,
        }
    }
}
