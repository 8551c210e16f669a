// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! The anatomy shared by every write command.
//!
//! A write command binds an operation's payload to a [`WriteHeader`]: the
//! invocation identity, the topology generation the command was built
//! against, the segment its key hashes to, and the caller's behavioral
//! flags. The interceptor chain that executes commands never matches on
//! concrete types; it drives the closed set of operation kinds through the
//! [`WriteCommand`] and [`DataWriteCommand`] traits, each implemented once
//! per kind.

use std::fmt;

use hoard_types::entry::{CacheEntry, CacheKey, CacheValue};
use hoard_types::flags::{Flag, FlagSet};
use hoard_types::id::{CommandInvocationId, LockOwner};
use hoard_types::matcher::ValueMatcher;
use hoard_types::topology::{SegmentId, TopologyId};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// A trait for messages that can be handed to the transport layer.
///
/// The transport owns the wire encoding; this crate only guarantees that
/// everything it hands over satisfies these bounds.
pub trait Message: fmt::Debug + Send + Sync + Serialize + DeserializeOwned + 'static {}

impl<M> Message for M where M: fmt::Debug + Send + Sync + Serialize + DeserializeOwned + 'static {}

/// Which owners must fetch an entry's prior state before a command applies.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum LoadType {
    /// No owner needs the prior value.
    DontLoad,
    /// Only the primary owner needs it, to decide the outcome or produce
    /// the return value.
    PrimaryOnly,
    /// Every owner needs it, because the operation derives the new state
    /// from the old.
    AllOwners,
}

/// Decides whether a command must produce a return value.
///
/// This is the only place the rule lives: conditional commands always
/// produce one, because the caller needs the condition's outcome;
/// unconditional commands skip it when the caller set
/// [`Flag::IgnoreReturnValues`].
pub fn return_value_expected(conditional: bool, flags: FlagSet) -> bool {
    conditional || !flags.contains(Flag::IgnoreReturnValues)
}

fn default_successful() -> bool {
    true
}

/// State carried by every write command.
///
/// The invocation id and topology id are immutable after construction.
/// Flags are immutable too, except through [`WriteHeader::set_flags`], which
/// exists only for rebuilding a command when it is retried. The success flag
/// does not cross the wire: each arrival of the command re-evaluates it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteHeader {
    invocation: CommandInvocationId,
    topology: TopologyId,
    flags: FlagSet,
    #[serde(skip, default = "default_successful")]
    successful: bool,
}

impl WriteHeader {
    /// Constructs a header for a freshly-built command.
    pub fn new(
        invocation: CommandInvocationId,
        topology: TopologyId,
        flags: FlagSet,
    ) -> WriteHeader {
        WriteHeader {
            invocation,
            topology,
            flags,
            successful: true,
        }
    }

    /// The identity of this write invocation.
    pub fn invocation(&self) -> CommandInvocationId {
        self.invocation
    }

    /// The topology generation the command was built against.
    pub fn topology(&self) -> TopologyId {
        self.topology
    }

    /// The behavioral flags.
    pub fn flags(&self) -> FlagSet {
        self.flags
    }

    /// Replaces the flag set. Only command-rebuild paths (retries) may call
    /// this.
    pub fn set_flags(&mut self, flags: FlagSet) {
        self.flags = flags;
    }

    /// Whether the command has not (yet) failed its condition.
    pub fn is_successful(&self) -> bool {
        self.successful
    }

    /// Marks the command unsuccessful. Permanent: there is no way back.
    pub fn fail(&mut self) {
        self.successful = false;
    }

    /// A copy of this header fit for a remote node: origin-local flags
    /// stripped, success reset for re-evaluation at the receiver.
    pub fn remotable(&self) -> WriteHeader {
        WriteHeader {
            invocation: self.invocation,
            topology: self.topology,
            flags: self.flags.remotable(),
            successful: true,
        }
    }
}

/// Operations common to every write command, single- or multi-key.
///
/// One implementation exists per operation kind; together they form the
/// dispatch table the interceptor chain drives. `for_backup` is the heart of
/// the replication contract: it produces a new command value whose matcher
/// is [`ValueMatcher::PrimaryDecided`] and whose flags are filtered to the
/// remotable subset, leaving the original command untouched.
pub trait WriteCommand<K: CacheKey, V: CacheValue>: Message + Clone {
    /// The operation kind, for logs and metrics.
    const NAME: &'static str;

    /// The common header.
    fn header(&self) -> &WriteHeader;

    /// Mutable access to the common header.
    fn header_mut(&mut self) -> &mut WriteHeader;

    /// The matcher guarding the write.
    fn matcher(&self) -> ValueMatcher;

    /// Replaces the matcher. Exists only for the rebuild paths
    /// ([`WriteCommand::for_backup`], [`WriteCommand::for_retry`]), which
    /// call it on a fresh clone; constructed commands are otherwise
    /// immutable.
    fn set_matcher(&mut self, matcher: ValueMatcher);

    /// Whether the operation's outcome depends on the current value.
    ///
    /// Usually derived from the matcher; compute-if-absent overrides this
    /// because its condition lives in the operation itself.
    fn is_conditional(&self) -> bool {
        self.matcher().is_conditional()
    }

    /// Whether this command must produce a return value.
    fn returns_value(&self) -> bool {
        return_value_expected(self.is_conditional(), self.header().flags())
    }

    /// Which owners must load prior state before applying.
    fn load_type(&self) -> LoadType;

    /// The token under which this command holds key locks.
    fn lock_owner(&self) -> LockOwner {
        LockOwner::Invocation(self.header().invocation())
    }

    /// The keys this command must lock, in iteration order. Empty for
    /// commands that were forwarded after being locked elsewhere.
    fn keys_to_lock(&self) -> Vec<&K>;

    /// The command to forward to backup owners after the primary applied
    /// this one: same payload, already-decided matcher, remotable flags.
    /// The original command is left untouched.
    ///
    /// Multi-key commands override this to also mark the copy forwarded.
    fn for_backup(&self) -> Self {
        let mut backup = self.clone();
        backup.set_matcher(ValueMatcher::PrimaryDecided);
        *backup.header_mut() = self.header().remotable();
        backup
    }

    /// The command to send when this one is retried after a topology change
    /// or a lost response: the matcher relaxed per
    /// [`ValueMatcher::for_retry`] and [`Flag::CommandRetry`] set, so
    /// receivers can tell a retransmission from a first attempt.
    fn for_retry(&self) -> Self {
        let mut retry = self.clone();
        retry.set_matcher(self.matcher().for_retry());
        let flags = retry.header().flags() | Flag::CommandRetry;
        retry.header_mut().set_flags(flags);
        retry
    }
}

/// A write command affecting exactly one key.
pub trait DataWriteCommand<K: CacheKey, V: CacheValue>: WriteCommand<K, V> {
    /// The affected key.
    fn key(&self) -> &K;

    /// The segment the key hashes to.
    fn segment(&self) -> SegmentId;

    /// Applies the operation to the key's entry.
    ///
    /// This is the operation-specific logic the interceptor chain dispatches
    /// to after locking and loading per [`WriteCommand::load_type`]. On the
    /// primary it evaluates the matcher and, when the condition fails, marks
    /// the command unsuccessful and leaves the entry untouched. On backups
    /// the matcher is [`ValueMatcher::PrimaryDecided`] and the write applies
    /// against whatever state the backup holds.
    fn perform(&mut self, entry: &mut CacheEntry<V>) -> WriteResult<V>;
}

/// The outcome of performing a write against an entry.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WriteResult<V> {
    /// Whether the write applied.
    pub applied: bool,
    /// The operation's return value, when one was expected: the previous
    /// value for put/remove/replace, the resulting value for the compute
    /// family, the current value for a rejected put-if-absent.
    pub value: Option<V>,
}

impl<V> WriteResult<V> {
    /// An applied write returning `value`.
    pub fn applied(value: Option<V>) -> WriteResult<V> {
        WriteResult {
            applied: true,
            value,
        }
    }

    /// A write rejected by its matcher, returning `value`.
    pub fn rejected(value: Option<V>) -> WriteResult<V> {
        WriteResult {
            applied: false,
            value,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn return_value_rule() {
        let quiet = FlagSet::from(Flag::IgnoreReturnValues);
        // Conditional commands always produce a return value.
        assert!(return_value_expected(true, quiet));
        assert!(return_value_expected(true, FlagSet::EMPTY));
        // Unconditional commands honor the flag.
        assert!(!return_value_expected(false, quiet));
        assert!(return_value_expected(false, FlagSet::EMPTY));
    }

    #[test]
    fn fail_is_permanent() {
        let origin = hoard_types::id::NodeId::random();
        let mut header = WriteHeader::new(
            CommandInvocationId::generate(origin),
            TopologyId(1),
            FlagSet::EMPTY,
        );
        assert!(header.is_successful());
        header.fail();
        assert!(!header.is_successful());
    }

    #[test]
    fn remotable_header_strips_local_flags_and_resets_success() {
        let origin = hoard_types::id::NodeId::random();
        let mut header = WriteHeader::new(
            CommandInvocationId::generate(origin),
            TopologyId(3),
            Flag::FailSilently | Flag::SkipCacheStore,
        );
        header.fail();

        let remote = header.remotable();
        assert!(remote.is_successful());
        assert!(!remote.flags().contains(Flag::FailSilently));
        assert!(remote.flags().contains(Flag::SkipCacheStore));
        assert_eq!(remote.invocation(), header.invocation());
        assert_eq!(remote.topology(), header.topology());
    }
}
