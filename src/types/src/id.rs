// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Identities for nodes, write invocations, and lock owners.
//!
//! A [`CommandInvocationId`] names one non-transactional write for its entire
//! lifetime: it owns the key locks the write takes, and it correlates the
//! backup acknowledgments the write's originator collects. Ids are minted
//! once, at command-build time, and travel unchanged through marshalling,
//! remote execution and acks.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use proptest::prelude::{Arbitrary, BoxedStrategy, Strategy, any};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// The identity of a cache node.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeId(Uuid);

impl NodeId {
    /// A fixed identity that no live node ever carries. Used by
    /// [`CommandInvocationId::DUMMY`].
    pub const NIL: NodeId = NodeId(Uuid::nil());

    /// Mints a fresh random node identity.
    pub fn random() -> NodeId {
        NodeId(Uuid::new_v4())
    }

    /// Constructs a node identity from raw bytes, for decoding.
    pub fn from_u128(bits: u128) -> NodeId {
        NodeId(Uuid::from_u128(bits))
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl Arbitrary for NodeId {
    type Strategy = BoxedStrategy<NodeId>;
    type Parameters = ();

    fn arbitrary_with(_: Self::Parameters) -> Self::Strategy {
        any::<u128>().prop_map(NodeId::from_u128).boxed()
    }
}

/// Sequence source for [`CommandInvocationId::generate`].
///
/// One counter per process, shared by every cache and key, never reset. It
/// starts above the dummy id's sequence so no generated id can collide with
/// the sentinel.
static SEQUENCE: AtomicU64 = AtomicU64::new(1);

/// The globally-unique identity of one write invocation.
///
/// Uniqueness comes from the pair: the origin node id is unique in the
/// cluster and the sequence is unique within the origin's process lifetime.
/// Equality and hashing cover both fields and nothing else.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CommandInvocationId {
    /// The node that built the command.
    pub origin: NodeId,
    /// Position in the origin's process-wide sequence.
    pub sequence: u64,
}

impl CommandInvocationId {
    /// The sentinel id carried by commands that execute inside a
    /// transaction. Such commands never own locks themselves (the
    /// transaction identity does) and never register with the
    /// acknowledgment collector.
    pub const DUMMY: CommandInvocationId = CommandInvocationId {
        origin: NodeId::NIL,
        sequence: 0,
    };

    /// Mints the next invocation id for `origin`.
    ///
    /// Safe to call from any number of threads; no id is ever issued twice
    /// within a process.
    pub fn generate(origin: NodeId) -> CommandInvocationId {
        let sequence = SEQUENCE.fetch_add(1, Ordering::SeqCst);
        CommandInvocationId { origin, sequence }
    }

    /// Whether this is the transactional sentinel.
    pub fn is_dummy(&self) -> bool {
        *self == CommandInvocationId::DUMMY
    }
}

impl fmt::Display for CommandInvocationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_dummy() {
            f.write_str("dummy")
        } else {
            write!(f, "{}#{}", self.origin, self.sequence)
        }
    }
}

/// The identity of a transaction, for writes whose locks are scoped to the
/// transaction rather than to a single command invocation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TransactionId {
    /// The node that started the transaction.
    pub origin: NodeId,
    /// Transaction number within the origin's process lifetime.
    pub number: u64,
}

impl TransactionId {
    /// Constructs a transaction identity.
    pub fn new(origin: NodeId, number: u64) -> TransactionId {
        TransactionId { origin, number }
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tx:{}:{}", self.origin, self.number)
    }
}

/// The token under which a write holds its key locks.
///
/// Non-transactional writes lock under their invocation id; transactional
/// writes lock under the transaction identity and carry the dummy
/// invocation id.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LockOwner {
    /// Locks held by one write invocation.
    Invocation(CommandInvocationId),
    /// Locks held for the duration of a transaction.
    Transaction(TransactionId),
}

impl fmt::Display for LockOwner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LockOwner::Invocation(id) => id.fmt(f),
            LockOwner::Transaction(id) => id.fmt(f),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::thread;

    use super::*;

    #[test]
    fn generated_ids_are_unique_across_threads() {
        const THREADS: usize = 8;
        const PER_THREAD: usize = 1_000;

        let origin = NodeId::random();
        let mut all = HashSet::new();
        thread::scope(|s| {
            let handles: Vec<_> = (0..THREADS)
                .map(|_| {
                    s.spawn(move || {
                        (0..PER_THREAD)
                            .map(|_| CommandInvocationId::generate(origin))
                            .collect::<Vec<_>>()
                    })
                })
                .collect();
            for handle in handles {
                for id in handle.join().unwrap() {
                    assert!(all.insert(id), "id {id} issued twice");
                }
            }
        });
        assert_eq!(all.len(), THREADS * PER_THREAD);
    }

    #[test]
    fn dummy_is_distinct_from_generated_ids() {
        let id = CommandInvocationId::generate(NodeId::random());
        assert!(!id.is_dummy());
        assert!(CommandInvocationId::DUMMY.is_dummy());
        assert_ne!(id, CommandInvocationId::DUMMY);

        // Even an id generated for the nil origin cannot collide with the
        // sentinel: the sequence starts at 1.
        let nil_origin = CommandInvocationId::generate(NodeId::NIL);
        assert_ne!(nil_origin, CommandInvocationId::DUMMY);
    }

    #[test]
    fn equality_covers_origin_and_sequence() {
        let a = NodeId::random();
        let b = NodeId::random();
        let one = CommandInvocationId {
            origin: a,
            sequence: 7,
        };
        assert_eq!(
            one,
            CommandInvocationId {
                origin: a,
                sequence: 7
            }
        );
        assert_ne!(
            one,
            CommandInvocationId {
                origin: b,
                sequence: 7
            }
        );
        assert_ne!(
            one,
            CommandInvocationId {
                origin: a,
                sequence: 8
            }
        );
    }

    #[test]
    fn display_forms() {
        let id = CommandInvocationId {
            origin: NodeId::from_u128(1),
            sequence: 42,
        };
        assert_eq!(id.to_string(), format!("{}#42", NodeId::from_u128(1)));
        assert_eq!(CommandInvocationId::DUMMY.to_string(), "dummy");
    }
}
