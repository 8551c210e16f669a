// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Per-invocation behavioral flags.
//!
//! Every cache write carries a [`FlagSet`]: a fixed-width bitset of switches
//! that other layers consult to short-circuit behavior (skip locking, don't
//! bother with return values, and so on). Flag membership tests are the
//! single authority for these decisions; nothing else re-derives them.
//!
//! A handful of flags only make sense on the node that issued the operation.
//! [`FlagSet::remotable`] strips those before a command is marshalled, so a
//! remote node can never observe a flag whose semantics are origin-local.

use std::fmt;
use std::ops::{BitOr, BitOrAssign};

use proptest::prelude::{Arbitrary, BoxedStrategy, Strategy, any};
use serde::{Deserialize, Serialize};

/// A single behavioral switch for a cache operation.
///
/// Each flag maps to one bit of a [`FlagSet`]. The discriminants are part of
/// the wire contract and must not be reordered.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(u32)]
pub enum Flag {
    /// Fail immediately if a key lock cannot be acquired, instead of waiting
    /// out the configured lock timeout. Origin-local.
    ZeroLockAcquisitionTimeout = 1 << 0,
    /// Execute against the local cache only; never replicate. Origin-local.
    CacheModeLocal = 1 << 1,
    /// Do not acquire key locks. The caller vouches for exclusivity.
    SkipLocking = 1 << 2,
    /// Acquire the write lock even for operations that normally read first.
    ForceWriteLock = 1 << 3,
    /// Swallow failures instead of surfacing them to the caller.
    /// Origin-local: a remote node honoring this would hide real errors
    /// from the primary.
    FailSilently = 1 << 4,
    /// Do not fetch a missing value from a remote owner before writing.
    SkipRemoteLookup = 1 << 5,
    /// The write caches data read from an external system; it may be
    /// dropped under contention rather than block.
    PutForExternalRead = 1 << 6,
    /// The write is part of state transfer, not a user operation.
    PutForStateTransfer = 1 << 7,
    /// Do not write through to the persistent store.
    SkipCacheStore = 1 << 8,
    /// Do not read through from the persistent store.
    SkipCacheLoad = 1 << 9,
    /// The caller does not need the previous value. Unconditional writes
    /// may then skip loading it entirely.
    IgnoreReturnValues = 1 << 10,
    /// Do not record statistics for this operation.
    SkipStatistics = 1 << 11,
    /// This command is a retransmission of an earlier attempt.
    CommandRetry = 1 << 12,
    /// Do not verify that this node owns the affected segment.
    SkipOwnershipCheck = 1 << 13,
}

impl Flag {
    /// All flags, in bit order.
    pub const ALL: [Flag; 14] = [
        Flag::ZeroLockAcquisitionTimeout,
        Flag::CacheModeLocal,
        Flag::SkipLocking,
        Flag::ForceWriteLock,
        Flag::FailSilently,
        Flag::SkipRemoteLookup,
        Flag::PutForExternalRead,
        Flag::PutForStateTransfer,
        Flag::SkipCacheStore,
        Flag::SkipCacheLoad,
        Flag::IgnoreReturnValues,
        Flag::SkipStatistics,
        Flag::CommandRetry,
        Flag::SkipOwnershipCheck,
    ];

    /// The wire name of this flag, for diagnostics.
    pub fn name(self) -> &'static str {
        match self {
            Flag::ZeroLockAcquisitionTimeout => "ZERO_LOCK_ACQUISITION_TIMEOUT",
            Flag::CacheModeLocal => "CACHE_MODE_LOCAL",
            Flag::SkipLocking => "SKIP_LOCKING",
            Flag::ForceWriteLock => "FORCE_WRITE_LOCK",
            Flag::FailSilently => "FAIL_SILENTLY",
            Flag::SkipRemoteLookup => "SKIP_REMOTE_LOOKUP",
            Flag::PutForExternalRead => "PUT_FOR_EXTERNAL_READ",
            Flag::PutForStateTransfer => "PUT_FOR_STATE_TRANSFER",
            Flag::SkipCacheStore => "SKIP_CACHE_STORE",
            Flag::SkipCacheLoad => "SKIP_CACHE_LOAD",
            Flag::IgnoreReturnValues => "IGNORE_RETURN_VALUES",
            Flag::SkipStatistics => "SKIP_STATISTICS",
            Flag::CommandRetry => "COMMAND_RETRY",
            Flag::SkipOwnershipCheck => "SKIP_OWNERSHIP_CHECK",
        }
    }

    fn bit(self) -> u32 {
        self as u32
    }
}

impl fmt::Display for Flag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A set of [`Flag`]s, stored as one `u32`.
///
/// Union, membership and subtraction are single bit operations. `FlagSet` is
/// a value type; commands treat their flag set as immutable after
/// construction except through the explicit setter used when rebuilding a
/// command for retry.
#[derive(
    Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct FlagSet(u32);

impl FlagSet {
    /// The set containing no flags.
    pub const EMPTY: FlagSet = FlagSet(0);

    /// Flags whose semantics are meaningful only on the originating node.
    /// [`FlagSet::remotable`] removes exactly these.
    const LOCAL_ONLY: FlagSet = FlagSet(
        Flag::FailSilently as u32
            | Flag::CacheModeLocal as u32
            | Flag::ZeroLockAcquisitionTimeout as u32,
    );

    const ALL: FlagSet = FlagSet((1 << 14) - 1);

    /// Constructs a set from raw bits, discarding bits that do not name a
    /// flag. Intended for decoding values that crossed the wire from an
    /// older or newer release.
    pub fn from_bits_truncate(bits: u32) -> FlagSet {
        FlagSet(bits & FlagSet::ALL.0)
    }

    /// The raw bit representation.
    pub fn bits(self) -> u32 {
        self.0
    }

    /// Whether `flag` is in the set.
    pub fn contains(self, flag: Flag) -> bool {
        self.0 & flag.bit() != 0
    }

    /// Whether every flag in `other` is in the set.
    pub fn contains_all(self, other: FlagSet) -> bool {
        self.0 & other.0 == other.0
    }

    /// Whether the set is empty.
    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Adds `flag` to the set.
    pub fn insert(&mut self, flag: Flag) {
        self.0 |= flag.bit();
    }

    /// Returns the union of the two sets.
    pub fn union(self, other: FlagSet) -> FlagSet {
        FlagSet(self.0 | other.0)
    }

    /// Returns the set with every flag in `other` removed.
    pub fn without(self, other: FlagSet) -> FlagSet {
        FlagSet(self.0 & !other.0)
    }

    /// Returns the subset that may accompany a command to a remote node.
    ///
    /// Origin-local flags are stripped; this must run before marshalling.
    pub fn remotable(self) -> FlagSet {
        self.without(FlagSet::LOCAL_ONLY)
    }

    /// Iterates over the flags in the set, in bit order.
    pub fn iter(self) -> impl Iterator<Item = Flag> {
        Flag::ALL.into_iter().filter(move |f| self.contains(*f))
    }
}

impl From<Flag> for FlagSet {
    fn from(flag: Flag) -> FlagSet {
        FlagSet(flag.bit())
    }
}

impl FromIterator<Flag> for FlagSet {
    fn from_iter<I: IntoIterator<Item = Flag>>(iter: I) -> FlagSet {
        let mut set = FlagSet::EMPTY;
        for flag in iter {
            set.insert(flag);
        }
        set
    }
}

impl BitOr for FlagSet {
    type Output = FlagSet;

    fn bitor(self, rhs: FlagSet) -> FlagSet {
        self.union(rhs)
    }
}

impl BitOr<Flag> for FlagSet {
    type Output = FlagSet;

    fn bitor(self, rhs: Flag) -> FlagSet {
        FlagSet(self.0 | rhs.bit())
    }
}

impl BitOr for Flag {
    type Output = FlagSet;

    fn bitor(self, rhs: Flag) -> FlagSet {
        FlagSet(self.bit() | rhs.bit())
    }
}

impl BitOrAssign<Flag> for FlagSet {
    fn bitor_assign(&mut self, rhs: Flag) {
        self.insert(rhs);
    }
}

impl fmt::Debug for FlagSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FlagSet({self})")
    }
}

impl fmt::Display for FlagSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return f.write_str("{}");
        }
        f.write_str("{")?;
        for (i, flag) in self.iter().enumerate() {
            if i > 0 {
                f.write_str("|")?;
            }
            f.write_str(flag.name())?;
        }
        f.write_str("}")
    }
}

impl Arbitrary for FlagSet {
    type Strategy = BoxedStrategy<FlagSet>;
    type Parameters = ();

    fn arbitrary_with(_: Self::Parameters) -> Self::Strategy {
        any::<u32>().prop_map(FlagSet::from_bits_truncate).boxed()
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    #[test]
    fn set_operations() {
        let mut set = FlagSet::EMPTY;
        assert!(set.is_empty());
        assert!(!set.contains(Flag::SkipLocking));

        set.insert(Flag::SkipLocking);
        set |= Flag::IgnoreReturnValues;
        assert!(set.contains(Flag::SkipLocking));
        assert!(set.contains(Flag::IgnoreReturnValues));
        assert!(!set.contains(Flag::CacheModeLocal));

        let other = Flag::SkipLocking | Flag::SkipCacheLoad;
        let union = set.union(other);
        assert!(union.contains_all(set));
        assert!(union.contains_all(other));

        let without = union.without(FlagSet::from(Flag::SkipLocking));
        assert!(!without.contains(Flag::SkipLocking));
        assert!(without.contains(Flag::SkipCacheLoad));
    }

    #[test]
    fn remotable_strips_origin_local_flags() {
        let set: FlagSet = [
            Flag::FailSilently,
            Flag::CacheModeLocal,
            Flag::ZeroLockAcquisitionTimeout,
            Flag::SkipLocking,
            Flag::IgnoreReturnValues,
        ]
        .into_iter()
        .collect();

        let remote = set.remotable();
        assert!(!remote.contains(Flag::FailSilently));
        assert!(!remote.contains(Flag::CacheModeLocal));
        assert!(!remote.contains(Flag::ZeroLockAcquisitionTimeout));
        assert!(remote.contains(Flag::SkipLocking));
        assert!(remote.contains(Flag::IgnoreReturnValues));
    }

    #[test]
    fn display_names() {
        let set = Flag::SkipLocking | Flag::CommandRetry;
        assert_eq!(set.to_string(), "{SKIP_LOCKING|COMMAND_RETRY}");
        assert_eq!(FlagSet::EMPTY.to_string(), "{}");
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn iter_agrees_with_contains(set: FlagSet) {
            let from_iter: FlagSet = set.iter().collect();
            prop_assert_eq!(from_iter, set);
            for flag in set.iter() {
                prop_assert!(set.contains(flag));
            }
        }

        #[test]
        fn truncate_is_idempotent(bits: u32) {
            let set = FlagSet::from_bits_truncate(bits);
            prop_assert_eq!(FlagSet::from_bits_truncate(set.bits()), set);
        }
    }
}
