// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Clustered entry versions.
//!
//! Replicated caches stamp each entry with a [`ClusteredVersion`]: the
//! topology generation in which the write happened plus a counter within
//! that generation. Versions are totally ordered, topology first, so a write
//! from a later cluster generation always supersedes one from an earlier
//! generation regardless of counter values.

use std::cmp::Ordering;
use std::fmt;

use proptest::prelude::{Arbitrary, BoxedStrategy, Strategy, any};
use serde::{Deserialize, Serialize};

use crate::topology::TopologyId;

/// The version stamped on one cache entry by one write.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ClusteredVersion {
    topology: TopologyId,
    version: u64,
}

impl ClusteredVersion {
    /// Constructs a version.
    pub fn new(topology: TopologyId, version: u64) -> ClusteredVersion {
        ClusteredVersion { topology, version }
    }

    /// The topology generation this version was minted in.
    pub fn topology(&self) -> TopologyId {
        self.topology
    }

    /// The counter within the topology generation.
    pub fn version(&self) -> u64 {
        self.version
    }

    /// Three-way comparison against another version.
    pub fn relative_to(&self, other: &ClusteredVersion) -> VersionRelation {
        match self.cmp(other) {
            Ordering::Less => VersionRelation::Before,
            Ordering::Equal => VersionRelation::Equal,
            Ordering::Greater => VersionRelation::After,
        }
    }
}

impl PartialOrd for ClusteredVersion {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ClusteredVersion {
    fn cmp(&self, other: &Self) -> Ordering {
        let ClusteredVersion { topology, version } = self;
        let ClusteredVersion {
            topology: other_topology,
            version: other_version,
        } = other;
        match topology.cmp(other_topology) {
            Ordering::Equal => version.cmp(other_version),
            ordering => ordering,
        }
    }
}

impl fmt::Display for ClusteredVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.topology, self.version)
    }
}

impl Arbitrary for ClusteredVersion {
    type Strategy = BoxedStrategy<ClusteredVersion>;
    type Parameters = ();

    fn arbitrary_with(_: Self::Parameters) -> Self::Strategy {
        (any::<TopologyId>(), any::<u64>())
            .prop_map(|(topology, version)| ClusteredVersion::new(topology, version))
            .boxed()
    }
}

/// How one version stands relative to another.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum VersionRelation {
    /// The left version is older.
    Before,
    /// The versions are identical.
    Equal,
    /// The left version is newer.
    After,
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    #[test]
    fn topology_dominates_counter() {
        let early = ClusteredVersion::new(TopologyId(3), 100);
        let late = ClusteredVersion::new(TopologyId(4), 1);
        assert!(early < late);
        assert_eq!(early.relative_to(&late), VersionRelation::Before);
        assert_eq!(late.relative_to(&early), VersionRelation::After);
    }

    #[test]
    fn counter_orders_within_topology() {
        let a = ClusteredVersion::new(TopologyId(5), 1);
        let b = ClusteredVersion::new(TopologyId(5), 2);
        assert!(a < b);
        assert_eq!(a.relative_to(&a), VersionRelation::Equal);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn relation_agrees_with_ord(a: ClusteredVersion, b: ClusteredVersion) {
            let expected = match a.cmp(&b) {
                std::cmp::Ordering::Less => VersionRelation::Before,
                std::cmp::Ordering::Equal => VersionRelation::Equal,
                std::cmp::Ordering::Greater => VersionRelation::After,
            };
            prop_assert_eq!(a.relative_to(&b), expected);
        }
    }
}
