// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Cluster topology and key-space segment identifiers.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Identifies one generation of cluster membership and ownership.
///
/// Topology ids are issued by the coordinator in strictly increasing order;
/// a larger id always denotes a later generation. Commands record the id
/// they were built against so receivers can fence them (defer commands from
/// the future, discard stale retransmissions).
#[derive(
    Clone,
    Copy,
    Debug,
    Default,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    proptest_derive::Arbitrary,
)]
pub struct TopologyId(pub u64);

impl TopologyId {
    /// The topology id following this one.
    pub fn next(self) -> TopologyId {
        TopologyId(self.0 + 1)
    }
}

impl fmt::Display for TopologyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "t{}", self.0)
    }
}

/// Identifies one segment of the hashed key space.
///
/// Ownership is assigned per segment; multi-key commands report progress to
/// the acknowledgment collector per segment.
#[derive(
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    proptest_derive::Arbitrary,
)]
pub struct SegmentId(pub u32);

impl fmt::Display for SegmentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "s{}", self.0)
    }
}
