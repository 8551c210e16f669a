// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Topology fencing.
//!
//! Ownership of keys shifts between nodes as the cluster rebalances; each
//! rebalance installs a new, strictly increasing topology id. A command
//! built against one topology must not run under another, so every
//! replicated command carries the topology id it was routed with and the
//! receiving node fences it on arrival:
//!
//! * command topology > local: the sender is ahead; hold the command until
//!   this node installs that topology, then admit it.
//! * command topology < local: a stale retransmission that was already
//!   superseded by a retry at the newer topology; drop it.
//! * equal: proceed.
//!
//! Entry-level invalidation gets a finer check: each stored value carries a
//! [`ClusteredVersion`], and an invalidation applies only if it strictly
//! supersedes the stored version (or ties with it and the invalidation
//! stems from a removal).

use std::cmp::Ordering;

use hoard_types::entry::CacheKey;
use hoard_types::topology::TopologyId;
use hoard_types::version::{ClusteredVersion, VersionRelation};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::metrics::ProtocolMetrics;

/// What to do with a command carrying a given topology id.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FenceDecision {
    /// The command's topology matches; run it.
    Proceed,
    /// The command is from a topology this node has not installed yet; hold
    /// it and retry once [`TopologyTracker::topology_reached`] resolves.
    Defer,
    /// The command is from a superseded topology; drop it without effect.
    Discard,
}

impl FenceDecision {
    /// Short tag naming the decision, for logs and metrics labels.
    pub fn name(self) -> &'static str {
        match self {
            FenceDecision::Proceed => "proceed",
            FenceDecision::Defer => "defer",
            FenceDecision::Discard => "discard",
        }
    }
}

/// A node's view of the current cache topology.
///
/// The distribution layer installs new topologies as rebalances complete;
/// command execution fences against the tracker and, when deferring, waits
/// on it.
#[derive(Debug)]
pub struct TopologyTracker {
    current: watch::Sender<TopologyId>,
    metrics: ProtocolMetrics,
}

impl TopologyTracker {
    /// Creates a tracker positioned at `initial`.
    pub fn new(initial: TopologyId, metrics: ProtocolMetrics) -> TopologyTracker {
        TopologyTracker {
            current: watch::Sender::new(initial),
            metrics,
        }
    }

    /// The topology this node currently operates under.
    pub fn current(&self) -> TopologyId {
        *self.current.borrow()
    }

    /// Installs a newly observed topology, waking deferred commands.
    ///
    /// Topology ids only move forward; an older id is ignored.
    pub fn install(&self, topology: TopologyId) {
        let installed = self.current.send_if_modified(|current| {
            if topology > *current {
                *current = topology;
                true
            } else {
                false
            }
        });
        if !installed && topology < self.current() {
            warn!(%topology, current = %self.current(), "ignoring topology regression");
        }
    }

    /// Fences a command built against `command_topology`.
    ///
    /// Discards are logged at debug; they are the expected fate of
    /// retransmissions that lost a race with a rebalance.
    pub fn admit(&self, command_topology: TopologyId) -> FenceDecision {
        let current = self.current();
        let decision = match command_topology.cmp(&current) {
            Ordering::Greater => FenceDecision::Defer,
            Ordering::Equal => FenceDecision::Proceed,
            Ordering::Less => {
                debug!(%command_topology, %current, "discarding command from a stale topology");
                FenceDecision::Discard
            }
        };
        self.metrics.record_fence(decision);
        decision
    }

    /// Resolves once this node has installed `topology` (or any newer one).
    pub async fn topology_reached(&self, topology: TopologyId) {
        let mut rx = self.current.subscribe();
        rx.wait_for(|current| *current >= topology)
            .await
            .map(|_| ())
            .expect("sender is held by the tracker");
    }
}

/// The interface invalidation needs from a store: per-key stored versions
/// and the ability to drop an entry.
pub trait VersionedContainer<K> {
    /// The version stored for `key`, if the key is present.
    fn version_of(&self, key: &K) -> Option<ClusteredVersion>;

    /// Drops `key` from the store.
    fn invalidate(&mut self, key: &K);
}

/// Invalidates entries whose stored versions are superseded.
///
/// Sent by an owner after writes or removals so that non-owning holders
/// (L1-style copies) drop stale values. Never creates entries and never
/// invalidates a value newer than the version it carries.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct InvalidateVersions<K> {
    topology: TopologyId,
    updates: Vec<(K, ClusteredVersion)>,
    removals: bool,
}

impl<K: CacheKey> InvalidateVersions<K> {
    /// Builds an invalidation for the given keys and the versions that
    /// superseded them. `removals` marks the versions as stemming from
    /// removals, which also invalidate exact version ties.
    pub fn new(
        topology: TopologyId,
        updates: Vec<(K, ClusteredVersion)>,
        removals: bool,
    ) -> InvalidateVersions<K> {
        InvalidateVersions {
            topology,
            updates,
            removals,
        }
    }

    /// The topology generation the command was built against.
    pub fn topology(&self) -> TopologyId {
        self.topology
    }

    /// Applies the invalidation to `container`, returning how many entries
    /// were dropped.
    pub fn perform<C: VersionedContainer<K>>(&self, container: &mut C) -> usize {
        let mut invalidated = 0;
        for (key, incoming) in &self.updates {
            let Some(stored) = container.version_of(key) else {
                continue;
            };
            let superseded = match stored.relative_to(incoming) {
                VersionRelation::Before => true,
                VersionRelation::Equal => self.removals,
                VersionRelation::After => false,
            };
            if superseded {
                container.invalidate(key);
                invalidated += 1;
            }
        }
        debug!(
            invalidated,
            carried = self.updates.len(),
            "applied version invalidation"
        );
        invalidated
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::sync::Arc;
    use std::time::Duration;

    use hoard_types::entry::{CacheEntry, Metadata};
    use hoard_types::flags::FlagSet;
    use hoard_types::id::{CommandInvocationId, NodeId};
    use hoard_types::topology::SegmentId;
    use prometheus::Registry;
    use proptest::prelude::*;

    use crate::command::{DataWriteCommand, WriteCommand, WriteHeader};
    use crate::write::Put;

    use super::*;

    fn tracker(initial: TopologyId) -> TopologyTracker {
        let metrics = ProtocolMetrics::register_into(&Registry::new());
        TopologyTracker::new(initial, metrics)
    }

    #[test]
    fn admit_compares_against_current() {
        let tracker = tracker(TopologyId(5));
        assert_eq!(tracker.admit(TopologyId(5)), FenceDecision::Proceed);
        assert_eq!(tracker.admit(TopologyId(6)), FenceDecision::Defer);
        assert_eq!(tracker.admit(TopologyId(4)), FenceDecision::Discard);
    }

    #[test]
    fn install_is_monotonic() {
        let tracker = tracker(TopologyId(5));
        tracker.install(TopologyId(7));
        assert_eq!(tracker.current(), TopologyId(7));
        tracker.install(TopologyId(6));
        assert_eq!(tracker.current(), TopologyId(7));
    }

    #[tokio::test]
    async fn deferred_command_wakes_on_install() {
        let tracker = Arc::new(tracker(TopologyId(1)));
        let header = WriteHeader::new(
            CommandInvocationId::generate(NodeId::random()),
            TopologyId(3),
            FlagSet::EMPTY,
        );
        let put = Put::new("k".to_string(), 9u64, SegmentId(0), Metadata::IMMORTAL, header);
        assert_eq!(tracker.admit(put.header().topology()), FenceDecision::Defer);

        let waiter = {
            let tracker = Arc::clone(&tracker);
            let mut put = put.clone();
            tokio::spawn(async move {
                tracker.topology_reached(put.header().topology()).await;
                assert_eq!(
                    tracker.admit(put.header().topology()),
                    FenceDecision::Proceed
                );
                let mut entry = CacheEntry::with_value(1u64);
                let result = put.perform(&mut entry);
                (result, entry)
            })
        };

        // Not woken by an intermediate topology.
        tracker.install(TopologyId(2));
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!waiter.is_finished());

        tracker.install(TopologyId(3));
        let (result, entry) = waiter.await.unwrap();

        // The deferred run matches direct delivery at the command's
        // topology.
        let mut direct_put = put;
        let mut direct_entry = CacheEntry::with_value(1u64);
        assert_eq!(result, direct_put.perform(&mut direct_entry));
        assert_eq!(entry, direct_entry);
    }

    #[tokio::test]
    async fn reached_resolves_immediately_when_already_installed() {
        let tracker = tracker(TopologyId(9));
        tracker.topology_reached(TopologyId(4)).await;
    }

    struct VersionedMap {
        entries: BTreeMap<String, (u64, ClusteredVersion)>,
    }

    impl VersionedContainer<String> for VersionedMap {
        fn version_of(&self, key: &String) -> Option<ClusteredVersion> {
            self.entries.get(key).map(|(_, version)| *version)
        }

        fn invalidate(&mut self, key: &String) {
            self.entries.remove(key);
        }
    }

    #[test]
    fn invalidation_respects_version_order() {
        let mut map = VersionedMap {
            entries: BTreeMap::from([
                ("old".to_string(), (1, ClusteredVersion::new(TopologyId(1), 3))),
                ("tied".to_string(), (2, ClusteredVersion::new(TopologyId(2), 5))),
                ("newer".to_string(), (3, ClusteredVersion::new(TopologyId(3), 1))),
            ]),
        };

        // A write-sourced invalidation drops strictly older versions only.
        let cmd = InvalidateVersions::new(
            TopologyId(3),
            vec![
                ("old".to_string(), ClusteredVersion::new(TopologyId(2), 1)),
                ("tied".to_string(), ClusteredVersion::new(TopologyId(2), 5)),
                ("newer".to_string(), ClusteredVersion::new(TopologyId(2), 9)),
                ("absent".to_string(), ClusteredVersion::new(TopologyId(2), 2)),
            ],
            false,
        );
        assert_eq!(cmd.perform(&mut map), 1);
        assert!(!map.entries.contains_key("old"));
        assert!(map.entries.contains_key("tied"));
        assert!(map.entries.contains_key("newer"));

        // A removal-sourced invalidation also drops exact ties.
        let cmd = InvalidateVersions::new(
            TopologyId(3),
            vec![("tied".to_string(), ClusteredVersion::new(TopologyId(2), 5))],
            true,
        );
        assert_eq!(cmd.perform(&mut map), 1);
        assert!(!map.entries.contains_key("tied"));
    }

    /// Invalidations for one key: at least one version newer than the
    /// stored `(t1, 5)`, with stale retransmissions mixed in anywhere.
    fn arrival_orders() -> impl Strategy<Value = Vec<ClusteredVersion>> {
        let newer = (6u64..20).prop_map(|c| ClusteredVersion::new(TopologyId(1), c));
        let stale = (0u64..5).prop_map(|c| ClusteredVersion::new(TopologyId(1), c));
        (
            proptest::collection::vec(newer, 1..4),
            proptest::collection::vec(stale, 0..3),
        )
            .prop_map(|(newer, stale)| newer.into_iter().chain(stale).collect::<Vec<_>>())
            .prop_shuffle()
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        // Whatever order the per-write invalidations arrive in, the entry
        // ends up gone and exactly one arrival removes it; the rest are
        // no-ops against either a newer version or an absent entry.
        #[test]
        fn shuffled_invalidations_converge(arrivals in arrival_orders()) {
            let stored = ClusteredVersion::new(TopologyId(1), 5);
            let mut map = VersionedMap {
                entries: BTreeMap::from([("k".to_string(), (7, stored))]),
            };

            let mut applied = 0;
            for version in arrivals {
                let cmd =
                    InvalidateVersions::new(TopologyId(2), vec![("k".to_string(), version)], false);
                applied += cmd.perform(&mut map);
            }
            prop_assert_eq!(applied, 1);
            prop_assert!(map.entries.is_empty());
        }
    }
}
