// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! The acknowledgment collector.
//!
//! One collector lives on each node per cache and tracks that node's
//! in-flight replicated writes. A write registers an entry keyed by its
//! invocation sequence number before any copy leaves the node; the entry
//! records which backup owners still owe acknowledgments (per segment, for
//! multi-key writes) and, once it arrives, the primary's result. The
//! caller's [`AckFuture`] resolves when the primary result is in and every
//! expected ack has arrived, or fails on the first exception ack.
//!
//! Acks arrive concurrently from network threads; the in-flight map is
//! sharded and each entry completes exactly once. Entries are retired on
//! completion, on timeout, and when the caller drops the future, so acks
//! for retired invocations find nothing and are dropped where they stand.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use dashmap::DashMap;
use hoard_types::id::NodeId;
use hoard_types::topology::{SegmentId, TopologyId};
use thiserror::Error;
use tokio::sync::oneshot;
use tokio::time::Sleep;
use tracing::{debug, warn};

use crate::ack::{AckCommand, RemoteCacheError};
use crate::config::ProtocolConfig;
use crate::metrics::ProtocolMetrics;

/// Why a replicated write did not complete cleanly.
#[derive(Error, Debug)]
pub enum AckError {
    /// A backup owner reported a failure, or an owner the write was waiting
    /// on left the cluster.
    #[error(transparent)]
    Remote(#[from] RemoteCacheError),
    /// Not every expected ack arrived in time.
    #[error("timed out after {timeout:?} waiting for backup acks of invocation {sequence}")]
    Timeout {
        /// Sequence number of the abandoned invocation.
        sequence: u64,
        /// The configured ack timeout.
        timeout: Duration,
    },
    /// The collector no longer tracks the invocation. Seen when a
    /// registration is overwritten or the collector is torn down.
    #[error("no longer awaiting acks for invocation {sequence}")]
    Abandoned {
        /// Sequence number of the abandoned invocation.
        sequence: u64,
    },
}

/// The acks one in-flight write still owes.
#[derive(Debug)]
enum Expected {
    /// One ack per backup owner.
    SingleKey(BTreeSet<NodeId>),
    /// One ack per (backup owner, owned segment) pair.
    MultiKey(BTreeMap<NodeId, BTreeSet<SegmentId>>),
}

impl Expected {
    fn is_empty(&self) -> bool {
        match self {
            Expected::SingleKey(pending) => pending.is_empty(),
            Expected::MultiKey(pending) => pending.is_empty(),
        }
    }

    /// A pending owner that is not in `members`, if any.
    fn departed_member(&self, members: &BTreeSet<NodeId>) -> Option<NodeId> {
        match self {
            Expected::SingleKey(pending) => {
                pending.iter().find(|node| !members.contains(node)).copied()
            }
            Expected::MultiKey(pending) => {
                pending.keys().find(|node| !members.contains(node)).copied()
            }
        }
    }
}

struct InFlight<T> {
    topology: TopologyId,
    expected: Expected,
    primary: Option<T>,
    tx: Option<oneshot::Sender<Result<T, RemoteCacheError>>>,
}

impl<T> InFlight<T> {
    /// Extracts the sender and value iff the entry is ready to complete.
    /// Leaves the entry untouched otherwise, in particular keeping the
    /// sender alive while the primary result is still outstanding.
    fn take_ready(&mut self) -> Option<(oneshot::Sender<Result<T, RemoteCacheError>>, T)> {
        if self.expected.is_empty() && self.tx.is_some() && self.primary.is_some() {
            self.tx.take().zip(self.primary.take())
        } else {
            None
        }
    }
}

struct CollectorInner<T> {
    cache_name: String,
    in_flight: DashMap<u64, InFlight<T>>,
    timeout: Duration,
    metrics: ProtocolMetrics,
}

fn retire_entry<T>(inner: &CollectorInner<T>, sequence: u64) {
    if inner.in_flight.remove(&sequence).is_some() {
        inner.metrics.collector_entry_retired();
    }
}

/// Tracks in-flight replicated writes for one cache and completes their
/// futures as acknowledgments arrive.
pub struct AckCollector<T> {
    inner: Arc<CollectorInner<T>>,
}

impl<T> Clone for AckCollector<T> {
    fn clone(&self) -> AckCollector<T> {
        AckCollector {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> fmt::Debug for AckCollector<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AckCollector")
            .field("cache_name", &self.inner.cache_name)
            .field("in_flight", &self.inner.in_flight.len())
            .finish_non_exhaustive()
    }
}

impl<T> AckCollector<T> {
    /// Creates the collector for the named cache.
    pub fn new(
        cache_name: impl Into<String>,
        config: &ProtocolConfig,
        metrics: ProtocolMetrics,
    ) -> AckCollector<T> {
        let in_flight = match config.collector_shards {
            Some(shards) => DashMap::with_shard_amount(shards),
            None => DashMap::new(),
        };
        AckCollector {
            inner: Arc::new(CollectorInner {
                cache_name: cache_name.into(),
                in_flight,
                timeout: config.ack_timeout,
                metrics,
            }),
        }
    }

    /// The cache this collector serves.
    pub fn cache_name(&self) -> &str {
        &self.inner.cache_name
    }

    /// Number of writes currently awaiting acknowledgments.
    pub fn pending(&self) -> usize {
        self.inner.in_flight.len()
    }

    /// Starts tracking a single-key write that expects one ack from each of
    /// `backups`. Must be called before any command copy leaves the node.
    pub fn register(
        &self,
        sequence: u64,
        topology: TopologyId,
        backups: BTreeSet<NodeId>,
    ) -> AckFuture<T> {
        self.insert(sequence, topology, Expected::SingleKey(backups))
    }

    /// Starts tracking a multi-key write that expects one ack per owned
    /// segment from each backup in `backups`.
    pub fn register_segmented(
        &self,
        sequence: u64,
        topology: TopologyId,
        backups: BTreeMap<NodeId, BTreeSet<SegmentId>>,
    ) -> AckFuture<T> {
        let backups = backups
            .into_iter()
            .filter(|(_, segments)| !segments.is_empty())
            .collect();
        self.insert(sequence, topology, Expected::MultiKey(backups))
    }

    fn insert(&self, sequence: u64, topology: TopologyId, expected: Expected) -> AckFuture<T> {
        let (tx, rx) = oneshot::channel();
        let entry = InFlight {
            topology,
            expected,
            primary: None,
            tx: Some(tx),
        };
        if self.inner.in_flight.insert(sequence, entry).is_some() {
            warn!(sequence, "replaced an in-flight invocation; sequences must not repeat");
        } else {
            self.inner.metrics.collector_entry_created();
        }
        AckFuture {
            sequence,
            rx,
            timeout: self.inner.timeout,
            sleep: None,
            finished: false,
            inner: Arc::clone(&self.inner),
        }
    }

    /// Delivers the primary owner's result for a tracked write.
    ///
    /// An unsuccessful result means the primary rejected the write without
    /// engaging the backups, so the future completes at once; a successful
    /// one completes the future as soon as all expected acks are in.
    pub fn primary_result(&self, sequence: u64, value: T, successful: bool) {
        let fired = {
            let Some(mut entry) = self.inner.in_flight.get_mut(&sequence) else {
                debug!(sequence, "primary result for an untracked invocation");
                return;
            };
            entry.primary = Some(value);
            if successful {
                entry.take_ready()
            } else {
                entry.tx.take().zip(entry.primary.take())
            }
        };
        if let Some((tx, value)) = fired {
            retire_entry(&self.inner, sequence);
            let _ = tx.send(Ok(value));
        }
    }

    /// Records a single-key ack from a backup owner.
    pub fn backup_ack(&self, sequence: u64, from: NodeId, topology: TopologyId) {
        let fired = {
            let Some(mut entry) = self.inner.in_flight.get_mut(&sequence) else {
                debug!(sequence, from = %from, "ack for an untracked invocation");
                self.inner.metrics.record_ignored_ack();
                return;
            };
            if entry.topology != topology {
                warn!(
                    sequence,
                    from = %from,
                    acked = %topology,
                    expected = %entry.topology,
                    "ignoring ack from a mismatched topology"
                );
                self.inner.metrics.record_ignored_ack();
                return;
            }
            let removed = match &mut entry.expected {
                Expected::SingleKey(pending) => pending.remove(&from),
                Expected::MultiKey(_) => false,
            };
            if !removed {
                debug!(sequence, from = %from, "duplicate or unexpected backup ack");
                self.inner.metrics.record_ignored_ack();
                return;
            }
            self.inner.metrics.record_ack("backup");
            entry.take_ready()
        };
        if let Some((tx, value)) = fired {
            retire_entry(&self.inner, sequence);
            let _ = tx.send(Ok(value));
        }
    }

    /// Records a per-segment ack from a backup owner of a multi-key write.
    pub fn multi_key_backup_ack(
        &self,
        sequence: u64,
        from: NodeId,
        segment: SegmentId,
        topology: TopologyId,
    ) {
        let fired = {
            let Some(mut entry) = self.inner.in_flight.get_mut(&sequence) else {
                debug!(sequence, from = %from, %segment, "ack for an untracked invocation");
                self.inner.metrics.record_ignored_ack();
                return;
            };
            if entry.topology != topology {
                warn!(
                    sequence,
                    from = %from,
                    acked = %topology,
                    expected = %entry.topology,
                    "ignoring ack from a mismatched topology"
                );
                self.inner.metrics.record_ignored_ack();
                return;
            }
            let removed = match &mut entry.expected {
                Expected::MultiKey(pending) => {
                    let removed = match pending.get_mut(&from) {
                        Some(segments) => segments.remove(&segment),
                        None => false,
                    };
                    if removed && pending.get(&from).map_or(false, |s| s.is_empty()) {
                        pending.remove(&from);
                    }
                    removed
                }
                Expected::SingleKey(_) => false,
            };
            if !removed {
                debug!(sequence, from = %from, %segment, "duplicate or unexpected backup ack");
                self.inner.metrics.record_ignored_ack();
                return;
            }
            self.inner.metrics.record_ack("multi_key");
            entry.take_ready()
        };
        if let Some((tx, value)) = fired {
            retire_entry(&self.inner, sequence);
            let _ = tx.send(Ok(value));
        }
    }

    /// Fails a tracked write with a remote cause. Terminal: once fired,
    /// further acks for the invocation find nothing.
    pub fn complete_exceptionally(
        &self,
        sequence: u64,
        error: RemoteCacheError,
        topology: TopologyId,
    ) {
        {
            let Some(entry) = self.inner.in_flight.get(&sequence) else {
                debug!(sequence, "exception ack for an untracked invocation");
                self.inner.metrics.record_ignored_ack();
                return;
            };
            if entry.topology != topology {
                warn!(
                    sequence,
                    acked = %topology,
                    expected = %entry.topology,
                    "ignoring exception ack from a mismatched topology"
                );
                self.inner.metrics.record_ignored_ack();
                return;
            }
        }
        self.inner.metrics.record_ack("exception");
        self.fail(sequence, error);
    }

    /// Routes a received ack command to the matching handler.
    pub fn handle(&self, ack: AckCommand) {
        if ack.cache_name() != self.inner.cache_name {
            warn!(
                cache = ack.cache_name(),
                expected = %self.inner.cache_name,
                "ack routed to the wrong cache"
            );
            self.inner.metrics.record_ignored_ack();
            return;
        }
        match ack {
            AckCommand::Backup(ack) => self.backup_ack(ack.sequence, ack.from, ack.topology),
            AckCommand::MultiKey(ack) => {
                self.multi_key_backup_ack(ack.sequence, ack.from, ack.segment, ack.topology)
            }
            AckCommand::Exception(ack) => {
                self.complete_exceptionally(ack.sequence, ack.error, ack.topology)
            }
        }
    }

    /// Reacts to a cluster membership change: any write still waiting on an
    /// owner that is no longer a member can never complete and fails now.
    pub fn on_members_change(&self, members: &BTreeSet<NodeId>) {
        let orphaned: Vec<(u64, NodeId)> = self
            .inner
            .in_flight
            .iter()
            .filter_map(|entry| {
                entry
                    .value()
                    .expected
                    .departed_member(members)
                    .map(|node| (*entry.key(), node))
            })
            .collect();
        for (sequence, node) in orphaned {
            debug!(sequence, departed = %node, "failing in-flight write after owner departure");
            self.fail(
                sequence,
                RemoteCacheError::new(node, "backup owner left the cluster"),
            );
        }
    }

    fn fail(&self, sequence: u64, error: RemoteCacheError) {
        let fired = {
            let Some(mut entry) = self.inner.in_flight.get_mut(&sequence) else {
                return;
            };
            entry.tx.take()
        };
        if let Some(tx) = fired {
            retire_entry(&self.inner, sequence);
            let _ = tx.send(Err(error));
        }
    }
}

/// Resolves when a replicated write's acknowledgments are all in.
///
/// Times out after the configured ack timeout. Dropping the future retires
/// the collector entry, so acks arriving afterwards are no-ops.
pub struct AckFuture<T> {
    sequence: u64,
    rx: oneshot::Receiver<Result<T, RemoteCacheError>>,
    timeout: Duration,
    sleep: Option<Pin<Box<Sleep>>>,
    finished: bool,
    inner: Arc<CollectorInner<T>>,
}

impl<T> AckFuture<T> {
    /// Sequence number of the awaited invocation.
    pub fn sequence(&self) -> u64 {
        self.sequence
    }
}

impl<T> fmt::Debug for AckFuture<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AckFuture")
            .field("sequence", &self.sequence)
            .field("finished", &self.finished)
            .finish_non_exhaustive()
    }
}

impl<T> Future for AckFuture<T> {
    type Output = Result<T, AckError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        match Pin::new(&mut this.rx).poll(cx) {
            Poll::Ready(Ok(Ok(value))) => {
                this.finished = true;
                Poll::Ready(Ok(value))
            }
            Poll::Ready(Ok(Err(remote))) => {
                this.finished = true;
                Poll::Ready(Err(AckError::Remote(remote)))
            }
            Poll::Ready(Err(_)) => {
                this.finished = true;
                Poll::Ready(Err(AckError::Abandoned {
                    sequence: this.sequence,
                }))
            }
            Poll::Pending => {
                let timeout = this.timeout;
                // The timer starts on first poll, not at registration, so
                // registering outside a runtime is fine.
                let sleep = this
                    .sleep
                    .get_or_insert_with(|| Box::pin(tokio::time::sleep(timeout)));
                match sleep.as_mut().poll(cx) {
                    Poll::Ready(()) => {
                        this.finished = true;
                        retire_entry(&this.inner, this.sequence);
                        Poll::Ready(Err(AckError::Timeout {
                            sequence: this.sequence,
                            timeout,
                        }))
                    }
                    Poll::Pending => Poll::Pending,
                }
            }
        }
    }
}

impl<T> Drop for AckFuture<T> {
    fn drop(&mut self) {
        if !self.finished {
            retire_entry(&self.inner, self.sequence);
        }
    }
}
