// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Primary→backup fan-out.
//!
//! Once a primary owner has applied a write and decided its outcome, the
//! [`BackupShipper`] replicates the decision: it registers the pending
//! acknowledgments with the collector, derives the already-decided command
//! copy, and hands one copy per backup owner to the transport. The backups
//! apply without re-evaluating the condition and acknowledge the
//! originator directly, which completes the returned [`AckFuture`].
//!
//! Registration happens before the first copy is sent, so an ack can never
//! race the collector entry into existence.

use std::collections::{BTreeMap, BTreeSet};

use async_trait::async_trait;
use futures::future::try_join_all;
use hoard_types::entry::{CacheKey, CacheValue};
use hoard_types::id::NodeId;
use hoard_types::topology::SegmentId;

use crate::collector::{AckCollector, AckFuture};
use crate::command::{Message, WriteCommand};
use crate::metrics::ProtocolMetrics;

/// Delivers protocol messages to cluster members.
///
/// Implementations serialize the typed message and move the bytes; the
/// protocol guarantees that commands handed over here already carry their
/// remotable flag subset.
#[async_trait]
pub trait BackupTransport: Send + Sync {
    /// Delivers `message` to `target`. Resolving does not imply the target
    /// processed the message, only that it was handed to the link.
    async fn send<M: Message>(&self, target: NodeId, message: M) -> Result<(), anyhow::Error>;
}

/// Replicates decided writes from a primary owner to its backups.
#[derive(Debug)]
pub struct BackupShipper<X> {
    transport: X,
    metrics: ProtocolMetrics,
}

impl<X: BackupTransport> BackupShipper<X> {
    /// Creates a shipper sending over `transport`.
    pub fn new(transport: X, metrics: ProtocolMetrics) -> BackupShipper<X> {
        BackupShipper { transport, metrics }
    }

    /// Replicates a decided single-key write to `backups`.
    ///
    /// Registers the collector entry, then fans the backup copy out to
    /// every owner. A transport failure fails the write: the error
    /// propagates and the dropped future retires the collector entry, so
    /// any acks from owners that were reached land on nothing.
    pub async fn ship<K, V, C, T>(
        &self,
        command: &C,
        backups: &BTreeSet<NodeId>,
        collector: &AckCollector<T>,
    ) -> Result<AckFuture<T>, anyhow::Error>
    where
        K: CacheKey,
        V: CacheValue,
        C: WriteCommand<K, V>,
    {
        let header = command.header();
        let future = collector.register(
            header.invocation().sequence,
            header.topology(),
            backups.clone(),
        );
        self.metrics.record_command(C::NAME);

        let backup = command.for_backup();
        let sends = backups.iter().map(|target| {
            let copy = backup.clone();
            async move {
                self.transport.send(*target, copy).await?;
                self.metrics.record_backup_copy(C::NAME);
                Ok::<_, anyhow::Error>(())
            }
        });
        try_join_all(sends).await?;
        Ok(future)
    }

    /// Replicates a decided multi-key write.
    ///
    /// `backups` maps each backup owner to the write's segments it owns;
    /// the owner is expected to ack each of those segments individually.
    pub async fn ship_segmented<K, V, C, T>(
        &self,
        command: &C,
        backups: &BTreeMap<NodeId, BTreeSet<SegmentId>>,
        collector: &AckCollector<T>,
    ) -> Result<AckFuture<T>, anyhow::Error>
    where
        K: CacheKey,
        V: CacheValue,
        C: WriteCommand<K, V>,
    {
        let header = command.header();
        let future = collector.register_segmented(
            header.invocation().sequence,
            header.topology(),
            backups.clone(),
        );
        self.metrics.record_command(C::NAME);

        let backup = command.for_backup();
        let sends = backups.keys().map(|target| {
            let copy = backup.clone();
            async move {
                self.transport.send(*target, copy).await?;
                self.metrics.record_backup_copy(C::NAME);
                Ok::<_, anyhow::Error>(())
            }
        });
        try_join_all(sends).await?;
        Ok(future)
    }
}
