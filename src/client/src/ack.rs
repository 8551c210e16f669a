// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Acknowledgment messages for the backup replication path.
//!
//! After a backup owner applies a forwarded write it confirms directly to
//! the originating node, bypassing the primary. These are the confirmation
//! records that travel on that third side of the triangle: a plain ack for
//! single-key writes, a per-segment ack for multi-key writes, and an
//! exception ack wrapping the cause when the apply failed.
//!
//! Acks are addressed to the invocation's origin, so they carry only the
//! invocation's sequence number, not the full id. The cache name rides
//! along because one process hosts many caches and the receiving side must
//! route each ack to the right collector.

use std::fmt;

use hoard_types::id::NodeId;
use hoard_types::topology::{SegmentId, TopologyId};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A failure raised while a remote node applied a forwarded command.
///
/// Built on the failing node, shipped inside an [`ExceptionAck`], and
/// surfaced on the originator as the cause failing the caller's future.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, Error)]
#[error("remote apply failed on {origin}: {message}")]
pub struct RemoteCacheError {
    /// The node on which the apply failed.
    pub origin: NodeId,
    /// Human-readable description of the failure.
    pub message: String,
}

impl RemoteCacheError {
    /// Wraps a failure that occurred on `origin`.
    pub fn new(origin: NodeId, message: impl Into<String>) -> RemoteCacheError {
        RemoteCacheError {
            origin,
            message: message.into(),
        }
    }
}

/// Confirms that one backup owner applied a forwarded single-key write.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupAck {
    /// The cache the write targeted.
    pub cache_name: String,
    /// Sequence number of the acknowledged invocation.
    pub sequence: u64,
    /// The backup owner sending the confirmation.
    pub from: NodeId,
    /// The topology the backup applied the command under.
    pub topology: TopologyId,
}

impl BackupAck {
    /// Builds the confirmation `from` sends after applying `sequence`.
    pub fn new(
        cache_name: impl Into<String>,
        sequence: u64,
        from: NodeId,
        topology: TopologyId,
    ) -> BackupAck {
        BackupAck {
            cache_name: cache_name.into(),
            sequence,
            from,
            topology,
        }
    }
}

/// Confirms that one backup owner applied one segment's worth of a
/// forwarded multi-key write.
///
/// A backup owning several of the write's segments sends one of these per
/// segment, so the originator can track partial completion.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupMultiKeyAck {
    /// The cache the write targeted.
    pub cache_name: String,
    /// Sequence number of the acknowledged invocation.
    pub sequence: u64,
    /// The backup owner sending the confirmation.
    pub from: NodeId,
    /// The segment whose keys were applied.
    pub segment: SegmentId,
    /// The topology the backup applied the command under.
    pub topology: TopologyId,
}

impl BackupMultiKeyAck {
    /// Builds the confirmation `from` sends after applying `segment` of
    /// invocation `sequence`.
    pub fn new(
        cache_name: impl Into<String>,
        sequence: u64,
        from: NodeId,
        segment: SegmentId,
        topology: TopologyId,
    ) -> BackupMultiKeyAck {
        BackupMultiKeyAck {
            cache_name: cache_name.into(),
            sequence,
            from,
            segment,
            topology,
        }
    }
}

/// Reports that a backup owner failed to apply a forwarded write.
///
/// The failing node is recorded inside the carried error.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExceptionAck {
    /// The cache the write targeted.
    pub cache_name: String,
    /// Sequence number of the failed invocation.
    pub sequence: u64,
    /// What went wrong, and where.
    pub error: RemoteCacheError,
    /// The topology the backup attempted the command under.
    pub topology: TopologyId,
}

impl ExceptionAck {
    /// Builds the failure report for invocation `sequence`.
    pub fn new(
        cache_name: impl Into<String>,
        sequence: u64,
        error: RemoteCacheError,
        topology: TopologyId,
    ) -> ExceptionAck {
        ExceptionAck {
            cache_name: cache_name.into(),
            sequence,
            error,
            topology,
        }
    }
}

/// Any acknowledgment a backup owner can send to an originator.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum AckCommand {
    /// Single-key apply succeeded.
    Backup(BackupAck),
    /// One segment of a multi-key apply succeeded.
    MultiKey(BackupMultiKeyAck),
    /// The apply failed.
    Exception(ExceptionAck),
}

impl AckCommand {
    /// The cache the acknowledged write targeted.
    pub fn cache_name(&self) -> &str {
        match self {
            AckCommand::Backup(ack) => &ack.cache_name,
            AckCommand::MultiKey(ack) => &ack.cache_name,
            AckCommand::Exception(ack) => &ack.cache_name,
        }
    }

    /// Sequence number of the acknowledged invocation.
    pub fn sequence(&self) -> u64 {
        match self {
            AckCommand::Backup(ack) => ack.sequence,
            AckCommand::MultiKey(ack) => ack.sequence,
            AckCommand::Exception(ack) => ack.sequence,
        }
    }

    /// The topology the acknowledging node acted under.
    pub fn topology(&self) -> TopologyId {
        match self {
            AckCommand::Backup(ack) => ack.topology,
            AckCommand::MultiKey(ack) => ack.topology,
            AckCommand::Exception(ack) => ack.topology,
        }
    }

    /// Short tag naming the ack kind, for logs and metrics labels.
    pub fn kind(&self) -> &'static str {
        match self {
            AckCommand::Backup(_) => "backup",
            AckCommand::MultiKey(_) => "multi_key",
            AckCommand::Exception(_) => "exception",
        }
    }
}

impl From<BackupAck> for AckCommand {
    fn from(ack: BackupAck) -> AckCommand {
        AckCommand::Backup(ack)
    }
}

impl From<BackupMultiKeyAck> for AckCommand {
    fn from(ack: BackupMultiKeyAck) -> AckCommand {
        AckCommand::MultiKey(ack)
    }
}

impl From<ExceptionAck> for AckCommand {
    fn from(ack: ExceptionAck) -> AckCommand {
        AckCommand::Exception(ack)
    }
}

impl fmt::Display for AckCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AckCommand::Backup(ack) => {
                write!(
                    f,
                    "backup ack for {}#{} from {} at {}",
                    ack.cache_name, ack.sequence, ack.from, ack.topology
                )
            }
            AckCommand::MultiKey(ack) => {
                write!(
                    f,
                    "backup ack for {}#{} {} from {} at {}",
                    ack.cache_name, ack.sequence, ack.segment, ack.from, ack.topology
                )
            }
            AckCommand::Exception(ack) => {
                write!(
                    f,
                    "exception ack for {}#{} at {}: {}",
                    ack.cache_name, ack.sequence, ack.topology, ack.error
                )
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accessors_cover_all_kinds() {
        let node = NodeId::from_u128(7);
        let acks = [
            AckCommand::from(BackupAck::new("users", 42, node, TopologyId(3))),
            AckCommand::from(BackupMultiKeyAck::new(
                "users",
                42,
                node,
                SegmentId(5),
                TopologyId(3),
            )),
            AckCommand::from(ExceptionAck::new(
                "users",
                42,
                RemoteCacheError::new(node, "boom"),
                TopologyId(3),
            )),
        ];

        for ack in &acks {
            assert_eq!(ack.cache_name(), "users");
            assert_eq!(ack.sequence(), 42);
            assert_eq!(ack.topology(), TopologyId(3));
        }
        assert_eq!(acks[0].kind(), "backup");
        assert_eq!(acks[1].kind(), "multi_key");
        assert_eq!(acks[2].kind(), "exception");
    }

    #[test]
    fn remote_error_displays_origin() {
        let err = RemoteCacheError::new(NodeId::from_u128(9), "lock timeout");
        assert!(err.to_string().contains("lock timeout"));
        assert!(err.to_string().starts_with("remote apply failed on"));
    }
}
