// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Prometheus instrumentation for the write protocol.
//!
//! One [`ProtocolMetrics`] is registered per process and shared by the
//! shipper, the ack collector and the topology tracker. Counter families
//! are labeled by command or ack kind; the pending gauge tracks live
//! collector entries.

use prometheus::{IntCounter, IntCounterVec, IntGauge, Opts, Registry};

use crate::fencing::FenceDecision;

/// Handles on every metric the protocol emits.
///
/// Cheap to clone; clones share the underlying metric state.
#[derive(Clone, Debug)]
pub struct ProtocolMetrics {
    commands_total: IntCounterVec,
    backup_copies_sent_total: IntCounterVec,
    backup_acks_total: IntCounterVec,
    backup_acks_ignored_total: IntCounter,
    pending_ack_collectors: IntGauge,
    fencing_decisions_total: IntCounterVec,
}

fn counter_vec(registry: &Registry, name: &str, help: &str, labels: &[&str]) -> IntCounterVec {
    let metric = IntCounterVec::new(Opts::new(name, help), labels).expect("valid metric options");
    registry
        .register(Box::new(metric.clone()))
        .expect("metric registered once");
    metric
}

fn counter(registry: &Registry, name: &str, help: &str) -> IntCounter {
    let metric = IntCounter::new(name, help).expect("valid metric options");
    registry
        .register(Box::new(metric.clone()))
        .expect("metric registered once");
    metric
}

fn gauge(registry: &Registry, name: &str, help: &str) -> IntGauge {
    let metric = IntGauge::new(name, help).expect("valid metric options");
    registry
        .register(Box::new(metric.clone()))
        .expect("metric registered once");
    metric
}

impl ProtocolMetrics {
    /// Builds the protocol metrics and registers them with `registry`.
    ///
    /// Panics if any metric is already registered; each registry admits one
    /// `ProtocolMetrics`.
    pub fn register_into(registry: &Registry) -> ProtocolMetrics {
        ProtocolMetrics {
            commands_total: counter_vec(
                registry,
                "hoard_write_commands_total",
                "Write commands replicated to backup owners, by command kind.",
                &["kind"],
            ),
            backup_copies_sent_total: counter_vec(
                registry,
                "hoard_backup_copies_sent_total",
                "Per-owner command copies handed to the transport, by command kind.",
                &["kind"],
            ),
            backup_acks_total: counter_vec(
                registry,
                "hoard_backup_acks_total",
                "Acknowledgments accepted by the collector, by ack kind.",
                &["kind"],
            ),
            backup_acks_ignored_total: counter(
                registry,
                "hoard_backup_acks_ignored_total",
                "Acknowledgments discarded as late, unexpected, or topology-mismatched.",
            ),
            pending_ack_collectors: gauge(
                registry,
                "hoard_pending_ack_collectors",
                "In-flight writes still awaiting backup acknowledgments.",
            ),
            fencing_decisions_total: counter_vec(
                registry,
                "hoard_fencing_decisions_total",
                "Topology fencing decisions, by outcome.",
                &["outcome"],
            ),
        }
    }

    /// Counts one replicated write command of the given kind.
    pub fn record_command(&self, kind: &str) {
        self.commands_total.with_label_values(&[kind]).inc();
    }

    /// Counts one per-owner command copy handed to the transport.
    pub fn record_backup_copy(&self, kind: &str) {
        self.backup_copies_sent_total.with_label_values(&[kind]).inc();
    }

    /// Counts one accepted acknowledgment of the given kind.
    pub fn record_ack(&self, kind: &str) {
        self.backup_acks_total.with_label_values(&[kind]).inc();
    }

    /// Counts one discarded acknowledgment.
    pub fn record_ignored_ack(&self) {
        self.backup_acks_ignored_total.inc();
    }

    /// Records that a collector entry was created.
    pub fn collector_entry_created(&self) {
        self.pending_ack_collectors.inc();
    }

    /// Records that a collector entry was retired.
    pub fn collector_entry_retired(&self) {
        self.pending_ack_collectors.dec();
    }

    /// Counts one fencing decision.
    pub fn record_fence(&self, decision: FenceDecision) {
        self.fencing_decisions_total
            .with_label_values(&[decision.name()])
            .inc();
    }

    /// Current number of in-flight collector entries.
    pub fn pending_ack_collectors(&self) -> i64 {
        self.pending_ack_collectors.get()
    }

    /// Total accepted acks of the given kind.
    pub fn ack_count(&self, kind: &str) -> u64 {
        self.backup_acks_total.with_label_values(&[kind]).get()
    }

    /// Total discarded acks.
    pub fn ignored_ack_count(&self) -> u64 {
        self.backup_acks_ignored_total.get()
    }

    /// Total replicated commands of the given kind.
    pub fn command_count(&self, kind: &str) -> u64 {
        self.commands_total.with_label_values(&[kind]).get()
    }

    /// Total fencing decisions with the given outcome.
    pub fn fence_count(&self, decision: FenceDecision) -> u64 {
        self.fencing_decisions_total
            .with_label_values(&[decision.name()])
            .get()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_and_record() {
        let registry = Registry::new();
        let metrics = ProtocolMetrics::register_into(&registry);

        metrics.record_command("put");
        metrics.record_command("put");
        metrics.record_backup_copy("put");
        metrics.record_ack("backup");
        metrics.record_ignored_ack();
        metrics.collector_entry_created();
        metrics.record_fence(FenceDecision::Discard);

        assert_eq!(metrics.command_count("put"), 2);
        assert_eq!(metrics.ack_count("backup"), 1);
        assert_eq!(metrics.ignored_ack_count(), 1);
        assert_eq!(metrics.pending_ack_collectors(), 1);
        assert_eq!(metrics.fence_count(FenceDecision::Discard), 1);
        assert_eq!(metrics.fence_count(FenceDecision::Proceed), 0);

        metrics.collector_entry_retired();
        assert_eq!(metrics.pending_ack_collectors(), 0);

        // Every family made it into the registry.
        assert_eq!(registry.gather().len(), 6);
    }
}
