// Copyright (c) Mysten Labs, Inc.
// Modifications Copyright (c) 2025 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

use std::sync::Arc;

use prometheus::{
    register_int_counter_vec_with_registry, register_int_counter_with_registry,
    register_int_gauge_with_registry, IntCounter, IntCounterVec, IntGauge, Registry,
};

#[derive(Clone)]
pub struct Metrics {
    pub consensus_msgs_sent_total: IntCounterVec,
    pub consensus_msgs_received_total: IntCounterVec,
    pub wire_decode_failures_total: IntCounter,
    pub peers_connected: IntGauge,

    pub proposals_gossiped_total: IntCounter,
    pub catchup_commits_sent_total: IntCounter,

    pub evidence_broadcast_total: IntCounter,
    pub evidence_received_total: IntCounter,
    pub evidence_rejected_total: IntCounter,
    pub evidence_pending: IntGauge,
}

impl Metrics {
    pub fn new(registry: &Registry) -> Arc<Self> {
        Arc::new(Self {
            consensus_msgs_sent_total: register_int_counter_vec_with_registry!(
                "consensus_msgs_sent_total",
                "Consensus messages sent to peers, by kind",
                &["kind"],
                registry,
            )
            .unwrap(),
            consensus_msgs_received_total: register_int_counter_vec_with_registry!(
                "consensus_msgs_received_total",
                "Consensus messages received from peers, by kind",
                &["kind"],
                registry,
            )
            .unwrap(),
            wire_decode_failures_total: register_int_counter_with_registry!(
                "wire_decode_failures_total",
                "Inbound frames that failed to decode",
                registry,
            )
            .unwrap(),
            peers_connected: register_int_gauge_with_registry!(
                "peers_connected",
                "Peers currently attached to the reactors",
                registry,
            )
            .unwrap(),
            proposals_gossiped_total: register_int_counter_with_registry!(
                "proposals_gossiped_total",
                "Proposals sent to lagging peer mirrors",
                registry,
            )
            .unwrap(),
            catchup_commits_sent_total: register_int_counter_with_registry!(
                "catchup_commits_sent_total",
                "Commit-step messages sent to peers on earlier heights",
                registry,
            )
            .unwrap(),
            evidence_broadcast_total: register_int_counter_with_registry!(
                "evidence_broadcast_total",
                "Evidence items sent to peers",
                registry,
            )
            .unwrap(),
            evidence_received_total: register_int_counter_with_registry!(
                "evidence_received_total",
                "Evidence items received from peers",
                registry,
            )
            .unwrap(),
            evidence_rejected_total: register_int_counter_with_registry!(
                "evidence_rejected_total",
                "Evidence items rejected as invalid",
                registry,
            )
            .unwrap(),
            evidence_pending: register_int_gauge_with_registry!(
                "evidence_pending",
                "Evidence items currently pending broadcast",
                registry,
            )
            .unwrap(),
        })
    }
}
