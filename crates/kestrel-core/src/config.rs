// Copyright (c) Mysten Labs, Inc.
// Modifications Copyright (c) 2025 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ConsensusConfig {
    /// How long the per-peer data-gossip loop sleeps when it has nothing to
    /// send or the peer's height/round does not match ours.
    pub peer_gossip_sleep: Duration,
    /// Sleep between catchup attempts for a peer on an earlier height.
    pub peer_catchup_sleep: Duration,
    /// Capacity of the bounded input queue into the consensus state machine.
    pub input_queue_capacity: usize,
}

impl Default for ConsensusConfig {
    fn default() -> Self {
        Self {
            peer_gossip_sleep: Duration::from_millis(100),
            peer_catchup_sleep: Duration::from_millis(100),
            input_queue_capacity: 1_000,
        }
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct EvidenceParams {
    /// Evidence older than this many blocks relative to a peer's height is
    /// never sent to that peer.
    pub max_age_num_blocks: u64,
    /// Evidence older than this relative to the last block time is never
    /// sent. Compared directly as a duration, no unit rescaling.
    pub max_age_duration: Duration,
}

impl Default for EvidenceParams {
    fn default() -> Self {
        Self {
            max_age_num_blocks: 100_000,
            max_age_duration: Duration::from_secs(48 * 60 * 60),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize)]
pub struct ConsensusParams {
    pub evidence: EvidenceParams,
}
