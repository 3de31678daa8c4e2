// Copyright (c) Mysten Labs, Inc.
// Modifications Copyright (c) 2025 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! Interface to the consensus state machine collaborator: a read-only round
//! state snapshot, a multi-subscriber event bus, and the bounded input queue
//! peer messages are fed into.

use std::{collections::BTreeMap, sync::Arc, time::SystemTime};

use parking_lot::RwLock;
use tokio::sync::{broadcast, mpsc};

use crate::{
    config::ConsensusConfig,
    messages::ConsensusMessage,
    types::{BitArray, Height, PeerId, Proposal, Round, RoundStep, Vote, ROUND_NONE},
};

const EVENT_BUS_CAPACITY: usize = 128;

/// Snapshot of the local consensus round state, taken at event time.
/// Consumers must not assume any field is still current; decision loops
/// re-read.
#[derive(Clone, Debug)]
pub struct RoundState {
    pub height: Height,
    pub round: Round,
    pub step: RoundStep,
    pub start_time: SystemTime,
    /// Size of the validator set at this height, used to size peer bitmaps.
    pub validators: usize,
    pub proposal: Option<Proposal>,
    /// Prevote bitmaps by round, serving proof-of-lock announcements.
    pub prevotes: BTreeMap<Round, BitArray>,
    pub last_commit_round: Round,
}

impl RoundState {
    pub fn new(height: Height, validators: usize) -> Self {
        Self {
            height,
            round: 0,
            step: RoundStep::NewHeight,
            start_time: SystemTime::now(),
            validators,
            proposal: None,
            prevotes: BTreeMap::new(),
            last_commit_round: ROUND_NONE,
        }
    }

    pub fn prevotes(&self, round: Round) -> Option<&BitArray> {
        self.prevotes.get(&round)
    }
}

/// Events the state machine publishes for the reactor to fan out.
#[derive(Clone, Debug)]
pub enum StateEvent {
    NewRoundStep(RoundState),
    Vote(Vote),
}

/// A peer message queued into the state machine.
#[derive(Debug)]
pub struct PeerMessageInfo {
    pub msg: ConsensusMessage,
    pub peer_id: PeerId,
}

/// Handle to the consensus state machine. The reactor reads snapshots,
/// subscribes to events, and enqueues peer traffic; the state machine side
/// updates the snapshot, publishes events, and drains the queue.
pub struct ConsensusState {
    round_state: RwLock<RoundState>,
    events: broadcast::Sender<StateEvent>,
    input: mpsc::Sender<PeerMessageInfo>,
}

impl ConsensusState {
    pub fn new(
        initial: RoundState,
        config: &ConsensusConfig,
    ) -> (Arc<Self>, mpsc::Receiver<PeerMessageInfo>) {
        let (events, _) = broadcast::channel(EVENT_BUS_CAPACITY);
        let (input, input_rx) = mpsc::channel(config.input_queue_capacity);
        (
            Arc::new(Self {
                round_state: RwLock::new(initial),
                events,
                input,
            }),
            input_rx,
        )
    }

    pub fn get_round_state(&self) -> RoundState {
        self.round_state.read().clone()
    }

    /// A fresh event-bus subscription. Dropping the receiver unsubscribes.
    pub fn subscribe(&self) -> broadcast::Receiver<StateEvent> {
        self.events.subscribe()
    }

    /// Queues a peer message for the state machine; may wait on queue
    /// capacity. Returns false when the state machine is gone.
    pub async fn enqueue_peer_message(&self, msg: ConsensusMessage, peer_id: PeerId) -> bool {
        self.input
            .send(PeerMessageInfo { msg, peer_id })
            .await
            .is_ok()
    }

    /// State-machine side: installs a new round state and announces the
    /// transition.
    pub fn update_round_state(&self, round_state: RoundState) {
        *self.round_state.write() = round_state.clone();
        // No subscribers is fine; the reactor may not have started yet.
        let _ = self.events.send(StateEvent::NewRoundStep(round_state));
    }

    /// State-machine side: announces a vote accepted into the tally.
    pub fn publish_vote(&self, vote: Vote) {
        let _ = self.events.send(StateEvent::Vote(vote));
    }
}
