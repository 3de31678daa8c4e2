// Copyright (c) Mysten Labs, Inc.
// Modifications Copyright (c) 2025 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! The consensus reactor: fans state-machine events out to peers, dispatches
//! inbound frames into the per-peer mirrors and the state machine's input
//! queue, and runs one data-gossip routine per peer.

use std::{collections::HashMap, sync::Arc, time::SystemTime};

use parking_lot::{Mutex, RwLock};
use tokio::{select, sync::broadcast, sync::mpsc, task::JoinHandle, time::sleep};

use crate::{
    config::ConsensusConfig,
    evidence_reactor::EvidenceReactor,
    header_chain::HeaderChain,
    messages::{
        decode_msg, ChannelDescriptor, CommitStepMessage, ConsensusMessage, HasVoteMessage,
        NewRoundStepMessage, ProposalMessage, ProposalPolMessage, DATA_CHANNEL, EVIDENCE_CHANNEL,
        MAX_MSG_SIZE, STATE_CHANNEL, VOTE_CHANNEL, VOTE_SET_BITS_CHANNEL,
    },
    metrics::Metrics,
    network::{send_msg, stop_channel, stopped, try_send_msg, Connection, Frame},
    peer_state::{PeerRegistry, PeerRoundState, PeerState},
    state::{ConsensusState, RoundState, StateEvent},
    types::{Block, PeerId, RoundStep, Vote},
};

pub struct ConsensusReactor {
    inner: Arc<ReactorInner>,
    stop_guard: Mutex<Option<mpsc::Receiver<()>>>,
}

struct PeerLink {
    sender: mpsc::Sender<Frame>,
    tasks: Vec<JoinHandle<()>>,
    // Dropping this receiver stops the peer's routines.
    _stop: mpsc::Receiver<()>,
}

struct ReactorInner {
    state: Arc<ConsensusState>,
    registry: Arc<PeerRegistry>,
    evidence: Arc<EvidenceReactor>,
    header_chain: Option<Arc<HeaderChain>>,
    config: ConsensusConfig,
    metrics: Arc<Metrics>,
    links: RwLock<HashMap<PeerId, PeerLink>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    stop: mpsc::Sender<()>,
}

impl ConsensusReactor {
    pub fn new(
        state: Arc<ConsensusState>,
        registry: Arc<PeerRegistry>,
        evidence: Arc<EvidenceReactor>,
        header_chain: Option<Arc<HeaderChain>>,
        config: ConsensusConfig,
        metrics: Arc<Metrics>,
    ) -> Arc<Self> {
        let (stop_sender, stop_receiver) = stop_channel();
        Arc::new(Self {
            inner: Arc::new(ReactorInner {
                state,
                registry,
                evidence,
                header_chain,
                config,
                metrics,
                links: RwLock::new(HashMap::new()),
                tasks: Mutex::new(Vec::new()),
                stop: stop_sender,
            }),
            stop_guard: Mutex::new(Some(stop_receiver)),
        })
    }

    pub fn channels() -> Vec<ChannelDescriptor> {
        vec![
            ChannelDescriptor {
                id: STATE_CHANNEL,
                priority: 5,
                recv_capacity: MAX_MSG_SIZE,
            },
            ChannelDescriptor {
                id: DATA_CHANNEL,
                priority: 10,
                recv_capacity: MAX_MSG_SIZE,
            },
            ChannelDescriptor {
                id: VOTE_CHANNEL,
                priority: 5,
                recv_capacity: MAX_MSG_SIZE,
            },
            ChannelDescriptor {
                id: VOTE_SET_BITS_CHANNEL,
                priority: 1,
                recv_capacity: MAX_MSG_SIZE,
            },
        ]
    }

    /// Subscribes to the state machine's event bus and starts fanning events
    /// out to peers.
    pub fn start(&self) {
        let events = self.inner.state.subscribe();
        let inner = self.inner.clone();
        let task = tokio::spawn(async move {
            inner.event_routine(events).await;
        });
        self.inner.tasks.lock().push(task);
    }

    /// Attaches an established peer connection: announces our round state,
    /// creates the peer's mirror, and spawns its dispatch and gossip
    /// routines.
    pub async fn add_peer(&self, connection: Connection) {
        let Connection {
            peer_id,
            sender,
            receiver,
        } = connection;

        // Send our state first so the peer can initialize its mirror of us.
        let round_state = self.inner.state.get_round_state();
        let (round_step_msg, _) = make_round_step_messages(&round_state);
        if !send_msg(
            &sender,
            STATE_CHANNEL,
            &ConsensusMessage::NewRoundStep(round_step_msg),
        )
        .await
        {
            tracing::debug!("Peer {peer_id} went away before attach");
            return;
        }

        let peer_state = self.inner.registry.add(peer_id);
        let (peer_stop, peer_stop_guard) = stop_channel();

        let dispatch = {
            let inner = self.inner.clone();
            let peer_stop = peer_stop.clone();
            tokio::spawn(async move {
                inner.dispatch_routine(peer_id, receiver, peer_stop).await;
            })
        };
        let gossip = {
            let inner = self.inner.clone();
            let sender = sender.clone();
            let peer_stop = peer_stop.clone();
            tokio::spawn(async move {
                inner
                    .gossip_data_routine(peer_state, sender, peer_stop)
                    .await;
            })
        };
        self.inner.evidence.add_peer(peer_id, sender.clone(), peer_stop);

        self.inner.links.write().insert(
            peer_id,
            PeerLink {
                sender,
                tasks: vec![dispatch, gossip],
                _stop: peer_stop_guard,
            },
        );
        self.inner
            .metrics
            .peers_connected
            .set(self.inner.links.read().len() as i64);
        tracing::debug!("Added peer {peer_id} to consensus reactor");
    }

    pub fn remove_peer(&self, peer_id: PeerId, reason: &str) {
        self.inner.drop_peer(peer_id, reason);
    }

    /// Signals every routine to stop and waits for them to unwind.
    pub async fn shutdown(&self) {
        self.stop_guard.lock().take();
        self.inner.evidence.shutdown().await;

        let links: Vec<PeerLink> = self.inner.links.write().drain().map(|(_, l)| l).collect();
        let mut tasks: Vec<JoinHandle<()>> = Vec::new();
        for mut link in links {
            tasks.append(&mut link.tasks);
        }
        tasks.extend(self.inner.tasks.lock().drain(..));
        futures::future::join_all(tasks).await;
        self.inner.registry_clear();
    }
}

impl ReactorInner {
    fn registry_clear(&self) {
        for peer in self.registry.all() {
            self.registry.remove(peer.peer_id());
        }
        self.metrics.peers_connected.set(0);
    }

    fn drop_peer(&self, peer_id: PeerId, reason: &str) {
        let link = self.links.write().remove(&peer_id);
        if let Some(link) = link {
            tracing::debug!("Removing peer {peer_id}: {reason}");
            self.registry.remove(peer_id);
            self.metrics
                .peers_connected
                .set(self.links.read().len() as i64);
            // Dropping the link releases the peer's frame sender and stop
            // receiver; its routines unwind at their next suspension point.
            drop(link);
        }
    }

    async fn stopped(&self) {
        stopped(&self.stop).await
    }

    // ---- event-bus fan-out ----

    async fn event_routine(self: Arc<Self>, mut events: broadcast::Receiver<StateEvent>) {
        loop {
            let event = select! {
                _ = self.stopped() => return,
                event = events.recv() => match event {
                    Ok(event) => event,
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        tracing::warn!("Reactor lagged {n} state events");
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => return,
                },
            };
            match event {
                StateEvent::NewRoundStep(round_state) => {
                    self.broadcast_new_round_step(&round_state)
                }
                StateEvent::Vote(vote) => self.broadcast_has_vote(&vote),
            }
        }
    }

    fn broadcast_new_round_step(&self, round_state: &RoundState) {
        let (round_step_msg, commit_msg) = make_round_step_messages(round_state);
        let round_step_msg = ConsensusMessage::NewRoundStep(round_step_msg);
        let commit_msg = commit_msg.map(ConsensusMessage::CommitStep);
        for link in self.links.read().values() {
            if try_send_msg(&link.sender, STATE_CHANNEL, &round_step_msg) {
                self.note_sent(&round_step_msg);
            }
            if let Some(commit_msg) = &commit_msg {
                if try_send_msg(&link.sender, STATE_CHANNEL, commit_msg) {
                    self.note_sent(commit_msg);
                }
            }
        }
    }

    fn broadcast_has_vote(&self, vote: &Vote) {
        let msg = ConsensusMessage::HasVote(HasVoteMessage {
            height: vote.height,
            round: vote.round,
            vote_type: vote.vote_type,
            index: vote.validator_index,
        });
        for link in self.links.read().values() {
            if try_send_msg(&link.sender, STATE_CHANNEL, &msg) {
                self.note_sent(&msg);
            }
        }
    }

    // ---- inbound dispatch ----

    async fn dispatch_routine(
        self: Arc<Self>,
        peer_id: PeerId,
        mut receiver: mpsc::Receiver<Frame>,
        peer_stop: mpsc::Sender<()>,
    ) {
        loop {
            let frame = select! {
                _ = self.stopped() => return,
                _ = stopped(&peer_stop) => return,
                frame = receiver.recv() => match frame {
                    Some(frame) => frame,
                    None => break,
                },
            };
            if !self.handle_frame(peer_id, frame).await {
                break;
            }
        }
        self.drop_peer(peer_id, "receive loop ended");
    }

    /// Returns false when the peer must be disconnected.
    async fn handle_frame(&self, peer_id: PeerId, frame: Frame) -> bool {
        if frame.payload.len() > MAX_MSG_SIZE {
            tracing::warn!(
                "Dropping peer {peer_id}: oversize frame of {} bytes",
                frame.payload.len()
            );
            return false;
        }
        match frame.channel {
            STATE_CHANNEL | DATA_CHANNEL | VOTE_CHANNEL => {
                self.handle_consensus_frame(peer_id, &frame.payload).await
            }
            EVIDENCE_CHANNEL => self.evidence.receive(peer_id, &frame.payload),
            VOTE_SET_BITS_CHANNEL => {
                // Channel is registered but carries no message type yet.
                tracing::trace!("Ignoring vote-set-bits frame from {peer_id}");
                true
            }
            other => {
                tracing::warn!("Dropping peer {peer_id}: unknown channel {other:#04x}");
                false
            }
        }
    }

    async fn handle_consensus_frame(&self, peer_id: PeerId, payload: &[u8]) -> bool {
        let msg = match decode_msg(payload) {
            Ok(msg) => msg,
            Err(e) => {
                tracing::warn!("Dropping peer {peer_id}: bad consensus frame: {e}");
                self.metrics.wire_decode_failures_total.inc();
                return false;
            }
        };
        self.metrics
            .consensus_msgs_received_total
            .with_label_values(&[msg_kind(&msg)])
            .inc();

        let Some(peer_state) = self.registry.get(peer_id) else {
            tracing::debug!("No mirror for peer {peer_id}; dropping message");
            return true;
        };

        match msg {
            ConsensusMessage::NewRoundStep(m) => {
                peer_state.apply_new_round_step(&m);
                let round_state = self.state.get_round_state();
                peer_state.ensure_vote_bit_arrays(m.height, round_state.validators);
            }
            ConsensusMessage::CommitStep(m) => peer_state.apply_commit_step(&m),
            ConsensusMessage::Proposal(m) => {
                peer_state.set_has_proposal(&m.proposal);
                // Bounded queue; receive may block here until the state
                // machine drains it.
                if !self
                    .state
                    .enqueue_peer_message(ConsensusMessage::Proposal(m), peer_id)
                    .await
                {
                    tracing::warn!("State machine input queue closed");
                }
            }
            ConsensusMessage::ProposalPol(m) => peer_state.apply_proposal_pol(&m),
            ConsensusMessage::Vote(m) => {
                // The state machine calls back into set_has_vote once the
                // vote is accepted into the tally.
                if !self
                    .state
                    .enqueue_peer_message(ConsensusMessage::Vote(m), peer_id)
                    .await
                {
                    tracing::warn!("State machine input queue closed");
                }
            }
            ConsensusMessage::HasVote(m) => peer_state.apply_has_vote(&m),
        }
        true
    }

    // ---- data gossip ----

    async fn gossip_data_routine(
        self: Arc<Self>,
        peer_state: Arc<PeerState>,
        sender: mpsc::Sender<Frame>,
        peer_stop: mpsc::Sender<()>,
    ) {
        loop {
            if sender.is_closed() {
                return;
            }
            let round_state = self.state.get_round_state();
            let prs = peer_state.get_round_state();

            // If the peer is on a previous height, help it catch up.
            if prs.height > 0 && prs.height < round_state.height {
                self.gossip_catchup(&peer_state, &prs, &sender).await;
                if !self
                    .sleep_or_stopped(self.config.peer_catchup_sleep, &peer_stop)
                    .await
                {
                    return;
                }
                continue;
            }

            // If height and round don't match, sleep.
            if round_state.height != prs.height || round_state.round != prs.round {
                if !self
                    .sleep_or_stopped(self.config.peer_gossip_sleep, &peer_stop)
                    .await
                {
                    return;
                }
                continue;
            }

            // By here, height and round match. Send the proposal and, when
            // it re-proposes a locked block, the POL prevotes we hold.
            if let Some(proposal) = round_state.proposal.clone() {
                if !prs.proposal {
                    tracing::debug!(
                        "Sending proposal {} to peer {}",
                        proposal,
                        peer_state.peer_id()
                    );
                    let msg = ConsensusMessage::Proposal(ProposalMessage {
                        proposal: proposal.clone(),
                    });
                    if !send_msg(&sender, DATA_CHANNEL, &msg).await {
                        return;
                    }
                    self.note_sent(&msg);
                    self.metrics.proposals_gossiped_total.inc();
                    peer_state.set_has_proposal(&proposal);

                    // The proposal was validated, so pol_round < round and
                    // the prevotes for it exist.
                    if proposal.pol_round >= 0 {
                        if let Some(bits) = round_state.prevotes(proposal.pol_round) {
                            let msg = ConsensusMessage::ProposalPol(ProposalPolMessage {
                                height: round_state.height,
                                proposal_pol_round: proposal.pol_round,
                                proposal_pol: bits.clone(),
                            });
                            if !send_msg(&sender, DATA_CHANNEL, &msg).await {
                                return;
                            }
                            self.note_sent(&msg);
                        }
                    }
                    continue;
                }
            }

            // Nothing to do. Sleep.
            if !self
                .sleep_or_stopped(self.config.peer_gossip_sleep, &peer_stop)
                .await
            {
                return;
            }
        }
    }

    /// Commit-step assisted catchup: ship the committed block for the peer's
    /// height so it can finish the round it is stuck on. Mirror invariants
    /// are untouched beyond recording the announced block.
    async fn gossip_catchup(
        &self,
        peer_state: &Arc<PeerState>,
        prs: &PeerRoundState,
        sender: &mpsc::Sender<Frame>,
    ) {
        let Some(chain) = &self.header_chain else {
            return;
        };
        let Some(header) = chain.get_header_by_height(prs.height) else {
            tracing::debug!(
                "No stored header at height {} for peer catchup",
                prs.height
            );
            return;
        };
        if prs.proposal_block_header == header.hash() {
            return;
        }
        let commit = CommitStepMessage {
            height: prs.height,
            block: Block { header },
        };
        let msg = ConsensusMessage::CommitStep(commit.clone());
        if send_msg(sender, DATA_CHANNEL, &msg).await {
            self.note_sent(&msg);
            self.metrics.catchup_commits_sent_total.inc();
            // Remember what we told the peer so it is not resent.
            peer_state.apply_commit_step(&commit);
        }
    }

    async fn sleep_or_stopped(
        &self,
        duration: std::time::Duration,
        peer_stop: &mpsc::Sender<()>,
    ) -> bool {
        select! {
            _ = sleep(duration) => true,
            _ = self.stopped() => false,
            _ = stopped(peer_stop) => false,
        }
    }

    fn note_sent(&self, msg: &ConsensusMessage) {
        self.metrics
            .consensus_msgs_sent_total
            .with_label_values(&[msg_kind(msg)])
            .inc();
    }
}

fn msg_kind(msg: &ConsensusMessage) -> &'static str {
    match msg {
        ConsensusMessage::NewRoundStep(_) => "new_round_step",
        ConsensusMessage::CommitStep(_) => "commit_step",
        ConsensusMessage::Proposal(_) => "proposal",
        ConsensusMessage::ProposalPol(_) => "proposal_pol",
        ConsensusMessage::Vote(_) => "vote",
        ConsensusMessage::HasVote(_) => "has_vote",
    }
}

/// Builds the round-step announcement for the current state, paired with a
/// commit-step message when the state machine is in the commit step.
fn make_round_step_messages(
    round_state: &RoundState,
) -> (NewRoundStepMessage, Option<CommitStepMessage>) {
    let seconds_since_start = SystemTime::now()
        .duration_since(round_state.start_time)
        .unwrap_or_default()
        .as_secs();
    let round_step_msg = NewRoundStepMessage {
        height: round_state.height,
        round: round_state.round,
        step: round_state.step,
        seconds_since_start,
        last_commit_round: round_state.last_commit_round,
    };
    let commit_msg = if round_state.step == RoundStep::Commit {
        round_state.proposal.as_ref().map(|proposal| CommitStepMessage {
            height: round_state.height,
            block: proposal.block.clone(),
        })
    } else {
        None
    };
    (round_step_msg, commit_msg)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConsensusParams;
    use crate::evidence::{EvidencePool, PoolState};
    use crate::state::PeerMessageInfo;
    use crate::test_util::{
        connection_pair, frame, header_chain_with_headers, new_round_step, test_headers,
        test_metrics, test_proposal,
    };
    use crate::types::{BitArray, VoteType, ROUND_NONE};
    use std::time::Duration;
    use tokio::time::timeout;

    struct Fixture {
        reactor: Arc<ConsensusReactor>,
        state: Arc<ConsensusState>,
        input_rx: mpsc::Receiver<PeerMessageInfo>,
        registry: Arc<PeerRegistry>,
    }

    fn fixture(round_state: RoundState) -> Fixture {
        fixture_with_chain(round_state, None)
    }

    fn fixture_with_chain(
        round_state: RoundState,
        header_chain: Option<Arc<HeaderChain>>,
    ) -> Fixture {
        let config = ConsensusConfig::default();
        let metrics = test_metrics();
        let (state, input_rx) = ConsensusState::new(round_state, &config);
        let registry = Arc::new(PeerRegistry::default());
        let pool = EvidencePool::new(
            PoolState {
                last_block_height: 0,
                last_block_time: 0,
                params: ConsensusParams::default(),
            },
            metrics.clone(),
        );
        let evidence = EvidenceReactor::new(pool, registry.clone(), metrics.clone());
        let reactor = ConsensusReactor::new(
            state.clone(),
            registry.clone(),
            evidence,
            header_chain,
            config,
            metrics,
        );
        reactor.start();
        Fixture {
            reactor,
            state,
            input_rx,
            registry,
        }
    }

    async fn recv_msg(rx: &mut mpsc::Receiver<Frame>) -> (u8, ConsensusMessage) {
        let frame = timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for frame")
            .expect("peer channel closed");
        let msg = decode_msg(&frame.payload).expect("expected a consensus frame");
        (frame.channel, msg)
    }

    #[tokio::test(start_paused = true)]
    async fn add_peer_announces_round_state() {
        let fx = fixture(RoundState::new(3, 4));
        let (connection, _in_tx, mut out_rx) = connection_pair(1);

        fx.reactor.add_peer(connection).await;
        let (channel, msg) = recv_msg(&mut out_rx).await;
        assert_eq!(channel, STATE_CHANNEL);
        match msg {
            ConsensusMessage::NewRoundStep(m) => {
                assert_eq!(m.height, 3);
                assert_eq!(m.round, 0);
                assert_eq!(m.step, RoundStep::NewHeight);
            }
            other => panic!("expected NewRoundStep, got {other:?}"),
        }
        assert!(fx.registry.get(1).is_some());

        fx.reactor.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn gossip_sends_proposal_and_pol() {
        let mut round_state = RoundState::new(1, 4);
        round_state.round = 2;
        round_state.step = RoundStep::Propose;
        round_state.proposal = Some(test_proposal(1, 2, 1));
        let mut pol_bits = BitArray::new(4);
        pol_bits.set(0);
        pol_bits.set(3);
        round_state.prevotes.insert(1, pol_bits.clone());
        let fx = fixture(round_state);

        let (connection, in_tx, mut out_rx) = connection_pair(1);
        fx.reactor.add_peer(connection).await;
        let _ = recv_msg(&mut out_rx).await; // initial round-step

        // Peer reports the same height/round; the gossip loop now owes it
        // the proposal.
        in_tx
            .send(frame(
                STATE_CHANNEL,
                &ConsensusMessage::NewRoundStep(new_round_step(
                    1,
                    2,
                    RoundStep::Propose,
                    ROUND_NONE,
                )),
            ))
            .await
            .unwrap();

        let (channel, msg) = recv_msg(&mut out_rx).await;
        assert_eq!(channel, DATA_CHANNEL);
        match msg {
            ConsensusMessage::Proposal(m) => {
                assert_eq!(m.proposal, test_proposal(1, 2, 1));
            }
            other => panic!("expected Proposal, got {other:?}"),
        }

        let (channel, msg) = recv_msg(&mut out_rx).await;
        assert_eq!(channel, DATA_CHANNEL);
        match msg {
            ConsensusMessage::ProposalPol(m) => {
                assert_eq!(m.height, 1);
                assert_eq!(m.proposal_pol_round, 1);
                assert_eq!(m.proposal_pol, pol_bits);
            }
            other => panic!("expected ProposalPol, got {other:?}"),
        }

        let prs = fx.registry.get(1).unwrap().get_round_state();
        assert!(prs.proposal);

        fx.reactor.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn receive_proposal_updates_mirror_and_queues() {
        let mut fx = fixture(RoundState::new(1, 4));
        let (connection, in_tx, mut out_rx) = connection_pair(7);
        fx.reactor.add_peer(connection).await;
        let _ = recv_msg(&mut out_rx).await;

        in_tx
            .send(frame(
                STATE_CHANNEL,
                &ConsensusMessage::NewRoundStep(new_round_step(
                    1,
                    0,
                    RoundStep::Propose,
                    ROUND_NONE,
                )),
            ))
            .await
            .unwrap();
        let proposal = test_proposal(1, 0, ROUND_NONE);
        in_tx
            .send(frame(
                DATA_CHANNEL,
                &ConsensusMessage::Proposal(ProposalMessage {
                    proposal: proposal.clone(),
                }),
            ))
            .await
            .unwrap();

        let queued = timeout(Duration::from_secs(5), fx.input_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(queued.peer_id, 7);
        match queued.msg {
            ConsensusMessage::Proposal(m) => assert_eq!(m.proposal, proposal),
            other => panic!("expected Proposal, got {other:?}"),
        }
        assert!(fx.registry.get(7).unwrap().get_round_state().proposal);

        fx.reactor.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn inbound_has_vote_updates_mirror() {
        let fx = fixture(RoundState::new(1, 4));
        let (connection, in_tx, mut out_rx) = connection_pair(1);
        fx.reactor.add_peer(connection).await;
        let _ = recv_msg(&mut out_rx).await;

        in_tx
            .send(frame(
                STATE_CHANNEL,
                &ConsensusMessage::NewRoundStep(new_round_step(
                    1,
                    0,
                    RoundStep::Prevote,
                    ROUND_NONE,
                )),
            ))
            .await
            .unwrap();
        in_tx
            .send(frame(
                VOTE_CHANNEL,
                &ConsensusMessage::HasVote(HasVoteMessage {
                    height: 1,
                    round: 0,
                    vote_type: VoteType::Prevote,
                    index: 2,
                }),
            ))
            .await
            .unwrap();

        // Dispatch is asynchronous; wait for the bit to land.
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            let prs = fx.registry.get(1).unwrap().get_round_state();
            if prs.prevotes.as_ref().is_some_and(|bits| bits.get(2)) {
                break;
            }
            assert!(tokio::time::Instant::now() < deadline);
            sleep(Duration::from_millis(10)).await;
        }

        fx.reactor.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn decode_error_drops_peer() {
        let fx = fixture(RoundState::new(1, 4));
        let (connection, in_tx, mut out_rx) = connection_pair(1);
        fx.reactor.add_peer(connection).await;
        let _ = recv_msg(&mut out_rx).await;

        in_tx
            .send(Frame {
                channel: STATE_CHANNEL,
                payload: vec![0xde, 0xad, 0xbe, 0xef].into(),
            })
            .await
            .unwrap();

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while fx.registry.get(1).is_some() {
            assert!(tokio::time::Instant::now() < deadline);
            sleep(Duration::from_millis(10)).await;
        }

        fx.reactor.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn event_bus_broadcasts_round_step_and_votes() {
        let fx = fixture(RoundState::new(1, 4));
        let (connection, _in_tx, mut out_rx) = connection_pair(1);
        fx.reactor.add_peer(connection).await;
        let _ = recv_msg(&mut out_rx).await;

        fx.state.update_round_state(RoundState::new(4, 4));
        let (channel, msg) = recv_msg(&mut out_rx).await;
        assert_eq!(channel, STATE_CHANNEL);
        match msg {
            ConsensusMessage::NewRoundStep(m) => assert_eq!(m.height, 4),
            other => panic!("expected NewRoundStep, got {other:?}"),
        }

        fx.state.publish_vote(crate::test_util::test_vote(
            4,
            0,
            VoteType::Precommit,
            3,
        ));
        let (channel, msg) = recv_msg(&mut out_rx).await;
        assert_eq!(channel, STATE_CHANNEL);
        match msg {
            ConsensusMessage::HasVote(m) => {
                assert_eq!(m.height, 4);
                assert_eq!(m.vote_type, VoteType::Precommit);
                assert_eq!(m.index, 3);
            }
            other => panic!("expected HasVote, got {other:?}"),
        }

        fx.reactor.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn commit_step_paired_with_round_step_in_commit() {
        let mut round_state = RoundState::new(2, 4);
        round_state.step = RoundStep::Commit;
        round_state.proposal = Some(test_proposal(2, 0, ROUND_NONE));
        let fx = fixture(RoundState::new(1, 4));
        let (connection, _in_tx, mut out_rx) = connection_pair(1);
        fx.reactor.add_peer(connection).await;
        let _ = recv_msg(&mut out_rx).await;

        fx.state.update_round_state(round_state);
        let (_, msg) = recv_msg(&mut out_rx).await;
        assert!(matches!(msg, ConsensusMessage::NewRoundStep(_)));
        let (channel, msg) = recv_msg(&mut out_rx).await;
        assert_eq!(channel, STATE_CHANNEL);
        match msg {
            ConsensusMessage::CommitStep(m) => assert_eq!(m.height, 2),
            other => panic!("expected CommitStep, got {other:?}"),
        }

        fx.reactor.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn catchup_sends_committed_block() {
        let dir = tempfile::tempdir().unwrap();
        let headers = test_headers(6);
        let chain = Arc::new(header_chain_with_headers(dir.path(), &headers));
        let fx = fixture_with_chain(RoundState::new(5, 4), Some(chain));

        let (connection, in_tx, mut out_rx) = connection_pair(1);
        fx.reactor.add_peer(connection).await;
        let _ = recv_msg(&mut out_rx).await;

        // Peer is two heights behind us.
        in_tx
            .send(frame(
                STATE_CHANNEL,
                &ConsensusMessage::NewRoundStep(new_round_step(
                    3,
                    0,
                    RoundStep::NewHeight,
                    ROUND_NONE,
                )),
            ))
            .await
            .unwrap();

        let (channel, msg) = recv_msg(&mut out_rx).await;
        assert_eq!(channel, DATA_CHANNEL);
        match msg {
            ConsensusMessage::CommitStep(m) => {
                assert_eq!(m.height, 3);
                assert_eq!(m.block.header, headers[3]);
            }
            other => panic!("expected CommitStep, got {other:?}"),
        }
        assert_eq!(
            fx.registry.get(1).unwrap().get_round_state().proposal_block_header,
            headers[3].hash()
        );

        fx.reactor.shutdown().await;
    }

    #[test]
    fn channels_cover_the_registry() {
        let ids: Vec<u8> = ConsensusReactor::channels().iter().map(|c| c.id).collect();
        assert_eq!(ids, vec![0x20, 0x21, 0x22, 0x23]);
    }
}
