// Copyright (c) Mysten Labs, Inc.
// Modifications Copyright (c) 2025 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! Thread-safe mirror of what a remote peer is known to have seen.

use std::{
    collections::HashMap,
    sync::Arc,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use parking_lot::{Mutex, RwLock};

use crate::{
    crypto::BlockHash,
    messages::{CommitStepMessage, HasVoteMessage, NewRoundStepMessage, ProposalPolMessage},
    types::{
        BitArray, Height, PeerId, Proposal, Round, RoundStep, ValidatorIndex, Vote, VoteType,
        ROUND_NONE,
    },
};

/// Everything we believe about one peer's consensus progress.
///
/// Invariants, maintained by the update methods below:
/// - `(height, round, step)` never decreases;
/// - changing `(height, round)` clears the proposal and all round bitmaps;
/// - advancing the height by one shifts `precommits` into `last_commit` iff
///   the prior round equals the announced last-commit round.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PeerRoundState {
    pub height: Height,
    pub round: Round,
    pub step: RoundStep,
    /// Estimated start time of the peer's current round.
    pub start_time: SystemTime,
    pub proposal: bool,
    pub proposal_block_header: BlockHash,
    pub proposal_pol_round: Round,
    /// Prevotes for the proposal's POL round. None until a proposal-POL
    /// message arrives.
    pub proposal_pol: Option<BitArray>,
    pub prevotes: Option<BitArray>,
    pub precommits: Option<BitArray>,
    /// Round of the precommits for the previous height.
    pub last_commit_round: Round,
    pub last_commit: Option<BitArray>,
    /// Precommits we hold for a past round at the peer's current height,
    /// kept to unblock a lagging peer.
    pub catchup_commit_round: Round,
    pub catchup_commit: Option<BitArray>,
}

impl Default for PeerRoundState {
    fn default() -> Self {
        Self {
            height: 0,
            round: ROUND_NONE,
            step: RoundStep::NewHeight,
            start_time: UNIX_EPOCH,
            proposal: false,
            proposal_block_header: BlockHash::default(),
            proposal_pol_round: ROUND_NONE,
            proposal_pol: None,
            prevotes: None,
            precommits: None,
            last_commit_round: ROUND_NONE,
            last_commit: None,
            catchup_commit_round: ROUND_NONE,
            catchup_commit: None,
        }
    }
}

/// Mirror of a single peer. All reads and writes are serialized by the inner
/// mutex; every update method is side-effect-free on inputs that fail its
/// height/round checks.
pub struct PeerState {
    peer_id: PeerId,
    prs: Mutex<PeerRoundState>,
}

impl PeerState {
    pub fn new(peer_id: PeerId) -> Self {
        Self {
            peer_id,
            prs: Mutex::new(PeerRoundState::default()),
        }
    }

    pub fn peer_id(&self) -> PeerId {
        self.peer_id
    }

    /// Snapshot of the mirror. Fields may be stale the moment the lock is
    /// released; decision loops must re-read.
    pub fn get_round_state(&self) -> PeerRoundState {
        self.prs.lock().clone()
    }

    pub fn get_height(&self) -> Height {
        self.prs.lock().height
    }

    /// Applies an announced height/round/step transition. Anything not
    /// strictly greater than the current triple is dropped, which defends
    /// against reordered gossip.
    pub fn apply_new_round_step(&self, msg: &NewRoundStepMessage) {
        let mut prs = self.prs.lock();

        if (msg.height, msg.round, msg.step) <= (prs.height, prs.round, prs.step) {
            return;
        }

        // Remember these before they are overwritten below.
        let ps_height = prs.height;
        let ps_round = prs.round;
        let ps_precommits = prs.precommits.clone();
        let ps_catchup_commit_round = prs.catchup_commit_round;
        let ps_catchup_commit = prs.catchup_commit.clone();

        prs.start_time = SystemTime::now() - Duration::from_secs(msg.seconds_since_start);
        prs.height = msg.height;
        prs.round = msg.round;
        prs.step = msg.step;

        if ps_height != msg.height || ps_round != msg.round {
            prs.proposal = false;
            prs.proposal_block_header = BlockHash::default();
            prs.proposal_pol_round = ROUND_NONE;
            prs.proposal_pol = None;
            prs.prevotes = None;
            prs.precommits = None;
        }
        if ps_height == msg.height && ps_round != msg.round && msg.round == ps_catchup_commit_round
        {
            // Peer caught up to the catchup-commit round; the precommits we
            // held for it become current.
            prs.precommits = ps_catchup_commit;
        }
        if ps_height != msg.height {
            if ps_height + 1 == msg.height && ps_round == msg.last_commit_round {
                prs.last_commit = ps_precommits;
            } else {
                prs.last_commit = None;
            }
            prs.last_commit_round = msg.last_commit_round;
            prs.catchup_commit_round = ROUND_NONE;
            prs.catchup_commit = None;
        }
    }

    /// Records that the peer has the proposal for its current height/round.
    /// Idempotent; a proposal for any other height/round is ignored.
    pub fn set_has_proposal(&self, proposal: &Proposal) {
        let mut prs = self.prs.lock();

        if prs.height != proposal.height || prs.round != proposal.round {
            return;
        }
        if prs.proposal {
            return;
        }

        prs.proposal = true;
        prs.proposal_block_header = proposal.block.header.hash();
        prs.proposal_pol_round = proposal.pol_round;
        prs.proposal_pol = None; // None until a proposal-POL message arrives.
    }

    pub fn apply_proposal_pol(&self, msg: &ProposalPolMessage) {
        let mut prs = self.prs.lock();

        if prs.height != msg.height {
            return;
        }
        if prs.proposal_pol_round != msg.proposal_pol_round {
            return;
        }
        prs.proposal_pol = Some(msg.proposal_pol.clone());
    }

    /// Records the committed block announced by a commit-step message.
    pub fn apply_commit_step(&self, msg: &CommitStepMessage) {
        let mut prs = self.prs.lock();

        if prs.height != msg.height {
            return;
        }
        prs.proposal_block_header = msg.block.hash();
    }

    /// A peer may announce a vote for its current height, or a last-commit
    /// vote for the height below it; both route through the bitmap lookup.
    pub fn apply_has_vote(&self, msg: &HasVoteMessage) {
        let mut prs = self.prs.lock();

        if prs.height != msg.height && prs.height != msg.height + 1 {
            return;
        }
        Self::set_has_vote_locked(&mut prs, msg.height, msg.round, msg.vote_type, msg.index);
    }

    /// Marks a vote we sent (or relayed) to the peer as known by it.
    pub fn set_has_vote(&self, vote: &Vote) {
        let mut prs = self.prs.lock();
        Self::set_has_vote_locked(
            &mut prs,
            vote.height,
            vote.round,
            vote.vote_type,
            vote.validator_index,
        );
    }

    fn set_has_vote_locked(
        prs: &mut PeerRoundState,
        height: Height,
        round: Round,
        vote_type: VoteType,
        index: ValidatorIndex,
    ) {
        // A None bitmap lookup has no side effects.
        if let Some(votes) = Self::vote_bit_array(prs, height, round, vote_type) {
            votes.set(index as usize);
        }
    }

    /// The bitmap tracking `(height, round, vote_type)`, if the mirror holds
    /// one for that slot.
    fn vote_bit_array<'a>(
        prs: &'a mut PeerRoundState,
        height: Height,
        round: Round,
        vote_type: VoteType,
    ) -> Option<&'a mut BitArray> {
        if prs.height == height {
            if prs.round == round {
                return match vote_type {
                    VoteType::Prevote => prs.prevotes.as_mut(),
                    VoteType::Precommit => prs.precommits.as_mut(),
                };
            }
            if prs.proposal_pol_round == round {
                return match vote_type {
                    VoteType::Prevote => prs.proposal_pol.as_mut(),
                    VoteType::Precommit => None,
                };
            }
            return None;
        }
        if prs.height == height + 1 {
            if prs.last_commit_round == round {
                return match vote_type {
                    VoteType::Prevote => None,
                    VoteType::Precommit => prs.last_commit.as_mut(),
                };
            }
            return None;
        }
        None
    }

    /// Allocates the vote bitmaps for `height` once the validator set size is
    /// known. Existing bitmaps are left untouched.
    pub fn ensure_vote_bit_arrays(&self, height: Height, num_validators: usize) {
        let mut prs = self.prs.lock();

        if prs.height == height {
            if prs.prevotes.is_none() {
                prs.prevotes = Some(BitArray::new(num_validators));
            }
            if prs.precommits.is_none() {
                prs.precommits = Some(BitArray::new(num_validators));
            }
            if prs.catchup_commit.is_none() {
                prs.catchup_commit = Some(BitArray::new(num_validators));
            }
            if prs.proposal_pol.is_none() {
                prs.proposal_pol = Some(BitArray::new(num_validators));
            }
        } else if prs.height == height + 1 && prs.last_commit.is_none() {
            prs.last_commit = Some(BitArray::new(num_validators));
        }
    }

    /// Declares the round we hold commits for at the peer's current height.
    pub fn ensure_catchup_commit_round(
        &self,
        height: Height,
        round: Round,
        num_validators: usize,
    ) {
        let mut prs = self.prs.lock();

        if prs.height != height {
            return;
        }
        if prs.catchup_commit_round == round {
            return;
        }
        prs.catchup_commit_round = round;
        if round == prs.round {
            prs.catchup_commit = prs.precommits.clone();
        } else {
            prs.catchup_commit = Some(BitArray::new(num_validators));
        }
    }

    #[cfg(test)]
    pub(crate) fn set_round_state_for_test(&self, prs: PeerRoundState) {
        *self.prs.lock() = prs;
    }
}

/// Shared directory of peer mirrors, consulted by both the consensus and the
/// evidence reactors. A peer may be known to the transport before its mirror
/// exists here; lookups simply return None until then.
#[derive(Default)]
pub struct PeerRegistry {
    peers: RwLock<HashMap<PeerId, Arc<PeerState>>>,
}

impl PeerRegistry {
    pub fn add(&self, peer_id: PeerId) -> Arc<PeerState> {
        let state = Arc::new(PeerState::new(peer_id));
        self.peers.write().insert(peer_id, state.clone());
        state
    }

    pub fn remove(&self, peer_id: PeerId) -> Option<Arc<PeerState>> {
        self.peers.write().remove(&peer_id)
    }

    pub fn get(&self, peer_id: PeerId) -> Option<Arc<PeerState>> {
        self.peers.read().get(&peer_id).cloned()
    }

    pub fn all(&self) -> Vec<Arc<PeerState>> {
        self.peers.read().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.peers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::{new_round_step, test_proposal};

    fn bits(len: usize, set: &[usize]) -> BitArray {
        let mut bits = BitArray::new(len);
        for i in set {
            bits.set(*i);
        }
        bits
    }

    #[test]
    fn round_step_monotonicity() {
        let ps = PeerState::new(1);
        let initial = ps.get_round_state();
        assert_eq!(
            (initial.height, initial.round, initial.step),
            (0, ROUND_NONE, RoundStep::NewHeight)
        );

        ps.apply_new_round_step(&new_round_step(1, 0, RoundStep::Propose, ROUND_NONE));
        let prs = ps.get_round_state();
        assert_eq!((prs.height, prs.round, prs.step), (1, 0, RoundStep::Propose));
        assert!(!prs.proposal);
        assert!(prs.prevotes.is_none());
        assert!(prs.precommits.is_none());
        assert!(prs.proposal_pol.is_none());

        // Lower step at the same height/round is ignored.
        ps.apply_new_round_step(&new_round_step(1, 0, RoundStep::NewHeight, ROUND_NONE));
        let prs = ps.get_round_state();
        assert_eq!((prs.height, prs.round, prs.step), (1, 0, RoundStep::Propose));

        // Equal triple is ignored too.
        ps.apply_new_round_step(&new_round_step(1, 0, RoundStep::Propose, ROUND_NONE));
        assert_eq!(ps.get_round_state(), prs);
    }

    #[test]
    fn step_advances_within_round_keep_bitmaps() {
        let ps = PeerState::new(1);
        ps.apply_new_round_step(&new_round_step(5, 2, RoundStep::Propose, ROUND_NONE));
        ps.ensure_vote_bit_arrays(5, 3);
        ps.apply_has_vote(&HasVoteMessage {
            height: 5,
            round: 2,
            vote_type: VoteType::Prevote,
            index: 1,
        });

        ps.apply_new_round_step(&new_round_step(5, 2, RoundStep::Prevote, ROUND_NONE));
        let prs = ps.get_round_state();
        assert_eq!(prs.step, RoundStep::Prevote);
        assert!(prs.prevotes.as_ref().unwrap().get(1));
    }

    #[test]
    fn height_shift_preserves_precommits() {
        let ps = PeerState::new(1);
        ps.apply_new_round_step(&new_round_step(5, 2, RoundStep::Precommit, 1));
        ps.ensure_vote_bit_arrays(5, 3);
        for index in [0u32, 2] {
            ps.apply_has_vote(&HasVoteMessage {
                height: 5,
                round: 2,
                vote_type: VoteType::Precommit,
                index,
            });
        }

        ps.apply_new_round_step(&new_round_step(6, 0, RoundStep::NewHeight, 2));
        let prs = ps.get_round_state();
        assert_eq!(prs.last_commit_round, 2);
        assert_eq!(prs.last_commit, Some(bits(3, &[0, 2])));
        assert!(prs.precommits.is_none());
        assert_eq!(prs.catchup_commit_round, ROUND_NONE);
        assert!(prs.catchup_commit.is_none());
    }

    #[test]
    fn height_shift_drops_precommits() {
        let ps = PeerState::new(1);
        ps.apply_new_round_step(&new_round_step(5, 2, RoundStep::Precommit, 1));
        ps.ensure_vote_bit_arrays(5, 3);
        ps.apply_has_vote(&HasVoteMessage {
            height: 5,
            round: 2,
            vote_type: VoteType::Precommit,
            index: 0,
        });

        // Announced last-commit round does not match the peer's prior round.
        ps.apply_new_round_step(&new_round_step(6, 0, RoundStep::NewHeight, 3));
        let prs = ps.get_round_state();
        assert_eq!(prs.last_commit_round, 3);
        assert!(prs.last_commit.is_none());
    }

    #[test]
    fn height_jump_drops_precommits() {
        let ps = PeerState::new(1);
        ps.apply_new_round_step(&new_round_step(5, 2, RoundStep::Precommit, 1));
        ps.ensure_vote_bit_arrays(5, 3);
        ps.apply_new_round_step(&new_round_step(8, 2, RoundStep::NewHeight, 2));
        assert!(ps.get_round_state().last_commit.is_none());
    }

    #[test]
    fn catchup_restore() {
        let ps = PeerState::new(1);
        let catchup = bits(3, &[0, 1]);
        ps.set_round_state_for_test(PeerRoundState {
            height: 5,
            round: 1,
            step: RoundStep::Prevote,
            catchup_commit_round: 3,
            catchup_commit: Some(catchup.clone()),
            ..PeerRoundState::default()
        });

        ps.apply_new_round_step(&new_round_step(5, 3, RoundStep::Precommit, ROUND_NONE));
        let prs = ps.get_round_state();
        assert_eq!(prs.precommits, Some(catchup));
        // The round change still cleared the rest.
        assert!(prs.prevotes.is_none());
        assert!(!prs.proposal);
    }

    #[test]
    fn set_has_proposal_idempotent() {
        let ps = PeerState::new(1);
        ps.apply_new_round_step(&new_round_step(4, 2, RoundStep::Propose, ROUND_NONE));

        let proposal = test_proposal(4, 2, 1);
        ps.set_has_proposal(&proposal);
        let first = ps.get_round_state();
        assert!(first.proposal);
        assert_eq!(first.proposal_block_header, proposal.block.hash());
        assert_eq!(first.proposal_pol_round, 1);
        assert!(first.proposal_pol.is_none());

        ps.set_has_proposal(&proposal);
        assert_eq!(ps.get_round_state(), first);
    }

    #[test]
    fn set_has_proposal_requires_matching_height_round() {
        let ps = PeerState::new(1);
        ps.apply_new_round_step(&new_round_step(4, 2, RoundStep::Propose, ROUND_NONE));

        ps.set_has_proposal(&test_proposal(4, 3, ROUND_NONE));
        ps.set_has_proposal(&test_proposal(5, 2, ROUND_NONE));
        assert!(!ps.get_round_state().proposal);
    }

    #[test]
    fn has_vote_routes_to_proposal_pol() {
        let ps = PeerState::new(1);
        ps.apply_new_round_step(&new_round_step(4, 2, RoundStep::Propose, ROUND_NONE));
        ps.set_has_proposal(&test_proposal(4, 2, 1));
        ps.apply_proposal_pol(&ProposalPolMessage {
            height: 4,
            proposal_pol_round: 1,
            proposal_pol: BitArray::new(3),
        });

        ps.apply_has_vote(&HasVoteMessage {
            height: 4,
            round: 1,
            vote_type: VoteType::Prevote,
            index: 2,
        });
        // Precommits for the POL round have no bitmap; no side effect.
        ps.apply_has_vote(&HasVoteMessage {
            height: 4,
            round: 1,
            vote_type: VoteType::Precommit,
            index: 2,
        });

        let prs = ps.get_round_state();
        assert!(prs.proposal_pol.as_ref().unwrap().get(2));
    }

    #[test]
    fn has_vote_routes_to_last_commit() {
        let ps = PeerState::new(1);
        ps.apply_new_round_step(&new_round_step(5, 0, RoundStep::NewHeight, 2));
        ps.ensure_vote_bit_arrays(4, 3);

        // Last-commit precommit for the previous height is accepted.
        ps.apply_has_vote(&HasVoteMessage {
            height: 4,
            round: 2,
            vote_type: VoteType::Precommit,
            index: 1,
        });
        assert!(ps.get_round_state().last_commit.unwrap().get(1));

        // Any other height is dropped.
        ps.apply_has_vote(&HasVoteMessage {
            height: 3,
            round: 2,
            vote_type: VoteType::Precommit,
            index: 1,
        });
    }

    #[test]
    fn has_vote_height_mismatch_is_ignored() {
        let ps = PeerState::new(1);
        ps.apply_new_round_step(&new_round_step(5, 0, RoundStep::Prevote, ROUND_NONE));
        ps.ensure_vote_bit_arrays(5, 3);
        let before = ps.get_round_state();

        ps.apply_has_vote(&HasVoteMessage {
            height: 7,
            round: 0,
            vote_type: VoteType::Prevote,
            index: 1,
        });
        assert_eq!(ps.get_round_state(), before);
    }

    #[test]
    fn ensure_catchup_commit_round_clones_current_precommits() {
        let ps = PeerState::new(1);
        ps.apply_new_round_step(&new_round_step(5, 3, RoundStep::Precommit, ROUND_NONE));
        ps.ensure_vote_bit_arrays(5, 3);
        ps.apply_has_vote(&HasVoteMessage {
            height: 5,
            round: 3,
            vote_type: VoteType::Precommit,
            index: 2,
        });

        ps.ensure_catchup_commit_round(5, 3, 3);
        let prs = ps.get_round_state();
        assert_eq!(prs.catchup_commit_round, 3);
        assert_eq!(prs.catchup_commit, prs.precommits);
    }

    #[test]
    fn registry_lifecycle() {
        let registry = PeerRegistry::default();
        assert!(registry.get(9).is_none());

        let state = registry.add(9);
        assert_eq!(state.peer_id(), 9);
        assert_eq!(registry.len(), 1);
        assert!(Arc::ptr_eq(&registry.get(9).unwrap(), &state));

        registry.remove(9);
        assert!(registry.get(9).is_none());
    }
}
