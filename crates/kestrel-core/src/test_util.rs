// Copyright (c) Mysten Labs, Inc.
// Modifications Copyright (c) 2025 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

use std::{path::Path, sync::Arc};

use prometheus::Registry;
use tokio::sync::mpsc;

use crate::{
    crypto::{BlockHash, SignatureBytes},
    evidence::{DuplicateVoteEvidence, Evidence},
    header_chain::HeaderChain,
    header_store::HeaderStore,
    messages::{encode_msg, ConsensusMessage, NewRoundStepMessage},
    metrics::Metrics,
    network::{Connection, Frame},
    types::{
        Block, BlockId, Header, Height, PartSetHeader, PeerId, Proposal, Round, RoundStep,
        Timestamp, ValidatorIndex, Vote, VoteType,
    },
};

pub fn test_metrics() -> Arc<Metrics> {
    Metrics::new(&Registry::new())
}

pub fn test_header(height: Height, last_commit_hash: BlockHash) -> Header {
    Header {
        height,
        time: 1_700_000_000 + height,
        last_commit_hash,
        app_hash: BlockHash::digest_of(b"app"),
    }
}

/// A chain of `n` headers from genesis, linked via `last_commit_hash`.
pub fn test_headers(n: usize) -> Vec<Header> {
    let mut headers = Vec::with_capacity(n);
    let mut prev_hash = BlockHash::default();
    for height in 0..n {
        let header = test_header(height as Height, prev_hash);
        prev_hash = header.hash();
        headers.push(header);
    }
    headers
}

/// Opens a header chain over a fresh store seeded with the given headers;
/// the last one becomes the head.
pub fn header_chain_with_headers(path: &Path, headers: &[Header]) -> HeaderChain {
    let store = Arc::new(HeaderStore::open(path).unwrap());
    for header in headers {
        store.write_header(header).unwrap();
        store.write_canonical_hash(header.height, header.hash()).unwrap();
    }
    let chain = HeaderChain::open(store).unwrap();
    if let Some(last) = headers.last() {
        chain.set_current_header(last.clone()).unwrap();
    }
    chain
}

pub fn test_proposal(height: Height, round: Round, pol_round: Round) -> Proposal {
    let header = test_header(height, BlockHash::digest_of(b"prev"));
    let block = Block { header };
    let pol_block_id = if pol_round >= 0 {
        block.block_id()
    } else {
        BlockId::zero()
    };
    Proposal {
        height,
        round,
        pol_round,
        timestamp: 1_700_000_000,
        pol_block_id,
        block,
        signature: SignatureBytes::default(),
    }
}

pub fn test_vote(
    height: Height,
    round: Round,
    vote_type: VoteType,
    validator_index: ValidatorIndex,
) -> Vote {
    let hash = BlockHash::digest_of(&height.to_be_bytes());
    Vote {
        vote_type,
        height,
        round,
        validator_index,
        block_id: BlockId {
            hash,
            parts_header: PartSetHeader { total: 1, hash },
        },
        timestamp: 1_700_000_000,
        signature: SignatureBytes::default(),
    }
}

pub fn new_round_step(
    height: Height,
    round: Round,
    step: RoundStep,
    last_commit_round: Round,
) -> NewRoundStepMessage {
    NewRoundStepMessage {
        height,
        round,
        step,
        seconds_since_start: 0,
        last_commit_round,
    }
}

/// Duplicate-vote evidence at the given height and observation time.
pub fn duplicate_vote_evidence(height: Height, time: Timestamp) -> Evidence {
    let mut vote_a = test_vote(height, 0, VoteType::Precommit, 1);
    vote_a.timestamp = time;
    let mut vote_b = vote_a.clone();
    let other = BlockHash::digest_of(b"conflicting");
    vote_b.block_id = BlockId {
        hash: other,
        parts_header: PartSetHeader {
            total: 1,
            hash: other,
        },
    };
    Evidence::DuplicateVote(DuplicateVoteEvidence {
        vote_a,
        vote_b,
        timestamp: time,
    })
}

pub fn frame(channel: u8, msg: &ConsensusMessage) -> Frame {
    Frame {
        channel,
        payload: encode_msg(msg).into(),
    }
}

/// An in-memory peer connection: returns the reactor-side `Connection`, the
/// transport-side sender for inbound frames, and the transport-side receiver
/// for outbound frames.
pub fn connection_pair(
    peer_id: PeerId,
) -> (Connection, mpsc::Sender<Frame>, mpsc::Receiver<Frame>) {
    let (out_tx, out_rx) = mpsc::channel(64);
    let (in_tx, in_rx) = mpsc::channel(64);
    (
        Connection {
            peer_id,
            sender: out_tx,
            receiver: in_rx,
        },
        in_tx,
        out_rx,
    )
}
