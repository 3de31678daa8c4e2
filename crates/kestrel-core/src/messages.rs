// Copyright (c) Mysten Labs, Inc.
// Modifications Copyright (c) 2025 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! Consensus wire messages and their stable opcode registry.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::{
    BitArray, Block, Height, Proposal, Round, RoundStep, ValidatorIndex, Vote, VoteType,
};

/// Logical channels multiplexed over a peer connection.
pub const STATE_CHANNEL: u8 = 0x20;
pub const DATA_CHANNEL: u8 = 0x21;
pub const VOTE_CHANNEL: u8 = 0x22;
pub const VOTE_SET_BITS_CHANNEL: u8 = 0x23;
pub const EVIDENCE_CHANNEL: u8 = 0x38;

/// Maximum size of a single decoded frame on any channel.
pub const MAX_MSG_SIZE: usize = 1_048_576; // 1 MiB

// Wire opcodes. These values are part of the protocol; never renumber.
pub const CS_NEW_ROUND_STEP_MSG: u8 = 0x01;
pub const CS_COMMIT_STEP_MSG: u8 = 0x02;
pub const CS_PROPOSAL_MSG: u8 = 0x03;
pub const CS_PROPOSAL_POL_MSG: u8 = 0x04;
pub const CS_VOTE_MSG: u8 = 0x05;
pub const CS_HAS_VOTE_MSG: u8 = 0x06;

/// Declares one channel of a reactor at registration time.
#[derive(Clone, Copy, Debug)]
pub struct ChannelDescriptor {
    pub id: u8,
    pub priority: u8,
    pub recv_capacity: usize,
}

/// Sent for every height/round/step transition of the local state machine.
#[derive(Clone, Eq, PartialEq, Serialize, Deserialize, Debug)]
pub struct NewRoundStepMessage {
    pub height: Height,
    pub round: Round,
    pub step: RoundStep,
    pub seconds_since_start: u64,
    pub last_commit_round: Round,
}

/// Sent when a block is committed.
#[derive(Clone, Eq, PartialEq, Serialize, Deserialize, Debug)]
pub struct CommitStepMessage {
    pub height: Height,
    pub block: Block,
}

/// Sent when a new block is proposed.
#[derive(Clone, Eq, PartialEq, Serialize, Deserialize, Debug)]
pub struct ProposalMessage {
    pub proposal: Proposal,
}

/// Sent when a previous-round proposal is re-proposed, announcing which
/// proof-of-lock prevotes we hold.
#[derive(Clone, Eq, PartialEq, Serialize, Deserialize, Debug)]
pub struct ProposalPolMessage {
    pub height: Height,
    pub proposal_pol_round: Round,
    pub proposal_pol: BitArray,
}

/// Carries a single signed vote.
#[derive(Clone, Eq, PartialEq, Serialize, Deserialize, Debug)]
pub struct VoteMessage {
    pub vote: Vote,
}

/// Announces that a particular vote has been received, without carrying it.
#[derive(Clone, Eq, PartialEq, Serialize, Deserialize, Debug)]
pub struct HasVoteMessage {
    pub height: Height,
    pub round: Round,
    pub vote_type: VoteType,
    pub index: ValidatorIndex,
}

#[derive(Clone, Eq, PartialEq, Debug)]
pub enum ConsensusMessage {
    NewRoundStep(NewRoundStepMessage),
    CommitStep(CommitStepMessage),
    Proposal(ProposalMessage),
    ProposalPol(ProposalPolMessage),
    Vote(VoteMessage),
    HasVote(HasVoteMessage),
}

impl ConsensusMessage {
    pub fn opcode(&self) -> u8 {
        match self {
            ConsensusMessage::NewRoundStep(_) => CS_NEW_ROUND_STEP_MSG,
            ConsensusMessage::CommitStep(_) => CS_COMMIT_STEP_MSG,
            ConsensusMessage::Proposal(_) => CS_PROPOSAL_MSG,
            ConsensusMessage::ProposalPol(_) => CS_PROPOSAL_POL_MSG,
            ConsensusMessage::Vote(_) => CS_VOTE_MSG,
            ConsensusMessage::HasVote(_) => CS_HAS_VOTE_MSG,
        }
    }
}

#[derive(Error, Debug)]
pub enum WireError {
    #[error("frame of {0} bytes exceeds the 1 MiB limit")]
    Oversize(usize),
    #[error("unknown message opcode {0:#04x}")]
    UnknownOpcode(u8),
    #[error("empty frame")]
    Empty,
    #[error("codec failure: {0}")]
    Codec(#[from] bincode::Error),
}

/// Encodes a message as `opcode || bincode(body)`. The transport adds the
/// length prefix. Encoding a well-formed message cannot fail; a failure here
/// is a programmer error.
pub fn encode_msg(msg: &ConsensusMessage) -> Vec<u8> {
    let body = match msg {
        ConsensusMessage::NewRoundStep(m) => bincode::serialize(m),
        ConsensusMessage::CommitStep(m) => bincode::serialize(m),
        ConsensusMessage::Proposal(m) => bincode::serialize(m),
        ConsensusMessage::ProposalPol(m) => bincode::serialize(m),
        ConsensusMessage::Vote(m) => bincode::serialize(m),
        ConsensusMessage::HasVote(m) => bincode::serialize(m),
    }
    .expect("Serialization of an outbound consensus message failed");
    let mut out = Vec::with_capacity(body.len() + 1);
    out.push(msg.opcode());
    out.extend_from_slice(&body);
    out
}

pub fn decode_msg(bytes: &[u8]) -> Result<ConsensusMessage, WireError> {
    if bytes.len() > MAX_MSG_SIZE {
        return Err(WireError::Oversize(bytes.len()));
    }
    let (&opcode, body) = bytes.split_first().ok_or(WireError::Empty)?;
    let msg = match opcode {
        CS_NEW_ROUND_STEP_MSG => ConsensusMessage::NewRoundStep(bincode::deserialize(body)?),
        CS_COMMIT_STEP_MSG => ConsensusMessage::CommitStep(bincode::deserialize(body)?),
        CS_PROPOSAL_MSG => ConsensusMessage::Proposal(bincode::deserialize(body)?),
        CS_PROPOSAL_POL_MSG => ConsensusMessage::ProposalPol(bincode::deserialize(body)?),
        CS_VOTE_MSG => ConsensusMessage::Vote(bincode::deserialize(body)?),
        CS_HAS_VOTE_MSG => ConsensusMessage::HasVote(bincode::deserialize(body)?),
        other => return Err(WireError::UnknownOpcode(other)),
    };
    Ok(msg)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::{test_proposal, test_vote};
    use crate::types::ROUND_NONE;

    #[test]
    fn opcodes_are_stable() {
        let nrs = ConsensusMessage::NewRoundStep(NewRoundStepMessage {
            height: 1,
            round: 0,
            step: RoundStep::Propose,
            seconds_since_start: 0,
            last_commit_round: ROUND_NONE,
        });
        let proposal = ConsensusMessage::Proposal(ProposalMessage {
            proposal: test_proposal(1, 0, ROUND_NONE),
        });
        let has_vote = ConsensusMessage::HasVote(HasVoteMessage {
            height: 1,
            round: 0,
            vote_type: VoteType::Prevote,
            index: 3,
        });
        assert_eq!(encode_msg(&nrs)[0], 0x01);
        assert_eq!(encode_msg(&proposal)[0], 0x03);
        assert_eq!(encode_msg(&has_vote)[0], 0x06);
    }

    #[test]
    fn roundtrip() {
        let messages = vec![
            ConsensusMessage::NewRoundStep(NewRoundStepMessage {
                height: 7,
                round: 2,
                step: RoundStep::Prevote,
                seconds_since_start: 12,
                last_commit_round: 1,
            }),
            ConsensusMessage::Proposal(ProposalMessage {
                proposal: test_proposal(7, 2, 1),
            }),
            ConsensusMessage::ProposalPol(ProposalPolMessage {
                height: 7,
                proposal_pol_round: 1,
                proposal_pol: {
                    let mut bits = BitArray::new(4);
                    bits.set(0);
                    bits.set(2);
                    bits
                },
            }),
            ConsensusMessage::Vote(VoteMessage {
                vote: test_vote(7, 2, VoteType::Precommit, 1),
            }),
            ConsensusMessage::HasVote(HasVoteMessage {
                height: 7,
                round: 2,
                vote_type: VoteType::Precommit,
                index: 1,
            }),
        ];
        for msg in messages {
            let decoded = decode_msg(&encode_msg(&msg)).unwrap();
            assert_eq!(msg, decoded);
        }
    }

    #[test]
    fn decode_rejects_garbage() {
        assert!(matches!(decode_msg(&[]), Err(WireError::Empty)));
        assert!(matches!(
            decode_msg(&[0x7f, 1, 2, 3]),
            Err(WireError::UnknownOpcode(0x7f))
        ));
        assert!(matches!(
            decode_msg(&[CS_VOTE_MSG, 1, 2, 3]),
            Err(WireError::Codec(_))
        ));
        let oversize = vec![0u8; MAX_MSG_SIZE + 1];
        assert!(matches!(
            decode_msg(&oversize),
            Err(WireError::Oversize(_))
        ));
    }
}
