// Copyright (c) Mysten Labs, Inc.
// Modifications Copyright (c) 2025 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

pub type Height = u64;
pub type Round = i32;
pub type ValidatorIndex = u32;
pub type PeerId = u64;
pub type Timestamp = u64;

use std::fmt;

use eyre::{ensure, Result};
use serde::{Deserialize, Serialize};

use crate::{
    canonical,
    crypto::{BlockHash, SignatureBytes},
};

/// Round sentinel for "no round" (no POL, no last commit yet).
pub const ROUND_NONE: Round = -1;

/// Steps of a single consensus round, in execution order. The derived `Ord`
/// is load-bearing: height/round/step triples compare lexicographically.
#[derive(
    Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize, Debug, Default,
)]
pub enum RoundStep {
    #[default]
    NewHeight,
    NewRound,
    Propose,
    Prevote,
    PrevoteWait,
    Precommit,
    PrecommitWait,
    Commit,
}

impl fmt::Display for RoundStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RoundStep::NewHeight => "NewHeight",
            RoundStep::NewRound => "NewRound",
            RoundStep::Propose => "Propose",
            RoundStep::Prevote => "Prevote",
            RoundStep::PrevoteWait => "PrevoteWait",
            RoundStep::Precommit => "Precommit",
            RoundStep::PrecommitWait => "PrecommitWait",
            RoundStep::Commit => "Commit",
        };
        write!(f, "{name}")
    }
}

#[derive(Clone, Copy, Eq, PartialEq, Serialize, Deserialize, Default, Debug)]
pub struct PartSetHeader {
    pub total: u32,
    pub hash: BlockHash,
}

impl PartSetHeader {
    pub fn is_zero(&self) -> bool {
        self.total == 0 && self.hash.is_zero()
    }
}

/// Identifies a block by header hash plus the header of its part set.
#[derive(Clone, Copy, Eq, PartialEq, Serialize, Deserialize, Default, Debug)]
pub struct BlockId {
    pub hash: BlockHash,
    pub parts_header: PartSetHeader,
}

impl BlockId {
    pub fn zero() -> Self {
        Self::default()
    }

    pub fn is_zero(&self) -> bool {
        self.hash.is_zero() && self.parts_header.is_zero()
    }
}

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_zero() {
            write!(f, "nil-block")
        } else {
            write!(f, "{}:{}", self.hash, self.parts_header.total)
        }
    }
}

#[derive(Clone, Eq, PartialEq, Serialize, Deserialize, Debug)]
pub struct Header {
    pub height: Height,
    pub time: Timestamp,
    /// Hash of the previous header; the rollback walk follows this link.
    pub last_commit_hash: BlockHash,
    pub app_hash: BlockHash,
}

impl Header {
    pub fn hash(&self) -> BlockHash {
        BlockHash::digest_of(&canonical::header_bytes(self))
    }
}

#[derive(Clone, Eq, PartialEq, Serialize, Deserialize, Debug)]
pub struct Block {
    pub header: Header,
}

impl Block {
    pub fn hash(&self) -> BlockHash {
        self.header.hash()
    }

    pub fn block_id(&self) -> BlockId {
        BlockId {
            hash: self.hash(),
            parts_header: PartSetHeader {
                total: 1,
                hash: self.hash(),
            },
        }
    }
}

/// A block proposal for a given height/round. Must be signed by the correct
/// proposer to be considered valid. May carry a proof-of-lock round whose
/// prevotes justify re-proposing a block; `pol_round == ROUND_NONE` means none.
#[derive(Clone, Eq, PartialEq, Serialize, Deserialize, Debug)]
pub struct Proposal {
    pub height: Height,
    pub round: Round,
    pub pol_round: Round,
    pub timestamp: Timestamp,
    pub pol_block_id: BlockId,
    pub block: Block,
    pub signature: SignatureBytes,
}

impl Proposal {
    pub fn validate_basic(&self) -> Result<()> {
        ensure!(self.round >= 0, "proposal round must be non-negative");
        ensure!(
            self.pol_round >= ROUND_NONE && self.pol_round < self.round,
            "proposal POL round {} out of range for round {}",
            self.pol_round,
            self.round
        );
        ensure!(
            self.block.header.height == self.height,
            "proposal block height {} does not match proposal height {}",
            self.block.header.height,
            self.height
        );
        if self.pol_round == ROUND_NONE {
            ensure!(
                self.pol_block_id.is_zero(),
                "proposal without POL round must carry the zero POL block id"
            );
        }
        Ok(())
    }
}

impl fmt::Display for Proposal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Proposal{{{}/{} pol:{} {} @{}}}",
            self.height,
            self.round,
            self.pol_round,
            self.pol_block_id,
            self.timestamp
        )
    }
}

#[derive(Clone, Copy, Eq, PartialEq, Hash, Serialize, Deserialize, Debug)]
pub enum VoteType {
    Prevote,
    Precommit,
}

impl fmt::Display for VoteType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VoteType::Prevote => write!(f, "prevote"),
            VoteType::Precommit => write!(f, "precommit"),
        }
    }
}

/// A signed prevote or precommit, uniquely identified by
/// `(height, round, vote_type, validator_index)`.
#[derive(Clone, Eq, PartialEq, Serialize, Deserialize, Debug)]
pub struct Vote {
    pub vote_type: VoteType,
    pub height: Height,
    pub round: Round,
    pub validator_index: ValidatorIndex,
    pub block_id: BlockId,
    pub timestamp: Timestamp,
    pub signature: SignatureBytes,
}

impl Vote {
    pub fn validate_basic(&self) -> Result<()> {
        ensure!(self.round >= 0, "vote round must be non-negative");
        Ok(())
    }
}

impl fmt::Display for Vote {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Vote{{{} {}/{} v{} {}}}",
            self.vote_type, self.height, self.round, self.validator_index, self.block_id
        )
    }
}

/// Fixed-size indexed bit array over the validator set.
#[derive(Clone, Eq, PartialEq, Serialize, Deserialize, Debug)]
pub struct BitArray {
    bits: usize,
    words: Vec<u64>,
}

impl BitArray {
    pub fn new(bits: usize) -> Self {
        Self {
            bits,
            words: vec![0; bits.div_ceil(64)],
        }
    }

    pub fn len(&self) -> usize {
        self.bits
    }

    pub fn is_empty(&self) -> bool {
        self.bits == 0
    }

    /// Sets bit `index`. Out-of-range indices are ignored.
    pub fn set(&mut self, index: usize) -> bool {
        if index >= self.bits {
            return false;
        }
        self.words[index / 64] |= 1u64 << (index % 64);
        true
    }

    pub fn get(&self, index: usize) -> bool {
        if index >= self.bits {
            return false;
        }
        self.words[index / 64] & (1u64 << (index % 64)) != 0
    }

    /// OR-merges `other` into `self` over the common prefix.
    pub fn or(&mut self, other: &BitArray) {
        for (w, o) in self.words.iter_mut().zip(other.words.iter()) {
            *w |= o;
        }
    }

    pub fn present(&self) -> impl Iterator<Item = usize> + '_ {
        (0..self.bits).filter(move |&i| self.get(i))
    }

    pub fn count(&self) -> usize {
        self.words.iter().map(|w| w.count_ones() as usize).sum()
    }
}

impl fmt::Display for BitArray {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for i in 0..self.bits {
            write!(f, "{}", if self.get(i) { 'x' } else { '_' })?;
        }
        Ok(())
    }
}
