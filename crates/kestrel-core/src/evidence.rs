// Copyright (c) Mysten Labs, Inc.
// Modifications Copyright (c) 2025 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! Evidence of Byzantine misbehavior and the pool of items pending
//! dissemination. Evidence lives in the pool until it is committed in a
//! block or ages out.

use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
    time::Duration,
};

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{
    clist::{ConcurrentList, ListElement},
    config::ConsensusParams,
    crypto::BlockHash,
    messages::{WireError, MAX_MSG_SIZE},
    metrics::Metrics,
    types::{Height, Timestamp, Vote},
};

/// Two conflicting signed votes by one validator for the same
/// height/round/type.
#[derive(Clone, Eq, PartialEq, Serialize, Deserialize, Debug)]
pub struct DuplicateVoteEvidence {
    pub vote_a: Vote,
    pub vote_b: Vote,
    /// Time the misbehavior was observed, in Unix seconds.
    pub timestamp: Timestamp,
}

#[derive(Clone, Eq, PartialEq, Serialize, Deserialize, Debug)]
pub enum Evidence {
    DuplicateVote(DuplicateVoteEvidence),
}

impl Evidence {
    pub fn height(&self) -> Height {
        match self {
            Evidence::DuplicateVote(ev) => ev.vote_a.height,
        }
    }

    pub fn time(&self) -> Timestamp {
        match self {
            Evidence::DuplicateVote(ev) => ev.timestamp,
        }
    }

    pub fn hash(&self) -> BlockHash {
        let bytes = bincode::serialize(self).expect("Serialization of evidence failed");
        BlockHash::digest_of(&bytes)
    }

    /// Cheap structural validity check; no signature verification.
    pub fn validate_basic(&self) -> Result<(), EvidenceError> {
        match self {
            Evidence::DuplicateVote(ev) => ev.validate_basic(),
        }
    }
}

impl DuplicateVoteEvidence {
    fn validate_basic(&self) -> Result<(), EvidenceError> {
        let (a, b) = (&self.vote_a, &self.vote_b);
        if a.height != b.height || a.round != b.round || a.vote_type != b.vote_type {
            return Err(EvidenceError::Invalid(
                "duplicate votes are for different height/round/type".to_string(),
            ));
        }
        if a.validator_index != b.validator_index {
            return Err(EvidenceError::Invalid(
                "duplicate votes are by different validators".to_string(),
            ));
        }
        if a.block_id == b.block_id {
            return Err(EvidenceError::Invalid(
                "duplicate votes agree on the block".to_string(),
            ));
        }
        if a.validate_basic().is_err() || b.validate_basic().is_err() {
            return Err(EvidenceError::Invalid("malformed vote".to_string()));
        }
        Ok(())
    }
}

#[derive(Error, Debug)]
pub enum EvidenceError {
    /// Semantically invalid evidence; the peer that sent it is punished.
    #[error("invalid evidence: {0}")]
    Invalid(String),
    /// Evidence past the age limits; dropped without punishing anyone.
    #[error("evidence from height {height} is expired at height {current}")]
    Expired { height: Height, current: Height },
    /// Evidence already committed in a block; nothing left to gossip.
    #[error("evidence is already committed")]
    Committed,
}

impl EvidenceError {
    /// Only this kind costs the sending peer its connection.
    pub fn is_invalid(&self) -> bool {
        matches!(self, EvidenceError::Invalid(_))
    }
}

/// Read-only snapshot the evidence flows decide against.
#[derive(Clone, Copy, Debug, Default)]
pub struct PoolState {
    pub last_block_height: Height,
    /// Unix seconds of the last committed block.
    pub last_block_time: Timestamp,
    pub params: ConsensusParams,
}

impl PoolState {
    fn is_expired(&self, evidence: &Evidence) -> bool {
        let age_blocks = self.last_block_height.saturating_sub(evidence.height());
        let age_duration =
            Duration::from_secs(self.last_block_time.saturating_sub(evidence.time()));
        age_blocks > self.params.evidence.max_age_num_blocks
            || age_duration > self.params.evidence.max_age_duration
    }
}

/// Shared pool of pending evidence. Producers add evidence as misbehavior is
/// detected or received from peers; one broadcast loop per peer walks the
/// pending list concurrently.
pub struct EvidencePool {
    state: RwLock<PoolState>,
    pending: ConcurrentList<Evidence>,
    index: Mutex<HashMap<BlockHash, Arc<ListElement<Evidence>>>>,
    committed: Mutex<HashSet<BlockHash>>,
    metrics: Arc<Metrics>,
}

impl EvidencePool {
    pub fn new(state: PoolState, metrics: Arc<Metrics>) -> Arc<Self> {
        Arc::new(Self {
            state: RwLock::new(state),
            pending: ConcurrentList::new(),
            index: Mutex::new(HashMap::new()),
            committed: Mutex::new(HashSet::new()),
            metrics,
        })
    }

    pub fn state(&self) -> PoolState {
        *self.state.read()
    }

    /// First pending element, if any.
    pub fn pending_front(&self) -> Option<Arc<ListElement<Evidence>>> {
        self.pending.front()
    }

    /// Resolves once the pending list becomes non-empty.
    pub async fn pending_wait(&self) {
        self.pending.wait_non_empty().await
    }

    pub fn pending_evidence(&self) -> Vec<Evidence> {
        self.pending.iter_values()
    }

    /// Validates and admits one piece of evidence. Duplicates of pending
    /// evidence are accepted silently.
    pub fn add_evidence(&self, evidence: Evidence) -> Result<(), EvidenceError> {
        evidence.validate_basic()?;

        let hash = evidence.hash();
        if self.committed.lock().contains(&hash) {
            return Err(EvidenceError::Committed);
        }
        let state = self.state();
        if state.is_expired(&evidence) {
            return Err(EvidenceError::Expired {
                height: evidence.height(),
                current: state.last_block_height,
            });
        }

        let mut index = self.index.lock();
        if index.contains_key(&hash) {
            return Ok(());
        }
        tracing::debug!("Adding evidence {:?}", evidence);
        let element = self.pending.push_back(evidence);
        index.insert(hash, element);
        self.metrics.evidence_pending.set(self.pending.len() as i64);
        Ok(())
    }

    /// Removes committed evidence from the pending list and remembers it so
    /// re-gossiped copies are not re-admitted.
    pub fn mark_committed(&self, evidence: &[Evidence]) {
        let mut index = self.index.lock();
        let mut committed = self.committed.lock();
        for ev in evidence {
            let hash = ev.hash();
            committed.insert(hash);
            if let Some(element) = index.remove(&hash) {
                self.pending.remove(&element);
            }
        }
        self.metrics.evidence_pending.set(self.pending.len() as i64);
    }

    /// Refreshes the chain snapshot after a commit and drops evidence that
    /// aged out under the new state.
    pub fn update(&self, last_block_height: Height, last_block_time: Timestamp) {
        {
            let mut state = self.state.write();
            state.last_block_height = last_block_height;
            state.last_block_time = last_block_time;
        }
        self.prune_expired();
    }

    fn prune_expired(&self) {
        let state = self.state();
        let mut index = self.index.lock();
        let mut cursor = self.pending.front();
        while let Some(element) = cursor {
            let next = element.next();
            if state.is_expired(element.value()) {
                tracing::debug!("Pruning expired evidence {:?}", element.value());
                index.remove(&element.value().hash());
                self.pending.remove(&element);
            }
            cursor = next;
        }
        self.metrics.evidence_pending.set(self.pending.len() as i64);
    }
}

/// Wire form of an evidence-channel frame.
#[derive(Clone, Eq, PartialEq, Serialize, Deserialize, Debug)]
pub struct EvidenceListMessage {
    pub evidence: Vec<Evidence>,
}

pub fn encode_evidence_list(evidence: &[Evidence]) -> Vec<u8> {
    bincode::serialize(&EvidenceListMessage {
        evidence: evidence.to_vec(),
    })
    .expect("Serialization of an outbound evidence list failed")
}

pub fn decode_evidence_list(bytes: &[u8]) -> Result<Vec<Evidence>, WireError> {
    if bytes.len() > MAX_MSG_SIZE {
        return Err(WireError::Oversize(bytes.len()));
    }
    let list: EvidenceListMessage = bincode::deserialize(bytes)?;
    Ok(list.evidence)
}
