// Copyright (c) Mysten Labs, Inc.
// Modifications Copyright (c) 2025 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! Canonical byte encoding used for everything that gets signed or hashed.
//!
//! The scheme is a recursive length-prefixed encoding: every value is written
//! as a big-endian `u32` byte length followed by its payload; a record's
//! payload is the concatenation of its encoded fields in declared order.
//! Identical inputs produce identical bytes on every platform.

use crate::types::{BlockId, Header, Proposal};

/// Type tag mixed into proposal sign bytes so encodings of different record
/// kinds can never collide.
const PROPOSAL_TYPE_TAG: &str = "proposal";

fn write_bytes(buf: &mut Vec<u8>, payload: &[u8]) {
    buf.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    buf.extend_from_slice(payload);
}

fn write_str(buf: &mut Vec<u8>, value: &str) {
    write_bytes(buf, value.as_bytes());
}

fn write_u64(buf: &mut Vec<u8>, value: u64) {
    write_bytes(buf, &value.to_be_bytes());
}

fn write_u32(buf: &mut Vec<u8>, value: u32) {
    write_bytes(buf, &value.to_be_bytes());
}

fn write_i32(buf: &mut Vec<u8>, value: i32) {
    write_bytes(buf, &value.to_be_bytes());
}

fn block_id_fields(id: &BlockId) -> Vec<u8> {
    let mut fields = Vec::with_capacity(80);
    write_bytes(&mut fields, id.hash.as_ref());
    write_u32(&mut fields, id.parts_header.total);
    write_bytes(&mut fields, id.parts_header.hash.as_ref());
    fields
}

/// Canonical bytes of a proposal for signing, in the fixed field order
/// `(chain_id, type, height, round, pol_round, pol_block_id, timestamp)`.
/// The proposal's signature and block payload are excluded. `chain_id` mixes
/// in only here; distinct chains never produce colliding sign bytes for the
/// same height and round. `pol_round == -1` together with the zero
/// `pol_block_id` encodes the "no proof-of-lock" case.
pub fn proposal_sign_bytes(chain_id: &str, proposal: &Proposal) -> Vec<u8> {
    let mut fields = Vec::with_capacity(160);
    write_str(&mut fields, chain_id);
    write_str(&mut fields, PROPOSAL_TYPE_TAG);
    write_u64(&mut fields, proposal.height);
    write_u32(&mut fields, proposal.round as u32);
    write_i32(&mut fields, proposal.pol_round);
    write_bytes(&mut fields, &block_id_fields(&proposal.pol_block_id));
    write_u64(&mut fields, proposal.timestamp);

    let mut out = Vec::with_capacity(fields.len() + 4);
    write_bytes(&mut out, &fields);
    out
}

/// Canonical bytes of a header, hashed to produce its identity.
pub fn header_bytes(header: &Header) -> Vec<u8> {
    let mut fields = Vec::with_capacity(96);
    write_u64(&mut fields, header.height);
    write_u64(&mut fields, header.time);
    write_bytes(&mut fields, header.last_commit_hash.as_ref());
    write_bytes(&mut fields, header.app_hash.as_ref());

    let mut out = Vec::with_capacity(fields.len() + 4);
    write_bytes(&mut out, &fields);
    out
}
