// Copyright (c) Mysten Labs, Inc.
// Modifications Copyright (c) 2025 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

use std::fmt;

use digest::Digest;
use ed25519_consensus::Signature;
use rand::{rngs::StdRng, SeedableRng};
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use zeroize::Zeroize;

use crate::{
    canonical,
    serde::{ByteRepr, BytesVisitor},
    types::Proposal,
};

pub const SIGNATURE_SIZE: usize = 64;
pub const HASH_SIZE: usize = 32;

pub type KestrelHasher = blake2::Blake2b<digest::consts::U32>;

/// Hash of a block header; doubles as the key type for all per-hash lookups.
/// The all-zero value is the "none" sentinel.
#[derive(Clone, Copy, Eq, Ord, PartialOrd, PartialEq, Default, Hash)]
pub struct BlockHash([u8; HASH_SIZE]);

#[derive(Clone, Copy, Eq, Ord, PartialOrd, PartialEq, Hash)]
pub struct SignatureBytes([u8; SIGNATURE_SIZE]);

#[derive(Clone, Eq, PartialEq, Debug)]
pub struct PublicKey(ed25519_consensus::VerificationKey);

// Box ensures value is not copied in memory when Signer itself is moved around for better security
pub struct Signer(Box<ed25519_consensus::SigningKey>);

impl BlockHash {
    pub fn new(bytes: [u8; HASH_SIZE]) -> Self {
        Self(bytes)
    }

    /// Hashes an arbitrary canonical byte encoding.
    pub fn digest_of(bytes: &[u8]) -> Self {
        let mut hasher = KestrelHasher::default();
        hasher.update(bytes);
        Self(hasher.finalize().into())
    }

    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; HASH_SIZE]
    }
}

impl Signer {
    pub fn new_for_test(n: usize) -> Vec<Self> {
        let mut rng = StdRng::seed_from_u64(0);
        (0..n)
            .map(|_| Self(Box::new(ed25519_consensus::SigningKey::new(&mut rng))))
            .collect()
    }

    /// Signs the canonical byte form of the proposal. The proposal's own
    /// signature field does not participate.
    pub fn sign_proposal(&self, chain_id: &str, proposal: &Proposal) -> SignatureBytes {
        let bytes = canonical::proposal_sign_bytes(chain_id, proposal);
        let signature = self.0.sign(&bytes);
        SignatureBytes(signature.to_bytes())
    }

    pub fn public_key(&self) -> PublicKey {
        PublicKey(self.0.verification_key())
    }
}

impl PublicKey {
    pub fn verify_proposal(
        &self,
        chain_id: &str,
        proposal: &Proposal,
    ) -> Result<(), ed25519_consensus::Error> {
        let signature = Signature::from(proposal.signature.0);
        let bytes = canonical::proposal_sign_bytes(chain_id, proposal);
        self.0.verify(&signature, &bytes)
    }
}

impl AsRef<[u8]> for BlockHash {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl AsRef<[u8]> for SignatureBytes {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl Default for SignatureBytes {
    fn default() -> Self {
        Self([0u8; SIGNATURE_SIZE])
    }
}

impl From<[u8; SIGNATURE_SIZE]> for SignatureBytes {
    fn from(bytes: [u8; SIGNATURE_SIZE]) -> Self {
        Self(bytes)
    }
}

impl fmt::Debug for BlockHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let hex_string = hex::encode(self.0);
        write!(f, "@{}", &hex_string[..4])
    }
}

impl fmt::Display for BlockHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let hex_string = hex::encode(self.0);
        write!(f, "@{}", &hex_string[..4])
    }
}

impl fmt::Debug for SignatureBytes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sig:{}", &hex::encode(self.0)[..8])
    }
}

impl fmt::Debug for Signer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Signer(public_key={:?})", self.public_key())
    }
}

impl ByteRepr for SignatureBytes {
    fn try_copy_from_slice<E: de::Error>(v: &[u8]) -> Result<Self, E> {
        if v.len() != SIGNATURE_SIZE {
            return Err(E::custom(format!("Invalid signature length: {}", v.len())));
        }
        let mut inner = [0u8; SIGNATURE_SIZE];
        inner.copy_from_slice(v);
        Ok(Self(inner))
    }
}

impl Serialize for SignatureBytes {
    #[inline]
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_bytes(&self.0)
    }
}

impl<'de> Deserialize<'de> for SignatureBytes {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserializer.deserialize_bytes(BytesVisitor::new())
    }
}

impl ByteRepr for BlockHash {
    fn try_copy_from_slice<E: de::Error>(v: &[u8]) -> Result<Self, E> {
        if v.len() != HASH_SIZE {
            return Err(E::custom(format!("Invalid hash length: {}", v.len())));
        }
        let mut inner = [0u8; HASH_SIZE];
        inner.copy_from_slice(v);
        Ok(Self(inner))
    }
}

impl Serialize for BlockHash {
    #[inline]
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_bytes(&self.0)
    }
}

impl<'de> Deserialize<'de> for BlockHash {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserializer.deserialize_bytes(BytesVisitor::new())
    }
}

impl Drop for Signer {
    fn drop(&mut self) {
        self.0.zeroize()
    }
}

pub fn dummy_signer() -> Signer {
    Signer(Box::new(ed25519_consensus::SigningKey::from([0u8; 32])))
}

pub fn dummy_public_key() -> PublicKey {
    dummy_signer().public_key()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::test_proposal;
    use crate::types::ROUND_NONE;

    #[test]
    fn sign_and_verify_proposal() {
        let signers = Signer::new_for_test(1);
        let signer = &signers[0];
        let mut proposal = test_proposal(5, 1, ROUND_NONE);
        proposal.signature = signer.sign_proposal("kai-1", &proposal);

        signer
            .public_key()
            .verify_proposal("kai-1", &proposal)
            .unwrap();
        // A different chain never verifies the same proposal.
        assert!(signer
            .public_key()
            .verify_proposal("kai-2", &proposal)
            .is_err());
        assert!(dummy_public_key()
            .verify_proposal("kai-1", &proposal)
            .is_err());

        // Tampering with a signed field breaks verification.
        proposal.height += 1;
        assert!(signer
            .public_key()
            .verify_proposal("kai-1", &proposal)
            .is_err());
    }

    #[test]
    fn hash_and_signature_serde_roundtrip() {
        let hash = BlockHash::digest_of(b"header");
        let encoded = bincode::serialize(&hash).unwrap();
        assert_eq!(bincode::deserialize::<BlockHash>(&encoded).unwrap(), hash);

        let signature = SignatureBytes::from([7u8; SIGNATURE_SIZE]);
        let encoded = bincode::serialize(&signature).unwrap();
        assert_eq!(
            bincode::deserialize::<SignatureBytes>(&encoded).unwrap(),
            signature
        );

        assert!(bincode::deserialize::<BlockHash>(&bincode::serialize(&[1u8, 2]).unwrap()).is_err());
    }

    #[test]
    fn zero_hash_sentinel() {
        assert!(BlockHash::default().is_zero());
        assert!(!BlockHash::digest_of(b"x").is_zero());
    }
}
