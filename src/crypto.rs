//! # Cryptography Seam
//!
//! The overlay consumes cryptographic primitives through the [`CryptoScheme`]
//! trait: hashing for identifiers, keys and merkle material, plus signing and
//! verification for claims and pulse proofs. The network core never names a
//! concrete algorithm outside this module.
//!
//! [`PlatformScheme`] is the default implementation: blake3 for hashing
//! (64-byte reference hashes via the XOF, 20-byte identifier hashes by
//! truncation) and Ed25519 for signatures.
//!
//! [`select_by_entropy`] is the deterministic sampling primitive used by role
//! selection: candidates are ranked by the reference hash of
//! `entropy || candidate` and the first `count` taken.

use std::fmt;

use ed25519_dalek::{Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;

use crate::id::{NodeId, NODE_HASH_LEN};

/// Width of a reference hash in bytes.
pub const REFERENCE_HASH_LEN: usize = 64;

/// Abstract cryptography provider for the network core.
pub trait CryptoScheme: Send + Sync + 'static {
    /// Wide hash used for merkle material and entropy mixing.
    fn reference_hash(&self, data: &[u8]) -> Vec<u8>;

    /// Identifier-width hash used for node IDs and storage keys.
    fn id_hash(&self, data: &[u8]) -> [u8; NODE_HASH_LEN];

    /// Sign with this node's key.
    fn sign(&self, data: &[u8]) -> Vec<u8>;

    /// Verify a signature under an encoded public key.
    fn verify(&self, public_key: &[u8], data: &[u8], signature: &[u8]) -> bool;

    /// This node's encoded public key.
    fn public_key(&self) -> Vec<u8>;
}

/// Default scheme: blake3 hashing, Ed25519 signatures.
pub struct PlatformScheme {
    signing: SigningKey,
}

impl PlatformScheme {
    /// Generate a scheme with a fresh keypair.
    pub fn generate() -> Self {
        Self {
            signing: SigningKey::generate(&mut OsRng),
        }
    }

    pub fn from_secret_key_bytes(bytes: &[u8; 32]) -> Self {
        Self {
            signing: SigningKey::from_bytes(bytes),
        }
    }

    pub fn secret_key_bytes(&self) -> [u8; 32] {
        self.signing.to_bytes()
    }

    /// Derive the node identifier bound to this scheme's public key.
    pub fn node_id(&self) -> NodeId {
        NodeId::from_bytes(self.id_hash(&self.public_key()))
    }
}

impl fmt::Debug for PlatformScheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PlatformScheme")
            .field("public_key", &hex::encode(self.public_key()))
            .finish_non_exhaustive()
    }
}

impl CryptoScheme for PlatformScheme {
    fn reference_hash(&self, data: &[u8]) -> Vec<u8> {
        let mut hasher = blake3::Hasher::new();
        hasher.update(data);
        let mut out = vec![0u8; REFERENCE_HASH_LEN];
        hasher.finalize_xof().fill(&mut out);
        out
    }

    fn id_hash(&self, data: &[u8]) -> [u8; NODE_HASH_LEN] {
        let digest = blake3::hash(data);
        let mut out = [0u8; NODE_HASH_LEN];
        out.copy_from_slice(&digest.as_bytes()[..NODE_HASH_LEN]);
        out
    }

    fn sign(&self, data: &[u8]) -> Vec<u8> {
        self.signing.sign(data).to_bytes().to_vec()
    }

    fn verify(&self, public_key: &[u8], data: &[u8], signature: &[u8]) -> bool {
        let key_bytes: [u8; 32] = match public_key.try_into() {
            Ok(bytes) => bytes,
            Err(_) => return false,
        };
        let key = match VerifyingKey::from_bytes(&key_bytes) {
            Ok(key) => key,
            Err(_) => return false,
        };
        let signature = match ed25519_dalek::Signature::from_slice(signature) {
            Ok(sig) => sig,
            Err(_) => return false,
        };
        key.verify(data, &signature).is_ok()
    }

    fn public_key(&self) -> Vec<u8> {
        self.signing.verifying_key().to_bytes().to_vec()
    }
}

/// Error returned when a selection asks for more candidates than exist.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SelectionError {
    pub requested: usize,
    pub available: usize,
}

impl fmt::Display for SelectionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "cannot select {} candidates out of {}",
            self.requested, self.available
        )
    }
}

impl std::error::Error for SelectionError {}

/// Deterministically draw `count` distinct candidates using `entropy`.
///
/// Candidates are ranked by `reference_hash(entropy || candidate)`, ties by
/// the candidate bytes themselves, and the first `count` are returned. The
/// ranking does not depend on the input order.
pub fn select_by_entropy(
    scheme: &dyn CryptoScheme,
    entropy: &[u8],
    candidates: &[NodeId],
    count: usize,
) -> Result<Vec<NodeId>, SelectionError> {
    if count > candidates.len() {
        return Err(SelectionError {
            requested: count,
            available: candidates.len(),
        });
    }

    let mut ranked: Vec<(Vec<u8>, NodeId)> = candidates
        .iter()
        .map(|id| {
            let mut material = Vec::with_capacity(entropy.len() + NODE_HASH_LEN);
            material.extend_from_slice(entropy);
            material.extend_from_slice(id.as_bytes());
            (scheme.reference_hash(&material), *id)
        })
        .collect();
    ranked.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.cmp(&b.1)));

    Ok(ranked.into_iter().take(count).map(|(_, id)| id).collect())
}
