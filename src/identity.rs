//! Node identities and the key agreement between them.
//!
//! Every node is identified by an Ed25519 key pair. The public key doubles as the node's address:
//! its leading byte is the "node hash" used in packet paths and envelope headers, and its leading
//! four bytes identify the node inside encrypted payloads.
//!
//! Peers derive a 32-byte shared secret by X25519 over their Ed25519 keys: the secret scalar is
//! obtained from the signing seed per RFC 8032 (SHA-512 then clamp), the peer's Edwards point is
//! mapped to its Montgomery form. The secret is computed once when a contact is created and cached
//! next to it; it never appears on the air. Its leading 16 bytes key the block cipher and the full
//! 32 bytes key the MAC (see [`crypto`]).
//!
//! [`crypto`]: ../crypto/index.html

use core::fmt;

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand_core::{CryptoRng, RngCore};
use sha2::{Digest, Sha512};
use x25519_dalek::{PublicKey as X25519PublicKey, StaticSecret};

use crate::utils::HexSlice;

/// Size of an Ed25519 public key in bytes.
pub const PUB_KEY_SIZE: usize = 32;

/// Size of a stored private key: seed followed by public key, per Ed25519 convention.
pub const PRV_KEY_SIZE: usize = 64;

/// Bytes of RNG output consumed to create a new key pair.
pub const SEED_SIZE: usize = 32;

/// Size of an Ed25519 signature in bytes.
pub const SIGNATURE_SIZE: usize = 64;

/// Length of the node-hash prefix used in packet paths and envelope headers.
pub const PATH_HASH_SIZE: usize = 1;

/// Length of the node-hash prefix used inside encrypted payloads.
pub const DEST_HASH_SIZE: usize = 4;

/// A remote node's identity: its Ed25519 public key.
#[derive(Copy, Clone, PartialEq, Eq)]
pub struct Identity {
    pub pub_key: [u8; PUB_KEY_SIZE],
}

impl Identity {
    /// Creates an identity from a raw public key.
    pub fn new(pub_key: [u8; PUB_KEY_SIZE]) -> Self {
        Identity { pub_key }
    }

    /// Creates an identity from a hex-encoded public key.
    pub fn from_hex(pub_hex: &str) -> Option<Self> {
        let mut pub_key = [0; PUB_KEY_SIZE];
        if crate::utils::from_hex(&mut pub_key, pub_hex) {
            Some(Identity { pub_key })
        } else {
            None
        }
    }

    /// The single-byte node hash used in packet paths and envelope headers.
    pub fn hash_byte(&self) -> u8 {
        self.pub_key[0]
    }

    /// Returns whether `hash` (at least [`PATH_HASH_SIZE`] bytes) refers to this node.
    ///
    /// Hash prefixes are short, so a match identifies a *candidate*; callers disambiguate by
    /// trying the MAC of the payload against each candidate's shared secret.
    ///
    /// [`PATH_HASH_SIZE`]: constant.PATH_HASH_SIZE.html
    pub fn is_hash_match(&self, hash: &[u8]) -> bool {
        hash[..PATH_HASH_SIZE] == self.pub_key[..PATH_HASH_SIZE]
    }

    /// Returns whether this is the same identity as `other`.
    pub fn matches(&self, other: &Identity) -> bool {
        self.pub_key == other.pub_key
    }

    /// Verifies an Ed25519 signature over `message`.
    pub fn verify(&self, sig: &[u8; SIGNATURE_SIZE], message: &[u8]) -> bool {
        let key = match VerifyingKey::from_bytes(&self.pub_key) {
            Ok(key) => key,
            Err(_) => return false,
        };
        key.verify(message, &Signature::from_bytes(sig)).is_ok()
    }
}

impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Identity({:?})", HexSlice(&self.pub_key[..4]))
    }
}

/// A shared secret resulting from the key agreement between two identities.
#[derive(Clone)]
pub struct SharedSecret(pub [u8; 32]);

/// This node's own identity: an Ed25519 key pair.
pub struct LocalIdentity {
    signing: SigningKey,
    id: Identity,
}

impl LocalIdentity {
    /// Generates a fresh identity, consuming [`SEED_SIZE`] bytes of randomness.
    ///
    /// [`SEED_SIZE`]: constant.SEED_SIZE.html
    pub fn generate<R: RngCore + CryptoRng>(rng: &mut R) -> Self {
        let mut seed = [0; SEED_SIZE];
        rng.fill_bytes(&mut seed);
        Self::from_signing_key(SigningKey::from_bytes(&seed))
    }

    fn from_signing_key(signing: SigningKey) -> Self {
        let id = Identity::new(signing.verifying_key().to_bytes());
        LocalIdentity { signing, id }
    }

    /// Restores an identity from a stored blob, as written by [`write_to`].
    ///
    /// Accepts either the full [`PRV_KEY_SIZE`]-byte form (seed followed by public key, which is
    /// checked for consistency) or just the 32-byte seed, from which the public key is re-derived.
    ///
    /// [`write_to`]: #method.write_to
    /// [`PRV_KEY_SIZE`]: constant.PRV_KEY_SIZE.html
    pub fn read_from(src: &[u8]) -> Option<Self> {
        if src.len() >= PRV_KEY_SIZE {
            let mut blob = [0; PRV_KEY_SIZE];
            blob.copy_from_slice(&src[..PRV_KEY_SIZE]);
            let signing = SigningKey::from_keypair_bytes(&blob).ok()?;
            Some(Self::from_signing_key(signing))
        } else if src.len() >= SEED_SIZE {
            let mut seed = [0; SEED_SIZE];
            seed.copy_from_slice(&src[..SEED_SIZE]);
            Some(Self::from_signing_key(SigningKey::from_bytes(&seed)))
        } else {
            None
        }
    }

    /// Serializes the key pair into `dest` for persistent storage.
    ///
    /// Writes seed followed by public key when `dest` has room for both, just the seed when it
    /// only fits [`SEED_SIZE`] bytes. Returns the number of bytes written, 0 if `dest` is too
    /// small.
    ///
    /// [`SEED_SIZE`]: constant.SEED_SIZE.html
    pub fn write_to(&self, dest: &mut [u8]) -> usize {
        if dest.len() >= PRV_KEY_SIZE {
            dest[..PRV_KEY_SIZE].copy_from_slice(&self.signing.to_keypair_bytes());
            PRV_KEY_SIZE
        } else if dest.len() >= SEED_SIZE {
            dest[..SEED_SIZE].copy_from_slice(&self.signing.to_bytes());
            SEED_SIZE
        } else {
            0
        }
    }

    /// The public half of this identity.
    pub fn id(&self) -> &Identity {
        &self.id
    }

    /// The single-byte node hash of this node.
    pub fn hash_byte(&self) -> u8 {
        self.id.hash_byte()
    }

    /// Signs `message` with this identity's private key.
    pub fn sign(&self, message: &[u8]) -> [u8; SIGNATURE_SIZE] {
        self.signing.sign(message).to_bytes()
    }

    /// Performs the X25519 key agreement with `other`, yielding the 32-byte shared secret.
    ///
    /// Returns `None` when `other`'s public key is not a valid curve point. The result is
    /// symmetric: `a.shared_secret(b.id()) == b.shared_secret(a.id())`.
    pub fn shared_secret(&self, other: &Identity) -> Option<SharedSecret> {
        let their_edwards = VerifyingKey::from_bytes(&other.pub_key).ok()?;
        let their_x25519 = X25519PublicKey::from(their_edwards.to_montgomery().to_bytes());

        // RFC 8032 scalar derivation; the X25519 implementation applies the clamp again, which is
        // idempotent.
        let mut hash = Sha512::new();
        hash.update(self.signing.to_bytes());
        let digest = hash.finalize();
        let mut scalar = [0; 32];
        scalar.copy_from_slice(&digest[..32]);

        let secret = StaticSecret::from(scalar).diffie_hellman(&their_x25519);
        Some(SharedSecret(*secret.as_bytes()))
    }
}

impl fmt::Debug for LocalIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Never print private key material.
        write!(f, "LocalIdentity({:?})", HexSlice(&self.id.pub_key[..4]))
    }
}
