//! Group channels: symmetric-key multicast namespaces.
//!
//! A group channel is nothing more than a pre-shared key; membership is implicit in knowledge of
//! the key. On the wire a group datagram carries the channel's single-byte hash, so receivers can
//! cheaply find candidate channels before attempting the MAC.

use crate::crypto;
use crate::identity::PATH_HASH_SIZE;

/// A group channel: a pre-shared secret and the hash identifying it on the wire.
#[derive(Copy, Clone)]
pub struct GroupChannel {
    /// Wire identifier: leading byte(s) of the SHA-256 of the key material.
    pub hash: [u8; PATH_HASH_SIZE],
    /// Channel key: the leading 16 bytes key the cipher, the whole 32 key the MAC.
    pub secret: [u8; 32],
}

impl GroupChannel {
    /// Creates a channel from pre-shared key material of 16 or 32 bytes.
    ///
    /// The wire hash is computed over the key material as given; a 16-byte key is zero-extended
    /// to the 32 bytes the MAC expects.
    pub fn from_psk(psk: &[u8]) -> Option<Self> {
        if psk.len() != 16 && psk.len() != 32 {
            return None;
        }
        let mut hash = [0; PATH_HASH_SIZE];
        crypto::sha256(&mut hash, psk);
        let mut secret = [0; 32];
        secret[..psk.len()].copy_from_slice(psk);
        Some(GroupChannel { hash, secret })
    }
}

impl Default for GroupChannel {
    fn default() -> Self {
        GroupChannel {
            hash: [0; PATH_HASH_SIZE],
            secret: [0; 32],
        }
    }
}
