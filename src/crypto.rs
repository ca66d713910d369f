//! Symmetric primitives used for payload protection.
//!
//! Unicast and group payloads are protected by AES-128 in ECB mode over zero-padded 16-byte
//! blocks, authenticated by a truncated HMAC-SHA-256 tag computed over the ciphertext. The wire
//! format of a protected body is `MAC || CIPHER`.
//!
//! The scheme is deliberately deterministic per (key, plaintext): there is no per-packet nonce.
//! Replay protection instead relies on the timestamp carried at the start of every plaintext,
//! which receivers require to be strictly increasing per sender.

use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockDecrypt, BlockEncrypt, KeyInit};
use aes::Aes128;
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

/// Bytes of key material consumed by the block cipher (the leading half of a shared secret).
pub const CIPHER_KEY_SIZE: usize = 16;

/// Block size of the cipher; protected bodies are padded to a multiple of this.
pub const CIPHER_BLOCK_SIZE: usize = 16;

/// Bytes of truncated HMAC-SHA-256 prepended to each protected body.
pub const CIPHER_MAC_SIZE: usize = 2;

/// Size of the HMAC key (a full shared secret).
pub const MAC_KEY_SIZE: usize = 32;

type HmacSha256 = Hmac<Sha256>;

/// Computes SHA-256 over `msg`, truncated to `hash.len()` bytes (at most 32).
pub fn sha256(hash: &mut [u8], msg: &[u8]) {
    let digest = Sha256::digest(msg);
    let n = hash.len().min(digest.len());
    hash[..n].copy_from_slice(&digest[..n]);
}

/// Computes SHA-256 over the concatenation of two fragments, truncated to `hash.len()` bytes.
///
/// Used to derive acknowledgement tags from (message bytes, sender public key) without assembling
/// them in one buffer.
pub fn sha256_pair(hash: &mut [u8], frag1: &[u8], frag2: &[u8]) {
    let mut sha = Sha256::new();
    sha.update(frag1);
    sha.update(frag2);
    let digest = sha.finalize();
    let n = hash.len().min(digest.len());
    hash[..n].copy_from_slice(&digest[..n]);
}

/// Returns the ciphertext length for a plaintext of `plain_len` bytes: the length rounded up to
/// the next whole cipher block.
pub const fn cipher_len(plain_len: usize) -> usize {
    (plain_len + CIPHER_BLOCK_SIZE - 1) / CIPHER_BLOCK_SIZE * CIPHER_BLOCK_SIZE
}

/// Encrypts `src` into `dest` under the leading 16 bytes of `secret`, zero-padding the trailing
/// block. Returns the number of ciphertext bytes written (always a multiple of 16).
pub fn encrypt(secret: &[u8; MAC_KEY_SIZE], dest: &mut [u8], src: &[u8]) -> usize {
    let aes = Aes128::new(GenericArray::from_slice(&secret[..CIPHER_KEY_SIZE]));

    let mut n = 0;
    for chunk in src.chunks(CIPHER_BLOCK_SIZE) {
        let mut block = [0; CIPHER_BLOCK_SIZE];
        block[..chunk.len()].copy_from_slice(chunk);
        let block = GenericArray::from_mut_slice(&mut block);
        aes.encrypt_block(block);
        dest[n..n + CIPHER_BLOCK_SIZE].copy_from_slice(block);
        n += CIPHER_BLOCK_SIZE;
    }
    n
}

/// Decrypts `src` (a whole number of blocks) into `dest`. Returns the number of plaintext bytes
/// written, always a multiple of 16; the caller recovers the content length from the payload
/// itself (eg. a trailing null after text).
pub fn decrypt(secret: &[u8; MAC_KEY_SIZE], dest: &mut [u8], src: &[u8]) -> usize {
    let aes = Aes128::new(GenericArray::from_slice(&secret[..CIPHER_KEY_SIZE]));

    let mut n = 0;
    for chunk in src.chunks_exact(CIPHER_BLOCK_SIZE) {
        let block = GenericArray::from_mut_slice(&mut dest[n..n + CIPHER_BLOCK_SIZE]);
        block.copy_from_slice(chunk);
        aes.decrypt_block(block);
        n += CIPHER_BLOCK_SIZE;
    }
    n
}

fn hmac_tag(secret: &[u8; MAC_KEY_SIZE], data: &[u8]) -> [u8; CIPHER_MAC_SIZE] {
    let mut mac =
        <HmacSha256 as Mac>::new_from_slice(secret).expect("HMAC accepts any key length");
    mac.update(data);
    let out = mac.finalize().into_bytes();
    let mut tag = [0; CIPHER_MAC_SIZE];
    tag.copy_from_slice(&out[..CIPHER_MAC_SIZE]);
    tag
}

/// Encrypts `src` and prepends a truncated HMAC-SHA-256 tag of the ciphertext, both under
/// `secret`. Writes `MAC || CIPHER` into `dest` and returns the total length.
///
/// `dest` must have room for `CIPHER_MAC_SIZE + cipher_len(src.len())` bytes.
pub fn encrypt_then_mac(secret: &[u8; MAC_KEY_SIZE], dest: &mut [u8], src: &[u8]) -> usize {
    let enc_len = encrypt(secret, &mut dest[CIPHER_MAC_SIZE..], src);
    let tag = hmac_tag(secret, &dest[CIPHER_MAC_SIZE..CIPHER_MAC_SIZE + enc_len]);
    dest[..CIPHER_MAC_SIZE].copy_from_slice(&tag);
    CIPHER_MAC_SIZE + enc_len
}

/// Verifies the leading MAC of `src` (in constant time) and, on success, decrypts the remainder
/// into `dest`, returning the plaintext length. Returns `None` without touching `dest` when the
/// tag does not match or `src` is too short.
pub fn mac_then_decrypt(
    secret: &[u8; MAC_KEY_SIZE],
    dest: &mut [u8],
    src: &[u8],
) -> Option<usize> {
    if src.len() <= CIPHER_MAC_SIZE {
        return None;
    }

    let tag = hmac_tag(secret, &src[CIPHER_MAC_SIZE..]);
    if tag.ct_eq(&src[..CIPHER_MAC_SIZE]).into() {
        Some(decrypt(secret, dest, &src[CIPHER_MAC_SIZE..]))
    } else {
        None
    }
}
