//! KLAP key derivation and session cipher.
//!
//! All KLAP secrets are derived from three inputs: the client's 16-byte
//! local seed, the device's 16-byte remote seed, and the 32-byte auth hash
//! `sha256(sha1(username) + sha1(password))`.
//!
//! The session cipher is AES-128-CBC with PKCS#7 padding. Every message is
//! bound to a signed 32-bit sequence number that forms the last four bytes of
//! the IV and is mixed into a SHA-256 signature prepended to the ciphertext:
//!
//! ```text
//! payload = sha256(signature_key + seq_be + ciphertext) + ciphertext
//! ```

use std::fmt;

use cbc::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit, block_padding::Pkcs7};
use sha1::Sha1;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

use crate::{Credentials, error::Error};

type Aes128CbcEnc = cbc::Encryptor<aes::Aes128>;
type Aes128CbcDec = cbc::Decryptor<aes::Aes128>;

/// Length of the local and remote handshake seeds.
pub const SEED_LEN: usize = 16;

/// Length of a SHA-256 digest (auth hash, handshake hashes, signatures).
pub const HASH_LEN: usize = 32;

/// Length of the signature prefix on every encrypted payload.
pub const SIGNATURE_LEN: usize = 32;

const KEY_LEN: usize = 16;
const IV_BASE_LEN: usize = 12;
const SIGNATURE_KEY_LEN: usize = 28;

/// The auth secret shared by the client and the device.
///
/// Derived once per credential pair and immutable afterwards.
#[derive(Clone, PartialEq, Eq)]
pub struct AuthHash([u8; HASH_LEN]);

impl AuthHash {
    /// Derives `sha256(sha1(username) + sha1(password))`.
    pub fn from_credentials(credentials: &Credentials) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(Sha1::digest(credentials.username.as_bytes()));
        hasher.update(Sha1::digest(credentials.expose_password().as_bytes()));
        Self(hasher.finalize().into())
    }

    /// Wraps an already derived auth hash.
    pub fn from_bytes(bytes: [u8; HASH_LEN]) -> Self {
        Self(bytes)
    }

    /// Returns the raw hash bytes.
    pub fn as_bytes(&self) -> &[u8; HASH_LEN] {
        &self.0
    }
}

impl fmt::Debug for AuthHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("AuthHash([REDACTED])")
    }
}

/// Hash the device returns from handshake1: `sha256(local_seed + remote_seed + auth_hash)`.
pub fn handshake1_hash(
    local_seed: &[u8; SEED_LEN],
    remote_seed: &[u8; SEED_LEN],
    auth_hash: &AuthHash,
) -> [u8; HASH_LEN] {
    sha256(&[local_seed, remote_seed, auth_hash.as_bytes()])
}

/// Hash the client sends in handshake2: `sha256(remote_seed + local_seed + auth_hash)`.
pub fn handshake2_hash(
    local_seed: &[u8; SEED_LEN],
    remote_seed: &[u8; SEED_LEN],
    auth_hash: &AuthHash,
) -> [u8; HASH_LEN] {
    sha256(&[remote_seed, local_seed, auth_hash.as_bytes()])
}

/// Whether response signatures are checked before decrypting.
///
/// Devices sign their responses the same way clients sign requests. Checking
/// is a client-side choice the device never asks for; `Ignore` matches clients
/// that skip it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SignaturePolicy {
    /// Check the signature and fail closed on mismatch.
    #[default]
    Verify,
    /// Decrypt without looking at the signature.
    Ignore,
}

/// Session cipher derived from a completed KLAP handshake.
///
/// The sequence counter only moves forward through [`encrypt`](Self::encrypt);
/// a counter never repeats within one cipher. A fresh handshake is the only
/// way to reset it.
#[derive(Clone)]
pub struct KlapCipher {
    key: [u8; KEY_LEN],
    iv_base: [u8; IV_BASE_LEN],
    signature_key: [u8; SIGNATURE_KEY_LEN],
    seq: i32,
    signature_policy: SignaturePolicy,
}

impl KlapCipher {
    /// Derives session key material from the handshake inputs.
    ///
    /// Identical inputs always produce identical key material.
    pub fn new(
        local_seed: &[u8; SEED_LEN],
        remote_seed: &[u8; SEED_LEN],
        auth_hash: &AuthHash,
    ) -> Self {
        let auth = auth_hash.as_bytes();
        let key_hash = sha256(&[b"lsk", local_seed, remote_seed, auth]);
        let iv_hash = sha256(&[b"iv", local_seed, remote_seed, auth]);
        let sig_hash = sha256(&[b"ldk", local_seed, remote_seed, auth]);

        let mut key = [0u8; KEY_LEN];
        key.copy_from_slice(&key_hash[..KEY_LEN]);

        let mut iv_base = [0u8; IV_BASE_LEN];
        iv_base.copy_from_slice(&iv_hash[..IV_BASE_LEN]);

        let mut seq_bytes = [0u8; 4];
        seq_bytes.copy_from_slice(&iv_hash[HASH_LEN - 4..]);

        let mut signature_key = [0u8; SIGNATURE_KEY_LEN];
        signature_key.copy_from_slice(&sig_hash[..SIGNATURE_KEY_LEN]);

        Self {
            key,
            iv_base,
            signature_key,
            seq: i32::from_be_bytes(seq_bytes),
            signature_policy: SignaturePolicy::default(),
        }
    }

    /// Sets how [`decrypt`](Self::decrypt) treats response signatures.
    pub fn with_signature_policy(mut self, policy: SignaturePolicy) -> Self {
        self.signature_policy = policy;
        self
    }

    /// Returns the most recently used sequence number.
    ///
    /// Before the first [`encrypt`](Self::encrypt) this is the initial
    /// sequence derived from the handshake.
    pub fn seq(&self) -> i32 {
        self.seq
    }

    /// Encrypts and signs `plaintext` under the next sequence number.
    ///
    /// Not idempotent: each call advances the counter, and the returned
    /// sequence must accompany the request so the response can be decrypted.
    pub fn encrypt(&mut self, plaintext: &[u8]) -> (Vec<u8>, i32) {
        self.seq = self.seq.wrapping_add(1);
        let seq = self.seq;
        (self.seal(plaintext, seq), seq)
    }

    /// Decrypts a `signature + ciphertext` payload produced under `seq`.
    pub fn decrypt(&self, payload: &[u8], seq: i32) -> Result<Vec<u8>, Error> {
        if payload.len() < SIGNATURE_LEN {
            return Err(Error::Decryption(format!(
                "payload is {} bytes, shorter than the {}-byte signature",
                payload.len(),
                SIGNATURE_LEN
            )));
        }

        let (signature, ciphertext) = payload.split_at(SIGNATURE_LEN);

        if self.signature_policy == SignaturePolicy::Verify {
            let expected = self.sign(seq, ciphertext);
            if !bool::from(signature.ct_eq(&expected[..])) {
                return Err(Error::Decryption(format!(
                    "signature mismatch for seq {}",
                    seq
                )));
            }
        }

        Aes128CbcDec::new(&self.key.into(), &self.iv_for_seq(seq).into())
            .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
            .map_err(|_| Error::Decryption("invalid ciphertext length or padding".into()))
    }

    /// Encrypts and signs under an explicit sequence number.
    ///
    /// This is the device side of the channel: responses reuse the request's
    /// sequence instead of advancing a counter.
    pub(crate) fn seal(&self, plaintext: &[u8], seq: i32) -> Vec<u8> {
        let ciphertext = Aes128CbcEnc::new(&self.key.into(), &self.iv_for_seq(seq).into())
            .encrypt_padded_vec_mut::<Pkcs7>(plaintext);

        let mut payload = Vec::with_capacity(SIGNATURE_LEN + ciphertext.len());
        payload.extend_from_slice(&self.sign(seq, &ciphertext));
        payload.extend_from_slice(&ciphertext);
        payload
    }

    fn iv_for_seq(&self, seq: i32) -> [u8; 16] {
        let mut iv = [0u8; 16];
        iv[..IV_BASE_LEN].copy_from_slice(&self.iv_base);
        iv[IV_BASE_LEN..].copy_from_slice(&seq.to_be_bytes());
        iv
    }

    fn sign(&self, seq: i32, ciphertext: &[u8]) -> [u8; SIGNATURE_LEN] {
        sha256(&[&self.signature_key, &seq.to_be_bytes(), ciphertext])
    }
}

impl fmt::Debug for KlapCipher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KlapCipher")
            .field("seq", &self.seq)
            .field("signature_policy", &self.signature_policy)
            .field("key", &"[REDACTED]")
            .finish()
    }
}

fn sha256(parts: &[&[u8]]) -> [u8; HASH_LEN] {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part);
    }
    hasher.finalize().into()
}
