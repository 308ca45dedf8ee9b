//! Cryptographic primitives for the KLAP protocol.
//!
//! - [`klap`]: auth secret derivation, handshake hashes and the session cipher

pub mod klap;

pub use klap::{AuthHash, KlapCipher, SignaturePolicy, handshake1_hash, handshake2_hash};
