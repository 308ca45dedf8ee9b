//! KLAP two-phase handshake.
//!
//! 1. **Handshake 1**: the client posts 16 random bytes (the local seed). The
//!    device answers with its own 16-byte remote seed followed by
//!    `sha256(local_seed + remote_seed + auth_hash)`, proving it knows the
//!    auth secret, and sets a `TP_SESSIONID` cookie.
//! 2. **Handshake 2**: the client posts `sha256(remote_seed + local_seed + auth_hash)`
//!    with that cookie, proving the same to the device.
//!
//! Both hashes and the session cipher are derived from the same three inputs,
//! so a completed handshake yields a [`KlapSession`] ready for requests.

use std::fmt;

use rand::RngCore;
use subtle::ConstantTimeEq;
use tracing::debug;

use crate::{
    crypto::klap::{
        AuthHash, HASH_LEN, KlapCipher, SEED_LEN, SignaturePolicy, handshake1_hash,
        handshake2_hash,
    },
    error::Error,
    transport::http::{HttpClient, OCTET_STREAM},
};

/// Path of the first handshake request.
pub const HANDSHAKE1_PATH: &str = "/app/handshake1";

/// Path of the second handshake request.
pub const HANDSHAKE2_PATH: &str = "/app/handshake2";

/// Bytes of the handshake1 response that carry the remote seed and server hash.
const HANDSHAKE1_RESPONSE_LEN: usize = SEED_LEN + HASH_LEN;

/// An authenticated session: the cookie the device issued and the cipher
/// derived during the handshake.
pub struct KlapSession {
    cookie: Option<String>,
    cipher: KlapCipher,
}

impl KlapSession {
    /// Creates a session from its parts.
    pub fn new(cookie: Option<String>, cipher: KlapCipher) -> Self {
        Self { cookie, cipher }
    }

    /// Returns the session cookie, if the device issued one.
    pub fn cookie(&self) -> Option<&str> {
        self.cookie.as_deref()
    }

    /// Returns the session cipher.
    pub fn cipher(&self) -> &KlapCipher {
        &self.cipher
    }

    /// Returns the session cipher for encrypting.
    pub fn cipher_mut(&mut self) -> &mut KlapCipher {
        &mut self.cipher
    }

    /// Sets the signature policy of the session cipher.
    pub fn with_signature_policy(mut self, policy: SignaturePolicy) -> Self {
        self.cipher = self.cipher.with_signature_policy(policy);
        self
    }
}

impl fmt::Debug for KlapSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KlapSession")
            .field("cookie", &self.cookie.as_ref().map(|_| "[REDACTED]"))
            .field("cipher", &self.cipher)
            .finish()
    }
}

/// Performs the KLAP handshake against one device.
pub struct HandshakeClient<'a, H: ?Sized> {
    http: &'a H,
    auth_hash: &'a AuthHash,
}

impl<'a, H: HttpClient + ?Sized> HandshakeClient<'a, H> {
    /// Creates a handshake client for the device behind `http`.
    pub fn new(http: &'a H, auth_hash: &'a AuthHash) -> Self {
        Self { http, auth_hash }
    }

    /// Runs both handshake phases with a fresh random local seed.
    pub async fn perform(&self) -> Result<KlapSession, Error> {
        let mut local_seed = [0u8; SEED_LEN];
        rand::rng().fill_bytes(&mut local_seed);
        self.perform_with_seed(local_seed).await
    }

    /// Runs both handshake phases with the given local seed.
    pub(crate) async fn perform_with_seed(
        &self,
        local_seed: [u8; SEED_LEN],
    ) -> Result<KlapSession, Error> {
        let host = self.http.host();
        let port = self.http.port();

        let (remote_seed, server_hash, cookie) = self.handshake1(&local_seed).await?;

        let local_hash = handshake1_hash(&local_seed, &remote_seed, self.auth_hash);
        if !bool::from(local_hash[..].ct_eq(&server_hash[..])) {
            debug!(
                host,
                port,
                server_hash = %hex::encode(server_hash),
                "handshake1 hash does not match the auth hash"
            );
            return Err(Error::CredentialsMismatch);
        }

        let client_hash = handshake2_hash(&local_seed, &remote_seed, self.auth_hash);
        self.handshake2(&client_hash, cookie.as_deref()).await?;

        debug!(host, port, "KLAP handshake completed");

        Ok(KlapSession::new(
            cookie,
            KlapCipher::new(&local_seed, &remote_seed, self.auth_hash),
        ))
    }

    /// Sends the local seed; returns the remote seed, server hash and cookie.
    async fn handshake1(
        &self,
        local_seed: &[u8; SEED_LEN],
    ) -> Result<([u8; SEED_LEN], [u8; HASH_LEN], Option<String>), Error> {
        debug!(
            host = self.http.host(),
            port = self.http.port(),
            local_seed = %hex::encode(local_seed),
            "performing KLAP handshake1"
        );

        let response = self
            .http
            .post(HANDSHAKE1_PATH, OCTET_STREAM, local_seed, None)
            .await?;

        if response.status != 200 {
            return Err(Error::AuthenticationFailed(format!(
                "handshake1 returned status {}",
                response.status
            )));
        }

        if response.body.len() < HANDSHAKE1_RESPONSE_LEN {
            return Err(Error::AuthenticationFailed(format!(
                "handshake1 response is {} bytes (expected at least {})",
                response.body.len(),
                HANDSHAKE1_RESPONSE_LEN
            )));
        }

        let mut remote_seed = [0u8; SEED_LEN];
        let mut server_hash = [0u8; HASH_LEN];
        remote_seed.copy_from_slice(&response.body[..SEED_LEN]);
        server_hash.copy_from_slice(&response.body[SEED_LEN..HANDSHAKE1_RESPONSE_LEN]);

        debug!(
            remote_seed = %hex::encode(remote_seed),
            has_cookie = response.session_cookie.is_some(),
            "handshake1 received response"
        );

        Ok((remote_seed, server_hash, response.session_cookie))
    }

    async fn handshake2(
        &self,
        client_hash: &[u8; HASH_LEN],
        cookie: Option<&str>,
    ) -> Result<(), Error> {
        debug!(
            host = self.http.host(),
            port = self.http.port(),
            "performing KLAP handshake2"
        );

        let response = self
            .http
            .post(HANDSHAKE2_PATH, OCTET_STREAM, client_hash, cookie)
            .await?;

        if response.status != 200 {
            return Err(Error::AuthenticationFailed(format!(
                "handshake2 returned status {}",
                response.status
            )));
        }

        Ok(())
    }
}
