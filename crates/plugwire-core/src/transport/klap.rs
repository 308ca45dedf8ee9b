//! KLAP session transport.
//!
//! KLAP (Kasa Local Authentication Protocol) runs over HTTP on port 80. After
//! the handshake (see [`handshake`](crate::transport::handshake)) every
//! command is posted to `/app/request?seq=<n>` as `signature + ciphertext`,
//! and the device answers with a payload encrypted under the same sequence.
//!
//! # Session lifecycle
//!
//! ```text
//! Unauthenticated -> Authenticating -> Authenticated --403--> Unauthenticated
//!                                  \-> Failed
//! ```
//!
//! A 403 on the command channel means the device dropped the session. The
//! transport discards it, re-runs the handshake and resends the command once;
//! a second 403 is returned to the caller as [`Error::RequestFailed`].
//! Other failures leave the session untouched.
//!
//! # Concurrency
//!
//! Sequence numbers must never repeat within a session, so a transport serves
//! one caller at a time. [`KlapTransport::send`] takes `&mut self`; share a
//! transport across tasks only behind a lock.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::{
    Credentials,
    crypto::klap::{AuthHash, SignaturePolicy},
    error::Error,
    transport::{
        EncryptionType, Transport,
        handshake::{HandshakeClient, KlapSession},
        http::{HttpClient, OCTET_STREAM, RawHttpClient},
    },
};

/// Default HTTP port for KLAP protocol.
pub const DEFAULT_PORT: u16 = 80;

/// Path of the encrypted command channel.
pub const REQUEST_PATH: &str = "/app/request";

/// Where a transport is in the authentication lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// No session; the next command runs the handshake.
    Unauthenticated,
    /// A handshake is in progress.
    Authenticating,
    /// A session is live.
    Authenticated,
    /// The last handshake failed; the next command retries it.
    Failed,
}

#[derive(Serialize)]
struct Request<'a> {
    method: &'a str,
    // A bare `{"method":...}` is what devices expect for parameterless calls.
    #[serde(skip_serializing_if = "Option::is_none")]
    params: Option<&'a Value>,
}

#[derive(Deserialize)]
struct Response {
    error_code: i64,
    #[serde(default)]
    result: Value,
}

/// Transport using the KLAP protocol over HTTP.
///
/// # Example
///
/// ```no_run
/// use std::time::Duration;
///
/// use plugwire_core::{Credentials, transport::KlapTransport};
///
/// #[tokio::main]
/// async fn main() -> Result<(), plugwire_core::Error> {
///     let credentials = Credentials::new("user@example.com", "password");
///     let mut transport =
///         KlapTransport::connect("192.168.1.100", 80, credentials, Duration::from_secs(10)).await?;
///
///     let info = transport.send("get_device_info", None).await?;
///     println!("{}", info);
///     Ok(())
/// }
/// ```
pub struct KlapTransport<H = RawHttpClient> {
    http: H,
    auth_hash: AuthHash,
    signature_policy: SignaturePolicy,
    session: Option<KlapSession>,
    state: SessionState,
}

impl KlapTransport<RawHttpClient> {
    /// Creates an unauthenticated transport for `host:port`.
    ///
    /// The handshake runs on the first [`send`](Self::send) or on
    /// [`ensure_authenticated`](Self::ensure_authenticated).
    pub fn new(host: &str, port: u16, credentials: Credentials, timeout: Duration) -> Self {
        Self::with_http_client(RawHttpClient::new(host, port, timeout), &credentials)
    }

    /// Creates a transport for `host:port` and authenticates it.
    pub async fn connect(
        host: &str,
        port: u16,
        credentials: Credentials,
        timeout: Duration,
    ) -> Result<Self, Error> {
        debug!(host, port, "attempting KLAP connection");
        let mut transport = Self::new(host, port, credentials, timeout);
        transport.ensure_authenticated().await?;
        Ok(transport)
    }
}

impl<H: HttpClient> KlapTransport<H> {
    /// Creates an unauthenticated transport over an existing HTTP client.
    pub fn with_http_client(http: H, credentials: &Credentials) -> Self {
        Self {
            http,
            auth_hash: AuthHash::from_credentials(credentials),
            signature_policy: SignaturePolicy::default(),
            session: None,
            state: SessionState::Unauthenticated,
        }
    }

    /// Sets how response signatures are treated for every future session.
    pub fn with_signature_policy(mut self, policy: SignaturePolicy) -> Self {
        self.signature_policy = policy;
        self.session = self
            .session
            .take()
            .map(|session| session.with_signature_policy(policy));
        self
    }

    /// Returns the current lifecycle state.
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Returns `true` while a session is live.
    pub fn is_authenticated(&self) -> bool {
        self.session.is_some()
    }

    /// Drops the current session; the next command re-authenticates.
    pub fn invalidate(&mut self) {
        self.session = None;
        self.state = SessionState::Unauthenticated;
    }

    /// Runs the handshake unless a session is already live.
    pub async fn ensure_authenticated(&mut self) -> Result<(), Error> {
        if self.session.is_some() {
            return Ok(());
        }

        self.state = SessionState::Authenticating;
        match HandshakeClient::new(&self.http, &self.auth_hash)
            .perform()
            .await
        {
            Ok(session) => {
                self.session = Some(session.with_signature_policy(self.signature_policy));
                self.state = SessionState::Authenticated;
                Ok(())
            }
            Err(e) => {
                debug!(host = self.http.host(), error = %e, "KLAP authentication failed");
                self.state = SessionState::Failed;
                Err(e)
            }
        }
    }

    /// Sends `method` with optional `params` and returns the `result` object.
    ///
    /// Authenticates first if needed. An expired session is re-established
    /// and the command resent exactly once.
    pub async fn send(&mut self, method: &str, params: Option<Value>) -> Result<Value, Error> {
        let request = serde_json::to_vec(&Request {
            method,
            params: params.as_ref(),
        })?;

        let mut retried = false;
        loop {
            self.ensure_authenticated().await?;

            match self.send_encrypted(&request).await {
                Err(Error::SessionExpired) if !retried => {
                    warn!(
                        host = self.http.host(),
                        method, "KLAP session expired, re-authenticating"
                    );
                    retried = true;
                }
                Err(Error::SessionExpired) => {
                    return Err(Error::RequestFailed { status: 403 });
                }
                other => return other,
            }
        }
    }

    /// Encrypts and posts one request under the live session.
    async fn send_encrypted(&mut self, request: &[u8]) -> Result<Value, Error> {
        let session = self
            .session
            .as_mut()
            .ok_or_else(|| Error::Protocol("no active KLAP session".into()))?;

        let (payload, seq) = session.cipher_mut().encrypt(request);
        let cookie = session.cookie().map(str::to_owned);

        let path = format!("{}?seq={}", REQUEST_PATH, seq);
        debug!(
            host = self.http.host(),
            port = self.http.port(),
            seq,
            "sending KLAP request"
        );

        let response = self
            .http
            .post(&path, OCTET_STREAM, &payload, cookie.as_deref())
            .await?;

        match response.status {
            200 => {}
            403 => {
                self.invalidate();
                return Err(Error::SessionExpired);
            }
            status => return Err(Error::RequestFailed { status }),
        }

        let session = self
            .session
            .as_ref()
            .ok_or_else(|| Error::Protocol("no active KLAP session".into()))?;
        let plaintext = session.cipher().decrypt(&response.body, seq)?;

        let parsed: Response = serde_json::from_slice(&plaintext)?;
        if parsed.error_code != 0 {
            debug!(seq, error_code = parsed.error_code, "device returned an error");
            return Err(Error::DeviceError {
                code: parsed.error_code,
            });
        }

        Ok(parsed.result)
    }
}

#[async_trait]
impl<H: HttpClient> Transport for KlapTransport<H> {
    async fn send(&mut self, method: &str, params: Option<Value>) -> Result<Value, Error> {
        KlapTransport::send(self, method, params).await
    }

    fn encryption_type(&self) -> EncryptionType {
        EncryptionType::Klap
    }

    fn host(&self) -> &str {
        self.http.host()
    }

    fn port(&self) -> u16 {
        self.http.port()
    }
}

// Implement Debug manually to avoid exposing sensitive session data
impl<H: HttpClient> std::fmt::Debug for KlapTransport<H> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KlapTransport")
            .field("host", &self.http.host())
            .field("port", &self.http.port())
            .field("state", &self.state)
            .field("session", &self.session)
            .finish()
    }
}
