//! Error types for plugwire-core.
//!
//! Every fallible operation in the crate returns [`Error`]. Only
//! [`Error::SessionExpired`] is ever recovered internally (once per
//! [`KlapTransport::send`](crate::transport::KlapTransport::send)); all other
//! variants reach the caller with the status or code needed to diagnose them.

use thiserror::Error;

/// Error type for plugwire-core operations.
#[derive(Debug, Error)]
pub enum Error {
    /// The discovery query could not be built.
    #[error("discovery failed: {0}")]
    Discovery(String),

    /// Connection to the device failed.
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    /// Operation timed out.
    #[error("timeout: {0}")]
    Timeout(String),

    /// Detection could not classify the device.
    #[error("protocol undetermined: {0}")]
    ProtocolUndetermined(String),

    /// The device speaks a protocol variant this crate does not implement.
    #[error("unsupported protocol: {0}")]
    UnsupportedProtocol(String),

    /// The KLAP handshake was rejected or malformed.
    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),

    /// The device proved knowledge of a different auth secret.
    #[error("authentication failed: device hash does not match the supplied credentials")]
    CredentialsMismatch,

    /// The device rejected the session cookie (HTTP 403).
    #[error("session expired")]
    SessionExpired,

    /// The command channel answered with a non-200 status.
    #[error("request failed with HTTP status {status}")]
    RequestFailed {
        /// HTTP status returned by the device.
        status: u16,
    },

    /// The device answered with a nonzero `error_code`.
    #[error("device returned error_code {code}")]
    DeviceError {
        /// The `error_code` field of the decrypted response.
        code: i64,
    },

    /// A response body could not be decrypted or failed its signature check.
    #[error("decryption failed: {0}")]
    Decryption(String),

    /// Protocol error (unexpected response format, etc.).
    #[error("protocol error: {0}")]
    Protocol(String),

    /// I/O error during communication.
    #[error("I/O error: {0}")]
    IoError(String),

    /// Failed to parse device response.
    #[error("parse error: {0}")]
    ParseError(String),
}

impl Error {
    /// Returns `true` for failures of the authentication handshake.
    pub fn is_authentication_failure(&self) -> bool {
        matches!(
            self,
            Error::AuthenticationFailed(_) | Error::CredentialsMismatch
        )
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::IoError(err.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::ParseError(err.to_string())
    }
}
