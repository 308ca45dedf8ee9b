//! Credentials for authenticating with KLAP devices.
//!
//! The KLAP handshake never sends the password itself. Both sides derive an
//! auth secret from the username and password (see
//! [`crypto::klap::AuthHash`](crate::crypto::klap::AuthHash)) and prove
//! knowledge of it through seeded hashes.
//!
//! # Security
//!
//! Passwords are stored using [`SecretString`] from the `secrecy` crate to prevent
//! accidental logging or display. Use [`Credentials::expose_password()`] to access
//! the raw password value when needed for authentication.

use std::fmt;

use secrecy::{ExposeSecret, SecretString};

/// Credentials for authenticating with a KLAP device.
///
/// # Example
///
/// ```
/// use plugwire_core::Credentials;
///
/// let creds = Credentials::new("user@example.com", "password123");
/// assert_eq!(creds.username, "user@example.com");
///
/// // Devices that were never bound to a cloud account accept blank credentials.
/// assert!(Credentials::blank().is_blank());
/// ```
#[derive(Clone)]
pub struct Credentials {
    /// The username (typically an email address for TP-Link cloud accounts).
    pub username: String,
    password: SecretString,
}

impl Credentials {
    /// Creates new credentials with the given username and password.
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: SecretString::from(password.into()),
        }
    }

    /// Creates blank credentials (empty username and password).
    pub fn blank() -> Self {
        Self::new(String::new(), String::new())
    }

    /// Returns `true` if both username and password are empty.
    pub fn is_blank(&self) -> bool {
        self.username.is_empty() && self.password.expose_secret().is_empty()
    }

    /// Exposes the password for auth secret derivation.
    ///
    /// Never log or display the returned value.
    pub fn expose_password(&self) -> &str {
        self.password.expose_secret()
    }
}

impl Default for Credentials {
    fn default() -> Self {
        Self::blank()
    }
}

impl PartialEq for Credentials {
    fn eq(&self, other: &Self) -> bool {
        self.username == other.username
            && self.password.expose_secret() == other.password.expose_secret()
    }
}

impl Eq for Credentials {}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"[REDACTED]")
            .finish()
    }
}
