//! Transport layer for communicating with smart plugs.
//!
//! - [`http`]: title-case HTTP/1.1 client behind the [`HttpClient`] seam
//! - [`detect`]: classifies a device as KLAP or passthrough
//! - [`handshake`]: KLAP two-phase authentication
//! - [`klap`]: [`KlapTransport`], the encrypted command session
//!
//! Use [`connect`] to detect, authenticate and get a ready transport in one call.

pub mod detect;
pub mod handshake;
pub mod http;
pub mod klap;

pub use detect::{detect, detect_protocol};
pub use handshake::{HandshakeClient, KlapSession};
pub use http::{HttpClient, HttpResponse, RawHttpClient};
pub use klap::{KlapTransport, SessionState};

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::{Credentials, DiscoveredDevice, crypto::SignaturePolicy, error::Error};

/// Default timeout for transport operations.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Authentication variant a device speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EncryptionType {
    /// KLAP handshake plus AES session (implemented).
    Klap,
    /// Secure passthrough (detected only).
    Passthrough,
}

impl std::fmt::Display for EncryptionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EncryptionType::Klap => write!(f, "KLAP"),
            EncryptionType::Passthrough => write!(f, "passthrough"),
        }
    }
}

/// Configuration for connecting to a device.
#[derive(Debug, Clone)]
pub struct DeviceConfig {
    /// The device hostname or IP address.
    pub host: String,
    /// HTTP port.
    pub port: u16,
    /// Credentials for the handshake; blank if unset.
    pub credentials: Option<Credentials>,
    /// Bound on every connect, write and read.
    pub timeout: Duration,
    /// Skips detection when set (e.g. from discovery).
    pub encryption_hint: Option<EncryptionType>,
    /// How response signatures are treated.
    pub signature_policy: SignaturePolicy,
}

impl DeviceConfig {
    /// Creates a new device configuration.
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port: klap::DEFAULT_PORT,
            credentials: None,
            timeout: DEFAULT_TIMEOUT,
            encryption_hint: None,
            signature_policy: SignaturePolicy::default(),
        }
    }

    /// Sets the port.
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Sets the credentials.
    pub fn with_credentials(mut self, credentials: Credentials) -> Self {
        self.credentials = Some(credentials);
        self
    }

    /// Sets the timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Sets the protocol to assume instead of probing.
    pub fn with_encryption_hint(mut self, hint: EncryptionType) -> Self {
        self.encryption_hint = Some(hint);
        self
    }

    /// Sets how response signatures are treated.
    pub fn with_signature_policy(mut self, policy: SignaturePolicy) -> Self {
        self.signature_policy = policy;
        self
    }

    /// Creates a device configuration from a discovered device.
    ///
    /// Credentials must still be added separately:
    ///
    /// ```no_run
    /// use plugwire_core::{Credentials, DiscoveredDevice, transport::DeviceConfig};
    ///
    /// fn connect_to_discovered(device: &DiscoveredDevice) -> DeviceConfig {
    ///     DeviceConfig::from_discovered(device)
    ///         .with_credentials(Credentials::new("user@example.com", "password"))
    /// }
    /// ```
    pub fn from_discovered(device: &DiscoveredDevice) -> Self {
        let config = Self::new(device.ip.to_string()).with_port(device.port());
        match device.encryption_type {
            Some(hint) => config.with_encryption_hint(hint),
            None => config,
        }
    }
}

/// Detects the device protocol (unless hinted) and authenticates a KLAP session.
///
/// # Errors
///
/// - [`Error::UnsupportedProtocol`] if the device speaks passthrough; no
///   handshake is attempted.
/// - [`Error::ProtocolUndetermined`] if detection is inconclusive.
/// - Any handshake error.
///
/// # Example
///
/// ```no_run
/// use plugwire_core::{Credentials, transport::{DeviceConfig, Transport, connect}};
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let config = DeviceConfig::new("192.168.1.100")
///         .with_credentials(Credentials::new("user@example.com", "password"));
///
///     let mut transport = connect(config).await?;
///     let info = transport.send("get_device_info", None).await?;
///     println!("{}", info);
///     Ok(())
/// }
/// ```
pub async fn connect(config: DeviceConfig) -> Result<KlapTransport, Error> {
    let http = RawHttpClient::new(&config.host, config.port, config.timeout);
    connect_with(http, &config).await
}

/// [`connect`] over a caller-supplied HTTP client.
pub async fn connect_with<H: HttpClient>(
    http: H,
    config: &DeviceConfig,
) -> Result<KlapTransport<H>, Error> {
    let encryption = match config.encryption_hint {
        Some(hint) => {
            debug!(host = %config.host, %hint, "using encryption hint");
            hint
        }
        None => detect_protocol(&http).await.ok_or_else(|| {
            Error::ProtocolUndetermined(format!(
                "{}:{} did not identify its protocol",
                config.host, config.port
            ))
        })?,
    };

    if encryption == EncryptionType::Passthrough {
        return Err(Error::UnsupportedProtocol(format!(
            "{} uses the passthrough protocol",
            config.host
        )));
    }

    let credentials = config.credentials.clone().unwrap_or_default();
    if credentials.is_blank() {
        debug!(host = %config.host, "authenticating with blank credentials");
    }
    let mut transport = KlapTransport::with_http_client(http, &credentials)
        .with_signature_policy(config.signature_policy);
    transport.ensure_authenticated().await?;
    Ok(transport)
}

/// A session that carries commands to a device.
///
/// Implementations serve one caller at a time (`send` takes `&mut self`).
#[async_trait]
pub trait Transport: Send + Sync {
    /// Sends `method` with optional `params` and returns the `result` object.
    async fn send(&mut self, method: &str, params: Option<Value>) -> Result<Value, Error>;

    /// Returns the encryption type used by this transport.
    fn encryption_type(&self) -> EncryptionType;

    /// Returns the device host.
    fn host(&self) -> &str;

    /// Returns the device port.
    fn port(&self) -> u16;
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::testing::{MockDevice, ScriptedHttp};

    fn credentials() -> Credentials {
        Credentials::new("user@example.com", "hunter2")
    }

    #[test]
    fn test_device_config_defaults() {
        let config = DeviceConfig::new("10.0.0.5");

        assert_eq!(config.port, 80);
        assert_eq!(config.timeout, DEFAULT_TIMEOUT);
        assert!(config.credentials.is_none());
        assert!(config.encryption_hint.is_none());
        assert_eq!(config.signature_policy, SignaturePolicy::Verify);
    }

    #[test]
    fn test_device_config_from_discovered() {
        let device = DiscoveredDevice {
            ip: "192.168.1.50".parse().unwrap(),
            device_id: "id".into(),
            device_type: "SMART.KASAPLUG".into(),
            device_model: "KP125M(US)".into(),
            mac: "AA-BB-CC-DD-EE-FF".into(),
            hw_ver: "1.0".into(),
            encrypt_type: Some("KLAP".into()),
            http_port: Some(8080),
            login_version: Some(2),
            encryption_type: Some(EncryptionType::Klap),
        };

        let config = DeviceConfig::from_discovered(&device);
        assert_eq!(config.host, "192.168.1.50");
        assert_eq!(config.port, 8080);
        assert_eq!(config.encryption_hint, Some(EncryptionType::Klap));
    }

    #[test]
    fn test_encryption_type_display() {
        assert_eq!(EncryptionType::Klap.to_string(), "KLAP");
        assert_eq!(EncryptionType::Passthrough.to_string(), "passthrough");
    }

    #[tokio::test]
    async fn test_connect_detects_and_authenticates() {
        let config = DeviceConfig::new("mock-device").with_credentials(credentials());

        let mut transport = connect_with(MockDevice::new(&credentials()), &config)
            .await
            .unwrap();

        assert_eq!(transport.state(), SessionState::Authenticated);
        let result = transport.send("get_device_info", None).await.unwrap();
        assert_eq!(result["method"], "get_device_info");
    }

    #[tokio::test]
    async fn test_connect_refuses_passthrough_without_handshake() {
        let http = ScriptedHttp::new(vec![Ok(HttpResponse::new(200, r#"{"error_code":-1010}"#))]);
        let config = DeviceConfig::new("plug").with_credentials(credentials());

        let err = connect_with(&http, &config).await.unwrap_err();

        assert!(matches!(err, Error::UnsupportedProtocol(_)));
        assert_eq!(http.requests().len(), 1);
    }

    #[tokio::test]
    async fn test_connect_refuses_passthrough_hint() {
        let http = ScriptedHttp::new(Vec::new());
        let config = DeviceConfig::new("plug").with_encryption_hint(EncryptionType::Passthrough);

        let err = connect_with(&http, &config).await.unwrap_err();

        assert!(matches!(err, Error::UnsupportedProtocol(_)));
        assert!(http.requests().is_empty());
    }

    #[tokio::test]
    async fn test_connect_undetermined() {
        let http = ScriptedHttp::new(vec![Ok(HttpResponse::new(200, "<html></html>"))]);
        let config = DeviceConfig::new("plug");

        let err = connect_with(&http, &config).await.unwrap_err();
        assert!(matches!(err, Error::ProtocolUndetermined(_)));
    }

    #[tokio::test]
    async fn test_connect_hint_skips_detection() {
        let device = MockDevice::new(&credentials());
        let config = DeviceConfig::new("mock-device")
            .with_credentials(credentials())
            .with_encryption_hint(EncryptionType::Klap);

        let transport = connect_with(device, &config).await.unwrap();
        assert!(transport.is_authenticated());
    }

    #[tokio::test]
    async fn test_connect_wrong_credentials() {
        let config = DeviceConfig::new("mock-device")
            .with_credentials(Credentials::new("user@example.com", "wrong"));

        let err = connect_with(MockDevice::new(&credentials()), &config)
            .await
            .unwrap_err();
        assert!(err.is_authentication_failure());
    }

    #[tokio::test]
    async fn test_connect_without_credentials_uses_blank() {
        let config = DeviceConfig::new("mock-device");

        let transport = connect_with(MockDevice::new(&Credentials::blank()), &config)
            .await
            .unwrap();
        assert!(transport.is_authenticated());

        // A provisioned device rejects blank credentials.
        let err = connect_with(MockDevice::new(&credentials()), &config)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::CredentialsMismatch));
    }
}
