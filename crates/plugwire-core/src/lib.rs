//! Core library for talking to KLAP smart plugs on the local network.
//!
//! The crate finds devices with a UDP broadcast, works out which protocol a
//! device speaks, authenticates with the KLAP handshake and then carries
//! encrypted JSON commands over HTTP, re-authenticating once when the device
//! drops the session.
//!
//! # Example
//!
//! ```no_run
//! use plugwire_core::{Credentials, DEFAULT_DISCOVERY_TIMEOUT, discover, transport::{DeviceConfig, connect}};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), plugwire_core::Error> {
//!     for ip in discover(DEFAULT_DISCOVERY_TIMEOUT).await? {
//!         let config = DeviceConfig::new(ip.to_string())
//!             .with_credentials(Credentials::new("user@example.com", "password"));
//!
//!         let mut transport = connect(config).await?;
//!         let info = transport.send("get_device_info", None).await?;
//!         println!("{}: {}", ip, info);
//!     }
//!     Ok(())
//! }
//! ```
//!
//! # Protocol Details
//!
//! 1. Discovery: a 16-byte header plus an RSA public key is broadcast to UDP
//!    port 20002; devices answer with a JSON description.
//! 2. Detection: an unauthenticated `get_device_info` POST to `/` separates
//!    KLAP devices from passthrough ones.
//! 3. Handshake: both sides prove knowledge of
//!    `sha256(sha1(username) + sha1(password))` over two random seeds.
//! 4. Session: commands are AES-128-CBC encrypted, keyed from the seeds, and
//!    numbered by a sequence that appears in the request URL and the IV.

pub mod credentials;
pub mod crypto;
pub mod discovery;
pub mod error;
pub mod transport;

#[cfg(test)]
mod testing;

pub use credentials::Credentials;
pub use discovery::{
    DEFAULT_DISCOVERY_TIMEOUT, DiscoveredDevice, discover, discover_devices, discover_on,
};
pub use error::Error;
pub use transport::{
    DEFAULT_TIMEOUT, DeviceConfig, EncryptionType, KlapTransport, SessionState, Transport,
    connect,
};

/// The version of the plugwire-core library.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
