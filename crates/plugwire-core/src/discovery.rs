//! Device discovery over UDP port 20002.
//!
//! A probe is a 16-byte header followed by a JSON body carrying a freshly
//! generated RSA public key:
//!
//! ```text
//! 0        1        2                4                6       7       8                12               16
//! +--------+--------+----------------+----------------+-------+-------+----------------+----------------+
//! | ver=2  | type=0 | op_code=1 (BE) | msg_size (BE)  | fl=17 | pad=0 | serial (BE)    | crc32 (BE)     |
//! +--------+--------+----------------+----------------+-------+-------+----------------+----------------+
//! ```
//!
//! The CRC32 covers the header with its CRC field zeroed, followed by the body.
//! The probe is broadcast once; every distinct responder within the listen
//! window is reported.

use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;

use rsa::{RsaPrivateKey, RsaPublicKey, pkcs8::EncodePublicKey, rand_core::OsRng};
use serde::{Deserialize, Serialize};
use tokio::net::UdpSocket;
use tokio::time::{Instant, timeout};
use tracing::{debug, warn};

use crate::{error::Error, transport::EncryptionType};

/// Port for TDP discovery.
pub const TDP_DISCOVERY_PORT: u16 = 20002;

/// Broadcast address for discovery.
pub const BROADCAST_ADDR: &str = "255.255.255.255";

/// How long [`discover`] listens by default.
pub const DEFAULT_DISCOVERY_TIMEOUT: Duration = Duration::from_secs(3);

/// Size of the discovery header.
pub const HEADER_LEN: usize = 16;

const VERSION: u8 = 2;
const MSG_TYPE: u8 = 0;
const OP_CODE_PROBE: u16 = 1;
const FLAGS: u8 = 17;
const CRC_OFFSET: usize = 12;
const RSA_KEY_BITS: usize = 2048;

/// The fixed 16-byte discovery header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiscoveryHeader {
    pub version: u8,
    pub msg_type: u8,
    pub op_code: u16,
    pub msg_size: u16,
    pub flags: u8,
    pub padding: u8,
    pub device_serial: u32,
    pub crc32: u32,
}

impl DiscoveryHeader {
    /// A probe header for a body of `msg_size` bytes. The CRC is left zero.
    pub fn probe(msg_size: u16, device_serial: u32) -> Self {
        Self {
            version: VERSION,
            msg_type: MSG_TYPE,
            op_code: OP_CODE_PROBE,
            msg_size,
            flags: FLAGS,
            padding: 0,
            device_serial,
            crc32: 0,
        }
    }

    pub fn to_bytes(&self) -> [u8; HEADER_LEN] {
        let mut bytes = [0u8; HEADER_LEN];
        bytes[0] = self.version;
        bytes[1] = self.msg_type;
        bytes[2..4].copy_from_slice(&self.op_code.to_be_bytes());
        bytes[4..6].copy_from_slice(&self.msg_size.to_be_bytes());
        bytes[6] = self.flags;
        bytes[7] = self.padding;
        bytes[8..12].copy_from_slice(&self.device_serial.to_be_bytes());
        bytes[12..16].copy_from_slice(&self.crc32.to_be_bytes());
        bytes
    }

    /// Parses the header at the start of `data`.
    pub fn parse(data: &[u8]) -> Result<Self, Error> {
        let bytes: &[u8; HEADER_LEN] = data
            .get(..HEADER_LEN)
            .and_then(|head| head.try_into().ok())
            .ok_or_else(|| {
                Error::Protocol(format!(
                    "discovery packet is {} bytes (header needs {})",
                    data.len(),
                    HEADER_LEN
                ))
            })?;

        Ok(Self {
            version: bytes[0],
            msg_type: bytes[1],
            op_code: u16::from_be_bytes([bytes[2], bytes[3]]),
            msg_size: u16::from_be_bytes([bytes[4], bytes[5]]),
            flags: bytes[6],
            padding: bytes[7],
            device_serial: u32::from_be_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]),
            crc32: u32::from_be_bytes([bytes[12], bytes[13], bytes[14], bytes[15]]),
        })
    }
}

/// A discovery header plus its JSON body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveryPacket {
    pub header: DiscoveryHeader,
    pub body: Vec<u8>,
}

impl DiscoveryPacket {
    /// Builds a probe packet around `body` with a valid CRC.
    pub fn probe(device_serial: u32, body: Vec<u8>) -> Result<Self, Error> {
        let msg_size = u16::try_from(body.len()).map_err(|_| {
            Error::Protocol(format!("discovery body of {} bytes is too large", body.len()))
        })?;

        let mut header = DiscoveryHeader::probe(msg_size, device_serial);
        header.crc32 = checksum(&header, &body);
        Ok(Self { header, body })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut packet = Vec::with_capacity(HEADER_LEN + self.body.len());
        packet.extend_from_slice(&self.header.to_bytes());
        packet.extend_from_slice(&self.body);
        packet
    }

    /// Parses a packet, checking `msg_size` and the CRC.
    pub fn decode(data: &[u8]) -> Result<Self, Error> {
        let header = DiscoveryHeader::parse(data)?;
        let body = &data[HEADER_LEN..];

        if body.len() != usize::from(header.msg_size) {
            return Err(Error::Protocol(format!(
                "discovery msg_size is {} but body is {} bytes",
                header.msg_size,
                body.len()
            )));
        }

        let expected = checksum(&header, body);
        if header.crc32 != expected {
            return Err(Error::Protocol(format!(
                "discovery CRC mismatch: got {:08x}, expected {:08x}",
                header.crc32, expected
            )));
        }

        Ok(Self {
            header,
            body: body.to_vec(),
        })
    }
}

/// CRC32 over the header with a zeroed CRC field, then the body.
fn checksum(header: &DiscoveryHeader, body: &[u8]) -> u32 {
    let mut bytes = header.to_bytes();
    bytes[CRC_OFFSET..].fill(0);

    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&bytes);
    hasher.update(body);
    hasher.finalize()
}

/// Builds a probe carrying a fresh 2048-bit RSA public key and a random serial.
pub fn build_query() -> Result<Vec<u8>, Error> {
    // rsa's own rand_core OsRng; rand 0.9's RNGs implement a newer rand_core
    let private_key = RsaPrivateKey::new(&mut OsRng, RSA_KEY_BITS)
        .map_err(|e| Error::Discovery(format!("RSA key generation failed: {}", e)))?;
    let public_pem = RsaPublicKey::from(&private_key)
        .to_public_key_pem(rsa::pkcs8::LineEnding::LF)
        .map_err(|e| Error::Discovery(format!("PEM encoding failed: {}", e)))?;

    let body = serde_json::to_vec(&serde_json::json!({
        "params": {
            "rsa_key": public_pem
        }
    }))?;

    Ok(DiscoveryPacket::probe(rand::random(), body)?.encode())
}

/// A device that answered a discovery probe.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveredDevice {
    /// Source address of the reply.
    pub ip: IpAddr,
    pub device_id: String,
    /// e.g. `SMART.KASAPLUG`.
    pub device_type: String,
    /// e.g. `KP125M(US)`.
    pub device_model: String,
    pub mac: String,
    pub hw_ver: String,
    /// Raw `encrypt_type` of the management scheme (`KLAP`, `AES`).
    pub encrypt_type: Option<String>,
    pub http_port: Option<u16>,
    pub login_version: Option<u32>,
    /// Protocol inferred from `encrypt_type`.
    pub encryption_type: Option<EncryptionType>,
}

impl DiscoveredDevice {
    /// HTTP port to connect to, 80 unless the device advertised another.
    pub fn port(&self) -> u16 {
        self.http_port.unwrap_or(crate::transport::klap::DEFAULT_PORT)
    }
}

#[derive(Deserialize)]
struct DiscoveryResponse {
    #[serde(default)]
    error_code: i64,
    result: DeviceInfo,
}

#[derive(Deserialize)]
struct DeviceInfo {
    #[serde(default)]
    device_id: String,
    #[serde(default)]
    device_type: String,
    #[serde(default)]
    device_model: String,
    #[serde(default)]
    mac: String,
    #[serde(default)]
    hw_ver: String,
    mgt_encrypt_schm: Option<EncryptionScheme>,
}

#[derive(Deserialize)]
struct EncryptionScheme {
    encrypt_type: Option<String>,
    http_port: Option<u16>,
    lv: Option<u32>,
}

/// Decodes a 20002 reply; `None` if the body is not a device description.
fn parse_response(data: &[u8], ip: IpAddr) -> Option<DiscoveredDevice> {
    let body = data.get(HEADER_LEN..)?;
    let response: DiscoveryResponse = serde_json::from_slice(body).ok()?;

    if response.error_code != 0 {
        debug!(%ip, error_code = response.error_code, "discovery reply carries an error");
        return None;
    }

    let info = response.result;
    let scheme = info.mgt_encrypt_schm;
    let encrypt_type = scheme.as_ref().and_then(|s| s.encrypt_type.clone());
    let encryption_type = match encrypt_type.as_deref() {
        Some("KLAP") => Some(EncryptionType::Klap),
        Some("AES") => Some(EncryptionType::Passthrough),
        _ => None,
    };

    Some(DiscoveredDevice {
        ip,
        device_id: info.device_id,
        device_type: info.device_type,
        device_model: info.device_model,
        mac: info.mac,
        hw_ver: info.hw_ver,
        encrypt_type,
        http_port: scheme.as_ref().and_then(|s| s.http_port).filter(|&p| p > 0),
        login_version: scheme.as_ref().and_then(|s| s.lv),
        encryption_type,
    })
}

/// Broadcasts a probe and returns the address of every distinct responder.
///
/// No responses within `discovery_timeout` is an empty list, not an error.
/// Socket failures are logged and also give an empty list; only building
/// the query can fail.
pub async fn discover(discovery_timeout: Duration) -> Result<Vec<IpAddr>, Error> {
    discover_on(broadcast_target()?, discovery_timeout).await
}

/// Like [`discover`], but sends the probe to `target` instead of the broadcast
/// address.
pub async fn discover_on(
    target: SocketAddr,
    discovery_timeout: Duration,
) -> Result<Vec<IpAddr>, Error> {
    let replies = send_query(target, discovery_timeout, &build_query()?).await;
    Ok(replies.into_iter().map(|(ip, _)| ip).collect())
}

/// Broadcasts a probe and decodes every distinct reply.
///
/// Responders whose reply does not decode are left out.
pub async fn discover_devices(
    discovery_timeout: Duration,
) -> Result<Vec<DiscoveredDevice>, Error> {
    let replies = send_query(broadcast_target()?, discovery_timeout, &build_query()?).await;
    Ok(decode_replies(replies))
}

fn decode_replies(replies: Vec<(IpAddr, Vec<u8>)>) -> Vec<DiscoveredDevice> {
    replies
        .into_iter()
        .filter_map(|(ip, data)| {
            let device = parse_response(&data, ip);
            if device.is_none() {
                debug!(%ip, bytes = data.len(), "ignoring undecodable discovery reply");
            }
            device
        })
        .collect()
}

fn broadcast_target() -> Result<SocketAddr, Error> {
    format!("{}:{}", BROADCAST_ADDR, TDP_DISCOVERY_PORT)
        .parse()
        .map_err(|e| Error::Discovery(format!("invalid broadcast address: {}", e)))
}

/// Local address to bind for querying `target`; the socket family must match.
fn bind_addr_for(target: SocketAddr) -> SocketAddr {
    if target.is_ipv6() {
        SocketAddr::from((Ipv6Addr::UNSPECIFIED, 0))
    } else {
        SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0))
    }
}

/// Sends `query` to `target` once and collects the first reply from each
/// address until `discovery_timeout` has elapsed in total.
async fn send_query(
    target: SocketAddr,
    discovery_timeout: Duration,
    query: &[u8],
) -> Vec<(IpAddr, Vec<u8>)> {
    send_query_from(bind_addr_for(target), target, discovery_timeout, query).await
}

/// [`send_query`] from an explicit local address.
///
/// Socket failures are logged and yield an empty result.
async fn send_query_from(
    local: SocketAddr,
    target: SocketAddr,
    discovery_timeout: Duration,
    query: &[u8],
) -> Vec<(IpAddr, Vec<u8>)> {
    let socket = match UdpSocket::bind(local).await {
        Ok(socket) => socket,
        Err(e) => {
            warn!(%local, error = %e, "discovery bind failed");
            return Vec::new();
        }
    };
    if let Err(e) = socket.set_broadcast(true) {
        warn!(error = %e, "enabling broadcast failed");
        return Vec::new();
    }

    debug!(%target, bytes = query.len(), "sending discovery probe");
    if let Err(e) = socket.send_to(query, target).await {
        warn!(%target, error = %e, "discovery send failed");
        return Vec::new();
    }

    let mut replies = Vec::new();
    let mut seen = HashSet::new();
    let mut buf = [0u8; 4096];
    let deadline = Instant::now() + discovery_timeout;

    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            break;
        }

        match timeout(remaining, socket.recv_from(&mut buf)).await {
            Ok(Ok((n, addr))) => {
                let ip = addr.ip();
                if seen.insert(ip) {
                    debug!(%ip, bytes = n, "discovery reply");
                    replies.push((ip, buf[..n].to_vec()));
                }
            }
            Ok(Err(e)) => {
                debug!(error = %e, "discovery receive failed, returning partial results");
                break;
            }
            Err(_) => break,
        }
    }

    debug!(count = replies.len(), "discovery finished");
    replies
}
