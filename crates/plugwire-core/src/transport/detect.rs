//! Protocol detection over plain HTTP.
//!
//! A single unauthenticated `get_device_info` request tells the two device
//! generations apart:
//!
//! | Device answer                     | Classification              |
//! |-----------------------------------|-----------------------------|
//! | HTTP 401                          | [`EncryptionType::Klap`]    |
//! | JSON with `error_code` 1003       | [`EncryptionType::Klap`]    |
//! | JSON with any other `error_code`  | [`EncryptionType::Passthrough`] |
//! | anything else, or transport error | unknown (`None`)            |

use std::time::Duration;

use serde::Deserialize;
use tracing::debug;

use crate::transport::{
    EncryptionType,
    http::{HttpClient, HttpResponse, JSON, RawHttpClient},
};

/// Path probed during detection.
pub const DETECTION_PATH: &str = "/";

/// Body of the detection probe.
pub const DETECTION_REQUEST: &str = r#"{"method":"get_device_info"}"#;

/// `error_code` a KLAP device returns for an unauthenticated method call.
const METHOD_NOT_FOUND: i64 = 1003;

#[derive(Deserialize)]
struct ProbeResponse {
    error_code: Option<i64>,
}

/// Probes `host:port` and classifies the protocol it speaks.
///
/// Never fails: an unreachable or unrecognised device is reported as `None`.
pub async fn detect(host: &str, port: u16, timeout: Duration) -> Option<EncryptionType> {
    detect_protocol(&RawHttpClient::new(host, port, timeout)).await
}

/// Probes the device behind `http` and classifies the protocol it speaks.
pub async fn detect_protocol<H: HttpClient + ?Sized>(http: &H) -> Option<EncryptionType> {
    match http
        .post(DETECTION_PATH, JSON, DETECTION_REQUEST.as_bytes(), None)
        .await
    {
        Ok(response) => {
            let detected = classify(&response);
            debug!(
                host = http.host(),
                status = response.status,
                detected = ?detected,
                "protocol detection finished"
            );
            detected
        }
        Err(e) => {
            debug!(host = http.host(), error = %e, "protocol detection probe failed");
            None
        }
    }
}

fn classify(response: &HttpResponse) -> Option<EncryptionType> {
    if response.status == 401 {
        return Some(EncryptionType::Klap);
    }

    let probe: ProbeResponse = serde_json::from_slice(&response.body).ok()?;
    match probe.error_code? {
        METHOD_NOT_FOUND => Some(EncryptionType::Klap),
        _ => Some(EncryptionType::Passthrough),
    }
}
