use std::time::Duration;

use plugwire_core::{
    DeviceConfig, Transport, connect, crypto::SignaturePolicy, discover, discover_devices,
    transport::detect,
};
use serde_json::json;
use tracing::{debug, error};

use crate::utils::{get_credentials, parse_params, print_credentials_hint};

/// Handle the discover command.
pub async fn handle_discover(timeout: Duration, details: bool) {
    let output = if details {
        discover_devices(timeout)
            .await
            .map(|devices| serde_json::to_value(&devices).unwrap_or_default())
    } else {
        discover(timeout)
            .await
            .map(|ips| serde_json::to_value(&ips).unwrap_or_default())
    };

    match output {
        Ok(json) => {
            debug!(details, "discovery finished");
            println!("{}", json);
        }
        Err(e) => {
            error!(error = %e, "discovery failed");
            eprintln!("Error: Discovery failed: {}", e);
            std::process::exit(1);
        }
    }
}

/// Handle the detect command.
pub async fn handle_detect(target: String, port: u16, timeout: Duration) {
    let detected = detect(&target, port, timeout).await;
    debug!(host = %target, port, detected = ?detected, "detection finished");

    println!(
        "{}",
        json!({
            "host": target,
            "port": port,
            "encryption_type": detected,
        })
    );

    if detected.is_none() {
        eprintln!("Error: Could not determine the protocol of {}:{}", target, port);
        std::process::exit(1);
    }
}

/// Handle the send command.
#[allow(clippy::too_many_arguments)]
pub async fn handle_send(
    target: String,
    method: String,
    params: Option<String>,
    port: u16,
    timeout: Duration,
    skip_signature_check: bool,
    username: Option<String>,
    password_stdin: bool,
) {
    let params = match parse_params(params.as_deref()) {
        Ok(p) => p,
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(1);
        }
    };

    let credentials = match get_credentials(username, password_stdin) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(1);
        }
    };

    let mut config = DeviceConfig::new(&target)
        .with_port(port)
        .with_timeout(timeout);
    if let Some(creds) = credentials {
        config = config.with_credentials(creds);
    }
    if skip_signature_check {
        config = config.with_signature_policy(SignaturePolicy::Ignore);
    }

    debug!(host = %target, port, "connecting");
    let mut transport = match connect(config).await {
        Ok(t) => t,
        Err(e) => {
            error!(host = %target, error = %e, "could not connect");
            eprintln!("Error: Could not connect to {}: {}", target, e);
            if e.is_authentication_failure() {
                print_credentials_hint(&target);
            }
            std::process::exit(1);
        }
    };

    let transport: &mut dyn Transport = &mut transport;
    debug!(
        protocol = %transport.encryption_type(),
        port = transport.port(),
        "connected"
    );

    match transport.send(&method, params).await {
        Ok(result) => println!("{}", result),
        Err(e) => {
            error!(method = %method, error = %e, "command failed");
            eprintln!("Error: Command failed: {}", e);
            std::process::exit(1);
        }
    }
}

/// Handle the version command.
pub fn handle_version() {
    println!("plugwire {}", env!("CARGO_PKG_VERSION"));
    println!("plugwire-core {}", plugwire_core::VERSION);
}
