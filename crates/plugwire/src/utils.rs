use std::io::IsTerminal;

use plugwire_core::Credentials;
use serde_json::Value;

/// Environment variable consulted for the password before stdin or a prompt.
pub const PASSWORD_ENV: &str = "PLUGWIRE_PASSWORD";

/// Read password securely based on the provided options.
///
/// # Priority
///
/// 1. If `password_stdin` is true, read one line from stdin
/// 2. Otherwise, prompt interactively (if terminal is available)
pub fn read_password(password_stdin: bool, prompt: &str) -> Result<String, String> {
    if password_stdin {
        let mut input = String::new();
        std::io::stdin()
            .read_line(&mut input)
            .map_err(|e| format!("Failed to read password from stdin: {}", e))?;
        return Ok(input.trim().to_string());
    }

    if std::io::stdin().is_terminal() {
        eprint!("{}: ", prompt);
        rpassword::read_password().map_err(|e| format!("Failed to read password: {}", e))
    } else {
        Err("No password provided. Use --password-stdin when piping input.".to_string())
    }
}

/// Get credentials from CLI options and environment.
///
/// Password is read from PLUGWIRE_PASSWORD env var, stdin (if --password-stdin),
/// or interactively prompted. Without a username the device is tried with
/// blank credentials.
pub fn get_credentials(
    username: Option<String>,
    password_stdin: bool,
) -> Result<Option<Credentials>, String> {
    let Some(user) = username else {
        return Ok(None);
    };

    if let Ok(pass) = std::env::var(PASSWORD_ENV) {
        return Ok(Some(Credentials::new(user, pass)));
    }

    let prompt = format!("Password for {}", user);
    let pass = read_password(password_stdin, &prompt)?;
    Ok(Some(Credentials::new(user, pass)))
}

/// Parse the optional params argument; it must be a JSON object.
pub fn parse_params(params: Option<&str>) -> Result<Option<Value>, String> {
    let Some(raw) = params else {
        return Ok(None);
    };

    match serde_json::from_str::<Value>(raw) {
        Ok(value @ Value::Object(_)) => Ok(Some(value)),
        Ok(_) => Err(format!("params must be a JSON object, got: {}", raw)),
        Err(e) => Err(format!("invalid params JSON: {}", e)),
    }
}

/// Print guidance after an authentication failure.
pub fn print_credentials_hint(target: &str) {
    eprintln!();
    eprintln!("Check the account the plug was provisioned with:");
    eprintln!(
        "  plugwire -u your-email@example.com send {} get_device_info",
        target
    );
    eprintln!();
    eprintln!("Or set credentials via environment variables:");
    eprintln!("  export PLUGWIRE_USERNAME=your-email@example.com");
    eprintln!("  export {}=your-password", PASSWORD_ENV);
}

#[cfg(test)]
mod tests {
    use super::*;

    use serde_json::json;

    #[test]
    fn test_parse_params_none() {
        assert_eq!(parse_params(None).unwrap(), None);
    }

    #[test]
    fn test_parse_params_object() {
        assert_eq!(
            parse_params(Some(r#"{"device_on": false}"#)).unwrap(),
            Some(json!({"device_on": false}))
        );
    }

    #[test]
    fn test_parse_params_rejects_non_objects() {
        assert!(parse_params(Some("[1,2]")).is_err());
        assert!(parse_params(Some("true")).is_err());
        assert!(parse_params(Some("{not json")).is_err());
    }

    #[test]
    fn test_no_username_means_no_credentials() {
        assert!(get_credentials(None, false).unwrap().is_none());
    }
}
