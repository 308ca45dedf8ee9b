use std::time::Duration;

use clap::{Parser, Subcommand};

pub fn parse_duration(arg: &str) -> Result<Duration, std::num::ParseIntError> {
    let seconds = arg.parse()?;
    Ok(Duration::from_secs(seconds))
}

/// KLAP smart plug client
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Cloud account username (email) the plug was provisioned with.
    /// Can also be set via PLUGWIRE_USERNAME environment variable.
    #[arg(short, long, global = true, env = "PLUGWIRE_USERNAME")]
    pub username: Option<String>,

    /// Read password from stdin.
    /// Useful for scripting: echo "password" | plugwire -u user@example.com --password-stdin send 192.168.1.100 get_device_info
    #[arg(long, global = true)]
    pub password_stdin: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Discover devices on the local network
    Discover {
        /// Discovery timeout in seconds
        #[arg(long, value_parser = parse_duration, default_value = "3")]
        timeout: Duration,

        /// Decode each reply instead of listing addresses only
        #[arg(long)]
        details: bool,
    },

    /// Detect which protocol a device speaks
    Detect {
        /// Target hostname or IP address
        target: String,

        /// Target HTTP port
        #[arg(short, long, default_value_t = 80)]
        port: u16,

        /// Timeout in seconds
        #[arg(long, value_parser = parse_duration, default_value = "10")]
        timeout: Duration,
    },

    /// Send a command to a device over an authenticated session
    Send {
        /// Target hostname or IP address
        target: String,

        /// Method name, e.g. get_device_info
        method: String,

        /// Method parameters as a JSON object
        params: Option<String>,

        /// Target HTTP port
        #[arg(short, long, default_value_t = 80)]
        port: u16,

        /// Timeout in seconds for each network operation
        #[arg(long, value_parser = parse_duration, default_value = "10")]
        timeout: Duration,

        /// Accept responses without checking their signature
        #[arg(long)]
        skip_signature_check: bool,
    },

    /// Show version information for CLI and core library
    Version,
}
