mod cli;
mod handlers;
mod utils;

use clap::Parser;

use cli::{Cli, Command};

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    if cli.verbose {
        tracing_subscriber::fmt()
            .with_max_level(tracing::Level::DEBUG)
            .with_writer(std::io::stderr)
            .init();
    }

    match cli.command {
        Command::Version => handlers::handle_version(),

        Command::Discover { timeout, details } => handlers::handle_discover(timeout, details).await,

        Command::Detect {
            target,
            port,
            timeout,
        } => handlers::handle_detect(target, port, timeout).await,

        Command::Send {
            target,
            method,
            params,
            port,
            timeout,
            skip_signature_check,
        } => {
            handlers::handle_send(
                target,
                method,
                params,
                port,
                timeout,
                skip_signature_check,
                cli.username,
                cli.password_stdin,
            )
            .await
        }
    }
}
