//! Chatterbox client - Entry Point
//!
//! Connects to a server and runs the interactive prompt on stdin/stdout.

use clap::Parser;
use tokio::io::BufReader;
use tokio::net::TcpStream;
use tracing_subscriber::EnvFilter;

use chatterbox::client::{self, Exit};
use chatterbox::ClientConfig;

#[tokio::main]
async fn main() {
    // Logs go to stderr so they never mix with chat output
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("chatterbox=warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let config = ClientConfig::parse();

    let stream = match TcpStream::connect(config.server_addr()).await {
        Ok(stream) => stream,
        Err(e) => {
            eprintln!("Connection to {} failed: {}", config.server_addr(), e);
            std::process::exit(1);
        }
    };

    let stdin = BufReader::new(tokio::io::stdin());
    let code = match client::run(&config, stream, stdin, tokio::io::stdout()).await {
        Ok(exit) => exit.code(),
        Err(e) => {
            eprintln!("Connection error: {}", e);
            Exit::ServerClosed.code()
        }
    };

    // The blocking stdin reader cannot be cancelled, so exit directly
    // rather than waiting for the runtime to shut down.
    std::process::exit(code);
}
