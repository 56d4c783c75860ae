//! Command line and environment configuration

use std::time::Duration;

use clap::Parser;

use crate::codec::DEFAULT_MAX_LINE_LENGTH;
use crate::dispatcher::ConnectionSettings;
use crate::session::DEFAULT_QUEUE_CAPACITY;

/// Default server port
pub const DEFAULT_PORT: u16 = 4567;

/// Default server bind address (all interfaces)
pub const DEFAULT_BIND_ADDRESS: &str = "0.0.0.0";

/// Default host the client connects to
pub const DEFAULT_HOST: &str = "127.0.0.1";

/// Chatterbox server
#[derive(Parser, Clone, Debug)]
#[command(name = "chatterbox-server", version, about = "Chatterbox chat server")]
pub struct Config {
    /// Bind address
    #[arg(long, env = "CHATTERBOX_BIND_ADDRESS", default_value = DEFAULT_BIND_ADDRESS)]
    pub bind_address: String,

    /// Port to listen on
    #[arg(long, short, env = "CHATTERBOX_PORT", default_value_t = DEFAULT_PORT)]
    pub port: u16,

    /// Outbound messages buffered per client before fan-out starts dropping
    #[arg(long, env = "CHATTERBOX_QUEUE_CAPACITY", default_value_t = DEFAULT_QUEUE_CAPACITY)]
    pub queue_capacity: usize,

    /// Longest accepted line in bytes; longer lines drop the connection
    #[arg(long, env = "CHATTERBOX_MAX_LINE_LENGTH", default_value_t = DEFAULT_MAX_LINE_LENGTH)]
    pub max_line_length: usize,

    /// Seconds to wait for connections to finish after shutdown starts
    #[arg(long, env = "CHATTERBOX_SHUTDOWN_GRACE_SECS", default_value_t = 5)]
    pub shutdown_grace_secs: u64,
}

impl Config {
    /// `host:port` string for binding
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind_address, self.port)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }

    pub fn connection_settings(&self) -> ConnectionSettings {
        ConnectionSettings {
            queue_capacity: self.queue_capacity,
            max_line_length: self.max_line_length,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_address: DEFAULT_BIND_ADDRESS.to_string(),
            port: DEFAULT_PORT,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            max_line_length: DEFAULT_MAX_LINE_LENGTH,
            shutdown_grace_secs: 5,
        }
    }
}

/// Chatterbox client
#[derive(Parser, Clone, Debug)]
#[command(name = "chatterbox-client", version, about = "Chatterbox chat client")]
pub struct ClientConfig {
    /// Server host name or address
    #[arg(default_value = DEFAULT_HOST)]
    pub host: String,

    /// Server port
    #[arg(default_value_t = DEFAULT_PORT)]
    pub port: u16,

    /// Connect with this username right away
    #[arg(long, short)]
    pub username: Option<String>,
}

impl ClientConfig {
    pub fn server_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}
