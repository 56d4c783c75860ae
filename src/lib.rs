//! Chatterbox chat server library
//!
//! A minimal multi-user chat service over a newline-delimited text
//! protocol, built on tokio.
//!
//! # Features
//! - Username registration (unique while connected)
//! - Chat broadcast to every connected user
//! - Whispers to a single user
//! - User listing and join/leave announcements
//! - Graceful shutdown
//!
//! # Architecture
//! - `Registry` is an actor owning the username → session table
//! - Each connection runs its own `Dispatcher` task that talks to the
//!   registry through a cloneable `RegistryHandle`
//! - Each session has a writer task draining its outbound queue, so a
//!   slow client never blocks anyone else
//!
//! # Example
//! ```ignore
//! use chatterbox::{Config, Server};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let server = Server::bind(Config::default()).await?;
//!     let shutdown = server.shutdown_token();
//!     tokio::spawn(async move {
//!         let _ = tokio::signal::ctrl_c().await;
//!         shutdown.cancel();
//!     });
//!     server.run().await?;
//!     Ok(())
//! }
//! ```

pub mod client;
pub mod codec;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod message;
pub mod registry;
pub mod server;
pub mod session;
pub mod types;

// Re-export main types for convenience
pub use codec::{ChatCodec, Frame};
pub use config::{ClientConfig, Config};
pub use dispatcher::{handle_connection, ConnectionSettings, Dispatcher, State};
pub use error::{ChatError, CommandError, DecodeError, SendError, ServerError};
pub use message::{ClientMessage, Kind, Message, ServerMessage, SEPARATOR};
pub use registry::{Registry, RegistryCommand, RegistryHandle};
pub use server::Server;
pub use session::{Session, SessionHandle};
pub use types::{SessionId, Username};
