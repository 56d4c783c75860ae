//! Server listener
//!
//! Accepts TCP connections and runs one dispatcher task per connection.
//! The accept loop never waits on a client; shutdown is driven by a
//! [`CancellationToken`] shared with every dispatcher.

use std::net::SocketAddr;

use tokio::net::TcpListener;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::dispatcher::handle_connection;
use crate::error::ServerError;
use crate::registry::{Registry, RegistryHandle};

/// Bound listener plus the shared registry
pub struct Server {
    listener: TcpListener,
    registry: RegistryHandle,
    shutdown: CancellationToken,
    config: Config,
}

impl Server {
    /// Bind the configured address and start the registry actor
    pub async fn bind(config: Config) -> Result<Self, ServerError> {
        let addr = config.listen_addr();
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|source| ServerError::Bind { addr, source })?;

        Ok(Self {
            listener,
            registry: Registry::spawn(),
            shutdown: CancellationToken::new(),
            config,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, ServerError> {
        self.listener.local_addr().map_err(ServerError::LocalAddr)
    }

    /// Token that stops the server when cancelled
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn registry(&self) -> RegistryHandle {
        self.registry.clone()
    }

    /// Accept connections until the shutdown token fires, then drain
    pub async fn run(self) -> Result<(), ServerError> {
        let Server {
            listener,
            registry,
            shutdown,
            config,
        } = self;

        let local = listener.local_addr().map_err(ServerError::LocalAddr)?;
        info!("Chatterbox server listening on {}", local);

        let settings = config.connection_settings();
        let mut connections = JoinSet::new();

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,

                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        info!("New connection from {}", peer);
                        connections.spawn(handle_connection(
                            stream,
                            peer,
                            registry.clone(),
                            shutdown.clone(),
                            settings,
                        ));
                    }
                    Err(e) => {
                        error!("Failed to accept connection: {}", e);
                    }
                },

                Some(joined) = connections.join_next(), if !connections.is_empty() => {
                    if let Err(e) = joined {
                        error!("Connection task panicked: {}", e);
                    }
                }
            }
        }

        drop(listener);
        info!(
            "Shutting down, waiting for {} connection(s)",
            connections.len()
        );

        let drain = async {
            while let Some(joined) = connections.join_next().await {
                if let Err(e) = joined {
                    error!("Connection task panicked: {}", e);
                }
            }
        };

        if tokio::time::timeout(config.shutdown_grace(), drain).await.is_err() {
            warn!(
                "{} connection(s) still open after {:?}, aborting",
                connections.len(),
                config.shutdown_grace()
            );
            connections.shutdown().await;
        }

        debug!("All connections finished");
        info!("Chatterbox server stopped");
        Ok(())
    }
}
