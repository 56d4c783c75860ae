//! Session registry actor
//!
//! The single owner of the username → session table. Dispatchers talk to
//! it through a cloneable [`RegistryHandle`]; every operation is a command
//! answered over a oneshot channel, so operations are serialized by the
//! actor and no caller ever sees a half-applied change.

use std::collections::HashMap;

use tokio::sync::mpsc::{self, OwnedPermit};
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::error::{ChatError, SendError};
use crate::message::ServerMessage;
use crate::session::SessionHandle;
use crate::types::Username;

/// Channel buffer size for registry commands
pub const COMMAND_BUFFER_SIZE: usize = 256;

/// Commands sent from dispatchers to the Registry actor
#[derive(Debug)]
pub enum RegistryCommand {
    /// Claim a username for a session; `ack` carries its CONNECTED
    Register {
        session: SessionHandle,
        ack: OwnedPermit<ServerMessage>,
        reply: oneshot::Sender<Result<(), ChatError>>,
    },
    /// Release a username
    Unregister {
        username: Username,
        reply: oneshot::Sender<bool>,
    },
    /// Find a registered session
    Lookup {
        username: String,
        reply: oneshot::Sender<Option<SessionHandle>>,
    },
    /// Snapshot of registered usernames
    List {
        reply: oneshot::Sender<Vec<String>>,
    },
    /// Queue a message to every session, optionally skipping one
    Broadcast {
        message: ServerMessage,
        exclude: Option<Username>,
        reply: oneshot::Sender<usize>,
    },
}

/// Registered session plus its registration sequence number
#[derive(Debug)]
struct Entry {
    session: SessionHandle,
    seq: u64,
}

/// The Registry actor
///
/// Owns all registration state and processes commands from dispatchers.
pub struct Registry {
    /// Registered sessions: Username -> Entry
    sessions: HashMap<Username, Entry>,
    /// Next registration sequence number, gives `list` its order
    next_seq: u64,
    /// Command receiver channel
    receiver: mpsc::Receiver<RegistryCommand>,
}

impl Registry {
    /// Create a new Registry with the given command receiver
    pub fn new(receiver: mpsc::Receiver<RegistryCommand>) -> Self {
        Self {
            sessions: HashMap::new(),
            next_seq: 0,
            receiver,
        }
    }

    /// Start the actor on the current runtime and return a handle to it
    pub fn spawn() -> RegistryHandle {
        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_BUFFER_SIZE);
        tokio::spawn(Registry::new(cmd_rx).run());
        RegistryHandle::new(cmd_tx)
    }

    /// Run the Registry event loop
    ///
    /// Continuously receives and processes commands until all handles are dropped.
    pub async fn run(mut self) {
        info!("Registry started");

        while let Some(cmd) = self.receiver.recv().await {
            self.handle_command(cmd);
        }

        info!("Registry shutting down");
    }

    /// Process a single command
    fn handle_command(&mut self, cmd: RegistryCommand) {
        match cmd {
            RegistryCommand::Register {
                session,
                ack,
                reply,
            } => {
                let _ = reply.send(self.handle_register(session, ack));
            }
            RegistryCommand::Unregister { username, reply } => {
                let _ = reply.send(self.handle_unregister(&username));
            }
            RegistryCommand::Lookup { username, reply } => {
                let found = self.sessions.get(username.as_str()).map(|e| e.session.clone());
                let _ = reply.send(found);
            }
            RegistryCommand::List { reply } => {
                let _ = reply.send(self.handle_list());
            }
            RegistryCommand::Broadcast {
                message,
                exclude,
                reply,
            } => {
                let _ = reply.send(self.handle_broadcast(message, exclude.as_ref()));
            }
        }
    }

    /// Handle username registration (test-and-insert)
    fn handle_register(
        &mut self,
        session: SessionHandle,
        ack: OwnedPermit<ServerMessage>,
    ) -> Result<(), ChatError> {
        if self.sessions.contains_key(&session.username) {
            debug!(
                "Session {} lost the race for '{}'",
                session.id, session.username
            );
            return Err(ChatError::NameTaken(session.username.to_string()));
        }

        // The ack is queued inside the same step as the insert, so nothing
        // routed to the new name can reach the client before it.
        ack.send(ServerMessage::Connected);

        info!("Session {} registered as '{}'", session.id, session.username);

        let seq = self.next_seq;
        self.next_seq += 1;
        self.sessions
            .insert(session.username.clone(), Entry { session, seq });

        debug!("Total registered sessions: {}", self.sessions.len());
        Ok(())
    }

    /// Handle username release
    fn handle_unregister(&mut self, username: &Username) -> bool {
        let removed = self.sessions.remove(username).is_some();
        if removed {
            info!("'{}' unregistered", username);
            debug!("Total registered sessions: {}", self.sessions.len());
        }
        removed
    }

    /// Registered usernames in registration order
    fn handle_list(&self) -> Vec<String> {
        let mut entries: Vec<&Entry> = self.sessions.values().collect();
        entries.sort_by_key(|e| e.seq);
        entries
            .into_iter()
            .map(|e| e.session.username.to_string())
            .collect()
    }

    /// Fan a message out without waiting on any single session
    fn handle_broadcast(&self, message: ServerMessage, exclude: Option<&Username>) -> usize {
        let mut delivered = 0;

        for (username, entry) in &self.sessions {
            if Some(username) == exclude {
                continue;
            }
            match entry.session.offer(message.clone()) {
                Ok(()) => delivered += 1,
                Err(SendError::Full) => {
                    warn!("Queue full for '{}', dropping {}", username, message.kind());
                }
                Err(SendError::ChannelClosed) => {
                    debug!("'{}' is closing, skipping {}", username, message.kind());
                }
            }
        }

        delivered
    }
}

/// Cloneable client of the Registry actor
#[derive(Debug, Clone)]
pub struct RegistryHandle {
    sender: mpsc::Sender<RegistryCommand>,
}

impl RegistryHandle {
    pub fn new(sender: mpsc::Sender<RegistryCommand>) -> Self {
        Self { sender }
    }

    /// Send a command and wait for its reply
    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> RegistryCommand,
    ) -> Result<T, ChatError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.sender
            .send(make(reply_tx))
            .await
            .map_err(|_| ChatError::RegistryClosed)?;
        reply_rx.await.map_err(|_| ChatError::RegistryClosed)
    }

    /// Register a session under its username and queue its CONNECTED ack
    ///
    /// Waits for room in the session's queue first. Fails with
    /// `ChatError::NameTaken` if the name is already in use, or
    /// `ChatError::SessionClosed` if the session is gone.
    pub async fn register(&self, session: SessionHandle) -> Result<(), ChatError> {
        let ack = session.reserve().await?;
        self.request(|reply| RegistryCommand::Register {
            session,
            ack,
            reply,
        })
        .await?
    }

    /// Remove a username; returns whether it was present
    pub async fn unregister(&self, username: &Username) -> Result<bool, ChatError> {
        let username = username.clone();
        self.request(|reply| RegistryCommand::Unregister { username, reply })
            .await
    }

    pub async fn lookup(&self, username: &str) -> Result<Option<SessionHandle>, ChatError> {
        let username = username.to_string();
        self.request(|reply| RegistryCommand::Lookup { username, reply })
            .await
    }

    /// Registered usernames, in registration order
    pub async fn list(&self) -> Result<Vec<String>, ChatError> {
        self.request(|reply| RegistryCommand::List { reply }).await
    }

    /// Queue `message` to every registered session except `exclude`
    ///
    /// Returns how many sessions it was queued to.
    pub async fn broadcast(
        &self,
        message: ServerMessage,
        exclude: Option<&Username>,
    ) -> Result<usize, ChatError> {
        let exclude = exclude.cloned();
        self.request(|reply| RegistryCommand::Broadcast {
            message,
            exclude,
            reply,
        })
        .await
    }
}
