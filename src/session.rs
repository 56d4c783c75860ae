//! Session definition
//!
//! A session is the server-side state of one accepted connection: its id,
//! its username once registered, and the outbound queue drained onto the
//! socket by a dedicated writer task.

use std::net::SocketAddr;

use futures_util::SinkExt;
use tokio::io::AsyncWrite;
use tokio::sync::mpsc::{self, OwnedPermit};
use tokio::task::JoinHandle;
use tokio_util::codec::FramedWrite;
use tracing::{debug, warn};

use crate::codec::ChatCodec;
use crate::error::SendError;
use crate::message::ServerMessage;
use crate::types::{SessionId, Username};

/// Default outbound queue size per session
pub const DEFAULT_QUEUE_CAPACITY: usize = 64;

/// Connected session, owned by its dispatcher
#[derive(Debug)]
pub struct Session {
    /// Unique identifier for this connection
    pub id: SessionId,
    /// Remote address
    pub peer: SocketAddr,
    /// Username (None until registered)
    username: Option<Username>,
    /// Server → Client message queue (None once closed)
    sender: Option<mpsc::Sender<ServerMessage>>,
    /// Task writing queued messages to the socket
    writer: Option<JoinHandle<()>>,
}

impl Session {
    /// Create a session over the write half of a connection
    ///
    /// Spawns the writer task, so this must run inside a tokio runtime.
    pub fn new<W>(
        id: SessionId,
        peer: SocketAddr,
        sink: FramedWrite<W, ChatCodec>,
        queue_capacity: usize,
    ) -> Self
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let (sender, receiver) = mpsc::channel(queue_capacity.max(1));
        let writer = tokio::spawn(write_loop(id, sink, receiver));

        Self {
            id,
            peer,
            username: None,
            sender: Some(sender),
            writer: Some(writer),
        }
    }

    pub fn username(&self) -> Option<&Username> {
        self.username.as_ref()
    }

    /// Get the display name for this session
    ///
    /// Returns the username if registered, otherwise the session id and
    /// peer address.
    pub fn display_name(&self) -> String {
        match &self.username {
            Some(name) => name.to_string(),
            None => format!("{} ({})", self.id, self.peer),
        }
    }

    pub fn is_registered(&self) -> bool {
        self.username.is_some()
    }

    pub fn is_closed(&self) -> bool {
        self.sender.is_none()
    }

    /// Record the registered username
    pub(crate) fn set_username(&mut self, username: Username) {
        debug_assert!(self.username.is_none(), "session registered twice");
        self.username = Some(username);
    }

    /// Handle the registry keeps for routing to this session under `username`
    ///
    /// Returns None once the session is closed.
    pub fn handle_as(&self, username: Username) -> Option<SessionHandle> {
        let sender = self.sender.clone()?;
        Some(SessionHandle::new(self.id, username, sender))
    }

    /// Queue a message to this session's client, waiting for space
    ///
    /// Returns an error if the writer has stopped (client disconnected).
    pub async fn send(&self, msg: ServerMessage) -> Result<(), SendError> {
        let Some(sender) = &self.sender else {
            return Err(SendError::ChannelClosed);
        };
        sender.send(msg).await.map_err(|_| SendError::ChannelClosed)
    }

    /// Close the session
    ///
    /// Drops the queue and waits for the writer to flush what is already
    /// queued and shut the write half down. Safe to call more than once.
    pub async fn close(&mut self) {
        self.sender.take();

        if let Some(writer) = self.writer.take() {
            if let Err(e) = writer.await {
                warn!("Writer task for session {} failed: {}", self.id, e);
            }
            debug!("Session {} closed", self.id);
        }
    }
}

/// Cloneable route to a registered session
#[derive(Debug, Clone)]
pub struct SessionHandle {
    pub id: SessionId,
    pub username: Username,
    sender: mpsc::Sender<ServerMessage>,
}

impl SessionHandle {
    pub(crate) fn new(
        id: SessionId,
        username: Username,
        sender: mpsc::Sender<ServerMessage>,
    ) -> Self {
        Self {
            id,
            username,
            sender,
        }
    }

    /// Wait for a free queue slot and hold it
    ///
    /// The slot stays reserved until the permit is used or dropped, so a
    /// message sent through it can never hit a full queue.
    pub async fn reserve(&self) -> Result<OwnedPermit<ServerMessage>, SendError> {
        self.sender
            .clone()
            .reserve_owned()
            .await
            .map_err(|_| SendError::ChannelClosed)
    }

    /// Queue a message without waiting
    ///
    /// A full queue drops the message and reports `SendError::Full`.
    pub fn offer(&self, msg: ServerMessage) -> Result<(), SendError> {
        self.sender.try_send(msg).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => SendError::Full,
            mpsc::error::TrySendError::Closed(_) => SendError::ChannelClosed,
        })
    }
}

/// Drain the queue onto the socket until every sender is gone
async fn write_loop<W>(
    id: SessionId,
    mut sink: FramedWrite<W, ChatCodec>,
    mut receiver: mpsc::Receiver<ServerMessage>,
) where
    W: AsyncWrite + Unpin,
{
    while let Some(msg) = receiver.recv().await {
        if let Err(e) = sink.send(msg).await {
            debug!("Write failed for session {}: {}", id, e);
            break;
        }
    }

    // Flush and shut down the write half
    if let Err(e) = SinkExt::<ServerMessage>::close(&mut sink).await {
        debug!("Close failed for session {}: {}", id, e);
    }
    debug!("Write task ended for session {}", id);
}
