//! Per-connection dispatcher
//!
//! Reads lines from one connection, decodes them, checks them against the
//! connection's protocol state and routes them through the registry.
//!
//! ```text
//! AWAITING_CONNECT --CONNECT ok--> REGISTERED --DISCONNECT / EOF / error--> TERMINATED
//!        |                                                                      ^
//!        +----------------------------- EOF / error ----------------------------+
//! ```

use std::net::SocketAddr;

use futures_util::StreamExt;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::codec::{ChatCodec, Frame, DEFAULT_MAX_LINE_LENGTH};
use crate::error::{ChatError, SendError};
use crate::message::{ClientMessage, ServerMessage};
use crate::registry::RegistryHandle;
use crate::session::{Session, DEFAULT_QUEUE_CAPACITY};
use crate::types::{SessionId, Username};

/// Description sent in FATAL_ERROR when the server stops
pub const SHUTDOWN_NOTICE: &str = "server shutting down";

/// Per-connection limits
#[derive(Debug, Clone, Copy)]
pub struct ConnectionSettings {
    /// Outbound queue size per session
    pub queue_capacity: usize,
    /// Longest accepted inbound line, in bytes
    pub max_line_length: usize,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            max_line_length: DEFAULT_MAX_LINE_LENGTH,
        }
    }
}

/// Protocol state of one connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum State {
    AwaitingConnect,
    Registered(Username),
    Terminated,
}

/// Handle a new connection
///
/// Splits the stream, sets up the session and runs its dispatcher until
/// the client disconnects, the connection fails or `shutdown` fires.
pub async fn handle_connection<S>(
    stream: S,
    peer: SocketAddr,
    registry: RegistryHandle,
    shutdown: CancellationToken,
    settings: ConnectionSettings,
) -> Result<(), ChatError>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let id = SessionId::new();
    info!("Session {} opened from {}", id, peer);

    let (read_half, write_half) = tokio::io::split(stream);
    let lines = FramedRead::new(
        read_half,
        ChatCodec::with_max_length(settings.max_line_length),
    );
    let session = Session::new(
        id,
        peer,
        FramedWrite::new(write_half, ChatCodec::new()),
        settings.queue_capacity,
    );

    let result = Dispatcher::new(session, registry).run(lines, shutdown).await;

    match &result {
        Ok(()) => info!("Session {} from {} closed", id, peer),
        Err(e) => warn!("Session {} from {} failed: {}", id, peer, e),
    }

    result
}

/// Protocol state machine for one connection
#[derive(Debug)]
pub struct Dispatcher {
    session: Session,
    registry: RegistryHandle,
    state: State,
}

impl Dispatcher {
    pub fn new(session: Session, registry: RegistryHandle) -> Self {
        Self {
            session,
            registry,
            state: State::AwaitingConnect,
        }
    }

    pub fn state(&self) -> &State {
        &self.state
    }

    /// Read and dispatch lines until the connection terminates
    ///
    /// Always leaves the registry and closes the session before returning.
    pub async fn run<R>(
        mut self,
        mut lines: FramedRead<R, ChatCodec>,
        shutdown: CancellationToken,
    ) -> Result<(), ChatError>
    where
        R: AsyncRead + Unpin,
    {
        let outcome = loop {
            let next = tokio::select! {
                next = lines.next() => next,
                _ = shutdown.cancelled() => {
                    debug!("Shutdown reached {}", self.session.display_name());
                    let notice = ServerMessage::FatalError {
                        description: SHUTDOWN_NOTICE.to_string(),
                    };
                    let _ = self.session.send(notice).await;
                    break Ok(());
                }
            };

            match next {
                Some(Ok(frame)) => {
                    if let Err(e) = self.handle_frame(frame).await {
                        break Err(e);
                    }
                    if self.state == State::Terminated {
                        break Ok(());
                    }
                }
                Some(Err(e)) => break Err(e),
                None => {
                    debug!("{} closed the connection", self.session.display_name());
                    break Ok(());
                }
            }
        };

        let left = self.leave().await;
        self.session.close().await;

        outcome.and(left)
    }

    /// Decode and dispatch a single line
    ///
    /// Recoverable errors are answered with an ERROR line and swallowed;
    /// only connection-level errors are returned.
    pub async fn handle_frame(&mut self, frame: Frame) -> Result<(), ChatError> {
        let result = match frame.and_then(|line| line.parse::<ClientMessage>()) {
            Ok(msg) => {
                debug!("{} -> {}", self.session.display_name(), msg.kind());
                self.dispatch(msg).await
            }
            Err(e) => {
                warn!("Invalid line from {}: {}", self.session.display_name(), e);
                Err(e.into())
            }
        };

        match result {
            Err(e) if e.is_recoverable() => {
                debug!("Rejecting request from {}: {}", self.session.display_name(), e);
                self.session.send(e.into()).await?;
                Ok(())
            }
            other => other,
        }
    }

    async fn dispatch(&mut self, msg: ClientMessage) -> Result<(), ChatError> {
        if self.state == State::AwaitingConnect {
            return match msg {
                ClientMessage::Connect { username } => self.handle_connect(&username).await,
                _ => Err(ChatError::NotConnected),
            };
        }

        let State::Registered(username) = self.state.clone() else {
            return Ok(());
        };

        match msg {
            ClientMessage::Connect { .. } => Err(ChatError::AlreadyConnected),
            ClientMessage::Disconnect => self.handle_disconnect(&username).await,
            ClientMessage::SendChat { text } => self.handle_chat(&username, text).await,
            ClientMessage::SendWhisper { recipient, text } => {
                self.handle_whisper(&username, recipient, text).await
            }
            ClientMessage::ListUsers => self.handle_list_users().await,
        }
    }

    /// Handle CONNECT
    async fn handle_connect(&mut self, raw: &str) -> Result<(), ChatError> {
        let username = Username::parse(raw)?;
        let handle = self
            .session
            .handle_as(username.clone())
            .ok_or(ChatError::SessionClosed)?;

        // Queues CONNECTED to this session on success
        self.registry.register(handle).await?;

        self.session.set_username(username.clone());
        self.state = State::Registered(username.clone());
        info!("Session {} connected as '{}'", self.session.id, username);

        self.registry
            .broadcast(
                ServerMessage::UserJoined {
                    username: username.to_string(),
                },
                Some(&username),
            )
            .await?;

        Ok(())
    }

    /// Handle DISCONNECT
    async fn handle_disconnect(&mut self, username: &Username) -> Result<(), ChatError> {
        info!("'{}' disconnecting", username);
        self.session.send(ServerMessage::Disconnected).await?;
        self.leave().await
    }

    /// Handle SEND_CHAT (echoed back to the sender too)
    async fn handle_chat(&mut self, username: &Username, text: String) -> Result<(), ChatError> {
        let delivered = self
            .registry
            .broadcast(
                ServerMessage::ChatReceived {
                    sender: username.to_string(),
                    text,
                },
                None,
            )
            .await?;

        debug!("Chat from '{}' queued to {} session(s)", username, delivered);
        Ok(())
    }

    /// Handle SEND_WHISPER
    async fn handle_whisper(
        &mut self,
        username: &Username,
        recipient: String,
        text: String,
    ) -> Result<(), ChatError> {
        let Some(target) = self.registry.lookup(&recipient).await? else {
            return Err(ChatError::NoSuchUser(recipient));
        };

        let whisper = ServerMessage::WhisperReceived {
            sender: username.to_string(),
            text: text.clone(),
        };
        match target.offer(whisper) {
            Ok(()) => {}
            // Recipient left between lookup and delivery
            Err(SendError::ChannelClosed) => return Err(ChatError::NoSuchUser(recipient)),
            Err(SendError::Full) => {
                warn!("Queue full for '{}', dropping whisper from '{}'", recipient, username);
            }
        }

        debug!("Whisper '{}' -> '{}'", username, recipient);
        self.session
            .send(ServerMessage::WhisperSent { recipient, text })
            .await?;
        Ok(())
    }

    /// Handle LIST_USERS
    async fn handle_list_users(&mut self) -> Result<(), ChatError> {
        let usernames = self.registry.list().await?;
        self.session.send(ServerMessage::Users { usernames }).await?;
        Ok(())
    }

    /// Move to TERMINATED, releasing the username if one was held
    async fn leave(&mut self) -> Result<(), ChatError> {
        let previous = std::mem::replace(&mut self.state, State::Terminated);

        if let State::Registered(username) = previous {
            self.registry.unregister(&username).await?;
            self.registry
                .broadcast(
                    ServerMessage::UserLeft {
                        username: username.to_string(),
                    },
                    Some(&username),
                )
                .await?;
            info!("'{}' left", username);
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::time::Duration;

    use tokio::io::{AsyncWriteExt, DuplexStream, ReadHalf, WriteHalf};
    use tokio::task::JoinHandle;
    use tokio::time::timeout;

    use crate::registry::Registry;

    const WAIT: Duration = Duration::from_secs(2);

    struct TestClient {
        lines: FramedRead<ReadHalf<DuplexStream>, ChatCodec>,
        writer: WriteHalf<DuplexStream>,
        task: JoinHandle<Result<(), ChatError>>,
    }

    impl TestClient {
        fn start(registry: &RegistryHandle, shutdown: &CancellationToken) -> Self {
            let (client, server) = tokio::io::duplex(4096);
            let peer: SocketAddr = "127.0.0.1:40000".parse().unwrap();
            let task = tokio::spawn(handle_connection(
                server,
                peer,
                registry.clone(),
                shutdown.clone(),
                ConnectionSettings::default(),
            ));
            let (read_half, writer) = tokio::io::split(client);
            Self {
                lines: FramedRead::new(read_half, ChatCodec::new()),
                writer,
                task,
            }
        }

        async fn send(&mut self, line: &str) {
            self.writer
                .write_all(format!("{line}\n").as_bytes())
                .await
                .unwrap();
        }

        async fn send_bytes(&mut self, bytes: &[u8]) {
            self.writer.write_all(bytes).await.unwrap();
        }

        async fn recv(&mut self) -> String {
            timeout(WAIT, self.lines.next())
                .await
                .expect("timed out waiting for a line")
                .expect("connection closed")
                .unwrap()
                .expect("line is not utf-8")
        }

        async fn expect_closed(&mut self) {
            let next = timeout(WAIT, self.lines.next())
                .await
                .expect("timed out waiting for close");
            assert!(next.is_none(), "expected end of stream, got {next:?}");
        }

        async fn connect(registry: &RegistryHandle, shutdown: &CancellationToken, name: &str) -> Self {
            let mut client = Self::start(registry, shutdown);
            client.send(&format!("CONNECT::{name}")).await;
            assert_eq!(client.recv().await, "CONNECTED");
            client
        }
    }

    #[tokio::test]
    async fn test_commands_before_connect_are_rejected() {
        let registry = Registry::spawn();
        let shutdown = CancellationToken::new();
        let mut client = TestClient::start(&registry, &shutdown);

        client.send("LIST_USERS").await;
        assert_eq!(client.recv().await, "ERROR::must connect first");

        client.send("SEND_CHAT::hello?").await;
        assert_eq!(client.recv().await, "ERROR::must connect first");

        client.send("CONNECT::alice").await;
        assert_eq!(client.recv().await, "CONNECTED");
    }

    #[tokio::test]
    async fn test_taken_name_allows_retry() {
        let registry = Registry::spawn();
        let shutdown = CancellationToken::new();
        let mut alice = TestClient::connect(&registry, &shutdown, "alice").await;
        let mut other = TestClient::start(&registry, &shutdown);

        other.send("CONNECT::alice").await;
        assert_eq!(other.recv().await, "ERROR::username taken");

        other.send("CONNECT::bob").await;
        assert_eq!(other.recv().await, "CONNECTED");
        assert_eq!(alice.recv().await, "USER_JOINED::bob");
    }

    #[tokio::test]
    async fn test_invalid_and_repeated_connect() {
        let registry = Registry::spawn();
        let shutdown = CancellationToken::new();
        let mut client = TestClient::start(&registry, &shutdown);

        client.send("CONNECT::bad::name").await;
        assert_eq!(client.recv().await, "ERROR::invalid username");
        client.send("CONNECT::").await;
        assert_eq!(client.recv().await, "ERROR::invalid username");
        client.send("CONNECT::alice:").await;
        assert_eq!(client.recv().await, "ERROR::invalid username");

        client.send("CONNECT::alice").await;
        assert_eq!(client.recv().await, "CONNECTED");
        client.send("CONNECT::alice2").await;
        assert_eq!(client.recv().await, "ERROR::already connected");
        assert_eq!(registry.list().await.unwrap(), vec!["alice".to_string()]);
    }

    #[tokio::test]
    async fn test_chat_reaches_everyone_including_sender() {
        let registry = Registry::spawn();
        let shutdown = CancellationToken::new();
        let mut alice = TestClient::connect(&registry, &shutdown, "alice").await;
        let mut bob = TestClient::connect(&registry, &shutdown, "bob").await;
        let mut carol = TestClient::connect(&registry, &shutdown, "carol").await;
        assert_eq!(alice.recv().await, "USER_JOINED::bob");
        assert_eq!(alice.recv().await, "USER_JOINED::carol");
        assert_eq!(bob.recv().await, "USER_JOINED::carol");

        alice.send("SEND_CHAT::hi").await;

        assert_eq!(alice.recv().await, "CHAT_RECEIVED::alice::hi");
        assert_eq!(bob.recv().await, "CHAT_RECEIVED::alice::hi");
        assert_eq!(carol.recv().await, "CHAT_RECEIVED::alice::hi");
    }

    #[tokio::test]
    async fn test_whisper_routes_to_one_user() {
        let registry = Registry::spawn();
        let shutdown = CancellationToken::new();
        let mut alice = TestClient::connect(&registry, &shutdown, "alice").await;
        let mut bob = TestClient::connect(&registry, &shutdown, "bob").await;
        let mut carol = TestClient::connect(&registry, &shutdown, "carol").await;
        assert_eq!(alice.recv().await, "USER_JOINED::bob");
        assert_eq!(alice.recv().await, "USER_JOINED::carol");
        assert_eq!(bob.recv().await, "USER_JOINED::carol");

        alice.send("SEND_WHISPER::bob::hello").await;
        assert_eq!(bob.recv().await, "WHISPER_RECEIVED::alice::hello");
        assert_eq!(alice.recv().await, "WHISPER_SENT::bob::hello");

        // Carol saw nothing: her next line answers her own request
        carol.send("LIST_USERS").await;
        assert_eq!(carol.recv().await, "USERS::alice::bob::carol");
    }

    #[tokio::test]
    async fn test_whisper_to_unknown_user() {
        let registry = Registry::spawn();
        let shutdown = CancellationToken::new();
        let mut alice = TestClient::connect(&registry, &shutdown, "alice").await;
        let mut bob = TestClient::connect(&registry, &shutdown, "bob").await;
        assert_eq!(alice.recv().await, "USER_JOINED::bob");

        alice.send("SEND_WHISPER::nobody::hello").await;
        assert_eq!(alice.recv().await, "ERROR::no such user");

        bob.send("LIST_USERS").await;
        assert_eq!(bob.recv().await, "USERS::alice::bob");
    }

    #[tokio::test]
    async fn test_malformed_lines_keep_session() {
        let registry = Registry::spawn();
        let shutdown = CancellationToken::new();
        let mut alice = TestClient::connect(&registry, &shutdown, "alice").await;

        alice.send("HELLO::world").await;
        assert_eq!(alice.recv().await, "ERROR::unknown message kind 'HELLO'");
        alice.send("SEND_WHISPER::bob").await;
        assert_eq!(alice.recv().await, "ERROR::SEND_WHISPER expects 2 field(s), got 1");
        alice.send("USERS::alice").await;
        assert_eq!(alice.recv().await, "ERROR::unexpected message kind USERS");

        alice.send("LIST_USERS").await;
        assert_eq!(alice.recv().await, "USERS::alice");
    }

    #[tokio::test]
    async fn test_non_utf8_line_keeps_session() {
        let registry = Registry::spawn();
        let shutdown = CancellationToken::new();
        let mut alice = TestClient::connect(&registry, &shutdown, "alice").await;

        alice.send_bytes(b"SEND_CHAT::\xff\xfe\n").await;
        assert_eq!(alice.recv().await, "ERROR::line is not valid UTF-8");

        alice.send("LIST_USERS").await;
        assert_eq!(alice.recv().await, "USERS::alice");
        assert_eq!(registry.list().await.unwrap(), vec!["alice".to_string()]);
    }

    #[tokio::test]
    async fn test_disconnect_announces_and_closes() {
        let registry = Registry::spawn();
        let shutdown = CancellationToken::new();
        let mut alice = TestClient::connect(&registry, &shutdown, "alice").await;
        let mut bob = TestClient::connect(&registry, &shutdown, "bob").await;
        assert_eq!(alice.recv().await, "USER_JOINED::bob");

        alice.send("DISCONNECT").await;
        assert_eq!(alice.recv().await, "DISCONNECTED");
        alice.expect_closed().await;
        assert!(alice.task.await.unwrap().is_ok());

        assert_eq!(bob.recv().await, "USER_LEFT::alice");
        bob.send("LIST_USERS").await;
        assert_eq!(bob.recv().await, "USERS::bob");
        assert!(registry.lookup("alice").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_dropped_connection_is_cleaned_up() {
        let registry = Registry::spawn();
        let shutdown = CancellationToken::new();
        let alice = TestClient::connect(&registry, &shutdown, "alice").await;
        let mut bob = TestClient::connect(&registry, &shutdown, "bob").await;

        let TestClient {
            lines,
            writer,
            task,
        } = alice;
        drop(lines);
        drop(writer);
        let _ = timeout(WAIT, task).await.expect("dispatcher did not stop");

        assert_eq!(bob.recv().await, "USER_LEFT::alice");
        assert!(registry.lookup("alice").await.unwrap().is_none());
        assert_eq!(registry.list().await.unwrap(), vec!["bob".to_string()]);
    }

    #[tokio::test]
    async fn test_drop_before_connect_leaves_no_trace() {
        let registry = Registry::spawn();
        let shutdown = CancellationToken::new();
        let client = TestClient::start(&registry, &shutdown);

        let TestClient {
            lines,
            writer,
            task,
        } = client;
        drop(lines);
        drop(writer);

        let result = timeout(WAIT, task).await.expect("dispatcher did not stop");
        assert!(result.unwrap().is_ok());
        assert!(registry.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_shutdown_sends_fatal_error() {
        let registry = Registry::spawn();
        let shutdown = CancellationToken::new();
        let mut alice = TestClient::connect(&registry, &shutdown, "alice").await;
        let mut waiting = TestClient::start(&registry, &shutdown);

        shutdown.cancel();

        assert_eq!(alice.recv().await, "FATAL_ERROR::server shutting down");
        alice.expect_closed().await;
        assert_eq!(waiting.recv().await, "FATAL_ERROR::server shutting down");
        waiting.expect_closed().await;

        assert!(alice.task.await.unwrap().is_ok());
        assert!(registry.list().await.unwrap().is_empty());
    }
}
