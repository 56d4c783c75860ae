//! Message protocol definitions
//!
//! Line-based bidirectional protocol. Every line is a kind token followed
//! by zero or more fields, all joined by [`SEPARATOR`]:
//!
//! ```text
//! SEND_WHISPER::bob::hello
//! USERS::alice::bob
//! LIST_USERS
//! ```
//!
//! For kinds with a fixed number of fields the last field takes the rest
//! of the line, so free text may itself contain the separator. Nothing is
//! escaped: usernames are validated at CONNECT and may never contain it.

use std::fmt;
use std::str::FromStr;

use crate::error::{ChatError, DecodeError};

/// Field separator on the wire
pub const SEPARATOR: &str = "::";

/// Every message kind, in both directions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Kind {
    Connect,
    Disconnect,
    SendChat,
    SendWhisper,
    ListUsers,
    Connected,
    Disconnected,
    Error,
    FatalError,
    ChatReceived,
    WhisperReceived,
    WhisperSent,
    Users,
    UserJoined,
    UserLeft,
}

/// Number of fields a kind carries
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arity {
    Fixed(usize),
    Variadic,
}

impl Kind {
    pub const ALL: [Kind; 15] = [
        Kind::Connect,
        Kind::Disconnect,
        Kind::SendChat,
        Kind::SendWhisper,
        Kind::ListUsers,
        Kind::Connected,
        Kind::Disconnected,
        Kind::Error,
        Kind::FatalError,
        Kind::ChatReceived,
        Kind::WhisperReceived,
        Kind::WhisperSent,
        Kind::Users,
        Kind::UserJoined,
        Kind::UserLeft,
    ];

    /// Wire token
    pub fn token(self) -> &'static str {
        match self {
            Kind::Connect => "CONNECT",
            Kind::Disconnect => "DISCONNECT",
            Kind::SendChat => "SEND_CHAT",
            Kind::SendWhisper => "SEND_WHISPER",
            Kind::ListUsers => "LIST_USERS",
            Kind::Connected => "CONNECTED",
            Kind::Disconnected => "DISCONNECTED",
            Kind::Error => "ERROR",
            Kind::FatalError => "FATAL_ERROR",
            Kind::ChatReceived => "CHAT_RECEIVED",
            Kind::WhisperReceived => "WHISPER_RECEIVED",
            Kind::WhisperSent => "WHISPER_SENT",
            Kind::Users => "USERS",
            Kind::UserJoined => "USER_JOINED",
            Kind::UserLeft => "USER_LEFT",
        }
    }

    pub fn from_token(token: &str) -> Option<Kind> {
        Self::ALL.into_iter().find(|kind| kind.token() == token)
    }

    pub fn arity(self) -> Arity {
        match self {
            Kind::Disconnect | Kind::ListUsers | Kind::Connected | Kind::Disconnected => {
                Arity::Fixed(0)
            }
            Kind::Connect
            | Kind::SendChat
            | Kind::Error
            | Kind::FatalError
            | Kind::UserJoined
            | Kind::UserLeft => Arity::Fixed(1),
            Kind::SendWhisper
            | Kind::ChatReceived
            | Kind::WhisperReceived
            | Kind::WhisperSent => Arity::Fixed(2),
            Kind::Users => Arity::Variadic,
        }
    }
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.token())
    }
}

/// Client → Server message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientMessage {
    /// Register under a username
    Connect { username: String },
    /// Leave the server
    Disconnect,
    /// Send a chat message to everyone
    SendChat { text: String },
    /// Send a private message to one user
    SendWhisper { recipient: String, text: String },
    /// Ask for the connected users
    ListUsers,
}

/// Server → Client message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerMessage {
    /// Registration succeeded
    Connected,
    /// Acknowledges DISCONNECT, the connection closes next
    Disconnected,
    /// Recoverable error, connection stays open
    Error { description: String },
    /// Unrecoverable error, connection closes next
    FatalError { description: String },
    /// Chat message from a user
    ChatReceived { sender: String, text: String },
    /// Private message to this client
    WhisperReceived { sender: String, text: String },
    /// Acknowledges a whisper this client sent
    WhisperSent { recipient: String, text: String },
    /// Registered users, in registration order
    Users { usernames: Vec<String> },
    /// Another user registered
    UserJoined { username: String },
    /// Another user left
    UserLeft { username: String },
}

/// Any decoded line
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Client(ClientMessage),
    Server(ServerMessage),
}

impl Message {
    /// Decode a single line (without its trailing newline)
    pub fn decode(line: &str) -> Result<Self, DecodeError> {
        let line = line.strip_suffix('\r').unwrap_or(line);
        let (token, rest) = match line.split_once(SEPARATOR) {
            Some((token, rest)) => (token, Some(rest)),
            None => (line, None),
        };

        let kind =
            Kind::from_token(token).ok_or_else(|| DecodeError::UnknownKind(token.to_string()))?;

        let fields: Vec<String> = match (kind.arity(), rest) {
            (_, None) => Vec::new(),
            (Arity::Fixed(n), Some(rest)) if n > 0 => {
                rest.splitn(n, SEPARATOR).map(str::to_owned).collect()
            }
            (_, Some(rest)) => rest.split(SEPARATOR).map(str::to_owned).collect(),
        };

        let message = match kind {
            Kind::Connect => {
                let [username] = fixed::<1>(kind, fields)?;
                Message::Client(ClientMessage::Connect { username })
            }
            Kind::Disconnect => {
                let [] = fixed::<0>(kind, fields)?;
                Message::Client(ClientMessage::Disconnect)
            }
            Kind::SendChat => {
                let [text] = fixed::<1>(kind, fields)?;
                Message::Client(ClientMessage::SendChat { text })
            }
            Kind::SendWhisper => {
                let [recipient, text] = fixed::<2>(kind, fields)?;
                Message::Client(ClientMessage::SendWhisper { recipient, text })
            }
            Kind::ListUsers => {
                let [] = fixed::<0>(kind, fields)?;
                Message::Client(ClientMessage::ListUsers)
            }
            Kind::Connected => {
                let [] = fixed::<0>(kind, fields)?;
                Message::Server(ServerMessage::Connected)
            }
            Kind::Disconnected => {
                let [] = fixed::<0>(kind, fields)?;
                Message::Server(ServerMessage::Disconnected)
            }
            Kind::Error => {
                let [description] = fixed::<1>(kind, fields)?;
                Message::Server(ServerMessage::Error { description })
            }
            Kind::FatalError => {
                let [description] = fixed::<1>(kind, fields)?;
                Message::Server(ServerMessage::FatalError { description })
            }
            Kind::ChatReceived => {
                let [sender, text] = fixed::<2>(kind, fields)?;
                Message::Server(ServerMessage::ChatReceived { sender, text })
            }
            Kind::WhisperReceived => {
                let [sender, text] = fixed::<2>(kind, fields)?;
                Message::Server(ServerMessage::WhisperReceived { sender, text })
            }
            Kind::WhisperSent => {
                let [recipient, text] = fixed::<2>(kind, fields)?;
                Message::Server(ServerMessage::WhisperSent { recipient, text })
            }
            Kind::Users => Message::Server(ServerMessage::Users { usernames: fields }),
            Kind::UserJoined => {
                let [username] = fixed::<1>(kind, fields)?;
                Message::Server(ServerMessage::UserJoined { username })
            }
            Kind::UserLeft => {
                let [username] = fixed::<1>(kind, fields)?;
                Message::Server(ServerMessage::UserLeft { username })
            }
        };

        Ok(message)
    }

    /// Encode as a single line (without the trailing newline)
    pub fn encode(&self) -> String {
        self.to_string()
    }

    pub fn kind(&self) -> Kind {
        match self {
            Message::Client(msg) => msg.kind(),
            Message::Server(msg) => msg.kind(),
        }
    }
}

/// Move exactly `N` decoded fields into an array
fn fixed<const N: usize>(kind: Kind, fields: Vec<String>) -> Result<[String; N], DecodeError> {
    let found = fields.len();
    fields.try_into().map_err(|_| DecodeError::ArityMismatch {
        kind,
        expected: N,
        found,
    })
}

fn write_line(f: &mut fmt::Formatter<'_>, kind: Kind, fields: &[&str]) -> fmt::Result {
    f.write_str(kind.token())?;
    for field in fields {
        f.write_str(SEPARATOR)?;
        f.write_str(field)?;
    }
    Ok(())
}

impl ClientMessage {
    pub fn kind(&self) -> Kind {
        match self {
            ClientMessage::Connect { .. } => Kind::Connect,
            ClientMessage::Disconnect => Kind::Disconnect,
            ClientMessage::SendChat { .. } => Kind::SendChat,
            ClientMessage::SendWhisper { .. } => Kind::SendWhisper,
            ClientMessage::ListUsers => Kind::ListUsers,
        }
    }

    pub fn encode(&self) -> String {
        self.to_string()
    }
}

impl ServerMessage {
    pub fn kind(&self) -> Kind {
        match self {
            ServerMessage::Connected => Kind::Connected,
            ServerMessage::Disconnected => Kind::Disconnected,
            ServerMessage::Error { .. } => Kind::Error,
            ServerMessage::FatalError { .. } => Kind::FatalError,
            ServerMessage::ChatReceived { .. } => Kind::ChatReceived,
            ServerMessage::WhisperReceived { .. } => Kind::WhisperReceived,
            ServerMessage::WhisperSent { .. } => Kind::WhisperSent,
            ServerMessage::Users { .. } => Kind::Users,
            ServerMessage::UserJoined { .. } => Kind::UserJoined,
            ServerMessage::UserLeft { .. } => Kind::UserLeft,
        }
    }

    pub fn encode(&self) -> String {
        self.to_string()
    }

    pub fn error(description: impl Into<String>) -> Self {
        ServerMessage::Error {
            description: description.into(),
        }
    }
}

impl fmt::Display for ClientMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = self.kind();
        match self {
            ClientMessage::Connect { username } => write_line(f, kind, &[username.as_str()]),
            ClientMessage::SendChat { text } => write_line(f, kind, &[text.as_str()]),
            ClientMessage::SendWhisper { recipient, text } => {
                write_line(f, kind, &[recipient.as_str(), text.as_str()])
            }
            ClientMessage::Disconnect | ClientMessage::ListUsers => write_line(f, kind, &[]),
        }
    }
}

impl fmt::Display for ServerMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = self.kind();
        match self {
            ServerMessage::Connected | ServerMessage::Disconnected => write_line(f, kind, &[]),
            ServerMessage::Error { description } | ServerMessage::FatalError { description } => {
                write_line(f, kind, &[description.as_str()])
            }
            ServerMessage::ChatReceived { sender, text }
            | ServerMessage::WhisperReceived { sender, text } => {
                write_line(f, kind, &[sender.as_str(), text.as_str()])
            }
            ServerMessage::WhisperSent { recipient, text } => {
                write_line(f, kind, &[recipient.as_str(), text.as_str()])
            }
            ServerMessage::Users { usernames } => {
                let fields: Vec<&str> = usernames.iter().map(String::as_str).collect();
                write_line(f, kind, &fields)
            }
            ServerMessage::UserJoined { username } | ServerMessage::UserLeft { username } => {
                write_line(f, kind, &[username.as_str()])
            }
        }
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Message::Client(msg) => msg.fmt(f),
            Message::Server(msg) => msg.fmt(f),
        }
    }
}

impl FromStr for Message {
    type Err = DecodeError;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        Message::decode(line)
    }
}

impl FromStr for ClientMessage {
    type Err = DecodeError;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        match Message::decode(line)? {
            Message::Client(msg) => Ok(msg),
            Message::Server(msg) => Err(DecodeError::UnexpectedKind(msg.kind())),
        }
    }
}

impl FromStr for ServerMessage {
    type Err = DecodeError;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        match Message::decode(line)? {
            Message::Server(msg) => Ok(msg),
            Message::Client(msg) => Err(DecodeError::UnexpectedKind(msg.kind())),
        }
    }
}

impl From<ClientMessage> for Message {
    fn from(msg: ClientMessage) -> Self {
        Message::Client(msg)
    }
}

impl From<ServerMessage> for Message {
    fn from(msg: ServerMessage) -> Self {
        Message::Server(msg)
    }
}

/// Convert ChatError to ServerMessage for client notification
impl From<ChatError> for ServerMessage {
    fn from(err: ChatError) -> Self {
        if err.is_recoverable() {
            ServerMessage::error(err.to_string())
        } else {
            // Fatal errors normally close the connection instead
            ServerMessage::FatalError {
                description: err.to_string(),
            }
        }
    }
}
