//! Chat client
//!
//! Thin terminal front end: turns typed commands into protocol messages
//! and server messages into readable lines.

use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::{debug, warn};

use crate::codec::ChatCodec;
use crate::config::ClientConfig;
use crate::error::{ChatError, CommandError};
use crate::message::{ClientMessage, ServerMessage};

pub const WELCOME: &str = "Welcome to Chatterbox! Type '/help' to see a list of commands.";

pub const HELP_MENU: &str = "\
/help - displays this message
/quit - quit Chatterbox
/connect <username> - join the server under a username
/c <message> - send a message to all currently connected users
/w <recipient> <message> - send a private message to the recipient
/list - display a list of currently connected users";

/// A command typed at the prompt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Help,
    Quit,
    Connect(String),
    Chat(String),
    Whisper { recipient: String, text: String },
    List,
}

impl Command {
    pub fn parse(input: &str) -> Result<Command, CommandError> {
        let input = input.trim();
        let (verb, rest) = match input.split_once(char::is_whitespace) {
            Some((verb, rest)) => (verb, rest.trim_start()),
            None => (input, ""),
        };

        match verb {
            "/help" => Ok(Command::Help),
            "/quit" => Ok(Command::Quit),
            "/list" => Ok(Command::List),
            "/connect" if !rest.is_empty() => Ok(Command::Connect(rest.to_string())),
            "/connect" => Err(CommandError::Usage("/connect <username>")),
            "/c" if !rest.is_empty() => Ok(Command::Chat(rest.to_string())),
            "/c" => Err(CommandError::Usage("/c <message>")),
            "/w" => match rest.split_once(char::is_whitespace) {
                Some((recipient, text)) if !text.trim().is_empty() => Ok(Command::Whisper {
                    recipient: recipient.to_string(),
                    text: text.trim_start().to_string(),
                }),
                _ => Err(CommandError::Usage("/w <recipient> <message>")),
            },
            _ => Err(CommandError::Unknown(verb.to_string())),
        }
    }

    /// Protocol message for this command; None for local-only commands
    pub fn into_message(self) -> Option<ClientMessage> {
        match self {
            Command::Help => None,
            Command::Quit => Some(ClientMessage::Disconnect),
            Command::Connect(username) => Some(ClientMessage::Connect { username }),
            Command::Chat(text) => Some(ClientMessage::SendChat { text }),
            Command::Whisper { recipient, text } => {
                Some(ClientMessage::SendWhisper { recipient, text })
            }
            Command::List => Some(ClientMessage::ListUsers),
        }
    }
}

/// Human-readable form of a server message
pub fn render(msg: &ServerMessage, config: &ClientConfig) -> String {
    match msg {
        ServerMessage::Connected => format!(
            "Chatterbox server host: {}\nChatterbox server port: {}",
            config.host, config.port
        ),
        ServerMessage::Disconnected => "Goodbye!".to_string(),
        ServerMessage::Error { description } => description.clone(),
        ServerMessage::FatalError { description } => format!("Fatal error: {description}"),
        ServerMessage::ChatReceived { sender, text } => format!("{sender} said: {text}"),
        ServerMessage::WhisperReceived { sender, text } => {
            format!("{sender} whispers to you: {text}")
        }
        ServerMessage::WhisperSent { recipient, text } => {
            format!("You whispered to {recipient}: {text}")
        }
        ServerMessage::Users { usernames } => {
            let mut out = String::from("The following users are connected:");
            for name in usernames {
                out.push('\n');
                out.push_str(name);
            }
            out
        }
        ServerMessage::UserJoined { username } => {
            format!("A user has joined the Chatterbox server: {username}")
        }
        ServerMessage::UserLeft { username } => format!("A user has left the server: {username}"),
    }
}

/// How a client run ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Exit {
    /// Server acknowledged DISCONNECT
    Quit,
    /// Server sent FATAL_ERROR
    Fatal,
    /// Connection ended without a goodbye
    ServerClosed,
}

impl Exit {
    /// Process exit code
    pub fn code(self) -> i32 {
        match self {
            Exit::Quit => 0,
            Exit::Fatal | Exit::ServerClosed => 1,
        }
    }
}

/// Run the client over an established connection
///
/// Reads commands from `input`, prints to `output`, and returns once the
/// server says goodbye or the connection ends. Closing `input` sends
/// DISCONNECT.
pub async fn run<S, R, W>(
    config: &ClientConfig,
    stream: S,
    input: R,
    mut output: W,
) -> Result<Exit, ChatError>
where
    S: AsyncRead + AsyncWrite,
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let (read_half, write_half) = tokio::io::split(stream);
    let mut server = FramedRead::new(read_half, ChatCodec::new());
    let mut sink = FramedWrite::new(write_half, ChatCodec::new());
    let mut input = input.lines();
    let mut input_open = true;
    let mut quitting = false;

    print(&mut output, WELCOME).await?;

    if let Some(username) = &config.username {
        sink.send(ClientMessage::Connect {
            username: username.clone(),
        })
        .await?;
    }

    loop {
        tokio::select! {
            line = input.next_line(), if input_open => {
                let Some(line) = line? else {
                    debug!("Input closed");
                    input_open = false;
                    if !quitting {
                        quitting = true;
                        sink.send(ClientMessage::Disconnect).await?;
                    }
                    continue;
                };
                if line.trim().is_empty() {
                    continue;
                }

                match Command::parse(&line) {
                    Ok(Command::Help) => print(&mut output, HELP_MENU).await?,
                    Ok(command) => {
                        quitting |= command == Command::Quit;
                        if let Some(msg) = command.into_message() {
                            sink.send(msg).await?;
                        }
                    }
                    Err(e) => print(&mut output, &e.to_string()).await?,
                }
            }

            frame = server.next() => {
                let frame = match frame {
                    Some(frame) => frame?,
                    None => {
                        print(&mut output, "Connection closed by server").await?;
                        return Ok(Exit::ServerClosed);
                    }
                };

                let msg = match frame.and_then(|line| line.parse::<ServerMessage>()) {
                    Ok(msg) => msg,
                    Err(e) => {
                        warn!("Ignoring line from server: {}", e);
                        continue;
                    }
                };

                print(&mut output, &render(&msg, config)).await?;
                match msg {
                    ServerMessage::Disconnected => return Ok(Exit::Quit),
                    ServerMessage::FatalError { .. } => return Ok(Exit::Fatal),
                    _ => {}
                }
            }
        }
    }
}

async fn print<W>(output: &mut W, text: &str) -> Result<(), ChatError>
where
    W: AsyncWrite + Unpin,
{
    output.write_all(text.as_bytes()).await?;
    output.write_all(b"\n").await?;
    output.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    use tokio::io::DuplexStream;

    fn config(username: Option<&str>) -> ClientConfig {
        ClientConfig {
            host: "127.0.0.1".into(),
            port: 4567,
            username: username.map(str::to_string),
        }
    }

    /// Server end of a duplex pipe
    struct FakeServer {
        lines: FramedRead<tokio::io::ReadHalf<DuplexStream>, ChatCodec>,
        sink: FramedWrite<tokio::io::WriteHalf<DuplexStream>, ChatCodec>,
    }

    impl FakeServer {
        fn new(stream: DuplexStream) -> Self {
            let (r, w) = tokio::io::split(stream);
            Self {
                lines: FramedRead::new(r, ChatCodec::new()),
                sink: FramedWrite::new(w, ChatCodec::new()),
            }
        }

        async fn expect(&mut self, line: &str) {
            assert_eq!(self.lines.next().await.unwrap().unwrap().unwrap(), line);
        }

        async fn reply(&mut self, msg: ServerMessage) {
            self.sink.send(msg).await.unwrap();
        }
    }

    #[test]
    fn test_parse_commands() {
        assert_eq!(Command::parse("/help"), Ok(Command::Help));
        assert_eq!(Command::parse("  /quit  "), Ok(Command::Quit));
        assert_eq!(Command::parse("/list"), Ok(Command::List));
        assert_eq!(
            Command::parse("/connect alice"),
            Ok(Command::Connect("alice".into()))
        );
        assert_eq!(
            Command::parse("/c hello there"),
            Ok(Command::Chat("hello there".into()))
        );
        assert_eq!(
            Command::parse("/w bob  see you soon"),
            Ok(Command::Whisper {
                recipient: "bob".into(),
                text: "see you soon".into()
            })
        );
    }

    #[test]
    fn test_parse_rejects_bad_input() {
        assert_eq!(
            Command::parse("/shout hi"),
            Err(CommandError::Unknown("/shout".into()))
        );
        assert_eq!(
            Command::parse("hello"),
            Err(CommandError::Unknown("hello".into()))
        );
        assert_eq!(Command::parse("/c"), Err(CommandError::Usage("/c <message>")));
        assert_eq!(
            Command::parse("/w bob"),
            Err(CommandError::Usage("/w <recipient> <message>"))
        );
        assert_eq!(
            Command::parse("/connect"),
            Err(CommandError::Usage("/connect <username>"))
        );
    }

    #[test]
    fn test_commands_map_to_messages() {
        assert_eq!(Command::Help.into_message(), None);
        assert_eq!(
            Command::Quit.into_message().map(|m| m.encode()).as_deref(),
            Some("DISCONNECT")
        );
        assert_eq!(
            Command::parse("/w bob hi there")
                .unwrap()
                .into_message()
                .map(|m| m.encode())
                .as_deref(),
            Some("SEND_WHISPER::bob::hi there")
        );
    }

    #[test]
    fn test_render_server_messages() {
        let cfg = config(None);
        assert_eq!(
            render(&ServerMessage::Connected, &cfg),
            "Chatterbox server host: 127.0.0.1\nChatterbox server port: 4567"
        );
        assert_eq!(
            render(
                &ServerMessage::ChatReceived {
                    sender: "alice".into(),
                    text: "hi".into()
                },
                &cfg
            ),
            "alice said: hi"
        );
        assert_eq!(
            render(
                &ServerMessage::Users {
                    usernames: vec!["alice".into(), "bob".into()]
                },
                &cfg
            ),
            "The following users are connected:\nalice\nbob"
        );
        assert_eq!(
            render(&ServerMessage::error("no such user"), &cfg),
            "no such user"
        );
    }

    #[tokio::test]
    async fn test_run_quits_gracefully() {
        let (client_end, server_end) = tokio::io::duplex(4096);
        let cfg = config(Some("alice"));
        let input: &[u8] = b"/c hi\n\n/bogus\n/quit\n";
        let mut output = Vec::new();

        let server = tokio::spawn(async move {
            let mut server = FakeServer::new(server_end);
            server.expect("CONNECT::alice").await;
            server.reply(ServerMessage::Connected).await;
            server.expect("SEND_CHAT::hi").await;
            server
                .reply(ServerMessage::ChatReceived {
                    sender: "alice".into(),
                    text: "hi".into(),
                })
                .await;
            server.expect("DISCONNECT").await;
            server.reply(ServerMessage::Disconnected).await;
            server
        });

        let exit = run(&cfg, client_end, input, &mut output).await.unwrap();
        let _server = server.await.unwrap();

        assert_eq!(exit, Exit::Quit);
        assert_eq!(exit.code(), 0);
        let text = String::from_utf8(output).unwrap();
        assert!(text.starts_with(WELCOME));
        assert!(text.contains("Invalid command entered!"));
        assert!(text.contains("alice said: hi"));
        assert!(text.trim_end().ends_with("Goodbye!"));
    }

    #[tokio::test]
    async fn test_run_reports_fatal_error() {
        let (client_end, server_end) = tokio::io::duplex(4096);
        let cfg = config(None);
        let mut output = Vec::new();

        let server = tokio::spawn(async move {
            let mut server = FakeServer::new(server_end);
            server
                .reply(ServerMessage::FatalError {
                    description: "server shutting down".into(),
                })
                .await;
            server
        });

        // Input never ends during the run
        let (_keep_open, input_end) = tokio::io::duplex(64);
        let input = tokio::io::BufReader::new(input_end);

        let exit = run(&cfg, client_end, input, &mut output).await.unwrap();
        let _server = server.await.unwrap();

        assert_eq!(exit, Exit::Fatal);
        assert_ne!(exit.code(), 0);
        let text = String::from_utf8(output).unwrap();
        assert!(text.contains("Fatal error: server shutting down"));
    }

    #[tokio::test]
    async fn test_run_detects_server_close() {
        let (client_end, server_end) = tokio::io::duplex(4096);
        let cfg = config(None);
        let mut output = Vec::new();
        drop(server_end);

        let (_keep_open, input_end) = tokio::io::duplex(64);
        let input = tokio::io::BufReader::new(input_end);

        let exit = run(&cfg, client_end, input, &mut output).await.unwrap();

        assert_eq!(exit, Exit::ServerClosed);
        assert_eq!(exit.code(), 1);
    }
}
