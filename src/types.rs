//! Basic type definitions for the chat server
//!
//! Provides newtype wrappers for type safety:
//! - `SessionId`: UUID-based identifier for an accepted connection
//! - `Username`: validated name a session registers under

use std::borrow::Borrow;

use uuid::Uuid;

use crate::error::ChatError;
use crate::message::SEPARATOR;

/// Longest username accepted at CONNECT
pub const MAX_USERNAME_LEN: usize = 32;

/// Unique session identifier (newtype pattern)
///
/// Wraps a UUID v4. Assigned on accept, so it identifies a connection
/// in logs before the client has picked a username.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId(pub Uuid);

impl SessionId {
    /// Create a new random session ID
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Registered username
///
/// Non-empty, at most [`MAX_USERNAME_LEN`] characters, no whitespace or
/// control characters. Never contains the protocol separator and never
/// ends with `:`, so it can sit in any field position of an encoded line
/// without merging into the separator after it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Username(String);

impl Username {
    /// Validate a raw name taken from a CONNECT line
    pub fn parse(raw: &str) -> Result<Self, ChatError> {
        let valid = !raw.is_empty()
            && raw.chars().count() <= MAX_USERNAME_LEN
            && !raw.contains(SEPARATOR)
            && !raw.ends_with(':')
            && !raw.chars().any(|c| c.is_whitespace() || c.is_control());

        if valid {
            Ok(Self(raw.to_string()))
        } else {
            Err(ChatError::InvalidUsername(raw.to_string()))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Borrow<str> for Username {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl From<Username> for String {
    fn from(name: Username) -> Self {
        name.0
    }
}

impl std::fmt::Display for Username {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}
