//! Wire vocabulary
//!
//! Line-oriented control messages and the outbound message type shared by
//! sessions and the broadcast registry.

use std::num::IntErrorKind;

use crate::error::{ProtocolError, ValidationError};

/// Handshake keyword
pub const CLIENT_ID: &str = "CLIENT_ID";

/// Handshake token marking a one-shot transfer helper connection
pub const UTILITY_KIND: &str = "UTILITY";

/// Handshake token for an explicit interactive connection (the default)
pub const INTERACTIVE_KIND: &str = "INTERACTIVE";

pub const WELCOME: &str = "Welcome to the file sharing server. Identify with: CLIENT_ID <name>";

pub const COMMAND_SUMMARY: &str =
    "Commands: UPLOAD <file>, DOWNLOAD <file>, DELETE <file>, LIST, LOGS [count], HELP, QUIT";

/// Sent after an accepted `UPLOAD <name>`; the client sends its frame next
pub const UPLOAD_READY: &str = "READY";

/// Precedes every DOWNLOAD frame
pub const TRANSFER_MARKER: &str = "BEGIN_TRANSFER";

/// Last line of every multi-line response
pub const END_MARKER: &str = "END_OF_RESPONSE";

/// Prefix of asynchronous notification lines
pub const NOTIFY_PREFIX: &str = "NOTIFY:";

pub const GOODBYE: &str = "Goodbye";

pub const SHUTTING_DOWN: &str = "Server shutting down";

pub const DEFAULT_LOG_COUNT: i64 = 10;

pub const MAX_LOG_COUNT: i64 = 100;

/// Longest accepted control line, newline included
pub const MAX_LINE_LENGTH: u64 = 4096;

/// Connection kind negotiated at handshake time
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionKind {
    /// Registered for notifications
    Interactive,
    /// Short-lived transfer helper; never registered
    Utility,
}

/// Parsed `CLIENT_ID <name> [INTERACTIVE|UTILITY]` line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientIdentity {
    pub name: String,
    pub kind: ConnectionKind,
}

impl ClientIdentity {
    pub fn parse_handshake(line: &str) -> Result<Self, ProtocolError> {
        let mut tokens = line.split_whitespace();

        if tokens.next() != Some(CLIENT_ID) {
            return Err(ProtocolError::MissingHandshake);
        }

        let name = tokens.next().ok_or(ProtocolError::MissingName)?.to_string();

        let kind = match tokens.next() {
            None => ConnectionKind::Interactive,
            Some(token) if token.eq_ignore_ascii_case(INTERACTIVE_KIND) => ConnectionKind::Interactive,
            Some(token) if token.eq_ignore_ascii_case(UTILITY_KIND) => ConnectionKind::Utility,
            Some(token) => return Err(ProtocolError::UnknownKind(token.to_string())),
        };

        if let Some(extra) = tokens.next() {
            return Err(ProtocolError::UnknownKind(extra.to_string()));
        }

        Ok(Self { name, kind })
    }

    pub fn is_interactive(&self) -> bool {
        self.kind == ConnectionKind::Interactive
    }
}

/// A command line from an identified client
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Upload(String),
    Download(String),
    Delete(String),
    List,
    Logs(Option<String>),
    Help,
    Quit,
    Unknown(String),
}

impl Command {
    /// Parse a command line. Blank lines yield `None`.
    pub fn parse(line: &str) -> Option<Self> {
        let line = line.trim();
        if line.is_empty() {
            return None;
        }

        let (verb, argument) = match line.split_once(char::is_whitespace) {
            Some((verb, rest)) => (verb, rest.trim()),
            None => (line, ""),
        };

        let command = match verb.to_ascii_uppercase().as_str() {
            "UPLOAD" => Self::Upload(argument.to_string()),
            "DOWNLOAD" => Self::Download(argument.to_string()),
            "DELETE" => Self::Delete(argument.to_string()),
            "LIST" => Self::List,
            "LOGS" => Self::Logs((!argument.is_empty()).then(|| argument.to_string())),
            "HELP" => Self::Help,
            "QUIT" | "EXIT" => Self::Quit,
            other => Self::Unknown(other.to_string()),
        };

        Some(command)
    }
}

/// LOGS count: default 10, clamped to 1..=100. Numbers too large for
/// `i64` clamp like any other out-of-range value.
pub fn parse_log_count(argument: Option<&str>) -> Result<i64, ValidationError> {
    let Some(raw) = argument else {
        return Ok(DEFAULT_LOG_COUNT);
    };

    match raw.trim().parse::<i64>() {
        Ok(count) => Ok(count.clamp(1, MAX_LOG_COUNT)),
        Err(e) => match e.kind() {
            IntErrorKind::PosOverflow => Ok(MAX_LOG_COUNT),
            IntErrorKind::NegOverflow => Ok(1),
            _ => Err(ValidationError::InvalidCount(raw.to_string())),
        },
    }
}

/// Build a multi-line response terminated by [`END_MARKER`]
pub fn multi_line<I>(header: &str, lines: I, when_empty: &str) -> String
where
    I: IntoIterator<Item = String>,
{
    let mut response = String::from(header);
    response.push('\n');

    let mut any = false;
    for line in lines {
        response.push_str(&line);
        response.push('\n');
        any = true;
    }
    if !any {
        response.push_str(when_empty);
        response.push('\n');
    }

    response.push_str(END_MARKER);
    response
}

/// Format a notification line
pub fn notification(text: &str) -> String {
    format!("{} {}", NOTIFY_PREFIX, text)
}

/// One atomic write to a client.
///
/// The writer task never splits a message, so anything that must not be
/// interleaved with notifications is sent as a single `Outbound`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    /// Text; a trailing newline is added on the wire
    Line(String),
    /// Raw bytes written as-is
    Data(Vec<u8>),
}

impl Outbound {
    pub fn line(text: impl Into<String>) -> Self {
        Self::Line(text.into())
    }

    pub fn into_bytes(self) -> Vec<u8> {
        match self {
            Self::Line(text) => {
                let mut bytes = text.into_bytes();
                bytes.push(b'\n');
                bytes
            }
            Self::Data(bytes) => bytes,
        }
    }
}
