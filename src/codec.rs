//! Line protocol codec
//!
//! Wire grammar for command lines:
//!
//! ```text
//! line  := command "?" pairs
//! pairs := pair ("/" pair)*
//! pair  := key ":" value
//! ```
//!
//! Pairs are split at the first `:` so values may contain `:` but never
//! `/`. Malformed pairs are skipped and recorded on the decoded command;
//! they never fail the whole line.
//!
//! [`LineReader`] frames the byte stream into lines before any of this:
//! it enforces the length limit and the UTF-8 check.

use std::collections::HashMap;
use std::io;

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt};

use crate::error::DecodeError;
use crate::types::{RoomId, UserId};

/// A decoded command line: name plus unique key → value parameters
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RawCommand {
    pub name: String,
    pub params: HashMap<String, String>,
    /// Pairs skipped while decoding
    pub issues: Vec<DecodeError>,
}

impl RawCommand {
    pub fn get(&self, key: &str) -> Option<&str> {
        self.params.get(key).map(String::as_str)
    }
}

/// First line of a connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Handshake {
    /// `<room_id>,<user_id>`
    Legacy { room_id: RoomId, user_id: UserId },
    /// Full command line
    Command(RawCommand),
}

/// Remove a trailing `\n` and/or `\r`
pub fn strip_line_ending(line: &str) -> &str {
    line.trim_end_matches(['\n', '\r'])
}

/// Decode a command line
pub fn decode_command(line: &str) -> Result<RawCommand, DecodeError> {
    let line = strip_line_ending(line);
    if line.trim().is_empty() {
        return Err(DecodeError::EmptyCommand);
    }

    let (name, pairs) = line.split_once('?').ok_or(DecodeError::MissingDelimiter)?;
    let name = name.trim();
    if name.is_empty() {
        return Err(DecodeError::EmptyCommand);
    }

    let mut command = RawCommand {
        name: name.to_string(),
        ..RawCommand::default()
    };

    for segment in pairs.split('/') {
        if segment.is_empty() {
            continue;
        }
        match segment.split_once(':') {
            Some((key, value)) if !key.is_empty() => {
                // Last write wins on duplicate keys
                command.params.insert(key.to_string(), value.to_string());
            }
            _ => command
                .issues
                .push(DecodeError::MalformedPair(segment.to_string())),
        }
    }

    Ok(command)
}

/// Decode the first line of a connection
///
/// A line containing `?` is a command line; otherwise it must be the
/// legacy `<room_id>,<user_id>` token.
pub fn decode_handshake(line: &str) -> Result<Handshake, DecodeError> {
    let line = strip_line_ending(line);
    if line.contains('?') {
        return decode_command(line).map(Handshake::Command);
    }

    let invalid = || DecodeError::InvalidHandshake(line.to_string());
    let (room, user) = line.split_once(',').ok_or_else(invalid)?;
    let room_id = room.parse::<RoomId>().map_err(|_| invalid())?;
    let user_id = user.parse::<UserId>().map_err(|_| invalid())?;
    Ok(Handshake::Legacy { room_id, user_id })
}

/// Encode `name?k1:v1/k2:v2` (no line terminator)
///
/// `/` inside a value would split the pair on the other side, so it is
/// replaced with a space.
pub fn encode(name: &str, pairs: &[(&str, String)]) -> String {
    let body = pairs
        .iter()
        .map(|(key, value)| format!("{}:{}", key, value.replace('/', " ")))
        .collect::<Vec<_>>()
        .join("/");
    format!("{}?{}", name, body)
}

/// Splits a byte stream into `\n`-terminated lines of bounded length
///
/// Partially read bytes stay buffered across calls, so `next_line` may be
/// cancelled (by `select!` or a timeout) and called again.
#[derive(Debug)]
pub struct LineReader<R> {
    inner: R,
    buf: Vec<u8>,
    max_len: usize,
}

impl<R: AsyncBufRead + Unpin> LineReader<R> {
    pub fn new(inner: R, max_len: usize) -> Self {
        Self {
            inner,
            buf: Vec::new(),
            max_len,
        }
    }

    /// Next line without its terminator
    ///
    /// `Ok(None)` is end of stream. A line that is too long or not UTF-8
    /// comes back as `Ok(Some(Err(_)))`. After [`DecodeError::LineTooLong`]
    /// the stream position is mid-line.
    pub async fn next_line(&mut self) -> io::Result<Option<Result<String, DecodeError>>> {
        // Room for the content plus "\r\n"
        let limit = self.max_len + 2;
        loop {
            let budget = limit.saturating_sub(self.buf.len());
            if budget == 0 {
                self.buf.clear();
                return Ok(Some(Err(DecodeError::LineTooLong(self.max_len))));
            }
            let read = (&mut self.inner)
                .take(budget as u64)
                .read_until(b'\n', &mut self.buf)
                .await?;
            if read == 0 {
                if self.buf.is_empty() {
                    return Ok(None);
                }
                break;
            }
            if self.buf.ends_with(b"\n") {
                break;
            }
        }

        let bytes = std::mem::take(&mut self.buf);
        Ok(Some(decode_line(bytes, self.max_len)))
    }
}

fn decode_line(mut bytes: Vec<u8>, max_len: usize) -> Result<String, DecodeError> {
    if bytes.ends_with(b"\n") {
        bytes.pop();
    }
    if bytes.ends_with(b"\r") {
        bytes.pop();
    }
    if bytes.len() > max_len {
        return Err(DecodeError::LineTooLong(max_len));
    }
    String::from_utf8(bytes).map_err(|_| DecodeError::InvalidUtf8)
}
