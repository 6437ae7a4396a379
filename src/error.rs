//! Error types for the relay server
//!
//! Defines application-level errors, codec errors, store errors and
//! outbound send errors. Uses thiserror for ergonomic error definitions.

use thiserror::Error;

use crate::types::{RoomId, UserId};

/// Application-level errors
///
/// Covers both fatal errors (connection termination) and
/// business errors (error line sent back to the client).
#[derive(Debug, Error)]
pub enum AppError {
    /// IO error (fatal)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Line could not be decoded
    #[error("{0}")]
    Decode(#[from] DecodeError),

    /// Command name is not one of the known commands
    #[error("unknown command '{0}'")]
    UnknownCommand(String),

    /// A required key was absent from the command
    #[error("{command} requires parameter '{key}'")]
    MissingParameter {
        command: &'static str,
        key: &'static str,
    },

    /// A parameter was present but could not be interpreted
    #[error("invalid value '{value}' for parameter '{key}'")]
    InvalidParameter { key: &'static str, value: String },

    /// Acting user may not perform this operation
    #[error("not authorized: {0}")]
    Unauthorized(String),

    /// Uniqueness violation (login id, name, room title)
    #[error("already exists: {0}")]
    Conflict(String),

    /// Login id or password did not match
    #[error("invalid login id or password")]
    AuthFailed,

    /// Room is not live in the registry
    #[error("room {0} not found")]
    RoomNotFound(RoomId),

    /// Target user has no matching session
    #[error("user {0} not found")]
    UserNotFound(UserId),

    /// Session is not a member of the room named by the command
    #[error("not in room {0}")]
    NotInRoom(RoomId),

    /// Session is not in any room
    #[error("not in any room")]
    NoCurrentRoom,

    /// Backing store failed
    #[error("store error: {0}")]
    Store(StoreError),
}

impl From<StoreError> for AppError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Conflict(what) => AppError::Conflict(what),
            StoreError::InvalidCredentials => AppError::AuthFailed,
            other => AppError::Store(other),
        }
    }
}

/// Line decoding errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    /// Command line without the `?` separator
    #[error("missing '?' after command name")]
    MissingDelimiter,

    /// Nothing before the `?`, or a blank line
    #[error("empty command")]
    EmptyCommand,

    /// A `key:value` pair without a `:` or with an empty key; skipped
    #[error("malformed pair '{0}'")]
    MalformedPair(String),

    /// First line was neither `<room>,<user>` nor a command line
    #[error("invalid handshake '{0}'")]
    InvalidHandshake(String),

    /// Line bytes are not UTF-8
    #[error("line is not valid UTF-8")]
    InvalidUtf8,

    /// Line exceeded the configured length limit
    #[error("line longer than {0} bytes")]
    LineTooLong(usize),
}

/// Account and persistence store errors
#[derive(Debug, Error)]
pub enum StoreError {
    /// Unique constraint violated
    #[error("{0}")]
    Conflict(String),

    /// Unknown login id or wrong password
    #[error("invalid credentials")]
    InvalidCredentials,

    /// Record referenced by id does not exist
    #[error("not found: {0}")]
    NotFound(String),

    /// Underlying database error
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Store deliberately unavailable (used by test doubles)
    #[error("store unavailable")]
    Unavailable,
}

/// Message send errors
///
/// Occurs when delivering to a session's outbound channel fails.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SendError {
    /// The receiving end of the channel has been closed
    #[error("Channel closed")]
    ChannelClosed,

    /// The receiver is not keeping up
    #[error("Channel full")]
    ChannelFull,

    /// No such session in the table
    #[error("Unknown session")]
    UnknownSession,
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid config file: {0}")]
    Json(#[from] serde_json::Error),
}
