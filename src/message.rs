//! Server → client message definitions
//!
//! Everything the server writes to a socket is a `ServerMessage`.
//! Relayed chat text and room notices go out verbatim; acks, errors and
//! events use the same `name?key:value/...` grammar clients send.

use crate::codec;
use crate::error::AppError;
use crate::types::{RoomId, UserId};

/// Notice broadcast to a room after a member joins
pub const JOIN_NOTICE: &str = "A new user has joined the chat.";

/// Notice broadcast to a room after a member leaves
pub const LEAVE_NOTICE: &str = "A user has left the chat.";

/// Server → Client message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerMessage {
    /// Relayed chat text or room notice, written as-is
    Text(String),
    /// Command succeeded
    Ack {
        command: &'static str,
        fields: Vec<(&'static str, String)>,
    },
    /// Command failed
    Error { code: ErrorCode, message: String },
    /// Another user invited this session's user into a room
    Invite { room_id: RoomId, from: UserId },
    /// The room host removed this session from the room
    Kicked { room_id: RoomId },
}

impl ServerMessage {
    /// Ack with no extra fields
    pub fn ack(command: &'static str) -> Self {
        ServerMessage::Ack {
            command,
            fields: Vec::new(),
        }
    }

    /// Add a field to an ack; other variants are returned unchanged
    pub fn with(mut self, key: &'static str, value: impl ToString) -> Self {
        if let ServerMessage::Ack { fields, .. } = &mut self {
            fields.push((key, value.to_string()));
        }
        self
    }

    /// Encode as a single wire line, including the trailing `\n`
    pub fn to_line(&self) -> String {
        let mut line = match self {
            ServerMessage::Text(text) => text.clone(),
            ServerMessage::Ack { command, fields } => {
                let mut pairs = Vec::with_capacity(fields.len() + 1);
                pairs.push(("command", command.to_string()));
                pairs.extend(fields.iter().map(|(k, v)| (*k, v.clone())));
                codec::encode("ok", &pairs)
            }
            ServerMessage::Error { code, message } => codec::encode(
                "error",
                &[("code", code.as_str().to_string()), ("message", message.clone())],
            ),
            ServerMessage::Invite { room_id, from } => codec::encode(
                "invite",
                &[("room_id", room_id.to_string()), ("user_id", from.to_string())],
            ),
            ServerMessage::Kicked { room_id } => {
                codec::encode("kicked", &[("room_id", room_id.to_string())])
            }
        };
        line.push('\n');
        line
    }
}

/// Error codes for ServerMessage::Error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    /// Malformed line, unknown command, missing or invalid parameter
    Protocol,
    /// Acting user lacks the required role
    Unauthorized,
    /// Duplicate login id, name or room title
    Conflict,
    /// Login failed
    AuthFailed,
    /// Room or user not found
    NotFound,
    /// Session not in the named room
    NotInRoom,
    /// Anything else
    Internal,
}

impl ErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCode::Protocol => "protocol",
            ErrorCode::Unauthorized => "unauthorized",
            ErrorCode::Conflict => "conflict",
            ErrorCode::AuthFailed => "auth_failed",
            ErrorCode::NotFound => "not_found",
            ErrorCode::NotInRoom => "not_in_room",
            ErrorCode::Internal => "internal",
        }
    }
}

/// Convert AppError to ServerMessage for client notification
impl From<AppError> for ServerMessage {
    fn from(err: AppError) -> Self {
        let code = match &err {
            AppError::Decode(_)
            | AppError::UnknownCommand(_)
            | AppError::MissingParameter { .. }
            | AppError::InvalidParameter { .. } => ErrorCode::Protocol,
            AppError::Unauthorized(_) => ErrorCode::Unauthorized,
            AppError::Conflict(_) => ErrorCode::Conflict,
            AppError::AuthFailed => ErrorCode::AuthFailed,
            AppError::RoomNotFound(_) | AppError::UserNotFound(_) => ErrorCode::NotFound,
            AppError::NotInRoom(_) | AppError::NoCurrentRoom => ErrorCode::NotInRoom,
            // Store internals are not echoed to clients
            AppError::Store(_) => {
                return ServerMessage::Error {
                    code: ErrorCode::Internal,
                    message: "internal error".to_string(),
                }
            }
            AppError::Io(_) => ErrorCode::Internal,
        };
        ServerMessage::Error {
            code,
            message: err.to_string(),
        }
    }
}
