//! Line-oriented TCP chat relay
//!
//! Clients connect over plain TCP and exchange newline-terminated lines.
//! Every connection is a session; sessions join numbered rooms and
//! anything sent to a room is relayed to all of its members.
//!
//! # Features
//! - Legacy `<room_id>,<user_id>` handshake followed by raw text relay
//! - `name?key:value/...` command protocol (accounts, rooms, moderation)
//! - Rooms created on first join and evicted when the last member leaves
//! - Chat history and accounts stored in SQLite
//!
//! # Architecture
//! - `SessionTable` owns every session record; rooms hold only ids
//! - `RoomRegistry` maps room ids to rooms, each behind its own lock
//! - `Dispatcher` executes commands against both plus the account store
//! - Each connection runs a `handler` task with a separate write task
//! - History writes go through a bounded `PersistenceQueue` so a slow or
//!   failing database never delays delivery
//!
//! # Example
//! ```ignore
//! use std::sync::Arc;
//! use line_relay::{ChatServer, MemoryStore, PersistenceQueue, ServerConfig};
//!
//! #[tokio::main]
//! async fn main() -> std::io::Result<()> {
//!     let store = Arc::new(MemoryStore::new());
//!     let (queue, _worker) = PersistenceQueue::spawn(store.clone(), 1024);
//!     let server = ChatServer::bind(ServerConfig::default(), store, queue).await?;
//!     server.run().await;
//!     Ok(())
//! }
//! ```

pub mod codec;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod handler;
pub mod message;
pub mod persist;
pub mod registry;
pub mod room;
pub mod server;
pub mod session;
pub mod store;
pub mod types;

// Re-export main types for convenience
pub use codec::{decode_command, decode_handshake, encode, Handshake, RawCommand};
pub use config::ServerConfig;
pub use dispatcher::{CommandKind, Dispatcher, Outcome, Request};
pub use error::{AppError, ConfigError, DecodeError, SendError, StoreError};
pub use handler::handle_connection;
pub use message::{ErrorCode, ServerMessage};
pub use persist::PersistenceQueue;
pub use registry::RoomRegistry;
pub use room::Room;
pub use server::ChatServer;
pub use session::{SessionMode, SessionState, SessionTable};
pub use store::{AccountStore, ChatRecord, MemoryStore, PersistenceGateway, SqliteStore};
pub use types::{RoomId, SessionId, UserId};
