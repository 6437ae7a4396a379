//! Account and history storage
//!
//! The relay core never talks to a database directly. It sees two traits:
//!
//! - [`AccountStore`]: users, credentials and room ownership
//! - [`PersistenceGateway`]: append-only chat history
//!
//! [`SqliteStore`] implements both on top of SQLite; [`MemoryStore`] keeps
//! everything in process and is what the tests run against.

mod memory;
mod password;
mod sqlite;

pub use memory::MemoryStore;
pub use password::{hash_password, verify_password};
pub use sqlite::SqliteStore;

use std::future::Future;

use time::OffsetDateTime;

use crate::error::StoreError;
use crate::types::{RoomId, UserId};

/// One relayed message as it is persisted
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatRecord {
    pub room_id: RoomId,
    pub user_id: UserId,
    pub text: String,
    pub timestamp: OffsetDateTime,
}

impl ChatRecord {
    /// Record stamped with the current UTC time
    pub fn now(room_id: RoomId, user_id: UserId, text: impl Into<String>) -> Self {
        Self {
            room_id,
            user_id,
            text: text.into(),
            timestamp: OffsetDateTime::now_utc(),
        }
    }
}

/// Persisted room row
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoomRecord {
    pub id: RoomId,
    pub title: String,
    pub host_user_id: UserId,
}

/// Durable append of chat records
///
/// Called from the persistence worker only, never from the broadcast path.
pub trait PersistenceGateway: Send + Sync + 'static {
    fn append(
        &self,
        record: &ChatRecord,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;
}

/// User, credential and room-ownership lookups
pub trait AccountStore: Send + Sync + 'static {
    /// Create a user; `login_id` and `name` must both be unused
    ///
    /// Returns [`StoreError::Conflict`] on a duplicate.
    fn create_user(
        &self,
        login_id: &str,
        password: &str,
        name: &str,
    ) -> impl Future<Output = Result<UserId, StoreError>> + Send;

    /// Check a login id and password
    ///
    /// Returns [`StoreError::InvalidCredentials`] on any mismatch.
    fn verify(
        &self,
        login_id: &str,
        password: &str,
    ) -> impl Future<Output = Result<UserId, StoreError>> + Send;

    /// Register a room with a unique title
    ///
    /// Ids are never reused, even after [`AccountStore::delete_room`].
    fn create_room(
        &self,
        title: &str,
        host: UserId,
    ) -> impl Future<Output = Result<RoomId, StoreError>> + Send;

    fn find_room(
        &self,
        room_id: RoomId,
    ) -> impl Future<Output = Result<Option<RoomRecord>, StoreError>> + Send;

    fn set_room_host(
        &self,
        room_id: RoomId,
        host: UserId,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;

    /// Drop a room record; unknown ids are ignored
    fn delete_room(&self, room_id: RoomId) -> impl Future<Output = Result<(), StoreError>> + Send;
}
