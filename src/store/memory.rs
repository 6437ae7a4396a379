//! In-process store
//!
//! Same contract as the SQLite store, held in a mutex-guarded struct.
//! Appends can be switched off to simulate an unavailable database.

use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::Mutex;

use super::{hash_password, verify_password, AccountStore, ChatRecord, PersistenceGateway, RoomRecord};
use crate::error::StoreError;
use crate::types::{RoomId, UserId};

#[derive(Debug)]
struct UserRow {
    id: UserId,
    login_id: String,
    password_hash: String,
    name: String,
}

#[derive(Debug, Default)]
struct Tables {
    users: Vec<UserRow>,
    rooms: Vec<RoomRecord>,
    last_room_id: i64,
    talks: Vec<ChatRecord>,
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
    unavailable: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every `append` fail until switched back
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// All persisted talk, in append order
    pub async fn talks(&self) -> Vec<ChatRecord> {
        self.tables.lock().await.talks.clone()
    }
}

impl AccountStore for MemoryStore {
    async fn create_user(
        &self,
        login_id: &str,
        password: &str,
        name: &str,
    ) -> Result<UserId, StoreError> {
        let mut tables = self.tables.lock().await;
        if tables.users.iter().any(|u| u.login_id == login_id) {
            return Err(StoreError::Conflict(format!("login id '{}'", login_id)));
        }
        if tables.users.iter().any(|u| u.name == name) {
            return Err(StoreError::Conflict(format!("name '{}'", name)));
        }
        let id = UserId(tables.users.len() as i64 + 1);
        tables.users.push(UserRow {
            id,
            login_id: login_id.to_string(),
            password_hash: hash_password(password),
            name: name.to_string(),
        });
        Ok(id)
    }

    async fn verify(&self, login_id: &str, password: &str) -> Result<UserId, StoreError> {
        let tables = self.tables.lock().await;
        tables
            .users
            .iter()
            .find(|u| u.login_id == login_id && verify_password(password, &u.password_hash))
            .map(|u| u.id)
            .ok_or(StoreError::InvalidCredentials)
    }

    async fn create_room(&self, title: &str, host: UserId) -> Result<RoomId, StoreError> {
        let mut tables = self.tables.lock().await;
        if tables.rooms.iter().any(|r| r.title == title) {
            return Err(StoreError::Conflict(format!("room title '{}'", title)));
        }
        tables.last_room_id += 1;
        let id = RoomId(tables.last_room_id);
        tables.rooms.push(RoomRecord {
            id,
            title: title.to_string(),
            host_user_id: host,
        });
        Ok(id)
    }

    async fn find_room(&self, room_id: RoomId) -> Result<Option<RoomRecord>, StoreError> {
        let tables = self.tables.lock().await;
        Ok(tables.rooms.iter().find(|r| r.id == room_id).cloned())
    }

    async fn set_room_host(&self, room_id: RoomId, host: UserId) -> Result<(), StoreError> {
        let mut tables = self.tables.lock().await;
        let room = tables
            .rooms
            .iter_mut()
            .find(|r| r.id == room_id)
            .ok_or_else(|| StoreError::NotFound(format!("room {}", room_id)))?;
        room.host_user_id = host;
        Ok(())
    }

    async fn delete_room(&self, room_id: RoomId) -> Result<(), StoreError> {
        self.tables.lock().await.rooms.retain(|r| r.id != room_id);
        Ok(())
    }
}

impl PersistenceGateway for MemoryStore {
    async fn append(&self, record: &ChatRecord) -> Result<(), StoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable);
        }
        self.tables.lock().await.talks.push(record.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_user_lifecycle() {
        let store = MemoryStore::new();
        let id = store.create_user("amy", "pw", "Amy").await.unwrap();
        assert_eq!(store.verify("amy", "pw").await.unwrap(), id);
        assert!(matches!(
            store.verify("amy", "bad").await,
            Err(StoreError::InvalidCredentials)
        ));
        assert!(matches!(
            store.create_user("amy", "pw", "Someone").await,
            Err(StoreError::Conflict(_))
        ));
        assert!(matches!(
            store.create_user("other", "pw", "Amy").await,
            Err(StoreError::Conflict(_))
        ));
    }

    #[tokio::test]
    async fn test_room_ids_are_not_reused() {
        let store = MemoryStore::new();
        let first = store.create_room("lobby", UserId(1)).await.unwrap();
        store.delete_room(first).await.unwrap();
        assert!(store.find_room(first).await.unwrap().is_none());

        let second = store.create_room("lobby", UserId(1)).await.unwrap();
        assert_eq!(second, RoomId(first.0 + 1));
    }

    #[tokio::test]
    async fn test_unavailable_append() {
        let store = MemoryStore::new();
        store.set_unavailable(true);
        let record = ChatRecord::now(RoomId(1), UserId(1), "lost");
        assert!(matches!(
            store.append(&record).await,
            Err(StoreError::Unavailable)
        ));
        store.set_unavailable(false);
        store.append(&record).await.unwrap();
        assert_eq!(store.talks().await, vec![record]);
    }
}
