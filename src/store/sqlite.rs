//! SQLite-backed store
//!
//! One pool serves both the account lookups and the talk history. The
//! schema is created on open if missing.

use std::path::Path;

use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use time::format_description::well_known::Rfc3339;
use tracing::{debug, info};

use super::{hash_password, verify_password, AccountStore, ChatRecord, PersistenceGateway, RoomRecord};
use crate::error::StoreError;
use crate::types::{RoomId, UserId};

const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS users (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        login_id TEXT NOT NULL UNIQUE,
        login_password TEXT NOT NULL,
        name TEXT NOT NULL UNIQUE
    )",
    "CREATE TABLE IF NOT EXISTS rooms (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        title TEXT NOT NULL UNIQUE,
        host_user_id INTEGER NOT NULL,
        FOREIGN KEY(host_user_id) REFERENCES users(id)
    )",
    "CREATE TABLE IF NOT EXISTS talks (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        room_id INTEGER NOT NULL,
        user_id INTEGER NOT NULL,
        text TEXT NOT NULL,
        published_date TEXT NOT NULL,
        FOREIGN KEY(room_id) REFERENCES rooms(id),
        FOREIGN KEY(user_id) REFERENCES users(id)
    )",
];

/// Store backed by a SQLite database file
#[derive(Debug, Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Open (creating if needed) the database at `path`
    pub async fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(sqlx::Error::Io)?;
            }
        }

        // Legacy handshakes name rooms and users that may have no row
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .foreign_keys(false);
        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await?;

        let store = Self { pool };
        store.init_schema().await?;
        info!("Opened database {}", path.display());
        Ok(store)
    }

    /// Private in-memory database
    pub async fn in_memory() -> Result<Self, StoreError> {
        // Every connection to :memory: is a separate database, so keep one
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await?;
        let store = Self { pool };
        store.init_schema().await?;
        Ok(store)
    }

    async fn init_schema(&self) -> Result<(), StoreError> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        debug!("Schema ready");
        Ok(())
    }

    /// Persisted talk in a room, oldest first
    pub async fn history(&self, room_id: RoomId) -> Result<Vec<(UserId, String)>, StoreError> {
        let rows: Vec<(i64, String)> =
            sqlx::query_as("SELECT user_id, text FROM talks WHERE room_id = ? ORDER BY id")
                .bind(room_id.0)
                .fetch_all(&self.pool)
                .await?;
        Ok(rows
            .into_iter()
            .map(|(user_id, text)| (UserId(user_id), text))
            .collect())
    }
}

/// Map a unique-constraint failure to `Conflict`
fn unique_violation(err: sqlx::Error, describe: impl FnOnce(&str) -> String) -> StoreError {
    match &err {
        sqlx::Error::Database(db) if db.is_unique_violation() => {
            StoreError::Conflict(describe(db.message()))
        }
        _ => StoreError::Database(err),
    }
}

impl AccountStore for SqliteStore {
    async fn create_user(
        &self,
        login_id: &str,
        password: &str,
        name: &str,
    ) -> Result<UserId, StoreError> {
        let result = sqlx::query("INSERT INTO users (login_id, login_password, name) VALUES (?, ?, ?)")
            .bind(login_id)
            .bind(hash_password(password))
            .bind(name)
            .execute(&self.pool)
            .await
            .map_err(|e| {
                unique_violation(e, |msg| {
                    if msg.contains("users.name") {
                        format!("name '{}'", name)
                    } else {
                        format!("login id '{}'", login_id)
                    }
                })
            })?;
        Ok(UserId(result.last_insert_rowid()))
    }

    async fn verify(&self, login_id: &str, password: &str) -> Result<UserId, StoreError> {
        let row: Option<(i64, String)> =
            sqlx::query_as("SELECT id, login_password FROM users WHERE login_id = ?")
                .bind(login_id)
                .fetch_optional(&self.pool)
                .await?;
        match row {
            Some((id, stored)) if verify_password(password, &stored) => Ok(UserId(id)),
            _ => Err(StoreError::InvalidCredentials),
        }
    }

    async fn create_room(&self, title: &str, host: UserId) -> Result<RoomId, StoreError> {
        let result = sqlx::query("INSERT INTO rooms (title, host_user_id) VALUES (?, ?)")
            .bind(title)
            .bind(host.0)
            .execute(&self.pool)
            .await
            .map_err(|e| unique_violation(e, |_| format!("room title '{}'", title)))?;
        Ok(RoomId(result.last_insert_rowid()))
    }

    async fn find_room(&self, room_id: RoomId) -> Result<Option<RoomRecord>, StoreError> {
        let row: Option<(i64, String, i64)> =
            sqlx::query_as("SELECT id, title, host_user_id FROM rooms WHERE id = ?")
                .bind(room_id.0)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.map(|(id, title, host)| RoomRecord {
            id: RoomId(id),
            title,
            host_user_id: UserId(host),
        }))
    }

    async fn set_room_host(&self, room_id: RoomId, host: UserId) -> Result<(), StoreError> {
        let result = sqlx::query("UPDATE rooms SET host_user_id = ? WHERE id = ?")
            .bind(host.0)
            .bind(room_id.0)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("room {}", room_id)));
        }
        Ok(())
    }

    async fn delete_room(&self, room_id: RoomId) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM rooms WHERE id = ?")
            .bind(room_id.0)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

impl PersistenceGateway for SqliteStore {
    async fn append(&self, record: &ChatRecord) -> Result<(), StoreError> {
        let published = record
            .timestamp
            .format(&Rfc3339)
            .unwrap_or_else(|_| record.timestamp.unix_timestamp().to_string());
        sqlx::query(
            "INSERT INTO talks (room_id, user_id, text, published_date) VALUES (?, ?, ?, ?)",
        )
        .bind(record.room_id.0)
        .bind(record.user_id.0)
        .bind(&record.text)
        .bind(published)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
