//! Session table
//!
//! Central arena owning every connected session's record by `SessionId`.
//! Rooms hold only ids; anything that needs to reach a member resolves
//! the id here at the point of use.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{mpsc, Notify, RwLock};
use tracing::debug;

use crate::error::SendError;
use crate::message::ServerMessage;
use crate::types::{RoomId, SessionId, UserId};

/// Lifecycle state of one connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Waiting for the first valid line
    AwaitingHandshake { failures: u32 },
    /// Handshake done; lines are handled according to the mode
    Active(SessionMode),
    /// Terminal
    Closing,
}

/// How lines are interpreted once a session is active
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionMode {
    /// Every line is chat text relayed to the current room
    Legacy,
    /// Every line is a protocol command
    Command,
}

/// Server-side record of one connection
#[derive(Debug)]
pub struct SessionEntry {
    /// Server → Client message channel
    pub sender: mpsc::Sender<ServerMessage>,
    /// Signalled to ask the connection task to close
    pub closer: Arc<Notify>,
    /// User bound by login or legacy handshake
    pub user_id: Option<UserId>,
    /// Room the session currently belongs to
    pub room_id: Option<RoomId>,
}

impl SessionEntry {
    pub fn new(sender: mpsc::Sender<ServerMessage>) -> Self {
        Self {
            sender,
            closer: Arc::new(Notify::new()),
            user_id: None,
            room_id: None,
        }
    }

    /// Queue a message without waiting
    ///
    /// Fails when the receiver is gone or its buffer is full.
    pub fn try_send(&self, msg: ServerMessage) -> Result<(), SendError> {
        self.sender.try_send(msg).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => SendError::ChannelFull,
            mpsc::error::TrySendError::Closed(_) => SendError::ChannelClosed,
        })
    }
}

/// Outcome of a fan-out
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct BroadcastReport {
    pub delivered: usize,
    pub failed: Vec<SessionId>,
}

/// All connected sessions
#[derive(Debug, Default)]
pub struct SessionTable {
    sessions: RwLock<HashMap<SessionId, SessionEntry>>,
}

impl SessionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new session and return its close signal
    pub async fn register(&self, id: SessionId, sender: mpsc::Sender<ServerMessage>) -> Arc<Notify> {
        let entry = SessionEntry::new(sender);
        let closer = entry.closer.clone();
        self.sessions.write().await.insert(id, entry);
        closer
    }

    /// Remove a session; only the first call for an id returns the entry
    pub async fn remove(&self, id: SessionId) -> Option<SessionEntry> {
        self.sessions.write().await.remove(&id)
    }

    pub async fn contains(&self, id: SessionId) -> bool {
        self.sessions.read().await.contains_key(&id)
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }

    pub async fn user_of(&self, id: SessionId) -> Option<UserId> {
        self.sessions.read().await.get(&id).and_then(|s| s.user_id)
    }

    pub async fn set_user(&self, id: SessionId, user_id: UserId) {
        if let Some(entry) = self.sessions.write().await.get_mut(&id) {
            entry.user_id = Some(user_id);
        }
    }

    pub async fn room_of(&self, id: SessionId) -> Option<RoomId> {
        self.sessions.read().await.get(&id).and_then(|s| s.room_id)
    }

    pub async fn set_room(&self, id: SessionId, room_id: Option<RoomId>) {
        if let Some(entry) = self.sessions.write().await.get_mut(&id) {
            entry.room_id = room_id;
        }
    }

    /// Clear the room only if it still is `room_id`
    pub async fn clear_room_if(&self, id: SessionId, room_id: RoomId) {
        if let Some(entry) = self.sessions.write().await.get_mut(&id) {
            if entry.room_id == Some(room_id) {
                entry.room_id = None;
            }
        }
    }

    /// Sessions bound to `user_id`
    pub async fn sessions_of_user(&self, user_id: UserId) -> Vec<SessionId> {
        self.sessions
            .read()
            .await
            .iter()
            .filter(|(_, s)| s.user_id == Some(user_id))
            .map(|(id, _)| *id)
            .collect()
    }

    /// Send to one session
    pub async fn send(&self, id: SessionId, msg: ServerMessage) -> Result<(), SendError> {
        match self.sessions.read().await.get(&id) {
            Some(entry) => entry.try_send(msg),
            None => Err(SendError::UnknownSession),
        }
    }

    /// Send the same message to every listed session
    ///
    /// Never waits on a slow receiver. Sessions that cannot take the
    /// message are asked to close and reported as failed.
    pub async fn deliver(&self, ids: &[SessionId], msg: &ServerMessage) -> BroadcastReport {
        self.deliver_all(ids, std::slice::from_ref(msg)).await
    }

    /// Send `msgs`, in order, to every listed session under one lock
    ///
    /// A session that rejects one message gets none of the rest.
    pub async fn deliver_all(&self, ids: &[SessionId], msgs: &[ServerMessage]) -> BroadcastReport {
        let mut report = BroadcastReport::default();
        let sessions = self.sessions.read().await;
        for id in ids {
            let result = match sessions.get(id) {
                Some(entry) => msgs.iter().try_for_each(|msg| entry.try_send(msg.clone())),
                None => Err(SendError::UnknownSession),
            };
            match result {
                Ok(()) => report.delivered += 1,
                Err(e) => {
                    debug!("Delivery to session {} failed: {}", id, e);
                    if let Some(entry) = sessions.get(id) {
                        entry.closer.notify_one();
                    }
                    report.failed.push(*id);
                }
            }
        }
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_register_and_remove_once() {
        let table = SessionTable::new();
        let (tx, _rx) = mpsc::channel(4);
        let id = SessionId::new();
        table.register(id, tx).await;

        assert!(table.contains(id).await);
        assert!(table.remove(id).await.is_some());
        assert!(table.remove(id).await.is_none());
        assert!(table.is_empty().await);
    }

    #[tokio::test]
    async fn test_user_and_room_binding() {
        let table = SessionTable::new();
        let (tx, _rx) = mpsc::channel(4);
        let id = SessionId::new();
        table.register(id, tx).await;

        assert!(table.user_of(id).await.is_none());
        table.set_user(id, UserId(5)).await;
        table.set_room(id, Some(RoomId(2))).await;
        assert_eq!(table.user_of(id).await, Some(UserId(5)));
        assert_eq!(table.room_of(id).await, Some(RoomId(2)));
        assert_eq!(table.sessions_of_user(UserId(5)).await, vec![id]);

        table.clear_room_if(id, RoomId(9)).await;
        assert_eq!(table.room_of(id).await, Some(RoomId(2)));
        table.clear_room_if(id, RoomId(2)).await;
        assert!(table.room_of(id).await.is_none());
    }

    #[tokio::test]
    async fn test_deliver_continues_past_failures() {
        let table = SessionTable::new();
        let (tx_ok, mut rx_ok) = mpsc::channel(4);
        let (tx_full, _rx_full) = mpsc::channel(1);
        let (tx_closed, rx_closed) = mpsc::channel(4);
        drop(rx_closed);

        let ok = SessionId::new();
        let full = SessionId::new();
        let closed = SessionId::new();
        table.register(ok, tx_ok).await;
        let full_closer = table.register(full, tx_full).await;
        table.register(closed, tx_closed).await;

        // Fill the one-slot buffer
        table.send(full, ServerMessage::Text("x".into())).await.unwrap();

        let msg = ServerMessage::Text("hello".into());
        let report = table.deliver(&[closed, full, ok], &msg).await;

        assert_eq!(report.delivered, 1);
        assert_eq!(report.failed, vec![closed, full]);
        assert_eq!(rx_ok.recv().await, Some(msg));

        // The slow member was asked to close
        tokio::time::timeout(std::time::Duration::from_secs(1), full_closer.notified())
            .await
            .expect("close requested");
    }

    #[tokio::test]
    async fn test_deliver_all_stops_at_first_rejection() {
        let table = SessionTable::new();
        let (tx_ok, mut rx_ok) = mpsc::channel(4);
        let (tx_small, mut rx_small) = mpsc::channel(1);
        let ok = SessionId::new();
        let small = SessionId::new();
        table.register(ok, tx_ok).await;
        table.register(small, tx_small).await;

        let msgs = [ServerMessage::Text("a".into()), ServerMessage::Text("b".into())];
        let report = table.deliver_all(&[ok, small], &msgs).await;

        assert_eq!(report.delivered, 1);
        assert_eq!(report.failed, vec![small]);
        assert_eq!(rx_ok.recv().await, Some(msgs[0].clone()));
        assert_eq!(rx_ok.recv().await, Some(msgs[1].clone()));
        assert_eq!(rx_small.recv().await, Some(msgs[0].clone()));
        assert!(rx_small.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_send_unknown_session() {
        let table = SessionTable::new();
        let result = table
            .send(SessionId::new(), ServerMessage::Text("x".into()))
            .await;
        assert_eq!(result, Err(SendError::UnknownSession));
    }
}
