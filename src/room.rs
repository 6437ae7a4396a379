//! Room struct definition
//!
//! A room is a set of session ids plus its title and host. Membership is
//! guarded by a per-room lock; fan-out happens after the lock is released.

use std::collections::HashSet;

use tokio::sync::Mutex;
use tracing::debug;

use crate::error::AppError;
use crate::message::{ServerMessage, JOIN_NOTICE, LEAVE_NOTICE};
use crate::session::{BroadcastReport, SessionTable};
use crate::types::{RoomId, SessionId, UserId};

/// Join landed on a room that the registry already evicted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RoomEvicted;

/// Result of a successful join
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinOutcome {
    Joined,
    AlreadyMember,
}

#[derive(Debug, Default)]
struct RoomState {
    title: Option<String>,
    host: Option<UserId>,
    members: HashSet<SessionId>,
    /// Set by the registry under this lock when the room is removed
    evicted: bool,
}

/// Multi-member chat room
#[derive(Debug)]
pub struct Room {
    /// Room id for identification
    pub id: RoomId,
    state: Mutex<RoomState>,
}

impl Room {
    /// Create an empty room
    pub fn new(id: RoomId, title: Option<String>, host: Option<UserId>) -> Self {
        Self {
            id,
            state: Mutex::new(RoomState {
                title,
                host,
                ..RoomState::default()
            }),
        }
    }

    /// Add a session and announce it to every member, itself included
    ///
    /// The first member with a known user becomes host of a room that
    /// has none.
    pub async fn join(
        &self,
        session_id: SessionId,
        user_id: Option<UserId>,
        sessions: &SessionTable,
    ) -> Result<JoinOutcome, RoomEvicted> {
        let members = {
            let mut state = self.state.lock().await;
            if state.evicted {
                return Err(RoomEvicted);
            }
            if !state.members.insert(session_id) {
                return Ok(JoinOutcome::AlreadyMember);
            }
            if state.host.is_none() {
                state.host = user_id;
            }
            snapshot(&state.members, None)
        };

        debug!("Session {} joined room {}", session_id, self.id);
        sessions
            .deliver(&members, &ServerMessage::Text(JOIN_NOTICE.to_string()))
            .await;
        Ok(JoinOutcome::Joined)
    }

    /// Remove a session and announce it to the remaining members
    ///
    /// Returns false if the session was not a member.
    pub async fn leave(&self, session_id: SessionId, sessions: &SessionTable) -> bool {
        let members = {
            let mut state = self.state.lock().await;
            if !state.members.remove(&session_id) {
                return false;
            }
            snapshot(&state.members, None)
        };

        debug!("Session {} left room {}", session_id, self.id);
        if !members.is_empty() {
            sessions
                .deliver(&members, &ServerMessage::Text(LEAVE_NOTICE.to_string()))
                .await;
        }
        true
    }

    /// Send a message to every member, optionally skipping one
    ///
    /// Failing members are asked to close; delivery to the rest goes on.
    pub async fn broadcast(
        &self,
        msg: ServerMessage,
        except: Option<SessionId>,
        sessions: &SessionTable,
    ) -> BroadcastReport {
        let members = {
            let state = self.state.lock().await;
            snapshot(&state.members, except)
        };
        let report = sessions.deliver(&members, &msg).await;
        if !report.failed.is_empty() {
            debug!(
                "Room {}: {} delivered, {} failed",
                self.id,
                report.delivered,
                report.failed.len()
            );
        }
        report
    }

    /// Remove `target`'s sessions on behalf of the host `actor`
    ///
    /// Host check and removal happen under one lock. Returns the removed
    /// session ids; nothing changes on error.
    pub async fn kick(
        &self,
        actor: UserId,
        target: UserId,
        candidates: &[SessionId],
        sessions: &SessionTable,
    ) -> Result<Vec<SessionId>, AppError> {
        let (removed, remaining) = {
            let mut state = self.state.lock().await;
            if state.host != Some(actor) {
                return Err(AppError::Unauthorized(format!(
                    "user {} is not the host of room {}",
                    actor, self.id
                )));
            }
            let removed: Vec<SessionId> = candidates
                .iter()
                .copied()
                .filter(|id| state.members.contains(id))
                .collect();
            if removed.is_empty() {
                return Err(AppError::UserNotFound(target));
            }
            for id in &removed {
                state.members.remove(id);
            }
            (removed, snapshot(&state.members, None))
        };

        if !remaining.is_empty() {
            // One notice per removed member
            let notices = vec![ServerMessage::Text(LEAVE_NOTICE.to_string()); removed.len()];
            sessions.deliver_all(&remaining, &notices).await;
        }
        Ok(removed)
    }

    /// Make `target` the host on behalf of the current host `actor`
    pub async fn transfer_host(&self, actor: UserId, target: UserId) -> Result<(), AppError> {
        let mut state = self.state.lock().await;
        if state.host != Some(actor) {
            return Err(AppError::Unauthorized(format!(
                "user {} is not the host of room {}",
                actor, self.id
            )));
        }
        state.host = Some(target);
        Ok(())
    }

    /// Get the number of members in the room
    pub async fn member_count(&self) -> usize {
        self.state.lock().await.members.len()
    }

    /// Check if a session is in this room
    pub async fn contains(&self, session_id: SessionId) -> bool {
        self.state.lock().await.members.contains(&session_id)
    }

    pub async fn host(&self) -> Option<UserId> {
        self.state.lock().await.host
    }

    pub async fn title(&self) -> Option<String> {
        self.state.lock().await.title.clone()
    }

    /// Mark evicted if empty; caller must hold the registry lock
    pub(crate) async fn evict_if_empty(&self) -> bool {
        let mut state = self.state.lock().await;
        if state.members.is_empty() {
            state.evicted = true;
            true
        } else {
            false
        }
    }
}

fn snapshot(members: &HashSet<SessionId>, except: Option<SessionId>) -> Vec<SessionId> {
    members
        .iter()
        .copied()
        .filter(|id| Some(*id) != except)
        .collect()
}
