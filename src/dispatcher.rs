//! Command dispatcher
//!
//! Turns decoded command lines into actions on the room registry, the
//! session table and the account store.
//!
//! Every command is a [`CommandKind`] with a fixed list of required keys.
//! A command is fully parsed into a typed [`Request`] before anything is
//! touched, so a missing or malformed parameter never changes state.

use std::str::FromStr;
use std::sync::Arc;

use tokio::sync::{mpsc, Notify};
use tracing::{debug, info, warn};

use crate::codec::RawCommand;
use crate::error::{AppError, StoreError};
use crate::message::ServerMessage;
use crate::persist::PersistenceQueue;
use crate::registry::RoomRegistry;
use crate::room::Room;
use crate::session::SessionTable;
use crate::store::{AccountStore, ChatRecord};
use crate::types::{RoomId, SessionId, UserId};

/// Store ids tried by `create_room` before giving up
const REGISTER_ROOM_ATTEMPTS: usize = 8;

/// The closed set of protocol commands
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandKind {
    CreateUser,
    LoginUser,
    CreateRoom,
    InviteUser,
    JoinRoom,
    SendText,
    ExitRoom,
    KickUser,
    GrantHost,
}

impl CommandKind {
    pub const ALL: [CommandKind; 9] = [
        CommandKind::CreateUser,
        CommandKind::LoginUser,
        CommandKind::CreateRoom,
        CommandKind::InviteUser,
        CommandKind::JoinRoom,
        CommandKind::SendText,
        CommandKind::ExitRoom,
        CommandKind::KickUser,
        CommandKind::GrantHost,
    ];

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.name() == name)
    }

    /// Wire name
    pub fn name(self) -> &'static str {
        match self {
            CommandKind::CreateUser => "create_user",
            CommandKind::LoginUser => "login_user",
            CommandKind::CreateRoom => "create_room",
            CommandKind::InviteUser => "invite_user",
            CommandKind::JoinRoom => "join_room",
            CommandKind::SendText => "send_text",
            CommandKind::ExitRoom => "exit_room",
            CommandKind::KickUser => "kick_user",
            CommandKind::GrantHost => "grant_host",
        }
    }

    /// Keys that must be present and non-empty
    pub fn required_keys(self) -> &'static [&'static str] {
        match self {
            CommandKind::CreateUser | CommandKind::LoginUser => &["id", "password"],
            CommandKind::CreateRoom => &["title"],
            CommandKind::JoinRoom => &["room_id"],
            CommandKind::SendText => &["room_id", "user_id", "text"],
            CommandKind::ExitRoom => &["room_id", "user_id"],
            CommandKind::InviteUser | CommandKind::KickUser | CommandKind::GrantHost => {
                &["room_id", "user_id", "target_user_id"]
            }
        }
    }
}

/// A validated command with typed parameters
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    CreateUser {
        login_id: String,
        password: String,
        name: Option<String>,
    },
    LoginUser {
        login_id: String,
        password: String,
    },
    CreateRoom {
        title: String,
        user_id: Option<UserId>,
    },
    InviteUser {
        room_id: RoomId,
        user_id: UserId,
        target: UserId,
    },
    JoinRoom {
        room_id: RoomId,
    },
    SendText {
        room_id: RoomId,
        user_id: UserId,
        text: String,
    },
    ExitRoom {
        room_id: RoomId,
        user_id: UserId,
    },
    KickUser {
        room_id: RoomId,
        user_id: UserId,
        target: UserId,
    },
    GrantHost {
        room_id: RoomId,
        user_id: UserId,
        target: UserId,
    },
}

impl Request {
    /// Validate a decoded command against its kind's required keys
    pub fn parse(cmd: &RawCommand) -> Result<Self, AppError> {
        let kind = CommandKind::from_name(&cmd.name)
            .ok_or_else(|| AppError::UnknownCommand(cmd.name.clone()))?;
        let params = Params { cmd, kind };

        for &key in kind.required_keys() {
            params.required(key)?;
        }

        Ok(match kind {
            CommandKind::CreateUser => Request::CreateUser {
                login_id: params.required("id")?.to_string(),
                password: params.required("password")?.to_string(),
                name: params.optional("name").map(str::to_string),
            },
            CommandKind::LoginUser => Request::LoginUser {
                login_id: params.required("id")?.to_string(),
                password: params.required("password")?.to_string(),
            },
            CommandKind::CreateRoom => Request::CreateRoom {
                title: params.required("title")?.to_string(),
                user_id: params.optional_number("user_id")?,
            },
            CommandKind::InviteUser => Request::InviteUser {
                room_id: params.number("room_id")?,
                user_id: params.number("user_id")?,
                target: params.number("target_user_id")?,
            },
            CommandKind::JoinRoom => Request::JoinRoom {
                room_id: params.number("room_id")?,
            },
            CommandKind::SendText => Request::SendText {
                room_id: params.number("room_id")?,
                user_id: params.number("user_id")?,
                text: params.required("text")?.to_string(),
            },
            CommandKind::ExitRoom => Request::ExitRoom {
                room_id: params.number("room_id")?,
                user_id: params.number("user_id")?,
            },
            CommandKind::KickUser => Request::KickUser {
                room_id: params.number("room_id")?,
                user_id: params.number("user_id")?,
                target: params.number("target_user_id")?,
            },
            CommandKind::GrantHost => Request::GrantHost {
                room_id: params.number("room_id")?,
                user_id: params.number("user_id")?,
                target: params.number("target_user_id")?,
            },
        })
    }

    pub fn kind(&self) -> CommandKind {
        match self {
            Request::CreateUser { .. } => CommandKind::CreateUser,
            Request::LoginUser { .. } => CommandKind::LoginUser,
            Request::CreateRoom { .. } => CommandKind::CreateRoom,
            Request::InviteUser { .. } => CommandKind::InviteUser,
            Request::JoinRoom { .. } => CommandKind::JoinRoom,
            Request::SendText { .. } => CommandKind::SendText,
            Request::ExitRoom { .. } => CommandKind::ExitRoom,
            Request::KickUser { .. } => CommandKind::KickUser,
            Request::GrantHost { .. } => CommandKind::GrantHost,
        }
    }
}

struct Params<'a> {
    cmd: &'a RawCommand,
    kind: CommandKind,
}

impl<'a> Params<'a> {
    fn required(&self, key: &'static str) -> Result<&'a str, AppError> {
        match self.cmd.get(key) {
            Some(value) if !value.is_empty() => Ok(value),
            _ => Err(AppError::MissingParameter {
                command: self.kind.name(),
                key,
            }),
        }
    }

    fn optional(&self, key: &str) -> Option<&'a str> {
        self.cmd.get(key).filter(|v| !v.is_empty())
    }

    fn number<T: FromStr>(&self, key: &'static str) -> Result<T, AppError> {
        let value = self.required(key)?;
        value.parse().map_err(|_| AppError::InvalidParameter {
            key,
            value: value.to_string(),
        })
    }

    fn optional_number<T: FromStr>(&self, key: &'static str) -> Result<Option<T>, AppError> {
        match self.optional(key) {
            Some(_) => self.number(key).map(Some),
            None => Ok(None),
        }
    }
}

/// Result of a successful command
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outcome {
    /// Line sent back to the issuing session
    pub reply: ServerMessage,
    /// Session should close after the reply
    pub close: bool,
}

impl From<ServerMessage> for Outcome {
    fn from(reply: ServerMessage) -> Self {
        Self { reply, close: false }
    }
}

/// Shared relay state and the actions that operate on it
pub struct Dispatcher<A> {
    accounts: Arc<A>,
    persistence: PersistenceQueue,
    rooms: RoomRegistry,
    sessions: SessionTable,
    echo_to_sender: bool,
}

impl<A: AccountStore> Dispatcher<A> {
    pub fn new(accounts: Arc<A>, persistence: PersistenceQueue, echo_to_sender: bool) -> Self {
        Self {
            accounts,
            persistence,
            rooms: RoomRegistry::new(),
            sessions: SessionTable::new(),
            echo_to_sender,
        }
    }

    pub fn rooms(&self) -> &RoomRegistry {
        &self.rooms
    }

    pub fn sessions(&self) -> &SessionTable {
        &self.sessions
    }

    /// Register a new connection; returns its close signal
    pub async fn connect(&self, session_id: SessionId, sender: mpsc::Sender<ServerMessage>) -> Arc<Notify> {
        debug!("Session {} registered", session_id);
        self.sessions.register(session_id, sender).await
    }

    /// Tear down a connection: leave its room, evict the room if empty
    ///
    /// Idempotent; only the first call does anything.
    pub async fn disconnect(&self, session_id: SessionId) {
        let Some(entry) = self.sessions.remove(session_id).await else {
            return;
        };
        if let Some(room_id) = entry.room_id {
            self.leave_room(session_id, room_id).await;
        }
        debug!(
            "Session {} removed, {} sessions and {} rooms remain",
            session_id,
            self.sessions.len().await,
            self.rooms.len().await
        );
    }

    /// Legacy `<room_id>,<user_id>` handshake
    pub async fn legacy_join(
        &self,
        session_id: SessionId,
        room_id: RoomId,
        user_id: UserId,
    ) -> Result<(), AppError> {
        self.sessions.set_user(session_id, user_id).await;
        let (title, host) = self.room_hints(room_id).await;
        self.enter_room(session_id, room_id, title, host).await;
        info!("User {} joined room {} (legacy)", user_id, room_id);
        Ok(())
    }

    /// Legacy chat line: relay verbatim to the current room and persist
    pub async fn relay(&self, session_id: SessionId, text: &str) -> Result<(), AppError> {
        let room_id = self
            .sessions
            .room_of(session_id)
            .await
            .ok_or(AppError::NoCurrentRoom)?;
        let room = self.rooms.get(room_id).await.ok_or(AppError::NoCurrentRoom)?;
        self.broadcast_text(session_id, &room, text).await;

        if let Some(user_id) = self.sessions.user_of(session_id).await {
            self.persistence
                .submit(ChatRecord::now(room_id, user_id, text));
        }
        Ok(())
    }

    /// Decode-independent entry point for protocol commands
    pub async fn dispatch(&self, session_id: SessionId, cmd: &RawCommand) -> Result<Outcome, AppError> {
        for issue in &cmd.issues {
            debug!("Session {}: {}", session_id, issue);
        }
        let request = Request::parse(cmd)?;
        debug!("Session {} -> {}", session_id, request.kind().name());
        self.execute(session_id, request).await
    }

    /// Apply a validated request
    pub async fn execute(&self, session_id: SessionId, request: Request) -> Result<Outcome, AppError> {
        match request {
            Request::CreateUser {
                login_id,
                password,
                name,
            } => self.create_user(login_id, password, name).await,
            Request::LoginUser { login_id, password } => {
                self.login_user(session_id, login_id, password).await
            }
            Request::CreateRoom { title, user_id } => {
                self.create_room(session_id, title, user_id).await
            }
            Request::InviteUser {
                room_id,
                user_id,
                target,
            } => self.invite_user(session_id, room_id, user_id, target).await,
            Request::JoinRoom { room_id } => self.join_room(session_id, room_id).await,
            Request::SendText {
                room_id,
                user_id,
                text,
            } => self.send_text(session_id, room_id, user_id, text).await,
            Request::ExitRoom { room_id, user_id } => {
                self.exit_room(session_id, room_id, user_id).await
            }
            Request::KickUser {
                room_id,
                user_id,
                target,
            } => self.kick_user(session_id, room_id, user_id, target).await,
            Request::GrantHost {
                room_id,
                user_id,
                target,
            } => self.grant_host(session_id, room_id, user_id, target).await,
        }
    }

    async fn create_user(
        &self,
        login_id: String,
        password: String,
        name: Option<String>,
    ) -> Result<Outcome, AppError> {
        let name = name.unwrap_or_else(|| login_id.clone());
        let user_id = self.accounts.create_user(&login_id, &password, &name).await?;
        info!("User {} created as '{}'", user_id, login_id);
        Ok(ServerMessage::ack("create_user").with("user_id", user_id).into())
    }

    async fn login_user(
        &self,
        session_id: SessionId,
        login_id: String,
        password: String,
    ) -> Result<Outcome, AppError> {
        let user_id = self.accounts.verify(&login_id, &password).await?;
        self.sessions.set_user(session_id, user_id).await;
        info!("Session {} logged in as user {}", session_id, user_id);
        Ok(ServerMessage::ack("login_user").with("user_id", user_id).into())
    }

    async fn create_room(
        &self,
        session_id: SessionId,
        title: String,
        claimed: Option<UserId>,
    ) -> Result<Outcome, AppError> {
        let host = match (self.sessions.user_of(session_id).await, claimed) {
            (Some(bound), Some(claimed)) if bound != claimed => {
                return Err(mismatch(bound));
            }
            (Some(bound), _) => bound,
            (None, Some(claimed)) => claimed,
            (None, None) => return Err(AppError::Unauthorized("login required".to_string())),
        };

        let room_id = self.register_room(&title, host).await?;
        self.enter_room(session_id, room_id, Some(title.clone()), Some(host))
            .await;
        info!("User {} created room {} '{}'", host, room_id, title);
        Ok(ServerMessage::ack("create_room")
            .with("room_id", room_id)
            .with("title", title)
            .into())
    }

    /// Store a room record and install its live room
    ///
    /// Joins can bring rooms to life under ids that have no record. When
    /// the store hands out such an id the record is dropped and a fresh id
    /// is requested; store ids only grow, so each attempt gets a new one.
    async fn register_room(&self, title: &str, host: UserId) -> Result<RoomId, AppError> {
        for _ in 0..REGISTER_ROOM_ATTEMPTS {
            let room_id = self.accounts.create_room(title, host).await?;
            if self.rooms.create(room_id, title.to_string(), host).await.is_some() {
                return Ok(room_id);
            }
            warn!("Room id {} is already live, requesting another", room_id);
            self.accounts.delete_room(room_id).await?;
        }
        Err(AppError::Conflict(format!("no free id for room '{}'", title)))
    }

    async fn invite_user(
        &self,
        session_id: SessionId,
        room_id: RoomId,
        claimed: UserId,
        target: UserId,
    ) -> Result<Outcome, AppError> {
        let actor = self.acting_user(session_id, claimed).await?;
        self.member_room(session_id, room_id).await?;

        let targets = self.sessions.sessions_of_user(target).await;
        if targets.is_empty() {
            return Err(AppError::UserNotFound(target));
        }
        for id in targets {
            if let Err(e) = self
                .sessions
                .send(id, ServerMessage::Invite { room_id, from: actor })
                .await
            {
                debug!("Invite to session {} not delivered: {}", id, e);
            }
        }
        info!("User {} invited user {} to room {}", actor, target, room_id);
        Ok(ServerMessage::ack("invite_user")
            .with("room_id", room_id)
            .with("target_user_id", target)
            .into())
    }

    async fn join_room(&self, session_id: SessionId, room_id: RoomId) -> Result<Outcome, AppError> {
        let (title, host) = self.room_hints(room_id).await;
        self.enter_room(session_id, room_id, title, host).await;
        Ok(ServerMessage::ack("join_room").with("room_id", room_id).into())
    }

    async fn send_text(
        &self,
        session_id: SessionId,
        room_id: RoomId,
        claimed: UserId,
        text: String,
    ) -> Result<Outcome, AppError> {
        let actor = self.acting_user(session_id, claimed).await?;
        let room = self.member_room(session_id, room_id).await?;

        self.broadcast_text(session_id, &room, &text).await;
        self.persistence.submit(ChatRecord::now(room_id, actor, text));
        Ok(ServerMessage::ack("send_text").into())
    }

    async fn exit_room(
        &self,
        session_id: SessionId,
        room_id: RoomId,
        claimed: UserId,
    ) -> Result<Outcome, AppError> {
        self.acting_user(session_id, claimed).await?;
        self.member_room(session_id, room_id).await?;
        self.leave_room(session_id, room_id).await;
        Ok(Outcome {
            reply: ServerMessage::ack("exit_room").with("room_id", room_id),
            close: true,
        })
    }

    async fn kick_user(
        &self,
        session_id: SessionId,
        room_id: RoomId,
        claimed: UserId,
        target: UserId,
    ) -> Result<Outcome, AppError> {
        let actor = self.acting_user(session_id, claimed).await?;
        let room = self
            .rooms
            .get(room_id)
            .await
            .ok_or(AppError::RoomNotFound(room_id))?;

        let candidates = self.sessions.sessions_of_user(target).await;
        let removed = room.kick(actor, target, &candidates, &self.sessions).await?;
        for id in &removed {
            self.sessions.clear_room_if(*id, room_id).await;
            if let Err(e) = self.sessions.send(*id, ServerMessage::Kicked { room_id }).await {
                debug!("Kick notice to session {} not delivered: {}", id, e);
            }
        }
        self.rooms.evict_if_empty(room_id).await;

        info!("User {} kicked user {} from room {}", actor, target, room_id);
        Ok(ServerMessage::ack("kick_user")
            .with("room_id", room_id)
            .with("target_user_id", target)
            .into())
    }

    async fn grant_host(
        &self,
        session_id: SessionId,
        room_id: RoomId,
        claimed: UserId,
        target: UserId,
    ) -> Result<Outcome, AppError> {
        let actor = self.acting_user(session_id, claimed).await?;
        let room = self
            .rooms
            .get(room_id)
            .await
            .ok_or(AppError::RoomNotFound(room_id))?;
        room.transfer_host(actor, target).await?;

        match self.accounts.set_room_host(room_id, target).await {
            Ok(()) => {}
            Err(StoreError::NotFound(_)) => debug!("Room {} has no stored record", room_id),
            Err(e) => warn!("Failed to store new host for room {}: {}", room_id, e),
        }

        info!("User {} granted host of room {} to user {}", actor, room_id, target);
        Ok(ServerMessage::ack("grant_host")
            .with("room_id", room_id)
            .with("target_user_id", target)
            .into())
    }

    /// Move a session into `room_id`, leaving its previous room first
    async fn enter_room(
        &self,
        session_id: SessionId,
        room_id: RoomId,
        title: Option<String>,
        host: Option<UserId>,
    ) -> Arc<Room> {
        if let Some(current) = self.sessions.room_of(session_id).await {
            if current == room_id {
                if let Some(room) = self.rooms.get(room_id).await {
                    if room.contains(session_id).await {
                        return room;
                    }
                }
            } else {
                self.leave_room(session_id, current).await;
            }
        }

        // Recorded before membership so a kick racing the join can clear it
        self.sessions.set_room(session_id, Some(room_id)).await;
        let user_id = self.sessions.user_of(session_id).await;
        let (room, _) = self
            .rooms
            .join(room_id, session_id, user_id, title, host, &self.sessions)
            .await;
        room
    }

    async fn leave_room(&self, session_id: SessionId, room_id: RoomId) {
        if let Some(room) = self.rooms.get(room_id).await {
            room.leave(session_id, &self.sessions).await;
        }
        self.sessions.clear_room_if(session_id, room_id).await;
        self.rooms.evict_if_empty(room_id).await;
    }

    async fn broadcast_text(&self, session_id: SessionId, room: &Room, text: &str) {
        let except = (!self.echo_to_sender).then_some(session_id);
        room.broadcast(ServerMessage::Text(text.to_string()), except, &self.sessions)
            .await;
    }

    /// Title and host from the stored room record, if any
    async fn room_hints(&self, room_id: RoomId) -> (Option<String>, Option<UserId>) {
        match self.accounts.find_room(room_id).await {
            Ok(Some(record)) => (Some(record.title), Some(record.host_user_id)),
            Ok(None) => (None, None),
            Err(e) => {
                warn!("Room lookup for {} failed: {}", room_id, e);
                (None, None)
            }
        }
    }

    /// The user a command acts as; must match the session's bound user
    async fn acting_user(&self, session_id: SessionId, claimed: UserId) -> Result<UserId, AppError> {
        match self.sessions.user_of(session_id).await {
            Some(bound) if bound != claimed => Err(mismatch(bound)),
            _ => Ok(claimed),
        }
    }

    /// The live room, provided the session is a member of it
    async fn member_room(&self, session_id: SessionId, room_id: RoomId) -> Result<Arc<Room>, AppError> {
        if self.sessions.room_of(session_id).await != Some(room_id) {
            return Err(AppError::NotInRoom(room_id));
        }
        self.rooms
            .get(room_id)
            .await
            .ok_or(AppError::NotInRoom(room_id))
    }
}

fn mismatch(bound: UserId) -> AppError {
    AppError::Unauthorized(format!("session is logged in as user {}", bound))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::decode_command;
    use crate::message::{ErrorCode, JOIN_NOTICE, LEAVE_NOTICE};
    use crate::store::MemoryStore;

    struct Harness {
        store: Arc<MemoryStore>,
        dispatcher: Dispatcher<MemoryStore>,
    }

    impl Harness {
        fn new() -> Self {
            let store = Arc::new(MemoryStore::new());
            let (queue, _worker) = PersistenceQueue::spawn(store.clone(), 64);
            Self {
                dispatcher: Dispatcher::new(store.clone(), queue, true),
                store,
            }
        }

        async fn session(&self) -> (SessionId, mpsc::Receiver<ServerMessage>) {
            let (tx, rx) = mpsc::channel(64);
            let id = SessionId::new();
            self.dispatcher.connect(id, tx).await;
            (id, rx)
        }

        async fn run(&self, id: SessionId, line: &str) -> Result<Outcome, AppError> {
            let cmd = decode_command(line).expect("decodable");
            self.dispatcher.dispatch(id, &cmd).await
        }

        /// Create, log in and return the user id
        async fn login(&self, id: SessionId, login: &str) -> UserId {
            self.run(id, &format!("create_user?id:{}/password:pw", login))
                .await
                .unwrap();
            match self
                .run(id, &format!("login_user?id:{}/password:pw", login))
                .await
                .unwrap()
                .reply
            {
                ServerMessage::Ack { fields, .. } => UserId(fields[0].1.parse().unwrap()),
                other => panic!("unexpected {:?}", other),
            }
        }
    }

    fn drain(rx: &mut mpsc::Receiver<ServerMessage>) -> Vec<ServerMessage> {
        let mut out = Vec::new();
        while let Ok(msg) = rx.try_recv() {
            out.push(msg);
        }
        out
    }

    #[test]
    fn test_required_keys_table() {
        assert_eq!(CommandKind::SendText.required_keys(), &["room_id", "user_id", "text"]);
        assert_eq!(CommandKind::CreateRoom.required_keys(), &["title"]);
        for kind in CommandKind::ALL {
            assert_eq!(CommandKind::from_name(kind.name()), Some(kind));
        }
        assert_eq!(CommandKind::from_name("send"), None);
    }

    #[test]
    fn test_parse_missing_and_invalid() {
        let cmd = decode_command("send_text?room_id:1/text:hi").unwrap();
        assert!(matches!(
            Request::parse(&cmd),
            Err(AppError::MissingParameter {
                command: "send_text",
                key: "user_id"
            })
        ));

        let cmd = decode_command("join_room?room_id:abc").unwrap();
        assert!(matches!(
            Request::parse(&cmd),
            Err(AppError::InvalidParameter { key: "room_id", .. })
        ));

        let cmd = decode_command("join_room?room_id:").unwrap();
        assert!(matches!(
            Request::parse(&cmd),
            Err(AppError::MissingParameter { .. })
        ));
    }

    #[tokio::test]
    async fn test_unknown_and_incomplete_commands_change_nothing() {
        let h = Harness::new();
        let (a, _rx) = h.session().await;

        let err = h.run(a, "fly_away?room_id:1").await.unwrap_err();
        assert!(matches!(err, AppError::UnknownCommand(_)));
        let err = h.run(a, "send_text?room_id:1/user_id:1").await.unwrap_err();
        assert!(matches!(err, AppError::MissingParameter { key: "text", .. }));
        let err = h.run(a, "kick_user?room_id:1/user_id:1").await.unwrap_err();
        assert!(matches!(err, AppError::MissingParameter { .. }));

        assert!(h.dispatcher.rooms().is_empty().await);
        assert!(h.dispatcher.sessions().room_of(a).await.is_none());
        assert!(h.store.talks().await.is_empty());
    }

    #[tokio::test]
    async fn test_create_user_conflict() {
        let h = Harness::new();
        let (a, _rx) = h.session().await;
        h.run(a, "create_user?id:amy/password:pw").await.unwrap();
        let err = h.run(a, "create_user?id:amy/password:pw").await.unwrap_err();
        let reply: ServerMessage = err.into();
        assert!(matches!(
            reply,
            ServerMessage::Error {
                code: ErrorCode::Conflict,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_login_failure() {
        let h = Harness::new();
        let (a, _rx) = h.session().await;
        h.run(a, "create_user?id:amy/password:pw").await.unwrap();
        let err = h.run(a, "login_user?id:amy/password:nope").await.unwrap_err();
        assert!(matches!(err, AppError::AuthFailed));
        assert!(h.dispatcher.sessions().user_of(a).await.is_none());
    }

    #[tokio::test]
    async fn test_create_room_requires_user() {
        let h = Harness::new();
        let (a, _rx) = h.session().await;
        let err = h.run(a, "create_room?title:lobby").await.unwrap_err();
        assert!(matches!(err, AppError::Unauthorized(_)));
        assert!(h.dispatcher.rooms().is_empty().await);
    }

    #[tokio::test]
    async fn test_create_room_joins_creator_as_host() {
        let h = Harness::new();
        let (a, mut rx_a) = h.session().await;
        let user = h.login(a, "amy").await;

        let outcome = h.run(a, "create_room?title:lobby").await.unwrap();
        assert_eq!(
            outcome.reply.to_line(),
            "ok?command:create_room/room_id:1/title:lobby\n"
        );
        let room = h.dispatcher.rooms().get(RoomId(1)).await.unwrap();
        assert_eq!(room.host().await, Some(user));
        assert!(room.contains(a).await);
        assert_eq!(drain(&mut rx_a), vec![ServerMessage::Text(JOIN_NOTICE.into())]);

        let (b, _rx_b) = h.session().await;
        h.login(b, "bob").await;
        let err = h.run(b, "create_room?title:lobby").await.unwrap_err();
        assert!(matches!(err, AppError::Conflict(_)));
    }

    #[tokio::test]
    async fn test_create_room_skips_live_unrecorded_id() {
        let h = Harness::new();
        let (legacy, _rx_legacy) = h.session().await;
        h.dispatcher
            .legacy_join(legacy, RoomId(1), UserId(50))
            .await
            .unwrap();

        let (a, _rx_a) = h.session().await;
        let amy = h.login(a, "amy").await;
        let outcome = h.run(a, "create_room?title:lobby").await.unwrap();
        assert_eq!(
            outcome.reply.to_line(),
            "ok?command:create_room/room_id:2/title:lobby\n"
        );

        let lobby = h.dispatcher.rooms().get(RoomId(2)).await.unwrap();
        assert_eq!(lobby.host().await, Some(amy));
        assert!(lobby.contains(a).await);
        let legacy_room = h.dispatcher.rooms().get(RoomId(1)).await.unwrap();
        assert_eq!(legacy_room.host().await, Some(UserId(50)));
        assert!(!legacy_room.contains(a).await);
        assert!(h.store.find_room(RoomId(1)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_send_text_reaches_members_and_persists() {
        let h = Harness::new();
        let (a, mut rx_a) = h.session().await;
        let (b, mut rx_b) = h.session().await;
        h.run(a, "join_room?room_id:4").await.unwrap();
        h.run(b, "join_room?room_id:4").await.unwrap();
        drain(&mut rx_a);
        drain(&mut rx_b);

        h.run(a, "send_text?room_id:4/user_id:1/text:one").await.unwrap();
        h.run(a, "send_text?room_id:4/user_id:1/text:two").await.unwrap();

        let expected = vec![
            ServerMessage::Text("one".into()),
            ServerMessage::Text("two".into()),
        ];
        assert_eq!(drain(&mut rx_b), expected);
        // Sender gets its own echo
        assert_eq!(drain(&mut rx_a), expected);

        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        let talks: Vec<String> = h.store.talks().await.into_iter().map(|t| t.text).collect();
        assert_eq!(talks, vec!["one", "two"]);
    }

    #[tokio::test]
    async fn test_send_text_without_membership() {
        let h = Harness::new();
        let (a, _rx_a) = h.session().await;
        let err = h.run(a, "send_text?room_id:4/user_id:1/text:hi").await.unwrap_err();
        assert!(matches!(err, AppError::NotInRoom(RoomId(4))));
    }

    #[tokio::test]
    async fn test_user_id_must_match_login() {
        let h = Harness::new();
        let (a, _rx_a) = h.session().await;
        let user = h.login(a, "amy").await;
        h.run(a, "join_room?room_id:2").await.unwrap();

        let line = format!("send_text?room_id:2/user_id:{}/text:hi", user.0 + 1);
        let err = h.run(a, &line).await.unwrap_err();
        assert!(matches!(err, AppError::Unauthorized(_)));
    }

    #[tokio::test]
    async fn test_join_room_moves_and_evicts() {
        let h = Harness::new();
        let (a, _rx_a) = h.session().await;
        h.run(a, "join_room?room_id:1").await.unwrap();
        h.run(a, "join_room?room_id:2").await.unwrap();

        assert!(h.dispatcher.rooms().get(RoomId(1)).await.is_none());
        assert_eq!(h.dispatcher.sessions().room_of(a).await, Some(RoomId(2)));
        assert_eq!(h.dispatcher.rooms().len().await, 1);
    }

    #[tokio::test]
    async fn test_kick_by_non_host_is_rejected() {
        let h = Harness::new();
        let (a, _rx_a) = h.session().await;
        let (b, _rx_b) = h.session().await;
        let amy = h.login(a, "amy").await;
        let bob = h.login(b, "bob").await;
        h.run(a, "create_room?title:lobby").await.unwrap();
        h.run(b, "join_room?room_id:1").await.unwrap();

        let line = format!("kick_user?room_id:1/user_id:{}/target_user_id:{}", bob.0, amy.0);
        let err = h.run(b, &line).await.unwrap_err();
        assert!(matches!(err, AppError::Unauthorized(_)));

        let room = h.dispatcher.rooms().get(RoomId(1)).await.unwrap();
        assert_eq!(room.member_count().await, 2);
        assert_eq!(room.host().await, Some(amy));
    }

    #[tokio::test]
    async fn test_kick_by_host() {
        let h = Harness::new();
        let (a, mut rx_a) = h.session().await;
        let (b, mut rx_b) = h.session().await;
        let amy = h.login(a, "amy").await;
        let bob = h.login(b, "bob").await;
        h.run(a, "create_room?title:lobby").await.unwrap();
        h.run(b, "join_room?room_id:1").await.unwrap();
        drain(&mut rx_a);
        drain(&mut rx_b);

        let line = format!("kick_user?room_id:1/user_id:{}/target_user_id:{}", amy.0, bob.0);
        h.run(a, &line).await.unwrap();

        assert_eq!(
            drain(&mut rx_b),
            vec![ServerMessage::Kicked { room_id: RoomId(1) }]
        );
        assert_eq!(drain(&mut rx_a), vec![ServerMessage::Text(LEAVE_NOTICE.into())]);
        assert!(h.dispatcher.sessions().room_of(b).await.is_none());
        let room = h.dispatcher.rooms().get(RoomId(1)).await.unwrap();
        assert_eq!(room.member_count().await, 1);
    }

    #[tokio::test]
    async fn test_kick_racing_join_leaves_consistent_record() {
        for _ in 0..20 {
            let h = Harness::new();
            let (a, _rx_a) = h.session().await;
            let (b, _rx_b) = h.session().await;
            let amy = h.login(a, "amy").await;
            let bob = h.login(b, "bob").await;
            h.run(a, "create_room?title:lobby").await.unwrap();

            let kick = format!("kick_user?room_id:1/user_id:{}/target_user_id:{}", amy.0, bob.0);
            let (joined, _) = tokio::join!(h.run(b, "join_room?room_id:1"), h.run(a, &kick));
            joined.unwrap();

            let room = h.dispatcher.rooms().get(RoomId(1)).await.unwrap();
            let recorded = h.dispatcher.sessions().room_of(b).await == Some(RoomId(1));
            assert_eq!(room.contains(b).await, recorded);
        }
    }

    #[tokio::test]
    async fn test_grant_host() {
        let h = Harness::new();
        let (a, _rx_a) = h.session().await;
        let (b, _rx_b) = h.session().await;
        let amy = h.login(a, "amy").await;
        let bob = h.login(b, "bob").await;
        h.run(a, "create_room?title:lobby").await.unwrap();
        h.run(b, "join_room?room_id:1").await.unwrap();

        let line = format!("grant_host?room_id:1/user_id:{}/target_user_id:{}", bob.0, bob.0);
        assert!(matches!(
            h.run(b, &line).await.unwrap_err(),
            AppError::Unauthorized(_)
        ));

        let line = format!("grant_host?room_id:1/user_id:{}/target_user_id:{}", amy.0, bob.0);
        h.run(a, &line).await.unwrap();
        let room = h.dispatcher.rooms().get(RoomId(1)).await.unwrap();
        assert_eq!(room.host().await, Some(bob));
        let record = h.store.find_room(RoomId(1)).await.unwrap().unwrap();
        assert_eq!(record.host_user_id, bob);
    }

    #[tokio::test]
    async fn test_invite_user() {
        let h = Harness::new();
        let (a, _rx_a) = h.session().await;
        let (b, mut rx_b) = h.session().await;
        let amy = h.login(a, "amy").await;
        let bob = h.login(b, "bob").await;

        let line = format!("invite_user?room_id:1/user_id:{}/target_user_id:{}", amy.0, bob.0);
        assert!(matches!(
            h.run(a, &line).await.unwrap_err(),
            AppError::NotInRoom(_)
        ));

        h.run(a, "create_room?title:lobby").await.unwrap();
        drain(&mut rx_b);
        h.run(a, &line).await.unwrap();
        assert_eq!(
            drain(&mut rx_b),
            vec![ServerMessage::Invite {
                room_id: RoomId(1),
                from: amy
            }]
        );

        let line = format!("invite_user?room_id:1/user_id:{}/target_user_id:99", amy.0);
        assert!(matches!(
            h.run(a, &line).await.unwrap_err(),
            AppError::UserNotFound(UserId(99))
        ));
    }

    #[tokio::test]
    async fn test_exit_room_closes_and_evicts() {
        let h = Harness::new();
        let (a, _rx_a) = h.session().await;
        h.run(a, "join_room?room_id:7").await.unwrap();

        let outcome = h.run(a, "exit_room?room_id:7/user_id:1").await.unwrap();
        assert!(outcome.close);
        assert!(h.dispatcher.rooms().get(RoomId(7)).await.is_none());
    }

    #[tokio::test]
    async fn test_disconnect_is_idempotent() {
        let h = Harness::new();
        let (a, _rx_a) = h.session().await;
        let (b, mut rx_b) = h.session().await;
        h.dispatcher.legacy_join(a, RoomId(3), UserId(1)).await.unwrap();
        h.dispatcher.legacy_join(b, RoomId(3), UserId(2)).await.unwrap();
        drain(&mut rx_b);

        h.dispatcher.disconnect(a).await;
        h.dispatcher.disconnect(a).await;
        assert_eq!(drain(&mut rx_b), vec![ServerMessage::Text(LEAVE_NOTICE.into())]);

        h.dispatcher.disconnect(b).await;
        assert!(h.dispatcher.rooms().is_empty().await);
        assert!(h.dispatcher.sessions().is_empty().await);
    }

    #[tokio::test]
    async fn test_relay_persists_under_handshake_user() {
        let h = Harness::new();
        let (a, mut rx_a) = h.session().await;
        h.dispatcher.legacy_join(a, RoomId(1), UserId(5)).await.unwrap();
        drain(&mut rx_a);

        h.dispatcher.relay(a, "hello").await.unwrap();
        assert_eq!(drain(&mut rx_a), vec![ServerMessage::Text("hello".into())]);

        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        let talks = h.store.talks().await;
        assert_eq!(talks.len(), 1);
        assert_eq!(talks[0].user_id, UserId(5));
        assert_eq!(talks[0].room_id, RoomId(1));
    }
}
