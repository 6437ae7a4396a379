//! TCP connection handler
//!
//! Drives one connection through the session state machine: reads lines,
//! decodes them, hands them to the dispatcher and queues replies on the
//! session's outbound channel. A separate write task drains that channel
//! to the socket.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::codec::{self, Handshake, LineReader};
use crate::config::ServerConfig;
use crate::dispatcher::{Dispatcher, Outcome};
use crate::error::{AppError, DecodeError};
use crate::message::ServerMessage;
use crate::session::{SessionMode, SessionState};
use crate::store::AccountStore;
use crate::types::SessionId;

/// How long queued replies may take to flush once the session closes
const FLUSH_TIMEOUT: Duration = Duration::from_secs(1);

/// Handle a new TCP connection until it closes
///
/// Always deregisters the session from the dispatcher before returning.
pub async fn handle_connection<A: AccountStore>(
    stream: TcpStream,
    dispatcher: Arc<Dispatcher<A>>,
    config: Arc<ServerConfig>,
) -> Result<(), AppError> {
    let peer_addr = stream
        .peer_addr()
        .map(|a| a.to_string())
        .unwrap_or_else(|_| "unknown".to_string());

    let (read_half, mut write_half) = stream.into_split();
    let mut lines = LineReader::new(BufReader::new(read_half), config.max_line_bytes);

    let session_id = SessionId::new();
    info!("Session {} connected from {}", session_id, peer_addr);

    // Channel for server -> client lines
    let (msg_tx, mut msg_rx) = mpsc::channel::<ServerMessage>(config.outbound_buffer.max(1));
    let closer = dispatcher.connect(session_id, msg_tx).await;

    // Write task (ServerMessage -> socket)
    let write_closer = closer.clone();
    let mut write_task = tokio::spawn(async move {
        while let Some(msg) = msg_rx.recv().await {
            if write_half.write_all(msg.to_line().as_bytes()).await.is_err() {
                debug!("Socket write failed for {}", session_id);
                write_closer.notify_one();
                break;
            }
        }
        let _ = write_half.shutdown().await;
    });

    let idle = config.idle_timeout();
    let mut state = SessionState::AwaitingHandshake { failures: 0 };
    let result = loop {
        let read = tokio::select! {
            _ = closer.notified() => {
                debug!("Close requested for {}", session_id);
                break Ok(());
            }
            read = read_line(&mut lines, idle) => read,
        };

        let line = match read {
            Ok(Some(line)) => line,
            Ok(None) => {
                debug!("Session {} reached EOF", session_id);
                break Ok(());
            }
            Err(e) if e.kind() == io::ErrorKind::TimedOut => {
                info!("Session {} idle, closing", session_id);
                break Ok(());
            }
            Err(e) => break Err(AppError::Io(e)),
        };

        state = match line {
            Ok(line) => handle_line(&dispatcher, &config, session_id, state, &line).await,
            Err(e @ DecodeError::LineTooLong(_)) => {
                warn!("Session {} sent an overlong line, closing", session_id);
                reply(&dispatcher, session_id, AppError::from(e).into()).await;
                SessionState::Closing
            }
            Err(e) => reject(&dispatcher, &config, session_id, state, e).await,
        };
        if state == SessionState::Closing {
            break Ok(());
        }
    };

    dispatcher.disconnect(session_id).await;

    // The dispatcher held the last sender, so the write task ends once
    // everything queued has been written.
    if tokio::time::timeout(FLUSH_TIMEOUT, &mut write_task).await.is_err() {
        debug!("Write task for {} did not finish, aborting", session_id);
        write_task.abort();
    }

    info!("Session {} disconnected", session_id);
    result
}

/// Read one line, giving up after `idle` without input
async fn read_line(
    lines: &mut LineReader<BufReader<OwnedReadHalf>>,
    idle: Option<Duration>,
) -> io::Result<Option<Result<String, DecodeError>>> {
    match idle {
        Some(limit) => match tokio::time::timeout(limit, lines.next_line()).await {
            Ok(read) => read,
            Err(_) => Err(io::Error::new(io::ErrorKind::TimedOut, "idle timeout")),
        },
        None => lines.next_line().await,
    }
}

/// Advance the session state machine by one line
///
/// Only undecodable lines count as handshake failures. A well-formed
/// command that fails gets its error line and the session keeps waiting.
async fn handle_line<A: AccountStore>(
    dispatcher: &Dispatcher<A>,
    config: &ServerConfig,
    session_id: SessionId,
    state: SessionState,
    line: &str,
) -> SessionState {
    match state {
        SessionState::AwaitingHandshake { .. } => match codec::decode_handshake(line) {
            Ok(Handshake::Legacy { room_id, user_id }) => {
                match dispatcher.legacy_join(session_id, room_id, user_id).await {
                    Ok(()) => SessionState::Active(SessionMode::Legacy),
                    Err(e) => {
                        debug!("Legacy join for {} failed: {}", session_id, e);
                        reply(dispatcher, session_id, e.into()).await;
                        state
                    }
                }
            }
            Ok(Handshake::Command(cmd)) => match dispatcher.dispatch(session_id, &cmd).await {
                Ok(outcome) => finish(dispatcher, session_id, outcome, SessionMode::Command).await,
                Err(e) => {
                    debug!("First command from {} failed: {}", session_id, e);
                    reply(dispatcher, session_id, e.into()).await;
                    state
                }
            },
            Err(e) => reject(dispatcher, config, session_id, state, e).await,
        },
        SessionState::Active(SessionMode::Legacy) => {
            if let Err(e) = dispatcher.relay(session_id, line).await {
                debug!("Relay from {} failed: {}", session_id, e);
                reply(dispatcher, session_id, e.into()).await;
            }
            state
        }
        SessionState::Active(SessionMode::Command) => match codec::decode_command(line) {
            Ok(cmd) => match dispatcher.dispatch(session_id, &cmd).await {
                Ok(outcome) => finish(dispatcher, session_id, outcome, SessionMode::Command).await,
                Err(e) => {
                    debug!("Command from {} failed: {}", session_id, e);
                    reply(dispatcher, session_id, e.into()).await;
                    state
                }
            },
            Err(e) => reject(dispatcher, config, session_id, state, e).await,
        },
        SessionState::Closing => SessionState::Closing,
    }
}

/// Answer an undecodable line; counts against the handshake allowance
async fn reject<A: AccountStore>(
    dispatcher: &Dispatcher<A>,
    config: &ServerConfig,
    session_id: SessionId,
    state: SessionState,
    err: DecodeError,
) -> SessionState {
    reply(dispatcher, session_id, AppError::from(err.clone()).into()).await;
    match state {
        SessionState::AwaitingHandshake { failures } => {
            let failures = failures + 1;
            warn!("Handshake failure {} for {}: {}", failures, session_id, err);
            if failures >= config.max_handshake_failures {
                info!("Session {} exceeded handshake attempts", session_id);
                SessionState::Closing
            } else {
                SessionState::AwaitingHandshake { failures }
            }
        }
        other => {
            debug!("Undecodable line from {}: {}", session_id, err);
            other
        }
    }
}

/// Queue the outcome's reply and pick the next state
async fn finish<A: AccountStore>(
    dispatcher: &Dispatcher<A>,
    session_id: SessionId,
    outcome: Outcome,
    mode: SessionMode,
) -> SessionState {
    reply(dispatcher, session_id, outcome.reply).await;
    if outcome.close {
        SessionState::Closing
    } else {
        SessionState::Active(mode)
    }
}

async fn reply<A: AccountStore>(dispatcher: &Dispatcher<A>, session_id: SessionId, msg: ServerMessage) {
    if let Err(e) = dispatcher.sessions().send(session_id, msg).await {
        debug!("Reply to {} dropped: {}", session_id, e);
    }
}
