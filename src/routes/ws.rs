//! WebSocket handler — bidirectional event relay.
//!
//! DESIGN
//! ======
//! On upgrade, generates a connection ID and enters a `select!` loop:
//! - Incoming client events → parse into `ClientEvent` + dispatch
//! - Broadcast events from peers → forward to the client
//!
//! Each dispatch arm takes the session write guard exactly once, runs its
//! check-then-set sequence and peer broadcasts under that guard, and only
//! then (guard dropped) persists through the entity store. A store failure
//! is reported to the sender alone; the in-memory commit and the broadcasts
//! already happened and are not rolled back.
//!
//! LIFECYCLE
//! =========
//! 1. Upgrade → register connection, send `connected`
//! 2. Client sends events → dispatch → replies to sender, broadcasts to peers
//! 3. Close / error / EOF → disconnect cascade (exactly once)

use std::collections::HashSet;

use axum::extract::State;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::response::Response;
use tokio::sync::mpsc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::protocol::{
    ClientEvent, EntityKind, ErrorCode, Identity, RoomKey, ServerEvent, VersionRecord,
};
use crate::services::{fanout, locks, presence, rooms, versions};
use crate::state::{AppState, CLIENT_CHANNEL_DEPTH, SessionState};

// =============================================================================
// ERRORS
// =============================================================================

#[derive(Debug, thiserror::Error)]
enum WsError {
    #[error("invalid event: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("an identity must be bound before this operation (join a board first)")]
    IdentityRequired,
    #[error("connection not registered: {0}")]
    UnknownConnection(Uuid),
}

impl ErrorCode for WsError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::Malformed(_) => "E_MALFORMED",
            Self::IdentityRequired => "E_IDENTITY_REQUIRED",
            Self::UnknownConnection(_) => "E_NO_CONNECTION",
        }
    }
}

// =============================================================================
// UPGRADE / CONNECTION
// =============================================================================

pub async fn handle_ws(State(state): State<AppState>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| run_ws(socket, state))
}

async fn run_ws(mut socket: WebSocket, state: AppState) {
    let conn_id = Uuid::new_v4();

    // Per-connection channel for receiving broadcast events from peers.
    let (tx, mut rx) = mpsc::channel::<ServerEvent>(CLIENT_CHANNEL_DEPTH);

    let color = {
        let mut sessions = state.sessions.write().await;
        sessions.register(conn_id, tx).color.clone()
    };

    let welcome = ServerEvent::Connected { connection_id: conn_id, color };
    if send_event(&mut socket, &welcome).await.is_err() {
        presence::disconnect(&mut *state.sessions.write().await, conn_id);
        return;
    }
    info!(%conn_id, "ws: client connected");

    'session: loop {
        tokio::select! {
            msg = socket.recv() => {
                let Some(Ok(msg)) = msg else { break };
                match msg {
                    Message::Text(text) => {
                        for event in process_client_text(&state, conn_id, &text).await {
                            if send_event(&mut socket, &event).await.is_err() {
                                break 'session;
                            }
                        }
                    }
                    Message::Close(_) => break,
                    _ => {}
                }
            }
            Some(event) = rx.recv() => {
                if send_event(&mut socket, &event).await.is_err() {
                    break;
                }
            }
        }
    }

    presence::disconnect(&mut *state.sessions.write().await, conn_id);
    info!(%conn_id, "ws: client disconnected");
}

async fn send_event(socket: &mut WebSocket, event: &ServerEvent) -> Result<(), ()> {
    let json = match serde_json::to_string(event) {
        Ok(j) => j,
        Err(e) => {
            warn!(error = %e, "ws: failed to serialize event");
            return Err(());
        }
    };
    socket.send(Message::Text(json.into())).await.map_err(|_| ())
}

// =============================================================================
// DISPATCH
// =============================================================================

/// Parse one inbound text message and process it. Returns events addressed
/// to the sender; peer broadcasts have already been delivered.
pub(crate) async fn process_client_text(state: &AppState, conn_id: Uuid, text: &str) -> Vec<ServerEvent> {
    let event: ClientEvent = match serde_json::from_str(text) {
        Ok(event) => event,
        Err(e) => {
            warn!(%conn_id, error = %e, "ws: invalid inbound event");
            return vec![ServerEvent::error_from(&WsError::Malformed(e))];
        }
    };
    process_client_event(state, conn_id, event).await
}

/// Process one validated client event.
pub(crate) async fn process_client_event(
    state: &AppState,
    conn_id: Uuid,
    event: ClientEvent,
) -> Vec<ServerEvent> {
    match event {
        ClientEvent::JoinRoom { room } => {
            let mut sessions = state.sessions.write().await;
            match rooms::join(&mut sessions, conn_id, &room) {
                Ok(members) => vec![ServerEvent::RoomMembers { room, members }],
                Err(e) => vec![ServerEvent::error_from(&e)],
            }
        }
        ClientEvent::LeaveRoom { room } => {
            let mut sessions = state.sessions.write().await;
            match rooms::leave(&mut sessions, conn_id, &room) {
                Ok(()) => vec![],
                Err(e) => vec![ServerEvent::error_from(&e)],
            }
        }
        ClientEvent::JoinBoard { board_id, user } => {
            let mut sessions = state.sessions.write().await;
            match rooms::join_board(&mut sessions, conn_id, &board_id, user) {
                Ok(members) => vec![ServerEvent::RoomMembers { room: RoomKey::board(&board_id), members }],
                Err(e) => vec![ServerEvent::error_from(&e)],
            }
        }
        ClientEvent::LeaveBoard { board_id } => {
            let mut sessions = state.sessions.write().await;
            match rooms::leave_board(&mut sessions, conn_id, &board_id) {
                Ok(()) => vec![],
                Err(e) => vec![ServerEvent::error_from(&e)],
            }
        }
        ClientEvent::UpdatePresence { status } => {
            presence::update_presence(&mut *state.sessions.write().await, conn_id, status);
            vec![]
        }
        ClientEvent::SendCursorPosition { x, y, board, element } => {
            let cursor = crate::protocol::CursorPosition { x, y, board, element };
            presence::update_cursor(&mut *state.sessions.write().await, conn_id, cursor);
            vec![]
        }
        ClientEvent::RequestCardLock { card_id } => handle_lock_request(state, conn_id, &card_id).await,
        ClientEvent::ReleaseCardLock { card_id } => {
            let mut sessions = state.sessions.write().await;
            let Some(lock) = locks::release(&mut sessions, conn_id, &card_id) else {
                // Not the holder (or not locked): no-op by design.
                return vec![];
            };
            let unlock = ServerEvent::CardUnlock { card_id: lock.card_id, connection_id: conn_id };
            let audience = sender_rooms(&sessions, conn_id);
            fanout::to_rooms(&sessions, &audience, &unlock, Some(conn_id));
            vec![unlock]
        }
        ClientEvent::UpdateCard { card_id, field, value, version } => {
            let applied = {
                let mut sessions = state.sessions.write().await;
                apply_edit(
                    &mut sessions,
                    conn_id,
                    EntityKind::Card,
                    &card_id,
                    version,
                    |edited_by, new_version| ServerEvent::CardEdit {
                        card_id: card_id.clone(),
                        field: field.clone(),
                        value: value.clone(),
                        version: new_version,
                        edited_by,
                    },
                )
            };
            match applied {
                Ok(Applied::Accepted { event, new_version }) => {
                    let mut replies = vec![event];
                    if let Err(e) = state.store.update_card_field(&card_id, &field, &value, new_version).await {
                        warn!(%conn_id, %card_id, error = %e, "ws: card persist failed");
                        replies.push(ServerEvent::error_from(&e));
                    }
                    replies
                }
                Ok(Applied::Conflict(event)) => vec![event],
                Err(e) => vec![ServerEvent::error_from(&e)],
            }
        }
        ClientEvent::MoveCard { card_id, from_column, to_column, position } => {
            let broadcast = {
                let mut sessions = state.sessions.write().await;
                let user = match bound_identity(&sessions, conn_id) {
                    Ok(user) => user,
                    Err(e) => return vec![ServerEvent::error_from(&e)],
                };
                touch(&mut sessions, conn_id);
                let event = ServerEvent::CardMove {
                    card_id: card_id.clone(),
                    from_column,
                    to_column: to_column.clone(),
                    position,
                    moved_by: user,
                };
                let audience = sender_rooms(&sessions, conn_id);
                fanout::to_rooms(&sessions, &audience, &event, Some(conn_id));
                event
            };
            let mut replies = vec![broadcast];
            if let Err(e) = state.store.move_card(&card_id, &to_column, position).await {
                warn!(%conn_id, %card_id, error = %e, "ws: card move persist failed");
                replies.push(ServerEvent::error_from(&e));
            }
            replies
        }
        ClientEvent::StartTyping { card_id, comment_id } => {
            let target = crate::protocol::TypingTarget { card_id, comment_id };
            presence::set_typing(&mut *state.sessions.write().await, conn_id, Some(target));
            vec![]
        }
        ClientEvent::StopTyping { .. } => {
            presence::set_typing(&mut *state.sessions.write().await, conn_id, None);
            vec![]
        }
        ClientEvent::UpdateComment { comment_id, content, version } => {
            let applied = {
                let mut sessions = state.sessions.write().await;
                apply_edit(
                    &mut sessions,
                    conn_id,
                    EntityKind::Comment,
                    &comment_id,
                    version,
                    |edited_by, new_version| ServerEvent::LiveCommentUpdate {
                        comment_id: comment_id.clone(),
                        content: content.clone(),
                        version: new_version,
                        edited_by,
                    },
                )
            };
            match applied {
                Ok(Applied::Accepted { event, new_version }) => {
                    let mut replies = vec![event];
                    if let Err(e) = state.store.update_comment(&comment_id, &content, new_version).await {
                        warn!(%conn_id, %comment_id, error = %e, "ws: comment persist failed");
                        replies.push(ServerEvent::error_from(&e));
                    }
                    replies
                }
                Ok(Applied::Conflict(event)) => vec![event],
                Err(e) => vec![ServerEvent::error_from(&e)],
            }
        }
        ClientEvent::DeleteComment { comment_id } => {
            let broadcast = {
                let sessions = state.sessions.write().await;
                let user = match bound_identity(&sessions, conn_id) {
                    Ok(user) => user,
                    Err(e) => return vec![ServerEvent::error_from(&e)],
                };
                let event = ServerEvent::CommentDeleted { comment_id: comment_id.clone(), deleted_by: user };
                let audience = sender_rooms(&sessions, conn_id);
                fanout::to_rooms(&sessions, &audience, &event, Some(conn_id));
                event
            };
            let mut replies = vec![broadcast];
            if let Err(e) = state.store.delete_comment(&comment_id).await {
                warn!(%conn_id, %comment_id, error = %e, "ws: comment delete persist failed");
                replies.push(ServerEvent::error_from(&e));
            }
            replies
        }
        ClientEvent::SubmitConflictResolution { entity_type, entity_id, resolved_version } => {
            let mut sessions = state.sessions.write().await;
            let user = match bound_identity(&sessions, conn_id) {
                Ok(user) => user,
                Err(e) => return vec![ServerEvent::error_from(&e)],
            };
            let version = versions::force_set(&mut sessions, entity_type, &entity_id, resolved_version);
            info!(%conn_id, %entity_id, version, "ws: conflict resolved");
            let event = ServerEvent::ConflictResolved { entity_type, entity_id, version, resolved_by: user };
            let audience = sender_rooms(&sessions, conn_id);
            fanout::to_rooms(&sessions, &audience, &event, Some(conn_id));
            vec![event]
        }
    }
}

// =============================================================================
// LOCKING
// =============================================================================

async fn handle_lock_request(state: &AppState, conn_id: Uuid, card_id: &str) -> Vec<ServerEvent> {
    let mut sessions = state.sessions.write().await;
    match locks::acquire(&mut sessions, conn_id, card_id) {
        Ok(locks::Acquire::Granted(lock)) => {
            let event = ServerEvent::CardLock { card_id: card_id.to_string(), granted: true, lock };
            let audience = sender_rooms(&sessions, conn_id);
            fanout::to_rooms(&sessions, &audience, &event, Some(conn_id));
            vec![event]
        }
        Ok(locks::Acquire::AlreadyHeld(lock)) => {
            // Idempotent success; peers already know.
            vec![ServerEvent::CardLock { card_id: card_id.to_string(), granted: true, lock }]
        }
        Ok(locks::Acquire::Denied(lock)) => {
            info!(%conn_id, card_id, holder = %lock.connection_id, "ws: lock denied");
            vec![ServerEvent::CardLock { card_id: card_id.to_string(), granted: false, lock }]
        }
        Err(e) => vec![ServerEvent::error_from(&e)],
    }
}

// =============================================================================
// EDITS
// =============================================================================

enum Applied {
    Accepted { event: ServerEvent, new_version: i64 },
    Conflict(ServerEvent),
}

/// Run one optimistic edit: identity gate, version advance, and broadcast.
/// On acceptance the built event goes to the sender's rooms; on rejection a
/// `conflictDetected` event goes to the same audience and the write is
/// dropped.
fn apply_edit(
    sessions: &mut SessionState,
    conn_id: Uuid,
    kind: EntityKind,
    entity_id: &str,
    claimed_version: i64,
    build: impl FnOnce(Identity, i64) -> ServerEvent,
) -> Result<Applied, WsError> {
    let user = bound_identity(sessions, conn_id)?;
    touch(sessions, conn_id);

    match versions::try_advance(sessions, kind, entity_id, claimed_version) {
        versions::Advance::Accepted { new_version } => {
            let event = build(user, new_version);
            let audience = sender_rooms(sessions, conn_id);
            fanout::to_rooms(sessions, &audience, &event, Some(conn_id));
            Ok(Applied::Accepted { event, new_version })
        }
        versions::Advance::Rejected { current } => {
            // Attribute the authoritative version to the lock holder when
            // the entity is a locked card; otherwise it is anonymous.
            let current_holder = sessions
                .locks
                .get(entity_id)
                .map(|l| l.locked_by.identity_id.clone());
            warn!(%conn_id, entity_id, claimed_version, current, "ws: stale write rejected");
            let event = ServerEvent::ConflictDetected {
                entity_type: kind,
                entity_id: entity_id.to_string(),
                current: VersionRecord { version: current, identity_id: current_holder },
                incoming: VersionRecord { version: claimed_version, identity_id: Some(user.identity_id) },
            };
            let audience = sender_rooms(sessions, conn_id);
            fanout::to_rooms(sessions, &audience, &event, Some(conn_id));
            Ok(Applied::Conflict(event))
        }
    }
}

// =============================================================================
// HELPERS
// =============================================================================

fn bound_identity(sessions: &SessionState, conn_id: Uuid) -> Result<Identity, WsError> {
    let conn = sessions
        .get(conn_id)
        .ok_or(WsError::UnknownConnection(conn_id))?;
    conn.user.clone().ok_or(WsError::IdentityRequired)
}

fn sender_rooms(sessions: &SessionState, conn_id: Uuid) -> HashSet<RoomKey> {
    sessions.get(conn_id).map(|c| c.rooms.clone()).unwrap_or_default()
}

fn touch(sessions: &mut SessionState, conn_id: Uuid) {
    if let Some(conn) = sessions.get_mut(conn_id) {
        conn.last_seen = crate::protocol::now_ms();
    }
}

#[cfg(test)]
#[path = "ws_test.rs"]
mod tests;
