//! Room membership — join/leave semantics for broadcast groups.
//!
//! DESIGN
//! ======
//! No Room object is materialized: membership is the set of connections
//! whose room set contains the key, and member lists are projections over
//! connection state. Joining is idempotent. A newcomer receives the list of
//! existing participants; everyone else receives `userJoined` exactly once.
//! Board joins additionally bind the client's identity to the connection and
//! flush any notifications queued while the identity was offline.

use tracing::info;
use uuid::Uuid;

use crate::protocol::{ErrorCode, Identity, RoomKey, RoomMember, ServerEvent, now_ms};
use crate::services::{fanout, locks};
use crate::state::SessionState;

#[derive(Debug, thiserror::Error)]
pub enum RoomError {
    #[error("connection not registered: {0}")]
    UnknownConnection(Uuid),
}

impl ErrorCode for RoomError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::UnknownConnection(_) => "E_NO_CONNECTION",
        }
    }
}

/// Current members of a room.
#[must_use]
pub fn members_of(sessions: &SessionState, room: &RoomKey) -> Vec<RoomMember> {
    sessions
        .connections
        .values()
        .filter(|c| c.rooms.contains(room))
        .map(|c| RoomMember { connection_id: c.id, user: c.user.clone(), presence: c.presence })
        .collect()
}

// =============================================================================
// JOIN / LEAVE
// =============================================================================

/// Add a connection to a room. Returns the participants that were already
/// present (the newcomer's seed view). Idempotent: a repeated join returns
/// the same view and notifies no one.
///
/// # Errors
///
/// Returns `UnknownConnection` if the connection is not registered.
pub fn join(sessions: &mut SessionState, conn_id: Uuid, room: &RoomKey) -> Result<Vec<RoomMember>, RoomError> {
    let conn = sessions
        .connections
        .get(&conn_id)
        .ok_or(RoomError::UnknownConnection(conn_id))?;

    if conn.rooms.contains(room) {
        let mut members = members_of(sessions, room);
        members.retain(|m| m.connection_id != conn_id);
        return Ok(members);
    }

    let existing = members_of(sessions, room);
    let user = conn.user.clone();

    if let Some(conn) = sessions.connections.get_mut(&conn_id) {
        conn.rooms.insert(room.clone());
    }
    info!(%conn_id, %room, members = existing.len() + 1, "room: join");

    let joined = ServerEvent::UserJoined { room: room.clone(), connection_id: conn_id, user };
    fanout::to_room(sessions, room, &joined, Some(conn_id));

    Ok(existing)
}

/// Remove a connection from a room. Notifies the remaining members and
/// releases any locks the connection acquired under that room, broadcasting
/// each unlock. Leaving a room never joined is a no-op.
///
/// # Errors
///
/// Returns `UnknownConnection` if the connection is not registered.
pub fn leave(sessions: &mut SessionState, conn_id: Uuid, room: &RoomKey) -> Result<(), RoomError> {
    let conn = sessions
        .connections
        .get_mut(&conn_id)
        .ok_or(RoomError::UnknownConnection(conn_id))?;

    if !conn.rooms.remove(room) {
        return Ok(());
    }
    let user = conn.user.clone();
    info!(%conn_id, %room, "room: leave");

    let left = ServerEvent::UserLeft { room: room.clone(), connection_id: conn_id, user };
    fanout::to_room(sessions, room, &left, Some(conn_id));

    // Locks scoped to the departed room are forcibly released; the departed
    // room and the holder's remaining rooms all hear the unlock.
    let mut audience = sessions
        .connections
        .get(&conn_id)
        .map(|c| c.rooms.clone())
        .unwrap_or_default();
    audience.insert(room.clone());
    for lock in locks::release_all(sessions, conn_id, Some(room)) {
        let unlock = ServerEvent::CardUnlock { card_id: lock.card_id, connection_id: conn_id };
        fanout::to_rooms(sessions, &audience, &unlock, Some(conn_id));
    }
    Ok(())
}

// =============================================================================
// BOARD JOIN / LEAVE
// =============================================================================

/// Join a board: binds the identity to the connection, enters the board room
/// and the global system room, and flushes notifications queued for the
/// identity while it was offline. Returns the board room's existing members.
///
/// # Errors
///
/// Returns `UnknownConnection` if the connection is not registered.
pub fn join_board(
    sessions: &mut SessionState,
    conn_id: Uuid,
    board_id: &str,
    user: Identity,
) -> Result<Vec<RoomMember>, RoomError> {
    let identity_id = user.identity_id.clone();
    {
        let conn = sessions
            .connections
            .get_mut(&conn_id)
            .ok_or(RoomError::UnknownConnection(conn_id))?;
        conn.user = Some(user);
        conn.last_seen = now_ms();
    }

    join(sessions, conn_id, &RoomKey::global())?;
    let members = join(sessions, conn_id, &RoomKey::board(board_id))?;

    let queued = fanout::drain_pending(sessions, &identity_id);
    if !queued.is_empty() {
        info!(%conn_id, identity = %identity_id, count = queued.len(), "room: delivering queued notifications");
    }
    if let Some(conn) = sessions.connections.get(&conn_id) {
        for notification in queued {
            fanout::send(conn, &ServerEvent::PushNotification { notification });
        }
    }

    Ok(members)
}

/// Leave a board room, with the usual lock cleanup.
///
/// # Errors
///
/// Returns `UnknownConnection` if the connection is not registered.
pub fn leave_board(sessions: &mut SessionState, conn_id: Uuid, board_id: &str) -> Result<(), RoomError> {
    leave(sessions, conn_id, &RoomKey::board(board_id))
}

#[cfg(test)]
#[path = "rooms_test.rs"]
mod tests;
