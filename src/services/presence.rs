//! Session lifecycle — presence, cursors, typing, disconnect cascade.
//!
//! DESIGN
//! ======
//! Presence transitions are explicit (`updatePresence`) except for offline,
//! which is implied by disconnect. Cursor positions are purely ephemeral:
//! broadcast to board peers and remembered only as "latest seen" on the
//! connection. Typing state is trusted to the client; there is no
//! server-side timeout that auto-clears it.
//!
//! The disconnect cascade runs exactly once per connection: it is guarded by
//! removing the registry entry first, so a duplicate disconnect signal finds
//! nothing to clean up.

use std::collections::HashSet;

use tracing::info;
use uuid::Uuid;

use crate::protocol::{CursorPosition, Presence, RoomKey, ServerEvent, TypingTarget, now_ms};
use crate::services::{fanout, locks};
use crate::state::SessionState;

// =============================================================================
// PRESENCE
// =============================================================================

/// Apply an explicit presence change and broadcast it to every room the
/// connection belongs to. Unknown connections are ignored.
pub fn update_presence(sessions: &mut SessionState, conn_id: Uuid, status: Presence) {
    let Some(conn) = sessions.connections.get_mut(&conn_id) else {
        return;
    };
    conn.presence = status;
    conn.last_seen = now_ms();
    let event = ServerEvent::UserPresence {
        connection_id: conn_id,
        user: conn.user.clone(),
        status,
        last_seen: conn.last_seen,
    };
    let rooms = conn.rooms.clone();

    fanout::to_rooms(sessions, &rooms, &event, Some(conn_id));
}

// =============================================================================
// CURSOR
// =============================================================================

/// Record and re-broadcast a cursor position. Anchored cursors go to their
/// board room, but only if the sender has actually joined it; unanchored
/// ones go to every board room the connection has joined. Cursor moves
/// before any join are recorded on the connection and broadcast nowhere.
pub fn update_cursor(sessions: &mut SessionState, conn_id: Uuid, cursor: CursorPosition) {
    let Some(conn) = sessions.connections.get_mut(&conn_id) else {
        return;
    };

    let rooms: HashSet<RoomKey> = match &cursor.board {
        Some(board_id) => std::iter::once(RoomKey::board(board_id))
            .filter(|r| conn.rooms.contains(r))
            .collect(),
        None => conn.rooms.iter().filter(|r| r.is_board()).cloned().collect(),
    };

    let event = ServerEvent::UserCursor {
        connection_id: conn_id,
        user: conn.user.clone(),
        color: conn.color.clone(),
        x: cursor.x,
        y: cursor.y,
        board: cursor.board.clone(),
        element: cursor.element.clone(),
    };
    conn.cursor = Some(cursor);
    conn.last_seen = now_ms();

    fanout::to_rooms(sessions, &rooms, &event, Some(conn_id));
}

// =============================================================================
// TYPING
// =============================================================================

/// Set or clear the typing target and broadcast the boolean typing state to
/// all the connection's rooms.
pub fn set_typing(sessions: &mut SessionState, conn_id: Uuid, target: Option<TypingTarget>) {
    let Some(conn) = sessions.connections.get_mut(&conn_id) else {
        return;
    };

    let is_typing = target.is_some();
    let (card_id, comment_id) = target
        .as_ref()
        .map_or((None, None), |t| (t.card_id.clone(), t.comment_id.clone()));
    conn.typing = target;

    let event = ServerEvent::UserTyping {
        connection_id: conn_id,
        user: conn.user.clone(),
        is_typing,
        card_id,
        comment_id,
    };
    let rooms = conn.rooms.clone();

    fanout::to_rooms(sessions, &rooms, &event, Some(conn_id));
}

// =============================================================================
// DISCONNECT CASCADE
// =============================================================================

/// Run the full disconnect cleanup. Safe to call more than once: only the
/// call that actually removes the registry entry performs any work.
///
/// Cascade: stop-typing broadcast if mid-typing, release every held lock
/// (with unlock broadcasts), then `userLeft` + `userPresence(offline)` to
/// each room the connection belonged to.
pub fn disconnect(sessions: &mut SessionState, conn_id: Uuid) {
    let Some(mut conn) = sessions.connections.remove(&conn_id) else {
        return;
    };
    conn.presence = Presence::Offline;
    conn.last_seen = now_ms();
    info!(%conn_id, rooms = conn.rooms.len(), locks = conn.locks.len(), "session: disconnect cascade");

    if let Some(target) = conn.typing.take() {
        let stopped = ServerEvent::UserTyping {
            connection_id: conn_id,
            user: conn.user.clone(),
            is_typing: false,
            card_id: target.card_id,
            comment_id: target.comment_id,
        };
        fanout::to_rooms(sessions, &conn.rooms, &stopped, None);
    }

    for lock in locks::release_all(sessions, conn_id, None) {
        let unlock = ServerEvent::CardUnlock { card_id: lock.card_id, connection_id: conn_id };
        fanout::to_rooms(sessions, &conn.rooms, &unlock, None);
    }

    for room in &conn.rooms {
        let left = ServerEvent::UserLeft {
            room: room.clone(),
            connection_id: conn_id,
            user: conn.user.clone(),
        };
        fanout::to_room(sessions, room, &left, None);
    }

    let offline = ServerEvent::UserPresence {
        connection_id: conn_id,
        user: conn.user.clone(),
        status: Presence::Offline,
        last_seen: conn.last_seen,
    };
    fanout::to_rooms(sessions, &conn.rooms, &offline, None);
}

#[cfg(test)]
#[path = "presence_test.rs"]
mod tests;
