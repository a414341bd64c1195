//! Fan-out — event delivery to rooms, identities, or everyone.
//!
//! DESIGN
//! ======
//! Rooms are a projection over connection membership sets, so room delivery
//! is a scan over live connections. Delivery is `try_send` best-effort: a
//! client whose channel is full is skipped and never blocks anyone else.
//! Targeted notifications fall back to a bounded per-identity queue
//! (newest first, oldest evicted) when the identity has no live connection.

use std::collections::VecDeque;

use tracing::debug;
use uuid::Uuid;

use crate::protocol::{Notification, RoomKey, ServerEvent};
use crate::state::{Connection, SessionState};

/// Deliver one event to one connection. Best-effort: a full channel drops
/// the event for that client only.
pub fn send(conn: &Connection, event: &ServerEvent) {
    if conn.tx.try_send(event.clone()).is_err() {
        debug!(conn_id = %conn.id, "fanout: client channel full, event dropped");
    }
}

/// Deliver an event to every live member of a room, optionally excluding one
/// connection (typically the originator).
pub fn to_room(sessions: &SessionState, room: &RoomKey, event: &ServerEvent, exclude: Option<Uuid>) {
    for conn in sessions.connections.values() {
        if exclude == Some(conn.id) || !conn.rooms.contains(room) {
            continue;
        }
        send(conn, event);
    }
}

/// Deliver an event once to every live connection that shares at least one
/// of the given rooms. Used for events without a room field (presence,
/// unlock, typing) so a peer sharing several rooms gets a single copy.
pub fn to_rooms(
    sessions: &SessionState,
    rooms: &std::collections::HashSet<RoomKey>,
    event: &ServerEvent,
    exclude: Option<Uuid>,
) {
    for conn in sessions.connections.values() {
        if exclude == Some(conn.id) || conn.rooms.is_disjoint(rooms) {
            continue;
        }
        send(conn, event);
    }
}

/// Deliver an event to every live connection regardless of room.
pub fn to_all(sessions: &SessionState, event: &ServerEvent, exclude: Option<Uuid>) {
    for conn in sessions.connections.values() {
        if exclude == Some(conn.id) {
            continue;
        }
        send(conn, event);
    }
}

/// Deliver an event to every live connection bound to an identity. An
/// identity with several tabs open gets one copy per connection. Returns the
/// number of connections reached.
pub fn to_identity(sessions: &SessionState, identity_id: &str, event: &ServerEvent) -> usize {
    let mut delivered = 0;
    for conn in sessions.connections.values() {
        let bound = conn
            .user
            .as_ref()
            .is_some_and(|u| u.identity_id == identity_id);
        if bound {
            send(conn, event);
            delivered += 1;
        }
    }
    delivered
}

/// Route a push notification. Targeted notifications go to the identity's
/// live connections, or into its bounded queue if none are live. Untargeted
/// notifications broadcast to everyone as a system notification.
pub fn notify(sessions: &mut SessionState, notification: Notification) {
    let Some(identity_id) = notification.target_identity.clone() else {
        let event = ServerEvent::SystemNotification { notification };
        to_all(sessions, &event, None);
        return;
    };

    let event = ServerEvent::PushNotification { notification: notification.clone() };
    if to_identity(sessions, &identity_id, &event) > 0 {
        return;
    }

    // No live connection: queue newest-first, evict oldest past the cap.
    let cap = sessions.notify_queue_cap;
    let queue = sessions
        .pending_notifications
        .entry(identity_id)
        .or_insert_with(VecDeque::new);
    queue.push_front(notification);
    queue.truncate(cap);
}

/// Take every queued notification for an identity, newest first. Called when
/// the identity binds to a connection.
pub fn drain_pending(sessions: &mut SessionState, identity_id: &str) -> Vec<Notification> {
    sessions
        .pending_notifications
        .remove(identity_id)
        .map(Vec::from)
        .unwrap_or_default()
}

#[cfg(test)]
#[path = "fanout_test.rs"]
mod tests;
