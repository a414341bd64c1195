//! Shared application state.
//!
//! DESIGN
//! ======
//! `AppState` is injected into Axum handlers via the `State` extractor. It
//! holds the entity store and the session manager: one explicitly-constructed
//! [`SessionState`] behind a `RwLock`, the single authority for connections,
//! room membership, card locks, version counters, and queued notifications.
//!
//! CONCURRENCY
//! ===========
//! Every inbound event takes the write guard once, runs its check-then-set
//! sequence, and broadcasts while still holding the guard. No session
//! invariant ever spans an `.await`, so lock grants and version advances are
//! atomic and per-entity event order matches processing order.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use tokio::sync::{RwLock, mpsc};
use uuid::Uuid;

use crate::protocol::{
    CursorPosition, Identity, Notification, Presence, RoomKey, ServerEvent, TypingTarget, now_ms,
};
use crate::store::EntityStore;

/// Outbound channel depth per connection. A client that falls this far
/// behind starts losing broadcasts (best effort, never blocks peers).
pub const CLIENT_CHANNEL_DEPTH: usize = 256;

/// Default cap on queued notifications per offline identity.
pub const DEFAULT_NOTIFY_QUEUE_CAP: usize = 50;

/// Cursor colors assigned round-robin-by-chance at connect time.
pub const CURSOR_COLORS: &[&str] =
    &["#e6194b", "#3cb44b", "#ffe119", "#4363d8", "#f58231", "#911eb4", "#46f0f0", "#f032e6"];

// =============================================================================
// CONNECTION
// =============================================================================

/// Ephemeral per-connection session state. Created on connect, destroyed by
/// the disconnect cascade.
#[derive(Debug, Clone)]
pub struct Connection {
    pub id: Uuid,
    /// Sender half of the connection's outbound event channel.
    pub tx: mpsc::Sender<ServerEvent>,
    /// Bound identity. `None` until the client joins a board.
    pub user: Option<Identity>,
    /// Server-assigned cursor color.
    pub color: String,
    pub rooms: HashSet<RoomKey>,
    pub presence: Presence,
    /// Milliseconds since Unix epoch.
    pub last_seen: i64,
    pub cursor: Option<CursorPosition>,
    pub typing: Option<TypingTarget>,
    /// Card ids currently locked by this connection.
    pub locks: HashSet<String>,
}

// =============================================================================
// CARD LOCK
// =============================================================================

/// An active advisory lock. At most one per card id at any time.
#[derive(Debug, Clone)]
pub struct CardLock {
    pub card_id: String,
    pub holder: Uuid,
    pub locked_by: Identity,
    /// Board rooms the holder was joined to at acquisition time. Used to
    /// scope lock cleanup on board-leave.
    pub rooms: HashSet<RoomKey>,
    pub acquired_at: i64,
}

// =============================================================================
// SESSION STATE
// =============================================================================

/// The session manager's maps. Single-process authority: exclusively owned
/// by this process, no external synchronization.
pub struct SessionState {
    pub connections: HashMap<Uuid, Connection>,
    pub locks: HashMap<String, CardLock>,
    pub card_versions: HashMap<String, i64>,
    pub comment_versions: HashMap<String, i64>,
    /// Queued notifications per offline identity, newest first.
    pub pending_notifications: HashMap<String, VecDeque<Notification>>,
    pub notify_queue_cap: usize,
}

impl SessionState {
    #[must_use]
    pub fn new(notify_queue_cap: usize) -> Self {
        Self {
            connections: HashMap::new(),
            locks: HashMap::new(),
            card_versions: HashMap::new(),
            comment_versions: HashMap::new(),
            pending_notifications: HashMap::new(),
            notify_queue_cap,
        }
    }

    /// Register a new connection with default session state.
    pub fn register(&mut self, conn_id: Uuid, tx: mpsc::Sender<ServerEvent>) -> &Connection {
        let color = CURSOR_COLORS[rand::random_range(0..CURSOR_COLORS.len())].to_string();
        self.connections.entry(conn_id).or_insert(Connection {
            id: conn_id,
            tx,
            user: None,
            color,
            rooms: HashSet::new(),
            presence: Presence::Online,
            last_seen: now_ms(),
            cursor: None,
            typing: None,
            locks: HashSet::new(),
        })
    }

    #[must_use]
    pub fn get(&self, conn_id: Uuid) -> Option<&Connection> {
        self.connections.get(&conn_id)
    }

    pub fn get_mut(&mut self, conn_id: Uuid) -> Option<&mut Connection> {
        self.connections.get_mut(&conn_id)
    }
}

impl Default for SessionState {
    fn default() -> Self {
        Self::new(DEFAULT_NOTIFY_QUEUE_CAP)
    }
}

// =============================================================================
// APP STATE
// =============================================================================

/// Shared application state, injected into Axum handlers via State extractor.
/// Clone is required by Axum — all inner fields are Arc-wrapped.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn EntityStore>,
    pub sessions: Arc<RwLock<SessionState>>,
}

impl AppState {
    #[must_use]
    pub fn new(store: Arc<dyn EntityStore>, notify_queue_cap: usize) -> Self {
        Self { store, sessions: Arc::new(RwLock::new(SessionState::new(notify_queue_cap))) }
    }
}

// =============================================================================
// TEST HELPERS
// =============================================================================


#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn register_creates_default_session_state() {
        let mut sessions = SessionState::default();
        let (tx, _rx) = mpsc::channel(8);
        let conn_id = Uuid::new_v4();
        let conn = sessions.register(conn_id, tx);

        assert_eq!(conn.presence, Presence::Online);
        assert!(conn.user.is_none());
        assert!(conn.rooms.is_empty());
        assert!(conn.locks.is_empty());
        assert!(conn.typing.is_none());
        assert!(CURSOR_COLORS.contains(&conn.color.as_str()));
        assert!(conn.last_seen > 0);
    }

    #[tokio::test]
    async fn register_is_idempotent_per_connection_id() {
        let mut sessions = SessionState::default();
        let conn_id = Uuid::new_v4();
        let (tx, _rx) = mpsc::channel(8);
        sessions.register(conn_id, tx.clone());
        sessions.get_mut(conn_id).unwrap().presence = Presence::Away;

        // Re-registering the same id must not reset existing state.
        sessions.register(conn_id, tx);
        assert_eq!(sessions.get(conn_id).unwrap().presence, Presence::Away);
        assert_eq!(sessions.connections.len(), 1);
    }

    #[test]
    fn session_state_starts_empty() {
        let sessions = SessionState::default();
        assert!(sessions.connections.is_empty());
        assert!(sessions.locks.is_empty());
        assert!(sessions.card_versions.is_empty());
        assert!(sessions.comment_versions.is_empty());
        assert_eq!(sessions.notify_queue_cap, DEFAULT_NOTIFY_QUEUE_CAP);
    }
}
