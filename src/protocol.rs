//! Protocol — the typed event contract for `OpsBoard`.
//!
//! ARCHITECTURE
//! ============
//! Every message between client and server is a named event with a JSON
//! payload: `{"event": "...", "data": {...}}`. Inbound payloads deserialize
//! into [`ClientEvent`] before they reach any session logic, so malformed
//! requests are rejected at the edge and handlers only ever see validated,
//! strongly-typed data. Outbound traffic is a [`ServerEvent`] serialized the
//! same way.
//!
//! DESIGN
//! ======
//! - Room keys are a validated newtype, not bare strings.
//! - The WS handler routes on the event name and never inspects raw JSON.
//! - Entity and identity ids are opaque strings; connection ids are UUIDs
//!   minted by the server.

use std::collections::HashMap;
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Current time as milliseconds since Unix epoch.
#[must_use]
pub fn now_ms() -> i64 {
    let Ok(dur) = SystemTime::now().duration_since(UNIX_EPOCH) else {
        return 0;
    };
    i64::try_from(dur.as_millis()).unwrap_or(0)
}

// =============================================================================
// ERROR CODES
// =============================================================================

/// Grepable error code and retryable flag for structured error events.
pub trait ErrorCode: std::fmt::Display {
    fn error_code(&self) -> &'static str;

    fn retryable(&self) -> bool {
        false
    }
}

// =============================================================================
// ROOM KEYS
// =============================================================================

/// A named broadcast scope. Valid forms: `global`, `board:<id>`,
/// `agent:<id>`, `mission:<id>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RoomKey(String);

#[derive(Debug, thiserror::Error)]
#[error("invalid room key: {0}")]
pub struct InvalidRoomKey(pub String);

impl ErrorCode for InvalidRoomKey {
    fn error_code(&self) -> &'static str {
        "E_INVALID_ROOM"
    }
}

impl RoomKey {
    /// The system-wide room every identified connection belongs to.
    #[must_use]
    pub fn global() -> Self {
        Self("global".into())
    }

    #[must_use]
    pub fn board(board_id: &str) -> Self {
        Self(format!("board:{board_id}"))
    }

    #[must_use]
    pub fn agent(agent_id: &str) -> Self {
        Self(format!("agent:{agent_id}"))
    }

    #[must_use]
    pub fn mission(mission_id: &str) -> Self {
        Self(format!("mission:{mission_id}"))
    }

    /// Parse and validate a raw room key.
    ///
    /// # Errors
    ///
    /// Returns `InvalidRoomKey` if the key is not one of the recognized
    /// forms or has an empty id segment.
    pub fn parse(raw: &str) -> Result<Self, InvalidRoomKey> {
        if raw == "global" {
            return Ok(Self::global());
        }
        match raw.split_once(':') {
            Some(("board" | "agent" | "mission", id)) if !id.is_empty() => Ok(Self(raw.to_string())),
            _ => Err(InvalidRoomKey(raw.to_string())),
        }
    }

    /// True for `board:<id>` keys. Lock cleanup on board-leave is scoped to
    /// these.
    #[must_use]
    pub fn is_board(&self) -> bool {
        self.0.starts_with("board:")
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RoomKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for RoomKey {
    type Error = InvalidRoomKey;

    fn try_from(raw: String) -> Result<Self, Self::Error> {
        Self::parse(&raw)
    }
}

impl From<RoomKey> for String {
    fn from(key: RoomKey) -> Self {
        key.0
    }
}

// =============================================================================
// SHARED PAYLOAD TYPES
// =============================================================================

/// The authenticated user a connection claims to represent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Identity {
    pub identity_id: String,
    pub display_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar: Option<String>,
}

/// Coarse availability state of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Presence {
    Online,
    Away,
    Offline,
}

/// A live cursor position, optionally anchored to a board element.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CursorPosition {
    pub x: f64,
    pub y: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub board: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub element: Option<String>,
}

/// What a connection is currently typing into.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TypingTarget {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub card_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment_id: Option<String>,
}

/// Versioned entity namespace. Cards and comments count independently.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityKind {
    Card,
    Comment,
}

/// A point-in-time version claim, used in conflict reports.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VersionRecord {
    pub version: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identity_id: Option<String>,
}

/// An advisory edit lock on a card.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LockInfo {
    pub card_id: String,
    pub connection_id: Uuid,
    pub locked_by: Identity,
    /// Milliseconds since Unix epoch.
    pub acquired_at: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Success,
    Warning,
    Error,
}

/// A transient push notification. Queued (bounded, best effort) when the
/// target identity has no live connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Notification {
    pub id: Uuid,
    pub title: String,
    pub message: String,
    pub severity: Severity,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_identity: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<String>,
    /// Milliseconds since Unix epoch.
    pub created_at: i64,
}

impl Notification {
    /// Build a notification stamped with a fresh id and the current time.
    #[must_use]
    pub fn new(title: impl Into<String>, message: impl Into<String>, severity: Severity) -> Self {
        Self {
            id: Uuid::new_v4(),
            title: title.into(),
            message: message.into(),
            severity,
            target_identity: None,
            action: None,
            created_at: now_ms(),
        }
    }

    #[must_use]
    pub fn for_identity(mut self, identity_id: impl Into<String>) -> Self {
        self.target_identity = Some(identity_id.into());
        self
    }

    #[must_use]
    pub fn with_action(mut self, action: impl Into<String>) -> Self {
        self.action = Some(action.into());
        self
    }
}

/// One entry in a room member list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomMember {
    pub connection_id: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<Identity>,
    pub presence: Presence,
}

// =============================================================================
// INBOUND EVENTS
// =============================================================================

/// Everything a client may send. Unknown event names or malformed payloads
/// fail deserialization and never reach the session manager.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum ClientEvent {
    JoinRoom {
        room: RoomKey,
    },
    LeaveRoom {
        room: RoomKey,
    },
    JoinBoard {
        board_id: String,
        user: Identity,
    },
    LeaveBoard {
        board_id: String,
    },
    UpdatePresence {
        status: Presence,
    },
    SendCursorPosition {
        x: f64,
        y: f64,
        #[serde(default)]
        board: Option<String>,
        #[serde(default)]
        element: Option<String>,
    },
    RequestCardLock {
        card_id: String,
    },
    ReleaseCardLock {
        card_id: String,
    },
    UpdateCard {
        card_id: String,
        field: String,
        value: serde_json::Value,
        version: i64,
    },
    MoveCard {
        card_id: String,
        from_column: String,
        to_column: String,
        position: i64,
    },
    StartTyping {
        #[serde(default)]
        card_id: Option<String>,
        #[serde(default)]
        comment_id: Option<String>,
    },
    StopTyping {
        #[serde(default)]
        card_id: Option<String>,
        #[serde(default)]
        comment_id: Option<String>,
    },
    UpdateComment {
        comment_id: String,
        content: String,
        version: i64,
    },
    DeleteComment {
        comment_id: String,
    },
    SubmitConflictResolution {
        entity_type: EntityKind,
        entity_id: String,
        resolved_version: i64,
    },
}

// =============================================================================
// OUTBOUND EVENTS
// =============================================================================

/// Everything the server may send. Serialized as `{"event", "data"}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum ServerEvent {
    /// Welcome event sent immediately after the upgrade.
    Connected {
        connection_id: Uuid,
        color: String,
    },
    UserJoined {
        room: RoomKey,
        connection_id: Uuid,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        user: Option<Identity>,
    },
    UserLeft {
        room: RoomKey,
        connection_id: Uuid,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        user: Option<Identity>,
    },
    UserPresence {
        connection_id: Uuid,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        user: Option<Identity>,
        status: Presence,
        last_seen: i64,
    },
    UserCursor {
        connection_id: Uuid,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        user: Option<Identity>,
        color: String,
        x: f64,
        y: f64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        board: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        element: Option<String>,
    },
    /// Reply to the lock requester and, when granted, broadcast to peers.
    CardLock {
        card_id: String,
        granted: bool,
        lock: LockInfo,
    },
    CardUnlock {
        card_id: String,
        connection_id: Uuid,
    },
    CardEdit {
        card_id: String,
        field: String,
        value: serde_json::Value,
        version: i64,
        edited_by: Identity,
    },
    CardMove {
        card_id: String,
        from_column: String,
        to_column: String,
        position: i64,
        moved_by: Identity,
    },
    UserTyping {
        connection_id: Uuid,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        user: Option<Identity>,
        is_typing: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        card_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        comment_id: Option<String>,
    },
    LiveCommentUpdate {
        comment_id: String,
        content: String,
        version: i64,
        edited_by: Identity,
    },
    CommentDeleted {
        comment_id: String,
        deleted_by: Identity,
    },
    ConflictDetected {
        entity_type: EntityKind,
        entity_id: String,
        current: VersionRecord,
        incoming: VersionRecord,
    },
    ConflictResolved {
        entity_type: EntityKind,
        entity_id: String,
        version: i64,
        resolved_by: Identity,
    },
    PushNotification {
        notification: Notification,
    },
    /// Member list sent to a newcomer after a successful join.
    RoomMembers {
        room: RoomKey,
        members: Vec<RoomMember>,
    },
    // Domain events originate from the entity-store layer and are routed
    // through the same fan-out as collaboration events.
    AgentStatusUpdate {
        agent_id: String,
        status: String,
    },
    MissionUpdate {
        mission_id: String,
        fields: HashMap<String, serde_json::Value>,
    },
    NewComment {
        card_id: String,
        comment_id: String,
        content: String,
        author: Identity,
    },
    SystemNotification {
        notification: Notification,
    },
    Error {
        code: String,
        message: String,
        retryable: bool,
    },
}

impl ServerEvent {
    /// Build a structured error event from a typed error.
    #[must_use]
    pub fn error_from(err: &(impl ErrorCode + ?Sized)) -> Self {
        Self::Error {
            code: err.error_code().to_string(),
            message: err.to_string(),
            retryable: err.retryable(),
        }
    }
}

// =============================================================================
// TESTS
// =============================================================================
