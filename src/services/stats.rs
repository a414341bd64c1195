//! Stats — side-channel queries consumed by the HTTP layer.

use serde::Serialize;
use std::collections::HashSet;
use uuid::Uuid;

use crate::protocol::{Identity, Presence, RoomKey, TypingTarget};
use crate::state::SessionState;

/// Per-connection summary for a board room.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UserSummary {
    pub connection_id: Uuid,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<Identity>,
    pub presence: Presence,
    pub is_editing: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub typing: Option<TypingTarget>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BoardStats {
    pub board_id: String,
    pub connected_users: usize,
    pub active_editors: usize,
    pub users: Vec<UserSummary>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GeneralStats {
    pub total_connections: usize,
    pub total_rooms: usize,
}

/// Summarize the live state of one board room.
#[must_use]
pub fn board_stats(sessions: &SessionState, board_id: &str) -> BoardStats {
    let room = RoomKey::board(board_id);
    let users: Vec<UserSummary> = sessions
        .connections
        .values()
        .filter(|c| c.rooms.contains(&room))
        .map(|c| UserSummary {
            connection_id: c.id,
            user: c.user.clone(),
            presence: c.presence,
            // Only locks acquired under this board count as editing here.
            is_editing: sessions
                .locks
                .values()
                .any(|l| l.holder == c.id && l.rooms.contains(&room)),
            typing: c.typing.clone(),
        })
        .collect();

    BoardStats {
        board_id: board_id.to_string(),
        connected_users: users.len(),
        active_editors: users.iter().filter(|u| u.is_editing).count(),
        users,
    }
}

/// Process-wide connection and room counts.
#[must_use]
pub fn general_stats(sessions: &SessionState) -> GeneralStats {
    let rooms: HashSet<&RoomKey> = sessions
        .connections
        .values()
        .flat_map(|c| c.rooms.iter())
        .collect();

    GeneralStats { total_connections: sessions.connections.len(), total_rooms: rooms.len() }
}
