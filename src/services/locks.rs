//! Lock manager — exclusive, advisory, per-card edit locks.
//!
//! DESIGN
//! ======
//! State machine per card id: Unlocked → Locked(holder) → Unlocked.
//! Acquisition is decided synchronously: an already-locked card is reported
//! back with the current holder, never queued. These locks are a UI
//! affordance (one visible editor per card); data integrity still rests on
//! the version tracker. Locks are tagged with the holder's board rooms at
//! acquisition time so board-leave cleanup can release only the locks that
//! belong to the departed board.

use uuid::Uuid;

use crate::protocol::{ErrorCode, LockInfo, RoomKey, now_ms};
use crate::state::{CardLock, SessionState};

// =============================================================================
// TYPES
// =============================================================================

#[derive(Debug, thiserror::Error)]
pub enum LockError {
    #[error("connection not registered: {0}")]
    UnknownConnection(Uuid),
    #[error("an identity must be bound before locking (join a board first)")]
    IdentityRequired,
}

impl ErrorCode for LockError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::UnknownConnection(_) => "E_NO_CONNECTION",
            Self::IdentityRequired => "E_IDENTITY_REQUIRED",
        }
    }
}

/// Outcome of an acquisition attempt.
#[derive(Debug, Clone)]
pub enum Acquire {
    /// Lock granted to the caller.
    Granted(LockInfo),
    /// Caller already holds this lock; treated as success.
    AlreadyHeld(LockInfo),
    /// Held by someone else. Carries the current lock so the client can
    /// render "being edited by X".
    Denied(LockInfo),
}

#[must_use]
pub fn lock_info(lock: &CardLock) -> LockInfo {
    LockInfo {
        card_id: lock.card_id.clone(),
        connection_id: lock.holder,
        locked_by: lock.locked_by.clone(),
        acquired_at: lock.acquired_at,
    }
}

// =============================================================================
// ACQUIRE / RELEASE
// =============================================================================

/// Try to acquire the edit lock on a card.
///
/// # Errors
///
/// Returns `UnknownConnection` for unregistered connections and
/// `IdentityRequired` if the caller has not joined a board yet.
pub fn acquire(sessions: &mut SessionState, conn_id: Uuid, card_id: &str) -> Result<Acquire, LockError> {
    let conn = sessions
        .connections
        .get(&conn_id)
        .ok_or(LockError::UnknownConnection(conn_id))?;
    let Some(user) = conn.user.clone() else {
        return Err(LockError::IdentityRequired);
    };

    if let Some(existing) = sessions.locks.get(card_id) {
        if existing.holder == conn_id {
            return Ok(Acquire::AlreadyHeld(lock_info(existing)));
        }
        return Ok(Acquire::Denied(lock_info(existing)));
    }

    let board_rooms = conn.rooms.iter().filter(|r| r.is_board()).cloned().collect();
    let lock = CardLock {
        card_id: card_id.to_string(),
        holder: conn_id,
        locked_by: user,
        rooms: board_rooms,
        acquired_at: now_ms(),
    };
    let info = lock_info(&lock);
    sessions.locks.insert(card_id.to_string(), lock);
    if let Some(conn) = sessions.connections.get_mut(&conn_id) {
        conn.locks.insert(card_id.to_string());
    }
    Ok(Acquire::Granted(info))
}

/// Release a lock. No-op unless the caller is the current holder. Returns
/// the released lock so the caller can broadcast the unlock.
pub fn release(sessions: &mut SessionState, conn_id: Uuid, card_id: &str) -> Option<CardLock> {
    let holder = sessions.locks.get(card_id)?.holder;
    if holder != conn_id {
        return None;
    }
    let lock = sessions.locks.remove(card_id);
    if let Some(conn) = sessions.connections.get_mut(&conn_id) {
        conn.locks.remove(card_id);
    }
    lock
}

/// Release every lock held by a connection, optionally scoped to locks
/// acquired while joined to a given room. Used by disconnect and board-leave
/// cleanup; works whether or not the connection is still registered.
pub fn release_all(sessions: &mut SessionState, conn_id: Uuid, room: Option<&RoomKey>) -> Vec<CardLock> {
    let card_ids: Vec<String> = sessions
        .locks
        .values()
        .filter(|l| l.holder == conn_id)
        .filter(|l| room.is_none_or(|r| l.rooms.contains(r)))
        .map(|l| l.card_id.clone())
        .collect();

    let mut released = Vec::with_capacity(card_ids.len());
    for card_id in card_ids {
        if let Some(lock) = sessions.locks.remove(&card_id) {
            if let Some(conn) = sessions.connections.get_mut(&conn_id) {
                conn.locks.remove(&card_id);
            }
            released.push(lock);
        }
    }
    released
}

#[cfg(test)]
#[path = "locks_test.rs"]
mod tests;
