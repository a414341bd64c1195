//! Version tracker — optimistic concurrency over cards and comments.
//!
//! DESIGN
//! ======
//! Two independent id→version maps, one per entity namespace. A counter is
//! lazily observed at 1 and only ever moves forward. An update is accepted
//! when the caller's claimed version is greater than or equal to the stored
//! one; the stored version then becomes `claimed + 1`. The equal-or-greater
//! tie-break (rather than strict equality) is deliberate and preserved from
//! the original system: an update is valid as long as the caller's belief is
//! not strictly behind the authoritative version.

use crate::protocol::EntityKind;
use crate::state::SessionState;

/// First version assigned to an entity on lazy observation.
pub const INITIAL_VERSION: i64 = 1;

/// Outcome of an optimistic version advance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Advance {
    Accepted { new_version: i64 },
    /// Caller is strictly behind. Carries the authoritative version for the
    /// conflict report.
    Rejected { current: i64 },
}

fn namespace(sessions: &SessionState, kind: EntityKind) -> &std::collections::HashMap<String, i64> {
    match kind {
        EntityKind::Card => &sessions.card_versions,
        EntityKind::Comment => &sessions.comment_versions,
    }
}

fn namespace_mut(sessions: &mut SessionState, kind: EntityKind) -> &mut std::collections::HashMap<String, i64> {
    match kind {
        EntityKind::Card => &mut sessions.card_versions,
        EntityKind::Comment => &mut sessions.comment_versions,
    }
}

/// Authoritative version of an entity, defaulting to 1 if never observed.
#[must_use]
pub fn current_version(sessions: &SessionState, kind: EntityKind, entity_id: &str) -> i64 {
    namespace(sessions, kind)
        .get(entity_id)
        .copied()
        .unwrap_or(INITIAL_VERSION)
}

/// Attempt to advance an entity's version with the caller's claimed version.
/// Saturates at `i64::MAX` so a hostile claim can never wrap the counter
/// backwards.
pub fn try_advance(sessions: &mut SessionState, kind: EntityKind, entity_id: &str, claimed: i64) -> Advance {
    let current = current_version(sessions, kind, entity_id);
    if claimed < current {
        return Advance::Rejected { current };
    }
    let new_version = claimed.saturating_add(1);
    namespace_mut(sessions, kind).insert(entity_id.to_string(), new_version);
    Advance::Accepted { new_version }
}

/// Force-set the authoritative version after an explicit client-side
/// conflict resolution. Clamped so the counter never moves backwards.
pub fn force_set(sessions: &mut SessionState, kind: EntityKind, entity_id: &str, version: i64) -> i64 {
    let current = current_version(sessions, kind, entity_id);
    let resolved = version.max(current);
    namespace_mut(sessions, kind).insert(entity_id.to_string(), resolved);
    resolved
}
