//! Service layer: the collaboration session manager's business logic.
//!
//! Each module mutates [`crate::state::SessionState`] synchronously; the
//! websocket dispatch layer takes the write guard once per inbound event, so
//! every check-then-set sequence here runs uninterrupted.

pub mod fanout;
pub mod locks;
pub mod presence;
pub mod rooms;
pub mod stats;
pub mod versions;
