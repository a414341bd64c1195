//! `OpsBoard` — real-time collaboration backend.
//!
//! ARCHITECTURE
//! ============
//! A websocket session manager for a multi-board operations UI: connection
//! registry, room membership, advisory card locks, optimistic version
//! tracking, and best-effort event fan-out. Durable entities live behind the
//! [`store::EntityStore`] trait; everything ephemeral (who is connected,
//! where, holding what) is owned by [`state::SessionState`].

pub mod db;
pub mod protocol;
pub mod routes;
pub mod services;
pub mod state;
pub mod store;
