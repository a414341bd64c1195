use super::*;
use tokio::sync::mpsc;

use crate::protocol::Identity;
use crate::services::rooms;
use crate::state::CLIENT_CHANNEL_DEPTH;

fn connect(sessions: &mut SessionState, id: Uuid) -> mpsc::Receiver<ServerEvent> {
    let (tx, rx) = mpsc::channel(CLIENT_CHANNEL_DEPTH);
    sessions.register(id, tx);
    rx
}

fn identity(id: &str) -> Identity {
    Identity { identity_id: id.into(), display_name: id.to_uppercase(), avatar: None }
}

fn drain(rx: &mut mpsc::Receiver<ServerEvent>) -> Vec<ServerEvent> {
    let mut out = Vec::new();
    while let Ok(event) = rx.try_recv() {
        out.push(event);
    }
    out
}

#[tokio::test]
async fn presence_change_reaches_roommates_only() {
    let mut sessions = SessionState::default();
    let (c1, c2, c3) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
    let mut rx1 = connect(&mut sessions, c1);
    let mut rx2 = connect(&mut sessions, c2);
    let mut rx3 = connect(&mut sessions, c3);

    rooms::join_board(&mut sessions, c1, "b1", identity("u1")).unwrap();
    rooms::join_board(&mut sessions, c2, "b1", identity("u2")).unwrap();
    drain(&mut rx1);
    drain(&mut rx2);

    update_presence(&mut sessions, c1, Presence::Away);

    assert_eq!(sessions.get(c1).unwrap().presence, Presence::Away);
    assert!(drain(&mut rx1).is_empty(), "no self-notification");
    let events = drain(&mut rx2);
    assert!(
        events
            .iter()
            .any(|e| matches!(e, ServerEvent::UserPresence { connection_id, status: Presence::Away, .. } if *connection_id == c1)),
        "roommate hears presence change: {events:?}"
    );
    assert!(drain(&mut rx3).is_empty(), "stranger hears nothing");
}

#[tokio::test]
async fn cursor_broadcasts_to_board_room_excluding_sender() {
    let mut sessions = SessionState::default();
    let (c1, c2) = (Uuid::new_v4(), Uuid::new_v4());
    let mut rx1 = connect(&mut sessions, c1);
    let mut rx2 = connect(&mut sessions, c2);

    rooms::join_board(&mut sessions, c1, "b1", identity("u1")).unwrap();
    rooms::join_board(&mut sessions, c2, "b1", identity("u2")).unwrap();
    drain(&mut rx1);
    drain(&mut rx2);

    let cursor = CursorPosition { x: 12.5, y: 40.0, board: Some("b1".into()), element: None };
    update_cursor(&mut sessions, c1, cursor.clone());

    assert_eq!(sessions.get(c1).unwrap().cursor, Some(cursor));
    assert!(drain(&mut rx1).is_empty());
    let events = drain(&mut rx2);
    let ServerEvent::UserCursor { connection_id, x, y, color, .. } = &events[0] else {
        panic!("expected userCursor, got {events:?}");
    };
    assert_eq!(*connection_id, c1);
    assert!((x - 12.5).abs() < f64::EPSILON);
    assert!((y - 40.0).abs() < f64::EPSILON);
    assert!(!color.is_empty());
}

#[tokio::test]
async fn cursor_anchored_to_unjoined_board_is_not_broadcast() {
    let mut sessions = SessionState::default();
    let (c1, c2) = (Uuid::new_v4(), Uuid::new_v4());
    let mut rx1 = connect(&mut sessions, c1);
    let mut rx2 = connect(&mut sessions, c2);

    rooms::join_board(&mut sessions, c1, "b1", identity("u1")).unwrap();
    rooms::join_board(&mut sessions, c2, "b2", identity("u2")).unwrap();
    drain(&mut rx1);
    drain(&mut rx2);

    // C1 claims a cursor on b2, a board it never joined.
    update_cursor(&mut sessions, c1, CursorPosition { x: 1.0, y: 2.0, board: Some("b2".into()), element: None });

    assert!(drain(&mut rx2).is_empty(), "b2 members must not see the injected cursor");
    assert!(sessions.get(c1).unwrap().cursor.is_some());
}

#[tokio::test]
async fn cursor_before_any_join_is_ignored() {
    let mut sessions = SessionState::default();
    let c1 = Uuid::new_v4();
    let _rx1 = connect(&mut sessions, c1);

    update_cursor(&mut sessions, c1, CursorPosition { x: 1.0, y: 2.0, board: None, element: None });
    // Cursor recorded on the connection, nothing broadcast anywhere.
    assert!(sessions.get(c1).unwrap().cursor.is_some());
}

#[tokio::test]
async fn typing_state_broadcasts_start_and_stop() {
    let mut sessions = SessionState::default();
    let (c1, c2) = (Uuid::new_v4(), Uuid::new_v4());
    let mut rx1 = connect(&mut sessions, c1);
    let mut rx2 = connect(&mut sessions, c2);

    rooms::join_board(&mut sessions, c1, "b1", identity("u1")).unwrap();
    rooms::join_board(&mut sessions, c2, "b1", identity("u2")).unwrap();
    drain(&mut rx1);
    drain(&mut rx2);

    let target = TypingTarget { card_id: Some("c1".into()), comment_id: None };
    set_typing(&mut sessions, c1, Some(target.clone()));
    assert_eq!(sessions.get(c1).unwrap().typing, Some(target));

    set_typing(&mut sessions, c1, None);
    assert!(sessions.get(c1).unwrap().typing.is_none());

    let typing_flags: Vec<bool> = drain(&mut rx2)
        .into_iter()
        .filter_map(|e| match e {
            ServerEvent::UserTyping { is_typing, .. } => Some(is_typing),
            _ => None,
        })
        .collect();
    assert_eq!(typing_flags, vec![true, false]);
}

#[tokio::test]
async fn disconnect_cascade_cleans_everything_once() {
    let mut sessions = SessionState::default();
    let (c1, c2) = (Uuid::new_v4(), Uuid::new_v4());
    let mut rx1 = connect(&mut sessions, c1);
    let mut rx2 = connect(&mut sessions, c2);

    rooms::join_board(&mut sessions, c1, "b1", identity("u1")).unwrap();
    rooms::join_board(&mut sessions, c2, "b1", identity("u2")).unwrap();
    locks::acquire(&mut sessions, c1, "card-1").unwrap();
    set_typing(&mut sessions, c1, Some(TypingTarget { card_id: Some("card-1".into()), comment_id: None }));
    drain(&mut rx1);
    drain(&mut rx2);

    disconnect(&mut sessions, c1);

    // (a) no lock remains assigned to the connection
    assert!(sessions.locks.is_empty());
    // (b) absent from every room's member list
    assert!(
        rooms::members_of(&sessions, &RoomKey::board("b1"))
            .iter()
            .all(|m| m.connection_id != c1)
    );
    assert!(sessions.get(c1).is_none());

    let events = drain(&mut rx2);
    let offline_count = events
        .iter()
        .filter(|e| {
            matches!(e, ServerEvent::UserPresence { connection_id, status: Presence::Offline, .. } if *connection_id == c1)
        })
        .count();
    // (c) presence-offline broadcast to the shared room exactly once
    assert_eq!(offline_count, 1, "events: {events:?}");
    assert!(events.iter().any(|e| matches!(e, ServerEvent::CardUnlock { card_id, .. } if card_id == "card-1")));
    assert!(
        events
            .iter()
            .any(|e| matches!(e, ServerEvent::UserTyping { is_typing: false, connection_id, .. } if *connection_id == c1))
    );
    assert!(
        events
            .iter()
            .any(|e| matches!(e, ServerEvent::UserLeft { connection_id, .. } if *connection_id == c1))
    );

    // Duplicate disconnect signal: cascade must not run again.
    disconnect(&mut sessions, c1);
    assert!(drain(&mut rx2).is_empty(), "idempotent cleanup");
}

#[tokio::test]
async fn update_presence_for_unknown_connection_is_ignored() {
    let mut sessions = SessionState::default();
    update_presence(&mut sessions, Uuid::new_v4(), Presence::Away);
    assert!(sessions.connections.is_empty());
}
