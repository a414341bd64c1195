use super::*;
use tokio::sync::mpsc;

use crate::protocol::{Notification, Severity};
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
async fn join_seeds_newcomer_and_notifies_others() {
    let mut sessions = SessionState::default();
    let (c1, c2) = (Uuid::new_v4(), Uuid::new_v4());
    let mut rx1 = connect(&mut sessions, c1);
    let mut rx2 = connect(&mut sessions, c2);
    let room = RoomKey::board("b1");

    let members = join(&mut sessions, c1, &room).unwrap();
    assert!(members.is_empty(), "first joiner sees no existing participants");
    assert!(drain(&mut rx1).is_empty(), "joiner must not be self-notified");

    let members = join(&mut sessions, c2, &room).unwrap();
    assert_eq!(members.len(), 1);
    assert_eq!(members[0].connection_id, c1);

    let events = drain(&mut rx1);
    assert_eq!(events.len(), 1);
    let ServerEvent::UserJoined { room: r, connection_id, .. } = &events[0] else {
        panic!("expected userJoined, got {events:?}");
    };
    assert_eq!(*r, room);
    assert_eq!(*connection_id, c2);
    assert!(drain(&mut rx2).is_empty());
}

#[tokio::test]
async fn join_twice_is_idempotent() {
    let mut sessions = SessionState::default();
    let (c1, c2) = (Uuid::new_v4(), Uuid::new_v4());
    let mut rx1 = connect(&mut sessions, c1);
    let _rx2 = connect(&mut sessions, c2);
    let room = RoomKey::board("b1");

    join(&mut sessions, c1, &room).unwrap();
    join(&mut sessions, c2, &room).unwrap();
    drain(&mut rx1);

    let members = join(&mut sessions, c2, &room).unwrap();
    assert_eq!(members.len(), 1, "repeat join returns the same view");
    assert!(drain(&mut rx1).is_empty(), "no duplicate userJoined");
    assert_eq!(members_of(&sessions, &room).len(), 2, "no duplicate membership");
}

#[tokio::test]
async fn leave_notifies_remainder_and_releases_scoped_locks() {
    let mut sessions = SessionState::default();
    let (c1, c2) = (Uuid::new_v4(), Uuid::new_v4());
    let _rx1 = connect(&mut sessions, c1);
    let mut rx2 = connect(&mut sessions, c2);
    let room = RoomKey::board("b1");

    sessions.get_mut(c1).unwrap().user = Some(identity("u1"));
    join(&mut sessions, c1, &room).unwrap();
    join(&mut sessions, c2, &room).unwrap();
    locks::acquire(&mut sessions, c1, "card-1").unwrap();
    drain(&mut rx2);

    leave(&mut sessions, c1, &room).unwrap();

    assert!(members_of(&sessions, &room).iter().all(|m| m.connection_id != c1));
    assert!(sessions.locks.is_empty(), "board-scoped lock released on leave");

    let events = drain(&mut rx2);
    assert!(
        events.iter().any(|e| matches!(e, ServerEvent::UserLeft { connection_id, .. } if *connection_id == c1)),
        "remaining member hears userLeft: {events:?}"
    );
    assert!(
        events
            .iter()
            .any(|e| matches!(e, ServerEvent::CardUnlock { card_id, .. } if card_id == "card-1")),
        "remaining member hears cardUnlock: {events:?}"
    );
}

#[tokio::test]
async fn leave_room_never_joined_is_noop() {
    let mut sessions = SessionState::default();
    let c1 = Uuid::new_v4();
    let _rx1 = connect(&mut sessions, c1);

    leave(&mut sessions, c1, &RoomKey::board("b1")).unwrap();
    assert!(leave(&mut sessions, Uuid::new_v4(), &RoomKey::board("b1")).is_err());
}

#[tokio::test]
async fn join_board_binds_identity_and_joins_global() {
    let mut sessions = SessionState::default();
    let c1 = Uuid::new_v4();
    let _rx1 = connect(&mut sessions, c1);

    join_board(&mut sessions, c1, "b1", identity("u1")).unwrap();

    let conn = sessions.get(c1).unwrap();
    assert_eq!(conn.user.as_ref().unwrap().identity_id, "u1");
    assert!(conn.rooms.contains(&RoomKey::board("b1")));
    assert!(conn.rooms.contains(&RoomKey::global()));
}

#[tokio::test]
async fn join_board_flushes_queued_notifications_newest_first() {
    let mut sessions = SessionState::default();
    for title in ["first", "second"] {
        fanout::notify(&mut sessions, Notification::new(title, "queued", Severity::Info).for_identity("u1"));
    }

    let c1 = Uuid::new_v4();
    let mut rx1 = connect(&mut sessions, c1);
    join_board(&mut sessions, c1, "b1", identity("u1")).unwrap();

    let titles: Vec<String> = drain(&mut rx1)
        .into_iter()
        .filter_map(|e| match e {
            ServerEvent::PushNotification { notification } => Some(notification.title),
            _ => None,
        })
        .collect();
    assert_eq!(titles, vec!["second", "first"]);
    assert!(sessions.pending_notifications.is_empty());
}

#[tokio::test]
async fn members_of_is_a_pure_projection() {
    let mut sessions = SessionState::default();
    let (c1, c2) = (Uuid::new_v4(), Uuid::new_v4());
    let _rx1 = connect(&mut sessions, c1);
    let _rx2 = connect(&mut sessions, c2);

    let b1 = RoomKey::board("b1");
    let b2 = RoomKey::board("b2");
    join(&mut sessions, c1, &b1).unwrap();
    join(&mut sessions, c2, &b1).unwrap();
    join(&mut sessions, c2, &b2).unwrap();

    assert_eq!(members_of(&sessions, &b1).len(), 2);
    assert_eq!(members_of(&sessions, &b2).len(), 1);
    assert!(members_of(&sessions, &RoomKey::mission("m1")).is_empty());
}
