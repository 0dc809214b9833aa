//! Media worker crash handling.
//!
//! Verifies, against the in-memory engine's fault injection:
//! - A worker crash fails every room on it and tells each joined session
//! - Rejoining lands on a live worker
//! - The pool replaces dead workers, backing off while spawns fail
//! - Joins are refused with UNAVAILABLE while no worker is live

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use std::time::Duration;

use common::types::MediaKind;
use meeting_signaling::media::InMemoryMediaEngine;
use meeting_signaling::observability::HealthState;
use meeting_signaling::signaling::ServerMessage;
use signaling_test_utils::{TestMeeting, TestNode, TestParticipant};
use std::sync::Arc;

async fn wait_for(what: &str, mut condition: impl FnMut() -> bool) {
    for _ in 0..200 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {what}");
}

#[tokio::test]
async fn test_worker_crash_fails_room_and_rejoin_uses_live_worker() {
    let node = TestNode::builder()
        .workers(2)
        .respawn_backoff(Duration::from_secs(60))
        .start()
        .await;
    let meeting = TestMeeting::random();
    let host_user = TestParticipant::host("Hana");

    let mut host = node.connect();
    host.join(&meeting, &host_user).await;
    let mut candidate = node.connect();
    candidate
        .join(&meeting, &TestParticipant::candidate("Cai"))
        .await;
    host.setup_transports().await;
    host.produce(MediaKind::Video).await;

    let room = node
        .registry
        .get_room(meeting.id.clone())
        .await
        .unwrap()
        .expect("room should exist");
    let dead_worker = room.worker_id().to_string();
    assert!(node.engine.kill_worker(&dead_worker));

    for client in [&mut host, &mut candidate] {
        match client
            .expect_event("room-failed", |m| matches!(m, ServerMessage::RoomFailed { .. }))
            .await
        {
            ServerMessage::RoomFailed { meeting_id, reason } => {
                assert_eq!(meeting_id, meeting.id);
                assert!(reason.contains(&dead_worker), "{reason}");
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    // Media requests on the failed room are refused until the rejoin.
    let refused = host
        .request(signaling_test_utils::create_transport(
            common::types::TransportDirection::Send,
        ))
        .await;
    assert!(matches!(refused, ServerMessage::Error { code: 1, .. }));

    match host.join(&meeting, &host_user).await {
        ServerMessage::RoomJoined {
            participant_count,
            existing_producers,
            ..
        } => {
            assert_eq!(participant_count, 1);
            assert!(existing_producers.is_empty());
        }
        other => panic!("rejoin failed: {other:?}"),
    }

    let new_room = node
        .registry
        .get_room(meeting.id.clone())
        .await
        .unwrap()
        .expect("replacement room");
    assert_ne!(new_room.worker_id(), dead_worker);
    assert_ne!(new_room.room_id(), room.room_id());
}

#[tokio::test]
async fn test_crash_only_affects_rooms_on_that_worker() {
    let node = TestNode::builder()
        .workers(2)
        .respawn_backoff(Duration::from_secs(60))
        .start()
        .await;
    let first = TestMeeting::random();
    let second = TestMeeting::random();

    let mut in_first = node.connect();
    in_first
        .join(&first, &TestParticipant::candidate("Cai"))
        .await;
    let mut in_second = node.connect();
    in_second
        .join(&second, &TestParticipant::candidate("Dee"))
        .await;

    let first_room = node
        .registry
        .get_room(first.id.clone())
        .await
        .unwrap()
        .unwrap();
    let second_room = node
        .registry
        .get_room(second.id.clone())
        .await
        .unwrap()
        .unwrap();
    // Round-robin placement spreads the two rooms.
    assert_ne!(first_room.worker_id(), second_room.worker_id());

    node.engine.kill_worker(first_room.worker_id());

    in_first
        .expect_event("room-failed", |m| matches!(m, ServerMessage::RoomFailed { .. }))
        .await;
    in_second
        .expect_no_event("room-failed", Duration::from_millis(100), |m| {
            matches!(m, ServerMessage::RoomFailed { .. })
        })
        .await;
    assert!(!second_room.is_terminated());
}

#[tokio::test]
async fn test_dead_worker_is_replaced() {
    let engine = InMemoryMediaEngine::new();
    let node = TestNode::builder()
        .engine(engine.clone())
        .respawn_backoff(Duration::from_millis(20))
        .start()
        .await;
    let original = engine.live_worker_ids();
    assert_eq!(original.len(), 1);

    engine.fail_next_spawns(2);
    engine.kill_worker(original.first().unwrap());
    wait_for("pool to notice the crash", || node.pool.live_count() == 0).await;

    // Two failed attempts, then a successful one.
    wait_for("replacement worker", || node.pool.live_count() == 1).await;
    assert_eq!(engine.spawned_workers(), 2);
    let replacement = engine.live_worker_ids();
    assert_eq!(replacement.len(), 1);
    assert_ne!(replacement, original);

    // New meetings are placed on the replacement.
    let meeting = TestMeeting::random();
    let mut client = node.connect();
    assert!(matches!(
        client
            .join(&meeting, &TestParticipant::candidate("Cai"))
            .await,
        ServerMessage::RoomJoined { .. }
    ));
}

#[tokio::test]
async fn test_joins_refused_while_no_worker_is_live() {
    let engine = InMemoryMediaEngine::new();
    let node = TestNode::builder()
        .engine(engine.clone())
        .respawn_backoff(Duration::from_secs(60))
        .start()
        .await;
    let health = HealthState::with_pool(Arc::clone(&node.pool));
    health.set_ready();
    assert!(health.is_ready());

    let worker = engine.live_worker_ids();
    engine.kill_worker(worker.first().unwrap());
    wait_for("pool to notice the crash", || node.pool.live_count() == 0).await;
    assert!(!health.is_ready());
    assert!(health.is_live());

    let mut client = node.connect();
    let reply = client
        .join(&TestMeeting::random(), &TestParticipant::candidate("Cai"))
        .await;
    assert!(
        matches!(reply, ServerMessage::Error { code: 7, .. }),
        "{reply:?}"
    );
}
