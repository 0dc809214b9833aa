//! Network-quality scoring end to end.
//!
//! Producer stats are set through the in-memory engine; scores must reach
//! every joined session of the meeting and nobody else.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use std::time::Duration;

use common::types::MediaKind;
use meeting_signaling::media::ProducerStats;
use meeting_signaling::signaling::ServerMessage;
use signaling_test_utils::{TestMeeting, TestNode, TestParticipant};

fn is_quality(message: &ServerMessage) -> bool {
    matches!(message, ServerMessage::NetworkQuality { .. })
}

#[tokio::test]
async fn test_scores_reach_every_joined_session() {
    let node = TestNode::start().await;
    let meeting = TestMeeting::random();
    let presenter_user = TestParticipant::interviewer("Ivo");

    let mut presenter = node.connect();
    presenter.join(&meeting, &presenter_user).await;
    let mut viewer = node.connect();
    viewer
        .join(&meeting, &TestParticipant::candidate("Cai"))
        .await;

    presenter.setup_transports().await;
    let producer_id = presenter.produce(MediaKind::Video).await;
    node.engine.set_producer_stats(
        &producer_id,
        ProducerStats {
            bitrate_bps: 100_000,
            fraction_lost: 0.07,
        },
    );

    assert_eq!(node.quality_monitor().sample_once().await, 1);

    for client in [&mut presenter, &mut viewer] {
        let event = client.expect_event("network-quality", is_quality).await;
        assert_eq!(
            event,
            ServerMessage::NetworkQuality {
                peer_id: presenter_user.user_id.clone(),
                score: 2,
            }
        );
    }
}

#[tokio::test]
async fn test_rooms_without_producers_push_nothing() {
    let node = TestNode::start().await;
    let meeting = TestMeeting::random();

    let mut client = node.connect();
    client
        .join(&meeting, &TestParticipant::candidate("Cai"))
        .await;

    assert_eq!(node.quality_monitor().sample_once().await, 0);
    client
        .expect_no_event("network-quality", Duration::from_millis(50), is_quality)
        .await;
}

#[tokio::test]
async fn test_waiting_sessions_get_no_scores() {
    let node = TestNode::start().await;
    let meeting = TestMeeting::random();

    let mut host = node.connect();
    host.join(&meeting, &TestParticipant::host("Hana")).await;
    host.setup_transports().await;
    host.produce(MediaKind::Audio).await;

    let mut waiting = node.connect();
    assert!(matches!(
        waiting
            .join(&meeting, &TestParticipant::candidate("Cai"))
            .await,
        ServerMessage::WaitingRoom { .. }
    ));

    assert_eq!(node.quality_monitor().sample_once().await, 1);
    host.expect_event("network-quality", is_quality).await;
    waiting
        .expect_no_event("network-quality", Duration::from_millis(50), is_quality)
        .await;
}

#[tokio::test]
async fn test_one_score_per_participant() {
    let node = TestNode::start().await;
    let meeting = TestMeeting::random();

    let mut presenter = node.connect();
    presenter
        .join(&meeting, &TestParticipant::interviewer("Ivo"))
        .await;
    presenter.setup_transports().await;
    presenter.produce(MediaKind::Audio).await;
    presenter.produce(MediaKind::Video).await;

    assert_eq!(node.quality_monitor().sample_once().await, 1);
}

#[tokio::test(start_paused = true)]
async fn test_monitor_samples_on_interval() {
    let node = TestNode::start().await;
    let meeting = TestMeeting::random();

    let mut presenter = node.connect();
    presenter
        .join(&meeting, &TestParticipant::interviewer("Ivo"))
        .await;
    presenter.setup_transports().await;
    presenter.produce(MediaKind::Video).await;

    let monitor = node.spawn_quality_monitor(Duration::from_secs(1));

    // Nothing before the first interval elapses.
    presenter
        .expect_no_event("early network-quality", Duration::from_millis(900), is_quality)
        .await;

    let first = presenter.expect_event("network-quality", is_quality).await;
    assert!(matches!(first, ServerMessage::NetworkQuality { score: 5, .. }));
    presenter.expect_event("second network-quality", is_quality).await;

    node.shutdown().await;
    tokio::time::timeout(Duration::from_secs(1), monitor)
        .await
        .expect("monitor stops with the node")
        .unwrap();
}
