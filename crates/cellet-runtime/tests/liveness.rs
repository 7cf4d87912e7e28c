//! Ack timeouts and heartbeat failure against a hand-driven peer

mod common;

use std::time::Duration;

use cellet_core::Frame;
use cellet_runtime::{FailureCode, Nucleus, NucleusConfig, TalkEvent, TalkService};
use common::*;
use tokio_test::assert_ok;

#[tokio::test]
async fn test_speak_timeout_fires_once_and_late_ack_is_ignored() {
    init_tracing();
    let (peer_listener, port) = FakePeer::listen().await;

    let client = Nucleus::new(config()).unwrap();
    let talk = client.talk_service();
    talk.set_ack_timeout(Duration::from_millis(150));
    let (listener, mut rx) = channel_listener();
    talk.set_listener("Echo", listener);
    assert_ok!(talk.call("127.0.0.1", port, &["Echo"]));

    let mut peer = FakePeer::accept(&peer_listener).await;
    assert_eq!(peer.accept_handshake().await, vec!["Echo"]);
    wait_for(&mut rx, "contacted", is_contacted("Echo")).await;

    assert!(talk.speak_with_ack("Echo", message("unanswered")));
    let Frame::Dialogue { seq, ack, .. } = peer.read_non_heartbeat().await else {
        panic!("expected dialogue");
    };
    assert!(ack);

    let timeout = wait_for(&mut rx, "speak timeout", |e| {
        matches!(e, TalkEvent::SpeakTimeout { .. })
    })
    .await;
    let TalkEvent::SpeakTimeout { primitive, .. } = timeout else {
        unreachable!()
    };
    assert_eq!(text_of(&primitive), "unanswered");

    peer.send(&Frame::Ack {
        seq,
        cellet: "Echo".to_string(),
    })
    .await;
    assert_quiet(&mut rx, Duration::from_millis(400), |e| {
        matches!(e, TalkEvent::Ack { .. } | TalkEvent::SpeakTimeout { .. })
    })
    .await;
    assert_eq!(talk.speaker("127.0.0.1", port).unwrap().pending_acks(), 0);
}

#[tokio::test]
async fn test_ack_in_time_resolves_without_timeout() {
    init_tracing();
    let (peer_listener, port) = FakePeer::listen().await;

    let client = Nucleus::new(config()).unwrap();
    let talk = client.talk_service();
    talk.set_ack_timeout(Duration::from_millis(300));
    let (listener, mut rx) = channel_listener();
    talk.set_listener("Echo", listener);
    assert_ok!(talk.call("127.0.0.1", port, &["Echo"]));

    let mut peer = FakePeer::accept(&peer_listener).await;
    peer.accept_handshake().await;
    wait_for(&mut rx, "contacted", is_contacted("Echo")).await;

    assert!(talk.speak_with_ack("Echo", message("answered")));
    let Frame::Dialogue { seq, .. } = peer.read_non_heartbeat().await else {
        panic!("expected dialogue");
    };
    peer.send(&Frame::Ack {
        seq,
        cellet: "Echo".to_string(),
    })
    .await;
    wait_for(&mut rx, "ack", |e| matches!(e, TalkEvent::Ack { .. })).await;
    assert_quiet(&mut rx, Duration::from_millis(500), |e| {
        matches!(e, TalkEvent::SpeakTimeout { .. })
    })
    .await;
}

#[tokio::test]
async fn test_silent_peer_fails_once_with_heartbeat_timeout() {
    init_tracing();
    let (peer_listener, port) = FakePeer::listen().await;

    let config = NucleusConfig {
        heartbeat_ms: 200,
        ..NucleusConfig::testing()
    };
    let client = Nucleus::new(config).unwrap();
    let talk = client.talk_service();
    let (listener, mut rx) = channel_listener();
    talk.set_listener("Echo", listener);
    assert_ok!(talk.call("127.0.0.1", port, &["Echo"]));

    // the peer answers the handshake and then never writes again
    let mut peer = FakePeer::accept(&peer_listener).await;
    let before_last_write = tokio::time::Instant::now();
    peer.accept_handshake().await;
    wait_for(&mut rx, "contacted", is_contacted("Echo")).await;

    // first strike is a probe
    assert!(matches!(peer.read_frame().await, Frame::Heartbeat));

    let failed = wait_for(&mut rx, "failed", |e| !matches!(e, TalkEvent::Spoke { .. })).await;
    match failed {
        TalkEvent::Failed { failure, .. } => assert_eq!(failure.code, FailureCode::HeartbeatTimeout),
        other => panic!("expected failed before quitted, got {other:?}"),
    }
    // the handshake ack was the last inbound frame
    assert!(before_last_write.elapsed() >= Duration::from_millis(2 * 200));

    let quitted = wait_for(&mut rx, "quitted", |_| true).await;
    assert!(matches!(quitted, TalkEvent::Quitted { .. }));
    assert_quiet(&mut rx, Duration::from_millis(500), |e| {
        matches!(e, TalkEvent::Failed { .. } | TalkEvent::Quitted { .. })
    })
    .await;
    assert!(talk.heartbeat_context("127.0.0.1", port).is_none());
    drop(peer);
}

#[tokio::test]
async fn test_answered_probes_keep_connection_alive() {
    init_tracing();
    let (peer_listener, port) = FakePeer::listen().await;

    let config = NucleusConfig {
        heartbeat_ms: 200,
        ..NucleusConfig::testing()
    };
    let client = Nucleus::new(config).unwrap();
    let talk = client.talk_service();
    let (listener, mut rx) = channel_listener();
    talk.set_listener("Echo", listener);
    assert_ok!(talk.call("127.0.0.1", port, &["Echo"]));

    let mut peer = FakePeer::accept(&peer_listener).await;
    peer.accept_handshake().await;
    wait_for(&mut rx, "contacted", is_contacted("Echo")).await;

    for _ in 0..4 {
        assert!(matches!(peer.read_frame().await, Frame::Heartbeat));
        peer.send(&Frame::HeartbeatAck).await;
    }
    let context = talk.heartbeat_context("127.0.0.1", port).unwrap();
    assert!(context.probes_sent >= 4);
    assert!(!context.failed);
    assert!(talk.is_called("Echo"));
}
