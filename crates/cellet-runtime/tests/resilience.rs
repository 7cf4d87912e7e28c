//! Buffering and replay through the uninterrupted operator

mod common;

use std::time::Duration;

use cellet_core::Frame;
use cellet_runtime::{FailureCode, Nucleus, TalkEvent, TalkService};
use common::*;
use tokio_test::assert_ok;

#[tokio::test]
async fn test_sends_during_outage_arrive_after_recall() {
    init_tracing();
    let server = Nucleus::new(config()).unwrap();
    let port = assert_ok!(server.talk_service().start_server("127.0.0.1", 0).await);
    let (echo, mut records) = RecordingCellet::new("Echo", false);
    assert_ok!(server.cellet_service().install(echo));
    assert_ok!(server.cellet_service().activate(port, "Echo"));

    let client = Nucleus::new(config()).unwrap();
    let talk = client.uninterrupted();
    let (listener, mut rx) = channel_listener();
    talk.set_listener("Echo", listener);
    assert_ok!(talk.call("127.0.0.1", port, &["Echo"]));
    wait_for(&mut rx, "contacted", is_contacted("Echo")).await;
    let CelletRecord::Contacted(first_session) =
        wait_for(&mut records, "server contacted", |r| matches!(r, CelletRecord::Contacted(_))).await
    else {
        unreachable!()
    };

    // the server drops the session; the client keeps speaking
    let context = server.cellet_service().get_all_context("Echo").remove(0);
    assert!(server.cellet_service().hangup("Echo", &context, true));
    wait_for(&mut rx, "quitted", is_quitted("Echo")).await;
    assert!(talk.has_backlog("Echo"));
    for i in 0..5 {
        assert!(talk.speak_without_ack("Echo", message(&format!("m{i}"))));
    }

    wait_for(&mut rx, "recontacted", is_contacted("Echo")).await;
    let mut received = Vec::new();
    while received.len() < 5 {
        let record = wait_for(&mut records, "replayed", |r| matches!(r, CelletRecord::Listened(..))).await;
        let CelletRecord::Listened(session, primitive) = record else {
            unreachable!()
        };
        assert_ne!(session, first_session);
        received.push(text_of(&primitive));
    }
    assert_eq!(received, vec!["m0", "m1", "m2", "m3", "m4"]);
    assert!(!talk.has_backlog("Echo"));
    assert!(talk.is_called("Echo"));
}

#[tokio::test]
async fn test_replay_sends_acked_primitives_first() {
    init_tracing();
    let (peer_listener, port) = FakePeer::listen().await;

    let client = Nucleus::new(config()).unwrap();
    let talk = client.uninterrupted();
    let (listener, mut rx) = channel_listener();
    talk.set_listener("Echo", listener);
    assert_ok!(talk.call("127.0.0.1", port, &["Echo"]));

    let mut peer = FakePeer::accept(&peer_listener).await;
    peer.accept_handshake().await;
    wait_for(&mut rx, "contacted", is_contacted("Echo")).await;
    drop(peer);
    wait_for(&mut rx, "quitted", is_quitted("Echo")).await;

    assert!(talk.speak_without_ack("Echo", message("m1")));
    assert!(talk.speak_with_ack("Echo", message("m2")));
    assert!(talk.speak_without_ack("Echo", message("m3")));
    assert_eq!(talk.backlog_len("Echo"), 3);

    // the recall lands on the same listener
    let mut peer = FakePeer::accept(&peer_listener).await;
    assert_eq!(peer.accept_handshake().await, vec!["Echo"]);

    let mut order = Vec::new();
    for _ in 0..3 {
        let Frame::Dialogue { primitive, ack, .. } = peer.read_non_heartbeat().await else {
            panic!("expected dialogue");
        };
        let primitive = cellet_core::Primitive::decode(&primitive).unwrap();
        order.push((text_of(&primitive), ack));
    }
    assert_eq!(
        order,
        vec![
            ("m2".to_string(), true),
            ("m1".to_string(), false),
            ("m3".to_string(), false),
        ]
    );
}

#[tokio::test]
async fn test_client_hangup_discards_backlog() {
    init_tracing();
    let (peer_listener, port) = FakePeer::listen().await;

    let client = Nucleus::new(config()).unwrap();
    let talk = client.uninterrupted();
    let (listener, mut rx) = channel_listener();
    talk.set_listener("Echo", listener);
    assert_ok!(talk.call("127.0.0.1", port, &["Echo"]));

    let mut peer = FakePeer::accept(&peer_listener).await;
    peer.accept_handshake().await;
    wait_for(&mut rx, "contacted", is_contacted("Echo")).await;
    drop(peer);
    wait_for(&mut rx, "quitted", is_quitted("Echo")).await;
    assert!(talk.speak_with_ack("Echo", message("stranded")));

    talk.hangup("127.0.0.1", port, true);
    assert!(!talk.has_backlog("Echo"));
    assert!(!talk.speak_with_ack("Echo", message("after hangup")));

    // no recall follows a deliberate hangup
    let recall = tokio::time::timeout(Duration::from_millis(400), peer_listener.accept()).await;
    assert!(recall.is_err());
    assert_quiet(&mut rx, Duration::from_millis(100), |e| {
        matches!(e, TalkEvent::Contacted { .. })
    })
    .await;
}

#[tokio::test]
async fn test_unhosted_cellet_is_refused_not_buffered() {
    init_tracing();
    let server = Nucleus::new(config()).unwrap();
    let port = assert_ok!(server.talk_service().start_server("127.0.0.1", 0).await);
    let (echo, mut records) = RecordingCellet::new("Echo", false);
    assert_ok!(server.cellet_service().install(echo));
    assert_ok!(server.cellet_service().activate(port, "Echo"));

    let client = Nucleus::new(config()).unwrap();
    let talk = client.uninterrupted();
    let (echo_listener, mut echo_rx) = channel_listener();
    let (missing_listener, mut missing_rx) = channel_listener();
    talk.set_listener("Echo", echo_listener);
    talk.set_listener("Missing", missing_listener);
    assert_ok!(talk.call("127.0.0.1", port, &["Echo", "Missing"]));

    let failed = wait_for(&mut missing_rx, "not found", |e| matches!(e, TalkEvent::Failed { .. })).await;
    let TalkEvent::Failed { failure, .. } = failed else {
        unreachable!()
    };
    assert_eq!(failure.code, FailureCode::NotFound);
    wait_for(&mut missing_rx, "quitted", is_quitted("Missing")).await;
    wait_for(&mut echo_rx, "contacted", is_contacted("Echo")).await;

    assert!(!talk.speak_with_ack("Missing", message("lost")));
    assert!(!talk.speak_without_ack("Missing", message("lost")));
    assert!(!talk.has_backlog("Missing"));
    assert!(!talk.is_called("Missing"));

    // the hosted cellet on the same connection is unaffected
    assert!(talk.speak_without_ack("Echo", message("hello")));
    let record = wait_for(&mut records, "listened", |r| matches!(r, CelletRecord::Listened(..))).await;
    let CelletRecord::Listened(_, primitive) = record else {
        unreachable!()
    };
    assert_eq!(text_of(&primitive), "hello");
}

#[tokio::test]
async fn test_recall_does_not_redeclare_unhosted_cellet() {
    init_tracing();
    let (peer_listener, port) = FakePeer::listen().await;

    let client = Nucleus::new(config()).unwrap();
    let talk = client.uninterrupted();
    let (listener, mut rx) = channel_listener();
    talk.set_listener("Echo", listener);
    assert_ok!(talk.call("127.0.0.1", port, &["Echo", "Missing"]));

    let mut peer = FakePeer::accept(&peer_listener).await;
    let declared = peer.answer_handshake(Some(&["Echo"])).await;
    assert_eq!(declared, vec!["Echo", "Missing"]);
    wait_for(&mut rx, "contacted", is_contacted("Echo")).await;

    drop(peer);
    wait_for(&mut rx, "quitted", is_quitted("Echo")).await;
    assert!(talk.has_backlog("Echo"));
    assert!(!talk.has_backlog("Missing"));

    let mut peer = FakePeer::accept(&peer_listener).await;
    assert_eq!(peer.accept_handshake().await, vec!["Echo"]);
    wait_for(&mut rx, "recontacted", is_contacted("Echo")).await;
}
