//! Cellet installation, activation and server-side dispatch

mod common;

use std::collections::BTreeSet;
use std::sync::Arc;

use cellet_runtime::{
    Cellet, CelletService, Nucleus, Primitive, SessionError, TalkContext, TalkError, TalkService,
};
use common::*;
use tokio_test::{assert_err, assert_ok};

struct Refusing;

impl Cellet for Refusing {
    fn name(&self) -> &str {
        "Refusing"
    }

    fn install(&self) -> bool {
        false
    }

    fn on_listened(&self, _: &CelletService, _: &Arc<TalkContext>, _: &Primitive) {}
}

#[tokio::test]
async fn test_install_and_uninstall() {
    let nucleus = Nucleus::new(config()).unwrap();
    let cellets = nucleus.cellet_service();

    let (echo, _rx) = RecordingCellet::new("Echo", false);
    assert_ok!(cellets.install(echo.clone()));
    let err = assert_err!(cellets.install(echo));
    assert!(matches!(
        err,
        TalkError::Session(SessionError::CelletAlreadyInstalled { .. })
    ));

    let err = assert_err!(cellets.install(Arc::new(Refusing)));
    assert!(matches!(
        err,
        TalkError::Session(SessionError::CelletInstallRefused { .. })
    ));
    assert!(cellets.get_cellet("Refusing").is_none());

    let (alpha, _alpha_rx) = RecordingCellet::new("Alpha", false);
    assert_ok!(cellets.install(alpha));
    let names: Vec<String> = cellets
        .get_cellets()
        .iter()
        .map(|cellet| cellet.name().to_string())
        .collect();
    assert_eq!(names, vec!["Alpha", "Echo"]);

    assert!(cellets.uninstall("Echo"));
    assert!(!cellets.uninstall("Echo"));
    assert!(cellets.get_cellet("Echo").is_none());
}

#[tokio::test]
async fn test_activation_is_idempotent_and_binding_follows_servers() {
    let nucleus = Nucleus::new(config()).unwrap();
    let talk = nucleus.talk_service();
    let cellets = nucleus.cellet_service();
    let first = assert_ok!(talk.start_server("127.0.0.1", 0).await);
    let second = assert_ok!(talk.start_server("127.0.0.1", 0).await);

    let (echo, _rx) = RecordingCellet::new("Echo", false);
    assert_ok!(cellets.install(echo));
    assert!(!cellets.is_bound("Echo"));

    // a port with no server leaves everything unchanged
    let err = assert_err!(cellets.activate(1, "Echo"));
    assert!(matches!(
        err,
        TalkError::Session(SessionError::ServerNotListening { port: 1 })
    ));
    assert!(cellets.work_ports("Echo").is_empty());
    assert!(!cellets.is_bound("Echo"));

    assert_ok!(cellets.activate(first, "Echo"));
    assert_ok!(cellets.activate(first, "Echo"));
    assert_eq!(cellets.work_ports("Echo"), vec![first]);
    assert!(cellets.is_bound("Echo"));

    assert_ok!(cellets.activate(second, "Echo"));
    assert_eq!(cellets.work_ports("Echo"), vec![first, second]);

    assert!(cellets.deactivate(first, "Echo"));
    assert!(cellets.is_bound("Echo"));
    assert!(cellets.deactivate(second, "Echo"));
    assert!(!cellets.is_bound("Echo"));
    assert!(!cellets.deactivate(second, "Echo"));

    let err = assert_err!(cellets.activate(first, "Ghost"));
    assert!(matches!(
        err,
        TalkError::Session(SessionError::CelletNotInstalled { .. })
    ));
}

#[tokio::test]
async fn test_locked_context_refuses_every_send() {
    init_tracing();
    let server = Nucleus::new(config()).unwrap();
    let port = assert_ok!(server.talk_service().start_server("127.0.0.1", 0).await);
    let (echo, mut records) = RecordingCellet::new("Echo", false);
    assert_ok!(server.cellet_service().install(echo));
    assert_ok!(server.cellet_service().activate(port, "Echo"));

    let client = Nucleus::new(config()).unwrap();
    let (listener, mut rx) = channel_listener();
    client.talk_service().set_listener("Echo", listener);
    assert_ok!(client.talk_service().call("127.0.0.1", port, &["Echo"]));
    wait_for(&mut rx, "contacted", is_contacted("Echo")).await;
    wait_for(&mut records, "server contacted", |r| matches!(r, CelletRecord::Contacted(_))).await;

    let cellets = server.cellet_service();
    let contexts = cellets.get_all_context("Echo");
    assert_eq!(contexts.len(), 1);
    let context = contexts[0].clone();
    assert!(cellets.speak("Echo", &context, message("before"), false));
    wait_for(&mut rx, "listened", |e| matches!(e, cellet_runtime::TalkEvent::Listened { .. })).await;

    assert!(cellets.hangup("Echo", &context, false));
    assert!(context.is_locked());
    for ack in [true, false, true] {
        assert!(!cellets.speak("Echo", &context, message("after"), ack));
    }
    wait_for(&mut rx, "quitted", is_quitted("Echo")).await;
    assert_quiet(&mut rx, std::time::Duration::from_millis(200), |e| {
        matches!(e, cellet_runtime::TalkEvent::Listened { .. })
    })
    .await;
}

#[tokio::test]
async fn test_inert_cellet_fails_fast() {
    init_tracing();
    let server = Nucleus::new(config()).unwrap();
    let port = assert_ok!(server.talk_service().start_server("127.0.0.1", 0).await);
    let (echo, mut records) = RecordingCellet::new("Echo", false);
    assert_ok!(server.cellet_service().install(echo));
    assert_ok!(server.cellet_service().activate(port, "Echo"));

    let client = Nucleus::new(config()).unwrap();
    let (listener, mut rx) = channel_listener();
    client.talk_service().set_listener("Echo", listener);
    assert_ok!(client.talk_service().call("127.0.0.1", port, &["Echo"]));
    wait_for(&mut rx, "contacted", is_contacted("Echo")).await;
    wait_for(&mut records, "server contacted", |r| matches!(r, CelletRecord::Contacted(_))).await;

    let cellets = server.cellet_service();
    let context = cellets.get_all_context("Echo").remove(0);
    assert!(cellets.deactivate(port, "Echo"));
    assert!(!cellets.is_bound("Echo"));
    assert!(!cellets.speak("Echo", &context, message("late"), false));
    assert!(!cellets.hangup("Echo", &context, true));
    assert!(!context.is_locked());
}

#[tokio::test]
async fn test_context_of_stopped_server_refuses_sends() {
    init_tracing();
    let server = Nucleus::new(config()).unwrap();
    let port = assert_ok!(server.talk_service().start_server("127.0.0.1", 0).await);
    let (echo, mut records) = RecordingCellet::new("Echo", false);
    assert_ok!(server.cellet_service().install(echo));
    assert_ok!(server.cellet_service().activate(port, "Echo"));

    let client = Nucleus::new(config()).unwrap();
    let (listener, mut rx) = channel_listener();
    client.talk_service().set_listener("Echo", listener);
    assert_ok!(client.talk_service().call("127.0.0.1", port, &["Echo"]));
    wait_for(&mut rx, "contacted", is_contacted("Echo")).await;
    wait_for(&mut records, "server contacted", |r| matches!(r, CelletRecord::Contacted(_))).await;

    let cellets = server.cellet_service();
    let context = cellets.get_all_context("Echo").remove(0);
    assert!(server.talk_service().stop_server(port));
    wait_for(&mut rx, "quitted", is_quitted("Echo")).await;

    // still bound, but the context's server is gone
    assert!(cellets.is_bound("Echo"));
    assert!(!cellets.speak("Echo", &context, message("orphaned"), true));
    assert!(!cellets.speak("Echo", &context, message("orphaned"), false));
    assert!(cellets.get_all_context("Echo").is_empty());
}

#[tokio::test]
async fn test_all_contexts_span_servers_without_duplicates() {
    init_tracing();
    let server = Nucleus::new(config()).unwrap();
    let talk = server.talk_service();
    let first = assert_ok!(talk.start_server("127.0.0.1", 0).await);
    let second = assert_ok!(talk.start_server("127.0.0.1", 0).await);
    let (echo, mut records) = RecordingCellet::new("Echo", false);
    assert_ok!(server.cellet_service().install(echo));
    assert_ok!(server.cellet_service().activate(first, "Echo"));
    assert_ok!(server.cellet_service().activate(second, "Echo"));

    let clients: Vec<Nucleus> = (0..2).map(|_| Nucleus::new(config()).unwrap()).collect();
    let mut receivers = Vec::new();
    for client in &clients {
        let (listener, rx) = channel_listener();
        client.talk_service().set_listener("Echo", listener);
        assert_ok!(client.talk_service().call("127.0.0.1", first, &["Echo"]));
        assert_ok!(client.talk_service().call("127.0.0.1", second, &["Echo"]));
        receivers.push(rx);
    }
    for _ in 0..4 {
        wait_for(&mut records, "server contacted", |r| matches!(r, CelletRecord::Contacted(_))).await;
    }

    let contexts = server.cellet_service().get_all_context("Echo");
    assert_eq!(contexts.len(), 4);
    let sessions: BTreeSet<_> = contexts.iter().map(|context| context.session_id()).collect();
    assert_eq!(sessions.len(), 4);
    let ports: BTreeSet<u16> = contexts.iter().map(|context| context.port()).collect();
    assert_eq!(ports, BTreeSet::from([first, second]));
}
