//! Shared helpers for runtime integration tests

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use cellet_core::frame::DEFAULT_MAX_FRAME_LEN;
use cellet_core::{decode_frame, encode_frame, Frame, FrameDecodeError};
use cellet_runtime::{
    Cellet, CelletService, NucleusConfig, Primitive, SessionId, Stuff, TalkAddr, TalkContext,
    TalkEvent, TalkFailure, TalkListener,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

pub const WAIT: Duration = Duration::from_secs(5);

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();
}

pub fn config() -> NucleusConfig {
    NucleusConfig::testing()
}

pub fn message(text: &str) -> Primitive {
    Primitive::new().with(Stuff::subject(text))
}

pub fn text_of(primitive: &Primitive) -> String {
    primitive
        .subjects()
        .next()
        .and_then(|literal| literal.as_str())
        .unwrap_or_default()
        .to_string()
}

// ----------------------------------------------------------------------------
// Client-side listener
// ----------------------------------------------------------------------------

/// Forwards every callback as a `TalkEvent` into a channel
pub struct ChannelListener {
    tx: mpsc::UnboundedSender<TalkEvent>,
}

pub fn channel_listener() -> (Arc<ChannelListener>, mpsc::UnboundedReceiver<TalkEvent>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (Arc::new(ChannelListener { tx }), rx)
}

impl TalkListener for ChannelListener {
    fn on_listened(&self, speaker: &TalkAddr, cellet: &str, primitive: &Primitive) {
        let _ = self.tx.send(TalkEvent::Listened {
            speaker: speaker.clone(),
            cellet: cellet.to_string(),
            primitive: primitive.clone(),
        });
    }

    fn on_spoke(&self, speaker: &TalkAddr, cellet: &str, primitive: &Primitive) {
        let _ = self.tx.send(TalkEvent::Spoke {
            speaker: speaker.clone(),
            cellet: cellet.to_string(),
            primitive: primitive.clone(),
        });
    }

    fn on_ack(&self, speaker: &TalkAddr, cellet: &str, primitive: &Primitive) {
        let _ = self.tx.send(TalkEvent::Ack {
            speaker: speaker.clone(),
            cellet: cellet.to_string(),
            primitive: primitive.clone(),
        });
    }

    fn on_speak_timeout(&self, speaker: &TalkAddr, cellet: &str, primitive: &Primitive) {
        let _ = self.tx.send(TalkEvent::SpeakTimeout {
            speaker: speaker.clone(),
            cellet: cellet.to_string(),
            primitive: primitive.clone(),
        });
    }

    fn on_contacted(&self, speaker: &TalkAddr, cellet: &str) {
        let _ = self.tx.send(TalkEvent::Contacted {
            speaker: speaker.clone(),
            cellet: cellet.to_string(),
        });
    }

    fn on_quitted(&self, speaker: &TalkAddr, cellet: &str) {
        let _ = self.tx.send(TalkEvent::Quitted {
            speaker: speaker.clone(),
            cellet: cellet.to_string(),
        });
    }

    fn on_failed(&self, speaker: &TalkAddr, cellet: &str, failure: &TalkFailure) {
        let _ = self.tx.send(TalkEvent::Failed {
            speaker: speaker.clone(),
            cellet: cellet.to_string(),
            failure: failure.clone(),
        });
    }
}

/// Skip events until one matches
pub async fn wait_for<T, F>(rx: &mut mpsc::UnboundedReceiver<T>, what: &str, mut matches: F) -> T
where
    F: FnMut(&T) -> bool,
{
    let found = tokio::time::timeout(WAIT, async {
        while let Some(event) = rx.recv().await {
            if matches(&event) {
                return Some(event);
            }
        }
        None
    })
    .await;
    match found {
        Ok(Some(event)) => event,
        Ok(None) => panic!("channel closed while waiting for {what}"),
        Err(_) => panic!("timed out waiting for {what}"),
    }
}

/// Nothing matching arrives within `window`
pub async fn assert_quiet<T, F>(rx: &mut mpsc::UnboundedReceiver<T>, window: Duration, mut matches: F)
where
    T: std::fmt::Debug,
    F: FnMut(&T) -> bool,
{
    let deadline = tokio::time::Instant::now() + window;
    while let Ok(Some(event)) = tokio::time::timeout_at(deadline, rx.recv()).await {
        assert!(!matches(&event), "unexpected event {event:?}");
    }
}

pub fn is_contacted(cellet: &'static str) -> impl FnMut(&TalkEvent) -> bool {
    move |event| matches!(event, TalkEvent::Contacted { cellet: c, .. } if c == cellet)
}

pub fn is_quitted(cellet: &'static str) -> impl FnMut(&TalkEvent) -> bool {
    move |event| matches!(event, TalkEvent::Quitted { cellet: c, .. } if c == cellet)
}

// ----------------------------------------------------------------------------
// Server-side cellet
// ----------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub enum CelletRecord {
    Contacted(SessionId),
    Listened(SessionId, Primitive),
    Ack(SessionId, Primitive),
    SpeakTimeout(SessionId, Primitive),
    Quitted(SessionId),
}

/// Records every callback; optionally echoes what it hears with an ack
pub struct RecordingCellet {
    name: String,
    echo: bool,
    tx: mpsc::UnboundedSender<CelletRecord>,
}

impl RecordingCellet {
    pub fn new(name: &str, echo: bool) -> (Arc<Self>, mpsc::UnboundedReceiver<CelletRecord>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let cellet = Arc::new(Self {
            name: name.to_string(),
            echo,
            tx,
        });
        (cellet, rx)
    }
}

impl Cellet for RecordingCellet {
    fn name(&self) -> &str {
        &self.name
    }

    fn on_contacted(&self, _service: &CelletService, context: &Arc<TalkContext>) {
        let _ = self.tx.send(CelletRecord::Contacted(context.session_id()));
    }

    fn on_listened(&self, service: &CelletService, context: &Arc<TalkContext>, primitive: &Primitive) {
        let _ = self
            .tx
            .send(CelletRecord::Listened(context.session_id(), primitive.clone()));
        if self.echo {
            service.speak_with_ack(context, primitive.clone());
        }
    }

    fn on_ack(&self, _service: &CelletService, context: &Arc<TalkContext>, primitive: &Primitive) {
        let _ = self
            .tx
            .send(CelletRecord::Ack(context.session_id(), primitive.clone()));
    }

    fn on_speak_timeout(&self, _service: &CelletService, context: &Arc<TalkContext>, primitive: &Primitive) {
        let _ = self
            .tx
            .send(CelletRecord::SpeakTimeout(context.session_id(), primitive.clone()));
    }

    fn on_quitted(&self, _service: &CelletService, context: &Arc<TalkContext>) {
        let _ = self.tx.send(CelletRecord::Quitted(context.session_id()));
    }
}

// ----------------------------------------------------------------------------
// Raw peer
// ----------------------------------------------------------------------------

/// A hand-driven server speaking the frame format directly
pub struct FakePeer {
    stream: TcpStream,
    buf: Vec<u8>,
}

impl FakePeer {
    pub async fn listen() -> (TcpListener, u16) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        (listener, port)
    }

    pub async fn accept(listener: &TcpListener) -> Self {
        let (stream, _) = tokio::time::timeout(WAIT, listener.accept())
            .await
            .expect("no connection")
            .unwrap();
        Self {
            stream,
            buf: Vec::new(),
        }
    }

    pub async fn read_frame(&mut self) -> Frame {
        loop {
            match decode_frame(&self.buf, DEFAULT_MAX_FRAME_LEN) {
                Ok((frame, consumed)) => {
                    self.buf.drain(..consumed);
                    return frame;
                }
                Err(FrameDecodeError::NeedMore) => {}
                Err(FrameDecodeError::Dropped { consumed, .. }) => {
                    self.buf.drain(..consumed);
                    continue;
                }
                Err(FrameDecodeError::Unrecoverable(e)) => panic!("bad framing: {e}"),
            }
            let mut chunk = [0u8; 4096];
            let n = tokio::time::timeout(WAIT, self.stream.read(&mut chunk))
                .await
                .expect("peer read timed out")
                .unwrap();
            assert!(n > 0, "client closed the connection");
            self.buf.extend_from_slice(&chunk[..n]);
        }
    }

    /// Read until a frame other than a heartbeat arrives
    pub async fn read_non_heartbeat(&mut self) -> Frame {
        loop {
            match self.read_frame().await {
                Frame::Heartbeat | Frame::HeartbeatAck => continue,
                frame => return frame,
            }
        }
    }

    pub async fn send(&mut self, frame: &Frame) {
        let bytes = encode_frame(frame, DEFAULT_MAX_FRAME_LEN).unwrap();
        self.stream.write_all(&bytes).await.unwrap();
    }

    /// Answer the client's handshake, accepting every declared name
    pub async fn accept_handshake(&mut self) -> Vec<String> {
        self.answer_handshake(None).await
    }

    /// Answer the client's handshake, rejecting names outside `hosted`
    pub async fn answer_handshake(&mut self, hosted: Option<&[&str]>) -> Vec<String> {
        let Frame::Handshake { cellets, .. } = self.read_non_heartbeat().await else {
            panic!("expected a handshake");
        };
        let (accepted, rejected): (Vec<String>, Vec<String>) = cellets
            .iter()
            .cloned()
            .partition(|name| hosted.map_or(true, |hosted| hosted.contains(&name.as_str())));
        self.send(&Frame::HandshakeAck {
            version: cellet_core::PROTOCOL_VERSION,
            tag: "fake-peer".to_string(),
            accepted,
            rejected,
        })
        .await;
        cellets
    }
}
