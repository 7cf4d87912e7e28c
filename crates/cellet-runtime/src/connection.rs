//! One physical TCP connection
//!
//! A `Connection` owns a writer task fed through an unbounded queue and a
//! reader task that decodes frames and hands them to a [`FrameHandler`]. It
//! also owns the per-connection dialogue sequence and the table of sends
//! waiting for an ack. Whichever of ack arrival and timer expiry removes a
//! pending entry first wins, so each send resolves exactly once.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock, Weak};
use std::time::Duration;

use cellet_core::{
    FailureCode, Frame, FrameHeader, Primitive, TalkAddr, TalkFailure,
    frame::{encode_frame, FRAME_HEADER_SIZE},
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::{AbortHandle, JoinHandle};
use tracing::{debug, trace, warn, Instrument};

use crate::heartbeat::HeartbeatDriver;
use crate::sync::lock;

// ----------------------------------------------------------------------------
// Handler Interface
// ----------------------------------------------------------------------------

/// Why a connection finished
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub(crate) enum CloseCause {
    /// Local hangup or server stop
    #[error("hung up")]
    Hangup,
    /// The peer closed its side cleanly
    #[error("closed by peer")]
    PeerClosed,
    /// Socket error
    #[error("socket error: {0}")]
    Io(String),
    /// The byte stream can no longer be framed
    #[error("corrupt stream: {0}")]
    Corrupt(String),
    /// Handshake rejected or timed out
    #[error("handshake failed: {0}")]
    Handshake(String),
    /// Two heartbeat intervals of silence
    #[error("heartbeat timeout")]
    HeartbeatTimeout,
}

impl CloseCause {
    /// The failure to report before quitting, if this close is a failure
    pub fn failure(&self) -> Option<TalkFailure> {
        match self {
            CloseCause::Hangup | CloseCause::PeerClosed => None,
            CloseCause::Io(reason) => Some(TalkFailure::new(FailureCode::TalkLost, reason.clone())),
            CloseCause::Corrupt(reason) => {
                Some(TalkFailure::new(FailureCode::IncorrectData, reason.clone()))
            }
            CloseCause::Handshake(reason) => {
                Some(TalkFailure::new(FailureCode::HandshakeFailed, reason.clone()))
            }
            CloseCause::HeartbeatTimeout => Some(TalkFailure::new(
                FailureCode::HeartbeatTimeout,
                "no traffic for two heartbeat intervals",
            )),
        }
    }
}

/// Receives decoded frames and the final close of a connection
pub(crate) trait FrameHandler: Send + Sync {
    fn on_frame(&self, connection: &Arc<Connection>, frame: Frame);

    /// Called exactly once per connection
    fn on_closed(&self, connection: &Arc<Connection>, cause: CloseCause);
}

// ----------------------------------------------------------------------------
// Connection
// ----------------------------------------------------------------------------

enum Outbound {
    Frame(Vec<u8>),
    Close,
}

struct PendingAck {
    cellet: String,
    primitive: Primitive,
    timer: AbortHandle,
}

/// Socket halves waiting for `Connection::start`
pub(crate) struct ConnectionIo {
    reader: OwnedReadHalf,
    writer: OwnedWriteHalf,
    outbound: mpsc::UnboundedReceiver<Outbound>,
}

pub(crate) struct Connection {
    id: u64,
    remote: TalkAddr,
    max_frame_len: u32,
    heartbeat: Arc<HeartbeatDriver>,
    outbound: mpsc::UnboundedSender<Outbound>,
    next_seq: AtomicU64,
    pending: Mutex<HashMap<u64, PendingAck>>,
    closing: AtomicBool,
    finished: AtomicBool,
    handler: OnceLock<Weak<dyn FrameHandler>>,
    reader: Mutex<Option<JoinHandle<()>>>,
    writer: Mutex<Option<JoinHandle<()>>>,
}

impl Connection {
    /// Wrap a connected stream; I/O begins with [`Connection::start`]
    pub fn new(
        stream: TcpStream,
        id: u64,
        remote: TalkAddr,
        max_frame_len: u32,
        heartbeat: Arc<HeartbeatDriver>,
    ) -> (Arc<Self>, ConnectionIo) {
        if let Err(e) = stream.set_nodelay(true) {
            debug!("set_nodelay failed for {}: {}", remote, e);
        }
        let (reader, writer) = stream.into_split();
        let (tx, rx) = mpsc::unbounded_channel();
        let connection = Arc::new(Self {
            id,
            remote,
            max_frame_len,
            heartbeat,
            outbound: tx,
            next_seq: AtomicU64::new(1),
            pending: Mutex::new(HashMap::new()),
            closing: AtomicBool::new(false),
            finished: AtomicBool::new(false),
            handler: OnceLock::new(),
            reader: Mutex::new(None),
            writer: Mutex::new(None),
        });
        let io = ConnectionIo {
            reader,
            writer,
            outbound: rx,
        };
        (connection, io)
    }

    /// Spawn the reader and writer tasks
    pub fn start(self: &Arc<Self>, io: ConnectionIo, handler: Weak<dyn FrameHandler>) {
        if self.handler.set(handler).is_err() {
            warn!("connection {} started twice", self.id);
            return;
        }
        let span = tracing::debug_span!("connection", id = self.id, remote = %self.remote);

        let writer = tokio::spawn(write_loop(io.writer, io.outbound).instrument(span.clone()));
        *lock(&self.writer) = Some(writer);

        let connection = self.clone();
        let reader = tokio::spawn(
            async move {
                let cause = read_loop(&connection, io.reader).await;
                connection.finish(cause);
            }
            .instrument(span),
        );
        *lock(&self.reader) = Some(reader);
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn remote(&self) -> &TalkAddr {
        &self.remote
    }

    pub fn is_closing(&self) -> bool {
        self.closing.load(Ordering::Acquire)
    }

    /// Queue a frame; false if the connection is closing or the frame is unencodable
    pub fn send_frame(&self, frame: &Frame) -> bool {
        if self.is_closing() {
            return false;
        }
        match encode_frame(frame, self.max_frame_len) {
            Ok(bytes) => {
                trace!("-> {} {}", self.remote, frame.kind());
                self.outbound.send(Outbound::Frame(bytes)).is_ok()
            }
            Err(e) => {
                warn!("cannot encode {} frame for {}: {}", frame.kind(), self.remote, e);
                false
            }
        }
    }

    /// Send a primitive to `cellet`
    ///
    /// With `ack`, the send is registered before the frame is queued and
    /// `on_timeout` runs once if no ack resolves it within `timeout`.
    pub fn send_dialogue<F>(
        self: &Arc<Self>,
        cellet: &str,
        primitive: &Primitive,
        ack: bool,
        timeout: Duration,
        on_timeout: F,
    ) -> bool
    where
        F: FnOnce(String, Primitive) + Send + 'static,
    {
        if self.is_closing() {
            return false;
        }
        let body = match primitive.encode() {
            Ok(body) => body,
            Err(e) => {
                warn!("cannot encode primitive for {}: {}", cellet, e);
                return false;
            }
        };
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);

        if ack {
            // the timer cannot expire the entry before it is inserted
            let mut pending = lock(&self.pending);
            let connection = self.clone();
            let timer = tokio::spawn(async move {
                tokio::time::sleep(timeout).await;
                if let Some((cellet, primitive)) = connection.expire(seq) {
                    debug!("ack for seq {} to {} timed out", seq, connection.remote);
                    on_timeout(cellet, primitive);
                }
            });
            pending.insert(
                seq,
                PendingAck {
                    cellet: cellet.to_string(),
                    primitive: primitive.clone(),
                    timer: timer.abort_handle(),
                },
            );
        }

        let frame = Frame::Dialogue {
            seq,
            cellet: cellet.to_string(),
            ack,
            primitive: body,
        };
        if self.send_frame(&frame) {
            true
        } else {
            if ack {
                if let Some(pending) = lock(&self.pending).remove(&seq) {
                    pending.timer.abort();
                }
            }
            false
        }
    }

    /// Resolve a pending send on ack arrival; None for late or unknown acks
    pub fn resolve_ack(&self, seq: u64) -> Option<(String, Primitive)> {
        let pending = lock(&self.pending).remove(&seq)?;
        pending.timer.abort();
        Some((pending.cellet, pending.primitive))
    }

    fn expire(&self, seq: u64) -> Option<(String, Primitive)> {
        lock(&self.pending)
            .remove(&seq)
            .map(|pending| (pending.cellet, pending.primitive))
    }

    pub fn pending_acks(&self) -> usize {
        lock(&self.pending).len()
    }

    /// Close the connection
    ///
    /// `now` drops queued bytes; otherwise the writer drains for at most
    /// `drain` before the socket is torn down.
    pub fn close(self: &Arc<Self>, now: bool, drain: Duration) {
        if self.closing.swap(true, Ordering::AcqRel) {
            return;
        }
        if now {
            self.abort_tasks();
            self.finish(CloseCause::Hangup);
            return;
        }

        let _ = self.outbound.send(Outbound::Close);
        let writer = lock(&self.writer).take();
        let connection = self.clone();
        tokio::spawn(async move {
            if let Some(writer) = writer {
                let abort = writer.abort_handle();
                if tokio::time::timeout(drain, writer).await.is_err() {
                    debug!("drain of {} exceeded {:?}, dropping queued bytes", connection.remote, drain);
                    abort.abort();
                }
            }
            connection.abort_tasks();
            connection.finish(CloseCause::Hangup);
        });
    }

    /// Tear the connection down at once with a failure cause
    pub fn abort(self: &Arc<Self>, cause: CloseCause) {
        self.closing.store(true, Ordering::Release);
        self.abort_tasks();
        self.finish(cause);
    }

    fn abort_tasks(&self) {
        if let Some(writer) = lock(&self.writer).take() {
            writer.abort();
        }
        if let Some(reader) = lock(&self.reader).take() {
            reader.abort();
        }
    }

    fn handler(&self) -> Option<Arc<dyn FrameHandler>> {
        self.handler.get().and_then(Weak::upgrade)
    }

    fn finish(self: &Arc<Self>, cause: CloseCause) {
        if self.finished.swap(true, Ordering::AcqRel) {
            return;
        }
        self.closing.store(true, Ordering::Release);
        self.abort_tasks();
        self.heartbeat.unregister(self);
        debug!("connection {} to {} closed: {}", self.id, self.remote, cause);
        if let Some(handler) = self.handler() {
            handler.on_closed(self, cause);
        }
    }
}

// ----------------------------------------------------------------------------
// I/O Loops
// ----------------------------------------------------------------------------

async fn write_loop(mut writer: OwnedWriteHalf, mut outbound: mpsc::UnboundedReceiver<Outbound>) {
    while let Some(item) = outbound.recv().await {
        match item {
            Outbound::Frame(bytes) => {
                if let Err(e) = writer.write_all(&bytes).await {
                    debug!("write failed: {}", e);
                    break;
                }
            }
            Outbound::Close => break,
        }
    }
    let _ = writer.shutdown().await;
}

async fn read_loop(connection: &Arc<Connection>, mut reader: OwnedReadHalf) -> CloseCause {
    let mut header = [0u8; FRAME_HEADER_SIZE];
    loop {
        if let Err(e) = reader.read_exact(&mut header).await {
            return io_cause(e);
        }
        let parsed = match FrameHeader::parse(header, connection.max_frame_len) {
            Ok(parsed) => parsed,
            Err(e) => {
                warn!("unrecoverable framing from {}: {}", connection.remote, e);
                return CloseCause::Corrupt(e.to_string());
            }
        };

        let mut body = vec![0u8; parsed.len];
        if let Err(e) = reader.read_exact(&mut body).await {
            return io_cause(e);
        }
        connection.heartbeat.touch(&connection.remote);

        match parsed.decode_body(&body) {
            Ok(frame) => {
                trace!("<- {} {}", connection.remote, frame.kind());
                match connection.handler() {
                    Some(handler) => handler.on_frame(connection, frame),
                    None => return CloseCause::Hangup,
                }
            }
            Err(e) => warn!("dropping frame from {}: {}", connection.remote, e),
        }
    }
}

fn io_cause(error: std::io::Error) -> CloseCause {
    match error.kind() {
        std::io::ErrorKind::UnexpectedEof => CloseCause::PeerClosed,
        _ => CloseCause::Io(error.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_close_causes_map_to_failures() {
        assert_eq!(CloseCause::Hangup.failure(), None);
        assert_eq!(CloseCause::PeerClosed.failure(), None);
        assert_eq!(
            CloseCause::HeartbeatTimeout.failure().map(|f| f.code),
            Some(FailureCode::HeartbeatTimeout)
        );
        assert_eq!(
            CloseCause::Corrupt("len".into()).failure().map(|f| f.code),
            Some(FailureCode::IncorrectData)
        );
        assert_eq!(
            CloseCause::Io("reset".into()).failure().map(|f| f.code),
            Some(FailureCode::TalkLost)
        );
    }
}
