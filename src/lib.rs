//! An HTTP/2 protocol engine core.
//!
//! This crate owns the per-connection state that multiplexes concurrent
//! streams over a single transport: the per-stream state machine, the
//! two-level flow-control credit system, the stream registry with its
//! dependency tree, and the connection lifecycle (SETTINGS, PING,
//! GOAWAY, graceful drain).
//!
//! It deliberately does not own the wire. Frame serialization and HPACK
//! live in an external codec: inbound, [`Connection::run`] consumes any
//! `futures_core::Stream` of decoded [`frame::Frame`]s; outbound,
//! [`Connection::flush`] drives a [`FrameWrite`]. The same core serves
//! both roles; a [`Peer`] picks which stream-id parity is ours.
//!
//! The concurrency model is one reader task (`run`), one writer task
//! (`flush`), and any number of producers writing DATA through
//! [`Stream`] handles. Producers suspend on send credit and on the
//! bounded write queue; credit for one stream never blocks another.

macro_rules! proto_err {
    (conn: $($msg:tt)+) => {
        tracing::debug!("connection error PROTOCOL_ERROR -- {};", format_args!($($msg)+))
    };
    (stream: $($msg:tt)+) => {
        tracing::debug!("stream error -- {};", format_args!($($msg)+))
    };
}

pub mod ciphers;
pub mod codec;
mod error;
pub mod frame;
mod proto;

use std::sync::Arc;
use std::time::Duration;

use http::HeaderMap;

pub use crate::ciphers::is_bad_cipher;
pub use crate::codec::{FrameWrite, RecvError, SendError, UserError};
pub use crate::error::{Error, Reason};
pub use crate::frame::{Pseudo, Settings, StreamId};
pub use crate::proto::peer::Peer;
pub use crate::proto::streams::{Stream, StreamState};
pub use crate::proto::{DEFAULT_RESET_STREAM_GRACE, MAX_WINDOW_SIZE};

use crate::frame::{Frame, PingPayload};
use crate::proto::connection::{Config, ConnectionInner};

/// Configures and builds a [`Connection`].
#[derive(Debug, Clone)]
pub struct Builder {
    peer: Peer,
    settings: Settings,
    reset_stream_grace: Duration,
    write_queue_capacity: usize,
}

impl Builder {
    pub fn new(peer: Peer) -> Builder {
        Builder {
            peer,
            settings: Settings::new(),
            reset_stream_grace: proto::DEFAULT_RESET_STREAM_GRACE,
            write_queue_capacity: proto::DEFAULT_WRITE_QUEUE_CAPACITY,
        }
    }

    /// The INITIAL_WINDOW_SIZE to advertise. Takes effect once the peer
    /// acknowledges our SETTINGS.
    pub fn initial_window_size(&mut self, size: u32) -> &mut Self {
        self.settings
            .set_initial_window_size(size)
            .expect("invalid initial window size");
        self
    }

    /// The MAX_FRAME_SIZE to advertise.
    pub fn max_frame_size(&mut self, size: u32) -> &mut Self {
        self.settings
            .set_max_frame_size(size)
            .expect("invalid max frame size");
        self
    }

    /// Caps how many streams the peer may have active at once.
    pub fn max_concurrent_streams(&mut self, max: u32) -> &mut Self {
        self.settings.set_max_concurrent_streams(max);
        self
    }

    pub fn max_header_list_size(&mut self, size: u32) -> &mut Self {
        self.settings.set_max_header_list_size(size);
        self
    }

    /// Whether the peer may push. Meaningful for clients.
    pub fn enable_push(&mut self, enabled: bool) -> &mut Self {
        self.settings.set_push_enabled(enabled);
        self
    }

    /// How long a closed stream tolerates late frames and lingers in
    /// the registry. Defaults to 5 seconds.
    pub fn reset_stream_grace(&mut self, grace: Duration) -> &mut Self {
        self.reset_stream_grace = grace;
        self
    }

    /// Bound on the outbound frame queue; producers block past it.
    pub fn write_queue_capacity(&mut self, capacity: usize) -> &mut Self {
        assert!(capacity > 0, "write queue needs room for at least one frame");
        self.write_queue_capacity = capacity;
        self
    }

    pub fn build(&self) -> Connection {
        Connection {
            inner: Arc::new(ConnectionInner::new(Config {
                peer: self.peer,
                local_settings: self.settings.clone(),
                reset_stream_grace: self.reset_stream_grace,
                write_queue_capacity: self.write_queue_capacity,
            })),
        }
    }
}

/// One HTTP/2 connection. Cheap to clone; all clones share state.
///
/// Drive [`run`](Connection::run) and [`flush`](Connection::flush) as
/// two tasks, then open or accept streams from anywhere.
#[derive(Clone, Debug)]
pub struct Connection {
    inner: Arc<ConnectionInner>,
}

impl Connection {
    pub fn builder(peer: Peer) -> Builder {
        Builder::new(peer)
    }

    pub fn new(peer: Peer) -> Connection {
        Builder::new(peer).build()
    }

    /// The reader task: dispatches every decoded frame until the
    /// transport closes or a connection error tears things down.
    pub async fn run<R>(&self, frames: R) -> Result<(), Error>
    where
        R: futures_core::Stream<Item = Result<Frame, RecvError>> + Unpin,
    {
        self.inner.run(frames).await
    }

    /// The writer task: drains the outbound queue into the codec until
    /// the connection finishes.
    pub async fn flush<W: FrameWrite>(&self, dst: W) -> Result<(), Error> {
        self.inner.flush(dst).await
    }

    /// Opens a locally-initiated stream, sending HEADERS.
    pub async fn open_stream(
        &self,
        pseudo: Pseudo,
        fields: HeaderMap,
        end_stream: bool,
    ) -> Result<Stream, Error> {
        self.inner.open_stream(pseudo, fields, end_stream).await
    }

    /// Yields the next peer-opened stream: requests on a server,
    /// pushed streams on a client. `None` once the connection is done.
    pub async fn accept(&self) -> Option<Stream> {
        self.inner.accept().await
    }

    /// Reserves a pushed stream with PUSH_PROMISE. Server only.
    pub async fn push_stream(
        &self,
        parent: &Stream,
        pseudo: Pseudo,
        fields: HeaderMap,
    ) -> Result<Stream, Error> {
        self.inner.push_stream(parent, pseudo, fields).await
    }

    /// Round-trips a PING, measuring the time to its ACK.
    pub async fn ping(&self, payload: PingPayload) -> Result<Duration, Error> {
        self.inner.ping(payload).await
    }

    /// Stages a SETTINGS update; it applies once the peer ACKs.
    pub fn send_settings(&self, settings: Settings) -> Result<(), Error> {
        self.inner.send_settings(settings)
    }

    /// Sends GOAWAY and drains: no new streams in either direction,
    /// existing ones run to completion.
    pub fn close(&self, reason: Reason) {
        self.inner.shutdown(reason, None);
    }

    /// Like [`close`](Connection::close), but bounds the drain. Past
    /// the deadline, surviving streams are reset with CANCEL.
    pub fn close_within(&self, reason: Reason, drain: Duration) {
        self.inner.shutdown(reason, Some(drain));
    }

    /// Cuts a drain short immediately.
    pub fn abort_drain(&self) {
        self.inner.abort_drain();
    }

    /// Resolves once a close has fully drained.
    pub async fn drained(&self) {
        futures_util::future::poll_fn(|cx| self.inner.poll_drained(cx)).await
    }

    /// The highest peer-initiated stream id observed so far.
    pub fn last_peer_stream_id(&self) -> StreamId {
        self.inner.last_peer_id()
    }

    /// The GOAWAY we have sent, if any.
    pub fn goaway_sent(&self) -> Option<(StreamId, Reason)> {
        self.inner.goaway_sent()
    }

    /// The GOAWAY the peer has sent, if any.
    pub fn goaway_received(&self) -> Option<(StreamId, Reason)> {
        self.inner.goaway_received()
    }

    /// The settings currently applied for this endpoint.
    pub fn local_settings(&self) -> Settings {
        self.inner.settings.lock().unwrap().local().clone()
    }

    /// The settings the peer has advertised.
    pub fn remote_settings(&self) -> Settings {
        self.inner.settings.lock().unwrap().remote().clone()
    }
}
