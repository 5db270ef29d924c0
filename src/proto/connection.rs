use http::HeaderMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use futures_core::Stream as FrameStream;
use futures_util::future::poll_fn;
use futures_util::task::AtomicWaker;

use crate::codec::{FrameWrite, RecvError, UserError};
use crate::error::Error;
use crate::frame::{
    self, Frame, PingPayload, Pseudo, Reason, Settings, StreamId,
    DEFAULT_INITIAL_WINDOW_SIZE,
};
use crate::proto::go_away::GoAway;
use crate::proto::peer::Peer;
use crate::proto::ping_pong::PingPong;
use crate::proto::settings::SettingsState;
use crate::proto::streams::{
    CloseSignal, Direction, Store, Stream, StreamInner, StreamState, Transition, TransitionError,
};
use crate::proto::write_queue::WriteQueue;

#[derive(Debug, Clone)]
pub(crate) struct Config {
    pub peer: Peer,
    pub local_settings: Settings,
    pub reset_stream_grace: Duration,
    pub write_queue_capacity: usize,
}

#[derive(Debug)]
pub(crate) struct AcceptQueue {
    queue: Mutex<std::collections::VecDeque<Stream>>,
    waker: AtomicWaker,
}

/// The shared connection state: settings, registry, writer queue,
/// lifecycle flags. One reader task dispatches into it, one writer task
/// drains the queue, any number of producers go through stream handles.
pub(crate) struct ConnectionInner {
    pub config: Config,
    pub settings: Mutex<SettingsState>,
    pub store: Store,
    /// The synthetic stream carrying the connection-level flow
    /// controllers.
    pub conn_stream: Arc<StreamInner>,
    pub queue: WriteQueue,
    pub go_away: Mutex<GoAway>,
    pub ping_pong: PingPong,
    pub accept: AcceptQueue,
    /// Fatal-or-finished signal; producers race their suspensions
    /// against it.
    pub close: CloseSignal,
    /// Graceful drain completed.
    pub drained: CloseSignal,
    pub error: Mutex<Option<Reason>>,
    next_stream_id: Mutex<Option<StreamId>>,
    last_peer_id: AtomicU32,
    span: tracing::Span,
}

impl ConnectionInner {
    pub fn new(config: Config) -> ConnectionInner {
        let conn_stream = Arc::new(StreamInner::new(StreamId::ZERO));
        // Connection-level windows always start at the protocol default;
        // SETTINGS never moves them, only WINDOW_UPDATE does.
        conn_stream.arm_flow(DEFAULT_INITIAL_WINDOW_SIZE, DEFAULT_INITIAL_WINDOW_SIZE);

        let max_remote = config.local_settings.max_concurrent_streams();
        let span = tracing::debug_span!("Connection", peer = %config.peer);

        let inner = ConnectionInner {
            settings: Mutex::new(SettingsState::new(config.local_settings.clone())),
            store: Store::new(config.peer, max_remote),
            conn_stream,
            queue: WriteQueue::new(config.write_queue_capacity),
            go_away: Mutex::new(GoAway::new()),
            ping_pong: PingPong::new(),
            accept: AcceptQueue {
                queue: Mutex::new(std::collections::VecDeque::new()),
                waker: AtomicWaker::new(),
            },
            close: CloseSignal::new(),
            drained: CloseSignal::new(),
            error: Mutex::new(None),
            next_stream_id: Mutex::new(Some(config.peer.first_stream_id())),
            last_peer_id: AtomicU32::new(0),
            span,
            config,
        };

        // The opening SETTINGS frame; pending until the peer ACKs it.
        inner
            .queue
            .push_ctrl(inner.config.local_settings.clone().into());

        inner
    }

    pub fn error_reason(&self) -> Option<Reason> {
        *self.error.lock().unwrap()
    }

    pub fn remote_max_frame_size(&self) -> u32 {
        self.settings.lock().unwrap().remote().max_frame_size()
    }

    pub(crate) fn local_initial_window(&self) -> u32 {
        self.settings.lock().unwrap().local().initial_window_size()
    }

    pub(crate) fn remote_initial_window(&self) -> u32 {
        self.settings.lock().unwrap().remote().initial_window_size()
    }

    pub(crate) fn last_peer_id(&self) -> StreamId {
        self.last_peer_id.load(Ordering::Acquire).into()
    }

    fn observe_peer_id(&self, id: StreamId) {
        self.last_peer_id.store(u32::from(id), Ordering::Release);
    }

    fn grace(&self) -> Duration {
        self.config.reset_stream_grace
    }

    // ===== reader task =====

    pub async fn run<R>(self: &Arc<Self>, mut frames: R) -> Result<(), Error>
    where
        R: FrameStream<Item = Result<Frame, RecvError>> + Unpin,
    {
        loop {
            self.check_drain_deadline();

            let next = poll_fn(|cx| Pin::new(&mut frames).poll_next(cx)).await;

            let frame = match next {
                None => {
                    tracing::trace!(parent: &self.span, "transport closed");
                    self.recv_eof();
                    return Ok(());
                }
                Some(Ok(frame)) => frame,
                Some(Err(e)) => match self.recv_failure(e) {
                    Some(err) => return Err(err),
                    None => continue,
                },
            };

            match self.recv_frame(frame) {
                Ok(()) => {}
                Err(e) => match self.recv_failure(e) {
                    Some(err) => return Err(err),
                    None => continue,
                },
            }
        }
    }

    /// Converts a receive error into either a terminated connection
    /// (`Some`) or a handled stream error (`None`).
    fn recv_failure(&self, err: RecvError) -> Option<Error> {
        match err {
            RecvError::Stream { id, reason } => {
                tracing::trace!(parent: &self.span, ?id, ?reason, "stream error");
                self.stream_error(id, reason);
                None
            }
            RecvError::Connection(reason) => {
                tracing::debug!(parent: &self.span, ?reason, "connection error");
                self.connection_error(reason);
                Some(reason.into())
            }
            RecvError::Io(e) => {
                tracing::debug!(parent: &self.span, error = ?e, "transport error");
                self.fatal_teardown(None);
                Some(Error::from_io(e))
            }
        }
    }

    fn recv_frame(self: &Arc<Self>, frame: Frame) -> Result<(), RecvError> {
        self.store.purge_expired(self.grace());

        tracing::trace!(parent: &self.span, ?frame, "recv");

        match frame {
            Frame::Headers(frame) => self.recv_headers(frame),
            Frame::Data(frame) => self.recv_data(frame),
            Frame::Reset(frame) => self.recv_reset(frame),
            Frame::PushPromise(frame) => self.recv_push_promise(frame),
            Frame::Settings(frame) => self.recv_settings(frame),
            Frame::GoAway(frame) => self.recv_go_away(frame),
            Frame::Ping(frame) => self.recv_ping(frame),
            Frame::WindowUpdate(frame) => self.recv_window_update(frame),
            Frame::Priority(frame) => self.recv_priority(frame),
        }
    }

    fn recv_headers(self: &Arc<Self>, frame: frame::Headers) -> Result<(), RecvError> {
        let id = frame.stream_id();
        if id.is_zero() {
            proto_err!(conn: "HEADERS on stream 0");
            return Err(RecvError::Connection(Reason::PROTOCOL_ERROR));
        }

        if frame::check_fields(frame.fields()).is_err() {
            return Err(RecvError::Stream {
                id,
                reason: Reason::PROTOCOL_ERROR,
            });
        }

        if let Some(dep) = frame.stream_dep() {
            if dep.dependency_id() == id {
                return Err(RecvError::Stream {
                    id,
                    reason: Reason::PROTOCOL_ERROR,
                });
            }
            self.store
                .reparent(id, dep.dependency_id(), dep.weight(), dep.is_exclusive());
        }

        match self.store.get(id) {
            Some(stream) => self.recv_headers_on(stream, frame),
            None => self.recv_open(frame),
        }
    }

    /// HEADERS on a stream we already track: trailers, or the
    /// activation of a pushed stream.
    fn recv_headers_on(
        &self,
        stream: Arc<StreamInner>,
        frame: frame::Headers,
    ) -> Result<(), RecvError> {
        let id = stream.id;
        let eos = frame.is_end_stream();

        let t = match stream.transition(Direction::Recv, frame::Kind::Headers, eos, self.grace()) {
            Ok(t) => t,
            Err(e) => return self.map_recv_transition(id, e),
        };

        if t.from == StreamState::ReservedRemote {
            // A promised stream activates; it starts counting now.
            if !self.store.counts.try_inc_remote() {
                self.force_close(&stream, Some(Reason::REFUSED_STREAM), true);
                return Err(RecvError::Stream {
                    id,
                    reason: Reason::REFUSED_STREAM,
                });
            }
            stream.counted.store(true, Ordering::Release);
            stream.arm_flow(self.remote_initial_window(), self.local_initial_window());
        }

        let trailers = frame.is_trailers();
        let (pseudo, fields) = frame.into_parts();
        {
            let mut buf = stream.recv.lock().unwrap();
            if trailers && buf.headers.is_none() {
                // Trailers with no preceding header block cannot happen
                // on a coherent codec; treat as malformed.
                return Err(RecvError::Stream {
                    id,
                    reason: Reason::PROTOCOL_ERROR,
                });
            }
            if !trailers && buf.headers.is_some() {
                // A second non-trailer header block is malformed.
                return Err(RecvError::Stream {
                    id,
                    reason: Reason::PROTOCOL_ERROR,
                });
            }
            if trailers {
                buf.trailers = Some(fields);
            } else {
                buf.headers = Some((pseudo, fields));
            }
            if eos {
                buf.end_of_stream = true;
            }
        }
        stream.recv_waker.wake();

        self.finish_transition(&stream, t, None);
        Ok(())
    }

    /// HEADERS opening a new peer-initiated stream.
    fn recv_open(self: &Arc<Self>, frame: frame::Headers) -> Result<(), RecvError> {
        let id = frame.stream_id();

        if self.config.peer.is_local_init(id) {
            // A locally-initiated id we no longer (or never) track.
            proto_err!(conn: "HEADERS on unknown local stream {:?}", id);
            return Err(RecvError::Connection(Reason::PROTOCOL_ERROR));
        }

        if id <= self.last_peer_id() {
            // Closed and forgotten; HEADERS is not tolerated there.
            proto_err!(conn: "HEADERS on forgotten stream {:?}", id);
            return Err(RecvError::Connection(Reason::PROTOCOL_ERROR));
        }

        if self.go_away.lock().unwrap().sent().is_some() {
            // We are going away; refuse anything new.
            return Err(RecvError::Stream {
                id,
                reason: Reason::REFUSED_STREAM,
            });
        }

        self.observe_peer_id(id);

        if !self.store.counts.try_inc_remote() {
            return Err(RecvError::Stream {
                id,
                reason: Reason::REFUSED_STREAM,
            });
        }

        let stream = Arc::new(StreamInner::new(id));
        stream.counted.store(true, Ordering::Release);
        stream.arm_flow(self.remote_initial_window(), self.local_initial_window());

        let eos = frame.is_end_stream();
        let t = stream
            .transition(Direction::Recv, frame::Kind::Headers, eos, self.grace())
            .expect("fresh streams accept HEADERS");

        let (pseudo, fields) = frame.into_parts();
        {
            let mut buf = stream.recv.lock().unwrap();
            buf.headers = Some((pseudo, fields));
            if eos {
                buf.end_of_stream = true;
            }
        }

        self.store.insert(stream.clone());
        self.finish_transition(&stream, t, None);

        self.accept.queue.lock().unwrap().push_back(Stream {
            inner: stream,
            conn: self.clone(),
        });
        self.accept.waker.wake();

        Ok(())
    }

    fn recv_data(&self, frame: frame::Data) -> Result<(), RecvError> {
        let id = frame.stream_id();
        if id.is_zero() {
            proto_err!(conn: "DATA on stream 0");
            return Err(RecvError::Connection(Reason::PROTOCOL_ERROR));
        }

        let len = frame.flow_controlled_len();

        let stream = match self.store.get(id) {
            Some(stream) => stream,
            None => {
                proto_err!(conn: "DATA on unknown stream {:?}", id);
                return Err(RecvError::Connection(Reason::PROTOCOL_ERROR));
            }
        };

        let eos = frame.is_end_stream();
        match stream.transition(Direction::Recv, frame::Kind::Data, eos, self.grace()) {
            Ok(t) => {
                self.consume_recv(Some(&stream), len)?;

                let payload = frame.into_payload();

                // Padding never reaches the application; its share of
                // the windows comes straight back.
                let padding = len - payload.len() as u32;
                self.return_recv(Some(&stream), padding)?;

                {
                    let mut buf = stream.recv.lock().unwrap();
                    if !payload.is_empty() {
                        buf.queue.push_back(payload);
                    }
                    if eos {
                        buf.end_of_stream = true;
                    }
                }
                stream.recv_waker.wake();

                self.finish_transition(&stream, t, None);
                Ok(())
            }
            Err(TransitionError::Ignore) => {
                // Late DATA on a reset stream still spends connection
                // credit; hand it straight back.
                self.consume_recv(None, len)?;
                self.return_recv(None, len)?;
                Ok(())
            }
            Err(e) => self.map_recv_transition(id, e),
        }
    }

    /// Returns receive credit that will never be delivered, connection
    /// level first.
    fn return_recv(&self, stream: Option<&Arc<StreamInner>>, n: u32) -> Result<(), RecvError> {
        if n == 0 {
            return Ok(());
        }

        let update = self
            .conn_stream
            .recv_flow
            .lock()
            .unwrap()
            .return_bytes(n)
            .map_err(|_| RecvError::Connection(Reason::INTERNAL_ERROR))?;
        if let Some(inc) = update {
            self.queue
                .push_ctrl(frame::WindowUpdate::new(StreamId::ZERO, inc).into());
        }

        if let Some(stream) = stream {
            let update = stream
                .recv_flow
                .lock()
                .unwrap()
                .return_bytes(n)
                .map_err(|_| RecvError::Stream {
                    id: stream.id,
                    reason: Reason::INTERNAL_ERROR,
                })?;
            if let Some(inc) = update {
                self.queue
                    .push_ctrl(frame::WindowUpdate::new(stream.id, inc).into());
            }
        }

        Ok(())
    }

    /// Charges a received DATA frame: the connection controller first,
    /// then the stream's own.
    fn consume_recv(&self, stream: Option<&Arc<StreamInner>>, len: u32) -> Result<(), RecvError> {
        if len == 0 {
            return Ok(());
        }

        self.conn_stream
            .recv_flow
            .lock()
            .unwrap()
            .consume(len)
            .map_err(|_| RecvError::Connection(Reason::FLOW_CONTROL_ERROR))?;

        if let Some(stream) = stream {
            if stream.recv_flow.lock().unwrap().consume(len).is_err() {
                // The stream blew its window; its share of connection
                // credit will never reach the application, so return it.
                let update = self
                    .conn_stream
                    .recv_flow
                    .lock()
                    .unwrap()
                    .return_bytes(len)
                    .ok()
                    .flatten();
                if let Some(inc) = update {
                    self.queue
                        .push_ctrl(frame::WindowUpdate::new(StreamId::ZERO, inc).into());
                }
                return Err(RecvError::Stream {
                    id: stream.id,
                    reason: Reason::FLOW_CONTROL_ERROR,
                });
            }
        }

        Ok(())
    }

    fn recv_reset(&self, frame: frame::Reset) -> Result<(), RecvError> {
        let id = frame.stream_id();
        if id.is_zero() {
            proto_err!(conn: "RST_STREAM on stream 0");
            return Err(RecvError::Connection(Reason::PROTOCOL_ERROR));
        }

        let stream = match self.store.get(id) {
            Some(stream) => stream,
            None => {
                proto_err!(conn: "RST_STREAM on unknown stream {:?}", id);
                return Err(RecvError::Connection(Reason::PROTOCOL_ERROR));
            }
        };

        match stream.transition(Direction::Recv, frame::Kind::Reset, false, self.grace()) {
            Ok(t) => {
                // Cancelled by the peer: discard anything undelivered.
                stream.recv.lock().unwrap().queue.clear();
                self.finish_transition(&stream, t, Some(frame.reason()));
                Ok(())
            }
            Err(TransitionError::Ignore) => Ok(()),
            Err(e) => self.map_recv_transition(id, e),
        }
    }

    fn recv_window_update(&self, frame: frame::WindowUpdate) -> Result<(), RecvError> {
        let id = frame.stream_id();
        let increment = frame.size_increment();

        if id.is_zero() {
            if increment == 0 {
                proto_err!(conn: "WINDOW_UPDATE with zero increment on connection");
                return Err(RecvError::Connection(Reason::PROTOCOL_ERROR));
            }
            return self
                .conn_stream
                .send_flow
                .increment_window(increment as i64, false)
                .map_err(|_| RecvError::Connection(Reason::FLOW_CONTROL_ERROR));
        }

        let stream = match self.store.get(id) {
            Some(stream) => stream,
            None => {
                proto_err!(conn: "WINDOW_UPDATE on unknown stream {:?}", id);
                return Err(RecvError::Connection(Reason::PROTOCOL_ERROR));
            }
        };

        match stream.transition(
            Direction::Recv,
            frame::Kind::WindowUpdate,
            false,
            self.grace(),
        ) {
            Ok(_) => {
                if increment == 0 {
                    return Err(RecvError::Stream {
                        id,
                        reason: Reason::PROTOCOL_ERROR,
                    });
                }
                stream
                    .send_flow
                    .increment_window(increment as i64, false)
                    .map_err(|_| RecvError::Stream {
                        id,
                        reason: Reason::FLOW_CONTROL_ERROR,
                    })
            }
            Err(TransitionError::Ignore) => Ok(()),
            Err(e) => self.map_recv_transition(id, e),
        }
    }

    fn recv_priority(&self, frame: frame::Priority) -> Result<(), RecvError> {
        let id = frame.stream_id();
        if id.is_zero() {
            proto_err!(conn: "PRIORITY on stream 0");
            return Err(RecvError::Connection(Reason::PROTOCOL_ERROR));
        }

        let dep = frame.dependency();
        if dep.dependency_id() == id {
            return Err(RecvError::Stream {
                id,
                reason: Reason::PROTOCOL_ERROR,
            });
        }

        // PRIORITY is legal in every state, including idle and closed;
        // it only touches the dependency tree.
        self.store
            .reparent(id, dep.dependency_id(), dep.weight(), dep.is_exclusive());
        Ok(())
    }

    fn recv_settings(&self, frame: Settings) -> Result<(), RecvError> {
        if frame.is_ack() {
            let applied = self.settings.lock().unwrap().recv_ack();

            if applied.initial_window_delta != 0 {
                for stream in self.store.snapshot() {
                    if !stream.state.load().is_recv_open() {
                        continue;
                    }
                    let res = stream
                        .recv_flow
                        .lock()
                        .unwrap()
                        .increment_initial_window(applied.initial_window_delta);
                    if res.is_err() {
                        self.stream_error(stream.id, Reason::FLOW_CONTROL_ERROR);
                    }
                }
            }
            if let Some(max) = applied.max_concurrent_streams {
                self.store.counts.set_max_remote(max);
            }
            return Ok(());
        }

        // Validate before applying anything; SETTINGS apply atomically
        // from the peer's point of view.
        let mut probe = Settings::new();
        for (id, value) in frame.iter() {
            if probe.set_value(id, value).is_err() {
                let reason = if id == frame::SettingId::InitialWindowSize {
                    Reason::FLOW_CONTROL_ERROR
                } else {
                    Reason::PROTOCOL_ERROR
                };
                proto_err!(conn: "invalid setting; id={} value={}", id, value);
                return Err(RecvError::Connection(reason));
            }
        }

        let applied = self.settings.lock().unwrap().recv_remote(frame);

        if applied.initial_window_delta != 0 {
            for stream in self.store.snapshot() {
                if !stream.state.load().is_send_open() {
                    continue;
                }
                let res = stream
                    .send_flow
                    .increment_window(applied.initial_window_delta, true);
                if res.is_err() {
                    self.stream_error(stream.id, Reason::FLOW_CONTROL_ERROR);
                }
            }
        }
        if let Some(max) = applied.max_concurrent_streams {
            self.store.counts.set_max_local(max);
        }

        // The ACK goes to the head of the queue so nothing that relies
        // on the new settings can precede it.
        self.queue.push_ctrl(Settings::ack().into());
        Ok(())
    }

    fn recv_ping(&self, frame: frame::Ping) -> Result<(), RecvError> {
        if frame.is_ack() {
            self.ping_pong.recv_pong(frame.payload());
        } else {
            self.queue
                .push_ctrl(frame::Ping::pong(frame.into_payload()).into());
        }
        Ok(())
    }

    fn recv_go_away(&self, frame: frame::GoAway) -> Result<(), RecvError> {
        let last = frame.last_stream_id();
        let reason = frame.reason();

        self.go_away.lock().unwrap().record_received(last, reason);
        {
            let mut error = self.error.lock().unwrap();
            if error.is_none() {
                *error = Some(reason);
            }
        }

        // Streams we initiated above the peer's high-water mark will
        // never be processed; the caller may retry them elsewhere.
        for stream in self.store.snapshot() {
            if self.store.is_local_init(stream.id)
                && stream.id > last
                && !stream.state.load().is_closed()
            {
                self.force_close(&stream, Some(Reason::REFUSED_STREAM), true);
            }
        }

        Ok(())
    }

    fn recv_push_promise(self: &Arc<Self>, frame: frame::PushPromise) -> Result<(), RecvError> {
        let id = frame.stream_id();
        let promised_id = frame.promised_id();

        if id.is_zero() || promised_id.is_zero() {
            proto_err!(conn: "PUSH_PROMISE on stream 0");
            return Err(RecvError::Connection(Reason::PROTOCOL_ERROR));
        }
        if self.config.peer.is_server() {
            proto_err!(conn: "server received PUSH_PROMISE");
            return Err(RecvError::Connection(Reason::PROTOCOL_ERROR));
        }
        if !self.settings.lock().unwrap().local().is_push_enabled() {
            proto_err!(conn: "PUSH_PROMISE after push was disabled");
            return Err(RecvError::Connection(Reason::PROTOCOL_ERROR));
        }
        if self.config.peer.is_local_init(promised_id) || promised_id <= self.last_peer_id() {
            proto_err!(conn: "invalid promised stream {:?}", promised_id);
            return Err(RecvError::Connection(Reason::PROTOCOL_ERROR));
        }
        if frame::check_fields(frame.fields()).is_err()
            || frame::PushPromise::validate_request(frame.pseudo(), frame.fields()).is_err()
        {
            return Err(RecvError::Stream {
                id: promised_id,
                reason: Reason::PROTOCOL_ERROR,
            });
        }

        // The parent must still be able to receive.
        let parent = match self.store.get(id) {
            Some(parent) if parent.state.load().is_recv_open() => parent,
            _ => {
                proto_err!(conn: "PUSH_PROMISE on inactive parent {:?}", id);
                return Err(RecvError::Connection(Reason::PROTOCOL_ERROR));
            }
        };
        drop(parent);

        self.observe_peer_id(promised_id);

        let stream = Arc::new(StreamInner::new(promised_id));
        let t = stream
            .transition(
                Direction::Recv,
                frame::Kind::PushPromise,
                false,
                self.grace(),
            )
            .expect("fresh streams accept PUSH_PROMISE");

        let (pseudo, fields) = frame.into_parts();
        stream.recv.lock().unwrap().promised_request = Some((pseudo, fields));

        self.store.insert(stream.clone());
        self.finish_transition(&stream, t, None);

        self.accept.queue.lock().unwrap().push_back(Stream {
            inner: stream,
            conn: self.clone(),
        });
        self.accept.waker.wake();

        Ok(())
    }

    fn map_recv_transition(&self, id: StreamId, err: TransitionError) -> Result<(), RecvError> {
        match err {
            TransitionError::Ignore => Ok(()),
            TransitionError::Stream(reason) => Err(RecvError::Stream { id, reason }),
            TransitionError::Connection(reason) => Err(RecvError::Connection(reason)),
            TransitionError::User(_) => {
                // Receive transitions never produce user errors.
                Err(RecvError::Connection(Reason::INTERNAL_ERROR))
            }
        }
    }

    // ===== stream lifecycle =====

    /// Post-transition side effects that are not part of the CAS itself.
    pub(crate) fn finish_transition(
        &self,
        stream: &Arc<StreamInner>,
        t: Transition,
        reason: Option<Reason>,
    ) {
        if t.is_closing() {
            self.close_stream(stream, reason, true);
        }
    }

    /// Used by stream handles after send-side transitions.
    pub(crate) fn after_stream_transition(&self, stream: &Arc<StreamInner>) {
        if stream.state.load().is_closed() && !stream.close.is_closed() {
            self.close_stream(stream, None, true);
        }
    }

    fn close_stream(&self, stream: &Arc<StreamInner>, reason: Option<Reason>, retire: bool) {
        if let Some(reason) = reason {
            let mut error = stream.error.lock().unwrap();
            if error.is_none() {
                *error = Some(reason);
            }
        }

        if stream.counted.swap(false, Ordering::AcqRel) {
            self.store.counts.dec(self.store.is_local_init(stream.id));
        }

        stream.close.notify();
        stream.recv_waker.wake();

        if retire {
            self.store.retire(stream.id);
        }

        tracing::trace!(parent: &self.span, id = ?stream.id, "stream closed");
        self.maybe_drained();
    }

    /// Drives a stream to Closed regardless of its current state.
    fn force_close(&self, stream: &Arc<StreamInner>, reason: Option<Reason>, retire: bool) {
        loop {
            let from = stream.state.load();
            if from == StreamState::Closed {
                break;
            }
            if stream.state.compare_and_swap(from, StreamState::Closed) {
                *stream.closed_at.lock().unwrap() = Some(Instant::now());
                break;
            }
        }
        if !stream.close.is_closed() {
            self.close_stream(stream, reason, retire);
        }
    }

    /// Enqueues RST_STREAM for a stream error and closes the local
    /// bookkeeping without tearing down the connection.
    pub(crate) fn stream_error(&self, id: StreamId, reason: Reason) {
        proto_err!(stream: "stream {:?} reset; reason={:?}", id, reason);

        match self.store.get(id) {
            Some(stream) => self.reset_stream(&stream, reason),
            None => {
                self.queue.push_ctrl(frame::Reset::new(id, reason).into());
            }
        }
    }

    /// Sends RST_STREAM and closes the stream. Idempotent.
    pub(crate) fn reset_stream(&self, stream: &Arc<StreamInner>, reason: Reason) {
        match stream.transition(Direction::Send, frame::Kind::Reset, false, self.grace()) {
            Ok(t) => {
                self.queue
                    .push_ctrl(frame::Reset::new(stream.id, reason).into());
                stream.recv.lock().unwrap().queue.clear();
                self.finish_transition(stream, t, Some(reason));
            }
            Err(_) => {
                // Already closed, or never opened; nothing to send.
            }
        }
    }

    /// A fatal protocol error: GOAWAY with the responsible code, then
    /// the transport goes down.
    fn connection_error(&self, reason: Reason) {
        {
            let mut error = self.error.lock().unwrap();
            if error.is_none() {
                *error = Some(reason);
            }
        }

        let last = self.last_peer_id();
        self.go_away.lock().unwrap().record_sent(last, reason);
        self.queue.push_ctrl(frame::GoAway::new(last, reason).into());

        self.fatal_teardown(Some(reason));
    }

    /// The peer hung up.
    fn recv_eof(&self) {
        self.fatal_teardown(None);
    }

    fn fatal_teardown(&self, reason: Option<Reason>) {
        for stream in self.store.clear() {
            self.force_close(&stream, reason, false);
        }
        self.queue.finish();
        self.ping_pong.cancel();
        self.close.notify();
        self.drained.notify();
        self.accept.waker.wake();
    }

    // ===== graceful close =====

    pub(crate) fn shutdown(&self, reason: Reason, drain_within: Option<Duration>) {
        {
            let mut go_away = self.go_away.lock().unwrap();
            if go_away.sent().is_some() {
                return;
            }
            let last = self.last_peer_id();
            go_away.record_sent(last, reason);
            if let Some(within) = drain_within {
                go_away.set_drain_deadline(Instant::now() + within);
            }
            self.queue
                .push_ctrl(frame::GoAway::new(last, reason).into());
        }

        tracing::debug!(parent: &self.span, ?reason, "going away");
        self.accept.waker.wake();
        self.maybe_drained();
    }

    /// Cuts the drain short: every remaining stream is reset with
    /// CANCEL. Called on the drain deadline, or directly by the
    /// embedder's timer.
    pub(crate) fn abort_drain(&self) {
        for stream in self.store.snapshot() {
            if !stream.state.load().is_closed() {
                self.reset_stream(&stream, Reason::CANCEL);
            }
        }
        self.maybe_drained();
    }

    fn check_drain_deadline(&self) {
        let expired = self.go_away.lock().unwrap().drain_expired();
        if expired {
            tracing::debug!(parent: &self.span, "drain deadline expired");
            self.abort_drain();
        }
    }

    /// Once we are going away and the last active stream closes, the
    /// writer drains out and everyone waiting is released.
    fn maybe_drained(&self) {
        if self.go_away.lock().unwrap().sent().is_none() {
            return;
        }
        if self.store.counts.has_active() {
            return;
        }
        self.queue.finish();
        self.drained.notify();
        self.close.notify();
        self.accept.waker.wake();
    }

    pub(crate) fn poll_drained(&self, cx: &mut Context<'_>) -> Poll<()> {
        self.check_drain_deadline();
        self.drained.poll_closed(cx)
    }

    pub(crate) fn goaway_sent(&self) -> Option<(StreamId, Reason)> {
        self.go_away
            .lock()
            .unwrap()
            .sent()
            .map(|g| (g.last_stream_id, g.reason))
    }

    pub(crate) fn goaway_received(&self) -> Option<(StreamId, Reason)> {
        self.go_away
            .lock()
            .unwrap()
            .received()
            .map(|g| (g.last_stream_id, g.reason))
    }

    // ===== public operations =====

    pub(crate) async fn open_stream(
        self: &Arc<Self>,
        pseudo: Pseudo,
        fields: HeaderMap,
        end_stream: bool,
    ) -> Result<Stream, Error> {
        let fields = frame::sanitize_fields(fields).map_err(|_| UserError::MalformedHeaders)?;

        if self.close.is_closed() {
            return Err(self.error_reason().unwrap_or(Reason::STREAM_CLOSED).into());
        }
        if self.go_away.lock().unwrap().is_going_away() {
            // New work is refused in either direction once GOAWAY is in
            // play.
            return Err(Reason::REFUSED_STREAM.into());
        }

        if !self.store.counts.try_inc_local() {
            return Err(UserError::Rejected.into());
        }

        let id = {
            let mut next = self.next_stream_id.lock().unwrap();
            match *next {
                Some(id) => {
                    *next = id.next_id().ok();
                    id
                }
                None => {
                    self.store.counts.dec(true);
                    return Err(UserError::OverflowedStreamId.into());
                }
            }
        };

        let stream = Arc::new(StreamInner::new(id));
        stream.counted.store(true, Ordering::Release);
        stream.arm_flow(self.remote_initial_window(), self.local_initial_window());

        stream
            .transition(
                Direction::Send,
                frame::Kind::Headers,
                end_stream,
                self.grace(),
            )
            .expect("fresh streams accept HEADERS");

        self.store.insert(stream.clone());

        let mut frame = frame::Headers::new(id, pseudo, fields);
        if end_stream {
            frame.set_end_stream();
        }

        let handle = Stream {
            inner: stream,
            conn: self.clone(),
        };

        self.enqueue_data(frame.into()).await?;

        tracing::trace!(parent: &self.span, ?id, "opened stream");
        Ok(handle)
    }

    pub(crate) async fn push_stream(
        self: &Arc<Self>,
        parent: &Stream,
        pseudo: Pseudo,
        fields: HeaderMap,
    ) -> Result<Stream, Error> {
        if !self.config.peer.is_server() {
            return Err(UserError::PushOnClient.into());
        }
        if !self.settings.lock().unwrap().remote().is_push_enabled() {
            return Err(UserError::PeerDisabledServerPush.into());
        }
        frame::PushPromise::validate_request(&pseudo, &fields)
            .map_err(|_| UserError::MalformedHeaders)?;
        let fields = frame::sanitize_fields(fields).map_err(|_| UserError::MalformedHeaders)?;

        if !parent.inner.state.load().is_send_open() {
            return Err(UserError::InactiveStreamId.into());
        }
        if self.go_away.lock().unwrap().is_going_away() {
            return Err(Reason::REFUSED_STREAM.into());
        }

        let promised_id = {
            let mut next = self.next_stream_id.lock().unwrap();
            match *next {
                Some(id) => {
                    *next = id.next_id().ok();
                    id
                }
                None => return Err(UserError::OverflowedStreamId.into()),
            }
        };

        let stream = Arc::new(StreamInner::new(promised_id));
        stream
            .transition(
                Direction::Send,
                frame::Kind::PushPromise,
                false,
                self.grace(),
            )
            .expect("fresh streams accept PUSH_PROMISE");

        self.store.insert(stream.clone());

        let frame = frame::PushPromise::new(parent.inner.id, promised_id, pseudo, fields);
        let handle = Stream {
            inner: stream,
            conn: self.clone(),
        };

        self.enqueue_data(frame.into()).await?;

        tracing::trace!(parent: &self.span, id = ?promised_id, "reserved push stream");
        Ok(handle)
    }

    pub(crate) async fn accept(self: &Arc<Self>) -> Option<Stream> {
        poll_fn(|cx| {
            if let Some(stream) = self.accept.queue.lock().unwrap().pop_front() {
                return Poll::Ready(Some(stream));
            }

            if self.close.is_closed() || self.go_away.lock().unwrap().is_going_away() {
                return Poll::Ready(None);
            }

            self.accept.waker.register(cx.waker());

            if let Some(stream) = self.accept.queue.lock().unwrap().pop_front() {
                return Poll::Ready(Some(stream));
            }
            if self.close.is_closed() {
                return Poll::Ready(None);
            }
            Poll::Pending
        })
        .await
    }

    pub(crate) async fn ping(&self, payload: PingPayload) -> Result<Duration, Error> {
        self.ping_pong.start(payload)?;
        self.queue.push_ctrl(frame::Ping::new(payload).into());

        poll_fn(|cx| {
            if self.close.poll_closed(cx).is_ready() {
                return Poll::Ready(Err(Error::from(
                    self.error_reason().unwrap_or(Reason::STREAM_CLOSED),
                )));
            }
            self.ping_pong.poll_rtt(cx).map(Ok)
        })
        .await
    }

    pub(crate) fn send_settings(&self, settings: Settings) -> Result<(), Error> {
        self.settings.lock().unwrap().start_send(settings.clone())?;
        self.queue.push_ctrl(settings.into());
        Ok(())
    }

    // ===== writer task =====

    pub(crate) async fn flush<W: FrameWrite>(&self, mut dst: W) -> Result<(), Error> {
        poll_fn(move |cx| loop {
            match dst.poll_ready(cx) {
                Poll::Pending => return Poll::Pending,
                Poll::Ready(Err(e)) => return Poll::Ready(Err(Error::from_io(e))),
                Poll::Ready(Ok(())) => {}
            }

            match self.queue.poll_next(cx) {
                Poll::Ready(Some(frame)) => {
                    tracing::trace!(parent: &self.span, ?frame, "send");
                    if let Err(e) = dst.buffer(frame) {
                        return Poll::Ready(Err(Error::from_io(e)));
                    }
                }
                Poll::Ready(None) => {
                    return match dst.poll_flush(cx) {
                        Poll::Pending => Poll::Pending,
                        Poll::Ready(Err(e)) => Poll::Ready(Err(Error::from_io(e))),
                        Poll::Ready(Ok(())) => Poll::Ready(Ok(())),
                    };
                }
                Poll::Pending => {
                    return match dst.poll_flush(cx) {
                        Poll::Pending => Poll::Pending,
                        Poll::Ready(Err(e)) => Poll::Ready(Err(Error::from_io(e))),
                        Poll::Ready(Ok(())) => Poll::Pending,
                    };
                }
            }
        })
        .await
    }

    // ===== producer plumbing =====

    /// Tail-enqueues a producer frame, racing the connection close
    /// signal so writers do not hang on a dead connection.
    pub(crate) async fn enqueue_data(&self, frame: Frame) -> Result<(), Error> {
        let mut push = self.queue.push(frame);
        poll_fn(|cx| {
            if self.close.poll_closed(cx).is_ready() {
                return Poll::Ready(Err(Error::from(
                    self.error_reason().unwrap_or(Reason::STREAM_CLOSED),
                )));
            }
            Pin::new(&mut push).poll(cx).map(|res| {
                res.map_err(|_| {
                    Error::from(self.error_reason().unwrap_or(Reason::STREAM_CLOSED))
                })
            })
        })
        .await
    }

    /// Returns `n` delivered payload bytes to the receive controllers,
    /// connection level first, emitting WINDOW_UPDATE as thresholds are
    /// crossed.
    pub(crate) fn return_bytes(&self, stream: &StreamInner, n: u32) -> Result<(), Error> {
        let update = self
            .conn_stream
            .recv_flow
            .lock()
            .unwrap()
            .return_bytes(n)
            .map_err(|_| Error::from(Reason::INTERNAL_ERROR))?;
        if let Some(inc) = update {
            self.queue
                .push_ctrl(frame::WindowUpdate::new(StreamId::ZERO, inc).into());
        }

        let update = stream
            .recv_flow
            .lock()
            .unwrap()
            .return_bytes(n)
            .map_err(|_| Error::from(Reason::INTERNAL_ERROR))?;
        if let Some(inc) = update {
            self.queue
                .push_ctrl(frame::WindowUpdate::new(stream.id, inc).into());
        }

        Ok(())
    }
}

impl std::fmt::Debug for ConnectionInner {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> std::fmt::Result {
        fmt.debug_struct("Connection")
            .field("peer", &self.config.peer)
            .field("last_peer_id", &self.last_peer_id())
            .finish()
    }
}
