use bytes::Bytes;
use http::HeaderMap;
use std::collections::VecDeque;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll, Waker};
use std::time::{Duration, Instant};

use futures_util::future::poll_fn;
use futures_util::task::AtomicWaker;

use crate::codec::UserError;
use crate::error::Error;
use crate::frame::{self, Kind, Pseudo, Reason, StreamId};
use crate::proto::connection::ConnectionInner;
use crate::proto::streams::flow_control::{RecvFlow, SendFlow};
use crate::proto::streams::state::{self, Direction, State, StreamState};

/// A one-shot signal with any number of waiters. Fired when a stream
/// (or the connection) transitions into Closed.
#[derive(Debug, Default)]
pub struct CloseSignal {
    closed: AtomicBool,
    wakers: Mutex<Vec<Waker>>,
}

impl CloseSignal {
    pub fn new() -> CloseSignal {
        CloseSignal::default()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn notify(&self) {
        self.closed.store(true, Ordering::Release);
        let wakers = std::mem::take(&mut *self.wakers.lock().unwrap());
        for waker in wakers {
            waker.wake();
        }
    }

    pub fn poll_closed(&self, cx: &mut Context<'_>) -> Poll<()> {
        if self.is_closed() {
            return Poll::Ready(());
        }
        self.wakers.lock().unwrap().push(cx.waker().clone());
        if self.is_closed() {
            return Poll::Ready(());
        }
        Poll::Pending
    }
}

/// Why a transition could not be applied.
#[derive(Debug, PartialEq, Eq)]
pub enum TransitionError {
    /// Drop the frame on the floor.
    Ignore,
    /// Fatal to this stream only.
    Stream(Reason),
    /// Fatal to the connection.
    Connection(Reason),
    /// A local caller did something illegal.
    User(UserError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub from: StreamState,
    pub to: StreamState,
}

impl Transition {
    pub fn is_closing(&self) -> bool {
        self.to.is_closed() && !self.from.is_closed()
    }
}

#[derive(Debug, Default)]
pub struct RecvBuffer {
    pub headers: Option<(Pseudo, HeaderMap)>,
    /// The request announced by PUSH_PROMISE, for reserved streams.
    pub promised_request: Option<(Pseudo, HeaderMap)>,
    pub queue: VecDeque<Bytes>,
    pub trailers: Option<HeaderMap>,
    pub end_of_stream: bool,
}

/// Everything a stream owns. Shared between the registry, the reader
/// task and producer handles.
#[derive(Debug)]
pub struct StreamInner {
    pub id: StreamId,

    pub state: State,

    pub send_flow: SendFlow,
    pub recv_flow: Mutex<RecvFlow>,

    // Set at most once each, immutable after set.
    pub reset_sent: AtomicBool,
    pub reset_received: AtomicBool,

    /// Why the stream died, when it did not die by END_STREAM.
    pub error: Mutex<Option<Reason>>,

    /// When the stream entered Closed, for the grace window.
    pub closed_at: Mutex<Option<Instant>>,

    pub close: CloseSignal,

    /// Whether the stream is charged against a concurrency counter.
    pub counted: AtomicBool,

    pub recv: Mutex<RecvBuffer>,
    pub recv_waker: AtomicWaker,
}

impl StreamInner {
    pub fn new(id: StreamId) -> StreamInner {
        StreamInner {
            id,
            state: State::new(),
            send_flow: SendFlow::new(0),
            recv_flow: Mutex::new(RecvFlow::new(0)),
            reset_sent: AtomicBool::new(false),
            reset_received: AtomicBool::new(false),
            error: Mutex::new(None),
            closed_at: Mutex::new(None),
            close: CloseSignal::new(),
            counted: AtomicBool::new(false),
            recv: Mutex::new(RecvBuffer::default()),
            recv_waker: AtomicWaker::new(),
        }
    }

    /// Arms the flow controllers with the negotiated initial windows.
    /// Called on creation for streams that open directly, and again when
    /// a reserved stream activates.
    pub fn arm_flow(&self, send_initial: u32, recv_initial: u32) {
        *self.recv_flow.lock().unwrap() = RecvFlow::new(recv_initial);
        let _ = self
            .send_flow
            .increment_window(send_initial as i64 - self.send_flow.window(), true);
    }

    /// Applies a transition with a compare-and-swap loop. On success the
    /// reset flags and close timestamp are recorded as part of the same
    /// edge; counter updates and flow-controller arming are keyed off the
    /// returned `Transition` by the caller.
    pub fn transition(
        &self,
        dir: Direction,
        kind: Kind,
        eos: bool,
        grace: Duration,
    ) -> Result<Transition, TransitionError> {
        loop {
            let from = self.state.load();
            let to = match state::transition(dir, from, kind, eos) {
                Some(to) => to,
                None => return Err(self.transition_error(dir, from, kind, grace)),
            };

            if self.state.compare_and_swap(from, to) {
                if to == StreamState::Closed && kind == Kind::Reset {
                    match dir {
                        Direction::Recv => self.reset_received.store(true, Ordering::Release),
                        Direction::Send => self.reset_sent.store(true, Ordering::Release),
                    }
                }
                if to == StreamState::Closed && from != StreamState::Closed {
                    *self.closed_at.lock().unwrap() = Some(Instant::now());
                }
                return Ok(Transition { from, to });
            }
        }
    }

    fn transition_error(
        &self,
        dir: Direction,
        from: StreamState,
        kind: Kind,
        grace: Duration,
    ) -> TransitionError {
        if dir == Direction::Send {
            if from == StreamState::Closed {
                if kind == Kind::Reset {
                    // The stream is already being reset.
                    return TransitionError::Ignore;
                }
                return TransitionError::User(UserError::InactiveStreamId);
            }
            return TransitionError::User(UserError::UnexpectedFrameType);
        }

        // Any frame other than PRIORITY after receiving RST_STREAM is a
        // stream error of type STREAM_CLOSED.
        if self.reset_received.load(Ordering::Acquire) {
            return TransitionError::Stream(Reason::STREAM_CLOSED);
        }

        // After sending RST_STREAM, late frames are expected for a
        // while; past the grace window they are in error.
        if self.reset_sent.load(Ordering::Acquire) {
            if self.since_closed() <= grace {
                return TransitionError::Ignore;
            }
            return TransitionError::Stream(Reason::STREAM_CLOSED);
        }

        match from {
            StreamState::HalfClosedRemote => {
                // Frames after the peer's END_STREAM are a connection
                // error of type STREAM_CLOSED.
                TransitionError::Connection(Reason::STREAM_CLOSED)
            }
            StreamState::Closed => match kind {
                Kind::Reset | Kind::WindowUpdate => {
                    if self.since_closed() <= grace {
                        TransitionError::Ignore
                    } else {
                        TransitionError::Connection(Reason::PROTOCOL_ERROR)
                    }
                }
                _ => TransitionError::Connection(Reason::PROTOCOL_ERROR),
            },
            _ => TransitionError::Connection(Reason::PROTOCOL_ERROR),
        }
    }

    fn since_closed(&self) -> Duration {
        self.closed_at
            .lock()
            .unwrap()
            .map(|at| at.elapsed())
            .unwrap_or_else(|| Duration::from_secs(0))
    }

    pub fn error_reason(&self) -> Option<Reason> {
        *self.error.lock().unwrap()
    }
}

/// The per-stream handle handed to the request/response layer.
#[derive(Clone)]
pub struct Stream {
    pub(crate) inner: Arc<StreamInner>,
    pub(crate) conn: Arc<ConnectionInner>,
}

impl Stream {
    pub fn id(&self) -> StreamId {
        self.inner.id
    }

    pub fn state(&self) -> StreamState {
        self.inner.state.load()
    }

    /// Whether the stream counts against the concurrency limit: Open or
    /// half-closed either way.
    pub fn is_active(&self) -> bool {
        self.inner.state.load().is_active()
    }

    /// Awaits the peer's initial header block: the response for a
    /// locally-opened stream, the request for an accepted one. Yields
    /// once.
    pub async fn read_headers(&self) -> Result<(Pseudo, HeaderMap), Error> {
        poll_fn(|cx| {
            let mut buf = self.inner.recv.lock().unwrap();
            if let Some(parts) = buf.headers.take() {
                return Poll::Ready(Ok(parts));
            }
            drop(buf);

            if let Some(reason) = self.inner.error_reason() {
                return Poll::Ready(Err(reason.into()));
            }
            if self.inner.close.is_closed() || self.conn.close.is_closed() {
                return Poll::Ready(Err(Reason::STREAM_CLOSED.into()));
            }

            self.inner.recv_waker.register(cx.waker());

            let mut buf = self.inner.recv.lock().unwrap();
            if let Some(parts) = buf.headers.take() {
                return Poll::Ready(Ok(parts));
            }
            Poll::Pending
        })
        .await
    }

    /// Reads the next payload chunk. `Ok(None)` is end-of-stream. Bytes
    /// handed out here are returned to the receive controllers, which
    /// emit WINDOW_UPDATE once enough accumulates.
    pub async fn read(&self) -> Result<Option<Bytes>, Error> {
        let chunk = poll_fn(|cx| {
            let buf = self.inner.recv.lock().unwrap();
            self.poll_chunk(cx, buf)
        })
        .await?;

        if let Some(ref chunk) = chunk {
            if !chunk.is_empty() {
                self.conn.return_bytes(&self.inner, chunk.len() as u32)?;
            }
        }

        Ok(chunk)
    }

    fn poll_chunk(
        &self,
        cx: &mut Context<'_>,
        mut buf: std::sync::MutexGuard<'_, RecvBuffer>,
    ) -> Poll<Result<Option<Bytes>, Error>> {
        if let Some(chunk) = buf.queue.pop_front() {
            return Poll::Ready(Ok(Some(chunk)));
        }
        if buf.end_of_stream {
            return Poll::Ready(Ok(None));
        }
        drop(buf);

        if let Some(reason) = self.inner.error_reason() {
            return Poll::Ready(Err(reason.into()));
        }
        if self.inner.close.is_closed() {
            return Poll::Ready(Err(Reason::STREAM_CLOSED.into()));
        }
        if self.conn.close.is_closed() {
            return Poll::Ready(Err(self
                .conn
                .error_reason()
                .unwrap_or(Reason::STREAM_CLOSED)
                .into()));
        }

        self.inner.recv_waker.register(cx.waker());

        let mut buf = self.inner.recv.lock().unwrap();
        if let Some(chunk) = buf.queue.pop_front() {
            return Poll::Ready(Ok(Some(chunk)));
        }
        if buf.end_of_stream {
            return Poll::Ready(Ok(None));
        }
        Poll::Pending
    }

    /// Trailing header fields, once end-of-stream has been observed.
    pub fn take_trailers(&self) -> Option<HeaderMap> {
        self.inner.recv.lock().unwrap().trailers.take()
    }

    /// For a stream reserved by the peer's PUSH_PROMISE: the request
    /// the pushed response answers.
    pub fn take_promised_request(&self) -> Option<(Pseudo, HeaderMap)> {
        self.inner.recv.lock().unwrap().promised_request.take()
    }

    /// Writes a payload, obtaining credit on both the stream and the
    /// connection controller before any frame is cut. Payloads larger
    /// than the peer's MAX_FRAME_SIZE are split.
    pub async fn write(&self, mut data: Bytes, end_stream: bool) -> Result<(), Error> {
        let grace = self.conn.config.reset_stream_grace;

        if !self.inner.state.load().is_send_open() {
            if let Some(reason) = self.inner.error_reason() {
                return Err(reason.into());
            }
            return Err(UserError::InactiveStreamId.into());
        }

        if data.is_empty() {
            if !end_stream {
                return Ok(());
            }
            self.transition_send_data(true, grace)?;
            let mut frame = frame::Data::new(self.inner.id, Bytes::new());
            frame.set_end_stream(true);
            self.conn.enqueue_data(frame.into()).await?;
            self.conn.after_stream_transition(&self.inner);
            return Ok(());
        }

        while !data.is_empty() {
            let grant = self.allocate(data.len()).await?;
            let mut granted = data.split_to(grant);

            let max_frame = self.conn.remote_max_frame_size() as usize;
            while !granted.is_empty() {
                let len = granted.len().min(max_frame);
                let chunk = granted.split_to(len);
                let eos = end_stream && granted.is_empty() && data.is_empty();

                self.transition_send_data(eos, grace)?;

                let mut frame = frame::Data::new(self.inner.id, chunk);
                frame.set_end_stream(eos);
                self.conn.enqueue_data(frame.into()).await?;
            }
        }

        self.conn.after_stream_transition(&self.inner);
        Ok(())
    }

    fn transition_send_data(&self, eos: bool, grace: Duration) -> Result<(), Error> {
        match self.inner.transition(Direction::Send, Kind::Data, eos, grace) {
            Ok(_) => Ok(()),
            Err(TransitionError::User(e)) => {
                if let Some(reason) = self.inner.error_reason() {
                    Err(reason.into())
                } else {
                    Err(e.into())
                }
            }
            Err(TransitionError::Ignore) => Err(UserError::InactiveStreamId.into()),
            Err(TransitionError::Stream(reason)) | Err(TransitionError::Connection(reason)) => {
                Err(reason.into())
            }
        }
    }

    /// The two-level allocation: stream credit first, then connection
    /// credit, both raced against the close signals. The award is capped
    /// at `n`; surplus goes straight back to its controller.
    async fn allocate(&self, n: usize) -> Result<usize, Error> {
        let stream_flow = &self.inner.send_flow;
        let conn_flow = &self.conn.conn_stream.send_flow;

        let sw = {
            let mut credit = stream_flow.credit();
            poll_fn(|cx| {
                if self.inner.close.poll_closed(cx).is_ready() {
                    return Poll::Ready(Err(self.stream_closed_error()));
                }
                if self.conn.close.poll_closed(cx).is_ready() {
                    return Poll::Ready(Err(self.conn_closed_error()));
                }
                std::pin::Pin::new(&mut credit).poll(cx).map(Ok)
            })
            .await?
        };

        let cw = {
            let mut credit = conn_flow.credit();
            let res = poll_fn(|cx| {
                if self.inner.close.poll_closed(cx).is_ready() {
                    return Poll::Ready(Err(self.stream_closed_error()));
                }
                if self.conn.close.poll_closed(cx).is_ready() {
                    return Poll::Ready(Err(self.conn_closed_error()));
                }
                std::pin::Pin::new(&mut credit).poll(cx).map(Ok)
            })
            .await;
            match res {
                Ok(cw) => cw,
                Err(e) => {
                    // The stream died while holding the connection
                    // controller's attention; put any deposit back.
                    conn_flow.cancel();
                    return Err(e);
                }
            }
        };

        let grant = n.min(sw as usize).min(cw as usize);

        if grant < sw as usize {
            let _ = stream_flow.increment_window(sw as i64 - grant as i64, false);
        }
        if grant < cw as usize {
            let _ = conn_flow.increment_window(cw as i64 - grant as i64, false);
        }

        tracing::trace!(
            "allocated send credit; stream={:?}; n={}; sw={}; cw={}; grant={}",
            self.inner.id,
            n,
            sw,
            cw,
            grant
        );

        Ok(grant)
    }

    fn stream_closed_error(&self) -> Error {
        self.inner
            .error_reason()
            .unwrap_or(Reason::STREAM_CLOSED)
            .into()
    }

    fn conn_closed_error(&self) -> Error {
        self.conn
            .error_reason()
            .unwrap_or(Reason::STREAM_CLOSED)
            .into()
    }

    /// Sends a header block on this stream: the response on an accepted
    /// stream, or the promised response activating a reserved push
    /// stream.
    pub async fn send_headers(
        &self,
        pseudo: Pseudo,
        fields: HeaderMap,
        end_stream: bool,
    ) -> Result<(), Error> {
        let fields = frame::sanitize_fields(fields).map_err(|_| UserError::MalformedHeaders)?;
        let grace = self.conn.config.reset_stream_grace;

        let was_reserved = self.inner.state.load() == StreamState::ReservedLocal;
        if was_reserved && !self.conn.store.counts.try_inc_local() {
            return Err(UserError::Rejected.into());
        }

        let t = match self
            .inner
            .transition(Direction::Send, Kind::Headers, end_stream, grace)
        {
            Ok(t) => t,
            Err(e) => {
                if was_reserved {
                    self.conn.store.counts.dec(true);
                }
                return Err(match e {
                    TransitionError::User(e) => e.into(),
                    _ => UserError::InactiveStreamId.into(),
                });
            }
        };

        if t.from == StreamState::ReservedLocal {
            self.inner.counted.store(true, std::sync::atomic::Ordering::Release);
            self.inner.arm_flow(
                self.conn.remote_initial_window(),
                self.conn.local_initial_window(),
            );
        } else if was_reserved {
            // Someone else activated it between the load and the CAS.
            self.conn.store.counts.dec(true);
        }

        let mut frame = frame::Headers::new(self.inner.id, pseudo, fields);
        if end_stream {
            frame.set_end_stream();
        }
        self.conn.enqueue_data(frame.into()).await?;
        self.conn.after_stream_transition(&self.inner);
        Ok(())
    }

    /// Sends trailing headers, ending the stream.
    pub async fn write_trailers(&self, fields: HeaderMap) -> Result<(), Error> {
        let fields = frame::sanitize_fields(fields).map_err(|_| UserError::MalformedHeaders)?;
        let grace = self.conn.config.reset_stream_grace;

        match self
            .inner
            .transition(Direction::Send, Kind::Headers, true, grace)
        {
            Ok(_) => {}
            Err(TransitionError::User(e)) => return Err(e.into()),
            Err(_) => return Err(UserError::InactiveStreamId.into()),
        }

        let frame = frame::Headers::trailers(self.inner.id, fields);
        self.conn.enqueue_data(frame.into()).await?;
        self.conn.after_stream_transition(&self.inner);
        Ok(())
    }

    /// Resets the stream. Idempotent: resetting an already-closed stream
    /// is a no-op.
    pub fn reset(&self, reason: Reason) {
        self.conn.reset_stream(&self.inner, reason);
    }

    /// Resolves when the stream reaches Closed.
    pub async fn closed(&self) {
        poll_fn(|cx| self.inner.close.poll_closed(cx)).await
    }
}

impl std::fmt::Debug for Stream {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> std::fmt::Result {
        fmt.debug_struct("Stream")
            .field("id", &self.inner.id)
            .field("state", &self.inner.state.load())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn close_signal_is_one_shot_and_sticky() {
        let signal = CloseSignal::new();
        assert!(!signal.is_closed());
        signal.notify();
        assert!(signal.is_closed());

        let waker = futures::task::noop_waker();
        let mut cx = Context::from_waker(&waker);
        assert!(signal.poll_closed(&mut cx).is_ready());
    }

    #[test]
    fn reset_flags_are_set_by_the_closing_edge() {
        let stream = StreamInner::new(1.into());
        let grace = Duration::from_secs(5);

        stream
            .transition(Direction::Recv, Kind::Headers, false, grace)
            .unwrap();
        let t = stream
            .transition(Direction::Recv, Kind::Reset, false, grace)
            .unwrap();

        assert!(t.is_closing());
        assert!(stream.reset_received.load(Ordering::Acquire));
        assert!(!stream.reset_sent.load(Ordering::Acquire));
        assert!(stream.closed_at.lock().unwrap().is_some());
    }

    #[test]
    fn frames_after_reset_received_are_stream_errors() {
        let stream = StreamInner::new(1.into());
        let grace = Duration::from_secs(5);

        stream
            .transition(Direction::Recv, Kind::Headers, false, grace)
            .unwrap();
        stream
            .transition(Direction::Recv, Kind::Reset, false, grace)
            .unwrap();

        assert_eq!(
            stream.transition(Direction::Recv, Kind::Data, false, grace),
            Err(TransitionError::Stream(Reason::STREAM_CLOSED))
        );
    }

    #[test]
    fn late_window_update_ignored_within_grace_then_fatal() {
        let stream = StreamInner::new(1.into());
        let grace = Duration::from_millis(20);

        stream
            .transition(Direction::Send, Kind::Headers, true, grace)
            .unwrap();
        stream
            .transition(Direction::Recv, Kind::Headers, true, grace)
            .unwrap();
        assert_eq!(stream.state.load(), StreamState::Closed);

        assert_eq!(
            stream.transition(Direction::Recv, Kind::WindowUpdate, false, grace),
            Err(TransitionError::Ignore)
        );

        std::thread::sleep(Duration::from_millis(40));

        assert_eq!(
            stream.transition(Direction::Recv, Kind::WindowUpdate, false, grace),
            Err(TransitionError::Connection(Reason::PROTOCOL_ERROR))
        );
    }

    #[test]
    fn send_reset_on_closed_is_ignored() {
        let stream = StreamInner::new(1.into());
        let grace = Duration::from_secs(5);

        stream
            .transition(Direction::Send, Kind::Headers, true, grace)
            .unwrap();
        stream
            .transition(Direction::Recv, Kind::Headers, true, grace)
            .unwrap();

        assert_eq!(
            stream.transition(Direction::Send, Kind::Reset, false, grace),
            Err(TransitionError::Ignore)
        );
        assert_eq!(
            stream.transition(Direction::Send, Kind::Data, false, grace),
            Err(TransitionError::User(UserError::InactiveStreamId))
        );
    }

    #[test]
    fn data_after_remote_end_stream_is_a_connection_error() {
        let stream = StreamInner::new(1.into());
        let grace = Duration::from_secs(5);

        // Peer opens and finishes in one frame.
        stream
            .transition(Direction::Recv, Kind::Headers, true, grace)
            .unwrap();
        assert_eq!(stream.state.load(), StreamState::HalfClosedRemote);

        assert_eq!(
            stream.transition(Direction::Recv, Kind::Data, false, grace),
            Err(TransitionError::Connection(Reason::STREAM_CLOSED))
        );
    }
}
