mod support;

use futures::executor::block_on;
use http::{HeaderMap, Method, StatusCode};
use std::task::Poll;
use std::time::Duration;
use support::{poll_once, Harness};
use weft::frame::{self, Frame, Pseudo};
use weft::{Connection, Peer, Reason, StreamState};

fn request() -> Pseudo {
    Pseudo::request(Method::GET, "https://example.com/".parse().unwrap())
}

fn request_headers(id: u32, end_stream: bool) -> frame::Headers {
    let mut headers = frame::Headers::new(id.into(), request(), HeaderMap::new());
    if end_stream {
        headers.set_end_stream();
    }
    headers
}

fn response_headers(id: u32, end_stream: bool) -> frame::Headers {
    let mut headers = frame::Headers::new(
        id.into(),
        Pseudo::response(StatusCode::OK),
        HeaderMap::new(),
    );
    if end_stream {
        headers.set_end_stream();
    }
    headers
}

#[test]
fn settings_apply_on_ack() {
    let conn = Connection::builder(Peer::Client)
        .initial_window_size(1_000_000)
        .max_concurrent_streams(50)
        .build();
    let mut h = Harness::new(conn);

    // Nothing is applied until the peer acknowledges.
    assert_eq!(h.conn.local_settings().initial_window_size(), 65_535);

    h.feed(frame::Settings::ack());
    assert_eq!(h.conn.local_settings().initial_window_size(), 1_000_000);
    assert_eq!(h.conn.local_settings().max_concurrent_streams(), Some(50));
}

#[test]
fn initial_settings_frame_carries_the_configuration() {
    let conn = Connection::builder(Peer::Client)
        .initial_window_size(1_000_000)
        .build();

    let pipe = support::Pipe::new();
    let flush_conn = conn.clone();
    let writer = pipe.writer();
    let mut flush = Box::pin(async move { flush_conn.flush(writer).await });
    let _ = poll_once(&mut flush);

    let sent = pipe.take_sent();
    match &sent[0] {
        Frame::Settings(settings) => {
            assert!(!settings.is_ack());
            assert_eq!(settings.initial_window_size(), 1_000_000);
        }
        other => panic!("expected SETTINGS first, got {:?}", other),
    }
}

#[test]
fn ping_payload_round_trips() {
    let mut h = Harness::new(Connection::new(Peer::Client));

    let payload = [1, 2, 3, 4, 5, 6, 7, 8];
    let conn = h.conn.clone();
    let mut ping = Box::pin(conn.ping(payload));
    assert!(poll_once(&mut ping).is_pending());

    let sent = h.sent();
    match &sent[0] {
        Frame::Ping(frame) => {
            assert!(!frame.is_ack());
            assert_eq!(frame.payload(), &payload);
        }
        other => panic!("expected PING, got {:?}", other),
    }

    h.feed(frame::Ping::pong(payload));
    match poll_once(&mut ping) {
        Poll::Ready(Ok(_rtt)) => {}
        other => panic!("expected an RTT, got {:?}", other),
    }
}

#[test]
fn inbound_ping_is_acked_with_the_same_payload() {
    let mut h = Harness::new(Connection::new(Peer::Server));

    let payload = [9u8; 8];
    h.feed(frame::Ping::new(payload));

    let sent = h.sent();
    match &sent[0] {
        Frame::Ping(frame) => {
            assert!(frame.is_ack());
            assert_eq!(frame.payload(), &payload);
        }
        other => panic!("expected PING ack, got {:?}", other),
    }
}

#[test]
fn goaway_refuses_new_streams_but_drains_old_ones() {
    let mut h = Harness::new(Connection::new(Peer::Client));

    let kept = block_on(h.conn.open_stream(request(), HeaderMap::new(), true)).unwrap();
    let refused = block_on(h.conn.open_stream(request(), HeaderMap::new(), true)).unwrap();
    assert_eq!(kept.id(), 1u32);
    assert_eq!(refused.id(), 3u32);
    h.sent();

    // The server processed only stream 1.
    h.feed(frame::GoAway::new(1.into(), Reason::NO_ERROR));
    assert_eq!(
        h.conn.goaway_received(),
        Some((1u32.into(), Reason::NO_ERROR))
    );

    // Stream 3 will never be processed.
    assert_eq!(refused.state(), StreamState::Closed);
    let err = block_on(refused.read()).unwrap_err();
    assert_eq!(err.reason(), Some(Reason::REFUSED_STREAM));

    // Opening anything new fails locally.
    let err = block_on(h.conn.open_stream(request(), HeaderMap::new(), true)).unwrap_err();
    assert_eq!(err.reason(), Some(Reason::REFUSED_STREAM));

    // Stream 1 runs to completion.
    h.feed(response_headers(1, true));
    assert_eq!(kept.state(), StreamState::Closed);
    let (pseudo, _) = block_on(kept.read_headers()).unwrap();
    assert_eq!(pseudo.status, Some(StatusCode::OK));
}

#[test]
fn reset_grace_window_ignores_then_rejects() {
    let conn = Connection::builder(Peer::Server)
        .reset_stream_grace(Duration::from_millis(40))
        .build();
    let mut h = Harness::new(conn);

    h.feed(request_headers(5, false));
    let stream = block_on(h.conn.accept()).unwrap();

    stream.reset(Reason::CANCEL);
    h.sent();

    // Within the grace window: silently ignored.
    h.feed(frame::WindowUpdate::new(5.into(), 10));
    assert!(h.run_result.is_none());
    assert!(h.sent().is_empty());

    std::thread::sleep(Duration::from_millis(60));

    // Past the grace window: connection error PROTOCOL_ERROR.
    h.feed(frame::WindowUpdate::new(5.into(), 10));
    assert_eq!(h.run_error_reason(), Some(Reason::PROTOCOL_ERROR));
}

#[test]
fn peer_concurrency_limit_is_enforced() {
    let conn = Connection::builder(Peer::Server)
        .max_concurrent_streams(1)
        .build();
    let mut h = Harness::new(conn);

    h.feed(request_headers(1, false));
    h.feed(request_headers(3, false));

    // Stream 1 is fine, stream 3 is refused without hurting the
    // connection.
    assert!(h.run_result.is_none());
    let sent = h.sent();
    assert!(
        sent.iter().any(
            |f| matches!(f, Frame::Reset(r) if r.stream_id() == 3u32 && r.reason() == Reason::REFUSED_STREAM)
        ),
        "expected RST_STREAM(REFUSED_STREAM) for stream 3, got {:?}",
        sent
    );

    let first = block_on(h.conn.accept()).unwrap();
    assert_eq!(first.id(), 1u32);
}

#[test]
fn graceful_close_drains_active_streams() {
    let mut h = Harness::new(Connection::new(Peer::Server));

    h.feed(request_headers(1, true));
    let stream = block_on(h.conn.accept()).unwrap();

    h.conn.close(Reason::NO_ERROR);
    let sent = h.sent();
    assert!(
        sent.iter()
            .any(|f| matches!(f, Frame::GoAway(g) if g.reason() == Reason::NO_ERROR)),
        "expected GOAWAY, got {:?}",
        sent
    );

    let conn = h.conn.clone();
    let mut drained = Box::pin(conn.drained());
    assert!(poll_once(&mut drained).is_pending());

    // The last active stream finishes; the connection drains out.
    block_on(stream.send_headers(Pseudo::response(StatusCode::OK), HeaderMap::new(), true))
        .unwrap();
    h.turn();
    assert!(poll_once(&mut drained).is_ready());
    assert!(matches!(h.flush_result, Some(Ok(()))));
}

#[test]
fn abort_drain_cancels_survivors() {
    let mut h = Harness::new(Connection::new(Peer::Server));

    h.feed(request_headers(1, false));
    let stream = block_on(h.conn.accept()).unwrap();

    h.conn.close(Reason::NO_ERROR);
    h.sent();

    h.conn.abort_drain();
    assert_eq!(stream.state(), StreamState::Closed);

    let sent = h.sent();
    assert!(
        sent.iter().any(
            |f| matches!(f, Frame::Reset(r) if r.stream_id() == 1u32 && r.reason() == Reason::CANCEL)
        ),
        "expected RST_STREAM(CANCEL), got {:?}",
        sent
    );

    let conn = h.conn.clone();
    let mut drained = Box::pin(conn.drained());
    assert!(poll_once(&mut drained).is_ready());
}

#[test]
fn data_on_stream_zero_is_a_protocol_error() {
    let mut h = Harness::new(Connection::new(Peer::Server));

    // A DATA frame cannot name stream zero; the constructor refuses it,
    // so a hostile peer is simulated with a WINDOW_UPDATE bearing a
    // zero increment instead.
    h.feed(frame::WindowUpdate::new(0.into(), 0));
    assert_eq!(h.run_error_reason(), Some(Reason::PROTOCOL_ERROR));

    let sent = h.sent();
    assert!(
        sent.iter()
            .any(|f| matches!(f, Frame::GoAway(g) if g.reason() == Reason::PROTOCOL_ERROR)),
        "expected GOAWAY, got {:?}",
        sent
    );
}

#[test]
fn push_promise_with_zero_promised_id_is_a_protocol_error() {
    let mut h = Harness::new(Connection::new(Peer::Client));

    let parent = block_on(h.conn.open_stream(request(), HeaderMap::new(), false)).unwrap();
    assert_eq!(parent.id(), 1u32);
    h.sent();

    let promise = frame::PushPromise::new(1.into(), 0.into(), request(), HeaderMap::new());
    h.feed(promise);

    assert_eq!(h.run_error_reason(), Some(Reason::PROTOCOL_ERROR));
    let sent = h.sent();
    assert!(
        sent.iter()
            .any(|f| matches!(f, Frame::GoAway(g) if g.reason() == Reason::PROTOCOL_ERROR)),
        "expected GOAWAY, got {:?}",
        sent
    );
}

#[test]
fn headers_on_a_forgotten_stream_are_fatal() {
    let conn = Connection::builder(Peer::Server)
        .reset_stream_grace(Duration::from_millis(0))
        .build();
    let mut h = Harness::new(conn);

    h.feed(request_headers(5, true));
    let stream = block_on(h.conn.accept()).unwrap();
    block_on(stream.send_headers(Pseudo::response(StatusCode::OK), HeaderMap::new(), true))
        .unwrap();
    h.sent();

    std::thread::sleep(Duration::from_millis(5));

    // Stream 5 has been recycled; a lower id is "closed and forgotten".
    h.feed(request_headers(3, true));
    assert_eq!(h.run_error_reason(), Some(Reason::PROTOCOL_ERROR));
}
