mod support;

use bytes::Bytes;
use futures::executor::block_on;
use http::{HeaderMap, Method};
use std::task::Poll;
use support::{data_bytes, data_frames, poll_once, Harness};
use weft::frame::{self, Frame, Pseudo};
use weft::{Connection, Peer, StreamState};

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

#[test]
fn large_write_blocks_until_window_updates() {
    let mut h = Harness::new(Connection::new(Peer::Client));

    let stream = block_on(h.conn.open_stream(request(), HeaderMap::new(), false)).unwrap();
    h.sent();

    let payload = Bytes::from(vec![0u8; 200_000]);
    let mut write = Box::pin(stream.write(payload, false));

    // The first burst is capped by the 65535-byte initial windows.
    assert!(poll_once(&mut write).is_pending());
    let sent = h.sent();
    assert_eq!(data_bytes(&sent), 65_535);

    // Credit arrives on both levels; the producer resumes.
    h.feed(frame::WindowUpdate::new(1.into(), 100_000));
    h.feed(frame::WindowUpdate::new(0.into(), 100_000));
    assert!(poll_once(&mut write).is_pending());
    let sent = h.sent();
    assert_eq!(data_bytes(&sent), 100_000);

    h.feed(frame::WindowUpdate::new(1.into(), 50_000));
    h.feed(frame::WindowUpdate::new(0.into(), 50_000));
    assert!(matches!(poll_once(&mut write), Poll::Ready(Ok(()))));
    let sent = h.sent();
    assert_eq!(data_bytes(&sent), 200_000 - 165_535);
}

#[test]
fn receiver_emits_window_updates_at_half_window() {
    let mut h = Harness::new(Connection::new(Peer::Server));

    h.feed(request_headers(1, false));
    let stream = block_on(h.conn.accept()).unwrap();

    h.feed(frame::Data::new(1.into(), Bytes::from(vec![1u8; 16_384])));
    h.feed(frame::Data::new(1.into(), Bytes::from(vec![2u8; 16_384])));
    h.sent();

    // First chunk returned: under the 50% threshold, no update yet.
    assert_eq!(
        block_on(stream.read()).unwrap().map(|chunk| chunk.len()),
        Some(16_384)
    );
    let sent = h.sent();
    assert!(
        !sent.iter().any(|f| matches!(f, Frame::WindowUpdate(_))),
        "no WINDOW_UPDATE expected before the threshold, got {:?}",
        sent
    );

    // Second chunk crosses it on both levels.
    assert_eq!(
        block_on(stream.read()).unwrap().map(|chunk| chunk.len()),
        Some(16_384)
    );
    let sent = h.sent();
    let updates: Vec<_> = sent
        .iter()
        .filter_map(|f| match f {
            Frame::WindowUpdate(update) => Some((u32::from(update.stream_id()), update.size_increment())),
            _ => None,
        })
        .collect();

    assert!(updates.contains(&(0, 32_768)), "conn update in {:?}", updates);
    assert!(updates.contains(&(1, 32_768)), "stream update in {:?}", updates);
}

#[test]
fn no_head_of_line_blocking_across_streams() {
    let mut h = Harness::new(Connection::new(Peer::Client));

    let one = block_on(h.conn.open_stream(request(), HeaderMap::new(), false)).unwrap();
    let three = block_on(h.conn.open_stream(request(), HeaderMap::new(), false)).unwrap();
    h.sent();

    // Stream 1 exhausts its own window and the whole connection window.
    let mut write_one = Box::pin(one.write(Bytes::from(vec![0u8; 100_000]), false));
    assert!(poll_once(&mut write_one).is_pending());
    let sent = h.sent();
    assert_eq!(data_bytes(&sent), 65_535);

    let mut write_three = Box::pin(three.write(Bytes::from(vec![0u8; 50_000]), false));
    assert!(poll_once(&mut write_three).is_pending());

    // Connection credit alone lets stream 3 proceed; stream 1 stays
    // parked on its per-stream window.
    h.feed(frame::WindowUpdate::new(0.into(), 50_000));
    assert!(matches!(poll_once(&mut write_three), Poll::Ready(Ok(()))));
    assert!(poll_once(&mut write_one).is_pending());

    let sent = h.sent();
    for frame in data_frames(&sent) {
        assert_eq!(frame.stream_id(), 3u32);
    }
    assert_eq!(data_bytes(&sent), 50_000);
}

#[test]
fn data_frames_respect_max_frame_size() {
    let mut h = Harness::new(Connection::new(Peer::Client));

    let stream = block_on(h.conn.open_stream(request(), HeaderMap::new(), false)).unwrap();
    h.sent();

    block_on(stream.write(Bytes::from(vec![0u8; 40_000]), true)).unwrap();
    let sent = h.sent();
    let frames = data_frames(&sent);

    // ceil(40000 / 16384) frames, the last carrying END_STREAM.
    assert_eq!(frames.len(), 3);
    assert_eq!(frames[0].payload().len(), 16_384);
    assert_eq!(frames[1].payload().len(), 16_384);
    assert_eq!(frames[2].payload().len(), 40_000 - 2 * 16_384);
    assert!(!frames[0].is_end_stream());
    assert!(frames[2].is_end_stream());
    assert_eq!(stream.state(), StreamState::HalfClosedLocal);
}

#[test]
fn initial_window_shrink_applies_the_delta_to_live_streams() {
    let mut h = Harness::new(Connection::new(Peer::Client));

    let stream = block_on(h.conn.open_stream(request(), HeaderMap::new(), false)).unwrap();
    h.sent();

    // 20000 bytes already in flight.
    block_on(stream.write(Bytes::from(vec![0u8; 20_000]), false)).unwrap();
    h.sent();

    // The peer shrinks INITIAL_WINDOW_SIZE to 1024; the stream's send
    // window becomes 45535 + (1024 - 65535) = -18976.
    let mut settings = frame::Settings::new();
    settings.set_initial_window_size(1_024).unwrap();
    h.feed(settings);

    let sent = h.sent();
    assert!(
        sent.iter()
            .any(|f| matches!(f, Frame::Settings(s) if s.is_ack())),
        "SETTINGS must be acknowledged, got {:?}",
        sent
    );
    assert_eq!(h.conn.remote_settings().initial_window_size(), 1_024);

    let mut write = Box::pin(stream.write(Bytes::from(vec![0u8; 10_000]), false));
    assert!(poll_once(&mut write).is_pending());
    assert_eq!(data_bytes(&h.sent()), 0);

    // Returning 20000 bytes leaves exactly 1024 of stream credit.
    h.feed(frame::WindowUpdate::new(1.into(), 20_000));
    assert!(poll_once(&mut write).is_pending());
    assert_eq!(data_bytes(&h.sent()), 1_024);
}

#[test]
fn connection_flow_violation_is_fatal() {
    let mut h = Harness::new(Connection::new(Peer::Server));

    h.feed(request_headers(1, false));
    block_on(h.conn.accept()).unwrap();

    // A single frame larger than the connection window.
    h.feed(frame::Data::new(1.into(), Bytes::from(vec![0u8; 70_000])));

    assert_eq!(
        h.run_error_reason(),
        Some(weft::Reason::FLOW_CONTROL_ERROR)
    );
    let sent = h.sent();
    assert!(
        sent.iter()
            .any(|f| matches!(f, Frame::GoAway(g) if g.reason() == weft::Reason::FLOW_CONTROL_ERROR)),
        "expected GOAWAY, got {:?}",
        sent
    );
}
