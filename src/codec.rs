//! The seam between the engine and its frame-codec collaborator.
//!
//! The engine never touches wire bytes. Inbound, it consumes any
//! `futures_core::Stream` of decoded frames; outbound, it drives a
//! [`FrameWrite`]. HPACK is the codec's business as well: HEADERS and
//! PUSH_PROMISE frames cross this seam with their header lists already
//! decoded.

use std::task::{Context, Poll};
use std::{error, fmt, io};

use crate::frame::{Frame, Reason, StreamId};

/// The outbound half of the frame codec. Mirrors a buffered framed
/// writer: `buffer` may only be called after `poll_ready` returned
/// `Ready`, and the codec is free to coalesce buffered frames into
/// larger transport writes before `poll_flush` completes.
pub trait FrameWrite {
    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>>;

    fn buffer(&mut self, frame: Frame) -> io::Result<()>;

    fn poll_flush(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>>;
}

impl<T: FrameWrite + ?Sized> FrameWrite for &mut T {
    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        (**self).poll_ready(cx)
    }

    fn buffer(&mut self, frame: Frame) -> io::Result<()> {
        (**self).buffer(frame)
    }

    fn poll_flush(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        (**self).poll_flush(cx)
    }
}

/// Errors surfaced while receiving: fatal to the connection, fatal to
/// one stream, or a transport failure.
#[derive(Debug)]
pub enum RecvError {
    Connection(Reason),
    Stream { id: StreamId, reason: Reason },
    Io(io::Error),
}

/// Errors surfaced while sending.
#[derive(Debug)]
pub enum SendError {
    User(UserError),
    Connection(Reason),
    Io(io::Error),
}

/// Errors returned synchronously to callers attempting invalid
/// operations.
#[derive(Debug, PartialEq, Eq)]
pub enum UserError {
    /// The stream is no longer accepting writes.
    InactiveStreamId,
    /// The frame is not legal in the stream's current state.
    UnexpectedFrameType,
    /// The peer's concurrency limit leaves no room for another stream.
    Rejected,
    /// The local stream-id space is exhausted.
    OverflowedStreamId,
    /// Header fields violate the HTTP/2 field rules.
    MalformedHeaders,
    /// A previous PING has not been acknowledged yet.
    SendPingWhilePending,
    /// A previous SETTINGS has not been acknowledged yet.
    SendSettingsWhilePending,
    /// The peer disabled server push.
    PeerDisabledServerPush,
    /// Only a server may push.
    PushOnClient,
}

impl From<io::Error> for RecvError {
    fn from(src: io::Error) -> Self {
        RecvError::Io(src)
    }
}

impl error::Error for RecvError {}

impl fmt::Display for RecvError {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        use self::RecvError::*;

        match *self {
            Connection(ref reason) => reason.fmt(fmt),
            Stream { ref reason, .. } => reason.fmt(fmt),
            Io(ref e) => e.fmt(fmt),
        }
    }
}

impl error::Error for SendError {}

impl fmt::Display for SendError {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        use self::SendError::*;

        match *self {
            User(ref e) => e.fmt(fmt),
            Connection(ref reason) => reason.fmt(fmt),
            Io(ref e) => e.fmt(fmt),
        }
    }
}

impl From<io::Error> for SendError {
    fn from(src: io::Error) -> Self {
        SendError::Io(src)
    }
}

impl From<UserError> for SendError {
    fn from(src: UserError) -> Self {
        SendError::User(src)
    }
}

impl error::Error for UserError {}

impl fmt::Display for UserError {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        use self::UserError::*;

        fmt.write_str(match *self {
            InactiveStreamId => "inactive stream",
            UnexpectedFrameType => "unexpected frame type",
            Rejected => "stream would exceed the peer's concurrency limit",
            OverflowedStreamId => "stream ID overflowed",
            MalformedHeaders => "malformed headers",
            SendPingWhilePending => "send_ping before received previous pong",
            SendSettingsWhilePending => "sending SETTINGS before received previous ACK",
            PeerDisabledServerPush => "sending PUSH_PROMISE to peer who disabled server push",
            PushOnClient => "clients cannot send PUSH_PROMISE",
        })
    }
}
