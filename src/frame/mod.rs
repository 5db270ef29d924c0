use std::fmt;

mod data;
mod go_away;
mod headers;
mod ping;
mod priority;
mod reason;
mod reset;
mod settings;
mod stream_id;
mod util;
mod window_update;

pub use self::data::Data;
pub use self::go_away::GoAway;
pub use self::headers::{
    check_fields, is_connection_level, sanitize_fields, Headers, HeadersFlag, Pseudo, PushPromise,
};
pub use self::ping::{Ping, Payload as PingPayload};
pub use self::priority::{Priority, StreamDependency, DEFAULT_WEIGHT};
pub use self::reason::Reason;
pub use self::reset::Reset;
pub use self::settings::Settings;
pub use self::settings::SettingId;
pub use self::stream_id::{StreamId, StreamIdOverflow};
pub use self::window_update::WindowUpdate;

pub use self::settings::{
    DEFAULT_INITIAL_WINDOW_SIZE, DEFAULT_MAX_FRAME_SIZE, DEFAULT_SETTINGS_HEADER_TABLE_SIZE,
    MAX_INITIAL_WINDOW_SIZE, MAX_MAX_FRAME_SIZE,
};

/// A decoded HTTP/2 frame, as produced and consumed by the external
/// codec collaborator.
#[derive(Eq, PartialEq, Clone)]
pub enum Frame {
    Data(Data),
    Headers(Headers),
    Priority(Priority),
    PushPromise(PushPromise),
    Settings(Settings),
    Ping(Ping),
    GoAway(GoAway),
    WindowUpdate(WindowUpdate),
    Reset(Reset),
}

/// Frame discriminants, used to key state-machine transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
    Data,
    Headers,
    Priority,
    Reset,
    Settings,
    PushPromise,
    Ping,
    GoAway,
    WindowUpdate,
}

impl Frame {
    pub fn kind(&self) -> Kind {
        use self::Frame::*;

        match *self {
            Data(..) => Kind::Data,
            Headers(..) => Kind::Headers,
            Priority(..) => Kind::Priority,
            PushPromise(..) => Kind::PushPromise,
            Settings(..) => Kind::Settings,
            Ping(..) => Kind::Ping,
            GoAway(..) => Kind::GoAway,
            WindowUpdate(..) => Kind::WindowUpdate,
            Reset(..) => Kind::Reset,
        }
    }

    pub fn stream_id(&self) -> StreamId {
        use self::Frame::*;

        match *self {
            Data(ref frame) => frame.stream_id(),
            Headers(ref frame) => frame.stream_id(),
            Priority(ref frame) => frame.stream_id(),
            PushPromise(ref frame) => frame.stream_id(),
            Settings(..) | Ping(..) | GoAway(..) => StreamId::ZERO,
            WindowUpdate(ref frame) => frame.stream_id(),
            Reset(ref frame) => frame.stream_id(),
        }
    }

    pub fn is_end_stream(&self) -> bool {
        use self::Frame::*;

        match *self {
            Data(ref frame) => frame.is_end_stream(),
            Headers(ref frame) => frame.is_end_stream(),
            _ => false,
        }
    }
}

impl fmt::Debug for Frame {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        use self::Frame::*;

        match *self {
            Data(ref frame) => fmt::Debug::fmt(frame, fmt),
            Headers(ref frame) => fmt::Debug::fmt(frame, fmt),
            Priority(ref frame) => fmt::Debug::fmt(frame, fmt),
            PushPromise(ref frame) => fmt::Debug::fmt(frame, fmt),
            Settings(ref frame) => fmt::Debug::fmt(frame, fmt),
            Ping(ref frame) => fmt::Debug::fmt(frame, fmt),
            GoAway(ref frame) => fmt::Debug::fmt(frame, fmt),
            WindowUpdate(ref frame) => fmt::Debug::fmt(frame, fmt),
            Reset(ref frame) => fmt::Debug::fmt(frame, fmt),
        }
    }
}

impl fmt::Display for Kind {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        fmt.write_str(match *self {
            Kind::Data => "DATA",
            Kind::Headers => "HEADERS",
            Kind::Priority => "PRIORITY",
            Kind::Reset => "RST_STREAM",
            Kind::Settings => "SETTINGS",
            Kind::PushPromise => "PUSH_PROMISE",
            Kind::Ping => "PING",
            Kind::GoAway => "GOAWAY",
            Kind::WindowUpdate => "WINDOW_UPDATE",
        })
    }
}

/// Errors caused by semantically invalid frame contents.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    InvalidSettingValue,

    InvalidWindowUpdateValue,

    InvalidPayloadLength,

    InvalidStreamId,

    MalformedMessage,

    InvalidDependencyId,
}
