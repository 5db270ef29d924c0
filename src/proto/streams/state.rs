use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};

use crate::frame::Kind;

/// Stream states from RFC 7540 section 5.1.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum StreamState {
    Idle = 0,
    ReservedLocal = 1,
    ReservedRemote = 2,
    Open = 3,
    HalfClosedLocal = 4,
    HalfClosedRemote = 5,
    Closed = 6,
}

/// Whether a frame is being received from the peer or sent by us; the
/// transition table is keyed on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Recv,
    Send,
}

/// The state field itself. Transitions go through a compare-and-swap so
/// that concurrent observers always see a consistent sequence of states.
#[derive(Debug)]
pub struct State {
    inner: AtomicU8,
}

impl State {
    pub fn new() -> State {
        State {
            inner: AtomicU8::new(StreamState::Idle as u8),
        }
    }

    pub fn load(&self) -> StreamState {
        StreamState::from_u8(self.inner.load(Ordering::Acquire))
    }

    pub fn compare_and_swap(&self, from: StreamState, to: StreamState) -> bool {
        self.inner
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

impl StreamState {
    fn from_u8(src: u8) -> StreamState {
        use self::StreamState::*;

        match src {
            0 => Idle,
            1 => ReservedLocal,
            2 => ReservedRemote,
            3 => Open,
            4 => HalfClosedLocal,
            5 => HalfClosedRemote,
            6 => Closed,
            _ => unreachable!("invalid stream state"),
        }
    }

    /// Counted against the peer's concurrent-stream limit.
    pub fn is_active(&self) -> bool {
        use self::StreamState::*;

        matches!(*self, Open | HalfClosedLocal | HalfClosedRemote)
    }

    /// The local endpoint may still send DATA.
    pub fn is_send_open(&self) -> bool {
        use self::StreamState::*;

        matches!(*self, Open | HalfClosedRemote)
    }

    /// The local endpoint may still receive DATA.
    pub fn is_recv_open(&self) -> bool {
        use self::StreamState::*;

        matches!(*self, Open | HalfClosedLocal)
    }

    pub fn is_closed(&self) -> bool {
        *self == StreamState::Closed
    }
}

impl fmt::Display for StreamState {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        use self::StreamState::*;

        fmt.write_str(match *self {
            Idle => "Idle",
            ReservedLocal => "ReservedLocal",
            ReservedRemote => "ReservedRemote",
            Open => "Open",
            HalfClosedLocal => "HalfClosedLocal",
            HalfClosedRemote => "HalfClosedRemote",
            Closed => "Closed",
        })
    }
}

/// The legal transition for a frame of `kind` moving in `dir` while the
/// stream is in `from`, or `None` when the frame is not permitted there.
///
/// END_STREAM is applied as post-processing: a destination of Open
/// becomes the appropriate half-closed state and a half-closed
/// destination becomes Closed.
pub fn transition(
    dir: Direction,
    from: StreamState,
    kind: Kind,
    end_stream: bool,
) -> Option<StreamState> {
    use self::StreamState::*;

    let mut to = from;

    match dir {
        Direction::Recv => match from {
            Idle => match kind {
                Kind::Headers => to = Open,
                Kind::Priority => {}
                Kind::PushPromise => to = ReservedRemote,
                _ => return None,
            },
            ReservedLocal | HalfClosedRemote => match kind {
                Kind::Priority | Kind::WindowUpdate => {}
                Kind::Reset => to = Closed,
                _ => return None,
            },
            ReservedRemote => match kind {
                Kind::Headers => to = HalfClosedLocal,
                Kind::Priority => {}
                Kind::Reset => to = Closed,
                _ => return None,
            },
            Open | HalfClosedLocal => {
                if kind == Kind::Reset {
                    to = Closed;
                }
            }
            Closed => match kind {
                Kind::Priority => {}
                _ => return None,
            },
        },
        Direction::Send => match from {
            Idle => match kind {
                Kind::Headers => to = Open,
                Kind::Priority => {}
                Kind::PushPromise => to = ReservedLocal,
                _ => return None,
            },
            ReservedLocal => match kind {
                Kind::Headers => to = HalfClosedRemote,
                Kind::Priority => {}
                Kind::Reset => to = Closed,
                _ => return None,
            },
            ReservedRemote | HalfClosedLocal => match kind {
                Kind::Priority | Kind::WindowUpdate => {}
                Kind::Reset => to = Closed,
                _ => return None,
            },
            Open => {
                if kind == Kind::Reset {
                    to = Closed;
                }
            }
            HalfClosedRemote => match kind {
                Kind::Data | Kind::Headers | Kind::Priority => {}
                Kind::Reset => to = Closed,
                _ => return None,
            },
            Closed => match kind {
                Kind::Priority => {}
                _ => return None,
            },
        },
    }

    if end_stream {
        match to {
            Open => {
                to = match dir {
                    Direction::Recv => HalfClosedRemote,
                    Direction::Send => HalfClosedLocal,
                };
            }
            HalfClosedLocal | HalfClosedRemote => to = Closed,
            _ => {}
        }
    }

    Some(to)
}

#[cfg(test)]
mod tests {
    use super::Direction::*;
    use super::StreamState::*;
    use super::*;

    #[test]
    fn headers_open_a_stream_both_ways() {
        assert_eq!(transition(Recv, Idle, Kind::Headers, false), Some(Open));
        assert_eq!(transition(Send, Idle, Kind::Headers, false), Some(Open));
        assert_eq!(
            transition(Recv, Idle, Kind::Headers, true),
            Some(HalfClosedRemote)
        );
        assert_eq!(
            transition(Send, Idle, Kind::Headers, true),
            Some(HalfClosedLocal)
        );
    }

    #[test]
    fn data_on_idle_is_illegal() {
        assert_eq!(transition(Recv, Idle, Kind::Data, false), None);
        assert_eq!(transition(Recv, Idle, Kind::WindowUpdate, false), None);
        assert_eq!(transition(Recv, Idle, Kind::Reset, false), None);
    }

    #[test]
    fn priority_is_legal_everywhere() {
        for &state in &[
            Idle,
            ReservedLocal,
            ReservedRemote,
            Open,
            HalfClosedLocal,
            HalfClosedRemote,
            Closed,
        ] {
            assert_eq!(transition(Recv, state, Kind::Priority, false), Some(state));
            assert_eq!(transition(Send, state, Kind::Priority, false), Some(state));
        }
    }

    #[test]
    fn push_promise_reserves() {
        assert_eq!(
            transition(Recv, Idle, Kind::PushPromise, false),
            Some(ReservedRemote)
        );
        assert_eq!(
            transition(Send, Idle, Kind::PushPromise, false),
            Some(ReservedLocal)
        );
    }

    #[test]
    fn reserved_streams_activate_half_closed() {
        assert_eq!(
            transition(Recv, ReservedRemote, Kind::Headers, false),
            Some(HalfClosedLocal)
        );
        assert_eq!(
            transition(Send, ReservedLocal, Kind::Headers, false),
            Some(HalfClosedRemote)
        );
    }

    #[test]
    fn end_stream_promotes_half_closed_to_closed() {
        assert_eq!(
            transition(Recv, HalfClosedLocal, Kind::Data, true),
            Some(Closed)
        );
        assert_eq!(
            transition(Send, HalfClosedRemote, Kind::Data, true),
            Some(Closed)
        );
    }

    #[test]
    fn data_after_remote_end_stream_is_illegal() {
        assert_eq!(transition(Recv, HalfClosedRemote, Kind::Data, false), None);
        assert_eq!(transition(Recv, HalfClosedRemote, Kind::Headers, false), None);
    }

    #[test]
    fn late_window_update_on_closed_is_not_a_transition() {
        assert_eq!(transition(Recv, Closed, Kind::WindowUpdate, false), None);
        assert_eq!(transition(Recv, Closed, Kind::Reset, false), None);
    }

    #[test]
    fn cas_applies_once() {
        let state = State::new();
        assert!(state.compare_and_swap(Idle, Open));
        assert!(!state.compare_and_swap(Idle, Open));
        assert_eq!(state.load(), Open);
    }
}
