pub(crate) mod connection;
pub(crate) mod go_away;
pub(crate) mod peer;
pub(crate) mod ping_pong;
pub(crate) mod settings;
pub(crate) mod streams;
pub(crate) mod write_queue;

use std::time::Duration;

pub type WindowSize = u32;

pub const MAX_WINDOW_SIZE: WindowSize = (1 << 31) - 1;

/// How long a closed stream tolerates late WINDOW_UPDATE or RST_STREAM
/// before they become protocol errors, and how long it stays in the
/// registry before recycling.
pub const DEFAULT_RESET_STREAM_GRACE: Duration = Duration::from_secs(5);

pub const DEFAULT_WRITE_QUEUE_CAPACITY: usize = 32;
