use crate::frame::StreamId;

/// Which side of the connection this engine plays. The core is
/// symmetric; the role only decides stream-id parity ownership and who
/// may push.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Peer {
    Client,
    Server,
}

impl Peer {
    pub fn is_server(&self) -> bool {
        *self == Peer::Server
    }

    /// Whether the given stream was initiated by this side.
    pub fn is_local_init(&self, id: StreamId) -> bool {
        assert!(!id.is_zero());
        self.is_server() == id.is_server_initiated()
    }

    /// The first stream id this side may initiate.
    pub fn first_stream_id(&self) -> StreamId {
        if self.is_server() {
            2.into()
        } else {
            1.into()
        }
    }
}

impl std::fmt::Display for Peer {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> std::fmt::Result {
        fmt.write_str(match *self {
            Peer::Client => "Client",
            Peer::Server => "Server",
        })
    }
}
