use crate::frame::Frame;

pub type Payload = [u8; 8];

#[derive(Debug, Eq, PartialEq, Clone, Copy)]
pub struct Ping {
    ack: bool,
    payload: Payload,
}

impl Ping {
    pub fn new(payload: Payload) -> Ping {
        Ping {
            ack: false,
            payload,
        }
    }

    pub fn pong(payload: Payload) -> Ping {
        Ping { ack: true, payload }
    }

    pub fn is_ack(&self) -> bool {
        self.ack
    }

    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    pub fn into_payload(self) -> Payload {
        self.payload
    }
}

impl From<Ping> for Frame {
    fn from(src: Ping) -> Self {
        Frame::Ping(src)
    }
}
