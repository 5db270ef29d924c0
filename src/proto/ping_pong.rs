use std::sync::Mutex;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use futures_util::task::AtomicWaker;

use crate::codec::UserError;
use crate::frame::PingPayload;

/// Tracks the single in-flight user PING and its round-trip time.
/// Inbound PINGs that need a pong are the connection's business; this
/// only matches acknowledgements against what we sent.
#[derive(Debug)]
pub struct PingPong {
    inner: Mutex<Option<Pending>>,
    pong_waker: AtomicWaker,
}

#[derive(Debug)]
struct Pending {
    payload: PingPayload,
    sent_at: Instant,
    rtt: Option<Duration>,
}

impl PingPong {
    pub fn new() -> PingPong {
        PingPong {
            inner: Mutex::new(None),
            pong_waker: AtomicWaker::new(),
        }
    }

    /// Registers an outgoing user ping. One at a time.
    pub fn start(&self, payload: PingPayload) -> Result<(), UserError> {
        let mut pending = self.inner.lock().unwrap();
        if pending.is_some() {
            return Err(UserError::SendPingWhilePending);
        }
        *pending = Some(Pending {
            payload,
            sent_at: Instant::now(),
            rtt: None,
        });
        Ok(())
    }

    /// Matches a PING ACK against the pending ping. Unsolicited or
    /// mismatched acknowledgements are reported but otherwise harmless.
    pub fn recv_pong(&self, payload: &PingPayload) {
        let mut pending = self.inner.lock().unwrap();
        match pending.as_mut() {
            Some(p) if &p.payload == payload => {
                p.rtt = Some(p.sent_at.elapsed());
                drop(pending);
                self.pong_waker.wake();
            }
            _ => {
                tracing::warn!("received PING ack that we never sent");
            }
        }
    }

    pub fn poll_rtt(&self, cx: &mut Context<'_>) -> Poll<Duration> {
        self.pong_waker.register(cx.waker());
        let mut pending = self.inner.lock().unwrap();
        if let Some(rtt) = pending.as_ref().and_then(|p| p.rtt) {
            *pending = None;
            return Poll::Ready(rtt);
        }
        Poll::Pending
    }

    /// Abandons the pending ping, e.g. when the connection dies first.
    pub fn cancel(&self) {
        *self.inner.lock().unwrap() = None;
    }
}
