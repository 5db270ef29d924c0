use std::time::Instant;

use crate::frame::{Reason, StreamId};

/// GOAWAY bookkeeping for both directions. Once a direction is marked,
/// no new streams are accepted from it; streams at or below the
/// recorded id keep running until they close or the drain deadline
/// fires.
#[derive(Debug, Default)]
pub struct GoAway {
    sent: Option<GoingAway>,
    received: Option<GoingAway>,
    drain_deadline: Option<Instant>,
}

#[derive(Debug, Clone, Copy)]
pub struct GoingAway {
    pub last_stream_id: StreamId,
    pub reason: Reason,
}

impl GoAway {
    pub fn new() -> GoAway {
        GoAway::default()
    }

    pub fn record_sent(&mut self, last_stream_id: StreamId, reason: Reason) {
        if let Some(ref sent) = self.sent {
            debug_assert!(
                last_stream_id <= sent.last_stream_id,
                "GOAWAY stream IDs must not increase"
            );
        }
        self.sent = Some(GoingAway {
            last_stream_id,
            reason,
        });
    }

    pub fn record_received(&mut self, last_stream_id: StreamId, reason: Reason) {
        self.received = Some(GoingAway {
            last_stream_id,
            reason,
        });
    }

    pub fn sent(&self) -> Option<&GoingAway> {
        self.sent.as_ref()
    }

    pub fn received(&self) -> Option<&GoingAway> {
        self.received.as_ref()
    }

    pub fn is_going_away(&self) -> bool {
        self.sent.is_some() || self.received.is_some()
    }

    pub fn set_drain_deadline(&mut self, deadline: Instant) {
        self.drain_deadline = Some(deadline);
    }

    pub fn drain_expired(&self) -> bool {
        self.drain_deadline
            .map(|deadline| Instant::now() >= deadline)
            .unwrap_or(false)
    }
}
