use crate::codec::UserError;
use crate::frame::Settings;

/// The local and remote settings snapshots, with the apply-on-ACK
/// discipline for our own: a SETTINGS frame we send sits in `pending`
/// and only becomes the applied snapshot once the peer acknowledges it.
#[derive(Debug)]
pub struct SettingsState {
    local: Settings,
    pending_local: Option<Settings>,
    remote: Settings,
}

/// What changed when a snapshot was updated; the connection propagates
/// these onto live streams.
#[derive(Debug, Default, Clone, Copy)]
pub struct AppliedSettings {
    /// Delta to apply to per-stream initial windows.
    pub initial_window_delta: i64,
    pub max_concurrent_streams: Option<Option<u32>>,
}

impl SettingsState {
    /// `initial` is the SETTINGS frame sent during the opening
    /// handshake; it stays pending until the peer's ACK.
    pub fn new(initial: Settings) -> SettingsState {
        SettingsState {
            local: Settings::new(),
            pending_local: Some(initial),
            remote: Settings::new(),
        }
    }

    pub fn local(&self) -> &Settings {
        &self.local
    }

    pub fn remote(&self) -> &Settings {
        &self.remote
    }

    /// Stages a SETTINGS frame for sending. Only one may be in flight.
    pub fn start_send(&mut self, settings: Settings) -> Result<(), UserError> {
        if self.pending_local.is_some() {
            return Err(UserError::SendSettingsWhilePending);
        }
        self.pending_local = Some(settings);
        Ok(())
    }

    /// Applies the pending local snapshot on receipt of the peer's ACK.
    pub fn recv_ack(&mut self) -> AppliedSettings {
        let pending = match self.pending_local.take() {
            Some(pending) => pending,
            None => {
                tracing::warn!("received SETTINGS ACK with nothing pending");
                return AppliedSettings::default();
            }
        };

        Self::merge(&mut self.local, pending)
    }

    /// Applies a SETTINGS frame received from the peer.
    pub fn recv_remote(&mut self, frame: Settings) -> AppliedSettings {
        Self::merge(&mut self.remote, frame)
    }

    fn merge(snapshot: &mut Settings, update: Settings) -> AppliedSettings {
        let old_initial = snapshot.initial_window_size();
        let old_max_concurrent = snapshot.max_concurrent_streams();

        for (id, value) in update.iter() {
            // Values were validated when the frame was assembled.
            let _ = snapshot.set_value(id, value);
        }

        let mut applied = AppliedSettings::default();
        applied.initial_window_delta =
            snapshot.initial_window_size() as i64 - old_initial as i64;
        if snapshot.max_concurrent_streams() != old_max_concurrent {
            applied.max_concurrent_streams = Some(snapshot.max_concurrent_streams());
        }
        applied
    }
}
