use std::fmt;

use crate::frame::{Error, Frame};

pub const DEFAULT_SETTINGS_HEADER_TABLE_SIZE: u32 = 4_096;
pub const DEFAULT_INITIAL_WINDOW_SIZE: u32 = 65_535;
pub const DEFAULT_MAX_FRAME_SIZE: u32 = 16_384;
pub const MAX_INITIAL_WINDOW_SIZE: u32 = (1 << 31) - 1;
pub const MAX_MAX_FRAME_SIZE: u32 = (1 << 24) - 1;

/// The six standard setting identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SettingId {
    HeaderTableSize,
    EnablePush,
    MaxConcurrentStreams,
    InitialWindowSize,
    MaxFrameSize,
    MaxHeaderListSize,
}

/// A SETTINGS frame: an ordered sequence of `(id, value)` pairs. Setting
/// an id that is already present overwrites it in place, preserving the
/// original position.
#[derive(Clone, Default, Eq, PartialEq)]
pub struct Settings {
    ack: bool,
    values: Vec<(SettingId, u32)>,
}

impl Settings {
    pub fn new() -> Settings {
        Settings::default()
    }

    pub fn ack() -> Settings {
        Settings {
            ack: true,
            values: Vec::new(),
        }
    }

    pub fn is_ack(&self) -> bool {
        self.ack
    }

    /// Looks up a raw value without applying defaults.
    pub fn value(&self, id: SettingId) -> Option<u32> {
        self.values
            .iter()
            .find(|(known, _)| *known == id)
            .map(|&(_, value)| value)
    }

    /// Sets a value, validating it first.
    pub fn set_value(&mut self, id: SettingId, value: u32) -> Result<(), Error> {
        let ok = match id {
            SettingId::EnablePush => value < 2,
            SettingId::InitialWindowSize => value <= MAX_INITIAL_WINDOW_SIZE,
            SettingId::MaxFrameSize => {
                DEFAULT_MAX_FRAME_SIZE <= value && value <= MAX_MAX_FRAME_SIZE
            }
            _ => true,
        };
        if !ok {
            return Err(Error::InvalidSettingValue);
        }

        for entry in &mut self.values {
            if entry.0 == id {
                entry.1 = value;
                return Ok(());
            }
        }
        self.values.push((id, value));
        Ok(())
    }

    /// Validates every entry, for frames assembled outside `set_value`.
    pub fn validate(&self) -> Result<(), Error> {
        let mut check = Settings::new();
        for &(id, value) in &self.values {
            check.set_value(id, value)?;
        }
        Ok(())
    }

    pub fn iter(&self) -> impl Iterator<Item = (SettingId, u32)> + '_ {
        self.values.iter().copied()
    }

    pub fn header_table_size(&self) -> u32 {
        self.value(SettingId::HeaderTableSize)
            .unwrap_or(DEFAULT_SETTINGS_HEADER_TABLE_SIZE)
    }

    pub fn is_push_enabled(&self) -> bool {
        self.value(SettingId::EnablePush).unwrap_or(1) != 0
    }

    pub fn set_push_enabled(&mut self, enabled: bool) {
        self.set_value(SettingId::EnablePush, enabled as u32)
            .expect("0/1 is always a valid ENABLE_PUSH");
    }

    /// `None` means no limit was advertised.
    pub fn max_concurrent_streams(&self) -> Option<u32> {
        self.value(SettingId::MaxConcurrentStreams)
    }

    pub fn set_max_concurrent_streams(&mut self, max: u32) {
        self.set_value(SettingId::MaxConcurrentStreams, max)
            .expect("any u32 is a valid MAX_CONCURRENT_STREAMS");
    }

    pub fn initial_window_size(&self) -> u32 {
        self.value(SettingId::InitialWindowSize)
            .unwrap_or(DEFAULT_INITIAL_WINDOW_SIZE)
    }

    pub fn set_initial_window_size(&mut self, size: u32) -> Result<(), Error> {
        self.set_value(SettingId::InitialWindowSize, size)
    }

    pub fn max_frame_size(&self) -> u32 {
        self.value(SettingId::MaxFrameSize)
            .unwrap_or(DEFAULT_MAX_FRAME_SIZE)
    }

    pub fn set_max_frame_size(&mut self, size: u32) -> Result<(), Error> {
        self.set_value(SettingId::MaxFrameSize, size)
    }

    /// `None` means no limit was advertised.
    pub fn max_header_list_size(&self) -> Option<u32> {
        self.value(SettingId::MaxHeaderListSize)
    }

    pub fn set_max_header_list_size(&mut self, size: u32) {
        self.set_value(SettingId::MaxHeaderListSize, size)
            .expect("any u32 is a valid MAX_HEADER_LIST_SIZE");
    }
}

impl From<Settings> for Frame {
    fn from(src: Settings) -> Self {
        Frame::Settings(src)
    }
}

impl fmt::Debug for Settings {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        if self.ack {
            return fmt.write_str("Settings(ACK)");
        }

        write!(fmt, "settings={{")?;
        for (i, (id, value)) in self.values.iter().enumerate() {
            if i > 0 {
                write!(fmt, ",")?;
            }
            write!(fmt, "{}:{}", id, value)?;
        }
        write!(fmt, "}}")
    }
}

impl fmt::Display for SettingId {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        fmt.write_str(match *self {
            SettingId::HeaderTableSize => "HEADER_TABLE_SIZE",
            SettingId::EnablePush => "ENABLE_PUSH",
            SettingId::MaxConcurrentStreams => "MAX_CONCURRENT_STREAMS",
            SettingId::InitialWindowSize => "INITIAL_WINDOW_SIZE",
            SettingId::MaxFrameSize => "MAX_FRAME_SIZE",
            SettingId::MaxHeaderListSize => "MAX_HEADER_LIST_SIZE",
        })
    }
}
