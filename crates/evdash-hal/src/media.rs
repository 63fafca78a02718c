//! Media/Bluetooth controller source.
//!
//! Owns the playback state mirrored into every snapshot. Commands are
//! forwarded to the attached device first; the mirror only changes after the
//! device accepted the write, so a failed command leaves no trace.

use evdash_types::{Command, EvError, MediaState, Reading, SourceKind};
use tracing::{debug, warn};

use crate::source::{Ack, HardwareSource};

const PLAYLIST: [(&str, &str, u32); 4] = [
    ("Midnight Drive", "Neon Coast", 214),
    ("Open Road", "The Chargers", 187),
    ("Regen", "Kilowatt", 243),
    ("Green Wave", "Traffic Lights", 199),
];

/// Media head-unit driver.
pub trait MediaDevice: Send {
    /// Forward a media command to the device.
    ///
    /// # Errors
    ///
    /// Returns [`EvError::HardwareFault`] if the device refused it.
    fn write(&mut self, command: &Command) -> Result<(), EvError>;
}

pub struct MediaController {
    id: String,
    device: Option<Box<dyn MediaDevice>>,
    state: MediaState,
    track: Option<usize>,
}

impl MediaController {
    pub fn synthetic() -> Self {
        Self {
            id: "media".to_string(),
            device: None,
            state: MediaState::default(),
            track: None,
        }
    }

    pub fn with_device(device: Box<dyn MediaDevice>) -> Self {
        Self {
            device: Some(device),
            ..Self::synthetic()
        }
    }

    fn load(&mut self, index: usize) {
        let index = index % PLAYLIST.len();
        let (title, artist, duration) = PLAYLIST[index];
        self.track = Some(index);
        self.state.track_title = title.to_string();
        self.state.track_artist = artist.to_string();
        self.state.duration = duration;
        self.state.position = 0;
    }

    fn mirror(&mut self, command: &Command) {
        match command {
            Command::PlayMusic => {
                if self.track.is_none() {
                    self.load(0);
                }
                self.state.is_playing = true;
            }
            Command::PauseMusic => self.state.is_playing = false,
            Command::NextTrack => {
                let next = self.track.map_or(0, |i| i + 1);
                self.load(next);
            }
            Command::PreviousTrack => {
                let prev = self
                    .track
                    .map_or(0, |i| (i + PLAYLIST.len() - 1) % PLAYLIST.len());
                self.load(prev);
            }
            Command::SetVolume { volume } => self.state.volume = *volume,
            Command::ConnectBluetooth { device_address } => {
                self.state.connected = true;
                self.state.device_name = format!("Phone {device_address}");
            }
            _ => {}
        }
    }
}

fn is_media_command(command: &Command) -> bool {
    matches!(
        command,
        Command::PlayMusic
            | Command::PauseMusic
            | Command::NextTrack
            | Command::PreviousTrack
            | Command::SetVolume { .. }
            | Command::ConnectBluetooth { .. }
    )
}

impl HardwareSource for MediaController {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> SourceKind {
        SourceKind::Media
    }

    fn is_synthetic(&self) -> bool {
        self.device.is_none()
    }

    fn poll(&mut self) -> Reading {
        if self.state.is_playing && self.state.position < self.state.duration {
            self.state.position += 1;
        }
        Reading::Media(self.state.clone())
    }

    fn apply(&mut self, command: &Command) -> Result<Ack, EvError> {
        if !is_media_command(command) {
            return Err(EvError::Rejected(format!(
                "source '{}' does not accept {}",
                self.id,
                command.action()
            )));
        }

        let ack = match self.device.as_mut() {
            Some(device) => {
                if let Err(e) = device.write(command) {
                    warn!(source = %self.id, action = command.action(), error = %e, "media write failed");
                    return Err(e);
                }
                Ack::Applied
            }
            None => Ack::Mirrored,
        };
        self.mirror(command);
        debug!(action = command.action(), ?ack, "media command applied");
        Ok(ack)
    }
}
