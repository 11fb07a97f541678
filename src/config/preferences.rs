//! User media preferences and nickname helpers

use super::MediaConfig;
use crate::media::{MediaConstraints, TrackKind};
use rand::seq::SliceRandom;

const RANDOM_NICKNAMES: &[&str] = &[
    "Anonymous Cat",
    "Mysterious Penguin",
    "Cool Dragon",
    "Cheerful Rabbit",
    "Friendly Panda",
    "Lively Tiger",
    "Wise Owl",
    "Brave Lion",
    "Cute Squirrel",
    "Peaceful Dove",
];

/// Pick a nickname from the fixed list
pub fn random_nickname() -> String {
    RANDOM_NICKNAMES
        .choose(&mut rand::thread_rng())
        .copied()
        .unwrap_or("Guest")
        .to_string()
}

/// What the user asked for before joining: initial enabled flags and
/// preferred devices
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaPreferences {
    pub audio_enabled: bool,
    pub video_enabled: bool,
    pub audio_device: Option<String>,
    pub video_device: Option<String>,
}

impl Default for MediaPreferences {
    fn default() -> Self {
        Self::from(&MediaConfig::default())
    }
}

impl From<&MediaConfig> for MediaPreferences {
    fn from(config: &MediaConfig) -> Self {
        Self {
            audio_enabled: config.audio_enabled,
            video_enabled: config.video_enabled,
            audio_device: config.audio_device.clone().filter(|id| !id.is_empty()),
            video_device: config.video_device.clone().filter(|id| !id.is_empty()),
        }
    }
}

impl MediaPreferences {
    pub fn enabled(&self, kind: TrackKind) -> bool {
        match kind {
            TrackKind::Audio => self.audio_enabled,
            TrackKind::Video => self.video_enabled,
        }
    }

    pub fn set_enabled(&mut self, kind: TrackKind, enabled: bool) {
        match kind {
            TrackKind::Audio => self.audio_enabled = enabled,
            TrackKind::Video => self.video_enabled = enabled,
        }
    }

    pub fn set_device(&mut self, kind: TrackKind, device_id: Option<String>) {
        match kind {
            TrackKind::Audio => self.audio_device = device_id,
            TrackKind::Video => self.video_device = device_id,
        }
    }

    /// Constraints for a camera/microphone acquisition
    pub fn constraints(&self) -> MediaConstraints {
        MediaConstraints {
            audio_enabled: self.audio_enabled,
            video_enabled: self.video_enabled,
            audio_device_id: self.audio_device.clone(),
            video_device_id: self.video_device.clone(),
        }
    }
}
