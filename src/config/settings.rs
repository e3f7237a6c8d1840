//! Stream configuration.
//!
//! [`StreamSettings`] collects every tunable that must be decided before a
//! stream starts: buffering, timeout, playback rate and volume. Settings can
//! be persisted to TOML in the user's config directory
//! (`~/.config/audiopipe/settings.toml`) so an application can keep its
//! buffering profile between runs.
//!
//! # Examples
//!
//! ```rust
//! use audiopipe::config::StreamSettings;
//!
//! let mut settings = StreamSettings::default();
//! settings.set_buffer_count(64);
//! settings.set_playback_rate(1.5);
//! assert_eq!(settings.buffer_count, 64);
//! ```

use crate::models::FileType;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;

/// Pre-start attributes of a stream.
///
/// All of these are frozen once the stream leaves its initialized state;
/// the engine takes a copy at start time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamSettings {
    /// Number of audio buffers in the playback ring. More buffers means
    /// more data held in memory but more tolerance for network hiccups.
    pub buffer_count: u32,
    /// Fallback byte size per buffer, used when the parser cannot infer a
    /// packet-derived size.
    pub buffer_size: u32,
    /// Buffers to fill before playback starts. Values above `buffer_count`
    /// fall back to `buffer_count`.
    pub buffer_fill_count_to_start: u32,
    /// When true the reader is never descheduled and the whole stream is
    /// downloaded as fast as the remote allows.
    pub buffer_infinite: bool,
    /// Seconds without network activity before the stream times out.
    pub timeout_interval: u64,
    /// Playback rate, clamped to [0.5, 2.0].
    pub playback_rate: f32,
    /// Initial volume, clamped to [0.0, 1.0].
    pub volume: f32,
    /// Explicit file type; `None` means infer from MIME/extension.
    pub file_type: Option<FileType>,
}

impl Default for StreamSettings {
    fn default() -> Self {
        Self {
            buffer_count: 256,
            buffer_size: 4096,
            buffer_fill_count_to_start: 32,
            buffer_infinite: false,
            timeout_interval: 10,
            playback_rate: 1.0,
            volume: 1.0,
            file_type: None,
        }
    }
}

impl StreamSettings {
    /// Get the settings file path
    pub fn settings_path() -> Result<PathBuf, Box<dyn std::error::Error>> {
        let home = dirs::home_dir().ok_or("Could not find home directory")?;
        let config_dir = home.join(".config").join("audiopipe");

        // Create config directory if it doesn't exist
        fs::create_dir_all(&config_dir)?;

        Ok(config_dir.join("settings.toml"))
    }

    /// Load settings from file, or create defaults if it doesn't exist
    pub fn load() -> Result<Self, Box<dyn std::error::Error>> {
        let settings_path = Self::settings_path()?;

        if settings_path.exists() {
            let contents = fs::read_to_string(settings_path)?;
            let settings: StreamSettings = toml::from_str(&contents)?;
            Ok(settings)
        } else {
            let defaults = Self::default();
            defaults.save()?;
            Ok(defaults)
        }
    }

    /// Save settings to file
    pub fn save(&self) -> Result<(), Box<dyn std::error::Error>> {
        let settings_path = Self::settings_path()?;
        let toml_string = toml::to_string_pretty(self)?;
        fs::write(settings_path, toml_string)?;
        Ok(())
    }

    /// Update the buffer count (minimum 3 so the queue always has data)
    pub fn set_buffer_count(&mut self, count: u32) {
        self.buffer_count = count.max(3);
    }

    /// Update the fallback buffer size
    pub fn set_buffer_size(&mut self, size: u32) {
        self.buffer_size = size.max(1);
    }

    /// Update the playback rate, clamped to [0.5, 2.0]
    pub fn set_playback_rate(&mut self, rate: f32) {
        self.playback_rate = rate.clamp(0.5, 2.0);
    }

    /// Update the volume, clamped to [0.0, 1.0]
    pub fn set_volume(&mut self, volume: f32) {
        self.volume = volume.clamp(0.0, 1.0);
    }

    /// Number of filled buffers required before playback may start.
    pub fn effective_fill_count(&self) -> u32 {
        self.buffer_fill_count_to_start.min(self.buffer_count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let settings = StreamSettings::default();

        assert_eq!(settings.buffer_count, 256);
        assert_eq!(settings.buffer_size, 4096);
        assert_eq!(settings.buffer_fill_count_to_start, 32);
        assert!(!settings.buffer_infinite);
        assert_eq!(settings.timeout_interval, 10);
        assert_eq!(settings.playback_rate, 1.0);
        assert_eq!(settings.volume, 1.0);
        assert_eq!(settings.file_type, None);
    }

    #[test]
    fn test_clamping() {
        let mut settings = StreamSettings::default();

        settings.set_playback_rate(5.0);
        assert_eq!(settings.playback_rate, 2.0);
        settings.set_playback_rate(0.1);
        assert_eq!(settings.playback_rate, 0.5);

        settings.set_volume(1.7);
        assert_eq!(settings.volume, 1.0);
        settings.set_volume(-0.3);
        assert_eq!(settings.volume, 0.0);

        settings.set_buffer_count(1);
        assert_eq!(settings.buffer_count, 3);
    }

    #[test]
    fn test_fill_count_falls_back_to_buffer_count() {
        let mut settings = StreamSettings::default();
        settings.buffer_count = 4;
        settings.buffer_fill_count_to_start = 32;
        assert_eq!(settings.effective_fill_count(), 4);
    }

    #[test]
    fn test_toml_round_trip() {
        let mut settings = StreamSettings::default();
        settings.buffer_count = 16;
        settings.file_type = Some(FileType::Aac);

        let toml_string = toml::to_string_pretty(&settings).unwrap();
        let parsed: StreamSettings = toml::from_str(&toml_string).unwrap();

        assert_eq!(parsed.buffer_count, 16);
        assert_eq!(parsed.file_type, Some(FileType::Aac));
        assert_eq!(parsed.timeout_interval, settings.timeout_interval);
    }
}
