//! Sound system configuration.
//!
//! One plain struct holds every tunable: pool sizes, streaming chunk sizes,
//! attenuation defaults, worker timings and the backend preference list.
//! Configuration can be loaded from and saved to a TOML file.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{SoundError, SoundResult};

/// Default number of non-streaming channels.
pub const DEFAULT_NORMAL_CHANNELS: usize = 28;

/// Default number of streaming channels.
pub const DEFAULT_STREAMING_CHANNELS: usize = 4;

/// Default size of one streamed chunk, in bytes.
pub const DEFAULT_STREAMING_BUFFER_SIZE: usize = 131_072;

/// Default number of chunks queued ahead on a streaming channel.
pub const DEFAULT_STREAMING_BUFFER_COUNT: usize = 3;

/// Default cap on a fully pre-loaded sound, in bytes.
pub const DEFAULT_MAX_FILE_SIZE: usize = 268_435_456;

/// Configuration file name.
pub const CONFIG_FILE: &str = "aural.toml";

/// Sound system configuration parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SoundConfig {
    // === Channel pools ===
    /// Number of non-streaming channels.
    pub normal_channels: usize,
    /// Number of streaming channels.
    pub streaming_channels: usize,

    // === Streaming ===
    /// Bytes of PCM per streamed chunk.
    pub streaming_buffer_size: usize,
    /// Chunks kept queued ahead on each streaming channel.
    pub streaming_buffer_count: usize,
    /// Largest sound that may be decoded fully into memory.
    pub max_file_size: usize,

    // === Mixing ===
    /// Distance at which linear attenuation reaches silence.
    pub default_fade_distance: f32,
    /// Rolloff factor for rolloff attenuation.
    pub default_rolloff: f32,
    /// Master volume (0.0 - 1.0).
    pub master_gain: f32,
    /// Doppler effect strength.
    pub doppler_factor: f32,
    /// Speed-of-sound multiplier for Doppler calculations.
    pub doppler_velocity: f32,

    // === Files ===
    /// Base directory for relative sound references.
    pub sound_dir: PathBuf,

    // === Workers ===
    /// Interval between reaps of finished temporary sources (ms).
    pub reap_interval_ms: u64,
    /// How long an idle worker parks before re-checking (ms).
    pub idle_timeout_ms: u64,
    /// Sleep between stream thread passes while streams are active (ms).
    pub stream_poll_ms: u64,
    /// Bound on waiting for each worker to exit at shutdown (ms).
    pub shutdown_timeout_ms: u64,
    /// Capacity of the event channel.
    pub event_capacity: usize,

    // === Backends ===
    /// Backend names in order of preference.
    pub backends: Vec<String>,
}

impl Default for SoundConfig {
    fn default() -> Self {
        Self {
            normal_channels: DEFAULT_NORMAL_CHANNELS,
            streaming_channels: DEFAULT_STREAMING_CHANNELS,

            streaming_buffer_size: DEFAULT_STREAMING_BUFFER_SIZE,
            streaming_buffer_count: DEFAULT_STREAMING_BUFFER_COUNT,
            max_file_size: DEFAULT_MAX_FILE_SIZE,

            default_fade_distance: 1000.0,
            default_rolloff: 0.03,
            master_gain: 1.0,
            doppler_factor: 1.0,
            doppler_velocity: 1.0,

            sound_dir: PathBuf::new(),

            reap_interval_ms: 10_000,
            idle_timeout_ms: 3_600_000,
            stream_poll_ms: 20,
            shutdown_timeout_ms: 5_000,
            event_capacity: 1024,

            backends: default_backends(),
        }
    }
}

/// Backend preference list for this build.
fn default_backends() -> Vec<String> {
    let mut names = Vec::new();
    if cfg!(feature = "rodio") {
        names.push("rodio".to_string());
    }
    names.push("silent".to_string());
    names
}

impl SoundConfig {
    /// Set channel pool sizes.
    #[must_use]
    pub const fn with_channels(mut self, normal: usize, streaming: usize) -> Self {
        self.normal_channels = normal;
        self.streaming_channels = streaming;
        self
    }

    /// Set streamed chunk size and count.
    #[must_use]
    pub const fn with_streaming_buffers(mut self, size: usize, count: usize) -> Self {
        self.streaming_buffer_size = size;
        self.streaming_buffer_count = count;
        self
    }

    /// Set master volume.
    #[must_use]
    pub const fn with_master_gain(mut self, gain: f32) -> Self {
        self.master_gain = gain;
        self
    }

    /// Set the temporary-source reap interval.
    #[must_use]
    pub const fn with_reap_interval_ms(mut self, ms: u64) -> Self {
        self.reap_interval_ms = ms;
        self
    }

    /// Set the stream thread poll interval.
    #[must_use]
    pub const fn with_stream_poll_ms(mut self, ms: u64) -> Self {
        self.stream_poll_ms = ms;
        self
    }

    /// Set the base directory for relative sound references.
    #[must_use]
    pub fn with_sound_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.sound_dir = dir.into();
        self
    }

    /// Set the backend preference list.
    #[must_use]
    pub fn with_backends<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.backends = names.into_iter().map(Into::into).collect();
        self
    }

    /// Temporary-source reap interval.
    #[must_use]
    pub const fn reap_interval(&self) -> Duration {
        Duration::from_millis(self.reap_interval_ms)
    }

    /// Idle park duration for the worker threads.
    #[must_use]
    pub const fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    /// Sleep between stream passes.
    #[must_use]
    pub const fn stream_poll(&self) -> Duration {
        Duration::from_millis(self.stream_poll_ms)
    }

    /// Bound on joining each worker at shutdown.
    #[must_use]
    pub const fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }

    /// Parse configuration from TOML text.
    pub fn from_toml_str(text: &str) -> SoundResult<Self> {
        let mut config: Self =
            toml::from_str(text).map_err(|e| SoundError::Config(e.to_string()))?;
        config.validate();
        Ok(config)
    }

    /// Load configuration from a specific path.
    /// Returns the default config if the file doesn't exist or is invalid.
    pub fn load_from<P: AsRef<Path>>(path: P) -> Self {
        let path = path.as_ref();

        if !path.exists() {
            info!("Config file not found, using defaults");
            return Self::default();
        }

        match fs::read_to_string(path) {
            Ok(contents) => match Self::from_toml_str(&contents) {
                Ok(config) => {
                    info!("Loaded config from {}", path.display());
                    config
                },
                Err(e) => {
                    warn!("Failed to parse config file: {e}");
                    Self::default()
                },
            },
            Err(e) => {
                warn!("Failed to read config file: {e}");
                Self::default()
            },
        }
    }

    /// Save configuration to a specific path.
    pub fn save_to<P: AsRef<Path>>(&self, path: P) -> SoundResult<()> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let contents =
            toml::to_string_pretty(self).map_err(|e| SoundError::Config(e.to_string()))?;
        fs::write(path, contents)?;

        info!("Saved config to {}", path.display());
        Ok(())
    }

    /// Validate and clamp configuration values to sensible ranges.
    pub fn validate(&mut self) {
        self.normal_channels = self.normal_channels.min(256);
        self.streaming_channels = self.streaming_channels.min(64);
        self.streaming_buffer_size = self.streaming_buffer_size.clamp(256, 8 * 1024 * 1024);
        self.streaming_buffer_count = self.streaming_buffer_count.clamp(2, 16);

        self.default_fade_distance = self.default_fade_distance.max(0.0);
        self.default_rolloff = self.default_rolloff.max(0.0);
        self.master_gain = self.master_gain.clamp(0.0, 1.0);
        self.doppler_factor = self.doppler_factor.max(0.0);
        self.doppler_velocity = self.doppler_velocity.max(0.01);

        self.stream_poll_ms = self.stream_poll_ms.clamp(1, 1000);
        self.event_capacity = self.event_capacity.max(1);

        if self.backends.is_empty() {
            self.backends = default_backends();
        }
    }
}
