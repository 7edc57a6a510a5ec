//! Backends
//!
//! A backend is the platform audio output. The engine only ever talks to it
//! through two small traits:
//!
//! - `Backend`: creates channels and receives listener updates
//! - `ChannelOutput`: one pooled playback slot, fed whole buffers
//!   (non-streaming) or a queue of chunks (streaming)
//!
//! Backends are constructed through an ordered, name-keyed registry. The
//! silent backend is always available and is the last resort when every
//! preferred backend fails to start.
//!
//! ```text
//! BackendRegistry ──create──▶ Box<dyn Backend> ──create_channel──▶ Box<dyn ChannelOutput>
//!   "rodio"                     RodioBackend                         RodioChannel (Sink)
//!   "silent"                    SilentBackend                        SilentChannel (clock)
//! ```

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::backend_silent::SilentBackend;
use crate::config::SoundConfig;
use crate::error::{SoundError, SoundResult};
use crate::listener::ListenerData;
use crate::resource::SoundBuffer;

/// Name the silent backend is registered under.
pub const SILENT_BACKEND: &str = "silent";

/// Which pool a channel belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChannelKind {
    /// Plays one fully decoded buffer, optionally looping.
    Normal,
    /// Plays a queue of chunks fed by the stream thread.
    Streaming,
}

impl ChannelKind {
    /// Pool kind for a source.
    #[must_use]
    pub const fn for_streaming(streaming: bool) -> Self {
        if streaming {
            Self::Streaming
        } else {
            Self::Normal
        }
    }
}

/// One backend playback slot.
pub trait ChannelOutput: Send {
    /// Pool this channel was created for.
    fn kind(&self) -> ChannelKind;

    /// Replace whatever the channel holds with one complete buffer.
    fn attach(&mut self, buffer: &SoundBuffer) -> SoundResult<()>;

    /// Append a chunk to the playback queue.
    fn queue(&mut self, buffer: &SoundBuffer) -> SoundResult<()>;

    /// Number of queued chunks fully consumed since the previous call.
    fn processed(&mut self) -> usize;

    /// Chunks queued and not yet consumed.
    fn queued(&self) -> usize;

    /// Loop an attached buffer.
    fn set_looping(&mut self, looping: bool);

    /// Output gain (0.0-1.0), already including master volume and distance.
    fn set_gain(&mut self, gain: f32);

    /// Stereo pan (-1.0 left to 1.0 right).
    fn set_pan(&mut self, pan: f32);

    /// Playback rate multiplier.
    fn set_pitch(&mut self, pitch: f32);

    /// Start or resume playback.
    fn play(&mut self);

    /// Pause, keeping the position.
    fn pause(&mut self);

    /// Stop playback. Streaming channels drop their queue.
    fn stop(&mut self);

    /// Return to the start of the attached buffer.
    fn rewind(&mut self);

    /// Discard queued chunks without playing them.
    fn flush(&mut self);

    /// Whether audio is currently being produced.
    fn is_playing(&self) -> bool;

    /// Milliseconds played since the last play from the start.
    fn millis_played(&self) -> f32;

    /// Release backend resources held by the channel.
    fn close(&mut self);
}

/// Platform audio output.
pub trait Backend: Send {
    /// Registered name.
    fn name(&self) -> &str;

    /// Create a channel for one of the pools.
    fn create_channel(&mut self, kind: ChannelKind) -> SoundResult<Box<dyn ChannelOutput>>;

    /// Listener moved or turned. Backends that mix in 3D natively use this;
    /// the engine already folds position into each channel's gain and pan.
    fn set_listener(&mut self, _listener: &ListenerData) {}

    /// Whether codecs should produce big-endian 16-bit data.
    fn reverse_byte_order(&self) -> bool {
        false
    }

    /// Release the output device.
    fn cleanup(&mut self);
}

/// Constructs a backend.
pub type BackendFactory = Arc<dyn Fn(&SoundConfig) -> SoundResult<Box<dyn Backend>> + Send + Sync>;

/// Ordered list of named backend factories.
#[derive(Clone)]
pub struct BackendRegistry {
    entries: Vec<(String, BackendFactory)>,
}

impl fmt::Debug for BackendRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackendRegistry")
            .field("names", &self.names())
            .finish()
    }
}

impl Default for BackendRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

impl BackendRegistry {
    /// Registry with no entries.
    #[must_use]
    pub fn empty() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    /// Registry with the built-in backends.
    #[must_use]
    pub fn with_defaults() -> Self {
        let mut registry = Self::empty();
        #[cfg(feature = "rodio")]
        registry.register("rodio", |_config| {
            crate::backend_rodio::RodioBackend::open().map(|b| Box::new(b) as Box<dyn Backend>)
        });
        registry.register(SILENT_BACKEND, |_config| Ok(Box::new(SilentBackend::new())));
        registry
    }

    /// Register (or replace) a backend factory.
    pub fn register<F>(&mut self, name: &str, factory: F)
    where
        F: Fn(&SoundConfig) -> SoundResult<Box<dyn Backend>> + Send + Sync + 'static,
    {
        let factory: BackendFactory = Arc::new(factory);
        if let Some(entry) = self.entries.iter_mut().find(|(n, _)| n == name) {
            entry.1 = factory;
        } else {
            self.entries.push((name.to_string(), factory));
        }
    }

    /// Registered names in registration order.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        self.entries.iter().map(|(n, _)| n.clone()).collect()
    }

    /// Whether a name is registered.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.entries.iter().any(|(n, _)| n == name)
    }

    /// Construct one backend by name.
    pub fn create(&self, name: &str, config: &SoundConfig) -> SoundResult<Box<dyn Backend>> {
        let (_, factory) = self
            .entries
            .iter()
            .find(|(n, _)| n == name)
            .ok_or_else(|| SoundError::UnknownBackend(name.to_string()))?;
        factory(config)
    }

    /// Try each backend in the config's preference order, ending with the
    /// silent backend.
    ///
    /// Returns the first backend that `accept` takes, plus the last error
    /// seen on the way. `accept` lets the caller finish construction (e.g.
    /// build channel pools) and reject the backend if that fails. Only a
    /// rejection of the silent fallback itself is returned as an error.
    pub fn select<T, F>(
        &self,
        config: &SoundConfig,
        mut accept: F,
    ) -> SoundResult<(T, Option<SoundError>)>
    where
        F: FnMut(Box<dyn Backend>) -> SoundResult<T>,
    {
        let mut last_error = None;

        for name in &config.backends {
            match self.create(name, config).and_then(&mut accept) {
                Ok(value) => {
                    info!("Selected sound backend '{}'", name);
                    return Ok((value, last_error));
                },
                Err(e) => {
                    warn!("Sound backend '{}' unavailable: {e}", name);
                    last_error = Some(e);
                },
            }
        }

        warn!("Falling back to silent sound backend");
        let value = accept(Box::new(SilentBackend::new()))?;
        Ok((value, last_error))
    }
}
