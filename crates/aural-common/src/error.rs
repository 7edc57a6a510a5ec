//! Error types for the Aural sound engine.
//!
//! Errors raised while a queued command executes are logged and retained by
//! the engine; they never unwind into the thread that enqueued the command.
//! Synchronous calls (construction, backend switching) return them directly.

use thiserror::Error;

/// Top-level error type for sound operations.
#[derive(Debug, Error)]
pub enum SoundError {
    /// A backend could not be brought up on this machine.
    #[error("Backend '{name}' unavailable: {reason}")]
    BackendUnavailable {
        /// Registered backend name.
        name: String,
        /// Why the backend failed to start.
        reason: String,
    },

    /// No backend is registered under the requested name.
    #[error("No backend registered as '{0}'")]
    UnknownBackend(String),

    /// No codec is registered for a sound's extension.
    #[error("No codec registered for '{0}'")]
    NoCodec(String),

    /// A sound could not be decoded.
    #[error("Failed to decode '{sound}': {message}")]
    Decode {
        /// Identifier of the sound being decoded.
        sound: String,
        /// Decoder message.
        message: String,
    },

    /// A sound is too large to be loaded fully into memory.
    #[error("Sound '{sound}' is {size} bytes, larger than the {max} byte limit")]
    FileTooLarge {
        /// Identifier of the sound.
        sound: String,
        /// Decoded size in bytes.
        size: usize,
        /// Configured maximum.
        max: usize,
    },

    /// No source is registered under the given name.
    #[error("Source '{0}' not found")]
    UnknownSource(String),

    /// The operation only applies to streaming sources.
    #[error("Source '{0}' is not a streaming source")]
    NotStreaming(String),

    /// Raw data was fed to a source that streams from a file.
    #[error("Source '{0}' is not a raw data stream")]
    NotRawStream(String),

    /// The source is culled and cannot accept data.
    #[error("Source '{0}' is culled")]
    Culled(String),

    /// Every channel of the required kind is held by a playing priority source.
    #[error("No channel available for source '{0}'")]
    NoChannel(String),

    /// A worker thread failed to exit within its shutdown bound.
    #[error("Thread '{thread}' did not exit in time")]
    ShutdownTimeout {
        /// Worker thread name.
        thread: String,
    },

    /// The other end of an internal channel went away.
    #[error("Sound engine disconnected")]
    Disconnected,

    /// Configuration could not be read or written.
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl SoundError {
    /// Build a decode error for the given sound.
    pub fn decode(sound: impl Into<String>, message: impl ToString) -> Self {
        Self::Decode {
            sound: sound.into(),
            message: message.to_string(),
        }
    }

    /// Whether this error means a backend was rejected at construction time.
    #[must_use]
    pub const fn is_backend_error(&self) -> bool {
        matches!(self, Self::BackendUnavailable { .. } | Self::UnknownBackend(_))
    }
}

/// Result type alias for sound operations.
pub type SoundResult<T> = Result<T, SoundError>;
