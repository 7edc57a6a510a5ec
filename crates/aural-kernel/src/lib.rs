//! # Aural Kernel
//!
//! Thread-safe sound engine.
//!
//! This crate provides:
//! - Named sources with 3D position, attenuation, looping, priority and fades
//! - Fixed pools of backend channels with round-robin allocation and
//!   priority-aware stealing
//! - A command thread that applies every mutation in order
//! - A stream thread that decodes streaming sources a few chunks ahead
//! - Pluggable backends (silent, rodio) and codecs (WAV, rodio formats)
//!
//! ## Architecture
//!
//! Application code talks only to [`SoundSystem`]. Mutating calls are queued
//! as [`Command`]s and return at once; queries read the engine state under
//! the same lock the worker threads use.
//!
//! ## Threads
//!
//! - **aural-command**: drains the command queue. `play` and raw feeds run at
//!   the end of each batch, after culling and activation have been applied.
//!   Finished temporary sources are reaped periodically.
//! - **aural-stream**: tops up the queue of every watched streaming channel,
//!   handles end of stream, looping, sequences and fades.
//!
//! Both threads park on a condition variable when idle and are woken
//! explicitly; shutdown waits a bounded time for each.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(clippy::unwrap_used)]

pub mod backend;
#[cfg(feature = "rodio")]
pub mod backend_rodio;
pub mod backend_silent;
pub mod channel;
pub mod codec;
pub mod command;
pub mod config;
pub mod error;
pub mod events;
pub mod library;
pub mod listener;
pub mod manager;
pub mod resource;
pub mod source;
pub mod spatial;
pub mod stream;
pub mod system;
pub mod worker;

#[cfg(test)]
mod test_support;

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::backend::{Backend, BackendRegistry, ChannelKind, ChannelOutput, SILENT_BACKEND};
    #[cfg(feature = "rodio")]
    pub use crate::backend_rodio::RodioBackend;
    pub use crate::backend_silent::SilentBackend;
    pub use crate::codec::{Codec, CodecOptions, CodecRegistry, WavCodec};
    pub use crate::command::Command;
    pub use crate::config::SoundConfig;
    pub use crate::error::{SoundError, SoundResult};
    pub use crate::events::{EventBus, SoundEvent};
    pub use crate::listener::ListenerData;
    pub use crate::manager::{DistanceCuller, NoopManager, SourceManager};
    pub use crate::resource::{AudioFormat, SoundBuffer, SoundRef};
    pub use crate::source::{PlaybackState, SourceSnapshot, SourceSpec};
    pub use crate::spatial::AttenuationModel;
    pub use crate::system::{SoundSystem, SoundSystemBuilder};
}

pub use prelude::*;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_backends_end_with_silent() {
        let registry = BackendRegistry::with_defaults();
        assert!(registry.contains(SILENT_BACKEND));
        assert_eq!(
            SoundConfig::default().backends.last().map(String::as_str),
            Some(SILENT_BACKEND)
        );
    }

    #[test]
    fn test_default_codecs_include_wav() {
        assert!(CodecRegistry::with_defaults().supports("WAV"));
    }
}
