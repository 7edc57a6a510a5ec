//! Sources.
//!
//! A source is one named, independently controllable sound: what it plays,
//! where it is, how loud, and where it is in its lifecycle. Sources own their
//! decoders; channels and the stream watch list only refer to them by name
//! and serial.
//!
//! ```text
//!            play                 channel drains / stop
//!   Idle ──────────▶ Playing ─────────────────────────▶ Stopped
//!                     │   ▲                               │
//!               pause │   │ play                     play │
//!                     ▼   │                               │
//!                    Paused ◀─────────────────────────────┘
//! ```
//!
//! Culling is orthogonal to the state: a culled source keeps whatever it is
//! doing but will not be (re)started until it is activated again.

use std::collections::VecDeque;
use std::fmt;
use std::time::{Duration, Instant};

use aural_common::ids::SourceSerial;
use glam::Vec3;
use serde::{Deserialize, Serialize};

use crate::channel::ChannelId;
use crate::codec::Codec;
use crate::config::SoundConfig;
use crate::error::{SoundError, SoundResult};
use crate::resource::{AudioFormat, SoundBuffer, SoundRef};
use crate::spatial::{AttenuationModel, SpatialInput};

/// Lowest accepted pitch.
pub const MIN_PITCH: f32 = 0.5;

/// Highest accepted pitch.
pub const MAX_PITCH: f32 = 2.0;

/// Transport state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum PlaybackState {
    /// Never played.
    #[default]
    Idle,
    /// Playing, or waiting for its first buffers.
    Playing,
    /// Paused.
    Paused,
    /// Stopped explicitly or finished.
    Stopped,
}

/// Parameters for creating a source.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceSpec {
    /// Sound to play; `None` for raw data streams.
    pub sound: Option<SoundRef>,
    /// Exempt from channel stealing.
    pub priority: bool,
    /// Decode incrementally instead of loading fully.
    pub streaming: bool,
    /// Restart when finished.
    pub looping: bool,
    /// Remove automatically once finished.
    pub temporary: bool,
    /// World position.
    pub position: Vec3,
    /// Distance attenuation model.
    pub attenuation: AttenuationModel,
    /// Fade distance or rolloff factor; defaults from the config by model.
    pub dist_or_roll: Option<f32>,
}

impl SourceSpec {
    /// A non-streaming, non-looping source for `sound` at the origin.
    pub fn new(sound: impl Into<SoundRef>) -> Self {
        Self {
            sound: Some(sound.into()),
            ..Self::raw()
        }
    }

    /// A source with no sound, for raw data streams.
    #[must_use]
    pub fn raw() -> Self {
        Self {
            sound: None,
            priority: false,
            streaming: false,
            looping: false,
            temporary: false,
            position: Vec3::ZERO,
            attenuation: AttenuationModel::default(),
            dist_or_roll: None,
        }
    }

    /// Set priority.
    #[must_use]
    pub const fn with_priority(mut self, priority: bool) -> Self {
        self.priority = priority;
        self
    }

    /// Set streaming.
    #[must_use]
    pub const fn with_streaming(mut self, streaming: bool) -> Self {
        self.streaming = streaming;
        self
    }

    /// Set looping.
    #[must_use]
    pub const fn with_looping(mut self, looping: bool) -> Self {
        self.looping = looping;
        self
    }

    /// Set temporary.
    #[must_use]
    pub const fn with_temporary(mut self, temporary: bool) -> Self {
        self.temporary = temporary;
        self
    }

    /// Set position.
    #[must_use]
    pub const fn with_position(mut self, position: Vec3) -> Self {
        self.position = position;
        self
    }

    /// Set the attenuation model, using the configured default parameter.
    #[must_use]
    pub const fn with_attenuation(mut self, attenuation: AttenuationModel) -> Self {
        self.attenuation = attenuation;
        self
    }

    /// Set the fade distance or rolloff factor explicitly.
    #[must_use]
    pub const fn with_dist_or_roll(mut self, dist_or_roll: f32) -> Self {
        self.dist_or_roll = Some(dist_or_roll);
        self
    }
}

/// Default attenuation parameter for a model.
#[must_use]
pub fn default_dist_or_roll(config: &SoundConfig, model: AttenuationModel) -> f32 {
    match model {
        AttenuationModel::Linear => config.default_fade_distance,
        AttenuationModel::Rolloff => config.default_rolloff,
        AttenuationModel::None => 0.0,
    }
}

/// Externally visible parameters of a source.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceSnapshot {
    /// Name
    pub name: String,
    /// Current sound
    pub sound: Option<SoundRef>,
    /// Format of a raw data stream
    pub raw_format: Option<AudioFormat>,
    /// Priority flag
    pub priority: bool,
    /// Streaming flag
    pub streaming: bool,
    /// Looping flag
    pub looping: bool,
    /// Temporary flag
    pub temporary: bool,
    /// Position
    pub position: Vec3,
    /// Velocity
    pub velocity: Vec3,
    /// Attenuation model
    pub attenuation: AttenuationModel,
    /// Fade distance or rolloff factor
    pub dist_or_roll: f32,
    /// Volume
    pub volume: f32,
    /// Pitch
    pub pitch: f32,
    /// Not culled
    pub active: bool,
    /// Sounds queued to play next
    pub sequence: Vec<SoundRef>,
    /// Transport state
    pub state: PlaybackState,
}

/// What a fade check found.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FadeProgress {
    /// No fade-out in progress (a fade-in may be).
    Steady,
    /// Fading out.
    FadingOut,
    /// A fade-out just reached silence.
    Completed,
}

/// Fade state. Gains are derived from start times, so the curve does not
/// depend on how often it is polled.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub enum Fade {
    /// Full volume.
    #[default]
    Idle,
    /// Fading from `from` to silence over `out`, then in over `fade_in`.
    Out {
        /// Fade start
        started: Instant,
        /// Gain at the start
        from: f32,
        /// Fade-out length
        out: Duration,
        /// Fade-in length once the next sound starts (zero for none)
        fade_in: Duration,
    },
    /// Fading in from silence.
    In {
        /// Fade start
        started: Instant,
        /// Fade-in length
        duration: Duration,
    },
}

fn fraction(started: Instant, length: Duration, now: Instant) -> f32 {
    if length.is_zero() {
        return 1.0;
    }
    (now.saturating_duration_since(started).as_secs_f32() / length.as_secs_f32()).clamp(0.0, 1.0)
}

impl Fade {
    /// Gain multiplier at `now`.
    #[must_use]
    pub fn gain(&self, now: Instant) -> f32 {
        match *self {
            Self::Idle => 1.0,
            Self::Out {
                started, from, out, ..
            } => from * (1.0 - fraction(started, out, now)),
            Self::In { started, duration } => fraction(started, duration, now),
        }
    }

    /// Whether a fade-out is in progress.
    #[must_use]
    pub const fn is_fading_out(&self) -> bool {
        matches!(self, Self::Out { .. })
    }
}

/// One playable sound instance.
pub struct Source {
    pub(crate) name: String,
    pub(crate) serial: SourceSerial,

    pub(crate) sound: Option<SoundRef>,
    pub(crate) raw_format: Option<AudioFormat>,
    pub(crate) sequence: VecDeque<SoundRef>,

    pub(crate) priority: bool,
    pub(crate) streaming: bool,
    pub(crate) looping: bool,
    pub(crate) temporary: bool,

    pub(crate) position: Vec3,
    pub(crate) velocity: Vec3,
    pub(crate) attenuation: AttenuationModel,
    pub(crate) dist_or_roll: f32,
    pub(crate) volume: f32,
    pub(crate) pitch: f32,

    pub(crate) active: bool,
    pub(crate) to_play: bool,
    /// Restart the stream from the current sound on the next pump.
    pub(crate) pre_load: bool,
    /// End-of-stream already reported for the current pass through the sound.
    pub(crate) eos_signalled: bool,
    pub(crate) state: PlaybackState,
    pub(crate) channel: Option<ChannelId>,
    pub(crate) fade: Fade,

    pub(crate) codec: Option<Box<dyn Codec>>,
    /// Decoder already opened on `sequence.front()`.
    pub(crate) next_codec: Option<Box<dyn Codec>>,
    /// Chunks read ahead from `next_codec`.
    pub(crate) next_buffers: Vec<SoundBuffer>,
    /// Chunks already read from `codec` when it was adopted from the
    /// read-ahead, to be queued before decoding more.
    pub(crate) staged: Option<Vec<SoundBuffer>>,
}

impl fmt::Debug for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Source")
            .field("name", &self.name)
            .field("serial", &self.serial)
            .field("sound", &self.sound)
            .field("state", &self.state)
            .field("channel", &self.channel)
            .field("active", &self.active)
            .finish_non_exhaustive()
    }
}

impl Source {
    /// Build a source from a spec.
    pub fn new(name: impl Into<String>, spec: SourceSpec, config: &SoundConfig) -> Self {
        let dist_or_roll = spec
            .dist_or_roll
            .unwrap_or_else(|| default_dist_or_roll(config, spec.attenuation));
        Self {
            name: name.into(),
            serial: SourceSerial::new(),
            sound: spec.sound,
            raw_format: None,
            sequence: VecDeque::new(),
            priority: spec.priority,
            streaming: spec.streaming,
            looping: spec.looping,
            temporary: spec.temporary,
            position: spec.position,
            velocity: Vec3::ZERO,
            attenuation: spec.attenuation,
            dist_or_roll,
            volume: 1.0,
            pitch: 1.0,
            active: true,
            to_play: false,
            pre_load: false,
            eos_signalled: false,
            state: PlaybackState::Idle,
            channel: None,
            fade: Fade::Idle,
            codec: None,
            next_codec: None,
            next_buffers: Vec::new(),
            staged: None,
        }
    }

    /// Build a raw data stream: always streaming, never looping, no sound.
    pub fn raw(
        name: impl Into<String>,
        format: AudioFormat,
        spec: SourceSpec,
        config: &SoundConfig,
    ) -> Self {
        let mut source = Self::new(
            name,
            SourceSpec {
                sound: None,
                streaming: true,
                looping: false,
                ..spec
            },
            config,
        );
        source.raw_format = Some(format);
        source
    }

    /// Name
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Serial of this instance.
    #[must_use]
    pub const fn serial(&self) -> SourceSerial {
        self.serial
    }

    /// Whether this is a raw data stream.
    #[must_use]
    pub const fn is_raw(&self) -> bool {
        self.raw_format.is_some()
    }

    /// Priority flag.
    #[must_use]
    pub const fn priority(&self) -> bool {
        self.priority
    }

    /// Streaming flag.
    #[must_use]
    pub const fn streaming(&self) -> bool {
        self.streaming
    }

    /// Looping flag.
    #[must_use]
    pub const fn looping(&self) -> bool {
        self.looping
    }

    /// Temporary flag.
    #[must_use]
    pub const fn temporary(&self) -> bool {
        self.temporary
    }

    /// Not culled.
    #[must_use]
    pub const fn active(&self) -> bool {
        self.active
    }

    /// Transport state.
    #[must_use]
    pub const fn state(&self) -> PlaybackState {
        self.state
    }

    /// Channel currently held.
    #[must_use]
    pub const fn channel(&self) -> Option<ChannelId> {
        self.channel
    }

    /// Position
    #[must_use]
    pub const fn position(&self) -> Vec3 {
        self.position
    }

    /// Volume
    #[must_use]
    pub const fn volume(&self) -> f32 {
        self.volume
    }

    /// Pitch
    #[must_use]
    pub const fn pitch(&self) -> f32 {
        self.pitch
    }

    /// Fade state.
    #[must_use]
    pub const fn fade(&self) -> &Fade {
        &self.fade
    }

    /// Sounds queued after the current one.
    #[must_use]
    pub fn sequence_len(&self) -> usize {
        self.sequence.len()
    }

    /// Set volume, clamped to 0.0-1.0.
    pub fn set_volume(&mut self, volume: f32) {
        self.volume = volume.clamp(0.0, 1.0);
    }

    /// Set pitch, clamped to the accepted range.
    pub fn set_pitch(&mut self, pitch: f32) {
        self.pitch = pitch.clamp(MIN_PITCH, MAX_PITCH);
    }

    /// Inputs for the spatial calculation.
    #[must_use]
    pub const fn spatial_input(&self) -> SpatialInput {
        SpatialInput::at(self.position)
            .with_velocity(self.velocity)
            .with_pitch(self.pitch)
            .with_attenuation(self.attenuation, self.dist_or_roll)
    }

    fn require_streaming(&self) -> SoundResult<()> {
        if self.streaming && !self.is_raw() {
            Ok(())
        } else {
            Err(SoundError::NotStreaming(self.name.clone()))
        }
    }

    /// Append a sound to play after the current one.
    pub fn queue_sound(&mut self, sound: SoundRef) -> SoundResult<()> {
        self.require_streaming()?;
        self.sequence.push_back(sound);
        Ok(())
    }

    /// Remove the first queued occurrence of `identifier`.
    pub fn dequeue_sound(&mut self, identifier: &str) -> SoundResult<bool> {
        self.require_streaming()?;
        let Some(index) = self
            .sequence
            .iter()
            .position(|s| s.identifier() == identifier)
        else {
            return Ok(false);
        };
        if index == 0 {
            self.discard_pre_read();
        }
        self.sequence.remove(index);
        Ok(true)
    }

    /// Fade to silence, then play `next` (or stop when there is none).
    ///
    /// Replaces the sequence queue.
    pub fn fade_out(&mut self, next: Option<SoundRef>, out: Duration, now: Instant) -> SoundResult<()> {
        self.start_fade(next, out, Duration::ZERO, now)
    }

    /// Fade to silence, switch to `next`, and fade back in.
    pub fn fade_out_in(
        &mut self,
        next: SoundRef,
        out: Duration,
        fade_in: Duration,
        now: Instant,
    ) -> SoundResult<()> {
        self.start_fade(Some(next), out, fade_in, now)
    }

    fn start_fade(
        &mut self,
        next: Option<SoundRef>,
        out: Duration,
        fade_in: Duration,
        now: Instant,
    ) -> SoundResult<()> {
        self.require_streaming()?;
        self.discard_pre_read();
        self.sequence.clear();
        self.sequence.extend(next);
        // continue from the current level instead of jumping back to full
        let from = self.fade.gain(now);
        self.fade = Fade::Out {
            started: now,
            from,
            out,
            fade_in,
        };
        Ok(())
    }

    /// Advance the fade clock.
    ///
    /// On completion of a fade-out the fade-in (if any) starts; the caller
    /// decides what happens to the sequence.
    pub fn check_fade(&mut self, now: Instant) -> FadeProgress {
        match self.fade {
            Fade::Idle => FadeProgress::Steady,
            Fade::Out {
                started,
                out,
                fade_in,
                ..
            } => {
                if now.saturating_duration_since(started) < out {
                    return FadeProgress::FadingOut;
                }
                self.fade = if fade_in.is_zero() {
                    Fade::Idle
                } else {
                    Fade::In {
                        started: now,
                        duration: fade_in,
                    }
                };
                FadeProgress::Completed
            },
            Fade::In { started, duration } => {
                if now.saturating_duration_since(started) >= duration {
                    self.fade = Fade::Idle;
                }
                FadeProgress::Steady
            },
        }
    }

    /// Move to the next sound in the sequence.
    ///
    /// Returns `false` when the sequence is empty. The current decoder is
    /// released and a decoder read ahead for the new sound is adopted.
    pub fn advance_sequence(&mut self) -> bool {
        let Some(next) = self.sequence.pop_front() else {
            return false;
        };
        self.sound = Some(next);
        self.release_codec();
        if let Some(codec) = self.next_codec.take() {
            self.codec = Some(codec);
            self.staged = Some(std::mem::take(&mut self.next_buffers));
        }
        true
    }

    /// Drop the decoder read ahead for the next sound.
    pub fn discard_pre_read(&mut self) {
        if let Some(mut codec) = self.next_codec.take() {
            codec.cleanup();
        }
        self.next_buffers.clear();
    }

    /// Release the current decoder.
    pub fn release_codec(&mut self) {
        if let Some(mut codec) = self.codec.take() {
            codec.cleanup();
        }
        self.staged = None;
    }

    /// Release every decoder the source holds.
    pub fn release_codecs(&mut self) {
        self.release_codec();
        self.discard_pre_read();
    }

    /// Externally visible parameters.
    #[must_use]
    pub fn snapshot(&self) -> SourceSnapshot {
        SourceSnapshot {
            name: self.name.clone(),
            sound: self.sound.clone(),
            raw_format: self.raw_format,
            priority: self.priority,
            streaming: self.streaming,
            looping: self.looping,
            temporary: self.temporary,
            position: self.position,
            velocity: self.velocity,
            attenuation: self.attenuation,
            dist_or_roll: self.dist_or_roll,
            volume: self.volume,
            pitch: self.pitch,
            active: self.active,
            sequence: self.sequence.iter().cloned().collect(),
            state: self.state,
        }
    }

    /// Rebuild a source from a snapshot with a fresh serial and no channel.
    pub fn from_snapshot(snapshot: &SourceSnapshot) -> Self {
        Self {
            name: snapshot.name.clone(),
            serial: SourceSerial::new(),
            sound: snapshot.sound.clone(),
            raw_format: snapshot.raw_format,
            sequence: snapshot.sequence.iter().cloned().collect(),
            priority: snapshot.priority,
            streaming: snapshot.streaming,
            looping: snapshot.looping,
            temporary: snapshot.temporary,
            position: snapshot.position,
            velocity: snapshot.velocity,
            attenuation: snapshot.attenuation,
            dist_or_roll: snapshot.dist_or_roll,
            volume: snapshot.volume,
            pitch: snapshot.pitch,
            active: snapshot.active,
            to_play: false,
            pre_load: false,
            eos_signalled: false,
            state: PlaybackState::Idle,
            channel: None,
            fade: Fade::Idle,
            codec: None,
            next_codec: None,
            next_buffers: Vec::new(),
            staged: None,
        }
    }
}

impl Drop for Source {
    fn drop(&mut self) {
        self.release_codecs();
    }
}
