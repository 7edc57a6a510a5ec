//! The engine core.
//!
//! [`Library`] owns every source, both channel pools, the decoded sound
//! cache, the listener and the backend. It is not thread-safe by itself: the
//! command and stream threads share it behind one mutex, and every method
//! here runs with that lock held.
//!
//! Errors returned from these methods describe a single rejected operation;
//! the engine state is left consistent and other sources are unaffected.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use aural_common::ids::SourceSerial;
use glam::Vec3;
use tracing::{debug, error, info, warn};

use crate::backend::{Backend, ChannelKind};
use crate::channel::{ChannelId, ChannelPools, Occupancy};
use crate::codec::{CodecOptions, CodecRegistry};
use crate::config::SoundConfig;
use crate::error::{SoundError, SoundResult};
use crate::events::{EventBus, SoundEvent};
use crate::listener::ListenerData;
use crate::resource::{AudioFormat, SoundBuffer, SoundBufferCache, SoundRef};
use crate::source::{PlaybackState, Source, SourceSnapshot, SourceSpec};
use crate::spatial::{AttenuationModel, SpatialProcessor};
use crate::worker::Signal;

/// A source on the stream thread's watch list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct WatchEntry {
    pub(crate) name: String,
    pub(crate) serial: SourceSerial,
    pub(crate) channel: ChannelId,
}

/// Everything needed to rebuild the engine on another backend.
#[derive(Debug, Clone, PartialEq)]
pub struct LibrarySnapshot {
    /// Every live source.
    pub sources: Vec<SourceSnapshot>,
    /// Sources that were playing.
    pub playing: Vec<String>,
    /// Listener
    pub listener: ListenerData,
    /// Master volume
    pub master_gain: f32,
    /// Doppler factor
    pub doppler_factor: f32,
    /// Doppler velocity
    pub doppler_velocity: f32,
}

/// Sources, channels and backend.
pub struct Library {
    pub(crate) config: SoundConfig,
    pub(crate) codecs: CodecRegistry,
    pub(crate) backend: Box<dyn Backend>,
    pub(crate) pools: ChannelPools,
    pub(crate) sources: HashMap<String, Source>,
    pub(crate) buffers: SoundBufferCache,
    pub(crate) spatial: SpatialProcessor,
    pub(crate) master_gain: f32,
    pub(crate) watched: Vec<WatchEntry>,
    pub(crate) events: EventBus,
    pub(crate) stream_signal: Option<Arc<Signal>>,
    /// An activation happened since the last replay.
    pub(crate) pending_replay: bool,
    closed: bool,
}

impl std::fmt::Debug for Library {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Library")
            .field("backend", &self.backend.name())
            .field("sources", &self.sources.len())
            .field("buffers", &self.buffers.count())
            .field("watched", &self.watched.len())
            .finish_non_exhaustive()
    }
}

/// Whether a source is audibly playing (or about to be, for a stream
/// waiting on its first buffers).
pub(crate) fn source_playing(source: &Source, pools: &ChannelPools) -> bool {
    if source.state != PlaybackState::Playing {
        return false;
    }
    if source.pre_load {
        return true;
    }
    let Some(id) = source.channel else {
        return false;
    };
    let Some(channel) = pools.get(id) else {
        return false;
    };
    if channel.attached != Some(source.serial) {
        return false;
    }
    if channel.output.is_playing() {
        return true;
    }
    // a file stream between pump passes is still playing
    source.streaming && !source.is_raw() && source.active && source.codec.is_some()
}

/// Push a source's gain, pan and pitch to its channel.
pub(crate) fn apply_mix(
    source: &Source,
    pools: &mut ChannelPools,
    spatial: &SpatialProcessor,
    master_gain: f32,
    now: Instant,
) {
    let Some(id) = source.channel else {
        return;
    };
    let Some(output) = pools.output_for(id, source.serial) else {
        return;
    };
    let params = spatial.calculate(&source.spatial_input());
    output.set_gain(source.volume * source.fade.gain(now) * params.gain * master_gain);
    output.set_pan(params.pan);
    output.set_pitch(params.pitch);
}

impl Library {
    /// Build the channel pools on `backend`.
    ///
    /// On failure the backend is cleaned up before the error is returned.
    pub fn new(
        mut backend: Box<dyn Backend>,
        config: SoundConfig,
        codecs: CodecRegistry,
        events: EventBus,
    ) -> SoundResult<Self> {
        let pools = match ChannelPools::create(
            backend.as_mut(),
            config.normal_channels,
            config.streaming_channels,
        ) {
            Ok(pools) => pools,
            Err(e) => {
                backend.cleanup();
                return Err(e);
            },
        };

        let mut spatial = SpatialProcessor::new();
        spatial.set_doppler_factor(config.doppler_factor);
        spatial.set_doppler_velocity(config.doppler_velocity);

        info!(
            "Sound library ready on '{}' ({} normal, {} streaming channels)",
            backend.name(),
            config.normal_channels,
            config.streaming_channels
        );

        Ok(Self {
            master_gain: config.master_gain,
            config,
            codecs,
            backend,
            pools,
            sources: HashMap::new(),
            buffers: SoundBufferCache::new(),
            spatial,
            watched: Vec::new(),
            events,
            stream_signal: None,
            pending_replay: false,
            closed: false,
        })
    }

    /// Signal used to wake the stream thread when a source is watched.
    pub fn set_stream_signal(&mut self, signal: Arc<Signal>) {
        self.stream_signal = Some(signal);
    }

    /// Active configuration.
    #[must_use]
    pub const fn config(&self) -> &SoundConfig {
        &self.config
    }

    /// Name of the active backend.
    #[must_use]
    pub fn backend_name(&self) -> &str {
        self.backend.name()
    }

    pub(crate) const fn codec_options(&self) -> CodecOptions {
        CodecOptions {
            chunk_bytes: self.config.streaming_buffer_size,
            max_bytes: self.config.max_file_size,
        }
    }

    fn source(&self, name: &str) -> SoundResult<&Source> {
        self.sources
            .get(name)
            .ok_or_else(|| SoundError::UnknownSource(name.to_string()))
    }

    fn source_mut(&mut self, name: &str) -> SoundResult<&mut Source> {
        self.sources
            .get_mut(name)
            .ok_or_else(|| SoundError::UnknownSource(name.to_string()))
    }

    fn remix(&mut self, name: &str) {
        if let Some(source) = self.sources.get(name) {
            apply_mix(
                source,
                &mut self.pools,
                &self.spatial,
                self.master_gain,
                Instant::now(),
            );
        }
    }

    fn remix_all(&mut self) {
        let now = Instant::now();
        for source in self.sources.values() {
            apply_mix(source, &mut self.pools, &self.spatial, self.master_gain, now);
        }
    }

    // === Sound library ===

    /// Decode a sound fully into the cache. Already loaded sounds are kept.
    pub fn load_sound(&mut self, sound: &SoundRef) -> SoundResult<()> {
        if self.buffers.contains(sound.identifier()) {
            return Ok(());
        }
        let path = sound.resolve(&self.config.sound_dir);
        let result = self
            .codecs
            .open(sound, &path, self.codec_options(), self.backend.reverse_byte_order())
            .and_then(|mut codec| {
                let buffer = codec.read_all();
                codec.cleanup();
                buffer
            });
        match result {
            Ok(buffer) => {
                debug!("Loaded '{}' ({} bytes)", sound, buffer.len());
                self.buffers.insert(sound.identifier(), buffer);
                Ok(())
            },
            Err(e) => {
                error!("Failed to load '{}': {e}", sound);
                Err(e)
            },
        }
    }

    /// Store already decoded PCM under an identifier.
    pub fn load_sound_data(&mut self, identifier: &str, buffer: SoundBuffer) {
        debug!("Loaded raw data '{}' ({} bytes)", identifier, buffer.len());
        self.buffers.insert(identifier, buffer);
    }

    /// Drop a sound from the cache, stopping sources that play it.
    pub fn unload_sound(&mut self, identifier: &str) {
        let users: Vec<String> = self
            .sources
            .values()
            .filter(|s| {
                !s.streaming && s.sound.as_ref().is_some_and(|r| r.identifier() == identifier)
            })
            .map(|s| s.name.clone())
            .collect();
        for name in users {
            let _ = self.stop(&name);
        }
        if self.buffers.remove(identifier).is_some() {
            debug!("Unloaded '{}'", identifier);
        }
    }

    /// Identifiers of cached sounds.
    #[must_use]
    pub fn loaded_sounds(&self) -> Vec<String> {
        self.buffers.identifiers()
    }

    // === Source lifecycle ===

    /// Create a source, replacing any source with the same name.
    pub fn new_source(&mut self, name: &str, spec: SourceSpec) -> SoundResult<()> {
        if !spec.streaming {
            match &spec.sound {
                Some(sound) => self.load_sound(sound)?,
                None => return Err(SoundError::decode(name, "no sound given")),
            }
        }
        self.discard_source(name);
        let source = Source::new(name, spec, &self.config);
        debug!("New source '{}'", name);
        self.sources.insert(name.to_string(), source);
        self.remix(name);
        Ok(())
    }

    /// Create a raw PCM input stream.
    pub fn raw_data_stream(&mut self, name: &str, format: AudioFormat, spec: SourceSpec) -> SoundResult<()> {
        if !format.is_supported() {
            return Err(SoundError::decode(
                name,
                format!("unsupported raw format {format:?}"),
            ));
        }
        self.discard_source(name);
        let source = Source::raw(name, format, spec, &self.config);
        debug!("New raw data stream '{}'", name);
        self.sources.insert(name.to_string(), source);
        Ok(())
    }

    /// Remove a source and release its channel and decoders.
    pub fn remove_source(&mut self, name: &str) -> SoundResult<()> {
        if !self.discard_source(name) {
            return Err(SoundError::UnknownSource(name.to_string()));
        }
        self.events.publish(SoundEvent::SourceRemoved {
            source: name.to_string(),
        });
        Ok(())
    }

    /// Detach and drop a source. Returns whether it existed.
    fn discard_source(&mut self, name: &str) -> bool {
        let Some(mut source) = self.sources.remove(name) else {
            return false;
        };
        self.detach(&mut source);
        self.watched.retain(|w| w.serial != source.serial);
        source.release_codecs();
        debug!("Removed source '{}'", name);
        true
    }

    /// Stop a source's channel and give it back to the pool.
    fn detach(&mut self, source: &mut Source) {
        let Some(id) = source.channel.take() else {
            return;
        };
        if let Some(channel) = self.pools.get_mut(id) {
            if channel.attached == Some(source.serial) {
                channel.output.stop();
                channel.attached = None;
            }
        }
        let pool = self.pools.pool_mut(id.kind);
        if pool.occupant(id.index) == Some(source.name.as_str()) {
            pool.release(id.index);
        }
    }

    /// Mark a source for automatic removal once finished.
    pub fn set_temporary(&mut self, name: &str, temporary: bool) -> SoundResult<()> {
        self.source_mut(name)?.temporary = temporary;
        Ok(())
    }

    // === Source parameters ===

    /// Move a source.
    pub fn set_position(&mut self, name: &str, position: Vec3) -> SoundResult<()> {
        self.source_mut(name)?.position = position;
        self.remix(name);
        Ok(())
    }

    /// Set a source's volume (clamped to 0.0-1.0).
    pub fn set_volume(&mut self, name: &str, volume: f32) -> SoundResult<()> {
        self.source_mut(name)?.set_volume(volume);
        self.remix(name);
        Ok(())
    }

    /// Set a source's pitch (clamped to 0.5-2.0).
    pub fn set_pitch(&mut self, name: &str, pitch: f32) -> SoundResult<()> {
        self.source_mut(name)?.set_pitch(pitch);
        self.remix(name);
        Ok(())
    }

    /// Exempt a source from channel stealing.
    pub fn set_priority(&mut self, name: &str, priority: bool) -> SoundResult<()> {
        self.source_mut(name)?.priority = priority;
        Ok(())
    }

    /// Change looping. Raw data streams never loop.
    pub fn set_looping(&mut self, name: &str, looping: bool) -> SoundResult<()> {
        let source = self.sources.get_mut(name).ok_or_else(|| SoundError::UnknownSource(name.to_string()))?;
        if source.is_raw() {
            return Ok(());
        }
        source.looping = looping;
        if !source.streaming {
            if let Some(id) = source.channel {
                if let Some(output) = self.pools.output_for(id, source.serial) {
                    output.set_looping(looping);
                }
            }
        }
        Ok(())
    }

    /// Change the attenuation model.
    pub fn set_attenuation(&mut self, name: &str, model: AttenuationModel) -> SoundResult<()> {
        self.source_mut(name)?.attenuation = model;
        self.remix(name);
        Ok(())
    }

    /// Change the fade distance or rolloff factor.
    pub fn set_dist_or_roll(&mut self, name: &str, dist_or_roll: f32) -> SoundResult<()> {
        self.source_mut(name)?.dist_or_roll = dist_or_roll.max(0.0);
        self.remix(name);
        Ok(())
    }

    /// Set a source's velocity for Doppler.
    pub fn set_velocity(&mut self, name: &str, velocity: Vec3) -> SoundResult<()> {
        self.source_mut(name)?.velocity = velocity;
        self.remix(name);
        Ok(())
    }

    // === Channel allocation ===

    fn occupancy(&self, kind: ChannelKind) -> Vec<Occupancy> {
        let pool = self.pools.pool(kind);
        (0..pool.len())
            .map(|i| match pool.occupant(i).and_then(|n| self.sources.get(n)) {
                None => Occupancy::Vacant,
                Some(s) if !source_playing(s, &self.pools) => Occupancy::Idle,
                Some(s) if s.priority => Occupancy::Protected,
                Some(_) => Occupancy::Busy,
            })
            .collect()
    }

    /// Find a channel for a source and attach it, evicting the previous
    /// holder if necessary.
    fn acquire_channel(&mut self, name: &str) -> SoundResult<ChannelId> {
        let source = self.source(name)?;
        let serial = source.serial;
        let current = source.channel;
        let kind = ChannelKind::for_streaming(source.streaming);

        let occupancy = self.occupancy(kind);
        let index = self
            .pools
            .pool_mut(kind)
            .allocate(name, &occupancy)
            .ok_or_else(|| SoundError::NoChannel(name.to_string()))?;
        let id = ChannelId { kind, index };

        let channel = self
            .pools
            .get_mut(id)
            .ok_or_else(|| SoundError::NoChannel(name.to_string()))?;
        let previous = channel.attached.filter(|s| *s != serial);
        if previous.is_some() {
            channel.output.stop();
            channel.output.flush();
        }
        channel.attached = Some(serial);

        if let Some(prev) = previous {
            if let Some(victim) = self.sources.values_mut().find(|s| s.serial == prev) {
                debug!("Channel {} taken from '{}' for '{}'", id, victim.name, name);
                victim.channel = None;
                if victim.state == PlaybackState::Playing {
                    victim.state = PlaybackState::Stopped;
                }
                victim.pre_load = false;
                victim.release_codecs();
            }
        }

        if let Some(old) = current.filter(|c| *c != id) {
            if let Some(channel) = self.pools.get_mut(old) {
                if channel.attached == Some(serial) {
                    channel.output.stop();
                    channel.attached = None;
                }
            }
        }

        if let Some(source) = self.sources.get_mut(name) {
            source.channel = Some(id);
        }
        Ok(id)
    }

    // === Transport ===

    /// Start a source.
    ///
    /// Raw data streams start when fed. A culled source is remembered and
    /// started when it is activated again. If every channel is held by a
    /// playing priority source the request fails with `NoChannel`.
    pub fn play(&mut self, name: &str) -> SoundResult<()> {
        let source = self.source(name)?;
        if source.is_raw() {
            return Ok(());
        }
        if !source.active {
            debug!("Source '{}' is culled, play deferred", name);
            if let Some(source) = self.sources.get_mut(name) {
                source.to_play = true;
            }
            return Ok(());
        }
        if source_playing(source, &self.pools) {
            return Ok(());
        }

        // resume in place
        if source.state == PlaybackState::Paused {
            if let Some(id) = source.channel {
                let serial = source.serial;
                let streaming = source.streaming;
                if let Some(output) = self.pools.output_for(id, serial) {
                    output.play();
                    if let Some(source) = self.sources.get_mut(name) {
                        source.state = PlaybackState::Playing;
                    }
                    if streaming {
                        self.watch(name, serial, id);
                    }
                    return Ok(());
                }
            }
        }

        let id = self.acquire_channel(name)?;
        let now = Instant::now();

        let source = self.source(name)?;
        let serial = source.serial;
        if source.streaming {
            if source.sound.is_none() {
                return Err(SoundError::decode(name, "no sound to stream"));
            }
            if let Some(output) = self.pools.output_for(id, serial) {
                output.stop();
                output.flush();
                output.set_looping(false);
            }
            if let Some(source) = self.sources.get_mut(name) {
                source.state = PlaybackState::Playing;
                source.pre_load = true;
                source.to_play = false;
            }
            self.remix(name);
            self.watch(name, serial, id);
            debug!("Streaming '{}' on {}", name, id);
            return Ok(());
        }

        let sound = source
            .sound
            .clone()
            .ok_or_else(|| SoundError::decode(name, "no sound to play"))?;
        let looping = source.looping;
        if !self.buffers.contains(sound.identifier()) {
            self.load_sound(&sound)?;
        }
        let buffer = self
            .buffers
            .get(sound.identifier())
            .cloned()
            .ok_or_else(|| SoundError::decode(sound.identifier(), "not loaded"))?;

        if let Some(output) = self.pools.output_for(id, serial) {
            output.attach(&buffer)?;
            output.set_looping(looping);
        }
        if let Some(source) = self.sources.get_mut(name) {
            source.state = PlaybackState::Playing;
            source.to_play = false;
            apply_mix(source, &mut self.pools, &self.spatial, self.master_gain, now);
        }
        if let Some(output) = self.pools.output_for(id, serial) {
            output.play();
        }
        debug!("Playing '{}' on {}", name, id);
        Ok(())
    }

    /// Pause a source.
    pub fn pause(&mut self, name: &str) -> SoundResult<()> {
        let source = self.sources.get_mut(name).ok_or_else(|| SoundError::UnknownSource(name.to_string()))?;
        if source.state != PlaybackState::Playing {
            return Ok(());
        }
        source.state = PlaybackState::Paused;
        if let Some(id) = source.channel {
            if let Some(output) = self.pools.output_for(id, source.serial) {
                output.pause();
            }
        }
        Ok(())
    }

    /// Stop a source. Streams release their decoders and restart from the
    /// beginning when played again.
    pub fn stop(&mut self, name: &str) -> SoundResult<()> {
        let source = self.sources.get_mut(name).ok_or_else(|| SoundError::UnknownSource(name.to_string()))?;
        source.state = PlaybackState::Stopped;
        source.to_play = false;
        source.pre_load = false;
        source.eos_signalled = false;
        if source.streaming {
            source.release_codec();
            source.fade = crate::source::Fade::Idle;
        }
        if let Some(id) = source.channel {
            if let Some(output) = self.pools.output_for(id, source.serial) {
                output.stop();
            }
        }
        Ok(())
    }

    /// Rewind a source to the start of its current sound.
    pub fn rewind(&mut self, name: &str) -> SoundResult<()> {
        let source = self.sources.get_mut(name).ok_or_else(|| SoundError::UnknownSource(name.to_string()))?;
        if source.is_raw() {
            return Ok(());
        }
        let Some(id) = source.channel else {
            return Ok(());
        };
        let Some(output) = self.pools.output_for(id, source.serial) else {
            return Ok(());
        };
        if source.streaming {
            output.stop();
            output.flush();
            source.release_codec();
            // a paused stream restarts from the top when resumed
            if matches!(source.state, PlaybackState::Playing | PlaybackState::Paused) {
                source.pre_load = true;
            }
        } else {
            output.rewind();
        }
        Ok(())
    }

    /// Discard a stream's queued chunks.
    pub fn flush(&mut self, name: &str) -> SoundResult<()> {
        let source = self.sources.get(name).ok_or_else(|| SoundError::UnknownSource(name.to_string()))?;
        if !source.streaming {
            return Err(SoundError::NotStreaming(name.to_string()));
        }
        if let Some(id) = source.channel {
            if let Some(output) = self.pools.output_for(id, source.serial) {
                output.flush();
            }
        }
        Ok(())
    }

    /// Cull a source: it keeps playing what it has but will not be
    /// (re)started until activated.
    pub fn cull(&mut self, name: &str) -> SoundResult<()> {
        self.source_mut(name)?.active = false;
        Ok(())
    }

    /// Re-activate a culled source.
    pub fn activate(&mut self, name: &str) -> SoundResult<()> {
        let source = self.source_mut(name)?;
        if !source.active {
            source.active = true;
            self.pending_replay = true;
        }
        Ok(())
    }

    /// Start every active source that wanted to play while culled.
    pub fn replay_sources(&mut self) {
        self.pending_replay = false;
        let names: Vec<String> = self
            .sources
            .values()
            .filter(|s| s.active && s.to_play && !source_playing(s, &self.pools))
            .map(|s| s.name.clone())
            .collect();
        for name in names {
            if let Some(source) = self.sources.get_mut(&name) {
                source.to_play = false;
            }
            if let Err(e) = self.play(&name) {
                warn!("Replay of '{}' failed: {e}", name);
            }
        }
    }

    // === Streams ===

    /// Feed PCM to a raw data stream.
    ///
    /// Returns how many previously fed buffers have finished playing.
    pub fn feed_raw_audio_data(&mut self, name: &str, data: &SoundBuffer) -> SoundResult<usize> {
        let source = self.source(name)?;
        if !source.is_raw() {
            return Err(SoundError::NotRawStream(name.to_string()));
        }
        if !source.active {
            return Err(SoundError::Culled(name.to_string()));
        }
        if let Some(expected) = source.raw_format {
            let fed = data.format();
            if (fed.sample_rate, fed.channels, fed.bits_per_sample)
                != (expected.sample_rate, expected.channels, expected.bits_per_sample)
            {
                return Err(SoundError::decode(
                    name,
                    format!("fed {fed:?}, stream expects {expected:?}"),
                ));
            }
        }
        let serial = source.serial;
        let attached = source
            .channel
            .filter(|id| self.pools.get(*id).is_some_and(|c| c.attached == Some(serial)));
        let id = match attached {
            Some(id) => id,
            None => self.acquire_channel(name)?,
        };

        let data = if self.backend.reverse_byte_order() && data.format().bits_per_sample == 16 {
            data.with_swapped_byte_order()
        } else {
            data.clone()
        };

        let output = self
            .pools
            .output_for(id, serial)
            .ok_or_else(|| SoundError::NoChannel(name.to_string()))?;
        let processed = output.processed();
        output.queue(&data)?;
        if !output.is_playing() {
            output.play();
        }

        if let Some(source) = self.sources.get_mut(name) {
            if source.state != PlaybackState::Playing {
                source.state = PlaybackState::Playing;
                apply_mix(
                    source,
                    &mut self.pools,
                    &self.spatial,
                    self.master_gain,
                    Instant::now(),
                );
            }
        }
        self.watch(name, serial, id);
        Ok(processed)
    }

    /// Queue a sound to play after the current one.
    pub fn queue_sound(&mut self, name: &str, sound: SoundRef) -> SoundResult<()> {
        self.source_mut(name)?.queue_sound(sound)
    }

    /// Remove a sound from a source's sequence.
    pub fn dequeue_sound(&mut self, name: &str, identifier: &str) -> SoundResult<()> {
        if !self.source_mut(name)?.dequeue_sound(identifier)? {
            debug!("'{}' was not queued on '{}'", identifier, name);
        }
        Ok(())
    }

    /// Fade a stream out, then play `next` or stop.
    pub fn fade_out(&mut self, name: &str, next: Option<SoundRef>, millis: u64) -> SoundResult<()> {
        let now = Instant::now();
        self.source_mut(name)?
            .fade_out(next, Duration::from_millis(millis), now)?;
        self.remix(name);
        Ok(())
    }

    /// Fade a stream out, switch to `next`, and fade it in.
    pub fn fade_out_in(
        &mut self,
        name: &str,
        next: SoundRef,
        millis_out: u64,
        millis_in: u64,
    ) -> SoundResult<()> {
        let now = Instant::now();
        self.source_mut(name)?.fade_out_in(
            next,
            Duration::from_millis(millis_out),
            Duration::from_millis(millis_in),
            now,
        )?;
        self.remix(name);
        Ok(())
    }

    /// Push the current fade gain of every stream to its channel.
    pub fn check_fade_volumes(&mut self) {
        let now = Instant::now();
        for source in self.sources.values().filter(|s| s.streaming) {
            apply_mix(source, &mut self.pools, &self.spatial, self.master_gain, now);
        }
    }

    // === Listener ===

    fn listener_changed(&mut self) {
        let listener = *self.spatial.listener();
        self.backend.set_listener(&listener);
        self.remix_all();
    }

    /// Move the listener by a relative offset.
    pub fn move_listener(&mut self, delta: Vec3) {
        self.spatial.listener_mut().translate(delta);
        self.listener_changed();
    }

    /// Place the listener.
    pub fn set_listener_position(&mut self, position: Vec3) {
        self.spatial.listener_mut().set_position(position);
        self.listener_changed();
    }

    /// Turn the listener by a relative angle (radians).
    pub fn turn_listener(&mut self, angle: f32) {
        self.spatial.listener_mut().turn(angle);
        self.listener_changed();
    }

    /// Face the listener at an absolute angle (radians).
    pub fn set_listener_angle(&mut self, angle: f32) {
        self.spatial.listener_mut().set_angle(angle);
        self.listener_changed();
    }

    /// Set the listener's look and up vectors.
    pub fn set_listener_orientation(&mut self, look_at: Vec3, up: Vec3) {
        self.spatial.listener_mut().set_orientation(look_at, up);
        self.listener_changed();
    }

    /// Set the listener's velocity.
    pub fn set_listener_velocity(&mut self, velocity: Vec3) {
        self.spatial.listener_mut().set_velocity(velocity);
        self.listener_changed();
    }

    /// Replace the listener wholesale.
    pub fn set_listener_data(&mut self, listener: ListenerData) {
        self.spatial.set_listener(listener);
        self.listener_changed();
    }

    /// Current listener.
    #[must_use]
    pub const fn listener(&self) -> &ListenerData {
        self.spatial.listener()
    }

    // === Global ===

    /// Set master volume (clamped to 0.0-1.0).
    pub fn set_master_volume(&mut self, volume: f32) {
        self.master_gain = volume.clamp(0.0, 1.0);
        self.remix_all();
    }

    /// Master volume.
    #[must_use]
    pub const fn master_volume(&self) -> f32 {
        self.master_gain
    }

    /// Set the Doppler factor.
    pub fn set_doppler_factor(&mut self, factor: f32) {
        self.spatial.set_doppler_factor(factor);
        self.remix_all();
    }

    /// Set the Doppler velocity.
    pub fn set_doppler_velocity(&mut self, velocity: f32) {
        self.spatial.set_doppler_velocity(velocity);
        self.remix_all();
    }

    /// Doppler factor and velocity.
    #[must_use]
    pub const fn doppler(&self) -> (f32, f32) {
        (self.spatial.doppler_factor(), self.spatial.doppler_velocity())
    }

    // === Queries ===

    /// Whether a source is playing.
    #[must_use]
    pub fn is_playing(&self, name: &str) -> bool {
        self.sources
            .get(name)
            .is_some_and(|s| source_playing(s, &self.pools))
    }

    /// Whether any source is playing.
    #[must_use]
    pub fn any_playing(&self) -> bool {
        self.sources.values().any(|s| source_playing(s, &self.pools))
    }

    /// Milliseconds played since the source last started from the top.
    #[must_use]
    pub fn milliseconds_played(&self, name: &str) -> f32 {
        self.sources
            .get(name)
            .and_then(|s| {
                let channel = self.pools.get(s.channel?)?;
                (channel.attached == Some(s.serial)).then(|| channel.output.millis_played())
            })
            .unwrap_or(0.0)
    }

    /// A source's volume.
    #[must_use]
    pub fn volume(&self, name: &str) -> Option<f32> {
        self.sources.get(name).map(Source::volume)
    }

    /// A source's pitch.
    #[must_use]
    pub fn pitch(&self, name: &str) -> Option<f32> {
        self.sources.get(name).map(Source::pitch)
    }

    /// Names of live sources, sorted.
    #[must_use]
    pub fn source_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.sources.keys().cloned().collect();
        names.sort();
        names
    }

    /// Parameters of one source.
    #[must_use]
    pub fn source_snapshot(&self, name: &str) -> Option<SourceSnapshot> {
        self.sources.get(name).map(Source::snapshot)
    }

    /// Whether a source exists.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.sources.contains_key(name)
    }

    /// Whether any temporary source is alive.
    #[must_use]
    pub fn has_temporary_sources(&self) -> bool {
        self.sources.values().any(|s| s.temporary)
    }

    // === Maintenance ===

    /// Remove temporary sources that are neither playing nor waiting to be
    /// replayed. Returns how many.
    pub fn remove_temporary_sources(&mut self) -> usize {
        let finished: Vec<String> = self
            .sources
            .values()
            .filter(|s| s.temporary && !s.to_play && !source_playing(s, &self.pools))
            .map(|s| s.name.clone())
            .collect();
        for name in &finished {
            self.discard_source(name);
            self.events.publish(SoundEvent::SourceRemoved {
                source: name.clone(),
            });
        }
        if !finished.is_empty() {
            debug!("Reaped {} temporary sources", finished.len());
        }
        finished.len()
    }

    /// Capture everything a backend switch must preserve.
    #[must_use]
    pub fn snapshot(&self) -> LibrarySnapshot {
        let mut sources: Vec<SourceSnapshot> = self.sources.values().map(Source::snapshot).collect();
        sources.sort_by(|a, b| a.name.cmp(&b.name));
        let mut playing: Vec<String> = self
            .sources
            .values()
            .filter(|s| source_playing(s, &self.pools))
            .map(|s| s.name.clone())
            .collect();
        playing.sort();
        LibrarySnapshot {
            sources,
            playing,
            listener: *self.spatial.listener(),
            master_gain: self.master_gain,
            doppler_factor: self.spatial.doppler_factor(),
            doppler_velocity: self.spatial.doppler_velocity(),
        }
    }

    /// Recreate sources and global state from a snapshot, restarting those
    /// that were playing.
    pub fn restore(&mut self, snapshot: &LibrarySnapshot) {
        self.master_gain = snapshot.master_gain;
        self.spatial.set_doppler_factor(snapshot.doppler_factor);
        self.spatial.set_doppler_velocity(snapshot.doppler_velocity);
        self.spatial.set_listener(snapshot.listener);
        self.backend.set_listener(&snapshot.listener);

        for data in &snapshot.sources {
            self.discard_source(&data.name);
            self.sources
                .insert(data.name.clone(), Source::from_snapshot(data));
        }
        for name in &snapshot.playing {
            if let Err(e) = self.play(name) {
                warn!("Could not restart '{}' after restore: {e}", name);
            }
        }
    }

    /// Move every source to another backend.
    ///
    /// The new backend's channels are created first; if that fails the
    /// current backend stays in place. Returns the previous backend's name.
    pub fn switch_backend(&mut self, mut backend: Box<dyn Backend>) -> SoundResult<String> {
        let pools = match ChannelPools::create(
            backend.as_mut(),
            self.config.normal_channels,
            self.config.streaming_channels,
        ) {
            Ok(pools) => pools,
            Err(e) => {
                backend.cleanup();
                return Err(e);
            },
        };

        let snapshot = self.snapshot();
        let from = self.backend.name().to_string();
        let to = backend.name().to_string();

        self.watched.clear();
        for (_, mut source) in self.sources.drain() {
            source.release_codecs();
        }
        self.pools.close_all();
        self.backend.cleanup();

        self.backend = backend;
        self.pools = pools;
        self.restore(&snapshot);

        info!("Switched sound backend from '{}' to '{}'", from, to);
        self.events.publish(SoundEvent::BackendSwitched {
            from: from.clone(),
            to,
        });
        Ok(from)
    }

    /// Release every source, channel and the backend.
    pub fn cleanup(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.watched.clear();
        for (_, mut source) in self.sources.drain() {
            source.release_codecs();
        }
        self.pools.close_all();
        self.buffers.clear();
        self.backend.cleanup();
        info!("Sound library closed");
    }
}

impl Drop for Library {
    fn drop(&mut self) {
        self.cleanup();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{mock_library, MockBackend, MockCodec};
    use proptest::prelude::*;

    fn normal(sound: &str) -> SourceSpec {
        SourceSpec::new(sound)
    }

    #[test]
    fn test_new_source_loads_sound() {
        let (mut library, _probe, codec) = mock_library(SoundConfig::default());
        library.new_source("a", normal("beep.mock")).expect("source");
        assert_eq!(library.loaded_sounds(), vec!["beep.mock".to_string()]);
        assert_eq!(codec.inits(), 1);
        assert_eq!(codec.cleanups(), 1);

        // second source reuses the cache
        library.new_source("b", normal("beep.mock")).expect("source");
        assert_eq!(codec.inits(), 1);
    }

    #[test]
    fn test_new_source_unknown_codec() {
        let (mut library, _probe, _codec) = mock_library(SoundConfig::default());
        let result = library.new_source("a", normal("beep.xyz"));
        assert!(matches!(result, Err(SoundError::NoCodec(_))));
        assert!(!library.contains("a"));
    }

    #[test]
    fn test_replacing_source_releases_once() {
        let (mut library, _probe, codec) = mock_library(SoundConfig::default());
        let spec = SourceSpec::new("music.mock").with_streaming(true);
        library.new_source("music", spec.clone()).expect("source");
        library.play("music").expect("play");
        library.stream_pass(Instant::now());
        assert_eq!(codec.inits(), 1);

        library.new_source("music", spec).expect("replace");
        assert_eq!(codec.cleanups(), 1);
        assert_eq!(library.source_names(), vec!["music".to_string()]);
        assert!(!library.is_playing("music"));

        library.remove_source("music").expect("remove");
        assert_eq!(codec.cleanups(), 1);
        drop(library);
        assert_eq!(codec.cleanups(), 1);
    }

    #[test]
    fn test_unknown_source_errors() {
        let (mut library, _probe, _codec) = mock_library(SoundConfig::default());
        assert!(matches!(library.play("ghost"), Err(SoundError::UnknownSource(_))));
        assert!(matches!(
            library.remove_source("ghost"),
            Err(SoundError::UnknownSource(_))
        ));
        assert!(library.set_volume("ghost", 0.5).is_err());
    }

    #[test]
    fn test_play_attaches_and_mixes() {
        let config = SoundConfig::default().with_master_gain(0.5);
        let (mut library, probe, _codec) = mock_library(config);
        library
            .new_source(
                "a",
                normal("a.mock").with_attenuation(AttenuationModel::None),
            )
            .expect("source");
        library.set_volume("a", 0.5).expect("volume");
        library.play("a").expect("play");

        assert!(library.is_playing("a"));
        let state = probe.channel(ChannelKind::Normal, 0);
        assert!(state.playing);
        assert!(state.attached.is_some());
        assert!((state.gain - 0.25).abs() < 1e-6);
    }

    #[test]
    fn test_priority_blocks_stealing() {
        let config = SoundConfig::default().with_channels(2, 1);
        let (mut library, _probe, _codec) = mock_library(config);
        for name in ["p1", "p2"] {
            library
                .new_source(name, normal("a.mock").with_priority(true))
                .expect("source");
            library.play(name).expect("play");
        }
        library.new_source("late", normal("a.mock")).expect("source");
        assert!(matches!(library.play("late"), Err(SoundError::NoChannel(_))));
        assert!(library.is_playing("p1") && library.is_playing("p2"));
    }

    #[test]
    fn test_steals_non_priority() {
        let config = SoundConfig::default().with_channels(2, 1);
        let (mut library, _probe, _codec) = mock_library(config);
        library
            .new_source("keep", normal("a.mock").with_priority(true))
            .expect("source");
        library.new_source("victim", normal("a.mock")).expect("source");
        library.play("keep").expect("play");
        library.play("victim").expect("play");

        library.new_source("thief", normal("a.mock")).expect("source");
        library.play("thief").expect("play");

        assert!(library.is_playing("keep"));
        assert!(library.is_playing("thief"));
        assert!(!library.is_playing("victim"));
        assert_eq!(
            library.source_snapshot("victim").map(|s| s.state),
            Some(PlaybackState::Stopped)
        );
    }

    #[test]
    fn test_finished_channel_reused_before_stealing() {
        let config = SoundConfig::default().with_channels(2, 1);
        let (mut library, probe, _codec) = mock_library(config);
        for name in ["a", "b"] {
            library.new_source(name, normal("a.mock")).expect("source");
            library.play(name).expect("play");
        }
        probe.finish(ChannelKind::Normal, 0);

        library.new_source("c", normal("a.mock")).expect("source");
        library.play("c").expect("play");
        assert!(library.is_playing("b"));
        assert_eq!(
            library.source_snapshot("c").map(|s| s.state),
            Some(PlaybackState::Playing)
        );
        assert!(library.is_playing("c"));
    }

    #[test]
    fn test_round_robin_fills_pool_first() {
        let config = SoundConfig::default().with_channels(4, 1);
        let (mut library, probe, _codec) = mock_library(config);
        for i in 0..4 {
            let name = format!("s{i}");
            library.new_source(&name, normal("a.mock")).expect("source");
            library.play(&name).expect("play");
        }
        for i in 0..4 {
            assert_eq!(probe.channel(ChannelKind::Normal, i).plays, 1);
        }
    }

    #[test]
    fn test_cull_keeps_playing_and_defers() {
        let (mut library, _probe, _codec) = mock_library(SoundConfig::default());
        library.new_source("a", normal("a.mock")).expect("source");
        library.play("a").expect("play");
        library.cull("a").expect("cull");
        assert!(library.is_playing("a"));

        library.stop("a").expect("stop");
        library.play("a").expect("play while culled");
        assert!(!library.is_playing("a"));

        library.activate("a").expect("activate");
        assert!(library.pending_replay);
        library.replay_sources();
        assert!(library.is_playing("a"));
    }

    #[test]
    fn test_pause_and_resume_same_channel() {
        let (mut library, probe, _codec) = mock_library(SoundConfig::default());
        library.new_source("a", normal("a.mock")).expect("source");
        library.play("a").expect("play");
        library.pause("a").expect("pause");
        assert!(!library.is_playing("a"));
        library.play("a").expect("resume");
        assert!(library.is_playing("a"));
        assert_eq!(probe.channel(ChannelKind::Normal, 0).attaches, 1);
    }

    #[test]
    fn test_flush_requires_streaming() {
        let (mut library, _probe, _codec) = mock_library(SoundConfig::default());
        library.new_source("a", normal("a.mock")).expect("source");
        assert!(matches!(library.flush("a"), Err(SoundError::NotStreaming(_))));
    }

    #[test]
    fn test_raw_feed() {
        let (mut library, probe, _codec) = mock_library(SoundConfig::default());
        let format = AudioFormat::new(8000, 1, 16);
        library
            .raw_data_stream("mic", format, SourceSpec::raw())
            .expect("raw");
        library.play("mic").expect("no-op");
        assert!(!library.is_playing("mic"));

        let chunk = MockCodec::chunk();
        assert_eq!(library.feed_raw_audio_data("mic", &chunk).expect("feed"), 0);
        assert_eq!(library.feed_raw_audio_data("mic", &chunk).expect("feed"), 0);
        assert!(library.is_playing("mic"));

        probe.drain(ChannelKind::Streaming, 0);
        assert_eq!(library.feed_raw_audio_data("mic", &chunk).expect("feed"), 2);

        library.cull("mic").expect("cull");
        assert!(matches!(
            library.feed_raw_audio_data("mic", &chunk),
            Err(SoundError::Culled(_))
        ));

        library.new_source("a", normal("a.mock")).expect("source");
        assert!(matches!(
            library.feed_raw_audio_data("a", &chunk),
            Err(SoundError::NotRawStream(_))
        ));
    }

    #[test]
    fn test_raw_feed_rejects_other_format() {
        let (mut library, probe, _codec) = mock_library(SoundConfig::default());
        library
            .raw_data_stream("mic", AudioFormat::new(44_100, 2, 16), SourceSpec::raw())
            .expect("raw");

        let result = library.feed_raw_audio_data("mic", &MockCodec::chunk());
        assert!(matches!(result, Err(SoundError::Decode { .. })));
        assert!(!library.is_playing("mic"));
        assert_eq!(library.watched_count(), 0);
        assert_eq!(probe.channel(ChannelKind::Streaming, 0).total_queued, 0);
    }

    #[test]
    fn test_temporary_reaping() {
        let (mut library, probe, _codec) = mock_library(SoundConfig::default());
        library
            .new_source("t", normal("a.mock").with_temporary(true))
            .expect("source");
        library.new_source("keep", normal("a.mock")).expect("source");
        library.play("t").expect("play");
        assert_eq!(library.remove_temporary_sources(), 0);

        probe.finish(ChannelKind::Normal, 0);
        assert_eq!(library.remove_temporary_sources(), 1);
        assert_eq!(library.source_names(), vec!["keep".to_string()]);
        assert!(library
            .events
            .drain()
            .contains(&SoundEvent::SourceRemoved { source: "t".into() }));
    }

    #[test]
    fn test_culled_temporary_waiting_to_play_is_kept() {
        let (mut library, _probe, _codec) = mock_library(SoundConfig::default());
        library
            .new_source("t", normal("a.mock").with_temporary(true))
            .expect("source");
        library.cull("t").expect("cull");
        library.play("t").expect("deferred");
        assert_eq!(library.remove_temporary_sources(), 0);

        library.activate("t").expect("activate");
        library.replay_sources();
        assert!(library.is_playing("t"));
    }

    #[test]
    fn test_listener_updates_reach_backend() {
        let (mut library, probe, _codec) = mock_library(SoundConfig::default());
        library.move_listener(Vec3::new(1.0, 0.0, 0.0));
        library.set_listener_angle(0.5);
        assert_eq!(probe.listener_updates(), 2);
        assert_eq!(library.listener().position, Vec3::new(1.0, 0.0, 0.0));
    }

    #[test]
    fn test_master_volume_clamps_and_remixes() {
        let (mut library, probe, _codec) = mock_library(SoundConfig::default());
        library
            .new_source("a", normal("a.mock").with_attenuation(AttenuationModel::None))
            .expect("source");
        library.play("a").expect("play");
        library.set_master_volume(3.0);
        assert!((library.master_volume() - 1.0).abs() < f32::EPSILON);
        library.set_master_volume(0.2);
        assert!((probe.channel(ChannelKind::Normal, 0).gain - 0.2).abs() < 1e-6);
    }

    #[test]
    fn test_unload_stops_users() {
        let (mut library, _probe, _codec) = mock_library(SoundConfig::default());
        library.new_source("a", normal("a.mock")).expect("source");
        library.play("a").expect("play");
        library.unload_sound("a.mock");
        assert!(!library.is_playing("a"));
        assert!(library.loaded_sounds().is_empty());
    }

    #[test]
    fn test_switch_backend_restarts_playing_streams() {
        let (mut library, old_probe, _codec) = mock_library(SoundConfig::default());
        library
            .new_source("music", SourceSpec::new("music.mock").with_streaming(true).with_looping(true))
            .expect("source");
        library.new_source("idle", normal("a.mock")).expect("source");
        library.play("music").expect("play");
        library.stream_pass(Instant::now());

        let (backend, probe) = MockBackend::new();
        assert_eq!(library.switch_backend(Box::new(backend)).expect("switch"), "mock");
        assert_eq!(old_probe.cleanups(), 1);
        assert!(old_probe.channel(ChannelKind::Streaming, 0).closed);

        assert!(library.is_playing("music"));
        assert!(!library.is_playing("idle"));
        library.stream_pass(Instant::now());
        assert!(probe.channel(ChannelKind::Streaming, 0).playing);
        assert!(library
            .events
            .drain()
            .iter()
            .any(|e| matches!(e, SoundEvent::BackendSwitched { .. })));
    }

    fn attenuation() -> impl Strategy<Value = AttenuationModel> {
        prop_oneof![
            Just(AttenuationModel::None),
            Just(AttenuationModel::Linear),
            Just(AttenuationModel::Rolloff),
        ]
    }

    proptest! {
        #[test]
        fn prop_switch_backend_preserves_parameters(
            sources in prop::collection::vec(
                (
                    (-100.0f32..100.0, -100.0f32..100.0, -100.0f32..100.0),
                    0.0f32..=1.0,
                    0.5f32..=2.0,
                    any::<bool>(),
                    any::<bool>(),
                    attenuation(),
                ),
                1..6,
            )
        ) {
            let (mut library, _probe, _codec) = mock_library(SoundConfig::default());
            for (i, ((x, y, z), volume, pitch, priority, looping, model)) in sources.iter().enumerate() {
                let name = format!("s{i}");
                let spec = normal("a.mock")
                    .with_position(Vec3::new(*x, *y, *z))
                    .with_priority(*priority)
                    .with_looping(*looping)
                    .with_attenuation(*model);
                library.new_source(&name, spec).expect("source");
                library.set_volume(&name, *volume).expect("volume");
                library.set_pitch(&name, *pitch).expect("pitch");
            }
            let before = library.snapshot();

            let (backend, _new_probe) = MockBackend::new();
            library.switch_backend(Box::new(backend)).expect("switch");

            prop_assert_eq!(before.sources, library.snapshot().sources);
        }
    }
}
