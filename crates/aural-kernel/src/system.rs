//! The engine front door.
//!
//! [`SoundSystem`] owns the engine lock and the two worker threads. Every
//! mutating call becomes a [`Command`] appended to the queue, and the command
//! thread is woken; the call returns immediately. Queries take the lock and
//! read the current state directly, so they see every command that has
//! already executed but not ones still queued.
//!
//! ```no_run
//! use aural_kernel::prelude::*;
//!
//! let sound = SoundSystem::new(SoundConfig::default())?;
//! sound.background_music("music", "theme.wav", true);
//! let name = sound.quick_play(SourceSpec::new("click.wav"));
//! sound.set_volume(&name, 0.5);
//! sound.shutdown()?;
//! # Ok::<(), aural_kernel::error::SoundError>(())
//! ```

use std::sync::Arc;
use std::time::{Duration, Instant};

use aural_common::ids::generated_source_name;
use crossbeam_channel::Receiver;
use glam::Vec3;
use parking_lot::Mutex;
use tracing::{error, info, warn};

use crate::backend::{Backend, BackendRegistry};
use crate::codec::CodecRegistry;
use crate::command::{run_command_thread, Command, EngineState, Shared};
use crate::config::SoundConfig;
use crate::error::{SoundError, SoundResult};
use crate::events::{EventBus, SoundEvent};
use crate::library::{Library, LibrarySnapshot};
use crate::listener::ListenerData;
use crate::manager::{NoopManager, SourceManager};
use crate::resource::{AudioFormat, SoundBuffer, SoundRef};
use crate::source::SourceSnapshot;
use crate::source::SourceSpec;
use crate::spatial::AttenuationModel;
use crate::stream::run_stream_thread;
use crate::worker::{Signal, Worker};

/// Command thread name.
pub const COMMAND_THREAD: &str = "aural-command";
/// Stream thread name.
pub const STREAM_THREAD: &str = "aural-stream";

/// Configures and starts a [`SoundSystem`].
pub struct SoundSystemBuilder {
    config: SoundConfig,
    backends: BackendRegistry,
    codecs: CodecRegistry,
    manager: Box<dyn SourceManager>,
    backend: Option<Box<dyn Backend>>,
}

impl std::fmt::Debug for SoundSystemBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SoundSystemBuilder")
            .field("config", &self.config)
            .field("backends", &self.backends)
            .field("codecs", &self.codecs)
            .finish_non_exhaustive()
    }
}

impl Default for SoundSystemBuilder {
    fn default() -> Self {
        Self::new(SoundConfig::default())
    }
}

impl SoundSystemBuilder {
    /// Builder with the default backends, codecs and no culling.
    #[must_use]
    pub fn new(config: SoundConfig) -> Self {
        Self {
            config,
            backends: BackendRegistry::with_defaults(),
            codecs: CodecRegistry::with_defaults(),
            manager: Box::new(NoopManager),
            backend: None,
        }
    }

    /// Replace the backend registry used for selection and switching.
    #[must_use]
    pub fn backends(mut self, backends: BackendRegistry) -> Self {
        self.backends = backends;
        self
    }

    /// Replace the codec registry.
    #[must_use]
    pub fn codecs(mut self, codecs: CodecRegistry) -> Self {
        self.codecs = codecs;
        self
    }

    /// Install a culling policy.
    #[must_use]
    pub fn manager(mut self, manager: impl SourceManager + 'static) -> Self {
        self.manager = Box::new(manager);
        self
    }

    /// Use this backend instead of selecting one from the registry.
    #[must_use]
    pub fn backend(mut self, backend: Box<dyn Backend>) -> Self {
        self.backend = Some(backend);
        self
    }

    /// Bring up the backend and start both worker threads.
    ///
    /// Backends from the preference list that fail are skipped; the last of
    /// those failures is kept as the system's last error. An explicitly given
    /// backend that fails is returned as an error.
    pub fn build(self) -> SoundResult<SoundSystem> {
        let Self {
            mut config,
            backends,
            codecs,
            manager,
            backend,
        } = self;
        config.validate();

        let events = EventBus::new(config.event_capacity);
        let (mut library, fallback_error) = match backend {
            Some(backend) => (
                Library::new(backend, config.clone(), codecs, events.clone())?,
                None,
            ),
            None => backends.select(&config, |backend| {
                Library::new(backend, config.clone(), codecs.clone(), events.clone())
            })?,
        };

        let stream_signal = Arc::new(Signal::new());
        library.set_stream_signal(Arc::clone(&stream_signal));

        let mut state = EngineState::new(library, manager);
        state.last_error = fallback_error;
        let shared = Arc::new(Shared {
            state: Mutex::new(state),
        });

        let command = {
            let shared = Arc::clone(&shared);
            Worker::spawn(COMMAND_THREAD, Arc::new(Signal::new()), move |signal, kill| {
                run_command_thread(shared, signal, kill);
            })?
        };
        let stream = {
            let shared = Arc::clone(&shared);
            Worker::spawn(STREAM_THREAD, stream_signal, move |signal, kill| {
                run_stream_thread(shared, signal, kill);
            })?
        };

        info!(
            "Sound system started on '{}'",
            shared.state.lock().library.backend_name()
        );

        Ok(SoundSystem {
            shared,
            command,
            stream,
            events,
            backends,
            shutdown_timeout: config.shutdown_timeout(),
            closed: false,
        })
    }
}

/// Thread-safe handle to a running sound engine.
pub struct SoundSystem {
    shared: Arc<Shared>,
    command: Worker,
    stream: Worker,
    events: EventBus,
    backends: BackendRegistry,
    shutdown_timeout: Duration,
    closed: bool,
}

impl std::fmt::Debug for SoundSystem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SoundSystem")
            .field("command", &self.command.name())
            .field("stream", &self.stream.name())
            .field("closed", &self.closed)
            .finish_non_exhaustive()
    }
}

impl SoundSystem {
    /// Start with the default backends and codecs.
    pub fn new(config: SoundConfig) -> SoundResult<Self> {
        SoundSystemBuilder::new(config).build()
    }

    /// Builder for a customised system.
    #[must_use]
    pub fn builder(config: SoundConfig) -> SoundSystemBuilder {
        SoundSystemBuilder::new(config)
    }

    fn send(&self, command: Command) {
        self.shared.state.lock().queue.push(command);
        self.command.notify();
    }

    // === Sound library ===

    /// Decode a sound into the cache ahead of time.
    pub fn load_sound(&self, sound: impl Into<SoundRef>) {
        self.send(Command::LoadSound(sound.into()));
    }

    /// Store decoded PCM under an identifier, usable as a sound.
    pub fn load_sound_data(&self, identifier: &str, buffer: SoundBuffer) {
        self.send(Command::LoadSoundData {
            identifier: identifier.to_string(),
            buffer,
        });
    }

    /// Drop a sound from the cache.
    pub fn unload_sound(&self, identifier: &str) {
        self.send(Command::UnloadSound(identifier.to_string()));
    }

    // === Sources ===

    /// Create a source, replacing any source of the same name.
    pub fn new_source(&self, name: &str, spec: SourceSpec) {
        self.send(Command::NewSource {
            name: name.to_string(),
            spec,
        });
    }

    /// Create a temporary source under a generated name and play it.
    ///
    /// The source is removed once it finishes; call
    /// [`set_temporary`](Self::set_temporary) with `false` to keep it.
    pub fn quick_play(&self, spec: SourceSpec) -> String {
        self.quick(spec.with_streaming(false))
    }

    /// Like [`quick_play`](Self::quick_play) for a streaming source.
    pub fn quick_stream(&self, spec: SourceSpec) -> String {
        self.quick(spec.with_streaming(true))
    }

    fn quick(&self, spec: SourceSpec) -> String {
        let name = generated_source_name();
        {
            let mut state = self.shared.state.lock();
            state.queue.push(Command::NewSource {
                name: name.clone(),
                spec: spec.with_temporary(true),
            });
            state.queue.push(Command::Play(name.clone()));
        }
        self.command.notify();
        name
    }

    /// Stream a sound with priority and no distance attenuation.
    pub fn background_music(&self, name: &str, sound: impl Into<SoundRef>, looping: bool) {
        let spec = SourceSpec::new(sound)
            .with_priority(true)
            .with_streaming(true)
            .with_looping(looping)
            .with_attenuation(AttenuationModel::None);
        {
            let mut state = self.shared.state.lock();
            state.queue.push(Command::NewSource {
                name: name.to_string(),
                spec,
            });
            state.queue.push(Command::Play(name.to_string()));
        }
        self.command.notify();
    }

    /// Open a raw PCM input. Feeding data starts playback.
    pub fn raw_data_stream(&self, name: &str, format: AudioFormat, spec: SourceSpec) {
        self.send(Command::RawDataStream {
            name: name.to_string(),
            format,
            spec,
        });
    }

    /// Feed PCM to a raw data stream.
    ///
    /// The receiver yields how many earlier buffers have finished playing,
    /// or why the data was refused.
    pub fn feed_raw_audio_data(&self, name: &str, data: SoundBuffer) -> Receiver<SoundResult<usize>> {
        let (reply, receiver) = crossbeam_channel::bounded(1);
        self.send(Command::FeedRawAudioData {
            name: name.to_string(),
            data,
            reply: Some(reply),
        });
        receiver
    }

    /// Remove a source.
    pub fn remove_source(&self, name: &str) {
        self.send(Command::RemoveSource(name.to_string()));
    }

    /// Mark a source temporary (removed once finished) or permanent.
    pub fn set_temporary(&self, name: &str, temporary: bool) {
        self.send(Command::SetTemporary(name.to_string(), temporary));
    }

    // === Source parameters ===

    /// Move a source.
    pub fn set_position(&self, name: &str, position: Vec3) {
        self.send(Command::SetPosition(name.to_string(), position));
    }

    /// Set a source's volume (clamped to 0..=1).
    pub fn set_volume(&self, name: &str, volume: f32) {
        self.send(Command::SetVolume(name.to_string(), volume));
    }

    /// Set a source's pitch (clamped to 0.5..=2).
    pub fn set_pitch(&self, name: &str, pitch: f32) {
        self.send(Command::SetPitch(name.to_string(), pitch));
    }

    /// Protect a source's channel from being stolen.
    pub fn set_priority(&self, name: &str, priority: bool) {
        self.send(Command::SetPriority(name.to_string(), priority));
    }

    /// Set looping.
    pub fn set_looping(&self, name: &str, looping: bool) {
        self.send(Command::SetLooping(name.to_string(), looping));
    }

    /// Set the attenuation model.
    pub fn set_attenuation(&self, name: &str, model: AttenuationModel) {
        self.send(Command::SetAttenuation(name.to_string(), model));
    }

    /// Set the fade distance (linear) or rolloff factor (rolloff).
    pub fn set_dist_or_roll(&self, name: &str, value: f32) {
        self.send(Command::SetDistOrRoll(name.to_string(), value));
    }

    /// Set a source's velocity.
    pub fn set_velocity(&self, name: &str, velocity: Vec3) {
        self.send(Command::SetVelocity(name.to_string(), velocity));
    }

    // === Transport ===

    /// Play a source.
    pub fn play(&self, name: &str) {
        self.send(Command::Play(name.to_string()));
    }

    /// Pause a source.
    pub fn pause(&self, name: &str) {
        self.send(Command::Pause(name.to_string()));
    }

    /// Stop a source.
    pub fn stop(&self, name: &str) {
        self.send(Command::Stop(name.to_string()));
    }

    /// Rewind a source.
    pub fn rewind(&self, name: &str) {
        self.send(Command::Rewind(name.to_string()));
    }

    /// Discard a stream's queued audio.
    pub fn flush(&self, name: &str) {
        self.send(Command::Flush(name.to_string()));
    }

    /// Keep a source from (re)starting until activated.
    pub fn cull(&self, name: &str) {
        self.send(Command::Cull(name.to_string()));
    }

    /// Let a culled source play again.
    pub fn activate(&self, name: &str) {
        self.send(Command::Activate(name.to_string()));
    }

    // === Sequencing ===

    /// Play `sound` after the current one ends.
    pub fn queue_sound(&self, name: &str, sound: impl Into<SoundRef>) {
        self.send(Command::QueueSound(name.to_string(), sound.into()));
    }

    /// Remove a queued sound.
    pub fn dequeue_sound(&self, name: &str, identifier: &str) {
        self.send(Command::DequeueSound(name.to_string(), identifier.to_string()));
    }

    /// Fade out over `millis`, then play `next` or stop.
    pub fn fade_out(&self, name: &str, next: Option<SoundRef>, millis: u64) {
        self.send(Command::FadeOut {
            name: name.to_string(),
            next,
            millis,
        });
    }

    /// Fade out, switch to `next`, and fade in.
    pub fn fade_out_in(&self, name: &str, next: impl Into<SoundRef>, millis_out: u64, millis_in: u64) {
        self.send(Command::FadeOutIn {
            name: name.to_string(),
            next: next.into(),
            millis_out,
            millis_in,
        });
    }

    /// Re-apply fade gains now.
    pub fn check_fade_volumes(&self) {
        self.send(Command::CheckFadeVolumes);
    }

    // === Listener ===

    /// Move the listener by an offset.
    pub fn move_listener(&self, delta: Vec3) {
        self.send(Command::MoveListener(delta));
    }

    /// Place the listener.
    pub fn set_listener_position(&self, position: Vec3) {
        self.send(Command::SetListenerPosition(position));
    }

    /// Turn the listener by `angle` radians.
    pub fn turn_listener(&self, angle: f32) {
        self.send(Command::TurnListener(angle));
    }

    /// Face the listener `angle` radians from -Z.
    pub fn set_listener_angle(&self, angle: f32) {
        self.send(Command::SetListenerAngle(angle));
    }

    /// Set the listener's look and up vectors.
    pub fn set_listener_orientation(&self, look_at: Vec3, up: Vec3) {
        self.send(Command::SetListenerOrientation { look_at, up });
    }

    /// Set the listener's velocity.
    pub fn set_listener_velocity(&self, velocity: Vec3) {
        self.send(Command::SetListenerVelocity(velocity));
    }

    // === Global ===

    /// Set the master volume (clamped to 0..=1).
    pub fn set_master_volume(&self, volume: f32) {
        self.send(Command::SetMasterVolume(volume));
    }

    /// Set the Doppler factor.
    pub fn set_doppler_factor(&self, factor: f32) {
        self.send(Command::DopplerFactor(factor));
    }

    /// Set the Doppler velocity.
    pub fn set_doppler_velocity(&self, velocity: f32) {
        self.send(Command::DopplerVelocity(velocity));
    }

    /// Move every source to the backend registered as `name`.
    ///
    /// Runs synchronously. On failure the current backend keeps running.
    /// Returns the previous backend's name.
    pub fn switch_backend(&self, name: &str) -> SoundResult<String> {
        let config = self.shared.state.lock().library.config().clone();
        let backend = self.backends.create(name, &config)?;
        self.switch_backend_to(backend)
    }

    /// Move every source to an already constructed backend.
    pub fn switch_backend_to(&self, backend: Box<dyn Backend>) -> SoundResult<String> {
        let result = self.shared.state.lock().library.switch_backend(backend);
        if let Err(e) = &result {
            warn!("Backend switch failed: {e}");
        }
        result
    }

    // === Queries ===

    /// Whether a source is playing.
    pub fn is_playing(&self, name: &str) -> bool {
        self.shared.state.lock().library.is_playing(name)
    }

    /// Whether any source is playing.
    pub fn any_playing(&self) -> bool {
        self.shared.state.lock().library.any_playing()
    }

    /// A source's volume.
    pub fn volume(&self, name: &str) -> Option<f32> {
        self.shared.state.lock().library.volume(name)
    }

    /// A source's pitch.
    pub fn pitch(&self, name: &str) -> Option<f32> {
        self.shared.state.lock().library.pitch(name)
    }

    /// Milliseconds the source has played since it last started.
    pub fn milliseconds_played(&self, name: &str) -> f32 {
        self.shared.state.lock().library.milliseconds_played(name)
    }

    /// Master volume.
    pub fn master_volume(&self) -> f32 {
        self.shared.state.lock().library.master_volume()
    }

    /// Current listener.
    pub fn listener(&self) -> ListenerData {
        *self.shared.state.lock().library.listener()
    }

    /// Names of live sources, sorted.
    pub fn source_names(&self) -> Vec<String> {
        self.shared.state.lock().library.source_names()
    }

    /// Identifiers of cached sounds.
    pub fn loaded_sounds(&self) -> Vec<String> {
        self.shared.state.lock().library.loaded_sounds()
    }

    /// Every externally visible parameter of one source.
    pub fn source_snapshot(&self, name: &str) -> Option<SourceSnapshot> {
        self.shared.state.lock().library.source_snapshot(name)
    }

    /// Every source plus the listener and global parameters.
    pub fn snapshot(&self) -> LibrarySnapshot {
        self.shared.state.lock().library.snapshot()
    }

    /// Name of the backend in use.
    pub fn backend_name(&self) -> String {
        self.shared.state.lock().library.backend_name().to_string()
    }

    /// Commands waiting for the command thread.
    pub fn pending_commands(&self) -> usize {
        self.shared.state.lock().queue.len()
    }

    /// Wait until every queued command has executed. Returns `false` on
    /// timeout.
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if self.pending_commands() == 0 {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    /// Take the most recent command or backend failure.
    pub fn take_last_error(&self) -> Option<SoundError> {
        self.shared.state.lock().last_error.take()
    }

    /// Receiver for engine events.
    pub fn events(&self) -> Receiver<SoundEvent> {
        self.events.receiver()
    }

    /// Events delivered since the last drain.
    pub fn drain_events(&self) -> Vec<SoundEvent> {
        self.events.drain()
    }

    // === Shutdown ===

    /// Stop both threads and release the backend.
    ///
    /// Each thread gets the configured shutdown timeout; one that does not
    /// exit is reported and cleanup goes ahead regardless.
    pub fn shutdown(mut self) -> SoundResult<()> {
        self.close()
    }

    fn close(&mut self) -> SoundResult<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;

        let command = self.command.shutdown(self.shutdown_timeout);
        let stream = self.stream.shutdown(self.shutdown_timeout);

        match self.shared.state.try_lock_for(self.shutdown_timeout) {
            Some(mut state) => state.library.cleanup(),
            None => error!("Sound engine lock still held; backend left open"),
        }
        info!("Sound system shut down");
        command.and(stream)
    }
}

impl Drop for SoundSystem {
    fn drop(&mut self) {
        let _ = self.close();
    }
}
