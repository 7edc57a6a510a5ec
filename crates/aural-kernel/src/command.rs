//! Commands and the command thread.
//!
//! Every mutation requested through the facade becomes a [`Command`] on a
//! FIFO queue. The command thread drains the queue in passes:
//!
//! 1. the [`SourceManager`] hook runs;
//! 2. commands run in order, except `Play` and `FeedRawAudioData`, which are
//!    set aside;
//! 3. if anything was activated, culled sources that wanted to play are
//!    restarted;
//! 4. the set-aside commands run in their original order;
//! 5. finished temporary sources are removed once per reap interval.
//!
//! A failing command is logged and remembered as the engine's last error;
//! it never reaches the thread that queued it.

use std::collections::VecDeque;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Instant;

use crossbeam_channel::Sender;
use glam::Vec3;
use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use crate::error::{SoundError, SoundResult};
use crate::library::Library;
use crate::manager::SourceManager;
use crate::resource::{AudioFormat, SoundBuffer, SoundRef};
use crate::source::SourceSpec;
use crate::spatial::AttenuationModel;
use crate::worker::{killed, Signal};

/// One queued engine operation.
#[derive(Debug)]
pub enum Command {
    // === Sound library ===
    /// Decode a sound into the cache.
    LoadSound(SoundRef),
    /// Store decoded PCM under an identifier.
    LoadSoundData {
        /// Cache key
        identifier: String,
        /// PCM data
        buffer: SoundBuffer,
    },
    /// Drop a sound from the cache.
    UnloadSound(String),

    // === Source lifecycle ===
    /// Create (or replace) a source.
    NewSource {
        /// Source name
        name: String,
        /// Creation parameters
        spec: SourceSpec,
    },
    /// Create a raw PCM input stream.
    RawDataStream {
        /// Source name
        name: String,
        /// PCM format of the data that will be fed
        format: AudioFormat,
        /// Creation parameters
        spec: SourceSpec,
    },
    /// Remove a source.
    RemoveSource(String),
    /// Change the temporary flag.
    SetTemporary(String, bool),

    // === Source parameters ===
    /// Move a source.
    SetPosition(String, Vec3),
    /// Set volume.
    SetVolume(String, f32),
    /// Set pitch.
    SetPitch(String, f32),
    /// Set priority.
    SetPriority(String, bool),
    /// Set looping.
    SetLooping(String, bool),
    /// Set the attenuation model.
    SetAttenuation(String, AttenuationModel),
    /// Set the fade distance or rolloff factor.
    SetDistOrRoll(String, f32),
    /// Set velocity.
    SetVelocity(String, Vec3),

    // === Transport ===
    /// Start playing.
    Play(String),
    /// Pause.
    Pause(String),
    /// Stop.
    Stop(String),
    /// Rewind.
    Rewind(String),
    /// Discard a stream's queued chunks.
    Flush(String),
    /// Stop (re)starting a source.
    Cull(String),
    /// Allow a culled source to play again.
    Activate(String),

    // === Sequencing ===
    /// Queue a sound after the current one.
    QueueSound(String, SoundRef),
    /// Remove a queued sound.
    DequeueSound(String, String),
    /// Fade out, then play `next` or stop.
    FadeOut {
        /// Source name
        name: String,
        /// Sound to play after the fade
        next: Option<SoundRef>,
        /// Fade length
        millis: u64,
    },
    /// Fade out, switch to `next`, fade in.
    FadeOutIn {
        /// Source name
        name: String,
        /// Sound to switch to
        next: SoundRef,
        /// Fade-out length
        millis_out: u64,
        /// Fade-in length
        millis_in: u64,
    },
    /// Re-apply fade gains.
    CheckFadeVolumes,

    // === Listener ===
    /// Move the listener by an offset.
    MoveListener(Vec3),
    /// Place the listener.
    SetListenerPosition(Vec3),
    /// Turn the listener by an angle.
    TurnListener(f32),
    /// Face the listener at an angle.
    SetListenerAngle(f32),
    /// Set look and up vectors.
    SetListenerOrientation {
        /// Look direction
        look_at: Vec3,
        /// Up direction
        up: Vec3,
    },
    /// Set listener velocity.
    SetListenerVelocity(Vec3),

    // === Global ===
    /// Set master volume.
    SetMasterVolume(f32),
    /// Set the Doppler factor.
    DopplerFactor(f32),
    /// Set the Doppler velocity.
    DopplerVelocity(f32),

    // === Raw streams ===
    /// Feed PCM to a raw data stream.
    FeedRawAudioData {
        /// Source name
        name: String,
        /// PCM data
        data: SoundBuffer,
        /// Where to send the processed-buffer count (or the error).
        reply: Option<Sender<SoundResult<usize>>>,
    },
}

impl Command {
    /// Whether the command runs after the rest of its batch.
    #[must_use]
    pub const fn is_deferred(&self) -> bool {
        matches!(self, Self::Play(_) | Self::FeedRawAudioData { .. })
    }

    /// Short name for logs.
    #[must_use]
    pub const fn label(&self) -> &'static str {
        match self {
            Self::LoadSound(_) => "load-sound",
            Self::LoadSoundData { .. } => "load-sound-data",
            Self::UnloadSound(_) => "unload-sound",
            Self::NewSource { .. } => "new-source",
            Self::RawDataStream { .. } => "raw-data-stream",
            Self::RemoveSource(_) => "remove-source",
            Self::SetTemporary(..) => "set-temporary",
            Self::SetPosition(..) => "set-position",
            Self::SetVolume(..) => "set-volume",
            Self::SetPitch(..) => "set-pitch",
            Self::SetPriority(..) => "set-priority",
            Self::SetLooping(..) => "set-looping",
            Self::SetAttenuation(..) => "set-attenuation",
            Self::SetDistOrRoll(..) => "set-dist-or-roll",
            Self::SetVelocity(..) => "set-velocity",
            Self::Play(_) => "play",
            Self::Pause(_) => "pause",
            Self::Stop(_) => "stop",
            Self::Rewind(_) => "rewind",
            Self::Flush(_) => "flush",
            Self::Cull(_) => "cull",
            Self::Activate(_) => "activate",
            Self::QueueSound(..) => "queue-sound",
            Self::DequeueSound(..) => "dequeue-sound",
            Self::FadeOut { .. } => "fade-out",
            Self::FadeOutIn { .. } => "fade-out-in",
            Self::CheckFadeVolumes => "check-fade-volumes",
            Self::MoveListener(_) => "move-listener",
            Self::SetListenerPosition(_) => "set-listener-position",
            Self::TurnListener(_) => "turn-listener",
            Self::SetListenerAngle(_) => "set-listener-angle",
            Self::SetListenerOrientation { .. } => "set-listener-orientation",
            Self::SetListenerVelocity(_) => "set-listener-velocity",
            Self::SetMasterVolume(_) => "set-master-volume",
            Self::DopplerFactor(_) => "doppler-factor",
            Self::DopplerVelocity(_) => "doppler-velocity",
            Self::FeedRawAudioData { .. } => "feed-raw-audio-data",
        }
    }

    /// Apply the command.
    pub fn execute(self, library: &mut Library) -> SoundResult<()> {
        match self {
            Self::LoadSound(sound) => library.load_sound(&sound),
            Self::LoadSoundData { identifier, buffer } => {
                library.load_sound_data(&identifier, buffer);
                Ok(())
            },
            Self::UnloadSound(identifier) => {
                library.unload_sound(&identifier);
                Ok(())
            },
            Self::NewSource { name, spec } => library.new_source(&name, spec),
            Self::RawDataStream { name, format, spec } => library.raw_data_stream(&name, format, spec),
            Self::RemoveSource(name) => library.remove_source(&name),
            Self::SetTemporary(name, temporary) => library.set_temporary(&name, temporary),
            Self::SetPosition(name, position) => library.set_position(&name, position),
            Self::SetVolume(name, volume) => library.set_volume(&name, volume),
            Self::SetPitch(name, pitch) => library.set_pitch(&name, pitch),
            Self::SetPriority(name, priority) => library.set_priority(&name, priority),
            Self::SetLooping(name, looping) => library.set_looping(&name, looping),
            Self::SetAttenuation(name, model) => library.set_attenuation(&name, model),
            Self::SetDistOrRoll(name, value) => library.set_dist_or_roll(&name, value),
            Self::SetVelocity(name, velocity) => library.set_velocity(&name, velocity),
            Self::Play(name) => library.play(&name),
            Self::Pause(name) => library.pause(&name),
            Self::Stop(name) => library.stop(&name),
            Self::Rewind(name) => library.rewind(&name),
            Self::Flush(name) => library.flush(&name),
            Self::Cull(name) => library.cull(&name),
            Self::Activate(name) => library.activate(&name),
            Self::QueueSound(name, sound) => library.queue_sound(&name, sound),
            Self::DequeueSound(name, identifier) => library.dequeue_sound(&name, &identifier),
            Self::FadeOut { name, next, millis } => library.fade_out(&name, next, millis),
            Self::FadeOutIn {
                name,
                next,
                millis_out,
                millis_in,
            } => library.fade_out_in(&name, next, millis_out, millis_in),
            Self::CheckFadeVolumes => {
                library.check_fade_volumes();
                Ok(())
            },
            Self::MoveListener(delta) => {
                library.move_listener(delta);
                Ok(())
            },
            Self::SetListenerPosition(position) => {
                library.set_listener_position(position);
                Ok(())
            },
            Self::TurnListener(angle) => {
                library.turn_listener(angle);
                Ok(())
            },
            Self::SetListenerAngle(angle) => {
                library.set_listener_angle(angle);
                Ok(())
            },
            Self::SetListenerOrientation { look_at, up } => {
                library.set_listener_orientation(look_at, up);
                Ok(())
            },
            Self::SetListenerVelocity(velocity) => {
                library.set_listener_velocity(velocity);
                Ok(())
            },
            Self::SetMasterVolume(volume) => {
                library.set_master_volume(volume);
                Ok(())
            },
            Self::DopplerFactor(factor) => {
                library.set_doppler_factor(factor);
                Ok(())
            },
            Self::DopplerVelocity(velocity) => {
                library.set_doppler_velocity(velocity);
                Ok(())
            },
            Self::FeedRawAudioData { name, data, reply } => {
                let result = library.feed_raw_audio_data(&name, &data);
                match reply {
                    // the caller is waiting on the outcome, error included
                    Some(reply) => {
                        let _ = reply.send(result);
                        Ok(())
                    },
                    None => result.map(|_| ()),
                }
            },
        }
    }
}

/// FIFO of pending commands.
#[derive(Debug, Default)]
pub struct CommandQueue {
    commands: VecDeque<Command>,
}

impl CommandQueue {
    /// Empty queue.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a command.
    pub fn push(&mut self, command: Command) {
        self.commands.push_back(command);
    }

    /// Take every pending command, oldest first.
    pub fn take(&mut self) -> Vec<Command> {
        self.commands.drain(..).collect()
    }

    /// Number of pending commands.
    #[must_use]
    pub fn len(&self) -> usize {
        self.commands.len()
    }

    /// Whether nothing is pending.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }
}

/// Everything guarded by the engine lock.
pub struct EngineState {
    /// Sources, channels and backend.
    pub library: Library,
    /// Pending commands.
    pub queue: CommandQueue,
    /// Culling policy hook.
    pub manager: Box<dyn SourceManager>,
    /// When temporary sources were last reaped.
    pub last_reap: Instant,
    /// Most recent command or backend failure.
    pub last_error: Option<SoundError>,
}

impl std::fmt::Debug for EngineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineState")
            .field("library", &self.library)
            .field("queue", &self.queue.len())
            .field("last_error", &self.last_error)
            .finish_non_exhaustive()
    }
}

impl EngineState {
    /// Wrap a library.
    pub fn new(library: Library, manager: Box<dyn SourceManager>) -> Self {
        Self {
            library,
            queue: CommandQueue::new(),
            manager,
            last_reap: Instant::now(),
            last_error: None,
        }
    }

    /// One command-thread pass. Returns whether more commands arrived.
    pub fn run_pass(&mut self, now: Instant) -> bool {
        self.manager.manage_sources(&mut self.library);

        let batch = self.queue.take();
        if !batch.is_empty() {
            trace!("Executing {} commands", batch.len());
        }
        self.execute_batch(batch);

        if now.saturating_duration_since(self.last_reap) >= self.library.config().reap_interval() {
            self.library.remove_temporary_sources();
            self.last_reap = now;
        }

        !self.queue.is_empty()
    }

    /// Run a batch: ordinary commands first, then replays, then the
    /// deferred plays and feeds.
    pub fn execute_batch(&mut self, batch: Vec<Command>) {
        let mut deferred = Vec::new();
        for command in batch {
            if command.is_deferred() {
                deferred.push(command);
            } else {
                self.run(command);
            }
        }

        if self.library.pending_replay {
            self.library.replay_sources();
        }

        for command in deferred {
            self.run(command);
        }
    }

    fn run(&mut self, command: Command) {
        let label = command.label();
        debug!("Command {}", label);
        if let Err(e) = command.execute(&mut self.library) {
            warn!("Command {} failed: {e}", label);
            self.last_error = Some(e);
        }
    }
}

/// State shared by the facade and both worker threads.
#[derive(Debug)]
pub struct Shared {
    /// The engine lock.
    pub state: Mutex<EngineState>,
}

/// Body of the command thread.
pub(crate) fn run_command_thread(shared: Arc<Shared>, signal: Arc<Signal>, kill: Arc<AtomicBool>) {
    let (idle, reap) = {
        let state = shared.state.lock();
        let config = state.library.config();
        (config.idle_timeout(), config.reap_interval())
    };
    debug!("Command thread started");
    signal.wait(idle);

    while !killed(&kill) {
        let (more, temporaries) = {
            let mut state = shared.state.lock();
            let more = state.run_pass(Instant::now());
            (more, state.library.has_temporary_sources())
        };
        if killed(&kill) {
            break;
        }
        if more {
            continue;
        }
        // temporary sources are only reaped when the thread is awake
        signal.wait(if temporaries { reap } else { idle });
    }
    debug!("Command thread exiting");
}
