//! Stream pump.
//!
//! Streaming sources are decoded a few chunks at a time. The stream thread
//! walks the watch list every `stream_poll_ms`, tops each channel's queue up
//! to `streaming_buffer_count` chunks, and decides what happens when a sound
//! runs out:
//!
//! - looping: restart it (or move to the next queued sound)
//! - not looping: move to the next queued sound, or finish
//!
//! In both cases the end-of-stream event fires once the channel has played
//! everything it was given. A fade-out that completes moves the sequence on
//! by itself; an end-of-stream seen while a fade-out is still running waits
//! for the fade.

use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Instant;

use aural_common::ids::SourceSerial;
use tracing::{debug, error, trace, warn};

use crate::backend::ChannelOutput;
use crate::channel::ChannelId;
use crate::codec::{Codec, CodecOptions, CodecRegistry};
use crate::command::Shared;
use crate::config::SoundConfig;
use crate::error::{SoundError, SoundResult};
use crate::events::SoundEvent;
use crate::library::{apply_mix, Library, WatchEntry};
use crate::source::{FadeProgress, PlaybackState, Source};
use crate::worker::{killed, Signal};

/// What to do with a watch entry after a pump.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Keep {
    Watching,
    Drop,
}

/// Decoder settings shared by every pump in a pass.
struct PumpContext<'a> {
    codecs: &'a CodecRegistry,
    config: &'a SoundConfig,
    options: CodecOptions,
    reverse: bool,
}

impl PumpContext<'_> {
    fn open(&self, source: &Source) -> SoundResult<Box<dyn Codec>> {
        let sound = source
            .sound
            .as_ref()
            .ok_or_else(|| SoundError::decode(&source.name, "no sound to stream"))?;
        let path = sound.resolve(&self.config.sound_dir);
        self.codecs.open(sound, &path, self.options, self.reverse)
    }

    /// Open the first queued sound and read ahead so the switch is seamless.
    ///
    /// A sound that cannot be opened is dropped from the sequence.
    fn prepare_next(&self, source: &mut Source) {
        let Some(next) = source.sequence.front() else {
            return;
        };
        let path = next.resolve(&self.config.sound_dir);
        let failed = match self.codecs.open(next, &path, self.options, self.reverse) {
            Ok(mut codec) => {
                let mut buffers = Vec::new();
                let mut failed = false;
                while buffers.len() < self.config.streaming_buffer_count {
                    match codec.read() {
                        Ok(Some(buffer)) => buffers.push(buffer),
                        Ok(None) => break,
                        Err(e) => {
                            error!("Pre-reading '{}' failed: {e}", next);
                            codec.cleanup();
                            failed = true;
                            break;
                        },
                    }
                }
                if !failed {
                    trace!("Pre-read {} chunks of '{}'", buffers.len(), next);
                    source.next_codec = Some(codec);
                    source.next_buffers = buffers;
                }
                failed
            },
            Err(e) => {
                error!("Could not open next sound '{}': {e}", next);
                true
            },
        };
        if failed {
            if let Some(skipped) = source.sequence.pop_front() {
                warn!("Skipping '{}' in '{}'", skipped, source.name);
            }
        }
    }

    /// Feed the channel. Returns `false` once the current sound has no more
    /// data to decode.
    fn stream(&self, source: &mut Source, output: &mut dyn ChannelOutput) -> SoundResult<bool> {
        let count = self.config.streaming_buffer_count;

        if source.pre_load {
            source.pre_load = false;
            source.eos_signalled = false;
            output.stop();
            output.flush();

            let initial = match source.staged.take() {
                Some(buffers) if source.codec.is_some() => buffers,
                _ => {
                    source.release_codec();
                    source.codec = Some(self.open(source)?);
                    Vec::new()
                },
            };
            for buffer in &initial {
                output.queue(buffer)?;
            }
            let Some(codec) = source.codec.as_mut() else {
                return Ok(false);
            };
            let mut queued = initial.len();
            while queued < count {
                match codec.read()? {
                    Some(buffer) => {
                        output.queue(&buffer)?;
                        queued += 1;
                    },
                    None => break,
                }
            }
            output.play();
            return Ok(!codec.end_of_stream());
        }

        let _ = output.processed();
        let Some(codec) = source.codec.as_mut() else {
            return Ok(false);
        };
        while output.queued() < count && !codec.end_of_stream() {
            match codec.read()? {
                Some(buffer) => output.queue(&buffer)?,
                None => break,
            }
        }
        if !output.is_playing() && output.queued() > 0 {
            // underrun: the channel ran dry before the refill
            output.play();
        }
        Ok(!codec.end_of_stream())
    }
}

impl Library {
    /// Add a stream to the watch list and wake the stream thread.
    ///
    /// A watched stream on the same channel is stopped and dropped first.
    pub(crate) fn watch(&mut self, name: &str, serial: SourceSerial, channel: ChannelId) {
        if !self.watched.iter().any(|w| w.serial == serial) {
            let sources = &mut self.sources;
            self.watched.retain(|w| {
                if w.channel != channel {
                    return true;
                }
                if let Some(other) = sources.get_mut(&w.name).filter(|s| s.serial == w.serial) {
                    if other.channel == Some(channel) {
                        other.state = PlaybackState::Stopped;
                        other.channel = None;
                    }
                }
                false
            });
            self.watched.push(WatchEntry {
                name: name.to_string(),
                serial,
                channel,
            });
            trace!("Watching '{}' on {}", name, channel);
        }
        if let Some(signal) = &self.stream_signal {
            signal.notify();
        }
    }

    /// Number of watched streams.
    #[must_use]
    pub fn watched_count(&self) -> usize {
        self.watched.len()
    }

    /// Pump every watched stream once. Returns whether any remain watched.
    pub fn stream_pass(&mut self, now: Instant) -> bool {
        let entries = std::mem::take(&mut self.watched);
        let mut kept = Vec::with_capacity(entries.len());
        for entry in entries {
            if self.pump(&entry, now) == Keep::Watching {
                kept.push(entry);
            }
        }
        self.watched = kept;
        !self.watched.is_empty()
    }

    fn pump(&mut self, entry: &WatchEntry, now: Instant) -> Keep {
        let reverse = self.backend.reverse_byte_order();
        let ctx = PumpContext {
            codecs: &self.codecs,
            config: &self.config,
            options: CodecOptions {
                chunk_bytes: self.config.streaming_buffer_size,
                max_bytes: self.config.max_file_size,
            },
            reverse,
        };

        let Some(source) = self
            .sources
            .get_mut(&entry.name)
            .filter(|s| s.serial == entry.serial)
        else {
            return Keep::Drop;
        };

        match source.state {
            PlaybackState::Stopped | PlaybackState::Idle => {
                return if source.is_raw() {
                    Keep::Watching
                } else {
                    Keep::Drop
                };
            },
            PlaybackState::Paused => return Keep::Watching,
            PlaybackState::Playing => {},
        }

        if !source.active {
            if source.looping || source.is_raw() {
                source.to_play = true;
            }
            if !source.is_raw() {
                // buffered audio plays out; activation restarts the stream
                source.state = PlaybackState::Stopped;
                source.pre_load = false;
                source.release_codecs();
            }
            return Keep::Drop;
        }

        if source.channel != Some(entry.channel) {
            return Keep::Drop;
        }

        if source.check_fade(now) == FadeProgress::Completed {
            debug!("Fade-out of '{}' complete", source.name);
            if source.advance_sequence() {
                source.pre_load = true;
            } else {
                source.state = PlaybackState::Stopped;
                source.release_codecs();
                if let Some(output) = self.pools.output_for(entry.channel, source.serial) {
                    output.stop();
                }
                return Keep::Drop;
            }
        }
        apply_mix(source, &mut self.pools, &self.spatial, self.master_gain, now);

        if source.is_raw() {
            return Keep::Watching;
        }

        let Some(output) = self.pools.output_for(entry.channel, source.serial) else {
            return Keep::Drop;
        };

        let more = match ctx.stream(source, output) {
            Ok(more) => more,
            Err(e) => {
                error!("Stream '{}' failed: {e}", source.name);
                output.stop();
                source.state = PlaybackState::Stopped;
                source.release_codecs();
                return Keep::Drop;
            },
        };
        if more {
            return Keep::Watching;
        }

        if source.next_codec.is_none() {
            ctx.prepare_next(source);
        }
        if output.is_playing() {
            return Keep::Watching;
        }

        if !source.eos_signalled {
            source.eos_signalled = true;
            self.events.publish(SoundEvent::EndOfStream {
                source: source.name.clone(),
                queued: source.sequence.len(),
            });
        }

        if source.fade.is_fading_out() {
            if source.looping {
                // keep the sound going under the fade
                source.pre_load = true;
            }
            return Keep::Watching;
        }

        if source.looping {
            source.advance_sequence();
            source.pre_load = true;
            Keep::Watching
        } else if source.advance_sequence() {
            source.pre_load = true;
            Keep::Watching
        } else {
            debug!("Stream '{}' finished", source.name);
            source.state = PlaybackState::Stopped;
            source.release_codecs();
            Keep::Drop
        }
    }
}

/// Body of the stream thread.
pub(crate) fn run_stream_thread(shared: Arc<Shared>, signal: Arc<Signal>, kill: Arc<AtomicBool>) {
    let config = shared.state.lock().library.config().clone();
    debug!("Stream thread started");
    signal.wait(config.idle_timeout());

    while !killed(&kill) {
        let watching = shared.state.lock().library.stream_pass(Instant::now());
        if killed(&kill) {
            break;
        }
        if watching {
            signal.wait(config.stream_poll());
        } else {
            signal.wait(config.idle_timeout());
        }
    }
    debug!("Stream thread exiting");
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::backend::ChannelKind;
    use crate::source::SourceSpec;
    use crate::spatial::AttenuationModel;
    use crate::test_support::{mock_library, mock_library_with_chunks};

    fn music(looping: bool) -> SourceSpec {
        SourceSpec::new("music.mock")
            .with_streaming(true)
            .with_looping(looping)
            .with_attenuation(AttenuationModel::None)
    }

    fn eos_count(library: &Library) -> usize {
        library
            .events
            .drain()
            .iter()
            .filter(|e| matches!(e, SoundEvent::EndOfStream { .. }))
            .count()
    }

    #[test]
    fn test_first_pass_queues_initial_buffers() {
        let (mut library, probe, codec) = mock_library(SoundConfig::default());
        library.new_source("music", music(false)).expect("source");
        library.play("music").expect("play");
        assert!(library.is_playing("music"));
        assert_eq!(library.watched_count(), 1);

        assert!(library.stream_pass(Instant::now()));
        let channel = probe.channel(ChannelKind::Streaming, 0);
        assert_eq!(channel.queued.len(), 3);
        assert!(channel.playing);
        assert_eq!(codec.inits(), 1);
    }

    #[test]
    fn test_refill_after_processing() {
        let (mut library, probe, _codec) = mock_library_with_chunks(SoundConfig::default(), 10);
        library.new_source("music", music(false)).expect("source");
        library.play("music").expect("play");
        library.stream_pass(Instant::now());

        probe.consume(ChannelKind::Streaming, 0, 2);
        library.stream_pass(Instant::now());
        assert_eq!(probe.channel(ChannelKind::Streaming, 0).queued.len(), 3);
        assert_eq!(probe.channel(ChannelKind::Streaming, 0).total_queued, 5);
    }

    #[test]
    fn test_non_looping_stream_finishes_once() {
        let (mut library, probe, codec) = mock_library_with_chunks(SoundConfig::default(), 2);
        library.new_source("music", music(false)).expect("source");
        library.play("music").expect("play");

        // two chunks: exhausted on the first pass but still playing
        assert!(library.stream_pass(Instant::now()));
        assert_eq!(eos_count(&library), 0);

        probe.drain(ChannelKind::Streaming, 0);
        assert!(!library.stream_pass(Instant::now()));
        assert_eq!(eos_count(&library), 1);
        assert!(!library.is_playing("music"));
        assert_eq!(
            library.source_snapshot("music").map(|s| s.state),
            Some(PlaybackState::Stopped)
        );
        assert_eq!(codec.cleanups(), codec.inits());
    }

    #[test]
    fn test_looping_stream_restarts_with_one_eos_per_loop() {
        let (mut library, probe, codec) = mock_library_with_chunks(SoundConfig::default(), 2);
        library.new_source("music", music(true)).expect("source");
        library.play("music").expect("play");

        for iteration in 1..=3 {
            library.stream_pass(Instant::now());
            // still playing buffered audio: no event yet
            library.stream_pass(Instant::now());
            assert_eq!(eos_count(&library), 0);

            probe.drain(ChannelKind::Streaming, 0);
            assert!(library.stream_pass(Instant::now()));
            assert_eq!(eos_count(&library), 1, "iteration {iteration}");
            // a second pass before the restart does not repeat the event
            assert_eq!(eos_count(&library), 0);
        }
        assert!(library.is_playing("music"));
        assert_eq!(codec.inits(), 3);
    }

    #[test]
    fn test_sequence_advances_with_pre_read() {
        let (mut library, probe, codec) = mock_library_with_chunks(SoundConfig::default(), 2);
        library.new_source("music", music(false)).expect("source");
        library
            .queue_sound("music", "second.mock".into())
            .expect("queue");
        library.play("music").expect("play");

        library.stream_pass(Instant::now());
        // exhausted on the first pass: the next sound is opened ahead
        assert_eq!(codec.inits(), 2);

        probe.drain(ChannelKind::Streaming, 0);
        library.stream_pass(Instant::now());
        let events = library.events.drain();
        assert!(events.contains(&SoundEvent::EndOfStream {
            source: "music".into(),
            queued: 1
        }));
        assert_eq!(
            library
                .source_snapshot("music")
                .and_then(|s| s.sound)
                .map(|s| s.identifier().to_string()),
            Some("second.mock".to_string())
        );

        // adopting the pre-read decoder does not open another one
        library.stream_pass(Instant::now());
        assert_eq!(codec.inits(), 2);
        assert!(probe.channel(ChannelKind::Streaming, 0).playing);
    }

    #[test]
    fn test_fade_out_completion_stops_without_next() {
        let (mut library, probe, _codec) = mock_library_with_chunks(SoundConfig::default(), 50);
        library.new_source("music", music(true)).expect("source");
        library.play("music").expect("play");
        library.stream_pass(Instant::now());

        library.fade_out("music", None, 0).expect("fade");
        assert!(!library.stream_pass(Instant::now() + Duration::from_millis(1)));
        assert!(!library.is_playing("music"));
        assert!(!probe.channel(ChannelKind::Streaming, 0).playing);
    }

    #[test]
    fn test_fade_completion_preempts_sequence_advance() {
        let (mut library, probe, _codec) = mock_library_with_chunks(SoundConfig::default(), 2);
        library.new_source("music", music(false)).expect("source");
        library.play("music").expect("play");
        library.stream_pass(Instant::now());

        library
            .fade_out_in("music", "next.mock".into(), 0, 0)
            .expect("fade");
        library.queue_sound("music", "later.mock".into()).expect("queue");
        probe.drain(ChannelKind::Streaming, 0);
        library.stream_pass(Instant::now() + Duration::from_millis(1));

        // the fade moved to "next" exactly once; "later" is still queued
        let snapshot = library.source_snapshot("music").expect("source");
        assert_eq!(snapshot.sound.map(|s| s.identifier().to_string()), Some("next.mock".into()));
        assert_eq!(snapshot.sequence.len(), 1);
    }

    #[test]
    fn test_culled_looping_stream_marked_for_replay() {
        let (mut library, _probe, _codec) = mock_library(SoundConfig::default());
        library.new_source("music", music(true)).expect("source");
        library.play("music").expect("play");
        library.stream_pass(Instant::now());

        library.cull("music").expect("cull");
        assert!(!library.stream_pass(Instant::now()));
        assert!(library.sources.get("music").is_some_and(|s| s.to_play));
        assert_eq!(library.watched_count(), 0);
        assert!(!library.is_playing("music"));
    }

    #[test]
    fn test_reactivated_looping_stream_resumes() {
        let (mut library, probe, codec) = mock_library(SoundConfig::default());
        library.new_source("music", music(true)).expect("source");
        library.play("music").expect("play");
        library.stream_pass(Instant::now());

        library.cull("music").expect("cull");
        library.stream_pass(Instant::now());
        probe.drain(ChannelKind::Streaming, 0);

        library.activate("music").expect("activate");
        library.replay_sources();
        assert_eq!(library.watched_count(), 1);
        assert!(library.is_playing("music"));

        assert!(library.stream_pass(Instant::now()));
        let channel = probe.channel(ChannelKind::Streaming, 0);
        assert_eq!(channel.queued.len(), 3);
        assert!(channel.playing);
        assert_eq!(codec.inits(), 2);
        assert!(library.sources.get("music").is_some_and(|s| !s.to_play));
    }

    #[test]
    fn test_culled_one_shot_stream_stops() {
        let (mut library, _probe, codec) = mock_library(SoundConfig::default());
        library.new_source("music", music(false)).expect("source");
        library.play("music").expect("play");
        library.stream_pass(Instant::now());

        library.cull("music").expect("cull");
        assert!(!library.stream_pass(Instant::now()));
        assert!(!library.is_playing("music"));
        assert!(library.sources.get("music").is_some_and(|s| !s.to_play));
        assert_eq!(codec.cleanups(), codec.inits());
    }

    #[test]
    fn test_failed_next_sound_is_skipped_once() {
        let (mut library, probe, codec) = mock_library_with_chunks(SoundConfig::default(), 2);
        library.new_source("music", music(false)).expect("source");
        library.queue_sound("music", "broken.mock".into()).expect("queue");
        library.queue_sound("music", "later.mock".into()).expect("queue");
        library.play("music").expect("play");

        library.stream_pass(Instant::now());
        let sequence = library.source_snapshot("music").map(|s| s.sequence.len());
        assert_eq!(sequence, Some(1));

        // the following pass reads ahead the sound after the broken one
        library.stream_pass(Instant::now());
        assert_eq!(codec.inits(), 2);

        probe.drain(ChannelKind::Streaming, 0);
        library.stream_pass(Instant::now());
        assert_eq!(
            library
                .source_snapshot("music")
                .and_then(|s| s.sound)
                .map(|s| s.identifier().to_string()),
            Some("later.mock".to_string())
        );
        assert!(library.is_playing("music"));
    }

    #[test]
    fn test_rewound_paused_stream_restarts_on_resume() {
        let (mut library, probe, codec) = mock_library(SoundConfig::default());
        library.new_source("music", music(false)).expect("source");
        library.play("music").expect("play");
        library.stream_pass(Instant::now());

        library.pause("music").expect("pause");
        library.rewind("music").expect("rewind");
        library.play("music").expect("resume");
        library.stream_pass(Instant::now());
        library.stream_pass(Instant::now());

        assert!(library.is_playing("music"));
        assert_eq!(
            library.source_snapshot("music").map(|s| s.state),
            Some(PlaybackState::Playing)
        );
        assert!(probe.channel(ChannelKind::Streaming, 0).playing);
        assert_eq!(codec.inits(), 2);
        assert_eq!(eos_count(&library), 0);
    }

    #[test]
    fn test_removed_source_dropped_from_watch() {
        let (mut library, _probe, _codec) = mock_library(SoundConfig::default());
        library.new_source("music", music(true)).expect("source");
        library.play("music").expect("play");
        library.remove_source("music").expect("remove");
        assert!(!library.stream_pass(Instant::now()));
    }

    #[test]
    fn test_watch_replaces_stream_on_same_channel() {
        let config = SoundConfig::default().with_channels(2, 1);
        let (mut library, _probe, _codec) = mock_library(config);
        library.new_source("a", music(true)).expect("source");
        library.new_source("b", music(true)).expect("source");
        library.play("a").expect("play");
        library.stream_pass(Instant::now());
        library.play("b").expect("play");

        assert_eq!(library.watched_count(), 1);
        assert!(!library.is_playing("a"));
        assert!(library.is_playing("b"));
    }

    #[test]
    fn test_decode_failure_stops_only_that_stream() {
        let (mut library, _probe, _codec) = mock_library(SoundConfig::default().with_channels(2, 2));
        library
            .new_source("bad", SourceSpec::new("broken.mock").with_streaming(true))
            .expect("source");
        library.new_source("good", music(true)).expect("source");
        library.play("bad").expect("play");
        library.play("good").expect("play");

        assert!(library.stream_pass(Instant::now()));
        assert!(!library.is_playing("bad"));
        assert!(library.is_playing("good"));
    }
}
