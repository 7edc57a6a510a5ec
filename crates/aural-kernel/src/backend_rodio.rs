//! Rodio output backend.
//!
//! `rodio::OutputStream` must stay on the thread that opened it, so a small
//! device thread owns the stream for the backend's lifetime and hands back
//! the `Send` handle that sinks are created from. Each channel is one
//! `Sink`; stopping, flushing or rewinding replaces the sink because a
//! stopped sink cannot be restarted.

use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, Sender};
use rodio::buffer::SamplesBuffer;
use rodio::{OutputStream, OutputStreamHandle, Sink, Source};
use tracing::{debug, info, warn};

use crate::backend::{Backend, ChannelKind, ChannelOutput};
use crate::error::{SoundError, SoundResult};
use crate::resource::SoundBuffer;

const BACKEND_NAME: &str = "rodio";

fn unavailable(reason: impl ToString) -> SoundError {
    SoundError::BackendUnavailable {
        name: BACKEND_NAME.to_string(),
        reason: reason.to_string(),
    }
}

/// Backend playing through the default output device.
pub struct RodioBackend {
    handle: OutputStreamHandle,
    shutdown: Option<Sender<()>>,
    device_thread: Option<JoinHandle<()>>,
}

impl RodioBackend {
    /// Open the default output device.
    pub fn open() -> SoundResult<Self> {
        let (ready_tx, ready_rx) = bounded(1);
        let (shutdown_tx, shutdown_rx) = bounded::<()>(1);

        let device_thread = thread::Builder::new()
            .name("aural-rodio".to_string())
            .spawn(move || {
                let (_stream, handle) = match OutputStream::try_default() {
                    Ok(pair) => pair,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e.to_string()));
                        return;
                    },
                };
                if ready_tx.send(Ok(handle)).is_err() {
                    return;
                }
                // Park until the backend is cleaned up; the stream closes on drop.
                let _ = shutdown_rx.recv();
                debug!("Rodio device thread exiting");
            })?;

        let handle = match ready_rx.recv() {
            Ok(Ok(handle)) => handle,
            Ok(Err(reason)) => {
                let _ = device_thread.join();
                return Err(unavailable(reason));
            },
            Err(_) => {
                let _ = device_thread.join();
                return Err(unavailable("device thread exited"));
            },
        };

        info!("Opened rodio output device");
        Ok(Self {
            handle,
            shutdown: Some(shutdown_tx),
            device_thread: Some(device_thread),
        })
    }
}

impl Backend for RodioBackend {
    fn name(&self) -> &str {
        BACKEND_NAME
    }

    fn create_channel(&mut self, kind: ChannelKind) -> SoundResult<Box<dyn ChannelOutput>> {
        Ok(Box::new(RodioChannel::new(kind, self.handle.clone())?))
    }

    fn cleanup(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        if let Some(thread) = self.device_thread.take() {
            if thread.join().is_err() {
                warn!("Rodio device thread panicked");
            }
        }
    }
}

impl Drop for RodioBackend {
    fn drop(&mut self) {
        self.cleanup();
    }
}

/// One rodio sink.
struct RodioChannel {
    kind: ChannelKind,
    handle: OutputStreamHandle,
    sink: Sink,
    clip: Option<SoundBuffer>,
    /// Sources appended to the sink and not yet counted as processed.
    appended: usize,
    looping: bool,
    gain: f32,
    pitch: f32,
    played: Duration,
    resumed: Option<Instant>,
}

impl RodioChannel {
    fn new(kind: ChannelKind, handle: OutputStreamHandle) -> SoundResult<Self> {
        let sink = Sink::try_new(&handle).map_err(unavailable)?;
        sink.pause();
        Ok(Self {
            kind,
            handle,
            sink,
            clip: None,
            appended: 0,
            looping: false,
            gain: 1.0,
            pitch: 1.0,
            played: Duration::ZERO,
            resumed: None,
        })
    }

    /// Replace the sink with a fresh, paused one carrying the same settings.
    fn reset_sink(&mut self) {
        self.sink.stop();
        match Sink::try_new(&self.handle) {
            Ok(sink) => {
                sink.pause();
                sink.set_volume(self.gain);
                sink.set_speed(self.pitch);
                self.sink = sink;
            },
            Err(e) => warn!("Failed to recreate rodio sink: {e}"),
        }
        self.appended = 0;
        self.played = Duration::ZERO;
        self.resumed = None;
    }

    fn samples(buffer: &SoundBuffer) -> SamplesBuffer<i16> {
        let format = buffer.format();
        SamplesBuffer::new(format.channels, format.sample_rate, buffer.to_i16_samples())
    }

    fn freeze_clock(&mut self) {
        if let Some(t) = self.resumed.take() {
            self.played += t.elapsed().mul_f32(self.pitch);
        }
    }
}

impl ChannelOutput for RodioChannel {
    fn kind(&self) -> ChannelKind {
        self.kind
    }

    fn attach(&mut self, buffer: &SoundBuffer) -> SoundResult<()> {
        self.reset_sink();
        self.clip = Some(buffer.clone());
        Ok(())
    }

    fn queue(&mut self, buffer: &SoundBuffer) -> SoundResult<()> {
        self.sink.append(Self::samples(buffer));
        self.appended += 1;
        Ok(())
    }

    fn processed(&mut self) -> usize {
        let remaining = self.sink.len();
        let done = self.appended.saturating_sub(remaining);
        self.appended = remaining;
        done
    }

    fn queued(&self) -> usize {
        self.sink.len()
    }

    fn set_looping(&mut self, looping: bool) {
        self.looping = looping;
    }

    fn set_gain(&mut self, gain: f32) {
        self.gain = gain.clamp(0.0, 1.0);
        self.sink.set_volume(self.gain);
    }

    fn set_pan(&mut self, _pan: f32) {}

    fn set_pitch(&mut self, pitch: f32) {
        self.freeze_clock();
        self.pitch = pitch;
        self.sink.set_speed(pitch);
    }

    fn play(&mut self) {
        if self.kind == ChannelKind::Normal && self.sink.empty() {
            if let Some(clip) = &self.clip {
                let source = Self::samples(clip);
                if self.looping {
                    self.sink.append(source.repeat_infinite());
                } else {
                    self.sink.append(source);
                }
                self.played = Duration::ZERO;
            }
        }
        self.sink.play();
        if self.resumed.is_none() {
            self.resumed = Some(Instant::now());
        }
    }

    fn pause(&mut self) {
        self.sink.pause();
        self.freeze_clock();
    }

    fn stop(&mut self) {
        self.reset_sink();
    }

    fn rewind(&mut self) {
        let playing = self.is_playing();
        self.reset_sink();
        if playing {
            self.play();
        }
    }

    fn flush(&mut self) {
        self.reset_sink();
    }

    fn is_playing(&self) -> bool {
        !self.sink.is_paused() && !self.sink.empty()
    }

    fn millis_played(&self) -> f32 {
        let running = self
            .resumed
            .map(|t| t.elapsed().mul_f32(self.pitch))
            .unwrap_or_default();
        (self.played + running).as_secs_f32() * 1000.0
    }

    fn close(&mut self) {
        self.sink.stop();
        self.clip = None;
        self.appended = 0;
    }
}
