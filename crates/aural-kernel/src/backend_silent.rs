//! Silent backend.
//!
//! Produces no sound but keeps a real-time clock per channel, so buffers
//! finish, streams drain and `is_playing` reports the same thing a device
//! would. Always available; used when no audio device can be opened.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use tracing::debug;

use crate::backend::{Backend, ChannelKind, ChannelOutput, SILENT_BACKEND};
use crate::error::SoundResult;
use crate::resource::SoundBuffer;

/// Backend that discards audio.
#[derive(Debug, Default)]
pub struct SilentBackend {
    channels_created: usize,
}

impl SilentBackend {
    /// Create the backend.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl Backend for SilentBackend {
    fn name(&self) -> &str {
        SILENT_BACKEND
    }

    fn create_channel(&mut self, kind: ChannelKind) -> SoundResult<Box<dyn ChannelOutput>> {
        self.channels_created += 1;
        Ok(Box::new(SilentChannel::new(kind)))
    }

    fn cleanup(&mut self) {
        debug!("Silent backend released {} channels", self.channels_created);
        self.channels_created = 0;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ClockState {
    Stopped,
    Playing,
    Paused,
}

/// Channel that consumes buffers at their natural duration.
#[derive(Debug)]
pub struct SilentChannel {
    kind: ChannelKind,
    state: ClockState,
    /// Length of the attached buffer (normal channels).
    clip: Option<Duration>,
    /// Durations of queued chunks (streaming channels).
    pending: VecDeque<Duration>,
    looping: bool,
    pitch: f32,
    gain: f32,
    /// Position within the clip or the front chunk as of `resumed`.
    offset: Duration,
    /// When the clock last started running.
    resumed: Option<Instant>,
    /// Played time accumulated before `resumed`.
    played: Duration,
    processed: usize,
}

impl SilentChannel {
    /// Create an idle channel.
    #[must_use]
    pub fn new(kind: ChannelKind) -> Self {
        Self {
            kind,
            state: ClockState::Stopped,
            clip: None,
            pending: VecDeque::new(),
            looping: false,
            pitch: 1.0,
            gain: 1.0,
            offset: Duration::ZERO,
            resumed: None,
            played: Duration::ZERO,
            processed: 0,
        }
    }

    /// Current output gain.
    #[must_use]
    pub const fn gain(&self) -> f32 {
        self.gain
    }

    fn running_at(&self, now: Instant) -> Duration {
        self.resumed
            .map(|t| now.saturating_duration_since(t).mul_f32(self.pitch))
            .unwrap_or_default()
    }

    /// Fold elapsed time into the position and retire finished buffers.
    fn settle_at(&mut self, now: Instant) {
        if self.state != ClockState::Playing {
            return;
        }
        let run = self.running_at(now);
        self.offset += run;
        self.played += run;
        self.resumed = Some(now);

        match self.kind {
            ChannelKind::Streaming => {
                while let Some(&front) = self.pending.front() {
                    if self.offset < front {
                        break;
                    }
                    self.offset -= front;
                    self.pending.pop_front();
                    self.processed += 1;
                }
                if self.pending.is_empty() {
                    self.halt();
                }
            },
            ChannelKind::Normal => match self.clip {
                Some(len) if self.looping && !len.is_zero() => {
                    let nanos = self.offset.as_nanos() % len.as_nanos();
                    self.offset = Duration::from_nanos(u64::try_from(nanos).unwrap_or(0));
                },
                Some(len) if self.offset < len => {},
                _ => self.halt(),
            },
        }
    }

    fn halt(&mut self) {
        self.state = ClockState::Stopped;
        self.resumed = None;
        self.offset = Duration::ZERO;
    }

    fn is_playing_at(&self, now: Instant) -> bool {
        if self.state != ClockState::Playing {
            return false;
        }
        let position = self.offset + self.running_at(now);
        match self.kind {
            ChannelKind::Streaming => position < self.pending.iter().sum::<Duration>(),
            ChannelKind::Normal => match self.clip {
                Some(len) => (self.looping && !len.is_zero()) || position < len,
                None => false,
            },
        }
    }

    fn processed_at(&mut self, now: Instant) -> usize {
        self.settle_at(now);
        std::mem::take(&mut self.processed)
    }
}

impl ChannelOutput for SilentChannel {
    fn kind(&self) -> ChannelKind {
        self.kind
    }

    fn attach(&mut self, buffer: &SoundBuffer) -> SoundResult<()> {
        self.stop();
        self.clip = Some(buffer.duration());
        Ok(())
    }

    fn queue(&mut self, buffer: &SoundBuffer) -> SoundResult<()> {
        self.settle_at(Instant::now());
        self.pending.push_back(buffer.duration());
        Ok(())
    }

    fn processed(&mut self) -> usize {
        self.processed_at(Instant::now())
    }

    fn queued(&self) -> usize {
        self.pending.len()
    }

    fn set_looping(&mut self, looping: bool) {
        self.settle_at(Instant::now());
        self.looping = looping;
    }

    fn set_gain(&mut self, gain: f32) {
        self.gain = gain.clamp(0.0, 1.0);
    }

    fn set_pan(&mut self, _pan: f32) {}

    fn set_pitch(&mut self, pitch: f32) {
        self.settle_at(Instant::now());
        self.pitch = pitch.max(0.0);
    }

    fn play(&mut self) {
        let now = Instant::now();
        match self.state {
            ClockState::Playing => {},
            ClockState::Paused => {
                self.state = ClockState::Playing;
                self.resumed = Some(now);
            },
            ClockState::Stopped => {
                self.offset = Duration::ZERO;
                if self.kind == ChannelKind::Normal {
                    self.played = Duration::ZERO;
                }
                self.state = ClockState::Playing;
                self.resumed = Some(now);
            },
        }
    }

    fn pause(&mut self) {
        self.settle_at(Instant::now());
        if self.state == ClockState::Playing {
            self.state = ClockState::Paused;
            self.resumed = None;
        }
    }

    fn stop(&mut self) {
        self.halt();
        self.pending.clear();
        self.processed = 0;
    }

    fn rewind(&mut self) {
        self.settle_at(Instant::now());
        self.offset = Duration::ZERO;
        self.played = Duration::ZERO;
        if self.state == ClockState::Playing {
            self.resumed = Some(Instant::now());
        }
    }

    fn flush(&mut self) {
        self.pending.clear();
        self.offset = Duration::ZERO;
        self.processed = 0;
    }

    fn is_playing(&self) -> bool {
        self.is_playing_at(Instant::now())
    }

    fn millis_played(&self) -> f32 {
        (self.played + self.running_at(Instant::now())).as_secs_f32() * 1000.0
    }

    fn close(&mut self) {
        self.stop();
        self.clip = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::AudioFormat;

    /// 8 kHz mono 16-bit: 160 bytes is 10 ms.
    fn chunk(millis: usize) -> SoundBuffer {
        SoundBuffer::new(AudioFormat::new(8000, 1, 16), vec![0u8; millis * 16])
    }

    const MS: Duration = Duration::from_millis(1);

    #[test]
    fn test_normal_clip_finishes() {
        let mut channel = SilentChannel::new(ChannelKind::Normal);
        channel.attach(&chunk(10)).expect("attach");
        channel.play();
        let start = Instant::now();

        assert!(channel.is_playing_at(start));
        channel.settle_at(start + 50 * MS);
        assert!(!channel.is_playing_at(start + 50 * MS));
    }

    #[test]
    fn test_looping_clip_keeps_playing() {
        let mut channel = SilentChannel::new(ChannelKind::Normal);
        channel.attach(&chunk(10)).expect("attach");
        channel.set_looping(true);
        channel.play();
        let later = Instant::now() + 95 * MS;

        channel.settle_at(later);
        assert!(channel.is_playing_at(later));
        assert!(channel.offset < 10 * MS);
    }

    #[test]
    fn test_stream_consumes_in_order() {
        let mut channel = SilentChannel::new(ChannelKind::Streaming);
        for _ in 0..3 {
            channel.queue(&chunk(10)).expect("queue");
        }
        channel.play();
        let start = Instant::now();

        assert_eq!(channel.processed_at(start + 25 * MS), 2);
        assert_eq!(channel.queued(), 1);
        assert!(channel.is_playing_at(start + 25 * MS));

        // counter resets after being read
        assert_eq!(channel.processed_at(start + 25 * MS), 0);

        assert_eq!(channel.processed_at(start + 40 * MS), 1);
        assert!(!channel.is_playing_at(start + 40 * MS));
    }

    #[test]
    fn test_pause_freezes_clock() {
        let mut channel = SilentChannel::new(ChannelKind::Normal);
        channel.attach(&chunk(10)).expect("attach");
        channel.play();
        channel.pause();
        let later = Instant::now() + 100 * MS;
        channel.settle_at(later);
        assert!(!channel.is_playing_at(later));
        assert_eq!(channel.state, ClockState::Paused);

        channel.play();
        assert!(channel.is_playing_at(Instant::now()));
    }

    #[test]
    fn test_stop_and_flush_clear_queue() {
        let mut channel = SilentChannel::new(ChannelKind::Streaming);
        channel.queue(&chunk(10)).expect("queue");
        channel.queue(&chunk(10)).expect("queue");
        channel.flush();
        assert_eq!(channel.queued(), 0);

        channel.queue(&chunk(10)).expect("queue");
        channel.play();
        channel.stop();
        assert_eq!(channel.queued(), 0);
        assert!(!channel.is_playing());
    }

    #[test]
    fn test_backend_creates_channels() {
        let mut backend = SilentBackend::new();
        let channel = backend.create_channel(ChannelKind::Streaming).expect("channel");
        assert_eq!(channel.kind(), ChannelKind::Streaming);
        assert_eq!(backend.name(), SILENT_BACKEND);
        backend.cleanup();
    }
}
