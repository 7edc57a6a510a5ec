//! Deterministic backend and codec doubles for unit tests.

use std::collections::VecDeque;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::backend::{Backend, ChannelKind, ChannelOutput};
use crate::codec::{Codec, CodecRegistry};
use crate::config::SoundConfig;
use crate::error::{SoundError, SoundResult};
use crate::events::EventBus;
use crate::library::Library;
use crate::listener::ListenerData;
use crate::resource::{AudioFormat, SoundBuffer};

/// Bytes in one 10 ms mock chunk (8 kHz mono 16-bit).
pub const CHUNK_BYTES: usize = 160;

/// Everything a mock channel has been told.
#[derive(Debug, Clone, Default)]
pub struct MockChannelState {
    pub attached: Option<SoundBuffer>,
    pub queued: VecDeque<SoundBuffer>,
    pub processed_pending: usize,
    pub playing: bool,
    pub paused: bool,
    pub looping: bool,
    pub gain: f32,
    pub pan: f32,
    pub pitch: f32,
    pub plays: usize,
    pub attaches: usize,
    pub stops: usize,
    pub closed: bool,
    pub total_queued: usize,
    pub millis: f32,
}

#[derive(Debug, Default)]
struct ProbeInner {
    normal: Vec<MockChannelState>,
    streaming: Vec<MockChannelState>,
    listener_updates: usize,
    cleanups: usize,
}

impl ProbeInner {
    fn slots(&mut self, kind: ChannelKind) -> &mut Vec<MockChannelState> {
        match kind {
            ChannelKind::Normal => &mut self.normal,
            ChannelKind::Streaming => &mut self.streaming,
        }
    }
}

/// Test-side handle onto a [`MockBackend`].
#[derive(Debug, Clone, Default)]
pub struct MockProbe {
    inner: Arc<Mutex<ProbeInner>>,
}

impl MockProbe {
    pub fn channel(&self, kind: ChannelKind, index: usize) -> MockChannelState {
        self.inner.lock().slots(kind)[index].clone()
    }

    fn with<R>(&self, kind: ChannelKind, index: usize, f: impl FnOnce(&mut MockChannelState) -> R) -> R {
        f(&mut self.inner.lock().slots(kind)[index])
    }

    /// The clip (or every queued chunk) has played out.
    pub fn finish(&self, kind: ChannelKind, index: usize) {
        self.drain(kind, index);
    }

    /// Play every queued chunk; the channel underruns.
    pub fn drain(&self, kind: ChannelKind, index: usize) {
        self.with(kind, index, |state| {
            consume_chunks(state, usize::MAX);
            state.playing = false;
        });
    }

    /// Play `count` queued chunks.
    pub fn consume(&self, kind: ChannelKind, index: usize, count: usize) {
        self.with(kind, index, |state| {
            consume_chunks(state, count);
            if state.queued.is_empty() {
                state.playing = false;
            }
        });
    }

    pub fn listener_updates(&self) -> usize {
        self.inner.lock().listener_updates
    }

    pub fn cleanups(&self) -> usize {
        self.inner.lock().cleanups
    }
}

fn consume_chunks(state: &mut MockChannelState, count: usize) {
    let n = count.min(state.queued.len());
    for buffer in state.queued.drain(..n) {
        state.millis += buffer.duration().as_secs_f32() * 1000.0;
    }
    state.processed_pending += n;
}

/// Backend whose channels only record what they are told.
#[derive(Debug, Default)]
pub struct MockBackend {
    probe: MockProbe,
}

impl MockBackend {
    pub fn new() -> (Self, MockProbe) {
        let probe = MockProbe::default();
        (
            Self {
                probe: probe.clone(),
            },
            probe,
        )
    }
}

impl Backend for MockBackend {
    fn name(&self) -> &str {
        "mock"
    }

    fn create_channel(&mut self, kind: ChannelKind) -> SoundResult<Box<dyn ChannelOutput>> {
        let index = {
            let mut inner = self.probe.inner.lock();
            let slots = inner.slots(kind);
            slots.push(MockChannelState {
                gain: 1.0,
                pitch: 1.0,
                ..MockChannelState::default()
            });
            slots.len() - 1
        };
        Ok(Box::new(MockChannel {
            kind,
            index,
            probe: self.probe.clone(),
        }))
    }

    fn set_listener(&mut self, _listener: &ListenerData) {
        self.probe.inner.lock().listener_updates += 1;
    }

    fn cleanup(&mut self) {
        self.probe.inner.lock().cleanups += 1;
    }
}

struct MockChannel {
    kind: ChannelKind,
    index: usize,
    probe: MockProbe,
}

impl MockChannel {
    fn with<R>(&self, f: impl FnOnce(&mut MockChannelState) -> R) -> R {
        self.probe.with(self.kind, self.index, f)
    }
}

impl ChannelOutput for MockChannel {
    fn kind(&self) -> ChannelKind {
        self.kind
    }

    fn attach(&mut self, buffer: &SoundBuffer) -> SoundResult<()> {
        self.with(|state| {
            state.attached = Some(buffer.clone());
            state.attaches += 1;
            state.playing = false;
            state.millis = 0.0;
        });
        Ok(())
    }

    fn queue(&mut self, buffer: &SoundBuffer) -> SoundResult<()> {
        self.with(|state| {
            state.queued.push_back(buffer.clone());
            state.total_queued += 1;
        });
        Ok(())
    }

    fn processed(&mut self) -> usize {
        self.with(|state| std::mem::take(&mut state.processed_pending))
    }

    fn queued(&self) -> usize {
        self.with(|state| state.queued.len())
    }

    fn set_looping(&mut self, looping: bool) {
        self.with(|state| state.looping = looping);
    }

    fn set_gain(&mut self, gain: f32) {
        self.with(|state| state.gain = gain);
    }

    fn set_pan(&mut self, pan: f32) {
        self.with(|state| state.pan = pan);
    }

    fn set_pitch(&mut self, pitch: f32) {
        self.with(|state| state.pitch = pitch);
    }

    fn play(&mut self) {
        let kind = self.kind;
        self.with(|state| {
            state.plays += 1;
            state.paused = false;
            state.playing = match kind {
                ChannelKind::Normal => state.attached.is_some(),
                ChannelKind::Streaming => !state.queued.is_empty(),
            };
        });
    }

    fn pause(&mut self) {
        self.with(|state| {
            if state.playing {
                state.playing = false;
                state.paused = true;
            }
        });
    }

    fn stop(&mut self) {
        let kind = self.kind;
        self.with(|state| {
            state.playing = false;
            state.paused = false;
            state.stops += 1;
            state.millis = 0.0;
            if kind == ChannelKind::Streaming {
                state.queued.clear();
                state.processed_pending = 0;
            }
        });
    }

    fn rewind(&mut self) {
        self.with(|state| state.millis = 0.0);
    }

    fn flush(&mut self) {
        self.with(|state| {
            state.queued.clear();
            state.processed_pending = 0;
        });
    }

    fn is_playing(&self) -> bool {
        self.with(|state| state.playing)
    }

    fn millis_played(&self) -> f32 {
        self.with(|state| state.millis)
    }

    fn close(&mut self) {
        self.with(|state| {
            state.closed = true;
            state.playing = false;
        });
    }
}

/// Counters shared by every codec built from one factory.
#[derive(Debug, Clone, Default)]
pub struct CodecProbe {
    inits: Arc<AtomicUsize>,
    cleanups: Arc<AtomicUsize>,
}

impl CodecProbe {
    pub fn inits(&self) -> usize {
        self.inits.load(Ordering::SeqCst)
    }

    pub fn cleanups(&self) -> usize {
        self.cleanups.load(Ordering::SeqCst)
    }
}

/// Codec that yields a fixed number of silent 10 ms chunks. Paths containing
/// `broken` fail to open.
#[derive(Debug)]
pub struct MockCodec {
    chunks: usize,
    remaining: usize,
    initialized: bool,
    eos: bool,
    probe: CodecProbe,
}

impl MockCodec {
    pub fn new(chunks: usize, probe: CodecProbe) -> Self {
        Self {
            chunks,
            remaining: 0,
            initialized: false,
            eos: false,
            probe,
        }
    }

    pub const fn format() -> AudioFormat {
        AudioFormat::new(8000, 1, 16)
    }

    /// One chunk of the mock format.
    pub fn chunk() -> SoundBuffer {
        SoundBuffer::new(Self::format(), vec![0_u8; CHUNK_BYTES])
    }

    /// An initialized codec and its probe.
    pub fn boxed(chunks: usize) -> (Box<dyn Codec>, CodecProbe) {
        let probe = CodecProbe::default();
        let mut codec = Self::new(chunks, probe.clone());
        codec.initialized = true;
        codec.remaining = chunks;
        probe.inits.fetch_add(1, Ordering::SeqCst);
        (Box::new(codec), probe)
    }
}

impl Codec for MockCodec {
    fn initialize(&mut self, path: &Path) -> SoundResult<()> {
        if path.to_string_lossy().contains("broken") {
            return Err(SoundError::decode(path.display().to_string(), "broken mock"));
        }
        self.initialized = true;
        self.remaining = self.chunks;
        self.eos = false;
        self.probe.inits.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn initialized(&self) -> bool {
        self.initialized
    }

    fn read(&mut self) -> SoundResult<Option<SoundBuffer>> {
        if !self.initialized {
            return Err(SoundError::decode("mock", "not initialized"));
        }
        if self.remaining == 0 {
            self.eos = true;
            return Ok(None);
        }
        self.remaining -= 1;
        Ok(Some(Self::chunk()))
    }

    fn read_all(&mut self) -> SoundResult<SoundBuffer> {
        let mut parts = Vec::new();
        while let Some(chunk) = self.read()? {
            parts.push(chunk);
        }
        Ok(SoundBuffer::concat(Self::format(), &parts))
    }

    fn end_of_stream(&self) -> bool {
        self.eos
    }

    fn audio_format(&self) -> Option<AudioFormat> {
        self.initialized.then(Self::format)
    }

    fn cleanup(&mut self) {
        if self.initialized {
            self.initialized = false;
            self.probe.cleanups.fetch_add(1, Ordering::SeqCst);
        }
    }
}

/// Registry whose `.mock` sounds are `chunks` long.
pub fn mock_codecs(chunks: usize) -> (CodecRegistry, CodecProbe) {
    let probe = CodecProbe::default();
    let mut codecs = CodecRegistry::new();
    let factory_probe = probe.clone();
    codecs.register("mock", move |_options| Box::new(MockCodec::new(chunks, factory_probe.clone())));
    (codecs, probe)
}

/// Library over a [`MockBackend`] whose `.mock` sounds are 8 chunks long.
pub fn mock_library(config: SoundConfig) -> (Library, MockProbe, CodecProbe) {
    mock_library_with_chunks(config, 8)
}

/// Library over a [`MockBackend`] whose `.mock` sounds are `chunks` long.
pub fn mock_library_with_chunks(config: SoundConfig, chunks: usize) -> (Library, MockProbe, CodecProbe) {
    let (backend, probe) = MockBackend::new();
    let (codecs, codec_probe) = mock_codecs(chunks);
    match Library::new(Box::new(backend), config, codecs, EventBus::default()) {
        Ok(library) => (library, probe, codec_probe),
        Err(e) => panic!("mock library: {e}"),
    }
}
