//! Sound Resources
//!
//! PCM formats, decoded buffers, references to sound files, and the cache of
//! fully decoded sounds used by non-streaming sources.
//!
//! - `AudioFormat`: sample rate, channel count, bit depth and byte order
//! - `SoundBuffer`: a block of raw PCM bytes in a known format
//! - `SoundRef`: an identifier plus the path it is decoded from
//! - `SoundBufferCache`: identifier-keyed store of loaded sounds

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

/// Default sample rate for generated or raw audio.
pub const DEFAULT_SAMPLE_RATE: u32 = 44100;

/// Default number of channels (stereo).
pub const DEFAULT_CHANNELS: u16 = 2;

/// Layout of raw PCM data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AudioFormat {
    /// Frames per second.
    pub sample_rate: u32,
    /// Interleaved channel count.
    pub channels: u16,
    /// Bits per sample: 8 (unsigned) or 16 (signed).
    pub bits_per_sample: u16,
    /// Whether 16-bit samples are stored big-endian.
    pub big_endian: bool,
}

impl Default for AudioFormat {
    fn default() -> Self {
        Self::new(DEFAULT_SAMPLE_RATE, DEFAULT_CHANNELS, 16)
    }
}

impl AudioFormat {
    /// Create a little-endian format.
    #[must_use]
    pub const fn new(sample_rate: u32, channels: u16, bits_per_sample: u16) -> Self {
        Self {
            sample_rate,
            channels,
            bits_per_sample,
            big_endian: false,
        }
    }

    /// Set the byte order.
    #[must_use]
    pub const fn with_big_endian(mut self, big_endian: bool) -> Self {
        self.big_endian = big_endian;
        self
    }

    /// Bytes used by one sample of one channel.
    #[must_use]
    pub const fn bytes_per_sample(&self) -> usize {
        if self.bits_per_sample <= 8 {
            1
        } else {
            2
        }
    }

    /// Bytes used by one frame (one sample for every channel).
    #[must_use]
    pub const fn bytes_per_frame(&self) -> usize {
        self.bytes_per_sample() * self.channels as usize
    }

    /// Whether the engine can play data in this format.
    #[must_use]
    pub const fn is_supported(&self) -> bool {
        self.sample_rate > 0
            && self.channels > 0
            && (self.bits_per_sample == 8 || self.bits_per_sample == 16)
    }

    /// Playback time of `bytes` bytes of data in this format.
    #[must_use]
    pub fn duration_of(&self, bytes: usize) -> Duration {
        let frame = self.bytes_per_frame();
        if frame == 0 || self.sample_rate == 0 {
            return Duration::ZERO;
        }
        let frames = (bytes / frame) as f64;
        Duration::from_secs_f64(frames / f64::from(self.sample_rate))
    }
}

/// Raw PCM data plus its format.
///
/// The byte payload is shared, so clones are cheap and a cached sound can be
/// handed to any number of channels.
#[derive(Clone, PartialEq, Eq)]
pub struct SoundBuffer {
    format: AudioFormat,
    data: Arc<[u8]>,
}

impl std::fmt::Debug for SoundBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SoundBuffer")
            .field("format", &self.format)
            .field("bytes", &self.data.len())
            .finish()
    }
}

impl SoundBuffer {
    /// Wrap PCM bytes.
    pub fn new(format: AudioFormat, data: impl Into<Arc<[u8]>>) -> Self {
        Self {
            format,
            data: data.into(),
        }
    }

    /// PCM layout.
    #[must_use]
    pub const fn format(&self) -> AudioFormat {
        self.format
    }

    /// Raw bytes.
    #[must_use]
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Size in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Whether the buffer holds no data.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Playback time.
    #[must_use]
    pub fn duration(&self) -> Duration {
        self.format.duration_of(self.data.len())
    }

    /// Decode the bytes into signed 16-bit samples.
    #[must_use]
    pub fn to_i16_samples(&self) -> Vec<i16> {
        if self.format.bytes_per_sample() == 1 {
            return self
                .data
                .iter()
                .map(|&b| (i16::from(b) - 128) << 8)
                .collect();
        }
        self.data
            .chunks_exact(2)
            .map(|pair| {
                let bytes = [pair[0], pair[1]];
                if self.format.big_endian {
                    i16::from_be_bytes(bytes)
                } else {
                    i16::from_le_bytes(bytes)
                }
            })
            .collect()
    }

    /// Copy with 16-bit samples byte-swapped and the format flag flipped.
    #[must_use]
    pub fn with_swapped_byte_order(&self) -> Self {
        if self.format.bytes_per_sample() == 1 {
            return self.clone();
        }
        let mut data = self.data.to_vec();
        for pair in data.chunks_exact_mut(2) {
            pair.swap(0, 1);
        }
        Self::new(
            self.format.with_big_endian(!self.format.big_endian),
            data,
        )
    }

    /// Join buffers of one format into a single buffer.
    #[must_use]
    pub fn concat(format: AudioFormat, parts: &[Self]) -> Self {
        let total = parts.iter().map(Self::len).sum();
        let mut data = Vec::with_capacity(total);
        for part in parts {
            data.extend_from_slice(part.data());
        }
        Self::new(format, data)
    }
}

/// A sound file reference: the identifier sounds are looked up by, and the
/// path the data is decoded from.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SoundRef {
    identifier: String,
    path: PathBuf,
}

impl SoundRef {
    /// Reference whose path is the identifier itself.
    pub fn new(identifier: impl Into<String>) -> Self {
        let identifier = identifier.into();
        let path = PathBuf::from(&identifier);
        Self { identifier, path }
    }

    /// Reference with an explicit location.
    pub fn with_path(identifier: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            identifier: identifier.into(),
            path: path.into(),
        }
    }

    /// Lookup key.
    #[must_use]
    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    /// Location as given.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Lower-case extension of the identifier, used to pick a codec.
    #[must_use]
    pub fn extension(&self) -> Option<String> {
        Path::new(&self.identifier)
            .extension()
            .or_else(|| self.path.extension())
            .and_then(|ext| ext.to_str())
            .map(str::to_ascii_lowercase)
    }

    /// Resolve the location against a base directory.
    #[must_use]
    pub fn resolve(&self, base: &Path) -> PathBuf {
        if self.path.is_absolute() || base.as_os_str().is_empty() {
            self.path.clone()
        } else {
            base.join(&self.path)
        }
    }
}

impl From<&str> for SoundRef {
    fn from(identifier: &str) -> Self {
        Self::new(identifier)
    }
}

impl From<String> for SoundRef {
    fn from(identifier: String) -> Self {
        Self::new(identifier)
    }
}

impl std::fmt::Display for SoundRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.identifier)
    }
}

/// Cache of fully decoded sounds, keyed by identifier.
#[derive(Debug, Clone, Default)]
pub struct SoundBufferCache {
    /// Cached buffers by identifier.
    buffers: HashMap<String, SoundBuffer>,
    /// Total cached size in bytes.
    total_size: usize,
}

impl SoundBufferCache {
    /// Create an empty cache.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Get a cached buffer.
    #[must_use]
    pub fn get(&self, identifier: &str) -> Option<&SoundBuffer> {
        self.buffers.get(identifier)
    }

    /// Check if an identifier is loaded.
    #[must_use]
    pub fn contains(&self, identifier: &str) -> bool {
        self.buffers.contains_key(identifier)
    }

    /// Add or replace a buffer.
    pub fn insert(&mut self, identifier: impl Into<String>, buffer: SoundBuffer) {
        let identifier = identifier.into();
        self.total_size += buffer.len();
        if let Some(old) = self.buffers.insert(identifier.clone(), buffer) {
            self.total_size -= old.len();
        }
        debug!("Cached sound '{}'", identifier);
    }

    /// Remove a buffer from the cache.
    pub fn remove(&mut self, identifier: &str) -> Option<SoundBuffer> {
        let buffer = self.buffers.remove(identifier)?;
        self.total_size -= buffer.len();
        debug!("Removed sound '{}'", identifier);
        Some(buffer)
    }

    /// Clear all cached buffers.
    pub fn clear(&mut self) {
        self.buffers.clear();
        self.total_size = 0;
    }

    /// Loaded identifiers, sorted.
    #[must_use]
    pub fn identifiers(&self) -> Vec<String> {
        let mut names: Vec<String> = self.buffers.keys().cloned().collect();
        names.sort();
        names
    }

    /// Get total cached size in bytes.
    #[must_use]
    pub const fn total_size(&self) -> usize {
        self.total_size
    }

    /// Get number of cached buffers.
    #[must_use]
    pub fn count(&self) -> usize {
        self.buffers.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_sizes() {
        let stereo16 = AudioFormat::new(44100, 2, 16);
        assert_eq!(stereo16.bytes_per_frame(), 4);
        assert!(stereo16.is_supported());

        let mono8 = AudioFormat::new(8000, 1, 8);
        assert_eq!(mono8.bytes_per_frame(), 1);
        assert_eq!(mono8.duration_of(8000), Duration::from_secs(1));

        assert!(!AudioFormat::new(44100, 2, 24).is_supported());
    }

    #[test]
    fn test_duration_of_partial_frames() {
        let format = AudioFormat::new(1000, 2, 16);
        // 4 bytes per frame; 6 bytes is one whole frame
        assert_eq!(format.duration_of(6), Duration::from_millis(1));
    }

    #[test]
    fn test_samples_little_endian() {
        let buffer = SoundBuffer::new(AudioFormat::new(44100, 1, 16), vec![0x01, 0x02, 0xff, 0xff]);
        assert_eq!(buffer.to_i16_samples(), vec![0x0201, -1]);
    }

    #[test]
    fn test_samples_8bit_unsigned() {
        let buffer = SoundBuffer::new(AudioFormat::new(8000, 1, 8), vec![128, 0, 255]);
        assert_eq!(buffer.to_i16_samples(), vec![0, -32768, 127 << 8]);
    }

    #[test]
    fn test_swap_byte_order() {
        let buffer = SoundBuffer::new(AudioFormat::new(44100, 1, 16), vec![0x01, 0x02]);
        let swapped = buffer.with_swapped_byte_order();
        assert!(swapped.format().big_endian);
        assert_eq!(swapped.data(), &[0x02, 0x01]);
        assert_eq!(swapped.to_i16_samples(), buffer.to_i16_samples());
    }

    #[test]
    fn test_concat() {
        let format = AudioFormat::new(8000, 1, 8);
        let a = SoundBuffer::new(format, vec![1, 2]);
        let b = SoundBuffer::new(format, vec![3]);
        let joined = SoundBuffer::concat(format, &[a, b]);
        assert_eq!(joined.data(), &[1, 2, 3]);
    }

    #[test]
    fn test_sound_ref_extension() {
        assert_eq!(SoundRef::new("Music/Theme.OGG").extension().as_deref(), Some("ogg"));
        assert_eq!(
            SoundRef::with_path("theme", "/tmp/theme.wav").extension().as_deref(),
            Some("wav")
        );
        assert_eq!(SoundRef::new("noext").extension(), None);
    }

    #[test]
    fn test_sound_ref_resolve() {
        let relative = SoundRef::new("beep.wav");
        assert_eq!(relative.resolve(Path::new("assets")), PathBuf::from("assets/beep.wav"));
        assert_eq!(relative.resolve(Path::new("")), PathBuf::from("beep.wav"));

        let absolute = SoundRef::with_path("beep", "/sounds/beep.wav");
        assert_eq!(absolute.resolve(Path::new("assets")), PathBuf::from("/sounds/beep.wav"));
    }

    #[test]
    fn test_cache_accounting() {
        let format = AudioFormat::default();
        let mut cache = SoundBufferCache::new();
        cache.insert("a", SoundBuffer::new(format, vec![0; 16]));
        cache.insert("b", SoundBuffer::new(format, vec![0; 8]));
        assert_eq!(cache.total_size(), 24);

        cache.insert("a", SoundBuffer::new(format, vec![0; 4]));
        assert_eq!(cache.total_size(), 12);
        assert_eq!(cache.count(), 2);

        assert!(cache.remove("b").is_some());
        assert_eq!(cache.total_size(), 4);
        assert_eq!(cache.identifiers(), vec!["a".to_string()]);

        cache.clear();
        assert_eq!(cache.count(), 0);
        assert_eq!(cache.total_size(), 0);
    }
}
