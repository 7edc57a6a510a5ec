//! Codecs
//!
//! A codec turns an encoded file into raw PCM, either one chunk at a time
//! (streaming sources) or all at once (pre-loaded sounds). Codecs are picked
//! by file extension from an explicit registry of factories.
//!
//! Built-in codecs:
//! - `WavCodec` ("wav"): 8 and 16-bit integer PCM through `hound`
//! - `RodioCodec` ("ogg", "mp3", "flac"; feature `rodio`): `rodio::Decoder`

use std::collections::HashMap;
use std::fmt;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use tracing::debug;

use crate::error::{SoundError, SoundResult};
use crate::resource::{AudioFormat, SoundBuffer, SoundRef};

/// Decoding limits handed to every codec.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CodecOptions {
    /// Bytes of PCM returned by one `read`.
    pub chunk_bytes: usize,
    /// Largest result `read_all` may produce.
    pub max_bytes: usize,
}

impl Default for CodecOptions {
    fn default() -> Self {
        Self {
            chunk_bytes: crate::config::DEFAULT_STREAMING_BUFFER_SIZE,
            max_bytes: crate::config::DEFAULT_MAX_FILE_SIZE,
        }
    }
}

/// Decoder capability.
pub trait Codec: Send {
    /// Open the file and read its header.
    fn initialize(&mut self, path: &Path) -> SoundResult<()>;

    /// Whether `initialize` succeeded and the codec has not been cleaned up.
    fn initialized(&self) -> bool;

    /// Decode the next chunk, or `None` once the stream is exhausted.
    fn read(&mut self) -> SoundResult<Option<SoundBuffer>>;

    /// Decode everything that remains into one buffer.
    fn read_all(&mut self) -> SoundResult<SoundBuffer>;

    /// Whether the last chunk has been read.
    fn end_of_stream(&self) -> bool;

    /// Format of the decoded data, once initialized.
    fn audio_format(&self) -> Option<AudioFormat>;

    /// Ask for big-endian 16-bit output. Codecs that cannot comply ignore it.
    fn set_reverse_byte_order(&mut self, _reverse: bool) {}

    /// Release the file handle and decoder state.
    fn cleanup(&mut self);
}

/// Constructs a codec.
pub type CodecFactory = Arc<dyn Fn(CodecOptions) -> Box<dyn Codec> + Send + Sync>;

/// Extension-keyed codec factories.
#[derive(Clone, Default)]
pub struct CodecRegistry {
    factories: HashMap<String, CodecFactory>,
}

impl fmt::Debug for CodecRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CodecRegistry")
            .field("extensions", &self.extensions())
            .finish()
    }
}

impl CodecRegistry {
    /// Empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in codecs.
    #[must_use]
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register("wav", |options| Box::new(WavCodec::new(options)));
        #[cfg(feature = "rodio")]
        for ext in ["ogg", "mp3", "flac"] {
            registry.register(ext, |options| Box::new(RodioCodec::new(options)));
        }
        registry
    }

    /// Register (or replace) the codec for an extension.
    pub fn register<F>(&mut self, extension: &str, factory: F)
    where
        F: Fn(CodecOptions) -> Box<dyn Codec> + Send + Sync + 'static,
    {
        self.factories
            .insert(extension.to_ascii_lowercase(), Arc::new(factory));
    }

    /// Whether an extension has a codec.
    #[must_use]
    pub fn supports(&self, extension: &str) -> bool {
        self.factories.contains_key(&extension.to_ascii_lowercase())
    }

    /// Registered extensions, sorted.
    #[must_use]
    pub fn extensions(&self) -> Vec<String> {
        let mut exts: Vec<String> = self.factories.keys().cloned().collect();
        exts.sort();
        exts
    }

    /// Create an uninitialized codec for a sound.
    pub fn create(&self, sound: &SoundRef, options: CodecOptions) -> SoundResult<Box<dyn Codec>> {
        let ext = sound
            .extension()
            .ok_or_else(|| SoundError::NoCodec(sound.identifier().to_string()))?;
        let factory = self
            .factories
            .get(&ext)
            .ok_or_else(|| SoundError::NoCodec(ext.clone()))?;
        Ok(factory(options))
    }

    /// Create and initialize a codec for a sound located at `path`.
    pub fn open(
        &self,
        sound: &SoundRef,
        path: &Path,
        options: CodecOptions,
        reverse_byte_order: bool,
    ) -> SoundResult<Box<dyn Codec>> {
        let mut codec = self.create(sound, options)?;
        codec.set_reverse_byte_order(reverse_byte_order);
        codec.initialize(path)?;
        debug!("Opened codec for '{}'", sound);
        Ok(codec)
    }
}

/// Drain a codec into a single buffer, enforcing the size cap.
fn read_remaining(codec: &mut dyn Codec, name: &str, max_bytes: usize) -> SoundResult<SoundBuffer> {
    let mut parts = Vec::new();
    let mut total = 0;
    while let Some(chunk) = codec.read()? {
        total += chunk.len();
        if total > max_bytes {
            return Err(SoundError::FileTooLarge {
                sound: name.to_string(),
                size: total,
                max: max_bytes,
            });
        }
        parts.push(chunk);
    }
    let format = codec
        .audio_format()
        .ok_or_else(|| SoundError::decode(name, "codec not initialized"))?;
    Ok(SoundBuffer::concat(format, &parts))
}

/// WAV decoder.
pub struct WavCodec {
    options: CodecOptions,
    reader: Option<hound::WavReader<BufReader<File>>>,
    format: Option<AudioFormat>,
    name: String,
    reverse: bool,
    eos: bool,
}

impl fmt::Debug for WavCodec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WavCodec")
            .field("name", &self.name)
            .field("format", &self.format)
            .field("eos", &self.eos)
            .finish_non_exhaustive()
    }
}

impl WavCodec {
    /// Create an unopened codec.
    #[must_use]
    pub fn new(options: CodecOptions) -> Self {
        Self {
            options,
            reader: None,
            format: None,
            name: String::new(),
            reverse: false,
            eos: false,
        }
    }
}

impl Codec for WavCodec {
    fn initialize(&mut self, path: &Path) -> SoundResult<()> {
        self.cleanup();
        self.name = path.display().to_string();

        let reader = hound::WavReader::open(path).map_err(|e| SoundError::decode(&self.name, e))?;
        let spec = reader.spec();
        if spec.sample_format != hound::SampleFormat::Int {
            return Err(SoundError::decode(&self.name, "floating point WAV is not supported"));
        }
        let format = AudioFormat::new(spec.sample_rate, spec.channels, spec.bits_per_sample)
            .with_big_endian(self.reverse && spec.bits_per_sample == 16);
        if !format.is_supported() {
            return Err(SoundError::decode(
                &self.name,
                format!("unsupported format: {} bits, {} channels", spec.bits_per_sample, spec.channels),
            ));
        }

        self.reader = Some(reader);
        self.format = Some(format);
        self.eos = false;
        Ok(())
    }

    fn initialized(&self) -> bool {
        self.reader.is_some()
    }

    fn read(&mut self) -> SoundResult<Option<SoundBuffer>> {
        let (Some(reader), Some(format)) = (self.reader.as_mut(), self.format) else {
            return Ok(None);
        };
        if self.eos {
            return Ok(None);
        }

        let frames = (self.options.chunk_bytes / format.bytes_per_frame()).max(1);
        let wanted = frames * usize::from(format.channels);
        let mut data = Vec::with_capacity(wanted * format.bytes_per_sample());
        let mut count = 0;

        if format.bits_per_sample == 8 {
            for sample in reader.samples::<i8>().take(wanted) {
                let sample = sample.map_err(|e| SoundError::decode(&self.name, e))?;
                data.push((i16::from(sample) + 128) as u8);
                count += 1;
            }
        } else {
            for sample in reader.samples::<i16>().take(wanted) {
                let sample = sample.map_err(|e| SoundError::decode(&self.name, e))?;
                let bytes = if format.big_endian {
                    sample.to_be_bytes()
                } else {
                    sample.to_le_bytes()
                };
                data.extend_from_slice(&bytes);
                count += 1;
            }
        }

        if count < wanted {
            self.eos = true;
        }
        if count == 0 {
            return Ok(None);
        }
        Ok(Some(SoundBuffer::new(format, data)))
    }

    fn read_all(&mut self) -> SoundResult<SoundBuffer> {
        let name = self.name.clone();
        let max_bytes = self.options.max_bytes;
        read_remaining(self, &name, max_bytes)
    }

    fn end_of_stream(&self) -> bool {
        self.eos
    }

    fn audio_format(&self) -> Option<AudioFormat> {
        self.format
    }

    fn set_reverse_byte_order(&mut self, reverse: bool) {
        self.reverse = reverse;
    }

    fn cleanup(&mut self) {
        self.reader = None;
        self.format = None;
        self.eos = true;
    }
}

/// Compressed-format decoder backed by `rodio::Decoder`.
#[cfg(feature = "rodio")]
pub struct RodioCodec {
    options: CodecOptions,
    decoder: Option<rodio::Decoder<BufReader<File>>>,
    format: Option<AudioFormat>,
    name: String,
    reverse: bool,
    eos: bool,
}

#[cfg(feature = "rodio")]
impl RodioCodec {
    /// Create an unopened codec.
    #[must_use]
    pub fn new(options: CodecOptions) -> Self {
        Self {
            options,
            decoder: None,
            format: None,
            name: String::new(),
            reverse: false,
            eos: false,
        }
    }
}

#[cfg(feature = "rodio")]
impl Codec for RodioCodec {
    fn initialize(&mut self, path: &Path) -> SoundResult<()> {
        use rodio::Source as _;

        self.cleanup();
        self.name = path.display().to_string();

        let file = File::open(path)?;
        let decoder = rodio::Decoder::new(BufReader::new(file))
            .map_err(|e| SoundError::decode(&self.name, e))?;
        self.format = Some(
            AudioFormat::new(decoder.sample_rate(), decoder.channels(), 16)
                .with_big_endian(self.reverse),
        );
        self.decoder = Some(decoder);
        self.eos = false;
        Ok(())
    }

    fn initialized(&self) -> bool {
        self.decoder.is_some()
    }

    fn read(&mut self) -> SoundResult<Option<SoundBuffer>> {
        let (Some(decoder), Some(format)) = (self.decoder.as_mut(), self.format) else {
            return Ok(None);
        };
        if self.eos {
            return Ok(None);
        }

        let wanted = (self.options.chunk_bytes / 2).max(usize::from(format.channels));
        let mut data = Vec::with_capacity(wanted * 2);
        let mut count = 0;
        for sample in decoder.by_ref().take(wanted) {
            let bytes = if format.big_endian {
                sample.to_be_bytes()
            } else {
                sample.to_le_bytes()
            };
            data.extend_from_slice(&bytes);
            count += 1;
        }

        if count < wanted {
            self.eos = true;
        }
        if count == 0 {
            return Ok(None);
        }
        Ok(Some(SoundBuffer::new(format, data)))
    }

    fn read_all(&mut self) -> SoundResult<SoundBuffer> {
        let name = self.name.clone();
        let max_bytes = self.options.max_bytes;
        read_remaining(self, &name, max_bytes)
    }

    fn end_of_stream(&self) -> bool {
        self.eos
    }

    fn audio_format(&self) -> Option<AudioFormat> {
        self.format
    }

    fn set_reverse_byte_order(&mut self, reverse: bool) {
        self.reverse = reverse;
    }

    fn cleanup(&mut self) {
        self.decoder = None;
        self.format = None;
        self.eos = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_wav(path: &Path, bits: u16, channels: u16, frames: usize) {
        let spec = hound::WavSpec {
            channels,
            sample_rate: 8000,
            bits_per_sample: bits,
            sample_format: hound::SampleFormat::Int,
        };
        let mut writer = hound::WavWriter::create(path, spec).expect("create wav");
        for i in 0..frames * usize::from(channels) {
            if bits == 8 {
                writer.write_sample((i % 100) as i8).expect("write");
            } else {
                writer.write_sample((i * 10) as i16).expect("write");
            }
        }
        writer.finalize().expect("finalize");
    }

    #[test]
    fn test_registry_lookup() {
        let registry = CodecRegistry::with_defaults();
        assert!(registry.supports("WAV"));
        assert!(registry.extensions().contains(&"wav".to_string()));

        let missing = registry.create(&SoundRef::new("song.xyz"), CodecOptions::default());
        assert!(matches!(missing, Err(SoundError::NoCodec(ext)) if ext == "xyz"));

        let no_ext = registry.create(&SoundRef::new("song"), CodecOptions::default());
        assert!(matches!(no_ext, Err(SoundError::NoCodec(_))));
    }

    #[test]
    fn test_wav_chunked_read() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("tone.wav");
        write_wav(&path, 16, 2, 100);

        let options = CodecOptions {
            chunk_bytes: 160,
            max_bytes: 1 << 20,
        };
        let mut codec = WavCodec::new(options);
        codec.initialize(&path).expect("init");
        assert!(codec.initialized());
        assert_eq!(codec.audio_format(), Some(AudioFormat::new(8000, 2, 16)));

        // 100 frames * 4 bytes = 400 bytes: chunks of 160, 160, 80
        let mut sizes = Vec::new();
        while let Some(chunk) = codec.read().expect("read") {
            sizes.push(chunk.len());
        }
        assert_eq!(sizes, vec![160, 160, 80]);
        assert!(codec.end_of_stream());

        codec.cleanup();
        assert!(!codec.initialized());
    }

    #[test]
    fn test_wav_read_all_and_samples() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("mono.wav");
        write_wav(&path, 16, 1, 10);

        let mut codec = WavCodec::new(CodecOptions::default());
        codec.initialize(&path).expect("init");
        let buffer = codec.read_all().expect("read all");
        let samples = buffer.to_i16_samples();
        assert_eq!(samples.len(), 10);
        assert_eq!(samples[3], 30);
    }

    #[test]
    fn test_wav_8bit_is_unsigned() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("byte.wav");
        write_wav(&path, 8, 1, 4);

        let mut codec = WavCodec::new(CodecOptions::default());
        codec.initialize(&path).expect("init");
        let buffer = codec.read_all().expect("read all");
        // first sample is 0 (signed), i.e. the unsigned midpoint
        assert_eq!(buffer.data()[0], 128);
    }

    #[test]
    fn test_wav_reverse_byte_order() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("be.wav");
        write_wav(&path, 16, 1, 4);

        let mut codec = WavCodec::new(CodecOptions::default());
        codec.set_reverse_byte_order(true);
        codec.initialize(&path).expect("init");
        let buffer = codec.read_all().expect("read all");
        assert!(buffer.format().big_endian);
        assert_eq!(buffer.to_i16_samples(), vec![0, 10, 20, 30]);
    }

    #[test]
    fn test_wav_size_cap() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("big.wav");
        write_wav(&path, 16, 2, 1000);

        let options = CodecOptions {
            chunk_bytes: 256,
            max_bytes: 1000,
        };
        let mut codec = WavCodec::new(options);
        codec.initialize(&path).expect("init");
        assert!(matches!(codec.read_all(), Err(SoundError::FileTooLarge { .. })));
    }

    #[test]
    fn test_open_missing_file() {
        let registry = CodecRegistry::with_defaults();
        let sound = SoundRef::new("missing.wav");
        let result = registry.open(
            &sound,
            Path::new("/no/such/dir/missing.wav"),
            CodecOptions::default(),
            false,
        );
        assert!(matches!(result, Err(SoundError::Decode { .. })));
    }
}
