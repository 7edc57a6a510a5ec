//! # Aural Player
//!
//! Plays sound files through the Aural engine.
//!
//! ```text
//! aural [--config aural.toml] [--backend rodio] [--stream] [--loop] FILE...
//! ```
//!
//! Without `--stream` each file is loaded fully and played in turn. With
//! `--stream` the first file is streamed and the rest are queued behind it on
//! the same source.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(clippy::unwrap_used)]

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use aural_kernel::config::CONFIG_FILE;
use aural_kernel::prelude::*;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

const POLL: Duration = Duration::from_millis(50);
const STARTUP_WAIT: Duration = Duration::from_secs(2);

/// Parsed command line.
#[derive(Debug, Default)]
struct Args {
    config: Option<PathBuf>,
    backend: Option<String>,
    stream: bool,
    looping: bool,
    files: Vec<PathBuf>,
}

impl Args {
    fn parse(mut args: impl Iterator<Item = String>) -> Result<Self> {
        let mut parsed = Self::default();
        while let Some(arg) = args.next() {
            match arg.as_str() {
                "--config" => {
                    parsed.config = Some(args.next().context("--config needs a path")?.into());
                },
                "--backend" => {
                    parsed.backend = Some(args.next().context("--backend needs a name")?);
                },
                "--stream" => parsed.stream = true,
                "--loop" => parsed.looping = true,
                flag if flag.starts_with("--") => bail!("unknown option '{flag}'"),
                file => parsed.files.push(file.into()),
            }
        }
        if parsed.files.is_empty() {
            bail!("usage: aural [--config FILE] [--backend NAME] [--stream] [--loop] FILE...");
        }
        Ok(parsed)
    }

    fn config(&self) -> SoundConfig {
        let path = self.config.clone().unwrap_or_else(|| PathBuf::from(CONFIG_FILE));
        let config = SoundConfig::load_from(path);
        match &self.backend {
            Some(name) => config.with_backends([name.as_str(), SILENT_BACKEND]),
            None => config,
        }
    }
}

fn sound_ref(path: &Path) -> SoundRef {
    let identifier = path
        .file_name()
        .map_or_else(|| path.display().to_string(), |n| n.to_string_lossy().into_owned());
    SoundRef::with_path(identifier, path)
}

/// Block until nothing is playing, logging engine events.
fn wait_until_quiet(sound: &SoundSystem) {
    let events = sound.events();
    sound.wait_idle(STARTUP_WAIT);
    loop {
        while let Ok(event) = events.try_recv() {
            info!("{:?}", event);
        }
        if !sound.any_playing() {
            break;
        }
        std::thread::sleep(POLL);
    }
    if let Some(e) = sound.take_last_error() {
        warn!("{e}");
    }
}

/// Main entry point.
fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env().add_directive("aural=info".parse()?))
        .init();

    let args = Args::parse(std::env::args().skip(1))?;
    let sound = SoundSystem::new(args.config())?;
    if let Some(e) = sound.take_last_error() {
        warn!("Preferred backend unavailable: {e}");
    }
    info!("Playing through '{}'", sound.backend_name());

    if args.stream {
        let mut files = args.files.iter();
        if let Some(first) = files.next() {
            sound.background_music("player", sound_ref(first), args.looping);
            for file in files {
                sound.queue_sound("player", sound_ref(file));
            }
        }
        wait_until_quiet(&sound);
    } else {
        loop {
            for file in &args.files {
                let spec = SourceSpec::new(sound_ref(file)).with_attenuation(AttenuationModel::None);
                sound.new_source("player", spec);
                sound.play("player");
                wait_until_quiet(&sound);
            }
            if !args.looping {
                break;
            }
        }
    }

    sound.shutdown()?;
    info!("Aural player finished");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Result<Args> {
        Args::parse(args.iter().map(|s| (*s).to_string()))
    }

    #[test]
    fn test_parse_flags_and_files() {
        let args = parse(&["--stream", "--backend", "silent", "a.wav", "b.wav"]).expect("args");
        assert!(args.stream);
        assert!(!args.looping);
        assert_eq!(args.backend.as_deref(), Some("silent"));
        assert_eq!(args.files.len(), 2);
    }

    #[test]
    fn test_parse_rejects_bad_input() {
        assert!(parse(&[]).is_err());
        assert!(parse(&["--volume", "a.wav"]).is_err());
        assert!(parse(&["--config"]).is_err());
    }

    #[test]
    fn test_backend_flag_keeps_silent_fallback() {
        let args = parse(&["--config", "/nonexistent/aural.toml", "--backend", "rodio", "a.wav"])
            .expect("args");
        assert_eq!(args.config().backends, vec!["rodio".to_string(), SILENT_BACKEND.to_string()]);
    }

    #[test]
    fn test_sound_ref_uses_file_name() {
        let sound = sound_ref(Path::new("/music/theme.wav"));
        assert_eq!(sound.identifier(), "theme.wav");
        assert_eq!(sound.extension().as_deref(), Some("wav"));
    }
}
