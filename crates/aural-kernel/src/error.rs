//! Error types used throughout the kernel.

pub use aural_common::error::{SoundError, SoundResult};
