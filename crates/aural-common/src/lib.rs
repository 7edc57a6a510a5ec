//! # Aural Common
//!
//! Common types shared by the Aural sound engine crates.
//!
//! This crate provides:
//! - The sound error taxonomy (`SoundError`, `SoundResult`)
//! - Source identity (`SourceSerial`) and generated source names
//! - Prelude for convenient imports

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(clippy::unwrap_used)]

pub mod error;
pub mod ids;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::error::*;
    pub use crate::ids::*;
}

pub use prelude::*;
