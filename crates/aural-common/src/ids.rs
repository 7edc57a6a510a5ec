//! Identity types for sources.

use std::sync::atomic::{AtomicU64, Ordering};

/// Global counter for source serials.
static SOURCE_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Prefix used for engine-generated source names.
pub const GENERATED_NAME_PREFIX: &str = "Source_";

/// Identity of one source instance.
///
/// Names are reused (re-creating a source under the same name replaces the
/// old one), so channels and the stream watch list refer to sources by
/// serial: two sources that share a name never share a serial.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SourceSerial(u64);

impl SourceSerial {
    /// Creates a new unique serial.
    #[must_use]
    pub fn new() -> Self {
        Self(SOURCE_COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    /// Creates a serial from a raw value.
    #[must_use]
    pub const fn from_raw(value: u64) -> Self {
        Self(value)
    }

    /// Returns the raw serial value.
    #[must_use]
    pub const fn raw(self) -> u64 {
        self.0
    }

    /// Null/invalid serial.
    pub const NULL: Self = Self(0);

    /// Checks if this is a valid (non-null) serial.
    #[must_use]
    pub const fn is_valid(self) -> bool {
        self.0 != 0
    }
}

impl Default for SourceSerial {
    fn default() -> Self {
        Self::new()
    }
}

/// Generate a random source name for quick-play sources.
///
/// Names have the form `Source_<n>_<n>`; the caller gets the name back and
/// can use it to address the source later.
#[must_use]
pub fn generated_source_name() -> String {
    format!(
        "{GENERATED_NAME_PREFIX}{}_{}",
        fastrand::u32(..),
        fastrand::u32(..)
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_serial_raw_round_trip() {
        let serial = SourceSerial::from_raw(42);
        assert_eq!(serial.raw(), 42);
        assert!(!SourceSerial::NULL.is_valid());
    }

    #[test]
    fn test_generated_name_shape() {
        let name = generated_source_name();
        assert!(name.starts_with(GENERATED_NAME_PREFIX));
        let parts: Vec<&str> = name.trim_start_matches(GENERATED_NAME_PREFIX).split('_').collect();
        assert_eq!(parts.len(), 2);
        assert!(parts.iter().all(|p| p.parse::<u32>().is_ok()));
    }

    #[test]
    fn test_generated_names_differ() {
        let a = generated_source_name();
        let b = generated_source_name();
        assert_ne!(a, b);
    }
}
