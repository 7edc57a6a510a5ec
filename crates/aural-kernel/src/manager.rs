//! Source culling policies.
//!
//! The command thread calls [`SourceManager::manage_sources`] at the start of
//! every pass, before queued commands run. A manager decides which sources
//! are culled and which are active; the library handles the rest (culled
//! sources keep playing what they have, and a source that wanted to play while
//! culled is restarted when it is activated again).

use tracing::trace;

use crate::library::Library;
use crate::spatial::AttenuationModel;

/// Hook for deciding which sources may play.
pub trait SourceManager: Send {
    /// Cull or activate sources.
    fn manage_sources(&mut self, library: &mut Library);
}

/// Leaves every source alone.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopManager;

impl SourceManager for NoopManager {
    fn manage_sources(&mut self, _library: &mut Library) {}
}

/// Culls positional sources farther than `radius` from the listener and
/// activates them again once they are back in range.
///
/// Sources without attenuation (music, UI sounds) and priority sources are
/// never culled.
#[derive(Debug, Clone, Copy)]
pub struct DistanceCuller {
    radius: f32,
}

impl DistanceCuller {
    /// Culler with the given audible radius.
    #[must_use]
    pub fn new(radius: f32) -> Self {
        Self {
            radius: radius.max(0.0),
        }
    }

    /// Audible radius.
    #[must_use]
    pub const fn radius(&self) -> f32 {
        self.radius
    }
}

impl SourceManager for DistanceCuller {
    fn manage_sources(&mut self, library: &mut Library) {
        let listener = library.listener().position;
        let mut cull = Vec::new();
        let mut activate = Vec::new();

        for source in library.sources.values() {
            if source.priority() || source.attenuation == AttenuationModel::None {
                if !source.active() {
                    activate.push(source.name().to_string());
                }
                continue;
            }
            let in_range = source.position().distance(listener) <= self.radius;
            match (in_range, source.active()) {
                (false, true) => cull.push(source.name().to_string()),
                (true, false) => activate.push(source.name().to_string()),
                _ => {},
            }
        }

        for name in &cull {
            trace!("Culling '{}'", name);
            let _ = library.cull(name);
        }
        for name in &activate {
            trace!("Activating '{}'", name);
            let _ = library.activate(name);
        }
    }
}
