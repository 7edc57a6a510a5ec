//! 3D Spatial Audio
//!
//! Derives a per-channel gain, pan and pitch for positioned sources relative
//! to the listener.
//!
//! # Overview
//!
//! The engine hands backends three numbers per source:
//! - **Distance attenuation**: sounds get quieter as they move away
//! - **Stereo panning**: sounds pan left/right based on relative position
//! - **Doppler effect**: pitch shifts based on relative velocity
//!
//! # Example
//!
//! ```
//! use aural_kernel::spatial::{AttenuationModel, SpatialInput, SpatialProcessor};
//! use aural_kernel::listener::ListenerData;
//! use glam::Vec3;
//!
//! let mut processor = SpatialProcessor::new();
//! processor.set_listener(ListenerData::default());
//!
//! let input = SpatialInput::at(Vec3::new(10.0, 0.0, 0.0))
//!     .with_attenuation(AttenuationModel::Linear, 100.0);
//! let params = processor.calculate(&input);
//! assert!(params.pan > 0.0);
//! assert!(params.gain < 1.0);
//! ```

use glam::Vec3;
use serde::{Deserialize, Serialize};

use crate::listener::ListenerData;

/// Speed of sound in world units per second (for Doppler calculations).
pub const SPEED_OF_SOUND: f32 = 343.0;

/// Distances below this are treated as "at the listener".
const MIN_DISTANCE: f32 = 0.01;

/// Distance attenuation models.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum AttenuationModel {
    /// No distance attenuation - constant volume regardless of distance.
    None,
    /// Linear falloff to silence at the fade distance.
    Linear,
    /// Inverse-square falloff scaled by a rolloff factor.
    #[default]
    Rolloff,
}

impl AttenuationModel {
    /// Attenuation factor (0.0-1.0) at `distance`.
    ///
    /// `dist_or_roll` is the fade distance for `Linear` and the rolloff
    /// factor for `Rolloff`; `None` ignores it.
    #[must_use]
    pub fn gain(&self, distance: f32, dist_or_roll: f32) -> f32 {
        let d = distance.max(0.0);
        match self {
            Self::None => 1.0,
            Self::Linear => {
                if dist_or_roll <= 0.0 {
                    return if d <= 0.0 { 1.0 } else { 0.0 };
                }
                (1.0 - d / dist_or_roll).clamp(0.0, 1.0)
            },
            Self::Rolloff => {
                let rolloff = dist_or_roll.max(0.0);
                1.0 / (1.0 + rolloff * d * d)
            },
        }
    }

    /// Get a human-readable name for this model.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::None => "None",
            Self::Linear => "Linear",
            Self::Rolloff => "Rolloff",
        }
    }
}

/// Per-source inputs to the spatial calculation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SpatialInput {
    /// Position in world coordinates.
    pub position: Vec3,
    /// Velocity for Doppler effect (world units per second).
    pub velocity: Vec3,
    /// Base pitch multiplier (1.0 = normal).
    pub pitch: f32,
    /// Distance attenuation model.
    pub attenuation: AttenuationModel,
    /// Fade distance or rolloff factor, depending on the model.
    pub dist_or_roll: f32,
}

impl Default for SpatialInput {
    fn default() -> Self {
        Self::at(Vec3::ZERO)
    }
}

impl SpatialInput {
    /// Create a stationary input at a position with no attenuation.
    #[must_use]
    pub const fn at(position: Vec3) -> Self {
        Self {
            position,
            velocity: Vec3::ZERO,
            pitch: 1.0,
            attenuation: AttenuationModel::None,
            dist_or_roll: 0.0,
        }
    }

    /// Set velocity for Doppler effect.
    #[must_use]
    pub const fn with_velocity(mut self, velocity: Vec3) -> Self {
        self.velocity = velocity;
        self
    }

    /// Set base pitch.
    #[must_use]
    pub const fn with_pitch(mut self, pitch: f32) -> Self {
        self.pitch = pitch;
        self
    }

    /// Set attenuation parameters.
    #[must_use]
    pub const fn with_attenuation(mut self, model: AttenuationModel, dist_or_roll: f32) -> Self {
        self.attenuation = model;
        self.dist_or_roll = dist_or_roll;
        self
    }
}

/// Calculated spatial parameters for playback.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SpatialParams {
    /// Distance attenuation (0.0-1.0).
    pub gain: f32,
    /// Pan position (-1.0 = full left, 0.0 = center, 1.0 = full right).
    pub pan: f32,
    /// Final pitch multiplier (including Doppler).
    pub pitch: f32,
    /// Distance from listener.
    pub distance: f32,
}

impl Default for SpatialParams {
    fn default() -> Self {
        Self {
            gain: 1.0,
            pan: 0.0,
            pitch: 1.0,
            distance: 0.0,
        }
    }
}

impl SpatialParams {
    /// Left/right channel gains using constant power panning.
    #[must_use]
    pub fn stereo_gains(&self) -> (f32, f32) {
        let pan_angle = (self.pan.clamp(-1.0, 1.0) + 1.0) * std::f32::consts::FRAC_PI_4;
        (pan_angle.cos(), pan_angle.sin())
    }
}

/// Spatial processor.
///
/// Holds the listener and Doppler settings; `calculate` is pure.
#[derive(Debug, Clone)]
pub struct SpatialProcessor {
    /// Current listener state.
    listener: ListenerData,
    /// Doppler effect strength (0.0 = none, 1.0 = realistic).
    doppler_factor: f32,
    /// Multiplier on the speed of sound.
    doppler_velocity: f32,
}

impl Default for SpatialProcessor {
    fn default() -> Self {
        Self::new()
    }
}

impl SpatialProcessor {
    /// Create a processor with a default listener.
    #[must_use]
    pub fn new() -> Self {
        Self {
            listener: ListenerData::default(),
            doppler_factor: 1.0,
            doppler_velocity: 1.0,
        }
    }

    /// Set the listener state.
    pub fn set_listener(&mut self, listener: ListenerData) {
        self.listener = listener;
    }

    /// Get the current listener state.
    #[must_use]
    pub const fn listener(&self) -> &ListenerData {
        &self.listener
    }

    /// Mutable listener access.
    pub fn listener_mut(&mut self) -> &mut ListenerData {
        &mut self.listener
    }

    /// Set Doppler effect strength.
    pub fn set_doppler_factor(&mut self, factor: f32) {
        self.doppler_factor = factor.max(0.0);
    }

    /// Doppler effect strength.
    #[must_use]
    pub const fn doppler_factor(&self) -> f32 {
        self.doppler_factor
    }

    /// Set the speed-of-sound multiplier.
    pub fn set_doppler_velocity(&mut self, velocity: f32) {
        self.doppler_velocity = velocity.max(0.01);
    }

    /// Speed-of-sound multiplier.
    #[must_use]
    pub const fn doppler_velocity(&self) -> f32 {
        self.doppler_velocity
    }

    /// Calculate spatial parameters for a source.
    #[must_use]
    pub fn calculate(&self, input: &SpatialInput) -> SpatialParams {
        let offset = input.position - self.listener.position;
        let distance = offset.length();

        let gain = input.attenuation.gain(distance, input.dist_or_roll);

        if distance <= MIN_DISTANCE {
            return SpatialParams {
                gain,
                pan: 0.0,
                pitch: input.pitch,
                distance,
            };
        }

        let direction = offset / distance;
        let pan = direction.dot(self.listener.right()).clamp(-1.0, 1.0);
        let pitch = self.doppler(input, direction);

        SpatialParams {
            gain,
            pan,
            pitch,
            distance,
        }
    }

    /// Doppler pitch shift along the listener-to-source direction.
    fn doppler(&self, input: &SpatialInput, direction: Vec3) -> f32 {
        if self.doppler_factor <= 0.0 {
            return input.pitch;
        }

        // Projections onto the listener-to-source direction
        let listener_vel = self.listener.velocity.dot(direction);
        let source_vel = input.velocity.dot(direction);

        let speed = SPEED_OF_SOUND * self.doppler_velocity;
        let numerator = speed + listener_vel * self.doppler_factor;
        let denominator = speed + source_vel * self.doppler_factor;

        if denominator.abs() > 0.01 && numerator > 0.0 {
            input.pitch * (numerator / denominator)
        } else {
            input.pitch
        }
    }
}
