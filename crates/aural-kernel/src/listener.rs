//! Listener position and orientation.

use glam::Vec3;
use serde::{Deserialize, Serialize};

/// Default look direction (down the negative Z axis).
pub const DEFAULT_LOOK_AT: Vec3 = Vec3::new(0.0, 0.0, -1.0);

/// Default up direction.
pub const DEFAULT_UP: Vec3 = Vec3::Y;

/// Position, orientation and velocity of the listener.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ListenerData {
    /// Position in world coordinates.
    pub position: Vec3,
    /// Direction the listener faces.
    pub look_at: Vec3,
    /// Direction of the top of the listener's head.
    pub up: Vec3,
    /// Velocity for Doppler effect (world units per second).
    pub velocity: Vec3,
    /// Rotation around the up axis, in radians.
    pub angle: f32,
}

impl Default for ListenerData {
    fn default() -> Self {
        Self {
            position: Vec3::ZERO,
            look_at: DEFAULT_LOOK_AT,
            up: DEFAULT_UP,
            velocity: Vec3::ZERO,
            angle: 0.0,
        }
    }
}

impl ListenerData {
    /// Create a listener at a position with the default orientation.
    #[must_use]
    pub fn new(position: Vec3) -> Self {
        Self {
            position,
            ..Self::default()
        }
    }

    /// Create with orientation.
    #[must_use]
    pub const fn with_orientation(mut self, look_at: Vec3, up: Vec3) -> Self {
        self.look_at = look_at;
        self.up = up;
        self
    }

    /// Create with velocity.
    #[must_use]
    pub const fn with_velocity(mut self, velocity: Vec3) -> Self {
        self.velocity = velocity;
        self
    }

    /// Move to an absolute position.
    pub fn set_position(&mut self, position: Vec3) {
        self.position = position;
    }

    /// Move relative to the current position.
    pub fn translate(&mut self, delta: Vec3) {
        self.position += delta;
    }

    /// Face the given angle around the up axis.
    ///
    /// Angle zero looks down negative Z; the look vector's Y component is
    /// left as it was.
    pub fn set_angle(&mut self, angle: f32) {
        self.angle = angle;
        self.look_at.x = -angle.sin();
        self.look_at.z = -angle.cos();
    }

    /// Rotate by a relative angle.
    pub fn turn(&mut self, delta: f32) {
        self.set_angle(self.angle + delta);
    }

    /// Set look and up vectors directly.
    pub fn set_orientation(&mut self, look_at: Vec3, up: Vec3) {
        self.look_at = look_at;
        self.up = up;
    }

    /// Set velocity.
    pub fn set_velocity(&mut self, velocity: Vec3) {
        self.velocity = velocity;
    }

    /// Unit vector pointing to the listener's right, or zero when the
    /// orientation is degenerate.
    #[must_use]
    pub fn right(&self) -> Vec3 {
        self.look_at.cross(self.up).normalize_or_zero()
    }
}
