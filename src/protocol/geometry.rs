//! Shared reference frame for positions on the wire

use serde::{Deserialize, Serialize};

/// Width of the shared world frame in world units
pub const WORLD_WIDTH: f32 = 1920.0;
/// Height of the shared world frame in world units
pub const WORLD_HEIGHT: f32 = 1080.0;

/// A point in the shared world frame.
///
/// Both peers agree on these coordinates regardless of their screen size;
/// convert device coordinates with [`Viewport`] before building a command.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Position {
    pub x: f32,
    pub y: f32,
}

impl Position {
    pub const fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }

    pub fn offset(self, dx: f32, dy: f32) -> Self {
        Self::new(self.x + dx, self.y + dy)
    }

    pub fn distance(self, other: Position) -> f32 {
        let dx = other.x - self.x;
        let dy = other.y - self.y;
        (dx * dx + dy * dy).sqrt()
    }

    /// Move towards `target` by at most `max_step`, returning the new point
    pub fn step_towards(self, target: Position, max_step: f32) -> Self {
        let dist = self.distance(target);
        if dist <= max_step || dist < f32::EPSILON {
            return target;
        }
        let scale = max_step / dist;
        self.offset((target.x - self.x) * scale, (target.y - self.y) * scale)
    }

    /// Position snapped to the checksum granularity
    pub fn rounded(self) -> (i64, i64) {
        (self.x.round() as i64, self.y.round() as i64)
    }
}

/// A device viewport, used to map screen coordinates into the world frame
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Viewport {
    /// Screen width in device pixels
    pub width: f32,
    /// Screen height in device pixels
    pub height: f32,
}

impl Viewport {
    pub fn new(width: f32, height: f32) -> Self {
        Self { width, height }
    }

    fn scale(&self) -> (f32, f32) {
        let sx = if self.width > 0.0 { WORLD_WIDTH / self.width } else { 1.0 };
        let sy = if self.height > 0.0 { WORLD_HEIGHT / self.height } else { 1.0 };
        (sx, sy)
    }

    /// Convert a screen point into the shared world frame
    pub fn to_world(&self, screen_x: f32, screen_y: f32) -> Position {
        let (sx, sy) = self.scale();
        Position::new(screen_x * sx, screen_y * sy)
    }

    /// Convert a world point into this device's screen coordinates
    pub fn to_screen(&self, position: Position) -> (f32, f32) {
        let (sx, sy) = self.scale();
        (position.x / sx, position.y / sy)
    }
}
