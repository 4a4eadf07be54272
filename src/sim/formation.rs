//! Group move formations

use std::f32::consts::TAU;

use crate::protocol::Position;

/// Distance between neighbouring units in a formation
pub const FORMATION_SPACING: f32 = 30.0;

/// Largest group that still moves in a line
pub const MAX_LINE_SIZE: usize = 5;

/// Offsets from the group target, one per unit in command order.
///
/// Up to [`MAX_LINE_SIZE`] units form a line along the world x axis, centred on the
/// target; larger groups are spread on a circle around it.
pub fn formation_offsets(count: usize) -> Vec<(f32, f32)> {
    match count {
        0 => Vec::new(),
        1 => vec![(0.0, 0.0)],
        n if n <= MAX_LINE_SIZE => {
            let centre = (n - 1) as f32 / 2.0;
            (0..n)
                .map(|i| ((i as f32 - centre) * FORMATION_SPACING, 0.0))
                .collect()
        }
        n => {
            let radius = (FORMATION_SPACING * n as f32 / TAU).max(FORMATION_SPACING);
            (0..n)
                .map(|i| {
                    let angle = TAU * i as f32 / n as f32;
                    (radius * angle.cos(), radius * angle.sin())
                })
                .collect()
        }
    }
}

/// Destination for each unit of a group moving to `target`
pub fn formation_targets(target: Position, count: usize) -> Vec<Position> {
    formation_offsets(count)
        .into_iter()
        .map(|(dx, dy)| target.offset(dx, dy))
        .collect()
}
