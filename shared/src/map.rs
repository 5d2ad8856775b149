//! Static arena geometry
//!
//! The obstacle map is built once at server start-up and never changes for the
//! lifetime of the process. Clients receive the rectangle list once and run the
//! same collision queries locally for prediction.

use crate::{ARENA_HEIGHT, ARENA_WIDTH, BORDER_THICKNESS, TANK_COLLISION_SIZE};
use rand::Rng;
use serde::{Deserialize, Serialize};

/// Number of spawn points placed on the ring around the arena centre
pub const SPAWN_POINT_COUNT: usize = 8;
/// Distance kept between the spawn ring and the arena edge
const SPAWN_RING_INSET: f32 = 1200.0;

/// Axis-aligned rectangle anchored at its top-left corner
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Obstacle {
    pub x: f32,
    pub y: f32,
    pub w: f32,
    pub h: f32,
}

impl Obstacle {
    pub const fn new(x: f32, y: f32, w: f32, h: f32) -> Self {
        Self { x, y, w, h }
    }

    /// Returns true if a square of side `size` centred at (x, y) overlaps this rectangle
    pub fn overlaps_square(&self, x: f32, y: f32, size: f32) -> bool {
        let half = size / 2.0;
        x + half > self.x
            && x - half < self.x + self.w
            && y + half > self.y
            && y - half < self.y + self.h
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum MapError {
    #[error("obstacle map has no obstacles")]
    Empty,
    #[error("obstacle {index} has an invalid shape: {obstacle:?}")]
    InvalidObstacle { index: usize, obstacle: Obstacle },
    #[error("border thickness {border} leaves no interior in a {width}x{height} arena")]
    NoInterior { width: f32, height: f32, border: f32 },
}

/// Immutable set of rectangles making up the arena border and interior cover
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObstacleMap {
    pub width: f32,
    pub height: f32,
    pub border: f32,
    pub obstacles: Vec<Obstacle>,
}

impl ObstacleMap {
    pub fn new(width: f32, height: f32, border: f32, obstacles: Vec<Obstacle>) -> Self {
        Self {
            width,
            height,
            border,
            obstacles,
        }
    }

    /// Builds the standard arena layout
    ///
    /// The only randomness is the placement of the cover block next to each
    /// spawn point, which is jittered by up to 120 units.
    pub fn arena<R: Rng>(rng: &mut R) -> Self {
        let w = ARENA_WIDTH;
        let h = ARENA_HEIGHT;
        let b = BORDER_THICKNESS;
        let cx = w / 2.0;
        let cy = h / 2.0;

        let mut obstacles = vec![
            // Border
            Obstacle::new(0.0, 0.0, w, b),
            Obstacle::new(0.0, h - b, w, b),
            Obstacle::new(0.0, 0.0, b, h),
            Obstacle::new(w - b, 0.0, b, h),
            // Central partial walls
            Obstacle::new(cx - 200.0, cy - 200.0, 400.0, 40.0),
            Obstacle::new(cx - 200.0, cy + 160.0, 400.0, 40.0),
            Obstacle::new(cx - 200.0, cy - 200.0, 40.0, 180.0),
            Obstacle::new(cx + 160.0, cy - 200.0, 40.0, 180.0),
            Obstacle::new(cx - 200.0, cy + 20.0, 40.0, 180.0),
            Obstacle::new(cx + 160.0, cy + 20.0, 40.0, 180.0),
            // T-shapes and zig-zags
            Obstacle::new(cx - 600.0, cy - 400.0, 300.0, 40.0),
            Obstacle::new(cx - 600.0, cy - 400.0, 40.0, 200.0),
            Obstacle::new(cx + 300.0, cy + 300.0, 300.0, 40.0),
            Obstacle::new(cx + 560.0, cy + 140.0, 40.0, 200.0),
            // Corridors
            Obstacle::new(cx - 1000.0, cy - 60.0, 800.0, 40.0),
            Obstacle::new(cx + 200.0, cy - 60.0, 800.0, 40.0),
            Obstacle::new(cx - 60.0, cy - 1000.0, 40.0, 800.0),
            Obstacle::new(cx - 60.0, cy + 200.0, 40.0, 800.0),
            // Islands
            Obstacle::new(cx - 900.0, cy - 900.0, 80.0, 80.0),
            Obstacle::new(cx + 820.0, cy - 900.0, 80.0, 80.0),
            Obstacle::new(cx - 900.0, cy + 820.0, 80.0, 80.0),
            Obstacle::new(cx + 820.0, cy + 820.0, 80.0, 80.0),
            Obstacle::new(cx, cy - 1200.0, 80.0, 80.0),
            Obstacle::new(cx, cy + 1120.0, 80.0, 80.0),
            // Corner partial walls
            Obstacle::new(600.0, 600.0, 200.0, 40.0),
            Obstacle::new(600.0, 900.0, 40.0, 200.0),
            Obstacle::new(w - 900.0, 600.0, 200.0, 40.0),
            Obstacle::new(w - 900.0 + 160.0, 900.0, 40.0, 200.0),
            Obstacle::new(600.0, h - 900.0, 200.0, 40.0),
            Obstacle::new(600.0, h - 900.0 + 160.0, 40.0, 200.0),
            Obstacle::new(w - 900.0, h - 900.0, 200.0, 40.0),
            Obstacle::new(w - 900.0 + 160.0, h - 900.0 + 160.0, 40.0, 200.0),
            // Mid-ring cover
            Obstacle::new(1200.0, 2000.0, 120.0, 40.0),
            Obstacle::new(2000.0, 1200.0, 40.0, 120.0),
            Obstacle::new(w - 1400.0, 2000.0, 120.0, 40.0),
            Obstacle::new(w - 2200.0, 1200.0, 40.0, 120.0),
            Obstacle::new(1200.0, h - 2000.0, 120.0, 40.0),
            Obstacle::new(2000.0, h - 1200.0, 40.0, 120.0),
            Obstacle::new(w - 1400.0, h - 2000.0, 120.0, 40.0),
            Obstacle::new(w - 2200.0, h - 1200.0, 40.0, 120.0),
            Obstacle::new(cx - 1800.0, cy, 120.0, 40.0),
            Obstacle::new(cx + 1680.0, cy, 120.0, 40.0),
            Obstacle::new(cx, cy - 1800.0, 40.0, 120.0),
            Obstacle::new(cx, cy + 1680.0, 40.0, 120.0),
            // Outer-ring cover
            Obstacle::new(400.0, 3000.0, 100.0, 40.0),
            Obstacle::new(3000.0, 400.0, 40.0, 100.0),
            Obstacle::new(w - 600.0, 3000.0, 100.0, 40.0),
            Obstacle::new(w - 3200.0, 400.0, 40.0, 100.0),
            Obstacle::new(400.0, h - 3000.0, 100.0, 40.0),
            Obstacle::new(3000.0, h - 600.0, 40.0, 100.0),
            Obstacle::new(w - 600.0, h - 3000.0, 100.0, 40.0),
            Obstacle::new(w - 3200.0, h - 600.0, 40.0, 100.0),
        ];

        for (sx, sy) in spawn_ring(w, h) {
            obstacles.push(Obstacle::new(
                sx - 60.0 + 120.0 * rng.gen::<f32>(),
                sy - 60.0 + 120.0 * rng.gen::<f32>(),
                120.0,
                60.0,
            ));
        }

        Self::new(w, h, b, obstacles)
    }

    /// Checks the map is usable for simulation
    pub fn validate(&self) -> Result<(), MapError> {
        if self.obstacles.is_empty() {
            return Err(MapError::Empty);
        }

        let min_span = 2.0 * self.border + TANK_COLLISION_SIZE;
        if !(self.width > min_span && self.height > min_span) || !self.border.is_finite() {
            return Err(MapError::NoInterior {
                width: self.width,
                height: self.height,
                border: self.border,
            });
        }

        for (index, obstacle) in self.obstacles.iter().enumerate() {
            let finite = [obstacle.x, obstacle.y, obstacle.w, obstacle.h]
                .iter()
                .all(|v| v.is_finite());
            if !finite || obstacle.w <= 0.0 || obstacle.h <= 0.0 {
                return Err(MapError::InvalidObstacle {
                    index,
                    obstacle: *obstacle,
                });
            }
        }

        Ok(())
    }

    /// Returns true if a square of side `size` centred at (x, y) overlaps any obstacle
    pub fn collides(&self, x: f32, y: f32, size: f32) -> bool {
        self.obstacles.iter().any(|o| o.overlaps_square(x, y, size))
    }

    /// Clamps a tank centre into the playable interior inside the border
    pub fn clamp_to_interior(&self, x: f32, y: f32, tank_size: f32) -> (f32, f32) {
        let inset = self.border + tank_size / 2.0;
        (
            x.clamp(inset, self.width - inset),
            y.clamp(inset, self.height - inset),
        )
    }

    pub fn is_out_of_bounds(&self, x: f32, y: f32) -> bool {
        x < 0.0 || x > self.width || y < 0.0 || y > self.height
    }

    pub fn center(&self) -> (f32, f32) {
        (self.width / 2.0, self.height / 2.0)
    }

    pub fn spawn_ring(&self) -> Vec<(f32, f32)> {
        spawn_ring(self.width, self.height)
    }

    /// Smallest width or height among all obstacles
    pub fn min_dimension(&self) -> f32 {
        self.obstacles
            .iter()
            .map(|o| o.w.min(o.h))
            .fold(f32::INFINITY, f32::min)
    }
}

fn spawn_ring(width: f32, height: f32) -> Vec<(f32, f32)> {
    let radius = width.min(height) / 2.0 - SPAWN_RING_INSET;
    let cx = width / 2.0;
    let cy = height / 2.0;

    (0..SPAWN_POINT_COUNT)
        .map(|i| {
            let angle = (i as f32 / SPAWN_POINT_COUNT as f32) * std::f32::consts::TAU
                + std::f32::consts::PI / 8.0;
            (cx + radius * angle.cos(), cy + radius * angle.sin())
        })
        .collect()
}
