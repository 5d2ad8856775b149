//! Tank movement rule shared by the authoritative server and the client predictor
//!
//! Both sides must produce bit-identical results for the same inputs, so every
//! function here is pure: no clocks, no randomness, no hidden state.

use crate::map::ObstacleMap;
use crate::{MOVE_SPEED, TANK_COLLISION_SIZE, TANK_SIZE};
use serde::{Deserialize, Serialize};

/// Pressed movement directions
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MoveKeys {
    pub up: bool,
    pub down: bool,
    pub left: bool,
    pub right: bool,
}

impl MoveKeys {
    pub fn is_idle(&self) -> bool {
        self.velocity_axes() == (0.0, 0.0)
    }

    fn velocity_axes(&self) -> (f32, f32) {
        let mut vx = 0.0;
        let mut vy = 0.0;
        if self.up {
            vy -= 1.0;
        }
        if self.down {
            vy += 1.0;
        }
        if self.left {
            vx -= 1.0;
        }
        if self.right {
            vx += 1.0;
        }
        (vx, vy)
    }
}

/// Result of one movement step
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StepResult {
    pub x: f32,
    pub y: f32,
    /// The final position had to be pulled back inside the border
    pub clamped_to_bounds: bool,
}

/// Velocity for the pressed keys; diagonals are scaled by 1/sqrt(2)
pub fn velocity(keys: MoveKeys, speed: f32) -> (f32, f32) {
    let (mut vx, mut vy) = keys.velocity_axes();
    if vx != 0.0 && vy != 0.0 {
        vx *= std::f32::consts::FRAC_1_SQRT_2;
        vy *= std::f32::consts::FRAC_1_SQRT_2;
    }
    (vx * speed, vy * speed)
}

/// Applies a displacement with per-axis obstacle rejection, then clamps to the interior
///
/// X is resolved first using the old Y, then Y using the resolved X, which lets
/// a tank slide along a wall it is pushing diagonally into.
pub fn integrate(map: &ObstacleMap, x: f32, y: f32, dx: f32, dy: f32) -> StepResult {
    let mut nx = x;
    let mut ny = y;

    if !map.collides(x + dx, y, TANK_COLLISION_SIZE) {
        nx = x + dx;
    }
    if !map.collides(nx, y + dy, TANK_COLLISION_SIZE) {
        ny = y + dy;
    }

    let (cx, cy) = map.clamp_to_interior(nx, ny, TANK_SIZE);

    StepResult {
        x: cx,
        y: cy,
        clamped_to_bounds: cx != nx || cy != ny,
    }
}

/// Advances a tank by one step of `dt` seconds with the default movement speed
pub fn step(map: &ObstacleMap, x: f32, y: f32, keys: MoveKeys, dt: f32) -> StepResult {
    let (vx, vy) = velocity(keys, MOVE_SPEED);
    integrate(map, x, y, vx * dt, vy * dt)
}

/// Facing angle from a tank centre toward an aim point
pub fn aim_angle(x: f32, y: f32, aim_x: f32, aim_y: f32) -> f32 {
    (aim_y - y).atan2(aim_x - x)
}
