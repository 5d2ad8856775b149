//! Client input capture with sequencing and fixed-rate pacing

use macroquad::prelude::*;
use shared::{InputState, MoveKeys, TICK_DT};

/// Smallest gap between two input timestamps, in milliseconds
///
/// Keeps consecutive inputs comfortably above the server's rate limit even
/// when several are sent in the same frame.
pub const INPUT_SPACING_MS: u64 = 16;
/// Inputs that may be sent to catch up after a slow frame
const MAX_INPUTS_PER_FRAME: u32 = 4;

/// One-shot actions triggered this frame
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Controls {
    pub toggle_prediction: bool,
    pub toggle_reconciliation: bool,
    pub toggle_interpolation: bool,
    pub cash_out: bool,
    pub quit: bool,
    pub join: bool,
}

/// Continuous input sampled this frame
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct FrameInput {
    pub keys: MoveKeys,
    /// Aim point in world coordinates
    pub aim_x: f32,
    pub aim_y: f32,
    pub shoot: bool,
}

pub struct InputManager {
    next_sequence: u32,
    last_timestamp: u64,
    accumulator: f32,

    // Previous frame key states for edge detection
    prev_keys: [bool; 6],
}

const CONTROL_KEYS: [KeyCode; 6] = [
    KeyCode::Key1,
    KeyCode::Key2,
    KeyCode::Key3,
    KeyCode::C,
    KeyCode::Q,
    KeyCode::J,
];

impl InputManager {
    pub fn new() -> Self {
        Self {
            next_sequence: 1,
            last_timestamp: 0,
            accumulator: 0.0,
            prev_keys: [false; 6],
        }
    }

    /// Reads keyboard and mouse; `camera` is the world position of the screen's top-left corner
    pub fn sample(&mut self, camera: (f32, f32)) -> (Controls, FrameInput) {
        let keys = MoveKeys {
            up: is_key_down(KeyCode::W) || is_key_down(KeyCode::Up),
            down: is_key_down(KeyCode::S) || is_key_down(KeyCode::Down),
            left: is_key_down(KeyCode::A) || is_key_down(KeyCode::Left),
            right: is_key_down(KeyCode::D) || is_key_down(KeyCode::Right),
        };
        let (mx, my) = mouse_position();
        let shoot = is_mouse_button_down(MouseButton::Left) || is_key_down(KeyCode::Space);

        let mut pressed = [false; 6];
        for (i, key) in CONTROL_KEYS.iter().enumerate() {
            let down = is_key_down(*key);
            pressed[i] = down && !self.prev_keys[i];
            self.prev_keys[i] = down;
        }

        let controls = Controls {
            toggle_prediction: pressed[0],
            toggle_reconciliation: pressed[1],
            toggle_interpolation: pressed[2],
            cash_out: pressed[3],
            quit: pressed[4],
            join: pressed[5],
        };
        let input = FrameInput {
            keys,
            aim_x: mx + camera.0,
            aim_y: my + camera.1,
            shoot,
        };
        (controls, input)
    }

    /// Number of inputs due after a frame lasting `frame_dt` seconds
    ///
    /// Inputs go out at the server tick rate regardless of frame rate.
    pub fn due_inputs(&mut self, frame_dt: f32) -> u32 {
        self.accumulator += frame_dt.max(0.0);
        let mut due = 0;
        while self.accumulator >= TICK_DT && due < MAX_INPUTS_PER_FRAME {
            self.accumulator -= TICK_DT;
            due += 1;
        }
        if due == MAX_INPUTS_PER_FRAME {
            self.accumulator = 0.0;
        }
        due
    }

    /// Stamps a sampled input with the next sequence number
    pub fn build(&mut self, frame: &FrameInput, now: u64) -> InputState {
        let timestamp = if self.last_timestamp == 0 {
            now
        } else {
            now.max(self.last_timestamp + INPUT_SPACING_MS)
        };
        self.last_timestamp = timestamp;

        let input = InputState {
            sequence: self.next_sequence,
            timestamp,
            keys: frame.keys,
            aim_x: frame.aim_x,
            aim_y: frame.aim_y,
            shoot: frame.shoot,
        };
        self.next_sequence += 1;
        input
    }
}

impl Default for InputManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_input_manager_creation() {
        let input_manager = InputManager::new();
        assert_eq!(input_manager.next_sequence, 1);
        assert_eq!(input_manager.last_timestamp, 0);
    }

    #[test]
    fn test_build_sequences_inputs() {
        let mut manager = InputManager::new();
        let frame = FrameInput {
            shoot: true,
            aim_x: 3.0,
            ..FrameInput::default()
        };

        let first = manager.build(&frame, 1000);
        let second = manager.build(&frame, 1100);
        assert_eq!((first.sequence, second.sequence), (1, 2));
        assert_eq!((first.timestamp, second.timestamp), (1000, 1100));
        assert!(second.shoot);
        assert_eq!(second.aim_x, 3.0);
    }

    #[test]
    fn test_same_frame_inputs_are_spaced() {
        let mut manager = InputManager::new();
        let frame = FrameInput::default();

        let a = manager.build(&frame, 5000);
        let b = manager.build(&frame, 5000);
        let c = manager.build(&frame, 5001);
        assert_eq!(b.timestamp - a.timestamp, INPUT_SPACING_MS);
        assert_eq!(c.timestamp - b.timestamp, INPUT_SPACING_MS);
    }

    #[test]
    fn test_due_inputs_follows_tick_rate() {
        let mut manager = InputManager::new();
        let mut total = 0;
        for _ in 0..120 {
            total += manager.due_inputs(1.0 / 120.0);
        }
        assert!((59..=60).contains(&total));

        // A long stall only produces a bounded burst
        assert_eq!(manager.due_inputs(1.0), MAX_INPUTS_PER_FRAME);
        assert_eq!(manager.due_inputs(0.0), 0);
    }
}
