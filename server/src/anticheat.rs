//! Input validation applied before the simulation sees a client input
//!
//! The gate is corrective: rate violations drop the single input, movement
//! violations are clamped. Nothing here disconnects a session.

use shared::{InputState, MOVE_SPEED, TICK_RATE};

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CheatViolation {
    #[error("input sent too frequently: {elapsed_ms}ms since last accepted input")]
    InputTooFrequent { elapsed_ms: u64 },
    #[error("input timestamp went backwards: prev={prev}, current={current}")]
    TimestampRegression { prev: u64, current: u64 },
    #[error("NaN or Infinity in input values")]
    InvalidFloats,
    #[error("requested displacement ({dx:.2}, {dy:.2}) exceeds {max:.2} per tick")]
    MovementClamped { dx: f32, dy: f32, max: f32 },
    #[error("position clamped back inside the arena")]
    OutOfBounds,
}

#[derive(Debug, Clone)]
pub struct GateConfig {
    /// Minimum gap between accepted inputs, in milliseconds of client time
    pub min_input_interval_ms: f64,
    /// Largest per-axis displacement accepted for one input
    pub max_step_distance: f32,
}

impl GateConfig {
    pub fn for_tick_rate(tick_rate: u32, move_speed: f32) -> Self {
        let tick_ms = 1000.0 / tick_rate as f64;
        Self {
            min_input_interval_ms: tick_ms * 0.5,
            max_step_distance: move_speed / tick_rate as f32 * 1.05,
        }
    }
}

impl Default for GateConfig {
    fn default() -> Self {
        Self::for_tick_rate(TICK_RATE, MOVE_SPEED)
    }
}

/// Displacement after the gate has had its say
#[derive(Debug, Clone, PartialEq)]
pub struct GatedMove {
    pub dx: f32,
    pub dy: f32,
    pub violation: Option<CheatViolation>,
}

#[derive(Debug, Clone, Default)]
pub struct InputGate {
    config: GateConfig,
}

impl InputGate {
    pub fn new(config: GateConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &GateConfig {
        &self.config
    }

    /// Checks whether an input may be applied at all
    pub fn admit(
        &self,
        last_accepted: Option<u64>,
        input: &InputState,
    ) -> Result<(), CheatViolation> {
        if !input.is_well_formed() {
            return Err(CheatViolation::InvalidFloats);
        }
        self.check_rate(last_accepted, input.timestamp)
    }

    pub fn check_rate(
        &self,
        last_accepted: Option<u64>,
        timestamp: u64,
    ) -> Result<(), CheatViolation> {
        let Some(prev) = last_accepted else {
            return Ok(());
        };
        if timestamp < prev {
            return Err(CheatViolation::TimestampRegression {
                prev,
                current: timestamp,
            });
        }
        let elapsed_ms = timestamp - prev;
        if (elapsed_ms as f64) < self.config.min_input_interval_ms {
            return Err(CheatViolation::InputTooFrequent { elapsed_ms });
        }
        Ok(())
    }

    /// Clamps each axis of a requested displacement to the per-tick maximum
    pub fn clamp_displacement(&self, dx: f32, dy: f32) -> GatedMove {
        let max = self.config.max_step_distance;
        let cx = dx.clamp(-max, max);
        let cy = dy.clamp(-max, max);
        let violation =
            (cx != dx || cy != dy).then_some(CheatViolation::MovementClamped { dx, dy, max });
        GatedMove {
            dx: cx,
            dy: cy,
            violation,
        }
    }
}
