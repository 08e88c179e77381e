//! Speed validation against each entity's last accepted state

use crate::error::MoveRejection;
use shared::{Vec3, MAX_SPEED};

/// Last accepted position and server time for one entity. Only the
/// authority writes it, and only on commit.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EntityMotionState {
    pub last_valid_position: Vec3,
    /// Server-measured seconds; never decreases.
    pub last_update_time: f64,
}

impl EntityMotionState {
    pub fn new(last_valid_position: Vec3, last_update_time: f64) -> Self {
        Self {
            last_valid_position,
            last_update_time,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct MotionValidator {
    max_speed: f32,
}

impl Default for MotionValidator {
    fn default() -> Self {
        Self::new(MAX_SPEED)
    }
}

impl MotionValidator {
    pub fn new(max_speed: f32) -> Self {
        Self { max_speed }
    }

    pub fn max_speed(&self) -> f32 {
        self.max_speed
    }

    /// Checks the speed implied by moving from the last accepted state to
    /// `new_position` at server time `now`, against `limit`.
    pub fn check_with_limit(
        &self,
        state: &EntityMotionState,
        new_position: &Vec3,
        now: f64,
        limit: f32,
    ) -> Result<(), MoveRejection> {
        let elapsed = now - state.last_update_time;
        // Duplicate or out-of-order; also guards the division below.
        if elapsed <= 0.0 || elapsed.is_nan() {
            return Err(MoveRejection::StaleTimestamp { elapsed });
        }

        let distance = new_position.distance(&state.last_valid_position) as f64;
        let speed = distance / elapsed;
        // A NaN speed must never count as within the limit.
        if speed.is_nan() || speed > limit as f64 {
            return Err(MoveRejection::SpeedViolation {
                speed: speed as f32,
                max_speed: limit,
            });
        }

        Ok(())
    }

    pub fn check(
        &self,
        state: &EntityMotionState,
        new_position: &Vec3,
        now: f64,
    ) -> Result<(), MoveRejection> {
        self.check_with_limit(state, new_position, now, self.max_speed)
    }

    pub fn is_speed_valid(&self, state: &EntityMotionState, new_position: &Vec3, now: f64) -> bool {
        self.check(state, new_position, now).is_ok()
    }
}
