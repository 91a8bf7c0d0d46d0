//! Input handling.
//!
//! In a real client this would integrate with windowing and raw mouse and
//! keyboard. This module focuses on producing deterministic per-tick
//! `ClientInput` frames.

use sync_shared::{
    ecs::EntityId,
    math::Quat,
    movement::InputBits,
    protocol::ClientInput,
};

/// User input state at a moment in time.
#[derive(Debug, Clone, Copy, Default)]
pub struct InputState {
    /// +1 forward, -1 backward.
    pub forward: f32,
    /// +1 right, -1 left.
    pub right: f32,
    pub up: f32,
    pub sprint: bool,
    /// Facing around the up axis, radians.
    pub yaw: f32,
}

impl InputState {
    pub fn bits(self) -> InputBits {
        let mut bits = InputBits::empty();
        let mut axis = |v: f32, pos: InputBits, neg: InputBits| {
            if v > 0.0 {
                bits |= pos;
            } else if v < 0.0 {
                bits |= neg;
            }
        };
        axis(self.forward, InputBits::FORWARD, InputBits::BACKWARD);
        axis(self.right, InputBits::RIGHT, InputBits::LEFT);
        axis(self.up, InputBits::UP, InputBits::DOWN);
        if self.sprint {
            bits |= InputBits::SPRINT;
        }
        bits
    }

    pub fn look(self) -> Quat {
        Quat::from_yaw(self.yaw)
    }
}

/// Turns sampled input into a `ClientInput` for a tick.
pub fn build_input(entity: EntityId, tick: u32, input: InputState) -> ClientInput {
    ClientInput {
        entity,
        tick,
        input_bits: input.bits().bits(),
        look: input.look(),
    }
}
