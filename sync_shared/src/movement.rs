//! Input-driven movement.
//!
//! The server integrates owner inputs into transforms once per tick. Kept
//! free of wall-clock reads so a replay with the same inputs lands on the same
//! positions.

use bitflags::bitflags;

use crate::{
    ecs::{EntityStore, HumanSync, Transform},
    math::Vec3,
};

bitflags! {
    /// Buttons held for one client tick.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct InputBits: u32 {
        const FORWARD = 1 << 0;
        const BACKWARD = 1 << 1;
        const LEFT = 1 << 2;
        const RIGHT = 1 << 3;
        const UP = 1 << 4;
        const DOWN = 1 << 5;
        const SPRINT = 1 << 6;
    }
}

impl InputBits {
    /// Local-space wish direction (+X forward, +Y left, +Z up), unit length or zero.
    pub fn wish_direction(self) -> Vec3 {
        let axis = |pos: Self, neg: Self| -> f32 {
            f32::from(u8::from(self.contains(pos))) - f32::from(u8::from(self.contains(neg)))
        };
        Vec3::new(
            axis(Self::FORWARD, Self::BACKWARD),
            axis(Self::LEFT, Self::RIGHT),
            axis(Self::UP, Self::DOWN),
        )
        .normalize_or_zero()
    }
}

/// Movement tuning.
#[derive(Debug, Clone, Copy)]
pub struct MovementConfig {
    /// Units per second.
    pub move_speed: f32,
    pub sprint_multiplier: f32,
}

impl Default for MovementConfig {
    fn default() -> Self {
        Self {
            move_speed: 5.0,
            sprint_multiplier: 2.0,
        }
    }
}

/// A per-tick simulation pass over the store.
pub trait SimulationSystem: Send + Sync {
    fn step(&mut self, store: &mut EntityStore, dt_sec: f32);
}

/// Integrates `HumanSync.input_bits` into velocity and position.
#[derive(Debug, Default)]
pub struct InputMovement {
    pub cfg: MovementConfig,
}

impl InputMovement {
    pub fn new(cfg: MovementConfig) -> Self {
        Self { cfg }
    }
}

impl SimulationSystem for InputMovement {
    fn step(&mut self, store: &mut EntityStore, dt_sec: f32) {
        let inputs: Vec<_> = store
            .query::<HumanSync>()
            .map(|(id, sync)| (id, InputBits::from_bits_truncate(sync.input_bits)))
            .collect();

        for (id, bits) in inputs {
            let Some(transform) = store.get_mut::<Transform>(id) else {
                continue;
            };
            let mut speed = self.cfg.move_speed;
            if bits.contains(InputBits::SPRINT) {
                speed *= self.cfg.sprint_multiplier;
            }
            transform.velocity = transform.rotation.rotate(bits.wish_direction()) * speed;
            transform.position = transform.position + transform.velocity * dt_sec;
        }
    }
}
