use log::debug;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use shared::{AnimationState, EntitySnapshot, Vec3};
use std::collections::HashMap;
use std::f32::consts::FRAC_PI_2;

/// Scripted walker standing in for player input. Walks forward at a fixed
/// speed and picks a new heading every few seconds.
#[derive(Debug, Clone)]
pub struct LocalMover {
    heading: f32,
    speed: f32,
    turn_interval: f32,
    until_turn: f32,
    rng: StdRng,
}

impl LocalMover {
    pub fn new(speed: f32, turn_interval: f32, seed: u64) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        let heading = rng.gen_range(-std::f32::consts::PI..std::f32::consts::PI);
        Self {
            heading,
            speed: speed.max(0.0),
            turn_interval,
            until_turn: turn_interval,
            rng,
        }
    }

    pub fn speed(&self) -> f32 {
        self.speed
    }

    pub fn heading(&self) -> f32 {
        self.heading
    }

    fn forward(&self) -> Vec3 {
        Vec3::new(self.heading.cos(), 0.0, self.heading.sin())
    }

    /// Predicts the next position starting from `from`.
    pub fn step(&mut self, from: Vec3, dt: f32) -> Vec3 {
        self.until_turn -= dt;
        if self.until_turn <= 0.0 {
            self.heading += self.rng.gen_range(-FRAC_PI_2..FRAC_PI_2);
            self.until_turn = self.turn_interval;
            debug!("Turning to heading {:.2}", self.heading);
        }

        from + self.forward() * (self.speed * dt)
    }

    /// Facing as euler degrees, yaw only
    pub fn rotation(&self) -> Vec3 {
        Vec3::new(0.0, self.heading.to_degrees(), 0.0)
    }

    pub fn animation(&self) -> AnimationState {
        let moving = self.speed > 0.0;
        AnimationState {
            horizontal_movement: 0.0,
            vertical_movement: if moving { 1.0 } else { 0.0 },
            is_moving: moving,
            is_grounded: true,
            ..AnimationState::default()
        }
    }
}

/// Last known public state of every other entity
#[derive(Debug, Clone, Default)]
pub struct RemoteEntities {
    pub tick: u32,
    pub entities: HashMap<u32, EntitySnapshot>,
}

impl RemoteEntities {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the view with a world snapshot and returns our own entry.
    pub fn apply_world_state(
        &mut self,
        tick: u32,
        entities: Vec<EntitySnapshot>,
        own_id: Option<u32>,
    ) -> Option<EntitySnapshot> {
        self.tick = tick;
        self.entities.clear();

        let mut own = None;
        for entity in entities {
            if Some(entity.entity_id) == own_id {
                own = Some(entity);
            } else {
                self.entities.insert(entity.entity_id, entity);
            }
        }
        own
    }

    pub fn apply_entity(&mut self, state: EntitySnapshot) {
        self.entities.insert(state.entity_id, state);
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    /// Closest other entity within `range` of `position`.
    pub fn nearest_within(&self, position: Vec3, range: f32) -> Option<u32> {
        self.entities
            .values()
            .map(|e| (e.entity_id, e.position.distance(&position)))
            .filter(|(_, d)| *d <= range)
            .min_by(|a, b| a.1.total_cmp(&b.1))
            .map(|(id, _)| id)
    }
}
