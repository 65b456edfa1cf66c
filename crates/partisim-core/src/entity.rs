//! Cells and particles owned by execution units.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use partisim_index::{Vec2, WorldSize};
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::config::EngineConfig;

/// Globally unique entity identifier. `0` is reserved for "not yet assigned".
#[derive(
    Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord,
)]
pub struct EntityId(pub u64);

impl EntityId {
    pub const UNASSIGNED: Self = Self(0);

    #[must_use]
    pub const fn is_assigned(self) -> bool {
        self.0 != 0
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "entity#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    /// Bound cell carrying internal energy.
    #[default]
    Cell,
    /// Free energy particle.
    Particle,
}

/// Plain simulation entity. Copyable so halos can hand out ghosts freely.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct Entity {
    pub id: EntityId,
    pub kind: EntityKind,
    pub position: Vec2,
    pub velocity: Vec2,
    pub mass: f32,
    pub energy: f32,
}

impl Entity {
    #[must_use]
    pub fn new(kind: EntityKind, position: Vec2, velocity: Vec2, mass: f32, energy: f32) -> Self {
        Self {
            id: EntityId::UNASSIGNED,
            kind,
            position,
            velocity,
            mass,
            energy,
        }
    }

    #[must_use]
    pub fn with_id(mut self, id: EntityId) -> Self {
        self.id = id;
        self
    }

    #[must_use]
    pub fn kinetic_energy(&self) -> f32 {
        0.5 * self.mass * self.velocity.length_sq()
    }

    #[must_use]
    pub fn momentum(&self) -> Vec2 {
        self.velocity * self.mass
    }
}

/// Hands out entity ids. Shared across units through an `Arc`.
#[derive(Debug)]
pub struct IdAllocator {
    next: AtomicU64,
}

impl Default for IdAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl IdAllocator {
    #[must_use]
    pub fn new() -> Self {
        Self {
            next: AtomicU64::new(1),
        }
    }

    /// Continue after the largest id already present in `entities`.
    #[must_use]
    pub fn after<'a>(entities: impl IntoIterator<Item = &'a Entity>) -> Self {
        let max = entities.into_iter().map(|e| e.id.0).max().unwrap_or(0);
        Self {
            next: AtomicU64::new(max + 1),
        }
    }

    pub fn allocate(&self) -> EntityId {
        EntityId(self.next.fetch_add(1, Ordering::Relaxed))
    }

    /// Assign a fresh id when `entity` has none.
    pub fn assign(&self, entity: &mut Entity) {
        if !entity.id.is_assigned() {
            entity.id = self.allocate();
        }
    }
}

/// Seed the initial population described by `config`.
pub fn seed_population<R: Rng + ?Sized>(
    config: &EngineConfig,
    world: WorldSize,
    ids: &IdAllocator,
    rng: &mut R,
) -> Vec<Entity> {
    let particles = (config.initial_entities as f32 * config.particle_fraction).round() as usize;
    let extent = world.as_vec2();
    (0..config.initial_entities)
        .map(|index| {
            let kind = if index < particles {
                EntityKind::Particle
            } else {
                EntityKind::Cell
            };
            let position = Vec2::new(
                rng.random_range(0.0..extent.x),
                rng.random_range(0.0..extent.y),
            );
            let heading = rng.random_range(0.0..std::f32::consts::TAU);
            let speed = if config.initial_speed > 0.0 {
                rng.random_range(0.0..config.initial_speed)
            } else {
                0.0
            };
            let velocity = Vec2::new(heading.cos() * speed, heading.sin() * speed);
            let mass = match kind {
                EntityKind::Cell => 1.0,
                EntityKind::Particle => 0.25,
            };
            Entity::new(kind, position, velocity, mass, config.initial_energy)
                .with_id(ids.allocate())
        })
        .collect()
}
