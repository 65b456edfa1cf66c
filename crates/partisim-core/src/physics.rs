//! Integrator seam for entity physics.
//!
//! The engine only coordinates who advances what and when; the actual motion
//! law is supplied through [`Integrator`]. [`SoftParticleIntegrator`] is the
//! default: a short-range soft repulsion with damping and energy decay, enough
//! to exercise boundary exchange without pretending to be a real cell model.

use partisim_index::{Rect, RegionId, Vec2};

use crate::config::EngineConfig;
use crate::entity::Entity;
use crate::error::FaultKind;
use crate::topology::WorldTopology;

/// Everything an integrator may touch while advancing one unit by one step.
pub struct StepFrame<'a> {
    pub unit: RegionId,
    /// Step being computed (the unit's completed step plus one).
    pub step: u64,
    pub region: Rect,
    pub topology: WorldTopology,
    pub time_step: f32,
    /// Entities owned by the unit; mutated in place.
    pub interior: &'a mut [Entity],
    /// Read-only copies of neighboring entities as of the previous step.
    pub ghosts: &'a [Entity],
}

/// Advances the entities of one unit. Implementations run concurrently on every
/// worker thread, so they must be `Send + Sync` and keep no per-unit state.
pub trait Integrator: Send + Sync {
    fn name(&self) -> &'static str;

    fn integrate(&self, frame: &mut StepFrame<'_>) -> Result<(), FaultKind>;
}

/// Pairwise soft repulsion, linear damping and exponential energy decay.
#[derive(Debug, Clone, PartialEq)]
pub struct SoftParticleIntegrator {
    pub interaction_radius: f32,
    pub repulsion: f32,
    pub damping: f32,
    pub energy_decay: f32,
    pub max_speed: f32,
}

impl SoftParticleIntegrator {
    #[must_use]
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            interaction_radius: config.interaction_radius,
            repulsion: config.repulsion,
            damping: config.damping,
            energy_decay: config.energy_decay,
            max_speed: config.max_speed,
        }
    }

    fn force_between(&self, topology: &WorldTopology, subject: &Entity, other: &Entity) -> Vec2 {
        let away = topology.delta(other.position, subject.position);
        let dist_sq = away.length_sq();
        let radius = self.interaction_radius;
        if dist_sq >= radius * radius || dist_sq <= f32::EPSILON {
            return Vec2::ZERO;
        }
        let dist = dist_sq.sqrt();
        let magnitude = self.repulsion * (1.0 - dist / radius);
        away * (magnitude / dist)
    }
}

impl Integrator for SoftParticleIntegrator {
    fn name(&self) -> &'static str {
        "soft-particle"
    }

    fn integrate(&self, frame: &mut StepFrame<'_>) -> Result<(), FaultKind> {
        let dt = frame.time_step;
        let topology = frame.topology;
        // Forces are computed against the pre-step state of every entity.
        let before: Vec<Entity> = frame.interior.to_vec();
        let forces: Vec<Vec2> = before
            .iter()
            .map(|subject| {
                before
                    .iter()
                    .chain(frame.ghosts.iter())
                    .filter(|other| other.id != subject.id)
                    .fold(Vec2::ZERO, |acc, other| {
                        acc + self.force_between(&topology, subject, other)
                    })
            })
            .collect();

        let retain = 1.0 - self.damping * dt;
        let keep_energy = 1.0 - self.energy_decay * dt;
        for (entity, force) in frame.interior.iter_mut().zip(forces) {
            let mut velocity = (entity.velocity + force * (dt / entity.mass)) * retain;
            let speed = velocity.length();
            if speed > self.max_speed {
                velocity = velocity * (self.max_speed / speed);
            }
            let mut position = entity.position + velocity * dt;
            topology.confine(&mut position, &mut velocity);
            entity.position = position;
            entity.velocity = velocity;
            entity.energy *= keep_energy;
        }
        Ok(())
    }
}
