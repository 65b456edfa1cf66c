use std::time::Duration;

use partisim_index::{CompartmentMap, WorldSize};
use rand::{SeedableRng, rngs::SmallRng};
use serde::{Deserialize, Serialize};

use crate::error::ConfigurationError;

/// How workers are paced once started.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SteppingMode {
    /// Workers advance only as far as the host allows via `advance(steps)`.
    #[default]
    Pumped,
    /// Workers advance freely until stopped.
    Continuous,
}

/// Static configuration for one engine session.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EngineConfig {
    /// Width of the world in world units.
    pub world_width: u32,
    /// Height of the world in world units.
    pub world_height: u32,
    /// Whether the world wraps toroidally at its edges; walls reflect otherwise.
    pub wraparound: bool,
    /// Width of the border strip exchanged between neighboring units.
    pub halo_width: f32,
    /// Range of the pairwise repulsion; must not exceed `halo_width`.
    pub interaction_radius: f32,
    /// Simulated time advanced by one step.
    pub time_step: f32,
    /// Speed clamp; `max_speed * time_step` must not exceed `halo_width`.
    pub max_speed: f32,
    /// Peak repulsive force between overlapping entities.
    pub repulsion: f32,
    /// Fraction of velocity removed per unit time.
    pub damping: f32,
    /// Fraction of internal energy dissipated per unit time.
    pub energy_decay: f32,
    /// Number of entities seeded on configure.
    pub initial_entities: usize,
    /// Share of seeded entities that are free particles rather than cells.
    pub particle_fraction: f32,
    /// Internal energy of each seeded entity.
    pub initial_energy: f32,
    /// Upper bound of the random initial speed.
    pub initial_speed: f32,
    /// Optional RNG seed for reproducible worlds.
    pub rng_seed: Option<u64>,
    /// Time each worker gets to quiesce during a drain before it is abandoned.
    pub per_worker_timeout_ms: u64,
    /// Maximum number of units computing a step at the same time; `None` means one per unit.
    pub max_running_threads: Option<usize>,
    /// Pacing of the partitioned CPU workers.
    pub stepping: SteppingMode,
    /// Capacity of each bounded command queue.
    pub command_queue_capacity: usize,
    /// Number of entity slots bound in device memory by the GPU backend.
    pub gpu_max_entities: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            world_width: 1_000,
            world_height: 1_000,
            wraparound: true,
            halo_width: 20.0,
            interaction_radius: 12.0,
            time_step: 0.1,
            max_speed: 50.0,
            repulsion: 40.0,
            damping: 0.05,
            energy_decay: 0.001,
            initial_entities: 512,
            particle_fraction: 0.25,
            initial_energy: 100.0,
            initial_speed: 10.0,
            rng_seed: None,
            per_worker_timeout_ms: 2_000,
            max_running_threads: None,
            stepping: SteppingMode::Pumped,
            command_queue_capacity: 1_024,
            gpu_max_entities: 65_536,
        }
    }
}

impl EngineConfig {
    #[must_use]
    pub fn world_size(&self) -> WorldSize {
        WorldSize::new(self.world_width, self.world_height)
    }

    #[must_use]
    pub fn per_worker_timeout(&self) -> Duration {
        Duration::from_millis(self.per_worker_timeout_ms)
    }

    /// Validates the configuration independent of any partition.
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if self.world_width == 0 || self.world_height == 0 {
            return Err(ConfigurationError::InvalidConfig(
                "world dimensions must be non-zero",
            ));
        }
        if !(self.halo_width.is_finite() && self.halo_width > 0.0) {
            return Err(ConfigurationError::InvalidConfig(
                "halo_width must be positive",
            ));
        }
        if !(self.interaction_radius > 0.0 && self.interaction_radius <= self.halo_width) {
            return Err(ConfigurationError::InvalidConfig(
                "interaction_radius must be positive and no larger than halo_width",
            ));
        }
        if !(self.time_step.is_finite() && self.time_step > 0.0) {
            return Err(ConfigurationError::InvalidConfig(
                "time_step must be positive",
            ));
        }
        if !(self.max_speed.is_finite()
            && self.max_speed >= 0.0
            && self.max_speed * self.time_step <= self.halo_width)
        {
            return Err(ConfigurationError::InvalidConfig(
                "max_speed * time_step must lie in [0, halo_width]",
            ));
        }
        let rates = [self.repulsion, self.damping, self.energy_decay];
        if rates.iter().any(|rate| !(rate.is_finite() && *rate >= 0.0))
            || self.damping * self.time_step > 1.0
            || self.energy_decay * self.time_step > 1.0
        {
            return Err(ConfigurationError::InvalidConfig(
                "repulsion, damping, and energy_decay must be non-negative with per-step rates <= 1",
            ));
        }
        if !(0.0..=1.0).contains(&self.particle_fraction) {
            return Err(ConfigurationError::InvalidConfig(
                "particle_fraction must lie in [0, 1]",
            ));
        }
        if !(self.initial_energy.is_finite()
            && self.initial_energy >= 0.0
            && self.initial_speed >= 0.0
            && self.initial_speed <= self.max_speed)
        {
            return Err(ConfigurationError::InvalidConfig(
                "initial_energy must be non-negative and initial_speed within [0, max_speed]",
            ));
        }
        if self.per_worker_timeout_ms == 0 {
            return Err(ConfigurationError::InvalidConfig(
                "per_worker_timeout_ms must be non-zero",
            ));
        }
        if self.max_running_threads == Some(0) {
            return Err(ConfigurationError::InvalidConfig(
                "max_running_threads must be positive when set",
            ));
        }
        if self.command_queue_capacity == 0 {
            return Err(ConfigurationError::InvalidConfig(
                "command_queue_capacity must be non-zero",
            ));
        }
        Ok(())
    }

    /// Validates that every region of `map` is wide enough for two opposing halo strips.
    pub fn validate_partition(&self, map: &CompartmentMap) -> Result<(), ConfigurationError> {
        let min_span = 2.0 * self.halo_width;
        if map
            .regions()
            .iter()
            .any(|region| (region.width as f32) < min_span || (region.height as f32) < min_span)
        {
            return Err(ConfigurationError::InvalidConfig(
                "every region must be at least twice halo_width in each dimension",
            ));
        }
        Ok(())
    }

    /// Returns the configured RNG seed, generating one from entropy if absent.
    #[must_use]
    pub fn seeded_rng(&self) -> SmallRng {
        match self.rng_seed {
            Some(seed) => SmallRng::seed_from_u64(seed),
            None => {
                let seed: u64 = rand::random();
                SmallRng::seed_from_u64(seed)
            }
        }
    }
}
