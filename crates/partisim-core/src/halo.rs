//! Boundary strips exchanged between neighboring units.

use std::sync::Arc;

use partisim_index::{Direction, RegionId};

use crate::entity::Entity;

/// Immutable boundary data one unit publishes toward one neighbor after
/// completing `step`.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct HaloStrip {
    pub step: u64,
    pub producer: RegionId,
    /// Producer entities within the halo width of the consumer's region.
    pub ghosts: Vec<Entity>,
    /// Entities that crossed from the producer into the consumer's region.
    pub emigrants: Vec<Entity>,
}

impl HaloStrip {
    /// Halo used where a neighbor is missing: no entities, no forces.
    #[must_use]
    pub fn empty(step: u64, producer: RegionId) -> Self {
        Self {
            step,
            producer,
            ghosts: Vec::new(),
            emigrants: Vec::new(),
        }
    }
}

pub type SharedHalo = Arc<HaloStrip>;

/// Halos read by a unit for one step, indexed by the direction of the producer.
/// `None` marks a missing neighbor.
#[derive(Debug, Clone, Default)]
pub struct HaloInputs {
    slots: [Option<SharedHalo>; 8],
}

impl HaloInputs {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, direction: Direction, halo: SharedHalo) {
        self.slots[direction.index()] = Some(halo);
    }

    #[must_use]
    pub fn get(&self, direction: Direction) -> Option<&SharedHalo> {
        self.slots[direction.index()].as_ref()
    }

    pub fn iter(&self) -> impl Iterator<Item = (Direction, &SharedHalo)> + '_ {
        Direction::ALL
            .iter()
            .filter_map(|&direction| self.get(direction).map(|halo| (direction, halo)))
    }
}

/// Halos produced by a unit after a step, indexed by the direction of the consumer.
#[derive(Debug, Clone, Default)]
pub struct HaloOutputs {
    slots: [Option<SharedHalo>; 8],
}

impl HaloOutputs {
    pub fn insert(&mut self, direction: Direction, halo: HaloStrip) {
        self.slots[direction.index()] = Some(Arc::new(halo));
    }

    #[must_use]
    pub fn get(&self, direction: Direction) -> Option<&SharedHalo> {
        self.slots[direction.index()].as_ref()
    }

    pub fn iter(&self) -> impl Iterator<Item = (Direction, &SharedHalo)> + '_ {
        Direction::ALL
            .iter()
            .filter_map(|&direction| self.get(direction).map(|halo| (direction, halo)))
    }
}
