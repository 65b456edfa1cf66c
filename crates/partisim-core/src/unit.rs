//! Per-region simulation context.

use std::collections::HashSet;
use std::sync::Arc;

use partisim_index::{CompartmentMap, Direction, Rect, Region, RegionId, Vec2};
use tracing::trace;

use crate::command::{EngineCommand, apply_command};
use crate::entity::{Entity, EntityId, IdAllocator};
use crate::error::{FaultKind, SimulationFault};
use crate::halo::{HaloInputs, HaloOutputs, HaloStrip};
use crate::physics::{Integrator, StepFrame};
use crate::stats::{UnitFrame, UnitStats};
use crate::topology::WorldTopology;

/// Owns the entities of one region and advances them one step at a time.
///
/// Entities that leave the region during a step are parked in per-direction
/// outbound lists and handed to the neighbor through the next halo strip; they
/// still count as owned by this unit until the neighbor adopts them. After the
/// next step they are kept one more step as `handed_off`, since a neighbor one
/// step behind has not adopted them yet. Those copies never count towards
/// statistics; they only keep reads and drains from losing entities in transit.
#[derive(Debug)]
pub struct ExecutionUnit {
    region: Region,
    rect: Rect,
    topology: WorldTopology,
    halo_width: f32,
    time_step: f32,
    step: u64,
    entities: Vec<Entity>,
    outbound: [Vec<Entity>; 8],
    /// Emigrants of the previous step, with the unit they were handed to.
    handed_off: Vec<(RegionId, Entity)>,
    neighbors: [Option<Rect>; 8],
    neighbor_ids: [Option<RegionId>; 8],
    ids: Arc<IdAllocator>,
}

/// Static parameters shared by every unit of one configuration.
#[derive(Debug, Clone, Copy)]
pub struct UnitParams {
    pub topology: WorldTopology,
    pub halo_width: f32,
    pub time_step: f32,
}

impl ExecutionUnit {
    pub fn new(
        region: Region,
        map: &CompartmentMap,
        params: UnitParams,
        ids: Arc<IdAllocator>,
        step: u64,
        entities: Vec<Entity>,
    ) -> Self {
        let mut neighbors = [None; 8];
        let mut neighbor_ids = [None; 8];
        for direction in Direction::ALL {
            let neighbor = map.neighbor(region.id, direction);
            neighbors[direction.index()] = neighbor.map(Region::rect);
            neighbor_ids[direction.index()] = neighbor.map(|region| region.id);
        }
        Self {
            region,
            rect: region.rect(),
            topology: params.topology,
            halo_width: params.halo_width,
            time_step: params.time_step,
            step,
            entities,
            outbound: Default::default(),
            handed_off: Vec::new(),
            neighbors,
            neighbor_ids,
            ids,
        }
    }

    #[must_use]
    pub fn id(&self) -> RegionId {
        self.region.id
    }

    #[must_use]
    pub fn region(&self) -> &Region {
        &self.region
    }

    /// Last completed step.
    #[must_use]
    pub fn step(&self) -> u64 {
        self.step
    }

    /// Entities owned by this unit, including those in transit to a neighbor.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entities.len() + self.outbound.iter().map(Vec::len).sum::<usize>()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn entities(&self) -> impl Iterator<Item = &Entity> + '_ {
        self.entities.iter().chain(self.outbound.iter().flatten())
    }

    /// Halo strips describing the current state, tagged with the last completed step.
    #[must_use]
    pub fn outputs(&self) -> HaloOutputs {
        let mut outputs = HaloOutputs::default();
        let reach = self.halo_width * self.halo_width;
        for direction in Direction::ALL {
            let Some(consumer) = self.neighbors[direction.index()] else {
                continue;
            };
            let ghosts = self
                .entities()
                .filter(|entity| self.topology.distance_sq_to_rect(entity.position, &consumer) <= reach)
                .copied()
                .collect();
            outputs.insert(
                direction,
                HaloStrip {
                    step: self.step,
                    producer: self.region.id,
                    ghosts,
                    emigrants: self.outbound[direction.index()].clone(),
                },
            );
        }
        outputs
    }

    /// Advance by exactly one step.
    ///
    /// `inputs` must hold every neighbor's halo of the last completed step.
    /// Emigrants are adopted first, then `commands` are applied, then the
    /// integrator runs with the deduplicated ghosts as read-only context.
    pub fn advance_step(
        &mut self,
        inputs: &HaloInputs,
        commands: &[EngineCommand],
        integrator: &dyn Integrator,
    ) -> Result<HaloOutputs, SimulationFault> {
        let next = self.step + 1;
        for (direction, halo) in inputs.iter() {
            if halo.step != self.step {
                return Err(self.fault(
                    next,
                    FaultKind::HaloOutOfOrder {
                        direction,
                        expected: self.step,
                        found: halo.step,
                    },
                ));
            }
        }

        // Our own emigrants were published with the previous step and now belong
        // to the receivers; for this step they still act on us as ghosts.
        let mut departed: Vec<(RegionId, Entity)> = Vec::new();
        for direction in Direction::ALL {
            let list = &mut self.outbound[direction.index()];
            if let Some(consumer) = self.neighbor_ids[direction.index()] {
                departed.extend(list.drain(..).map(|entity| (consumer, entity)));
            } else {
                list.clear();
            }
        }
        for (_, halo) in inputs.iter() {
            self.entities.extend_from_slice(&halo.emigrants);
        }
        for command in commands {
            self.apply_in_place(command);
        }
        // Halos tagged with our last step are in hand, so every neighbor has
        // adopted what we handed over the step before.
        self.handed_off.clear();

        let owned: HashSet<EntityId> = self.entities.iter().map(|entity| entity.id).collect();
        let mut seen = HashSet::new();
        let ghosts: Vec<Entity> = departed
            .iter()
            .map(|(_, entity)| entity)
            .chain(inputs.iter().flat_map(|(_, halo)| halo.ghosts.iter()))
            .filter(|ghost| !owned.contains(&ghost.id) && seen.insert(ghost.id))
            .copied()
            .collect();

        let mut frame = StepFrame {
            unit: self.region.id,
            step: next,
            region: self.rect,
            topology: self.topology,
            time_step: self.time_step,
            interior: &mut self.entities,
            ghosts: &ghosts,
        };
        integrator
            .integrate(&mut frame)
            .map_err(|kind| self.fault(next, kind))?;
        if let Some(kind) = self.entities.iter().find_map(invariant_violation) {
            return Err(self.fault(next, kind));
        }

        self.emigrate();
        self.handed_off = departed;
        self.step = next;
        trace!(
            unit = %self.region.id,
            step = next,
            entities = self.entities.len(),
            ghosts = ghosts.len(),
            "unit advanced"
        );
        Ok(self.outputs())
    }

    /// Apply a command while the unit is not stepping. In-transit entities are
    /// edited too, since they have not been handed over yet.
    pub fn apply_command(&mut self, command: &EngineCommand) -> usize {
        let mut touched = self.apply_in_place(command);
        if command.spawn_position().is_none() {
            for list in &mut self.outbound {
                touched += apply_command(list, &self.ids, command);
            }
        }
        touched
    }

    fn apply_in_place(&mut self, command: &EngineCommand) -> usize {
        if let Some(position) = command.spawn_position()
            && !self.rect.contains(position)
        {
            return 0;
        }
        apply_command(&mut self.entities, &self.ids, command)
    }

    #[must_use]
    pub fn stats(&self) -> UnitStats {
        UnitStats::collect(self.region.id, self.step, self.entities())
    }

    #[must_use]
    pub fn frame(&self) -> UnitFrame {
        UnitFrame {
            unit: self.region.id,
            step: self.step,
            entities: self.entities().copied().collect(),
            handed_off: self.handed_off.clone(),
        }
    }

    /// Restore the handed-off list of a unit rebuilt from a frame.
    #[must_use]
    pub fn with_handed_off(mut self, handed_off: Vec<(RegionId, Entity)>) -> Self {
        self.handed_off = handed_off;
        self
    }

    /// Release every owned entity, in-transit ones included.
    #[must_use]
    pub fn into_entities(self) -> Vec<Entity> {
        let mut entities = self.entities;
        entities.extend(self.outbound.into_iter().flatten());
        entities
    }

    fn fault(&self, step: u64, kind: FaultKind) -> SimulationFault {
        SimulationFault {
            unit: self.region.id,
            step,
            kind,
        }
    }

    /// Move entities that left the region into the outbound list of the neighbor now holding them.
    fn emigrate(&mut self) {
        let center = Vec2::new(
            self.rect.x + self.rect.width * 0.5,
            self.rect.y + self.rect.height * 0.5,
        );
        let mut index = 0;
        while index < self.entities.len() {
            let position = self.entities[index].position;
            match self.destination(center, position) {
                Some(direction) => {
                    let entity = self.entities.swap_remove(index);
                    self.outbound[direction.index()].push(entity);
                }
                None => index += 1,
            }
        }
    }

    fn destination(&self, center: Vec2, position: Vec2) -> Option<Direction> {
        if self.rect.contains(position) {
            return None;
        }
        let local = center + self.topology.delta(center, position);
        let dx = axis_side(local.x, self.rect.x, self.rect.right());
        let dy = axis_side(local.y, self.rect.y, self.rect.bottom());
        let preferred = Direction::from_offset(dx, dy)?;
        if self.neighbors[preferred.index()].is_some_and(|rect| rect.contains(position)) {
            return Some(preferred);
        }
        // Small grids can fold several directions onto one region.
        Direction::ALL
            .into_iter()
            .find(|direction| self.neighbors[direction.index()].is_some_and(|rect| rect.contains(position)))
    }
}

fn axis_side(value: f32, lo: f32, hi: f32) -> i32 {
    if value < lo {
        -1
    } else if value >= hi {
        1
    } else {
        0
    }
}

fn invariant_violation(entity: &Entity) -> Option<FaultKind> {
    if !(entity.position.is_finite() && entity.velocity.is_finite() && entity.energy.is_finite()) {
        return Some(FaultKind::NonFiniteState { entity: entity.id });
    }
    if entity.mass.is_nan() || entity.mass <= 0.0 {
        return Some(FaultKind::NonPositiveMass {
            entity: entity.id,
            mass: entity.mass,
        });
    }
    if entity.energy < 0.0 {
        return Some(FaultKind::NegativeEnergy {
            entity: entity.id,
            energy: entity.energy,
        });
    }
    None
}
