//! Observer-facing value types: per-unit contributions, aggregated snapshots
//! and region reads. All of them are copies; holding one never blocks stepping.

use std::collections::BTreeMap;
use std::collections::btree_map::Entry;

use partisim_index::{Rect, RegionId};
use serde::{Deserialize, Serialize};

use crate::entity::{Entity, EntityId, EntityKind};

/// Contribution of one unit to an aggregated snapshot.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct UnitStats {
    pub unit: RegionId,
    pub step: u64,
    pub cells: usize,
    pub particles: usize,
    pub internal_energy: f64,
    pub kinetic_energy: f64,
    pub momentum: [f64; 2],
}

impl UnitStats {
    /// Summarise `entities` as owned by `unit` after `step`.
    pub fn collect<'a>(
        unit: RegionId,
        step: u64,
        entities: impl IntoIterator<Item = &'a Entity>,
    ) -> Self {
        let mut stats = Self {
            unit,
            step,
            ..Self::default()
        };
        for entity in entities {
            match entity.kind {
                EntityKind::Cell => stats.cells += 1,
                EntityKind::Particle => stats.particles += 1,
            }
            stats.internal_energy += f64::from(entity.energy);
            stats.kinetic_energy += f64::from(entity.kinetic_energy());
            let momentum = entity.momentum();
            stats.momentum[0] += f64::from(momentum.x);
            stats.momentum[1] += f64::from(momentum.y);
        }
        stats
    }

    #[must_use]
    pub fn entities(&self) -> usize {
        self.cells + self.particles
    }
}

/// World-wide totals of one step.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SnapshotTotals {
    pub cells: usize,
    pub particles: usize,
    pub internal_energy: f64,
    pub kinetic_energy: f64,
    pub momentum: [f64; 2],
}

impl SnapshotTotals {
    #[must_use]
    pub fn entities(&self) -> usize {
        self.cells + self.particles
    }

    #[must_use]
    pub fn total_energy(&self) -> f64 {
        self.internal_energy + self.kinetic_energy
    }
}

/// Immutable, single-step aggregate of every unit's contribution.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct AggregatedSnapshot {
    pub step: u64,
    pub units: Vec<UnitStats>,
    pub totals: SnapshotTotals,
}

impl AggregatedSnapshot {
    /// Merge contributions that all describe `step`, ordered by unit id.
    ///
    /// Returns `None` if any contribution belongs to another step; mixed-step
    /// aggregates are never produced.
    #[must_use]
    pub fn merge(step: u64, mut units: Vec<UnitStats>) -> Option<Self> {
        if units.iter().any(|stats| stats.step != step) {
            return None;
        }
        units.sort_by_key(|stats| stats.unit);
        let mut totals = SnapshotTotals::default();
        for stats in &units {
            totals.cells += stats.cells;
            totals.particles += stats.particles;
            totals.internal_energy += stats.internal_energy;
            totals.kinetic_energy += stats.kinetic_energy;
            totals.momentum[0] += stats.momentum[0];
            totals.momentum[1] += stats.momentum[1];
        }
        Some(Self {
            step,
            units,
            totals,
        })
    }
}

/// Entities owned by one unit as of its last completed step.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UnitFrame {
    pub unit: RegionId,
    pub step: u64,
    pub entities: Vec<Entity>,
    /// Emigrants handed over after `step - 1`, keyed by the adopting unit.
    pub handed_off: Vec<(RegionId, Entity)>,
}

/// Collapse the entities of `frames` to one copy per id, keeping the copy of
/// the newest step. Frames of neighboring units may both describe an entity
/// that crossed between them. A handed-off entity is taken from its producer,
/// as of `step - 1`, only while the adopting unit's frame is still at that
/// step or its frame is absent. The result is sorted by id.
pub fn newest_entities<'a>(frames: impl IntoIterator<Item = &'a UnitFrame> + Clone) -> Vec<Entity> {
    let steps: BTreeMap<RegionId, u64> = frames
        .clone()
        .into_iter()
        .map(|frame| (frame.unit, frame.step))
        .collect();
    let mut newest: BTreeMap<EntityId, (u64, Entity)> = BTreeMap::new();
    let mut keep = |step: u64, entity: &Entity| match newest.entry(entity.id) {
        Entry::Vacant(slot) => {
            slot.insert((step, *entity));
        }
        Entry::Occupied(mut slot) => {
            if slot.get().0 < step {
                slot.insert((step, *entity));
            }
        }
    };
    for frame in frames {
        for entity in &frame.entities {
            keep(frame.step, entity);
        }
        let handed_at = frame.step.saturating_sub(1);
        for (consumer, entity) in &frame.handed_off {
            if steps.get(consumer).is_none_or(|&step| step <= handed_at) {
                keep(handed_at, entity);
            }
        }
    }
    newest.into_values().map(|(_, entity)| entity).collect()
}

/// Result of a `read_region` query.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct RegionSnapshot {
    pub rect: Rect,
    /// Oldest step among the units that contributed.
    pub min_step: u64,
    /// Newest step among the units that contributed.
    pub max_step: u64,
    pub entities: Vec<Entity>,
}

impl RegionSnapshot {
    /// Gather the entities of `frames` lying inside `rect`, sorted by id.
    ///
    /// Frames may describe neighboring steps; an entity handed over between
    /// two of them is reported once, from the newer frame.
    pub fn from_frames<'a>(
        rect: Rect,
        frames: impl IntoIterator<Item = &'a UnitFrame> + Clone,
    ) -> Self {
        let mut min_step = u64::MAX;
        let mut max_step = 0;
        for frame in frames.clone() {
            min_step = min_step.min(frame.step);
            max_step = max_step.max(frame.step);
        }
        let mut entities = newest_entities(frames);
        entities.retain(|entity| rect.contains(entity.position));
        Self {
            rect,
            min_step: if min_step == u64::MAX { 0 } else { min_step },
            max_step,
            entities,
        }
    }
}
