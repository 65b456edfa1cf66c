//! Unit-to-neighbor dependency graph.

use partisim_core::{CompartmentMap, Direction, RegionId};
use smallvec::SmallVec;

/// One dependency: the unit reads the halo published by `neighbor`, which lies in `direction`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Edge {
    pub direction: Direction,
    pub neighbor: RegionId,
}

/// Adjacency list keyed by unit id, rebuilt whenever the compartment map changes.
///
/// Edges are per direction, so on small tori the same neighbor may appear
/// more than once (a 2x2 grid has the same unit on its left and right).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DependencyGraph {
    edges: Vec<SmallVec<[Edge; 8]>>,
}

impl DependencyGraph {
    #[must_use]
    pub fn from_map(map: &CompartmentMap) -> Self {
        let edges = map
            .regions()
            .iter()
            .map(|region| {
                map.neighbors(region.id)
                    .into_iter()
                    .map(|(direction, neighbor)| Edge {
                        direction,
                        neighbor,
                    })
                    .collect()
            })
            .collect();
        Self { edges }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.edges.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.edges.is_empty()
    }

    /// Dependencies of `unit` in canonical direction order.
    #[must_use]
    pub fn edges(&self, unit: RegionId) -> &[Edge] {
        self.edges
            .get(unit.index())
            .map(SmallVec::as_slice)
            .unwrap_or(&[])
    }

    #[must_use]
    pub fn edge_count(&self) -> usize {
        self.edges.iter().map(SmallVec::len).sum()
    }

    /// Whether `unit` waits on `neighbor` for any direction.
    #[must_use]
    pub fn depends_on(&self, unit: RegionId, neighbor: RegionId) -> bool {
        self.edges(unit).iter().any(|edge| edge.neighbor == neighbor)
    }

    /// Every edge has its mirror: `A --d--> B` implies `B --opposite(d)--> A`.
    #[must_use]
    pub fn is_symmetric(&self) -> bool {
        self.edges.iter().enumerate().all(|(index, edges)| {
            let unit = RegionId(index as u32);
            edges.iter().all(|edge| {
                self.edges(edge.neighbor).contains(&Edge {
                    direction: edge.direction.opposite(),
                    neighbor: unit,
                })
            })
        })
    }
}
