//! Error taxonomy shared by every backend.

use std::fmt;
use std::time::Duration;

use partisim_index::{Direction, IndexError, RegionId};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::backend::EngineState;
use crate::entity::EntityId;

/// Invalid partition or world parameters. Rejected before any worker starts.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ConfigurationError {
    #[error(transparent)]
    Layout(#[from] IndexError),
    /// Indicates an invalid configuration value.
    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),
    #[error("no execution units are configured")]
    NoUnits,
}

/// What went wrong inside a unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FaultKind {
    NegativeEnergy {
        entity: EntityId,
        energy: f32,
    },
    NonPositiveMass {
        entity: EntityId,
        mass: f32,
    },
    NonFiniteState {
        entity: EntityId,
    },
    HaloOutOfOrder {
        direction: Direction,
        expected: u64,
        found: u64,
    },
    WorkerPanicked,
    Integrator(String),
}

impl fmt::Display for FaultKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NegativeEnergy { entity, energy } => {
                write!(f, "entity {} has negative energy {energy}", entity.0)
            }
            Self::NonPositiveMass { entity, mass } => {
                write!(f, "entity {} has non-positive mass {mass}", entity.0)
            }
            Self::NonFiniteState { entity } => {
                write!(f, "entity {} has a non-finite position or velocity", entity.0)
            }
            Self::HaloOutOfOrder {
                direction,
                expected,
                found,
            } => write!(
                f,
                "halo from {direction:?} carried step {found}, expected step {expected}"
            ),
            Self::WorkerPanicked => f.write_str("worker thread panicked"),
            Self::Integrator(message) => write!(f, "integrator failed: {message}"),
        }
    }
}

/// Entity-level invariant violation inside one unit. Fatal for the whole session.
#[derive(Debug, Error, Clone, PartialEq, Serialize, Deserialize)]
#[error("simulation fault in {unit} at step {step}: {kind}")]
pub struct SimulationFault {
    pub unit: RegionId,
    pub step: u64,
    pub kind: FaultKind,
}

/// GPU backend failure. Fatal; there is no CPU fallback within a session.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum DeviceFault {
    #[error("no compatible GPU adapter: {0}")]
    NoAdapter(String),
    #[error("device request failed: {0}")]
    DeviceRequest(String),
    #[error("pipeline validation failed: {0}")]
    Validation(String),
    #[error("kernel fault at step {step} in entity slot {slot}: {reason}")]
    Kernel {
        step: u64,
        slot: u32,
        reason: &'static str,
    },
    #[error("device lost: {0}")]
    Lost(String),
    #[error("buffer readback failed: {0}")]
    Readback(String),
    #[error("world holds {requested} entities but the device was sized for {capacity}")]
    CapacityExceeded { requested: usize, capacity: usize },
    #[error("device resources were already released")]
    Released,
}

/// Workers that did not quiesce before the drain deadline.
#[derive(Debug, Error, Clone, PartialEq)]
#[error("{} worker(s) did not quiesce within {timeout:?}: {units:?}", units.len())]
pub struct ShutdownTimeout {
    pub units: Vec<RegionId>,
    pub timeout: Duration,
}

/// Umbrella error returned by backend operations.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum EngineError {
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),
    #[error(transparent)]
    Fault(#[from] SimulationFault),
    #[error(transparent)]
    Device(#[from] DeviceFault),
    #[error(transparent)]
    ShutdownTimeout(#[from] ShutdownTimeout),
    #[error("{operation} is not allowed while the engine is {state}")]
    InvalidState {
        operation: &'static str,
        state: EngineState,
    },
    #[error("snapshot request was cancelled by a topology change or shutdown")]
    SnapshotCancelled,
    #[error("snapshot request timed out after {0:?}")]
    SnapshotTimeout(Duration),
    #[error("engine stopped before reaching step {0}")]
    Cancelled(u64),
    #[error("command queue is full; retry later")]
    CommandQueueFull,
    #[error("command queue has been closed")]
    CommandQueueClosed,
    #[error("worker thread error: {0}")]
    Worker(String),
}

impl EngineError {
    /// Faults that end the session.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Fault(_) | Self::Device(_))
    }
}

impl From<IndexError> for EngineError {
    fn from(err: IndexError) -> Self {
        Self::Configuration(err.into())
    }
}
