//! Core types shared across the partisim workspace: entities, halos, the
//! per-region execution unit, the integrator seam, commands, statistics,
//! configuration, the error taxonomy and the backend contract.

pub mod backend;
pub mod command;
pub mod config;
pub mod entity;
pub mod error;
pub mod halo;
pub mod physics;
pub mod stats;
pub mod topology;
pub mod unit;

pub use backend::{
    BackendSelection, CompletionSignal, DrainReport, EngineState, SimulationBackend, StepDriver,
    StepTicket,
};
pub use command::{
    CommandReceiver, CommandSender, EngineCommand, apply_command, create_command_bus,
    drain_pending_commands, try_submit,
};
pub use config::{EngineConfig, SteppingMode};
pub use entity::{Entity, EntityId, EntityKind, IdAllocator, seed_population};
pub use error::{
    ConfigurationError, DeviceFault, EngineError, FaultKind, ShutdownTimeout, SimulationFault,
};
pub use halo::{HaloInputs, HaloOutputs, HaloStrip, SharedHalo};
pub use physics::{Integrator, SoftParticleIntegrator, StepFrame};
pub use stats::{
    AggregatedSnapshot, RegionSnapshot, SnapshotTotals, UnitFrame, UnitStats, newest_entities,
};
pub use topology::WorldTopology;
pub use unit::{ExecutionUnit, UnitParams};

pub use partisim_index::{
    CompartmentLayout, CompartmentMap, Direction, IndexError, Rect, Region, RegionId, Vec2,
    WorldSize,
};
