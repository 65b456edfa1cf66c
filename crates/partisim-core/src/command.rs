//! Mutation requests applied between steps, and the bounded queues that carry them.

use crossfire::mpmc;
use crossfire::{MAsyncTx, MRx, TryRecvError, TrySendError, detect_backoff_cfg};
use partisim_index::{Rect, Vec2};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::entity::{Entity, EntityId, IdAllocator};
use crate::error::EngineError;

/// Edit requests submitted by collaborators. Never applied mid-step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineCommand {
    /// Insert an entity; an unassigned id is allocated on application.
    Spawn(Entity),
    Remove(EntityId),
    SetEnergy { id: EntityId, energy: f32 },
    /// Add `impulse / mass` to the entity's velocity.
    ApplyImpulse { id: EntityId, impulse: Vec2 },
    /// Remove every entity inside the rectangle.
    ClearRect(Rect),
}

impl EngineCommand {
    /// Position a spawn targets; other commands are located by id or rectangle.
    #[must_use]
    pub fn spawn_position(&self) -> Option<Vec2> {
        match self {
            Self::Spawn(entity) => Some(entity.position),
            _ => None,
        }
    }
}

/// Apply `command` to `entities`, returning how many entities were affected.
pub fn apply_command(entities: &mut Vec<Entity>, ids: &IdAllocator, command: &EngineCommand) -> usize {
    match command {
        EngineCommand::Spawn(entity) => {
            if !(entity.position.is_finite() && entity.velocity.is_finite())
                || entity.mass <= 0.0
                || entity.energy < 0.0
            {
                warn!(?entity, "rejecting spawn of an invalid entity");
                return 0;
            }
            let mut entity = *entity;
            ids.assign(&mut entity);
            entities.push(entity);
            1
        }
        EngineCommand::Remove(id) => {
            let before = entities.len();
            entities.retain(|entity| entity.id != *id);
            before - entities.len()
        }
        EngineCommand::SetEnergy { id, energy } => {
            if !energy.is_finite() || *energy < 0.0 {
                warn!(%id, energy, "rejecting invalid energy");
                return 0;
            }
            let mut touched = 0;
            for entity in entities.iter_mut().filter(|entity| entity.id == *id) {
                entity.energy = *energy;
                touched += 1;
            }
            touched
        }
        EngineCommand::ApplyImpulse { id, impulse } => {
            if !impulse.is_finite() {
                return 0;
            }
            let mut touched = 0;
            for entity in entities.iter_mut().filter(|entity| entity.id == *id) {
                entity.velocity += *impulse * (1.0 / entity.mass);
                touched += 1;
            }
            touched
        }
        EngineCommand::ClearRect(rect) => {
            let before = entities.len();
            entities.retain(|entity| !rect.contains(entity.position));
            before - entities.len()
        }
    }
}

pub type CommandSender = MAsyncTx<EngineCommand>;
pub type CommandReceiver = MRx<EngineCommand>;

pub fn create_command_bus(capacity: usize) -> (CommandSender, CommandReceiver) {
    detect_backoff_cfg();
    mpmc::bounded_tx_async_rx_blocking(capacity)
}

/// Non-blocking submit; a full queue is reported instead of waited on.
pub fn try_submit(sender: &CommandSender, command: EngineCommand) -> Result<(), EngineError> {
    match sender.try_send(command) {
        Ok(()) => Ok(()),
        Err(TrySendError::Full(cmd)) => {
            warn!(?cmd, "command queue full; dropping command");
            Err(EngineError::CommandQueueFull)
        }
        Err(TrySendError::Disconnected(cmd)) => {
            warn!(?cmd, "command queue disconnected");
            Err(EngineError::CommandQueueClosed)
        }
    }
}

/// Hand every queued command to `apply` without blocking. Returns the number drained.
pub fn drain_pending_commands(
    receiver: &CommandReceiver,
    mut apply: impl FnMut(EngineCommand),
) -> usize {
    let mut drained = 0;
    loop {
        match receiver.try_recv() {
            Ok(command) => {
                debug!(?command, "applying engine command");
                apply(command);
                drained += 1;
            }
            Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => break,
        }
    }
    drained
}
