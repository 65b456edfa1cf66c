//! One engine session: a backend fixed at open time plus the external command bus.

use partisim_core::{
    AggregatedSnapshot, BackendSelection, CommandReceiver, CommandSender, DrainReport,
    EngineCommand, EngineConfig, EngineError, EngineState, Rect, RegionSnapshot,
    SimulationBackend, create_command_bus, drain_pending_commands, try_submit,
};
use partisim_gpu::GpuEngine;
use partisim_threads::ThreadController;
use serde::Serialize;
use tracing::{debug, info, warn};

/// What a finished run reports back to the caller.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct RunSummary {
    pub backend: String,
    pub requested_steps: u64,
    pub reached_step: u64,
    pub commands_applied: usize,
    pub snapshots: Vec<AggregatedSnapshot>,
    pub joined_workers: usize,
    pub abandoned_units: Vec<u32>,
}

pub struct Session {
    selection: BackendSelection,
    backend: Box<dyn SimulationBackend>,
    sender: CommandSender,
    commands: CommandReceiver,
    applied: usize,
}

impl Session {
    /// Build and configure the selected backend. The backend cannot be swapped later.
    pub fn open(config: EngineConfig, selection: BackendSelection) -> Result<Self, EngineError> {
        let capacity = config.command_queue_capacity;
        let backend: Box<dyn SimulationBackend> = match selection {
            BackendSelection::PartitionedCpu { workers } => {
                let mut controller = ThreadController::new(config)?;
                controller.configure(workers)?;
                Box::new(controller)
            }
            BackendSelection::GpuResident => {
                let mut engine = GpuEngine::new(config)?;
                engine.configure()?;
                Box::new(engine)
            }
        };
        info!(backend = backend.name(), ?selection, "session opened");
        Ok(Self::with_backend(selection, backend, capacity))
    }

    /// Wrap an already configured backend.
    pub fn with_backend(
        selection: BackendSelection,
        backend: Box<dyn SimulationBackend>,
        queue_capacity: usize,
    ) -> Self {
        let (sender, commands) = create_command_bus(queue_capacity.max(1));
        Self {
            selection,
            backend,
            sender,
            commands,
            applied: 0,
        }
    }

    pub fn selection(&self) -> BackendSelection {
        self.selection
    }

    pub fn backend(&self) -> &dyn SimulationBackend {
        self.backend.as_ref()
    }

    pub fn state(&self) -> EngineState {
        self.backend.state()
    }

    /// Handle for collaborators that want to queue commands from other threads.
    pub fn command_sender(&self) -> CommandSender {
        self.sender.clone()
    }

    /// Queue a command without blocking; it is applied before the next step.
    pub fn enqueue(&self, command: EngineCommand) -> Result<(), EngineError> {
        try_submit(&self.sender, command)
    }

    /// Hand queued commands to the backend. Rejected commands are logged and skipped.
    pub fn apply_pending(&mut self) -> Result<usize, EngineError> {
        let mut pending = Vec::new();
        drain_pending_commands(&self.commands, |command| pending.push(command));
        let mut applied = 0;
        for command in pending {
            match self.backend.submit(command) {
                Ok(()) => applied += 1,
                Err(EngineError::Configuration(err)) => {
                    warn!(%err, "command rejected by the backend");
                }
                Err(err) => return Err(err),
            }
        }
        self.applied += applied;
        Ok(applied)
    }

    pub fn start(&mut self) -> Result<(), EngineError> {
        self.backend.start()
    }

    /// Advance one step at a time, applying queued commands between steps and
    /// taking a snapshot every `snapshot_every` steps (never when zero).
    pub fn run(
        &mut self,
        steps: u64,
        snapshot_every: u64,
    ) -> Result<Vec<AggregatedSnapshot>, EngineError> {
        if self.backend.state() == EngineState::Ready {
            self.backend.start()?;
        }
        let mut snapshots = Vec::new();
        for _ in 0..steps {
            self.apply_pending()?;
            let reached = self.backend.advance_step()?;
            self.backend.poll()?;
            debug!(reached, "session step completed");
            if snapshot_every > 0 && reached.is_multiple_of(snapshot_every) {
                let snapshot = self.backend.request_snapshot()?;
                info!(
                    step = snapshot.step,
                    entities = snapshot.totals.entities(),
                    energy = snapshot.totals.total_energy(),
                    "snapshot aggregated",
                );
                snapshots.push(snapshot);
            }
        }
        Ok(snapshots)
    }

    pub fn read_region(&self, rect: Rect) -> Result<RegionSnapshot, EngineError> {
        self.backend.read_region(rect)
    }

    pub fn snapshot(&self) -> Result<AggregatedSnapshot, EngineError> {
        self.backend.request_snapshot()
    }

    pub fn stop(&mut self) -> Result<DrainReport, EngineError> {
        let report = self.backend.stop()?;
        if !report.is_clean() {
            warn!(abandoned = ?report.abandoned, "session stopped with abandoned workers");
        }
        info!(
            joined = report.joined,
            elapsed_ms = report.elapsed.as_millis() as u64,
            "session stopped"
        );
        Ok(report)
    }

    /// Run `steps` steps from a fresh start, stop, and summarise.
    pub fn run_to_completion(
        &mut self,
        steps: u64,
        snapshot_every: u64,
    ) -> Result<RunSummary, EngineError> {
        let outcome = self.run(steps, snapshot_every);
        let report = self.stop()?;
        let mut snapshots = outcome?;
        if snapshots.last().is_none_or(|last| last.step != self.backend.step_counter())
            && let Some(last) = self.backend.last_snapshot()
            && last.step == self.backend.step_counter()
        {
            snapshots.push(last);
        }
        Ok(RunSummary {
            backend: self.backend.name().to_owned(),
            requested_steps: steps,
            reached_step: self.backend.step_counter(),
            commands_applied: self.applied,
            snapshots,
            joined_workers: report.joined,
            abandoned_units: report.abandoned.iter().map(|unit| unit.0).collect(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use partisim_core::{Entity, EntityId, EntityKind, Vec2};

    fn config() -> EngineConfig {
        EngineConfig {
            world_width: 200,
            world_height: 200,
            initial_entities: 60,
            rng_seed: Some(11),
            command_queue_capacity: 2,
            ..EngineConfig::default()
        }
    }

    fn open() -> Session {
        Session::open(config(), BackendSelection::PartitionedCpu { workers: 4 }).expect("open")
    }

    #[test]
    fn commands_wait_for_the_next_step() {
        let mut session = open();
        session
            .enqueue(EngineCommand::Remove(EntityId(1)))
            .expect("enqueue");
        assert_eq!(session.snapshot().expect("snapshot").totals.entities(), 60);
        session.run(1, 0).expect("run");
        assert_eq!(session.snapshot().expect("snapshot").totals.entities(), 59);
        session.stop().expect("stop");
    }

    #[test]
    fn a_full_bus_reports_instead_of_blocking() {
        let session = open();
        let spawn = EngineCommand::Spawn(Entity::new(
            EntityKind::Cell,
            Vec2::new(5.0, 5.0),
            Vec2::ZERO,
            1.0,
            1.0,
        ));
        session.enqueue(spawn.clone()).expect("first");
        session.enqueue(spawn.clone()).expect("second");
        assert_eq!(session.enqueue(spawn), Err(EngineError::CommandQueueFull));
    }

    #[test]
    fn summaries_end_with_the_final_step() {
        let mut session = open();
        let summary = session.run_to_completion(6, 4).expect("run");
        assert_eq!(summary.backend, "partitioned-cpu");
        assert_eq!(summary.reached_step, 6);
        assert_eq!(summary.joined_workers, 4);
        assert!(summary.abandoned_units.is_empty());
        let steps: Vec<u64> = summary.snapshots.iter().map(|s| s.step).collect();
        assert_eq!(steps.first(), Some(&4));
        assert_eq!(session.state(), EngineState::Stopped);
    }
}
