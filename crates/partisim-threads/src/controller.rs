//! Thread controller: one long-lived worker per execution unit.
//!
//! Workers never share a global barrier. Each one waits for permission from
//! the step gate, then for the halo of the last completed step on every
//! dependency edge, advances its own unit, publishes the new halos and
//! records progress. Units far apart in the graph may therefore be a few
//! steps apart; the step counter reports the slowest one.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use partisim_core::{
    AggregatedSnapshot, CompartmentLayout, CompartmentMap, ConfigurationError, Direction,
    DrainReport, EngineCommand, EngineConfig, EngineError, EngineState, Entity,
    ExecutionUnit, FaultKind, HaloInputs, IdAllocator, Integrator, Rect, RegionId, RegionSnapshot,
    ShutdownTimeout, SimulationBackend, SimulationFault, SoftParticleIntegrator, StepTicket,
    SteppingMode, UnitFrame, UnitParams, WorldSize, WorldTopology, newest_entities,
    seed_population,
};
use rayon::prelude::*;
use tracing::{debug, error, info, trace, warn};

use crate::gate::{StepGate, Throttle};
use crate::graph::DependencyGraph;
use crate::mailbox::{CancelToken, HaloMailbox};
use crate::monitor::{Monitor, MonitorStats};

/// Everything workers of one run share.
struct Fabric {
    map: CompartmentMap,
    graph: DependencyGraph,
    params: UnitParams,
    ids: Arc<IdAllocator>,
    /// `outboxes[producer][direction]` carries halos toward the neighbor in `direction`.
    outboxes: Vec<[Option<HaloMailbox>; 8]>,
    /// `ledger[consumer][direction]` counts halos consumed from the neighbor in `direction`.
    ledger: Vec<[AtomicU64; 8]>,
    gate: StepGate,
    throttle: Option<Throttle>,
    monitor: Arc<Monitor>,
    /// Last published frame of every unit, swapped under one lock so readers
    /// always see a consistent cut.
    frames: RwLock<Vec<Arc<UnitFrame>>>,
    cancel: CancelToken,
    fault: Mutex<Option<SimulationFault>>,
    integrator: Arc<dyn Integrator>,
}

impl Fabric {
    fn mailbox(&self, producer: RegionId, direction: Direction) -> Option<&HaloMailbox> {
        self.outboxes
            .get(producer.index())
            .and_then(|slots| slots[direction.index()].as_ref())
    }

    fn publish(&self, unit: &ExecutionUnit) {
        for (direction, halo) in unit.outputs().iter() {
            if let Some(mailbox) = self.mailbox(unit.id(), direction) {
                mailbox.publish(Arc::clone(halo));
            }
        }
    }

    /// Wait for the halo tagged `step` on every dependency edge of `unit`.
    fn collect_halos(&self, unit: RegionId, step: u64, idle: &dyn Fn()) -> Option<HaloInputs> {
        let mut inputs = HaloInputs::new();
        for edge in self.graph.edges(unit) {
            let Some(mailbox) = self.mailbox(edge.neighbor, edge.direction.opposite()) else {
                continue;
            };
            let halo = mailbox.wait_for(step, &self.cancel, idle)?;
            self.ledger[unit.index()][edge.direction.index()].fetch_add(1, Ordering::Relaxed);
            inputs.insert(edge.direction, halo);
        }
        Some(inputs)
    }

    fn current_fault(&self) -> Option<SimulationFault> {
        self.fault
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Record the first fault and bring every worker down.
    fn raise_fault(&self, fault: SimulationFault) {
        {
            let mut slot = self.fault.lock().unwrap_or_else(PoisonError::into_inner);
            if slot.is_some() {
                return;
            }
            error!(unit = %fault.unit, step = fault.step, kind = %fault.kind, "simulation fault; stopping every unit");
            *slot = Some(fault.clone());
        }
        self.cancel.cancel();
        let error = EngineError::Fault(fault);
        self.monitor.cancel(error.clone());
        self.gate.fail(&error);
    }

    fn ledger_counts(&self) -> Vec<[u64; 8]> {
        self.ledger
            .iter()
            .map(|counts| std::array::from_fn(|index| counts[index].load(Ordering::Relaxed)))
            .collect()
    }

    fn frames(&self) -> Vec<Arc<UnitFrame>> {
        self.frames
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn store_frame(&self, index: usize, frame: UnitFrame) {
        let frame = Arc::new(frame);
        self.frames.write().unwrap_or_else(PoisonError::into_inner)[index] = frame;
    }
}

/// Reports a worker's exit, and turns a panic into a session fault.
struct WorkerExit {
    index: usize,
    unit: RegionId,
    fabric: Arc<Fabric>,
    exits: Sender<usize>,
}

impl Drop for WorkerExit {
    fn drop(&mut self) {
        if thread::panicking() {
            let step = self.fabric.gate.completed(self.index) + 1;
            self.fabric.raise_fault(SimulationFault {
                unit: self.unit,
                step,
                kind: FaultKind::WorkerPanicked,
            });
        }
        let _ = self.exits.send(self.index);
    }
}

fn run_worker(fabric: &Fabric, mut unit: ExecutionUnit) -> ExecutionUnit {
    let index = unit.id().index();
    let id = unit.id();
    debug!(unit = %id, step = unit.step(), "worker started");
    while !fabric.cancel.is_cancelled() {
        let current = unit.step();
        let (commands, inputs) = {
            // Parked workers still answer snapshot requests for the step they hold.
            let idle = || fabric.monitor.offer(index, current, || unit.stats());
            let Some(commands) = fabric.gate.acquire(index, current + 1, &fabric.cancel, &idle)
            else {
                break;
            };
            idle();
            let Some(inputs) = fabric.collect_halos(id, current, &idle) else {
                break;
            };
            (commands, inputs)
        };

        let permit = match &fabric.throttle {
            Some(throttle) => match throttle.acquire(&fabric.cancel) {
                Some(permit) => Some(permit),
                None => break,
            },
            None => None,
        };
        if !commands.is_empty() {
            debug!(unit = %id, step = current + 1, count = commands.len(), "applying queued commands");
        }
        if let Err(fault) = unit.advance_step(&inputs, &commands, fabric.integrator.as_ref()) {
            drop(permit);
            fabric.raise_fault(fault);
            break;
        }
        // The frame goes out before the halos: once a neighbor can step past
        // us, readers already see what we handed over.
        fabric.store_frame(index, unit.frame());
        fabric.publish(&unit);
        drop(permit);

        fabric.gate.record(index, unit.step());
        fabric.monitor.offer(index, unit.step(), || unit.stats());
        trace!(unit = %id, step = unit.step(), "step published");
    }
    debug!(unit = %id, step = unit.step(), "worker exiting");
    unit
}

struct Worker {
    unit: RegionId,
    handle: JoinHandle<ExecutionUnit>,
}

/// Partitioned CPU engine.
pub struct ThreadController {
    config: EngineConfig,
    layout: Option<CompartmentLayout>,
    state: EngineState,
    map: Option<CompartmentMap>,
    graph: DependencyGraph,
    units: Vec<ExecutionUnit>,
    ids: Arc<IdAllocator>,
    integrator: Arc<dyn Integrator>,
    monitor: Arc<Monitor>,
    fabric: Option<Arc<Fabric>>,
    workers: Vec<Worker>,
    exits: Option<Mutex<Receiver<usize>>>,
    fault: Option<SimulationFault>,
    ledger: Vec<[u64; 8]>,
}

impl ThreadController {
    /// Controller using the default soft-particle integrator.
    pub fn new(config: EngineConfig) -> Result<Self, ConfigurationError> {
        let integrator = Arc::new(SoftParticleIntegrator::from_config(&config));
        Self::with_integrator(config, integrator)
    }

    pub fn with_integrator(
        config: EngineConfig,
        integrator: Arc<dyn Integrator>,
    ) -> Result<Self, ConfigurationError> {
        config.validate()?;
        Ok(Self {
            config,
            layout: None,
            state: EngineState::Unconfigured,
            map: None,
            graph: DependencyGraph::default(),
            units: Vec::new(),
            ids: Arc::new(IdAllocator::new()),
            integrator,
            monitor: Arc::new(Monitor::new()),
            fabric: None,
            workers: Vec::new(),
            exits: None,
            fault: None,
            ledger: Vec::new(),
        })
    }

    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    #[must_use]
    pub fn state(&self) -> EngineState {
        self.state
    }

    #[must_use]
    pub fn map(&self) -> Option<&CompartmentMap> {
        self.map.as_ref()
    }

    #[must_use]
    pub fn graph(&self) -> &DependencyGraph {
        &self.graph
    }

    /// Number of configured execution units.
    #[must_use]
    pub fn unit_count(&self) -> usize {
        self.map.as_ref().map_or(0, CompartmentMap::len)
    }

    /// Fault that stopped the engine, kept until the next configure.
    #[must_use]
    pub fn fault(&self) -> Option<&SimulationFault> {
        self.fault.as_ref()
    }

    #[must_use]
    pub fn monitor_stats(&self) -> MonitorStats {
        self.monitor.stats()
    }

    /// Halos consumed by `unit` per direction (indexed like [`Direction::ALL`]).
    #[must_use]
    pub fn halo_ledger(&self, unit: RegionId) -> Option<[u64; 8]> {
        match &self.fabric {
            Some(fabric) => fabric.ledger_counts().get(unit.index()).copied(),
            None => self.ledger.get(unit.index()).copied(),
        }
    }

    /// Build `compartment_count` regions using the most square grid.
    pub fn configure(&mut self, compartment_count: usize) -> Result<(), EngineError> {
        let layout = CompartmentLayout::from_count(compartment_count)?;
        self.configure_layout(layout)
    }

    /// Build one execution unit per region of `layout` plus the dependency
    /// graph. A running engine is drained first. Entities carry over from the
    /// previous configuration unless it ended in a fault.
    pub fn configure_layout(&mut self, layout: CompartmentLayout) -> Result<(), EngineError> {
        let map = CompartmentMap::new(self.config.world_size(), layout, self.config.wraparound)?;
        self.config.validate_partition(&map)?;
        if self.state == EngineState::Running {
            self.stop()?;
        }
        let (entities, base_step) = self.take_population();
        self.install(map, entities, base_step);
        self.layout = Some(layout);
        self.fault = None;
        self.state = EngineState::Ready;
        info!(
            columns = layout.columns,
            rows = layout.rows,
            entities = self.units.iter().map(ExecutionUnit::len).sum::<usize>(),
            edges = self.graph.edge_count(),
            "thread controller configured"
        );
        Ok(())
    }

    fn take_population(&mut self) -> (Vec<Entity>, u64) {
        if self.fault.is_some() || self.units.is_empty() {
            let ids = IdAllocator::new();
            let mut rng = self.config.seeded_rng();
            let entities = seed_population(&self.config, self.config.world_size(), &ids, &mut rng);
            return (entities, 0);
        }
        let base_step = self.units.iter().map(ExecutionUnit::step).max().unwrap_or(0);
        // Units stopped at different steps may both hold an entity that was
        // handed over in between, or neither may if the adopter lags behind.
        let frames: Vec<UnitFrame> = self.units.drain(..).map(|unit| unit.frame()).collect();
        (newest_entities(&frames), base_step)
    }

    fn unit_params(&self, map: &CompartmentMap) -> UnitParams {
        UnitParams {
            topology: WorldTopology::new(map.world(), map.wraparound()),
            halo_width: self.config.halo_width,
            time_step: self.config.time_step,
        }
    }

    fn install(&mut self, map: CompartmentMap, entities: Vec<Entity>, base_step: u64) {
        let params = self.unit_params(&map);
        self.ids = Arc::new(IdAllocator::after(&entities));
        let mut buckets: Vec<Vec<Entity>> = vec![Vec::new(); map.len()];
        for mut entity in entities {
            params
                .topology
                .confine(&mut entity.position, &mut entity.velocity);
            match map.region_containing(entity.position) {
                Some(region) => buckets[region.id.index()].push(entity),
                None => warn!(entity = %entity.id, "entity outside the world dropped"),
            }
        }
        self.units = map
            .regions()
            .iter()
            .zip(buckets)
            .map(|(region, bucket)| {
                ExecutionUnit::new(*region, &map, params, Arc::clone(&self.ids), base_step, bucket)
            })
            .collect();
        self.graph = DependencyGraph::from_map(&map);
        self.ledger = vec![[0; 8]; map.len()];
        self.monitor.reset(map.len());
        self.map = Some(map);
    }

    /// Spawn one worker per unit. Only valid from `Ready`.
    pub fn start(&mut self) -> Result<(), EngineError> {
        if self.state != EngineState::Ready {
            return Err(EngineError::InvalidState {
                operation: "start",
                state: self.state,
            });
        }
        let Some(map) = self.map.clone() else {
            return Err(ConfigurationError::NoUnits.into());
        };
        let base_step = self.units.iter().map(ExecutionUnit::step).max().unwrap_or(0);
        let limit = match self.config.stepping {
            SteppingMode::Pumped => base_step,
            SteppingMode::Continuous => u64::MAX,
        };
        let count = self.units.len();
        let throttle = self
            .config
            .max_running_threads
            .filter(|&permits| permits < count)
            .map(Throttle::new);
        let fabric = Arc::new(Fabric {
            outboxes: map
                .regions()
                .iter()
                .map(|region| {
                    std::array::from_fn(|index| {
                        map.neighbor(region.id, Direction::ALL[index])
                            .map(|_| HaloMailbox::new())
                    })
                })
                .collect(),
            ledger: (0..count)
                .map(|_| std::array::from_fn(|_| AtomicU64::new(0)))
                .collect(),
            frames: RwLock::new(
                self.units
                    .iter()
                    .map(|unit| Arc::new(unit.frame()))
                    .collect(),
            ),
            params: self.unit_params(&map),
            ids: Arc::clone(&self.ids),
            gate: StepGate::new(count, base_step, limit, self.config.command_queue_capacity),
            throttle,
            monitor: Arc::clone(&self.monitor),
            cancel: CancelToken::default(),
            fault: Mutex::new(None),
            integrator: Arc::clone(&self.integrator),
            graph: self.graph.clone(),
            map,
        });
        for unit in &self.units {
            fabric.publish(unit);
        }

        let (exits_tx, exits_rx) = mpsc::channel();
        self.fabric = Some(Arc::clone(&fabric));
        self.exits = Some(Mutex::new(exits_rx));
        self.state = EngineState::Running;
        for (index, unit) in std::mem::take(&mut self.units).into_iter().enumerate() {
            let id = unit.id();
            let exit = WorkerExit {
                index,
                unit: id,
                fabric: Arc::clone(&fabric),
                exits: exits_tx.clone(),
            };
            let worker_fabric = Arc::clone(&fabric);
            let spawned = thread::Builder::new()
                .name(format!("partisim-unit-{}", id.0))
                .spawn(move || {
                    let _exit = exit;
                    run_worker(&worker_fabric, unit)
                });
            match spawned {
                Ok(handle) => self.workers.push(Worker { unit: id, handle }),
                Err(err) => {
                    error!(unit = %id, %err, "failed to spawn worker thread");
                    self.stop()?;
                    return Err(EngineError::Worker(format!(
                        "failed to spawn worker for {id}: {err}"
                    )));
                }
            }
        }
        info!(
            units = count,
            stepping = ?self.config.stepping,
            max_running_threads = ?self.config.max_running_threads,
            "thread controller started"
        );
        Ok(())
    }

    /// Cooperatively stop every worker, abandoning those that miss the deadline.
    /// Always terminates within roughly one per-worker timeout.
    pub fn stop(&mut self) -> Result<DrainReport, EngineError> {
        if self.state != EngineState::Running {
            return Ok(DrainReport::default());
        }
        self.state = EngineState::Draining;
        info!(workers = self.workers.len(), "draining workers");
        let report = self.drain();
        self.state = EngineState::Stopped;
        info!(
            joined = report.joined,
            abandoned = report.abandoned.len(),
            elapsed_ms = report.elapsed.as_millis() as u64,
            "thread controller stopped"
        );
        Ok(report)
    }

    fn drain(&mut self) -> DrainReport {
        let Some(fabric) = self.fabric.take() else {
            return DrainReport::default();
        };
        let started = Instant::now();
        fabric.cancel.cancel();
        fabric.gate.fail(&EngineError::Cancelled(0));
        self.monitor.cancel(EngineError::SnapshotCancelled);

        let timeout = self.config.per_worker_timeout();
        let deadline = started + timeout;
        let count = fabric.map.len();
        let mut pending: Vec<Option<Worker>> = (0..count).map(|_| None).collect();
        for worker in self.workers.drain(..) {
            let index = worker.unit.index();
            pending[index] = Some(worker);
        }
        let mut returned: Vec<Option<ExecutionUnit>> = (0..count).map(|_| None).collect();
        let mut joined = 0;
        if let Some(exits) = self.exits.take() {
            let exits = exits.into_inner().unwrap_or_else(PoisonError::into_inner);
            while pending.iter().any(Option::is_some) {
                let now = Instant::now();
                if now >= deadline {
                    break;
                }
                let Ok(index) = exits.recv_timeout(deadline - now) else {
                    break;
                };
                let Some(worker) = pending.get_mut(index).and_then(Option::take) else {
                    continue;
                };
                joined += 1;
                match worker.handle.join() {
                    Ok(unit) => returned[index] = Some(unit),
                    Err(_) => warn!(unit = %worker.unit, "worker panicked; rebuilding from its last frame"),
                }
            }
        }

        // Dropping a join handle detaches the thread; it exits at its next cancellation check.
        let abandoned: Vec<RegionId> = pending.into_iter().flatten().map(|worker| worker.unit).collect();
        if !abandoned.is_empty() {
            let timeout = ShutdownTimeout {
                units: abandoned.clone(),
                timeout,
            };
            warn!(error = %timeout, "forcing shutdown past unresponsive workers");
        }

        let frames = fabric.frames();
        // A unit that failed its step was left half-advanced; its last frame is the truth.
        let faulted = fabric.current_fault().map(|fault| fault.unit);
        self.units = returned
            .into_iter()
            .enumerate()
            .map(|(index, unit)| {
                unit.filter(|unit| Some(unit.id()) != faulted).unwrap_or_else(|| {
                    let frame = &frames[index];
                    let region = fabric.map.regions()[index];
                    ExecutionUnit::new(
                        region,
                        &fabric.map,
                        fabric.params,
                        Arc::clone(&fabric.ids),
                        frame.step,
                        frame.entities.clone(),
                    )
                    .with_handed_off(frame.handed_off.clone())
                })
            })
            .collect();
        self.ledger = fabric.ledger_counts();
        if self.fault.is_none() {
            self.fault = fabric.current_fault();
        }
        DrainReport {
            joined,
            abandoned,
            elapsed: started.elapsed(),
        }
    }

    /// Surface a worker fault: drains, moves to `Stopped` and returns the fault once.
    pub fn poll(&mut self) -> Result<EngineState, EngineError> {
        if self.state != EngineState::Running {
            return Ok(self.state);
        }
        let Some(fault) = self.fabric.as_ref().and_then(|fabric| fabric.current_fault()) else {
            return Ok(self.state);
        };
        self.state = EngineState::Draining;
        let report = self.drain();
        self.state = EngineState::Stopped;
        warn!(
            unit = %fault.unit,
            step = fault.step,
            abandoned = report.abandoned.len(),
            "engine stopped after a simulation fault"
        );
        Err(fault.into())
    }

    fn running_fabric(&mut self, operation: &'static str) -> Result<Arc<Fabric>, EngineError> {
        self.poll()?;
        match (&self.fabric, self.state) {
            (Some(fabric), EngineState::Running) => Ok(Arc::clone(fabric)),
            (_, state) => Err(EngineError::InvalidState { operation, state }),
        }
    }

    /// Let every unit advance `steps` more steps. In continuous mode the
    /// ticket just tracks the slowest unit.
    pub fn advance(&mut self, steps: u64) -> Result<StepTicket, EngineError> {
        let fabric = self.running_fabric("advance")?;
        if steps == 0 {
            return Ok(StepTicket::ready(fabric.gate.min_completed()));
        }
        Ok(match self.config.stepping {
            SteppingMode::Pumped => fabric.gate.raise(steps),
            SteppingMode::Continuous => fabric.gate.ticket(fabric.gate.min_completed() + steps),
        })
    }

    /// Switch a running engine to free-running mode.
    pub fn run_continuous(&mut self) -> Result<(), EngineError> {
        let fabric = self.running_fabric("run_continuous")?;
        self.config.stepping = SteppingMode::Continuous;
        fabric.gate.unlimit();
        info!("switched to continuous stepping");
        Ok(())
    }

    /// Lowest step completed by any unit.
    #[must_use]
    pub fn step_counter(&self) -> u64 {
        match &self.fabric {
            Some(fabric) => fabric.gate.min_completed(),
            None => self.units.iter().map(ExecutionUnit::step).min().unwrap_or(0),
        }
    }

    pub fn request_snapshot(&self) -> Result<AggregatedSnapshot, EngineError> {
        self.snapshot(None)
    }

    /// Like [`Self::request_snapshot`], giving up after `timeout`.
    pub fn request_snapshot_timeout(
        &self,
        timeout: Duration,
    ) -> Result<AggregatedSnapshot, EngineError> {
        self.snapshot(Some(timeout))
    }

    fn snapshot(&self, timeout: Option<Duration>) -> Result<AggregatedSnapshot, EngineError> {
        match self.state {
            EngineState::Unconfigured => Err(ConfigurationError::NoUnits.into()),
            EngineState::Ready => {
                if self.units.is_empty() {
                    return Err(ConfigurationError::NoUnits.into());
                }
                let step = self.step_counter();
                let stats = self.units.par_iter().map(ExecutionUnit::stats).collect();
                let snapshot =
                    AggregatedSnapshot::merge(step, stats).ok_or(EngineError::SnapshotCancelled)?;
                self.monitor.record(snapshot.clone());
                Ok(snapshot)
            }
            EngineState::Running => {
                let Some(fabric) = &self.fabric else {
                    return Err(EngineError::SnapshotCancelled);
                };
                if let Some(fault) = fabric.current_fault() {
                    return Err(fault.into());
                }
                if fabric.cancel.is_cancelled() {
                    return Err(EngineError::SnapshotCancelled);
                }
                fabric.monitor.request(&fabric.gate, timeout)
            }
            state => Err(EngineError::InvalidState {
                operation: "request_snapshot",
                state,
            }),
        }
    }

    #[must_use]
    pub fn last_snapshot(&self) -> Option<AggregatedSnapshot> {
        self.monitor.last_snapshot()
    }

    /// Entities inside `rect` as of each unit's last completed step. Never blocks on workers.
    ///
    /// While running, units may sit one step apart. The read takes every
    /// unit's frame from one consistent cut and reports each entity once, in
    /// its newest state, so entities crossing between units are neither lost
    /// nor doubled. `min_step` and `max_step` bound the steps that were mixed.
    pub fn read_region(&self, rect: Rect) -> Result<RegionSnapshot, EngineError> {
        if self.map.is_none() {
            return Err(ConfigurationError::NoUnits.into());
        }
        match &self.fabric {
            Some(fabric) => {
                let frames = fabric.frames();
                Ok(RegionSnapshot::from_frames(rect, frames.iter().map(Arc::as_ref)))
            }
            None => {
                let frames: Vec<UnitFrame> = self.units.iter().map(ExecutionUnit::frame).collect();
                Ok(RegionSnapshot::from_frames(rect, &frames))
            }
        }
    }

    /// Apply `command` at the next safe point: immediately while `Ready`,
    /// otherwise at the first step no unit has started yet.
    pub fn submit(&mut self, mut command: EngineCommand) -> Result<(), EngineError> {
        if let EngineCommand::Spawn(entity) = &mut command {
            self.ids.assign(entity);
        }
        match self.state {
            EngineState::Ready => {
                let touched: usize = self
                    .units
                    .iter_mut()
                    .map(|unit| unit.apply_command(&command))
                    .sum();
                debug!(?command, touched, "applied command between runs");
                Ok(())
            }
            EngineState::Running => {
                let fabric = self.running_fabric("submit")?;
                let apply_at = fabric.gate.enqueue(command)?;
                debug!(apply_at, "command queued");
                Ok(())
            }
            state => Err(EngineError::InvalidState {
                operation: "submit",
                state,
            }),
        }
    }

    /// Rebuild the compartment map for a new world size. Outstanding snapshot
    /// requests are cancelled; entities are wrapped or reflected into the new
    /// bounds and redistributed. A running engine is restarted.
    pub fn resize(&mut self, world: WorldSize) -> Result<(), EngineError> {
        let Some(mut map) = self.map.clone() else {
            self.config.world_width = world.width;
            self.config.world_height = world.height;
            return Ok(());
        };
        map.resize(world)?;
        self.config.validate_partition(&map)?;
        let was_running = self.state == EngineState::Running;
        if was_running {
            self.stop()?;
        }
        self.monitor.cancel(EngineError::SnapshotCancelled);
        self.config.world_width = world.width;
        self.config.world_height = world.height;
        let (entities, base_step) = self.take_population();
        let epoch = map.epoch();
        self.install(map, entities, base_step);
        self.fault = None;
        self.state = EngineState::Ready;
        info!(width = world.width, height = world.height, epoch, "world resized");
        if was_running {
            self.start()?;
        }
        Ok(())
    }
}

impl Drop for ThreadController {
    fn drop(&mut self) {
        if self.state == EngineState::Running {
            let _ = self.stop();
        }
    }
}

impl SimulationBackend for ThreadController {
    fn name(&self) -> &'static str {
        "partitioned-cpu"
    }

    fn state(&self) -> EngineState {
        self.state
    }

    fn reconfigure(&mut self) -> Result<(), EngineError> {
        match self.layout {
            Some(layout) => self.configure_layout(layout),
            None => Err(ConfigurationError::NoUnits.into()),
        }
    }

    fn start(&mut self) -> Result<(), EngineError> {
        ThreadController::start(self)
    }

    fn stop(&mut self) -> Result<DrainReport, EngineError> {
        ThreadController::stop(self)
    }

    fn advance(&mut self, steps: u64) -> Result<StepTicket, EngineError> {
        ThreadController::advance(self, steps)
    }

    fn step_counter(&self) -> u64 {
        ThreadController::step_counter(self)
    }

    fn read_region(&self, rect: Rect) -> Result<RegionSnapshot, EngineError> {
        ThreadController::read_region(self, rect)
    }

    fn request_snapshot(&self) -> Result<AggregatedSnapshot, EngineError> {
        ThreadController::request_snapshot(self)
    }

    fn last_snapshot(&self) -> Option<AggregatedSnapshot> {
        ThreadController::last_snapshot(self)
    }

    fn submit(&mut self, command: EngineCommand) -> Result<(), EngineError> {
        ThreadController::submit(self, command)
    }

    fn poll(&mut self) -> Result<EngineState, EngineError> {
        ThreadController::poll(self)
    }
}
