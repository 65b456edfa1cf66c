//! GPU-resident engine: the same query and command contract as the threaded
//! backend, with the whole world advanced by one dispatch per step.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use partisim_core::{
    AggregatedSnapshot, CompletionSignal, ConfigurationError, DeviceFault, DrainReport,
    EngineCommand, EngineConfig, EngineError, EngineState, Entity, IdAllocator, Rect, RegionId,
    RegionSnapshot, SimulationBackend, StepDriver, StepTicket, UnitFrame, UnitStats,
    apply_command, seed_population,
};
use tracing::{debug, error, info, warn};

use crate::device::DeviceContext;
use crate::layout::{GpuEntity, GpuParams};

/// Progress shared between the engine and outstanding tickets.
#[derive(Debug, Default)]
struct Progress {
    completed: AtomicU64,
    issued: AtomicU64,
    fault: Mutex<Option<DeviceFault>>,
}

impl Progress {
    fn starting_at(step: u64) -> Self {
        Self {
            completed: AtomicU64::new(step),
            issued: AtomicU64::new(step),
            fault: Mutex::new(None),
        }
    }

    fn fault(&self) -> Option<DeviceFault> {
        self.fault
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn record(&self, fault: DeviceFault) {
        let mut slot = self.fault.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.is_none() {
            error!(%fault, "gpu backend fault");
            *slot = Some(fault);
        }
    }
}

/// A batch of dispatches awaiting completion. Drives the device when a ticket
/// holder polls or waits.
struct InFlight {
    context: Arc<DeviceContext>,
    progress: Arc<Progress>,
    target: u64,
    done: Arc<AtomicBool>,
    signal: Arc<CompletionSignal>,
}

impl InFlight {
    fn is_resolved(&self) -> bool {
        self.signal.peek().is_some()
    }

    fn finish(&self) {
        self.progress
            .completed
            .fetch_max(self.target, Ordering::AcqRel);
        self.signal.complete(Ok(self.target));
    }

    fn fail(&self, fault: DeviceFault) {
        self.progress.record(fault.clone());
        self.signal.complete(Err(fault.into()));
    }
}

impl StepDriver for InFlight {
    fn drive(&self) {
        if self.is_resolved() {
            return;
        }
        if let Some(fault) = self.progress.fault() {
            self.signal.complete(Err(fault.into()));
            return;
        }
        if let Err(fault) = self.context.ensure_live() {
            self.fail(fault);
            return;
        }
        self.context.poll();
        if !self.done.load(Ordering::Acquire) {
            return;
        }
        let record = match self.context.read_fault() {
            Ok(record) => record,
            Err(fault) => {
                self.fail(fault);
                return;
            }
        };
        let Some(fault) = record.to_fault(self.progress.issued.load(Ordering::Acquire)) else {
            self.finish();
            return;
        };
        if matches!(fault, DeviceFault::Kernel { step, .. } if step > self.target) {
            // A fault in a later batch does not invalidate this one.
            self.progress.record(fault);
            self.finish();
        } else {
            self.fail(fault);
        }
    }
}

/// Host-side description of the resident world.
#[derive(Debug, Clone, Copy, Default)]
struct Resident {
    count: usize,
    front: usize,
    issued: u64,
}

/// Single-device backend. Device memory is bound once at construction and
/// released exactly once, on [`GpuEngine::release`] or drop.
pub struct GpuEngine {
    config: EngineConfig,
    state: EngineState,
    context: Arc<DeviceContext>,
    ids: Arc<IdAllocator>,
    resident: Option<Resident>,
    progress: Arc<Progress>,
    inflight: Mutex<Vec<Arc<InFlight>>>,
    last: Mutex<Option<AggregatedSnapshot>>,
    fault: Option<DeviceFault>,
}

impl GpuEngine {
    /// Validate `config` and bind device memory for `gpu_max_entities` entities.
    pub fn new(config: EngineConfig) -> Result<Self, EngineError> {
        config.validate()?;
        let context = DeviceContext::new(config.gpu_max_entities)?;
        info!(
            adapter = context.adapter_name(),
            capacity = context.capacity(),
            "gpu engine ready for configuration"
        );
        Ok(Self {
            config,
            state: EngineState::Unconfigured,
            context: Arc::new(context),
            ids: Arc::new(IdAllocator::new()),
            resident: None,
            progress: Arc::new(Progress::default()),
            inflight: Mutex::new(Vec::new()),
            last: Mutex::new(None),
            fault: None,
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
    pub fn adapter_name(&self) -> &str {
        self.context.adapter_name()
    }

    #[must_use]
    pub fn fault(&self) -> Option<&DeviceFault> {
        self.fault.as_ref()
    }

    fn inflight(&self) -> MutexGuard<'_, Vec<Arc<InFlight>>> {
        self.inflight.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Seed (or carry over) the world and upload it.
    pub fn configure(&mut self) -> Result<(), EngineError> {
        self.context.ensure_live()?;
        if self.state == EngineState::Running {
            self.stop()?;
        }
        let (entities, step) = match self.resident {
            Some(resident) if self.fault.is_none() => (self.download()?, resident.issued),
            _ => {
                let ids = IdAllocator::new();
                let mut rng = self.config.seeded_rng();
                let world = self.config.world_size();
                (seed_population(&self.config, world, &ids, &mut rng), 0)
            }
        };
        self.install(entities, step)
    }

    /// Replace the resident world with `entities` as-is, starting at step 0.
    pub fn configure_with(&mut self, entities: Vec<Entity>) -> Result<(), EngineError> {
        self.context.ensure_live()?;
        if self.state == EngineState::Running {
            self.stop()?;
        }
        self.install(entities, 0)
    }

    fn install(&mut self, mut entities: Vec<Entity>, step: u64) -> Result<(), EngineError> {
        let capacity = self.context.capacity();
        if entities.len() > capacity {
            return Err(DeviceFault::CapacityExceeded {
                requested: entities.len(),
                capacity,
            }
            .into());
        }
        self.ids = Arc::new(IdAllocator::after(&entities));
        for entity in &mut entities {
            self.ids.assign(entity);
        }
        let raw: Vec<GpuEntity> = entities.iter().map(GpuEntity::from).collect();
        self.context.upload(0, &raw)?;
        self.context.clear_fault();
        self.resident = Some(Resident {
            count: raw.len(),
            front: 0,
            issued: step,
        });
        self.progress = Arc::new(Progress::starting_at(step));
        self.inflight().clear();
        self.fault = None;
        self.state = EngineState::Ready;
        info!(entities = raw.len(), step, "gpu world configured");
        Ok(())
    }

    pub fn start(&mut self) -> Result<(), EngineError> {
        if self.state != EngineState::Ready {
            return Err(EngineError::InvalidState {
                operation: "start",
                state: self.state,
            });
        }
        self.context.ensure_live()?;
        self.state = EngineState::Running;
        info!("gpu engine started");
        Ok(())
    }

    /// Wait for queued dispatches and resolve their tickets.
    pub fn stop(&mut self) -> Result<DrainReport, EngineError> {
        if self.state != EngineState::Running {
            return Ok(DrainReport::default());
        }
        let started = Instant::now();
        self.state = EngineState::Draining;
        // A blocking read flushes the queue, so every completion callback has run afterwards.
        if let Err(fault) = self.context.read_fault() {
            warn!(%fault, "could not flush the device queue while stopping");
        }
        let pending = std::mem::take(&mut *self.inflight());
        for batch in &pending {
            batch.drive();
            if !batch.is_resolved() {
                batch.signal.complete(Err(EngineError::Cancelled(batch.target)));
            }
        }
        if self.fault.is_none() {
            self.fault = self.progress.fault();
        }
        self.state = EngineState::Stopped;
        let report = DrainReport {
            joined: 0,
            abandoned: Vec::new(),
            elapsed: started.elapsed(),
        };
        info!(
            batches = pending.len(),
            elapsed_ms = report.elapsed.as_millis() as u64,
            "gpu engine stopped"
        );
        Ok(report)
    }

    /// Queue `steps` dispatches. The ticket resolves once the device finished
    /// all of them and no kernel fault was flagged.
    pub fn advance(&mut self, steps: u64) -> Result<StepTicket, EngineError> {
        self.poll()?;
        if self.state != EngineState::Running {
            return Err(EngineError::InvalidState {
                operation: "advance",
                state: self.state,
            });
        }
        self.context.ensure_live()?;
        let Some(mut resident) = self.resident else {
            return Err(ConfigurationError::NoUnits.into());
        };
        if steps == 0 {
            return Ok(StepTicket::ready(
                self.progress.completed.load(Ordering::Acquire),
            ));
        }
        for _ in 0..steps {
            resident.issued += 1;
            let params = GpuParams::from_config(&self.config, resident.count, resident.issued);
            resident.front = self.context.dispatch(resident.front, &params);
        }
        self.resident = Some(resident);
        self.progress
            .issued
            .store(resident.issued, Ordering::Release);

        let done = Arc::new(AtomicBool::new(false));
        self.context.notify_when_idle(Arc::clone(&done));
        let signal = CompletionSignal::new();
        let batch = Arc::new(InFlight {
            context: Arc::clone(&self.context),
            progress: Arc::clone(&self.progress),
            target: resident.issued,
            done,
            signal: Arc::clone(&signal),
        });
        self.inflight().push(Arc::clone(&batch));
        debug!(steps, target = resident.issued, "gpu dispatches queued");
        Ok(StepTicket::new(resident.issued, signal).with_driver(batch))
    }

    /// Drive outstanding batches without blocking and forget the resolved ones.
    fn settle(&self) {
        self.inflight().retain(|batch| {
            batch.drive();
            !batch.is_resolved()
        });
    }

    #[must_use]
    pub fn step_counter(&self) -> u64 {
        self.settle();
        self.progress.completed.load(Ordering::Acquire)
    }

    /// Read the resident world back. Blocks until queued dispatches finished.
    fn download(&self) -> Result<Vec<Entity>, EngineError> {
        let Some(resident) = self.resident else {
            return Err(ConfigurationError::NoUnits.into());
        };
        let raw = self.context.read_entities(resident.front, resident.count)?;
        self.settle();
        Ok(raw.iter().map(Entity::from).collect())
    }

    /// Step the downloaded world reflects; a faulted world is frozen at the faulting step.
    fn visible_step(&self) -> u64 {
        let issued = self.resident.map_or(0, |resident| resident.issued);
        match self.progress.fault().or_else(|| self.fault.clone()) {
            Some(DeviceFault::Kernel { step, .. }) => step.min(issued),
            _ => issued,
        }
    }

    pub fn read_region(&self, rect: Rect) -> Result<RegionSnapshot, EngineError> {
        let entities = self.download()?;
        let step = self.visible_step();
        let frame = UnitFrame {
            unit: RegionId(0),
            step,
            entities,
            handed_off: Vec::new(),
        };
        Ok(RegionSnapshot::from_frames(rect, [&frame]))
    }

    pub fn request_snapshot(&self) -> Result<AggregatedSnapshot, EngineError> {
        match self.state {
            EngineState::Unconfigured => return Err(ConfigurationError::NoUnits.into()),
            EngineState::Ready | EngineState::Running => {}
            state => {
                return Err(EngineError::InvalidState {
                    operation: "request_snapshot",
                    state,
                });
            }
        }
        let entities = self.download()?;
        if let Some(fault) = self.progress.fault() {
            return Err(fault.into());
        }
        let step = self.visible_step();
        let stats = UnitStats::collect(RegionId(0), step, entities.iter());
        let snapshot =
            AggregatedSnapshot::merge(step, vec![stats]).ok_or(EngineError::SnapshotCancelled)?;
        *self.last.lock().unwrap_or_else(PoisonError::into_inner) = Some(snapshot.clone());
        Ok(snapshot)
    }

    #[must_use]
    pub fn last_snapshot(&self) -> Option<AggregatedSnapshot> {
        self.last
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Apply `command` between dispatches by round-tripping the world through host memory.
    pub fn submit(&mut self, mut command: EngineCommand) -> Result<(), EngineError> {
        if !matches!(self.state, EngineState::Ready | EngineState::Running) {
            return Err(EngineError::InvalidState {
                operation: "submit",
                state: self.state,
            });
        }
        self.poll()?;
        if let EngineCommand::Spawn(entity) = &mut command {
            self.ids.assign(entity);
        }
        let Some(mut resident) = self.resident else {
            return Err(ConfigurationError::NoUnits.into());
        };
        let mut entities = self.download()?;
        let touched = apply_command(&mut entities, &self.ids, &command);
        let capacity = self.context.capacity();
        if entities.len() > capacity {
            warn!(?command, capacity, "command would overflow device memory");
            return Err(DeviceFault::CapacityExceeded {
                requested: entities.len(),
                capacity,
            }
            .into());
        }
        let raw: Vec<GpuEntity> = entities.iter().map(GpuEntity::from).collect();
        self.context.upload(resident.front, &raw)?;
        resident.count = raw.len();
        self.resident = Some(resident);
        debug!(?command, touched, "command applied to the resident world");
        Ok(())
    }

    /// Surface a device or kernel fault once; the engine is stopped afterwards.
    pub fn poll(&mut self) -> Result<EngineState, EngineError> {
        if self.state != EngineState::Running {
            return Ok(self.state);
        }
        self.settle();
        let fault = match self.context.ensure_live() {
            Err(fault) => Some(fault),
            Ok(()) => self.progress.fault(),
        };
        let Some(fault) = fault else {
            return Ok(self.state);
        };
        self.stop()?;
        self.fault = Some(fault.clone());
        warn!(%fault, "gpu engine stopped after a device fault");
        Err(fault.into())
    }

    /// Free device memory. Returns `false` if it was already released.
    pub fn release(&mut self) -> bool {
        if self.state == EngineState::Running {
            let _ = self.stop();
        }
        self.context.release()
    }
}

impl Drop for GpuEngine {
    fn drop(&mut self) {
        self.release();
    }
}

impl SimulationBackend for GpuEngine {
    fn name(&self) -> &'static str {
        "gpu-resident"
    }

    fn state(&self) -> EngineState {
        self.state
    }

    fn reconfigure(&mut self) -> Result<(), EngineError> {
        self.configure()
    }

    fn start(&mut self) -> Result<(), EngineError> {
        GpuEngine::start(self)
    }

    fn stop(&mut self) -> Result<DrainReport, EngineError> {
        GpuEngine::stop(self)
    }

    fn advance(&mut self, steps: u64) -> Result<StepTicket, EngineError> {
        GpuEngine::advance(self, steps)
    }

    fn step_counter(&self) -> u64 {
        GpuEngine::step_counter(self)
    }

    fn read_region(&self, rect: Rect) -> Result<RegionSnapshot, EngineError> {
        GpuEngine::read_region(self, rect)
    }

    fn request_snapshot(&self) -> Result<AggregatedSnapshot, EngineError> {
        GpuEngine::request_snapshot(self)
    }

    fn last_snapshot(&self) -> Option<AggregatedSnapshot> {
        GpuEngine::last_snapshot(self)
    }

    fn submit(&mut self, command: EngineCommand) -> Result<(), EngineError> {
        GpuEngine::submit(self, command)
    }

    fn poll(&mut self) -> Result<EngineState, EngineError> {
        GpuEngine::poll(self)
    }
}
