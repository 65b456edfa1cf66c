use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use partisim_core::{
    ConfigurationError, EngineCommand, EngineConfig, EngineError, EngineState, Entity, EntityId,
    EntityKind, FaultKind, Integrator, Rect, RegionId, SimulationBackend, SimulationFault,
    SoftParticleIntegrator, StepFrame, SteppingMode, Vec2, WorldSize,
};
use partisim_threads::ThreadController;

fn config() -> EngineConfig {
    EngineConfig {
        world_width: 200,
        world_height: 200,
        initial_entities: 60,
        initial_speed: 40.0,
        rng_seed: Some(0x5EED),
        per_worker_timeout_ms: 1_000,
        ..EngineConfig::default()
    }
}

fn world(config: &EngineConfig) -> Rect {
    config.world_size().rect()
}

/// Fast movers on a small torus, so entities cross between units every few steps.
fn crossing_config() -> EngineConfig {
    EngineConfig {
        initial_entities: 200,
        initial_speed: 50.0,
        max_speed: 50.0,
        time_step: 0.4,
        stepping: SteppingMode::Continuous,
        rng_seed: Some(0xC105),
        ..config()
    }
}

fn running(config: EngineConfig, units: usize) -> ThreadController {
    let mut controller = ThreadController::new(config).expect("valid config");
    controller.configure(units).expect("configure");
    controller.start().expect("start");
    controller
}

#[test]
fn two_by_two_torus_exchanges_one_halo_per_edge_per_step() {
    let mut controller = running(config(), 4);
    assert_eq!(controller.graph().edge_count(), 32);
    assert_eq!(controller.advance(1).expect("advance").wait(), Ok(1));
    for unit in 0..4 {
        assert_eq!(
            controller.halo_ledger(RegionId(unit)),
            Some([1; 8]),
            "unit {unit} consumed an unexpected number of halos"
        );
    }
    assert_eq!(controller.advance(2).expect("advance").wait(), Ok(3));
    let report = controller.stop().expect("stop");
    assert!(report.is_clean());
    assert_eq!(controller.halo_ledger(RegionId(3)), Some([3; 8]));
}

#[test]
fn configure_is_idempotent() {
    let mut controller = ThreadController::new(config()).expect("config");
    controller.configure(6).expect("configure");
    let map = controller.map().cloned().expect("map");
    let graph = controller.graph().clone();
    let before = controller.read_region(world(controller.config())).expect("read");

    controller.configure(6).expect("configure again");
    assert_eq!(controller.map(), Some(&map));
    assert_eq!(controller.graph(), &graph);
    let after = controller.read_region(world(controller.config())).expect("read");
    assert_eq!(before.entities, after.entities);
}

#[test]
fn dependency_graph_is_symmetric_with_and_without_wraparound() {
    for wraparound in [true, false] {
        let config = EngineConfig {
            world_width: 300,
            world_height: 300,
            wraparound,
            ..config()
        };
        let mut controller = ThreadController::new(config).expect("config");
        controller.configure(9).expect("configure");
        let graph = controller.graph();
        assert!(graph.is_symmetric());
        assert_eq!(graph.edges(RegionId(4)).len(), 8);
        let corner = graph.edges(RegionId(0)).len();
        assert_eq!(corner, if wraparound { 8 } else { 3 });
    }
}

#[test]
fn zero_units_is_a_configuration_error() {
    let mut controller = ThreadController::new(config()).expect("config");
    assert!(matches!(
        controller.configure(0),
        Err(EngineError::Configuration(ConfigurationError::Layout(_)))
    ));
    assert_eq!(
        controller.request_snapshot(),
        Err(EngineError::Configuration(ConfigurationError::NoUnits))
    );
    assert!(matches!(
        controller.read_region(Rect::new(0.0, 0.0, 10.0, 10.0)),
        Err(EngineError::Configuration(ConfigurationError::NoUnits))
    ));
}

/// Blocks unit 0 inside its first step until released.
struct StuckIntegrator {
    release: Arc<AtomicBool>,
}

impl Integrator for StuckIntegrator {
    fn name(&self) -> &'static str {
        "stuck"
    }

    fn integrate(&self, frame: &mut StepFrame<'_>) -> Result<(), FaultKind> {
        while frame.unit == RegionId(0) && !self.release.load(Ordering::SeqCst) {
            thread::sleep(Duration::from_millis(5));
        }
        Ok(())
    }
}

#[test]
fn drain_is_bounded_by_the_worker_timeout() {
    let release = Arc::new(AtomicBool::new(false));
    let config = EngineConfig {
        per_worker_timeout_ms: 200,
        ..config()
    };
    let integrator = Arc::new(StuckIntegrator {
        release: Arc::clone(&release),
    });
    let mut controller = ThreadController::with_integrator(config, integrator).expect("config");
    controller.configure(4).expect("configure");
    controller.start().expect("start");
    let ticket = controller.advance(1).expect("advance");
    thread::sleep(Duration::from_millis(50));

    let started = Instant::now();
    let report = controller.stop().expect("stop");
    let elapsed = started.elapsed();
    release.store(true, Ordering::SeqCst);

    assert_eq!(report.abandoned, vec![RegionId(0)]);
    assert_eq!(report.joined, 3);
    assert!(elapsed < Duration::from_millis(200 + 800), "drain took {elapsed:?}");
    assert_eq!(controller.state(), EngineState::Stopped);
    assert!(matches!(ticket.wait(), Err(EngineError::Cancelled(1))));
    // The abandoned unit is rebuilt from its last published state.
    let everything = controller.read_region(world(controller.config())).expect("read");
    assert_eq!(everything.entities.len(), 60);
}

/// Soft-particle physics that fails once unit 0 reaches step 5.
struct FaultAtStepFive {
    inner: SoftParticleIntegrator,
}

impl Integrator for FaultAtStepFive {
    fn name(&self) -> &'static str {
        "fault-at-five"
    }

    fn integrate(&self, frame: &mut StepFrame<'_>) -> Result<(), FaultKind> {
        if frame.unit == RegionId(0) && frame.step == 5 {
            return Err(FaultKind::Integrator("injected".to_string()));
        }
        self.inner.integrate(frame)
    }
}

#[test]
fn fault_stops_every_unit_and_keeps_the_last_snapshot() {
    let config = config();
    let integrator = Arc::new(FaultAtStepFive {
        inner: SoftParticleIntegrator::from_config(&config),
    });
    let mut controller = ThreadController::with_integrator(config, integrator).expect("config");
    controller.configure(4).expect("configure");
    controller.start().expect("start");
    assert_eq!(controller.advance(4).expect("advance").wait(), Ok(4));
    let snapshot = controller.request_snapshot().expect("snapshot");
    assert_eq!(snapshot.step, 4);
    assert_eq!(snapshot.totals.entities(), 60);

    let expected = EngineError::Fault(SimulationFault {
        unit: RegionId(0),
        step: 5,
        kind: FaultKind::Integrator("injected".to_string()),
    });
    let ticket = controller.advance(3).expect("advance");
    assert_eq!(ticket.wait(), Err(expected.clone()));
    assert_eq!(controller.poll(), Err(expected));
    assert_eq!(controller.state(), EngineState::Stopped);
    assert_eq!(controller.poll(), Ok(EngineState::Stopped));
    assert!(controller.fault().is_some());
    assert!(matches!(
        controller.start(),
        Err(EngineError::InvalidState { .. })
    ));
    assert_eq!(controller.last_snapshot(), Some(snapshot));

    let torn = controller.read_region(world(controller.config())).expect("read");
    assert_eq!(torn.entities.len(), 60, "the failing unit keeps its last frame");

    controller.configure(4).expect("configure after fault");
    assert_eq!(controller.state(), EngineState::Ready);
    assert!(controller.fault().is_none());
    assert_eq!(controller.step_counter(), 0, "faulted worlds are reseeded");
}

struct PanicsAtStepTwo;

impl Integrator for PanicsAtStepTwo {
    fn name(&self) -> &'static str {
        "panics"
    }

    fn integrate(&self, frame: &mut StepFrame<'_>) -> Result<(), FaultKind> {
        if frame.unit == RegionId(1) && frame.step == 2 {
            panic!("integrator blew up");
        }
        Ok(())
    }
}

#[test]
fn worker_panic_becomes_a_fault() {
    let mut controller =
        ThreadController::with_integrator(config(), Arc::new(PanicsAtStepTwo)).expect("config");
    controller.configure(4).expect("configure");
    controller.start().expect("start");
    let result = controller.advance(3).expect("advance").wait();
    assert!(matches!(
        result,
        Err(EngineError::Fault(SimulationFault {
            unit: RegionId(1),
            kind: FaultKind::WorkerPanicked,
            ..
        }))
    ));
    assert!(controller.poll().is_err());
    assert_eq!(controller.state(), EngineState::Stopped);
    let everything = controller.read_region(world(controller.config())).expect("read");
    assert_eq!(everything.entities.len(), 60);
}

#[test]
fn concurrent_snapshots_are_consistent_while_running() {
    let config = EngineConfig {
        stepping: SteppingMode::Continuous,
        ..config()
    };
    let controller = running(config, 4);
    thread::scope(|scope| {
        let readers: Vec<_> = (0..3)
            .map(|_| {
                scope.spawn(|| {
                    let mut last = None;
                    for _ in 0..5 {
                        let snapshot = controller
                            .request_snapshot_timeout(Duration::from_secs(5))
                            .expect("snapshot");
                        assert_eq!(snapshot.units.len(), 4);
                        assert!(snapshot.units.iter().all(|unit| unit.step == snapshot.step));
                        assert_eq!(snapshot.totals.entities(), 60);
                        if let Some(previous) = last {
                            assert!(snapshot.step > previous);
                        }
                        last = Some(snapshot.step);
                    }
                })
            })
            .collect();
        for reader in readers {
            reader.join().expect("reader");
        }
    });
    assert!(controller.step_counter() > 0);
    assert!(controller.monitor_stats().completed >= 15);
}

/// Marks every entity with the step that last touched it and checks that
/// ghosts always come from exactly the previous step.
struct StepStamp;

impl Integrator for StepStamp {
    fn name(&self) -> &'static str {
        "step-stamp"
    }

    fn integrate(&self, frame: &mut StepFrame<'_>) -> Result<(), FaultKind> {
        let expected = (frame.step - 1) as f32;
        if let Some(ghost) = frame.ghosts.iter().find(|ghost| ghost.energy != expected) {
            return Err(FaultKind::Integrator(format!(
                "ghost {} carried step {} while computing step {}",
                ghost.id, ghost.energy, frame.step
            )));
        }
        for entity in frame.interior.iter_mut() {
            entity.position += entity.velocity * frame.time_step;
            frame
                .topology
                .confine(&mut entity.position, &mut entity.velocity);
            entity.energy = frame.step as f32;
        }
        Ok(())
    }
}

#[test]
fn halos_are_consumed_in_step_order() {
    let config = EngineConfig {
        stepping: SteppingMode::Continuous,
        initial_energy: 0.0,
        world_width: 300,
        world_height: 300,
        ..config()
    };
    let mut controller =
        ThreadController::with_integrator(config, Arc::new(StepStamp)).expect("config");
    controller.configure(9).expect("configure");
    controller.start().expect("start");
    // Continuous workers are already under way, so the target counts from wherever they are.
    let reached = controller.advance(40).expect("advance").wait().expect("steps");
    assert!(reached >= 40);
    assert_eq!(controller.poll(), Ok(EngineState::Running));
    controller.stop().expect("stop");
    let everything = controller.read_region(world(controller.config())).expect("read");
    assert_eq!(everything.entities.len(), 60);
}

#[test]
fn threaded_runs_are_deterministic() {
    let outcome = || {
        let mut controller = running(config(), 4);
        controller.advance(20).expect("advance").wait().expect("steps");
        controller.stop().expect("stop");
        controller.read_region(world(controller.config())).expect("read")
    };
    let first = outcome();
    let second = outcome();
    assert_eq!(first.min_step, 20);
    assert_eq!(first.entities.len(), 60);
    assert_eq!(first, second);
}

#[test]
fn commands_apply_between_runs_and_at_step_boundaries() {
    let mut controller = ThreadController::new(config()).expect("config");
    controller.configure(4).expect("configure");
    controller
        .submit(EngineCommand::SetEnergy {
            id: EntityId(1),
            energy: 5.0,
        })
        .expect("submit");
    let newborn = Entity::new(
        EntityKind::Cell,
        Vec2::new(50.0, 50.0),
        Vec2::ZERO,
        1.0,
        10.0,
    );
    controller.submit(EngineCommand::Spawn(newborn)).expect("spawn");
    let ready = controller.request_snapshot().expect("snapshot");
    assert_eq!(ready.totals.entities(), 61);
    let first = controller.read_region(world(controller.config())).expect("read");
    let entity = first
        .entities
        .iter()
        .find(|entity| entity.id == EntityId(1))
        .expect("entity 1");
    assert_eq!(entity.energy, 5.0);

    controller.start().expect("start");
    assert_eq!(controller.advance(2).expect("advance").wait(), Ok(2));
    controller
        .submit(EngineCommand::SetEnergy {
            id: EntityId(1),
            energy: 500.0,
        })
        .expect("submit");
    controller
        .submit(EngineCommand::Remove(EntityId(2)))
        .expect("submit");
    assert_eq!(controller.advance(1).expect("advance").wait(), Ok(3));
    let snapshot = controller.request_snapshot().expect("snapshot");
    assert_eq!(snapshot.step, 3);
    assert_eq!(snapshot.totals.entities(), 60);
    let after = controller.read_region(world(controller.config())).expect("read");
    let boosted = after
        .entities
        .iter()
        .find(|entity| entity.id == EntityId(1))
        .expect("entity 1");
    assert!(boosted.energy > 499.0 && boosted.energy <= 500.0);
    assert!(after.entities.iter().all(|entity| entity.id != EntityId(2)));
}

#[test]
fn throttled_controller_still_advances() {
    let config = EngineConfig {
        max_running_threads: Some(1),
        ..config()
    };
    let mut controller = running(config, 4);
    assert_eq!(controller.advance(5).expect("advance").wait(), Ok(5));
    let snapshot = controller.request_snapshot().expect("snapshot");
    assert_eq!(snapshot.step, 5);
    assert_eq!(snapshot.totals.entities(), 60);
}

#[test]
fn resize_redistributes_and_restarts() {
    let mut controller = running(config(), 4);
    assert_eq!(controller.advance(3).expect("advance").wait(), Ok(3));
    controller.resize(WorldSize::new(320, 240)).expect("resize");
    assert_eq!(controller.state(), EngineState::Running);
    assert_eq!(
        controller.map().map(|map| map.world()),
        Some(WorldSize::new(320, 240))
    );
    assert_eq!(controller.advance(2).expect("advance").wait(), Ok(5));
    let snapshot = controller.request_snapshot().expect("snapshot");
    assert_eq!(snapshot.totals.entities(), 60);
    assert!(matches!(
        controller.resize(WorldSize::new(40, 40)),
        Err(EngineError::Configuration(_))
    ));
    assert_eq!(controller.state(), EngineState::Running);
}

#[test]
fn controller_is_usable_through_the_backend_trait() {
    let mut backend: Box<dyn SimulationBackend> =
        Box::new(ThreadController::new(config()).expect("config"));
    assert!(backend.reconfigure().is_err());
    assert_eq!(backend.name(), "partitioned-cpu");
    let mut controller = ThreadController::new(config()).expect("config");
    controller.configure(4).expect("configure");
    backend = Box::new(controller);
    backend.start().expect("start");
    assert_eq!(backend.advance_step(), Ok(1));
    backend.reconfigure().expect("reconfigure drains first");
    assert_eq!(backend.state(), EngineState::Ready);
    assert_eq!(backend.step_counter(), 1);
}

#[test]
fn continuous_runs_keep_every_entity_through_stop_configure_and_resize() {
    let mut controller = running(crossing_config(), 4);
    thread::sleep(Duration::from_millis(300));
    let report = controller.stop().expect("stop");
    assert!(report.is_clean());
    let stopped = controller.read_region(world(controller.config())).expect("read");
    assert_eq!(stopped.entities.len(), 200, "steps {}..={}", stopped.min_step, stopped.max_step);

    controller.configure(4).expect("configure");
    let snapshot = controller.request_snapshot().expect("snapshot");
    assert_eq!(snapshot.totals.entities(), 200);
    controller.configure(9).expect("configure");
    assert_eq!(controller.request_snapshot().expect("snapshot").totals.entities(), 200);

    controller.start().expect("start");
    thread::sleep(Duration::from_millis(100));
    controller.resize(WorldSize::new(240, 240)).expect("resize");
    assert_eq!(controller.state(), EngineState::Running);
    thread::sleep(Duration::from_millis(100));
    controller.stop().expect("stop");
    let resized = controller.read_region(world(controller.config())).expect("read");
    assert_eq!(resized.entities.len(), 200);
}

#[test]
fn running_reads_report_every_entity_exactly_once() {
    let controller = running(crossing_config(), 4);
    let everywhere = world(controller.config());
    let deadline = Instant::now() + Duration::from_millis(300);
    let mut reads = 0;
    while Instant::now() < deadline {
        let read = controller.read_region(everywhere).expect("read");
        assert_eq!(
            read.entities.len(),
            200,
            "read {reads} at steps {}..={}",
            read.min_step,
            read.max_step
        );
        assert!(read.entities.windows(2).all(|pair| pair[0].id < pair[1].id));
        // Every unit of a 2x2 torus neighbors every other one.
        assert!(read.max_step - read.min_step <= 1);
        reads += 1;
    }
    assert!(reads > 0);
    assert!(controller.step_counter() > 0);
}

/// Unit 0 stalls in step 3 and then fails it.
struct SlowFaultAtStepThree;

impl Integrator for SlowFaultAtStepThree {
    fn name(&self) -> &'static str {
        "slow-fault"
    }

    fn integrate(&self, frame: &mut StepFrame<'_>) -> Result<(), FaultKind> {
        if frame.unit == RegionId(0) && frame.step == 3 {
            thread::sleep(Duration::from_millis(400));
            return Err(FaultKind::Integrator("stalled".to_string()));
        }
        Ok(())
    }
}

#[test]
fn snapshot_requests_after_a_fault_fail_instead_of_hanging() {
    let mut controller =
        ThreadController::with_integrator(config(), Arc::new(SlowFaultAtStepThree)).expect("config");
    controller.configure(4).expect("configure");
    controller.start().expect("start");
    let ticket = controller.advance(10).expect("advance");
    let settle = Instant::now() + Duration::from_secs(5);
    while controller.step_counter() < 2 && Instant::now() < settle {
        thread::sleep(Duration::from_millis(1));
    }
    assert_eq!(controller.step_counter(), 2);

    let controller = Arc::new(controller);
    let (results, outcomes) = std::sync::mpsc::channel();
    let requesters: Vec<_> = [0, 100]
        .into_iter()
        .map(|delay| {
            let controller = Arc::clone(&controller);
            let results = results.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(delay));
                let _ = results.send(controller.request_snapshot());
            })
        })
        .collect();
    for _ in 0..2 {
        let outcome = outcomes
            .recv_timeout(Duration::from_secs(5))
            .expect("snapshot request never returned");
        assert!(
            matches!(
                outcome,
                Err(EngineError::Fault(SimulationFault {
                    unit: RegionId(0),
                    step: 3,
                    ..
                }))
            ),
            "unexpected outcome {outcome:?}"
        );
    }
    for requester in requesters {
        requester.join().expect("requester");
    }
    assert!(ticket.wait().is_err());

    let Some(mut controller) = Arc::into_inner(controller) else {
        panic!("requesters still hold the controller");
    };
    assert!(controller.poll().is_err());
    controller.configure(4).expect("configure after fault");
    controller.start().expect("start");
    assert_eq!(controller.advance(2).expect("advance").wait(), Ok(2));
    let snapshot = controller
        .request_snapshot_timeout(Duration::from_secs(5))
        .expect("a reconfigured engine serves snapshots again");
    assert_eq!(snapshot.totals.entities(), 60);
}
