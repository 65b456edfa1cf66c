//! These tests need a compute-capable adapter and skip themselves without one.

use partisim_core::{
    DeviceFault, EngineCommand, EngineConfig, EngineError, EngineState, Entity, EntityId,
    EntityKind, Rect, SimulationBackend, Vec2, WorldTopology,
};
use partisim_gpu::GpuEngine;
use partisim_threads::ThreadController;

fn config() -> EngineConfig {
    EngineConfig {
        world_width: 200,
        world_height: 200,
        initial_entities: 80,
        initial_speed: 30.0,
        rng_seed: Some(0xFEED),
        gpu_max_entities: 256,
        ..EngineConfig::default()
    }
}

fn engine(config: EngineConfig) -> Option<GpuEngine> {
    match GpuEngine::new(config) {
        Ok(engine) => Some(engine),
        Err(EngineError::Device(fault)) => {
            eprintln!("skipping gpu test: {fault}");
            None
        }
        Err(other) => panic!("unexpected error creating the gpu engine: {other}"),
    }
}

fn world(config: &EngineConfig) -> Rect {
    config.world_size().rect()
}

#[test]
fn dispatches_advance_the_whole_world() {
    let Some(mut engine) = engine(config()) else {
        return;
    };
    engine.configure().expect("configure");
    engine.start().expect("start");
    let ticket = engine.advance(5).expect("advance");
    assert_eq!(ticket.target(), 5);
    assert_eq!(ticket.wait(), Ok(5));
    assert_eq!(engine.step_counter(), 5);

    let snapshot = engine.request_snapshot().expect("snapshot");
    assert_eq!(snapshot.step, 5);
    assert_eq!(snapshot.totals.entities(), 80);
    let region = engine.read_region(world(engine.config())).expect("read");
    assert_eq!(region.entities.len(), 80);
    assert_eq!(region.max_step, 5);
    engine.stop().expect("stop");
    assert_eq!(engine.state(), EngineState::Stopped);
}

#[test]
fn gpu_matches_a_single_unit_cpu_run() {
    let config = config();
    let Some(mut gpu) = engine(config.clone()) else {
        return;
    };
    gpu.configure().expect("configure");
    gpu.start().expect("start");
    gpu.advance(6).expect("advance").wait().expect("steps");
    let on_device = gpu.read_region(world(&config)).expect("read");

    let mut cpu = ThreadController::new(config.clone()).expect("config");
    cpu.configure(1).expect("configure");
    cpu.start().expect("start");
    cpu.advance(6).expect("advance").wait().expect("steps");
    cpu.stop().expect("stop");
    let on_host = cpu.read_region(world(&config)).expect("read");

    let topology = WorldTopology::new(config.world_size(), config.wraparound);
    assert_eq!(on_device.entities.len(), on_host.entities.len());
    for (a, b) in on_device.entities.iter().zip(&on_host.entities) {
        assert_eq!(a.id, b.id);
        let gap = topology.delta(a.position, b.position);
        assert!(gap.length() < 1e-2, "{} drifted by {gap:?}", a.id);
    }
}

#[test]
fn kernel_faults_surface_as_device_faults() {
    let Some(mut engine) = engine(config()) else {
        return;
    };
    let healthy = Entity::new(
        EntityKind::Cell,
        Vec2::new(20.0, 20.0),
        Vec2::ZERO,
        1.0,
        5.0,
    );
    let broken = Entity::new(
        EntityKind::Particle,
        Vec2::new(120.0, 80.0),
        Vec2::ZERO,
        0.0,
        5.0,
    );
    engine
        .configure_with(vec![healthy, broken])
        .expect("configure");
    engine.start().expect("start");
    let expected = EngineError::Device(DeviceFault::Kernel {
        step: 1,
        slot: 1,
        reason: "non-positive mass",
    });
    assert_eq!(engine.advance(3).expect("advance").wait(), Err(expected.clone()));
    assert_eq!(engine.poll(), Err(expected));
    assert_eq!(engine.state(), EngineState::Stopped);
    assert!(matches!(
        engine.start(),
        Err(EngineError::InvalidState { .. })
    ));
    engine.configure().expect("reseed after a fault");
    assert_eq!(engine.step_counter(), 0);
}

#[test]
fn commands_round_trip_through_host_memory() {
    let Some(mut engine) = engine(config()) else {
        return;
    };
    engine.configure().expect("configure");
    engine.start().expect("start");
    engine.advance(2).expect("advance").wait().expect("steps");
    engine
        .submit(EngineCommand::SetEnergy {
            id: EntityId(3),
            energy: 77.0,
        })
        .expect("submit");
    engine
        .submit(EngineCommand::Spawn(Entity::new(
            EntityKind::Cell,
            Vec2::new(10.0, 10.0),
            Vec2::ZERO,
            1.0,
            1.0,
        )))
        .expect("spawn");
    engine
        .submit(EngineCommand::Remove(EntityId(4)))
        .expect("remove");
    let region = engine.read_region(world(engine.config())).expect("read");
    assert_eq!(region.entities.len(), 80);
    let marked = region
        .entities
        .iter()
        .find(|entity| entity.id == EntityId(3))
        .expect("entity 3");
    assert_eq!(marked.energy, 77.0);
    assert!(region.entities.iter().any(|entity| entity.id == EntityId(81)));
    assert_eq!(engine.advance(1).expect("advance").wait(), Ok(3));
}

#[test]
fn capacity_is_enforced_at_configure() {
    let config = EngineConfig {
        initial_entities: 40,
        gpu_max_entities: 32,
        ..config()
    };
    let Some(mut engine) = engine(config) else {
        return;
    };
    assert_eq!(
        engine.configure(),
        Err(EngineError::Device(DeviceFault::CapacityExceeded {
            requested: 40,
            capacity: 32,
        }))
    );
    assert_eq!(engine.state(), EngineState::Unconfigured);
}

#[test]
fn device_resources_are_released_exactly_once() {
    let Some(mut engine) = engine(config()) else {
        return;
    };
    engine.configure().expect("configure");
    engine.start().expect("start");
    assert!(engine.release());
    assert!(!engine.release());
    assert_eq!(engine.state(), EngineState::Stopped);
    assert_eq!(
        engine.configure(),
        Err(EngineError::Device(DeviceFault::Released))
    );
    let backend: Box<dyn SimulationBackend> = Box::new(engine);
    assert_eq!(backend.name(), "gpu-resident");
}
