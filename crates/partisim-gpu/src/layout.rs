//! Device-side data layout and the step kernel.

use bytemuck::{Pod, Zeroable};
use partisim_core::{DeviceFault, EngineConfig, Entity, EntityId, EntityKind, Vec2};

/// Threads per workgroup; must match `@workgroup_size` in [`STEP_WGSL`].
pub const WORKGROUP_SIZE: u32 = 64;

/// One entity as stored in device memory (40 bytes, matches the WGSL `Entity`).
#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable, Debug, PartialEq)]
pub struct GpuEntity {
    pub position: [f32; 2],
    pub velocity: [f32; 2],
    pub mass: f32,
    pub energy: f32,
    pub id_lo: u32,
    pub id_hi: u32,
    pub kind: u32,
    pub _pad: u32,
}

impl From<&Entity> for GpuEntity {
    fn from(entity: &Entity) -> Self {
        Self {
            position: [entity.position.x, entity.position.y],
            velocity: [entity.velocity.x, entity.velocity.y],
            mass: entity.mass,
            energy: entity.energy,
            id_lo: entity.id.0 as u32,
            id_hi: (entity.id.0 >> 32) as u32,
            kind: match entity.kind {
                EntityKind::Cell => 0,
                EntityKind::Particle => 1,
            },
            _pad: 0,
        }
    }
}

impl From<&GpuEntity> for Entity {
    fn from(raw: &GpuEntity) -> Self {
        let kind = if raw.kind == 1 {
            EntityKind::Particle
        } else {
            EntityKind::Cell
        };
        Entity::new(
            kind,
            Vec2::new(raw.position[0], raw.position[1]),
            Vec2::new(raw.velocity[0], raw.velocity[1]),
            raw.mass,
            raw.energy,
        )
        .with_id(EntityId(u64::from(raw.id_lo) | (u64::from(raw.id_hi) << 32)))
    }
}

/// Per-dispatch uniform block (48 bytes).
#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable, Debug, PartialEq)]
pub struct GpuParams {
    pub world: [f32; 2],
    pub count: u32,
    pub step: u32,
    pub time_step: f32,
    pub interaction_radius: f32,
    pub repulsion: f32,
    pub damping: f32,
    pub energy_decay: f32,
    pub max_speed: f32,
    pub wraparound: u32,
    pub _pad: u32,
}

impl GpuParams {
    #[must_use]
    pub fn from_config(config: &EngineConfig, count: usize, step: u64) -> Self {
        Self {
            world: [config.world_width as f32, config.world_height as f32],
            count: count as u32,
            step: step as u32,
            time_step: config.time_step,
            interaction_radius: config.interaction_radius,
            repulsion: config.repulsion,
            damping: config.damping,
            energy_decay: config.energy_decay,
            max_speed: config.max_speed,
            wraparound: u32::from(config.wraparound),
            _pad: 0,
        }
    }
}

/// First invariant violation the kernel observed. `flag == 0` means none.
#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable, Debug, Default, PartialEq, Eq)]
pub struct FaultRecord {
    pub flag: u32,
    pub slot: u32,
    pub reason: u32,
    pub step: u32,
}

pub const REASON_MASS: u32 = 1;
pub const REASON_ENERGY: u32 = 2;
pub const REASON_NON_FINITE: u32 = 3;

impl FaultRecord {
    #[must_use]
    pub fn is_set(&self) -> bool {
        self.flag != 0
    }

    /// Translate the record into a fault. `issued` is the last dispatched step and
    /// restores the high bits the kernel cannot carry.
    #[must_use]
    pub fn to_fault(&self, issued: u64) -> Option<DeviceFault> {
        if !self.is_set() {
            return None;
        }
        let high = issued & !u64::from(u32::MAX);
        let mut step = high | u64::from(self.step);
        if step > issued {
            step = step.saturating_sub(1 << 32);
        }
        let reason = match self.reason {
            REASON_MASS => "non-positive mass",
            REASON_ENERGY => "negative energy",
            REASON_NON_FINITE => "non-finite position or velocity",
            _ => "unknown",
        };
        Some(DeviceFault::Kernel {
            step,
            slot: self.slot,
            reason,
        })
    }
}

/// Soft-particle step over the whole resident world: read `src`, write `dst`.
pub const STEP_WGSL: &str = r#"
struct Entity {
    position: vec2<f32>,
    velocity: vec2<f32>,
    mass: f32,
    energy: f32,
    id_lo: u32,
    id_hi: u32,
    kind: u32,
    pad: u32,
}

struct Params {
    world: vec2<f32>,
    count: u32,
    step: u32,
    time_step: f32,
    interaction_radius: f32,
    repulsion: f32,
    damping: f32,
    energy_decay: f32,
    max_speed: f32,
    wraparound: u32,
    pad: u32,
}

struct FaultRecord {
    flag: atomic<u32>,
    slot: u32,
    reason: u32,
    step: u32,
}

@group(0) @binding(0) var<uniform> params: Params;
@group(0) @binding(1) var<storage, read> src: array<Entity>;
@group(0) @binding(2) var<storage, read_write> dst: array<Entity>;
@group(0) @binding(3) var<storage, read_write> fault: FaultRecord;

fn raise_fault(slot: u32, reason: u32) {
    let previous = atomicExchange(&fault.flag, 1u);
    if (previous == 0u) {
        fault.slot = slot;
        fault.reason = reason;
        fault.step = params.step;
    }
}

fn finite(v: f32) -> bool {
    return abs(v) <= 3.0e38;
}

fn min_image(d: f32, extent: f32) -> f32 {
    if (d > extent * 0.5) {
        return d - extent;
    }
    if (d < -extent * 0.5) {
        return d + extent;
    }
    return d;
}

fn delta(a: vec2<f32>, b: vec2<f32>) -> vec2<f32> {
    let d = b - a;
    if (params.wraparound != 0u) {
        return vec2<f32>(min_image(d.x, params.world.x), min_image(d.y, params.world.y));
    }
    return d;
}

fn wrap_axis(v: f32, extent: f32) -> f32 {
    let w = v - floor(v / extent) * extent;
    if (w >= extent || w < 0.0) {
        return 0.0;
    }
    return w;
}

// Returns (position, velocity) for one axis after bouncing off the walls.
fn reflect_axis(p: f32, v: f32, extent: f32) -> vec2<f32> {
    let inside = extent - 0.001;
    if (p < 0.0) {
        return vec2<f32>(min(-p, inside), abs(v));
    }
    if (p >= extent) {
        return vec2<f32>(clamp(2.0 * extent - p, 0.0, inside), -abs(v));
    }
    return vec2<f32>(p, v);
}

@compute @workgroup_size(64)
fn main(@builtin(global_invocation_id) gid: vec3<u32>) {
    let i = gid.x;
    if (i >= params.count) {
        return;
    }
    var e = src[i];
    // A faulted world is frozen at the state that raised the fault.
    if (atomicLoad(&fault.flag) != 0u) {
        dst[i] = e;
        return;
    }
    if (!(e.mass > 0.0)) {
        raise_fault(i, 1u);
        dst[i] = e;
        return;
    }

    let dt = params.time_step;
    let r = params.interaction_radius;
    var force = vec2<f32>(0.0, 0.0);
    for (var j = 0u; j < params.count; j = j + 1u) {
        if (j == i) {
            continue;
        }
        let away = delta(src[j].position, e.position);
        let dist_sq = dot(away, away);
        if (dist_sq >= r * r || dist_sq <= 1.1920929e-7) {
            continue;
        }
        let dist = sqrt(dist_sq);
        force = force + away * (params.repulsion * (1.0 - dist / r) / dist);
    }

    var velocity = (e.velocity + force * (dt / e.mass)) * (1.0 - params.damping * dt);
    let speed = length(velocity);
    if (speed > params.max_speed) {
        velocity = velocity * (params.max_speed / speed);
    }
    var position = e.position + velocity * dt;
    if (params.wraparound != 0u) {
        position = vec2<f32>(wrap_axis(position.x, params.world.x), wrap_axis(position.y, params.world.y));
    } else {
        let x = reflect_axis(position.x, velocity.x, params.world.x);
        let y = reflect_axis(position.y, velocity.y, params.world.y);
        position = vec2<f32>(x.x, y.x);
        velocity = vec2<f32>(x.y, y.y);
    }
    e.position = position;
    e.velocity = velocity;
    e.energy = e.energy * (1.0 - params.energy_decay * dt);

    if (!(finite(position.x) && finite(position.y) && finite(velocity.x) && finite(velocity.y))) {
        raise_fault(i, 3u);
    } else if (e.energy < 0.0) {
        raise_fault(i, 2u);
    }
    dst[i] = e;
}
"#;
