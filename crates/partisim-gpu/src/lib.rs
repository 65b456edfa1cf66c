//! GPU-resident backend for partisim.
//!
//! The whole world is kept in device memory and advanced by one compute
//! dispatch per step. Kernel invariant violations are flagged in a small fault
//! record that the host reads back when a batch completes.

pub mod device;
pub mod engine;
pub mod layout;

pub use device::DeviceContext;
pub use engine::GpuEngine;
pub use layout::{FaultRecord, GpuEntity, GpuParams, STEP_WGSL, WORKGROUP_SIZE};
