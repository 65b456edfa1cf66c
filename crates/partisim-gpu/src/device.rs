//! wgpu device, resident buffers and the compute pipeline.

use std::borrow::Cow;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex, PoisonError};

use bytemuck::Pod;
use partisim_core::DeviceFault;
use tracing::{error, info};
use wgpu::util::DeviceExt;

use crate::layout::{FaultRecord, GpuEntity, GpuParams, STEP_WGSL, WORKGROUP_SIZE};

/// Device-lost notification shared with the wgpu callback.
#[derive(Debug, Default)]
struct LostFlag {
    lost: AtomicBool,
    message: Mutex<Option<String>>,
}

/// Everything bound on the device for one session. The world lives in two
/// entity buffers used ping-pong: each dispatch reads one and writes the other.
pub struct DeviceContext {
    device: wgpu::Device,
    queue: wgpu::Queue,
    pipeline: wgpu::ComputePipeline,
    params: wgpu::Buffer,
    entities: [wgpu::Buffer; 2],
    fault: wgpu::Buffer,
    /// `bind_groups[front]` reads `entities[front]` and writes the other buffer.
    bind_groups: [wgpu::BindGroup; 2],
    capacity: usize,
    adapter: String,
    lost: Arc<LostFlag>,
    released: AtomicBool,
}

impl DeviceContext {
    /// Acquire an adapter and bind device memory for `capacity` entities.
    pub fn new(capacity: usize) -> Result<Self, DeviceFault> {
        pollster::block_on(Self::init(capacity))
    }

    async fn init(capacity: usize) -> Result<Self, DeviceFault> {
        let instance = wgpu::Instance::new(&wgpu::InstanceDescriptor::default());
        let adapter = instance
            .request_adapter(&wgpu::RequestAdapterOptions {
                power_preference: wgpu::PowerPreference::HighPerformance,
                compatible_surface: None,
                force_fallback_adapter: false,
            })
            .await
            .map_err(|err| DeviceFault::NoAdapter(err.to_string()))?;
        let info = adapter.get_info();
        if !adapter
            .get_downlevel_capabilities()
            .flags
            .contains(wgpu::DownlevelFlags::COMPUTE_SHADERS)
        {
            return Err(DeviceFault::NoAdapter(format!(
                "{} does not support compute shaders",
                info.name
            )));
        }
        let (device, queue) = adapter
            .request_device(&wgpu::DeviceDescriptor {
                label: Some("partisim.device"),
                required_limits: wgpu::Limits::downlevel_defaults(),
                ..Default::default()
            })
            .await
            .map_err(|err| DeviceFault::DeviceRequest(err.to_string()))?;

        let entity_bytes = (capacity.max(1) * std::mem::size_of::<GpuEntity>()) as u64;
        let max_binding = u64::from(device.limits().max_storage_buffer_binding_size);
        if entity_bytes > max_binding {
            return Err(DeviceFault::CapacityExceeded {
                requested: capacity,
                capacity: (max_binding / std::mem::size_of::<GpuEntity>() as u64) as usize,
            });
        }

        let lost = Arc::new(LostFlag::default());
        {
            let lost = Arc::clone(&lost);
            device.set_device_lost_callback(move |reason, message| {
                error!(?reason, %message, "gpu device lost");
                *lost.message.lock().unwrap_or_else(PoisonError::into_inner) =
                    Some(format!("{reason:?}: {message}"));
                lost.lost.store(true, Ordering::Release);
            });
        }

        device.push_error_scope(wgpu::ErrorFilter::Validation);
        let module = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("partisim.step.wgsl"),
            source: wgpu::ShaderSource::Wgsl(Cow::Borrowed(STEP_WGSL)),
        });
        let storage = |read_only: bool| wgpu::BindingType::Buffer {
            ty: wgpu::BufferBindingType::Storage { read_only },
            has_dynamic_offset: false,
            min_binding_size: None,
        };
        let layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("partisim.step.layout"),
            entries: &[
                wgpu::BindGroupLayoutEntry {
                    binding: 0,
                    visibility: wgpu::ShaderStages::COMPUTE,
                    ty: wgpu::BindingType::Buffer {
                        ty: wgpu::BufferBindingType::Uniform,
                        has_dynamic_offset: false,
                        min_binding_size: wgpu::BufferSize::new(
                            std::mem::size_of::<GpuParams>() as u64,
                        ),
                    },
                    count: None,
                },
                wgpu::BindGroupLayoutEntry {
                    binding: 1,
                    visibility: wgpu::ShaderStages::COMPUTE,
                    ty: storage(true),
                    count: None,
                },
                wgpu::BindGroupLayoutEntry {
                    binding: 2,
                    visibility: wgpu::ShaderStages::COMPUTE,
                    ty: storage(false),
                    count: None,
                },
                wgpu::BindGroupLayoutEntry {
                    binding: 3,
                    visibility: wgpu::ShaderStages::COMPUTE,
                    ty: storage(false),
                    count: None,
                },
            ],
        });
        let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some("partisim.step.pipeline_layout"),
            bind_group_layouts: &[&layout],
            push_constant_ranges: &[],
        });
        let pipeline = device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
            label: Some("partisim.step"),
            layout: Some(&pipeline_layout),
            module: &module,
            entry_point: Some("main"),
            compilation_options: wgpu::PipelineCompilationOptions::default(),
            cache: None,
        });

        let params = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("partisim.params"),
            size: std::mem::size_of::<GpuParams>() as u64,
            usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        let entity_buffer = |label: &'static str| {
            device.create_buffer(&wgpu::BufferDescriptor {
                label: Some(label),
                size: entity_bytes,
                usage: wgpu::BufferUsages::STORAGE
                    | wgpu::BufferUsages::COPY_DST
                    | wgpu::BufferUsages::COPY_SRC,
                mapped_at_creation: false,
            })
        };
        let entities = [
            entity_buffer("partisim.entities.a"),
            entity_buffer("partisim.entities.b"),
        ];
        let fault = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("partisim.fault"),
            contents: bytemuck::bytes_of(&FaultRecord::default()),
            usage: wgpu::BufferUsages::STORAGE
                | wgpu::BufferUsages::COPY_DST
                | wgpu::BufferUsages::COPY_SRC,
        });
        let bind_group = |front: usize| {
            device.create_bind_group(&wgpu::BindGroupDescriptor {
                label: Some("partisim.step.bind"),
                layout: &layout,
                entries: &[
                    wgpu::BindGroupEntry {
                        binding: 0,
                        resource: params.as_entire_binding(),
                    },
                    wgpu::BindGroupEntry {
                        binding: 1,
                        resource: entities[front].as_entire_binding(),
                    },
                    wgpu::BindGroupEntry {
                        binding: 2,
                        resource: entities[1 - front].as_entire_binding(),
                    },
                    wgpu::BindGroupEntry {
                        binding: 3,
                        resource: fault.as_entire_binding(),
                    },
                ],
            })
        };
        let bind_groups = [bind_group(0), bind_group(1)];
        if let Some(err) = device.pop_error_scope().await {
            return Err(DeviceFault::Validation(err.to_string()));
        }

        info!(
            adapter = %info.name,
            backend = ?info.backend,
            capacity,
            bytes = entity_bytes * 2,
            "gpu device initialised"
        );
        Ok(Self {
            device,
            queue,
            pipeline,
            params,
            entities,
            fault,
            bind_groups,
            capacity,
            adapter: info.name,
            lost,
            released: AtomicBool::new(false),
        })
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    #[must_use]
    pub fn adapter_name(&self) -> &str {
        &self.adapter
    }

    /// Reason the device was lost, if it was.
    #[must_use]
    pub fn lost(&self) -> Option<DeviceFault> {
        if !self.lost.lost.load(Ordering::Acquire) {
            return None;
        }
        let message = self
            .lost
            .message
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .unwrap_or_default();
        Some(DeviceFault::Lost(message))
    }

    /// Fails once the device was released or lost.
    pub fn ensure_live(&self) -> Result<(), DeviceFault> {
        if self.released.load(Ordering::Acquire) {
            return Err(DeviceFault::Released);
        }
        match self.lost() {
            Some(lost) => Err(lost),
            None => Ok(()),
        }
    }

    /// Replace the resident world in buffer `front`.
    pub fn upload(&self, front: usize, entities: &[GpuEntity]) -> Result<(), DeviceFault> {
        self.ensure_live()?;
        if entities.len() > self.capacity {
            return Err(DeviceFault::CapacityExceeded {
                requested: entities.len(),
                capacity: self.capacity,
            });
        }
        if !entities.is_empty() {
            self.queue
                .write_buffer(&self.entities[front], 0, bytemuck::cast_slice(entities));
        }
        Ok(())
    }

    pub fn clear_fault(&self) {
        self.queue
            .write_buffer(&self.fault, 0, bytemuck::bytes_of(&FaultRecord::default()));
    }

    /// Submit one dispatch reading buffer `front`. Returns the new front buffer.
    pub fn dispatch(&self, front: usize, params: &GpuParams) -> usize {
        self.queue
            .write_buffer(&self.params, 0, bytemuck::bytes_of(params));
        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("partisim.step.encoder"),
            });
        {
            let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some("partisim.step.pass"),
                timestamp_writes: None,
            });
            pass.set_pipeline(&self.pipeline);
            pass.set_bind_group(0, &self.bind_groups[front], &[]);
            pass.dispatch_workgroups(params.count.div_ceil(WORKGROUP_SIZE).max(1), 1, 1);
        }
        self.queue.submit(Some(encoder.finish()));
        1 - front
    }

    /// Raise `done` once every submission so far has finished executing.
    pub fn notify_when_idle(&self, done: Arc<AtomicBool>) {
        self.queue.on_submitted_work_done(move || {
            done.store(true, Ordering::Release);
        });
    }

    /// Let wgpu run completion callbacks without blocking.
    pub fn poll(&self) {
        let _ = self.device.poll(wgpu::PollType::Poll);
    }

    /// Block until `len` entities of buffer `front` are read back.
    pub fn read_entities(&self, front: usize, len: usize) -> Result<Vec<GpuEntity>, DeviceFault> {
        self.read_buffer(&self.entities[front], len)
    }

    pub fn read_fault(&self) -> Result<FaultRecord, DeviceFault> {
        let records: Vec<FaultRecord> = self.read_buffer(&self.fault, 1)?;
        Ok(records.first().copied().unwrap_or_default())
    }

    fn read_buffer<T: Pod>(&self, source: &wgpu::Buffer, len: usize) -> Result<Vec<T>, DeviceFault> {
        self.ensure_live()?;
        let size = (len * std::mem::size_of::<T>()) as u64;
        if size == 0 {
            return Ok(Vec::new());
        }
        let staging = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("partisim.readback"),
            size,
            usage: wgpu::BufferUsages::COPY_DST | wgpu::BufferUsages::MAP_READ,
            mapped_at_creation: false,
        });
        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("partisim.readback.encoder"),
            });
        encoder.copy_buffer_to_buffer(source, 0, &staging, 0, size);
        self.queue.submit(Some(encoder.finish()));

        let (tx, rx) = mpsc::channel();
        staging
            .slice(..)
            .map_async(wgpu::MapMode::Read, move |result| {
                let _ = tx.send(result);
            });
        self.device
            .poll(wgpu::PollType::wait_indefinitely())
            .map_err(|err| DeviceFault::Readback(err.to_string()))?;
        match rx.recv() {
            Ok(Ok(())) => {}
            Ok(Err(err)) => return Err(DeviceFault::Readback(err.to_string())),
            Err(_) => {
                return Err(DeviceFault::Readback(
                    "map callback dropped without running".to_string(),
                ));
            }
        }
        let data = staging.slice(..).get_mapped_range();
        let out = bytemuck::cast_slice::<u8, T>(&data).to_vec();
        drop(data);
        staging.unmap();
        Ok(out)
    }

    /// Free every device allocation. Only the first call does anything.
    pub fn release(&self) -> bool {
        if self.released.swap(true, Ordering::AcqRel) {
            return false;
        }
        for buffer in &self.entities {
            buffer.destroy();
        }
        self.fault.destroy();
        self.params.destroy();
        self.device.destroy();
        info!(adapter = %self.adapter, "gpu resources released");
        true
    }
}
