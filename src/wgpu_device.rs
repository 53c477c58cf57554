use crate::device::{element_count, ComputeDispatch, Kernel, ReadbackStatus, ReadbackTicket, ThreadGroups};
use crate::error::{DispatchError, ReadbackError};
use crate::pool::{Resource, ResourceId};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::{debug, info, trace};

#[repr(C)]
#[derive(Copy, Clone, bytemuck::Pod, bytemuck::Zeroable)]
struct KernelParams {
    width: u32,
    height: u32,
    classes: u32,
    _padding: u32,
}

const NAN_CHECK: &str = r#"
fn is_nan(v: f32) -> bool {
    let bits = bitcast<u32>(v);
    return (bits & 0x7f800000u) == 0x7f800000u && (bits & 0x007fffffu) != 0u;
}
"#;

const ARGMAX_SHADER: &str = r#"
struct KernelParams {
    width: u32,
    height: u32,
    classes: u32,
    _padding: u32,
}

@group(0) @binding(0) var<uniform> params: KernelParams;
@group(0) @binding(1) var<storage, read> scores: array<f32>;
@group(0) @binding(2) var<storage, read_write> mask: array<f32>;

@compute @workgroup_size(8, 8, 1)
fn argmax(@builtin(global_invocation_id) id: vec3<u32>) {
    if (id.x >= params.width || id.y >= params.height) {
        return;
    }
    let plane = params.width * params.height;
    let pixel = id.y * params.width + id.x;
    var best = scores[pixel];
    var best_class = 0u;
    for (var c = 1u; c < params.classes; c = c + 1u) {
        let score = scores[c * plane + pixel];
        if (score > best || (is_nan(best) && !is_nan(score))) {
            best = score;
            best_class = c;
        }
    }
    mask[pixel] = f32(best_class);
}
"#;

const MEDIAN_SHADER: &str = r#"
struct KernelParams {
    width: u32,
    height: u32,
    classes: u32,
    _padding: u32,
}

@group(0) @binding(0) var<uniform> params: KernelParams;
@group(0) @binding(1) var<storage, read> source: array<f32>;
@group(0) @binding(2) var<storage, read_write> dest: array<f32>;

@compute @workgroup_size(8, 8, 1)
fn median(@builtin(global_invocation_id) id: vec3<u32>) {
    if (id.x >= params.width || id.y >= params.height) {
        return;
    }
    let max_x = i32(params.width) - 1;
    let max_y = i32(params.height) - 1;
    var window: array<f32, 9>;
    var n = 0u;
    for (var dy = -1; dy <= 1; dy = dy + 1) {
        for (var dx = -1; dx <= 1; dx = dx + 1) {
            let x = u32(clamp(i32(id.x) + dx, 0, max_x));
            let y = u32(clamp(i32(id.y) + dy, 0, max_y));
            window[n] = source[y * params.width + x];
            n = n + 1u;
        }
    }
    for (var i = 1u; i < 9u; i = i + 1u) {
        let v = window[i];
        var j = i;
        loop {
            if (j == 0u || window[j - 1u] <= v) {
                break;
            }
            window[j] = window[j - 1u];
            j = j - 1u;
        }
        window[j] = v;
    }
    dest[id.y * params.width + id.x] = window[4];
}
"#;

type MapResult = Arc<Mutex<Option<Result<(), String>>>>;

struct InFlightReadback {
    staging: wgpu::Buffer,
    mapped: MapResult,
}

/// [`ComputeDispatch`] on a wgpu device. Every pool resource is backed by one
/// storage buffer, created on first use.
pub struct WgpuDevice {
    device: wgpu::Device,
    queue: wgpu::Queue,
    layout: wgpu::BindGroupLayout,
    argmax: wgpu::ComputePipeline,
    median: wgpu::ComputePipeline,
    argmax_params: wgpu::Buffer,
    median_params: wgpu::Buffer,
    buffers: HashMap<ResourceId, wgpu::Buffer>,
    readbacks: HashMap<u64, InFlightReadback>,
    next_ticket: u64,
}

fn storage_size(resource: &Resource) -> u64 {
    (resource.byte_len().max(4) as u64).next_multiple_of(wgpu::COPY_BUFFER_ALIGNMENT)
}

impl WgpuDevice {
    pub fn new() -> Result<Self, DispatchError> {
        let instance = wgpu::Instance::new(wgpu::InstanceDescriptor {
            backends: wgpu::Backends::all(),
            ..Default::default()
        });
        let adapter = pollster::block_on(instance.request_adapter(&wgpu::RequestAdapterOptions {
            power_preference: wgpu::PowerPreference::HighPerformance,
            compatible_surface: None,
            force_fallback_adapter: false,
        }))
        .ok_or_else(|| DispatchError::Device("no suitable GPU adapter".into()))?;
        let (device, queue) = pollster::block_on(adapter.request_device(
            &wgpu::DeviceDescriptor {
                label: Some("segmentation device"),
                required_features: wgpu::Features::empty(),
                required_limits: wgpu::Limits::default(),
                memory_hints: wgpu::MemoryHints::default(),
            },
            None,
        ))
        .map_err(|e| DispatchError::Device(e.to_string()))?;
        info!(adapter = ?adapter.get_info().name, "gpu device ready");

        let layout = create_bind_group_layout(&device);
        let argmax = create_pipeline(&device, &layout, ARGMAX_SHADER, "argmax");
        let median = create_pipeline(&device, &layout, MEDIAN_SHADER, "median");
        let argmax_params = create_params_buffer(&device, "argmax params");
        let median_params = create_params_buffer(&device, "median params");
        Ok(Self {
            device,
            queue,
            layout,
            argmax,
            median,
            argmax_params,
            median_params,
            buffers: HashMap::new(),
            readbacks: HashMap::new(),
            next_ticket: 1,
        })
    }
}

/// The storage buffer backing `resource`, created on first use.
fn ensure_buffer<'a>(
    buffers: &'a mut HashMap<ResourceId, wgpu::Buffer>,
    device: &wgpu::Device,
    resource: &Resource,
) -> &'a wgpu::Buffer {
    buffers.entry(resource.id()).or_insert_with(|| {
        trace!(id = resource.id().get(), kind = ?resource.kind(), "creating storage buffer");
        device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("pool resource"),
            size: storage_size(resource),
            usage: wgpu::BufferUsages::STORAGE
                | wgpu::BufferUsages::COPY_DST
                | wgpu::BufferUsages::COPY_SRC,
            mapped_at_creation: false,
        })
    })
}

fn create_bind_group_layout(device: &wgpu::Device) -> wgpu::BindGroupLayout {
    let buffer_entry = |binding: u32, ty: wgpu::BufferBindingType| wgpu::BindGroupLayoutEntry {
        binding,
        visibility: wgpu::ShaderStages::COMPUTE,
        ty: wgpu::BindingType::Buffer {
            ty,
            has_dynamic_offset: false,
            min_binding_size: None,
        },
        count: None,
    };
    // Every kernel reads params, reads one buffer and writes another.
    device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
        label: Some("kernel bind group layout"),
        entries: &[
            buffer_entry(0, wgpu::BufferBindingType::Uniform),
            buffer_entry(1, wgpu::BufferBindingType::Storage { read_only: true }),
            buffer_entry(2, wgpu::BufferBindingType::Storage { read_only: false }),
        ],
    })
}

fn create_pipeline(
    device: &wgpu::Device,
    layout: &wgpu::BindGroupLayout,
    body: &str,
    entry_point: &str,
) -> wgpu::ComputePipeline {
    let module = device.create_shader_module(wgpu::ShaderModuleDescriptor {
        label: Some(entry_point),
        source: wgpu::ShaderSource::Wgsl(format!("{NAN_CHECK}{body}").into()),
    });
    let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
        label: Some(entry_point),
        bind_group_layouts: &[layout],
        push_constant_ranges: &[],
    });
    device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
        label: Some(entry_point),
        layout: Some(&pipeline_layout),
        module: &module,
        entry_point,
        cache: None,
        compilation_options: Default::default(),
    })
}

/// Uniform block rewritten with `write_buffer` before each dispatch.
fn create_params_buffer(device: &wgpu::Device, label: &str) -> wgpu::Buffer {
    device.create_buffer(&wgpu::BufferDescriptor {
        label: Some(label),
        size: std::mem::size_of::<KernelParams>() as u64,
        usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
        mapped_at_creation: false,
    })
}

impl ComputeDispatch for WgpuDevice {
    fn write(&mut self, target: &Resource, data: &[u8]) -> Result<(), DispatchError> {
        let capacity = target.byte_len();
        if data.len() > capacity {
            return Err(DispatchError::Overflow {
                len: data.len(),
                capacity,
            });
        }
        let align = wgpu::COPY_BUFFER_ALIGNMENT as usize;
        let mut padded;
        let data = if data.len() % align == 0 {
            data
        } else {
            padded = data.to_vec();
            padded.resize(data.len().next_multiple_of(align), 0);
            &padded[..]
        };
        let buffer = ensure_buffer(&mut self.buffers, &self.device, target);
        self.queue.write_buffer(buffer, 0, data);
        Ok(())
    }

    fn dispatch(
        &mut self,
        kernel: Kernel,
        bindings: &[&Resource],
        groups: ThreadGroups,
    ) -> Result<(), DispatchError> {
        kernel.validate(bindings)?;
        let &[input, output] = bindings else {
            return Err(DispatchError::BindingCount {
                kernel: kernel.name(),
                expected: 2,
                actual: bindings.len(),
            });
        };
        let (params, pipeline, params_buffer) = match kernel {
            Kernel::Argmax {
                width,
                height,
                classes,
            } => (
                KernelParams {
                    width,
                    height,
                    classes,
                    _padding: 0,
                },
                &self.argmax,
                &self.argmax_params,
            ),
            Kernel::MedianFilter { width, height } => (
                KernelParams {
                    width,
                    height,
                    classes: 0,
                    _padding: 0,
                },
                &self.median,
                &self.median_params,
            ),
        };

        ensure_buffer(&mut self.buffers, &self.device, input);
        ensure_buffer(&mut self.buffers, &self.device, output);
        let (Some(input), Some(output)) =
            (self.buffers.get(&input.id()), self.buffers.get(&output.id()))
        else {
            return Err(DispatchError::Device("missing storage buffer".into()));
        };
        self.queue
            .write_buffer(params_buffer, 0, bytemuck::bytes_of(&params));
        let bind_group = self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some(kernel.name()),
            layout: &self.layout,
            entries: &[
                wgpu::BindGroupEntry {
                    binding: 0,
                    resource: params_buffer.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 1,
                    resource: input.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 2,
                    resource: output.as_entire_binding(),
                },
            ],
        });

        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some(kernel.name()),
            });
        {
            let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some(kernel.name()),
                timestamp_writes: None,
            });
            pass.set_pipeline(pipeline);
            pass.set_bind_group(0, &bind_group, &[]);
            pass.dispatch_workgroups(groups.x, groups.y, groups.z);
        }
        self.queue.submit(Some(encoder.finish()));
        trace!(kernel = kernel.name(), ?groups, "gpu dispatch submitted");
        Ok(())
    }

    fn begin_readback(&mut self, source: &Resource) -> Result<ReadbackTicket, ReadbackError> {
        let size = (element_count(source) * 4) as u64;
        if size == 0 {
            return Err(ReadbackError::Failed("empty resource".into()));
        }
        let buffer = ensure_buffer(&mut self.buffers, &self.device, source);
        let staging = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("readback staging"),
            size,
            usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("readback encoder"),
            });
        encoder.copy_buffer_to_buffer(buffer, 0, &staging, 0, size);
        self.queue.submit(Some(encoder.finish()));

        let mapped: MapResult = Arc::new(Mutex::new(None));
        let slot = mapped.clone();
        staging
            .slice(..)
            .map_async(wgpu::MapMode::Read, move |result| {
                if let Ok(mut slot) = slot.lock() {
                    *slot = Some(result.map_err(|e| e.to_string()));
                }
            });

        let id = self.next_ticket;
        self.next_ticket += 1;
        self.readbacks.insert(id, InFlightReadback { staging, mapped });
        debug!(ticket = id, size, "readback started");
        Ok(ReadbackTicket::new(id))
    }

    fn poll_readback(&mut self, ticket: &ReadbackTicket) -> ReadbackStatus {
        let _ = self.device.poll(wgpu::Maintain::Poll);
        let Some(readback) = self.readbacks.get(&ticket.id()) else {
            return ReadbackStatus::Failed(ReadbackError::UnknownTicket(ticket.id()));
        };
        let outcome = match readback.mapped.lock() {
            Ok(mut slot) => slot.take(),
            Err(_) => Some(Err("readback state poisoned".to_string())),
        };
        let Some(outcome) = outcome else {
            return ReadbackStatus::Pending;
        };
        let Some(readback) = self.readbacks.remove(&ticket.id()) else {
            return ReadbackStatus::Failed(ReadbackError::UnknownTicket(ticket.id()));
        };
        match outcome {
            Ok(()) => {
                let values: Vec<f32> = {
                    let view = readback.staging.slice(..).get_mapped_range();
                    view.chunks_exact(4)
                        .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
                        .collect()
                };
                readback.staging.unmap();
                ReadbackStatus::Ready(values)
            }
            Err(e) => ReadbackStatus::Failed(ReadbackError::Failed(e)),
        }
    }

    fn cancel_readback(&mut self, ticket: ReadbackTicket) {
        if let Some(readback) = self.readbacks.remove(&ticket.id()) {
            readback.staging.destroy();
        }
    }

    fn free(&mut self, id: ResourceId) {
        if let Some(buffer) = self.buffers.remove(&id) {
            buffer.destroy();
        }
    }
}
