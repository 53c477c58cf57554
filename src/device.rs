use crate::error::{DispatchError, ReadbackError};
use crate::pool::{Resource, ResourceId, ResourceKind, ResourcePool};
use crate::postprocess::{argmax_pixel, median_pixel, WORKGROUP_SIZE};
use std::collections::HashMap;
use tracing::trace;

/// Compute kernels the pipeline knows how to dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kernel {
    /// Binding 0: `classes * height * width` scores, channel-major.
    /// Binding 1: `height * width` class indices written as floats.
    Argmax {
        width: u32,
        height: u32,
        classes: u32,
    },
    /// 3x3 median of a class mask with edge texels repeated.
    /// Binding 0: source mask. Binding 1: destination mask. Both
    /// `height * width` floats.
    MedianFilter { width: u32, height: u32 },
}

impl Kernel {
    pub fn name(&self) -> &'static str {
        match self {
            Kernel::Argmax { .. } => "argmax",
            Kernel::MedianFilter { .. } => "median",
        }
    }

    /// Checks `bindings` against what the kernel reads and writes. Devices
    /// call this before touching any storage, so a rejected dispatch leaves
    /// every binding unchanged.
    pub fn validate(&self, bindings: &[&Resource]) -> Result<(), DispatchError> {
        let (expected, sizes) = match *self {
            Kernel::Argmax {
                width,
                height,
                classes,
            } => {
                let plane = width as usize * height as usize;
                (2, [plane * classes as usize, plane])
            }
            Kernel::MedianFilter { width, height } => {
                let plane = width as usize * height as usize;
                (2, [plane, plane])
            }
        };
        if bindings.len() != expected {
            return Err(DispatchError::BindingCount {
                kernel: self.name(),
                expected,
                actual: bindings.len(),
            });
        }
        for (slot, (resource, needed)) in bindings.iter().zip(sizes).enumerate() {
            let actual = element_count(resource);
            if actual < needed {
                return Err(DispatchError::BindingSize {
                    slot,
                    expected: needed,
                    actual,
                });
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThreadGroups {
    pub x: u32,
    pub y: u32,
    pub z: u32,
}

impl ThreadGroups {
    /// Enough workgroups of `workgroup` size to cover a `width x height` grid.
    pub fn covering(width: u32, height: u32, workgroup: (u32, u32)) -> Self {
        Self {
            x: width.div_ceil(workgroup.0),
            y: height.div_ceil(workgroup.1),
            z: 1,
        }
    }
}

#[derive(Debug, PartialEq, Eq, Hash)]
pub struct ReadbackTicket(u64);

impl ReadbackTicket {
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    pub fn id(&self) -> u64 {
        self.0
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ReadbackStatus {
    Pending,
    Ready(Vec<f32>),
    Failed(ReadbackError),
}

/// Fire-and-forget GPU work submission plus asynchronous readback.
pub trait ComputeDispatch {
    /// Uploads `data` to the start of `target`'s storage.
    fn write(&mut self, target: &Resource, data: &[u8]) -> Result<(), DispatchError>;

    fn dispatch(
        &mut self,
        kernel: Kernel,
        bindings: &[&Resource],
        groups: ThreadGroups,
    ) -> Result<(), DispatchError>;

    /// Starts copying `source` back to host memory as 32-bit floats.
    fn begin_readback(&mut self, source: &Resource) -> Result<ReadbackTicket, ReadbackError>;

    /// Ready and failed tickets are retired by this call.
    fn poll_readback(&mut self, ticket: &ReadbackTicket) -> ReadbackStatus;

    fn cancel_readback(&mut self, ticket: ReadbackTicket);

    /// Frees backing storage of a resource the pool has dropped.
    fn free(&mut self, id: ResourceId);
}

/// The pool and the device it allocates for, owned together by the host.
pub struct GpuContext {
    pub pool: ResourcePool,
    pub device: Box<dyn ComputeDispatch>,
}

impl GpuContext {
    pub fn new(device: impl ComputeDispatch + 'static) -> Self {
        Self {
            pool: ResourcePool::new(),
            device: Box::new(device),
        }
    }

    pub fn acquire(&mut self, kind: ResourceKind) -> Resource {
        self.pool.acquire(kind)
    }

    pub fn release(&mut self, resource: Resource) {
        self.pool.release(resource)
    }

    /// Drops pooled resources together with their device storage.
    pub fn trim(&mut self) {
        for id in self.pool.clear() {
            self.device.free(id);
        }
    }
}

struct PendingReadback {
    data: Vec<f32>,
    polls_left: u32,
}

/// Reference device executing kernels on the calling thread, one emulated
/// invocation at a time, in the same workgroup layout the GPU shader uses.
pub struct CpuDevice {
    storage: HashMap<ResourceId, Vec<u32>>,
    readbacks: HashMap<u64, PendingReadback>,
    next_ticket: u64,
    readback_latency: u32,
    dispatches: u64,
}

impl Default for CpuDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl CpuDevice {
    pub fn new() -> Self {
        Self {
            storage: HashMap::new(),
            readbacks: HashMap::new(),
            next_ticket: 1,
            readback_latency: 1,
            dispatches: 0,
        }
    }

    /// Readbacks report ready on the `polls`-th poll.
    pub fn with_readback_latency(mut self, polls: u32) -> Self {
        self.readback_latency = polls.max(1);
        self
    }

    pub fn dispatch_count(&self) -> u64 {
        self.dispatches
    }

    pub fn allocated(&self) -> usize {
        self.storage.len()
    }

    fn words(&mut self, resource: &Resource) -> &mut Vec<u32> {
        self.storage
            .entry(resource.id())
            .or_insert_with(|| vec![0; resource.byte_len().div_ceil(4)])
    }

    fn floats(&mut self, resource: &Resource) -> &mut [f32] {
        bytemuck::cast_slice_mut(self.words(resource).as_mut_slice())
    }
}

pub(crate) fn element_count(resource: &Resource) -> usize {
    match resource.kind() {
        ResourceKind::Image { width, height, .. } => width as usize * height as usize,
        _ => resource.byte_len() / 4,
    }
}

impl ComputeDispatch for CpuDevice {
    fn write(&mut self, target: &Resource, data: &[u8]) -> Result<(), DispatchError> {
        let capacity = target.byte_len();
        if data.len() > capacity {
            return Err(DispatchError::Overflow {
                len: data.len(),
                capacity,
            });
        }
        let bytes: &mut [u8] = bytemuck::cast_slice_mut(self.words(target).as_mut_slice());
        bytes[..data.len()].copy_from_slice(data);
        Ok(())
    }

    fn dispatch(
        &mut self,
        kernel: Kernel,
        bindings: &[&Resource],
        groups: ThreadGroups,
    ) -> Result<(), DispatchError> {
        kernel.validate(bindings)?;
        let (wx, wy) = WORKGROUP_SIZE;
        let (width, height) = match kernel {
            Kernel::Argmax { width, height, .. } | Kernel::MedianFilter { width, height } => {
                (width, height)
            }
        };
        let plane = width as usize * height as usize;
        let input_len = match kernel {
            Kernel::Argmax { classes, .. } => plane * classes as usize,
            Kernel::MedianFilter { .. } => plane,
        };
        let input = self.floats(bindings[0])[..input_len].to_vec();
        let output = self.floats(bindings[1]);
        for gy in 0..groups.y {
            for gx in 0..groups.x {
                for ly in 0..wy {
                    for lx in 0..wx {
                        let x = gx * wx + lx;
                        let y = gy * wy + ly;
                        if x >= width || y >= height {
                            continue;
                        }
                        let pixel = (y * width + x) as usize;
                        output[pixel] = match kernel {
                            Kernel::Argmax { classes, .. } => {
                                argmax_pixel(&input, classes as usize, plane, pixel) as f32
                            }
                            Kernel::MedianFilter { .. } => median_pixel(&input, width, height, x, y),
                        };
                    }
                }
            }
        }
        self.dispatches += 1;
        trace!(kernel = kernel.name(), ?groups, "cpu dispatch");
        Ok(())
    }

    fn begin_readback(&mut self, source: &Resource) -> Result<ReadbackTicket, ReadbackError> {
        let count = element_count(source);
        let data = self.floats(source)[..count].to_vec();
        let id = self.next_ticket;
        self.next_ticket += 1;
        self.readbacks.insert(
            id,
            PendingReadback {
                data,
                polls_left: self.readback_latency,
            },
        );
        Ok(ReadbackTicket(id))
    }

    fn poll_readback(&mut self, ticket: &ReadbackTicket) -> ReadbackStatus {
        let Some(pending) = self.readbacks.get_mut(&ticket.0) else {
            return ReadbackStatus::Failed(ReadbackError::UnknownTicket(ticket.0));
        };
        if pending.polls_left > 1 {
            pending.polls_left -= 1;
            return ReadbackStatus::Pending;
        }
        match self.readbacks.remove(&ticket.0) {
            Some(done) => ReadbackStatus::Ready(done.data),
            None => ReadbackStatus::Failed(ReadbackError::UnknownTicket(ticket.0)),
        }
    }

    fn cancel_readback(&mut self, ticket: ReadbackTicket) {
        self.readbacks.remove(&ticket.0);
    }

    fn free(&mut self, id: ResourceId) {
        self.storage.remove(&id);
    }
}
