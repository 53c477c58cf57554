use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, warn};

static NEXT_RESOURCE_ID: AtomicU64 = AtomicU64::new(1);

/// Pixel layout of a pooled image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TextureFormat {
    Rgba8,
    R32Float,
    Rgba32Float,
}

impl TextureFormat {
    pub fn bytes_per_pixel(self) -> usize {
        match self {
            TextureFormat::Rgba8 => 4,
            TextureFormat::R32Float => 4,
            TextureFormat::Rgba32Float => 16,
        }
    }
}

/// What a pooled resource is. Resources are only reused for an identical kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    Image {
        width: u32,
        height: u32,
        format: TextureFormat,
    },
    /// A buffer of `elements` 32-bit floats.
    Buffer { elements: usize },
    Mesh { vertices: usize },
}

impl ResourceKind {
    pub fn byte_len(&self) -> usize {
        match *self {
            ResourceKind::Image {
                width,
                height,
                format,
            } => width as usize * height as usize * format.bytes_per_pixel(),
            ResourceKind::Buffer { elements } => elements * 4,
            // position, normal and uv per vertex
            ResourceKind::Mesh { vertices } => vertices * 32,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceId(u64);

impl ResourceId {
    pub fn get(self) -> u64 {
        self.0
    }
}

/// Handle to GPU backing storage. Not `Clone`: whoever holds the handle owns
/// the resource until it is handed back with [`ResourcePool::release`].
#[derive(Debug, PartialEq, Eq)]
pub struct Resource {
    id: ResourceId,
    kind: ResourceKind,
}

impl Resource {
    fn allocate(kind: ResourceKind) -> Self {
        Self {
            id: ResourceId(NEXT_RESOURCE_ID.fetch_add(1, Ordering::Relaxed)),
            kind,
        }
    }

    pub fn id(&self) -> ResourceId {
        self.id
    }

    pub fn kind(&self) -> ResourceKind {
        self.kind
    }

    pub fn byte_len(&self) -> usize {
        self.kind.byte_len()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Resources currently handed out.
    pub active: usize,
    /// Resources waiting for reuse.
    pub pooled: usize,
    /// Allocations performed over the pool's lifetime.
    pub created: usize,
    pub bytes_estimate: usize,
}

/// Reusable GPU resources keyed by kind. Owned by the application root and
/// lent to the pipeline; all access happens on the tick thread.
#[derive(Debug, Default)]
pub struct ResourcePool {
    free: HashMap<ResourceKind, VecDeque<Resource>>,
    active: HashMap<ResourceId, ResourceKind>,
    created: usize,
    bytes: usize,
}

impl ResourcePool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pre-allocates `count` resources of `kind` so the hot path never misses.
    pub fn warm(&mut self, kind: ResourceKind, count: usize) {
        for _ in 0..count {
            let resource = self.create(kind);
            self.free.entry(kind).or_default().push_back(resource);
        }
        debug!(?kind, count, "pool warmed");
    }

    pub fn acquire(&mut self, kind: ResourceKind) -> Resource {
        let resource = match self.free.get_mut(&kind).and_then(VecDeque::pop_front) {
            Some(r) => r,
            None => {
                warn!(?kind, "resource pool empty, allocating");
                self.create(kind)
            }
        };
        self.active.insert(resource.id, kind);
        resource
    }

    /// Returns a resource for reuse. Resources this pool did not hand out are
    /// ignored.
    pub fn release(&mut self, resource: Resource) {
        if self.active.remove(&resource.id).is_none() {
            debug!(id = resource.id.0, "ignoring release of unknown resource");
            return;
        }
        self.free.entry(resource.kind).or_default().push_back(resource);
    }

    pub fn is_active(&self, id: ResourceId) -> bool {
        self.active.contains_key(&id)
    }

    /// Drops every pooled resource, returning their ids so the device can free
    /// the backing storage. Active resources are untouched.
    pub fn clear(&mut self) -> Vec<ResourceId> {
        let mut dropped = Vec::new();
        for (_, queue) in self.free.drain() {
            for resource in queue {
                self.bytes -= resource.byte_len();
                dropped.push(resource.id);
            }
        }
        dropped
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            active: self.active.len(),
            pooled: self.free.values().map(VecDeque::len).sum(),
            created: self.created,
            bytes_estimate: self.bytes,
        }
    }

    fn create(&mut self, kind: ResourceKind) -> Resource {
        self.created += 1;
        self.bytes += kind.byte_len();
        Resource::allocate(kind)
    }
}
