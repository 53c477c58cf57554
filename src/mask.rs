use crate::classes;
use crate::device::GpuContext;
use crate::pool::{Resource, ResourceId, ResourceKind, TextureFormat};
use std::collections::BTreeMap;
use tracing::debug;

/// Single-channel image of class indices stored as floats.
#[derive(Debug)]
pub struct ClassMask {
    resource: Resource,
    width: u32,
    height: u32,
}

impl ClassMask {
    pub(crate) fn allocate(gpu: &mut GpuContext, width: u32, height: u32) -> Self {
        Self {
            resource: gpu.acquire(ResourceKind::Image {
                width,
                height,
                format: TextureFormat::R32Float,
            }),
            width,
            height,
        }
    }

    pub(crate) fn release(self, gpu: &mut GpuContext) {
        gpu.release(self.resource);
    }

    pub fn id(&self) -> ResourceId {
        self.resource.id()
    }

    pub fn resource(&self) -> &Resource {
        &self.resource
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }
}

/// Where a frame's final kernel writes: the live mask when its size still
/// fits, otherwise a freshly pooled one that only goes live on publish.
#[derive(Debug)]
pub(crate) enum MaskTarget<'a> {
    Current(&'a ClassMask),
    Fresh(ClassMask),
}

impl MaskTarget<'_> {
    pub(crate) fn resource(&self) -> &Resource {
        match self {
            MaskTarget::Current(mask) => mask.resource(),
            MaskTarget::Fresh(mask) => mask.resource(),
        }
    }

    pub(crate) fn into_fresh(self) -> Option<ClassMask> {
        match self {
            MaskTarget::Current(_) => None,
            MaskTarget::Fresh(mask) => Some(mask),
        }
    }
}

/// Holds the latest class mask. Readers get shared references; a frame only
/// replaces or rewrites it through [`MaskPublisher::publish`] after every
/// kernel of that frame succeeded.
#[derive(Debug, Default)]
pub struct MaskPublisher {
    mask: Option<ClassMask>,
    ready: bool,
    published: u64,
    reallocations: u64,
}

impl MaskPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current_mask(&self) -> Option<&ClassMask> {
        self.mask.as_ref()
    }

    /// True once at least one frame has been fully post-processed.
    pub fn is_ready(&self) -> bool {
        self.ready
    }

    pub fn published_frames(&self) -> u64 {
        self.published
    }

    pub fn reallocations(&self) -> u64 {
        self.reallocations
    }

    /// The mask a `width x height` result should be written into. The live
    /// mask is reused when its size matches; otherwise a new one is pooled
    /// and the live mask stays untouched until [`MaskPublisher::publish`].
    pub(crate) fn target(&self, gpu: &mut GpuContext, width: u32, height: u32) -> MaskTarget<'_> {
        match &self.mask {
            Some(mask) if mask.width == width && mask.height == height => {
                MaskTarget::Current(mask)
            }
            _ => MaskTarget::Fresh(ClassMask::allocate(gpu, width, height)),
        }
    }

    /// Marks the frame as published, swapping in `fresh` when the frame
    /// needed a new mask.
    pub(crate) fn publish(&mut self, gpu: &mut GpuContext, fresh: Option<ClassMask>) {
        if let Some(fresh) = fresh {
            if let Some(old) = self.mask.replace(fresh) {
                debug!(
                    from = ?(old.width, old.height),
                    to = ?(self.mask.as_ref().map(|m| (m.width, m.height))),
                    "reallocated class mask"
                );
                old.release(gpu);
            }
            self.reallocations += 1;
        }
        self.ready = true;
        self.published += 1;
    }

    /// Returns the mask to the pool. Used at teardown.
    pub fn release(&mut self, gpu: &mut GpuContext) {
        if let Some(mask) = self.mask.take() {
            mask.release(gpu);
        }
        self.ready = false;
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ClassCoverage {
    pub class: u32,
    pub label: &'static str,
    pub pixels: usize,
    pub percent: f32,
}

/// Per-class pixel counts over a sampled mask.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MaskStats {
    counts: BTreeMap<u32, usize>,
    sampled: usize,
}

impl MaskStats {
    /// Samples every `stride`-th pixel along both axes of a row-major mask.
    pub fn from_values(values: &[f32], width: u32, height: u32, stride: u32) -> Self {
        let stride = stride.max(1) as usize;
        let (width, height) = (width as usize, height as usize);
        let mut stats = Self::default();
        for y in (0..height).step_by(stride) {
            for x in (0..width).step_by(stride) {
                let Some(value) = values.get(y * width + x) else {
                    continue;
                };
                *stats.counts.entry(value.round() as u32).or_default() += 1;
                stats.sampled += 1;
            }
        }
        stats
    }

    pub fn sampled(&self) -> usize {
        self.sampled
    }

    pub fn count(&self, class: u32) -> usize {
        self.counts.get(&class).copied().unwrap_or(0)
    }

    /// The `n` classes covering the most pixels, largest first; ties favour
    /// the lower class index.
    pub fn top(&self, n: usize) -> Vec<ClassCoverage> {
        let mut entries: Vec<(u32, usize)> = self.counts.iter().map(|(&c, &p)| (c, p)).collect();
        entries.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
        entries
            .into_iter()
            .take(n)
            .map(|(class, pixels)| ClassCoverage {
                class,
                label: classes::label(class),
                pixels,
                percent: pixels as f32 * 100.0 / self.sampled.max(1) as f32,
            })
            .collect()
    }
}
