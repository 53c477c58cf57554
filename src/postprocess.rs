use crate::device::{GpuContext, Kernel, ThreadGroups};
use crate::error::{DispatchError, FrameError};
use crate::inference::ScoreTensor;
use crate::mask::MaskPublisher;
use crate::pool::{Resource, ResourceKind, TextureFormat};
use tracing::{debug, trace};

/// Workgroup edge lengths shared by every device implementation of the
/// argmax kernel.
pub const WORKGROUP_SIZE: (u32, u32) = (8, 8);

/// Index of the highest score for one pixel of a channel-major
/// `[classes, height, width]` tensor with `plane = height * width`.
///
/// Scans channels in order and only moves on a strictly greater score, so on
/// exact ties the lowest class index wins. NaN never wins over a number; a
/// pixel whose scores are all NaN maps to class 0.
pub fn argmax_pixel(scores: &[f32], classes: usize, plane: usize, pixel: usize) -> u32 {
    let mut best = scores[pixel];
    let mut best_class = 0u32;
    for class in 1..classes {
        let score = scores[class * plane + pixel];
        if score > best || (best.is_nan() && !score.is_nan()) {
            best = score;
            best_class = class as u32;
        }
    }
    best_class
}

/// Median of the 3x3 neighbourhood around `(x, y)` in a row-major
/// `width x height` mask, repeating edge texels.
pub fn median_pixel(values: &[f32], width: u32, height: u32, x: u32, y: u32) -> f32 {
    let mut window = [0.0f32; 9];
    let mut n = 0;
    for dy in -1i64..=1 {
        for dx in -1i64..=1 {
            let sx = (x as i64 + dx).clamp(0, width as i64 - 1) as usize;
            let sy = (y as i64 + dy).clamp(0, height as i64 - 1) as usize;
            window[n] = values[sy * width as usize + sx];
            n += 1;
        }
    }
    window.sort_unstable_by(f32::total_cmp);
    window[4]
}

/// Turns raw class scores into the published class-index mask, optionally
/// smoothing it with repeated median passes.
#[derive(Debug, Default)]
pub struct ArgmaxStage {
    dispatched: u64,
    smoothing_iterations: u32,
}

impl ArgmaxStage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_smoothing(iterations: u32) -> Self {
        Self {
            dispatched: 0,
            smoothing_iterations: iterations,
        }
    }

    pub fn dispatched(&self) -> u64 {
        self.dispatched
    }

    pub fn smoothing_iterations(&self) -> u32 {
        self.smoothing_iterations
    }

    pub fn set_smoothing_iterations(&mut self, iterations: u32) {
        self.smoothing_iterations = iterations;
    }

    /// Uploads `scores`, runs argmax and any median passes, and publishes the
    /// result. The score tensor is consumed on every path. On error the
    /// previously published mask is left as it was.
    pub fn process(
        &mut self,
        gpu: &mut GpuContext,
        scores: ScoreTensor,
        publisher: &mut MaskPublisher,
    ) -> Result<(), FrameError> {
        let (classes, height, width) = scores.shape()?;
        if classes == 0 || height == 0 || width == 0 {
            return Err(FrameError::Shape(format!(
                "empty score tensor {classes}x{height}x{width}"
            )));
        }
        let data = scores.to_vec()?;

        let (width, height) = (width as u32, height as u32);
        let target = publisher.target(gpu, width, height);
        let transfer = gpu.acquire(ResourceKind::Buffer {
            elements: data.len(),
        });
        let scratch_kind = ResourceKind::Image {
            width,
            height,
            format: TextureFormat::R32Float,
        };
        let scratch: Vec<Resource> = (0..self.smoothing_iterations.min(2))
            .map(|_| gpu.acquire(scratch_kind))
            .collect();

        let submitted = gpu
            .device
            .write(&transfer, bytemuck::cast_slice(&data))
            .and_then(|()| {
                self.run_kernels(
                    gpu,
                    &transfer,
                    &scratch,
                    target.resource(),
                    (width, height, classes as u32),
                )
            });
        gpu.release(transfer);
        for resource in scratch {
            gpu.release(resource);
        }
        scores.dispose();

        let fresh = target.into_fresh();
        if let Err(e) = submitted {
            if let Some(fresh) = fresh {
                fresh.release(gpu);
            }
            return Err(e.into());
        }

        self.dispatched += 1;
        trace!(classes, width, height, "argmax dispatched");
        publisher.publish(gpu, fresh);
        debug!(frame = publisher.published_frames(), "mask published");
        Ok(())
    }

    /// Argmax into the first scratch buffer (or straight into `mask` when
    /// smoothing is off), then median passes ping-ponging between scratch
    /// buffers. Only the last dispatch writes `mask`.
    fn run_kernels(
        &self,
        gpu: &mut GpuContext,
        scores: &Resource,
        scratch: &[Resource],
        mask: &Resource,
        (width, height, classes): (u32, u32, u32),
    ) -> Result<(), DispatchError> {
        let groups = ThreadGroups::covering(width, height, WORKGROUP_SIZE);
        let iterations = self.smoothing_iterations;
        let argmax_out = scratch.first().unwrap_or(mask);
        gpu.device.dispatch(
            Kernel::Argmax {
                width,
                height,
                classes,
            },
            &[scores, argmax_out],
            groups,
        )?;
        for pass in 0..iterations {
            let source = &scratch[pass as usize % scratch.len()];
            let dest = if pass + 1 == iterations {
                mask
            } else {
                &scratch[(pass as usize + 1) % scratch.len()]
            };
            gpu.device
                .dispatch(Kernel::MedianFilter { width, height }, &[source, dest], groups)?;
        }
        if iterations > 0 {
            trace!(iterations, "mask smoothed");
        }
        Ok(())
    }
}
