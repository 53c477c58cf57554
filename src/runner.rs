use crate::camera::CameraSource;
use crate::config::{current_frame_skip, load_config, PipelineConfig};
use crate::convert::ThreadedConverter;
use crate::device::{CpuDevice, GpuContext, ReadbackStatus, ReadbackTicket};
use crate::error::PipelineError;
use crate::frame::{DirSource, FrameSource};
use crate::inference::{BackendKind, CandleBackend, ModelSource};
use crate::mask::MaskStats;
use crate::pipeline::{FrameStats, PipelineBuilder, SegmentationPipeline};
use crate::pool::{ResourceKind, TextureFormat};
use crate::quality::{effective_input_size, DeviceProfile};
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tracing::{debug, info, trace, warn, Level};

/// Options of the `run` command that override the persisted configuration.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub dir: Option<PathBuf>,
    pub model: Option<PathBuf>,
    pub ticks: Option<u64>,
    pub skip: Option<u32>,
    pub gpu: bool,
}

fn open_device(gpu: bool) -> GpuContext {
    #[cfg(feature = "gpu")]
    if gpu {
        match crate::wgpu_device::WgpuDevice::new() {
            Ok(device) => return GpuContext::new(device),
            Err(e) => warn!("falling back to the cpu device: {e}"),
        }
    }
    #[cfg(not(feature = "gpu"))]
    if gpu {
        warn!("built without the gpu feature, using the cpu device");
    }
    GpuContext::new(CpuDevice::new())
}

fn with_source(
    builder: PipelineBuilder,
    dir: Option<PathBuf>,
) -> Result<PipelineBuilder, PipelineError> {
    match dir {
        Some(dir) => {
            let source = DirSource::new(&dir);
            debug!(dir = %dir.display(), frames = source.len(), "replaying directory");
            if !source.is_tracking() {
                warn!("no frames to replay, the pipeline will stay idle");
            }
            Ok(builder.frame_source(source))
        }
        None => Ok(builder.frame_source(CameraSource::open(0)?)),
    }
}

/// Builds the pipeline described by `cfg`, with `opts` taking precedence.
pub fn build_pipeline(
    cfg: &PipelineConfig,
    opts: &RunOptions,
) -> Result<SegmentationPipeline, PipelineError> {
    let model_path = opts.model.clone().unwrap_or_else(|| cfg.model.clone());
    let model = ModelSource::locate(&model_path, &cfg.model_repo);
    let kind = if opts.gpu {
        BackendKind::Gpu
    } else {
        BackendKind::Cpu
    };
    let mut builder = PipelineBuilder::from_config(cfg)
        .converter(ThreadedConverter::spawn())
        .backend(CandleBackend::new())
        .backend_kind(kind)
        .model(model);
    if let Some(skip) = opts.skip {
        builder = builder.frame_skip(skip);
    }
    with_source(builder, opts.dir.clone())?.build()
}

/// Samples class coverage of published masks for the debug log. At most one
/// readback is outstanding and it is only ever polled, never waited on.
#[derive(Debug, Default)]
struct CoverageSampler {
    pending: Option<(ReadbackTicket, u32, u32)>,
}

impl CoverageSampler {
    fn request(&mut self, gpu: &mut GpuContext, pipeline: &SegmentationPipeline) {
        if self.pending.is_some() || !tracing::enabled!(Level::DEBUG) {
            return;
        }
        let Some(mask) = pipeline.current_mask() else {
            return;
        };
        match gpu.device.begin_readback(mask.resource()) {
            Ok(ticket) => self.pending = Some((ticket, mask.width(), mask.height())),
            Err(e) => warn!("mask readback failed: {e}"),
        }
    }

    fn poll(&mut self, gpu: &mut GpuContext) {
        let Some((ticket, width, height)) = self.pending.take() else {
            return;
        };
        match gpu.device.poll_readback(&ticket) {
            ReadbackStatus::Pending => self.pending = Some((ticket, width, height)),
            ReadbackStatus::Ready(values) => {
                let stats = MaskStats::from_values(&values, width, height, 4);
                for entry in stats.top(5) {
                    debug!(
                        class = entry.class,
                        label = entry.label,
                        percent = %format!("{:.1}", entry.percent),
                        "coverage"
                    );
                }
            }
            ReadbackStatus::Failed(e) => warn!("mask readback failed: {e}"),
        }
    }

    fn cancel(&mut self, gpu: &mut GpuContext) {
        if let Some((ticket, ..)) = self.pending.take() {
            gpu.device.cancel_readback(ticket);
        }
    }
}

/// Ticks the pipeline at the configured rate until `opts.ticks` ticks have
/// run (forever without a limit), then shuts it down.
pub fn run(opts: RunOptions) -> Result<FrameStats, PipelineError> {
    let mut cfg = load_config();
    debug!(?cfg, "loaded configuration");
    let input_size = effective_input_size(&cfg, &DeviceProfile::detect());
    if input_size != cfg.input_size {
        info!(from = cfg.input_size, to = input_size, "input size capped for this device");
        cfg.input_size = input_size;
    }
    let mut gpu = open_device(opts.gpu);
    gpu.pool.warm(
        ResourceKind::Image {
            width: cfg.input_size,
            height: cfg.input_size,
            format: TextureFormat::Rgba8,
        },
        1,
    );
    let mut pipeline = build_pipeline(&cfg, &opts)?;
    let period = Duration::from_secs_f64(1.0 / f64::from(cfg.tick_hz.max(1.0)));
    let reload_every = cfg.tick_hz.max(1.0) as u64;
    info!(hz = cfg.tick_hz, ticks = ?opts.ticks, "pipeline running");

    let mut coverage = CoverageSampler::default();
    let mut tick = 0u64;
    let mut published = 0u64;
    while opts.ticks.map_or(true, |limit| tick < limit) {
        let started = Instant::now();
        pipeline.tick(&mut gpu);
        tick += 1;

        coverage.poll(&mut gpu);
        let stats = pipeline.stats();
        if stats.published != published {
            published = stats.published;
            coverage.request(&mut gpu, &pipeline);
        }
        if opts.skip.is_none() && tick % reload_every == 0 {
            let skip = current_frame_skip();
            if skip != pipeline.frame_skip() {
                pipeline.set_frame_skip(skip);
            }
        }

        let elapsed = started.elapsed();
        trace!(tick, ?elapsed, "tick finished");
        if let Some(rest) = period.checked_sub(elapsed) {
            std::thread::sleep(rest);
        }
    }

    coverage.cancel(&mut gpu);
    pipeline.shutdown(&mut gpu);
    gpu.trim();
    let stats = pipeline.stats();
    info!(?stats, pool = ?gpu.pool.stats(), "pipeline stopped");
    Ok(stats)
}
