use crate::config::PipelineConfig;
use crate::convert::{
    ConversionParams, ConvertPoll, ConvertedImage, ImageConverter, Mirror, PendingConversion,
};
use crate::device::GpuContext;
use crate::error::{FrameError, PipelineError, ReadbackError};
use crate::frame::FrameSource;
use crate::hover::{ClassHit, ClassLookup, Viewport};
use crate::inference::{BackendKind, ComputeBackend, InferenceDriver, ModelSource, Normalization};
use crate::mask::{ClassMask, MaskPublisher};
use crate::paint::{PaintColor, PaintSettings};
use crate::postprocess::ArgmaxStage;
use crate::quality::QualityMode;
use image::RgbaImage;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use tracing::{debug, error, info, trace, warn};

/// Cooperative cancellation flag shared between the pipeline and whoever
/// tears it down.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

fn checkpoint(cancel: &CancellationToken) -> Result<(), FrameError> {
    if cancel.is_cancelled() {
        Err(FrameError::Cancelled)
    } else {
        Ok(())
    }
}

/// Where the frame currently in flight is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Idle,
    Acquiring,
    Converting,
    Scheduling,
    PostProcessing,
    Published,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FrameStats {
    pub acquired: u64,
    pub published: u64,
    pub dropped: u64,
    pub cancelled: u64,
}

/// The frame-driven segmentation pipeline. Call [`SegmentationPipeline::tick`]
/// once per rendered frame from a single thread; at most one camera frame is
/// in flight at any time and frames arriving meanwhile are skipped.
pub struct SegmentationPipeline {
    source: Box<dyn FrameSource>,
    converter: Box<dyn ImageConverter>,
    inference: InferenceDriver,
    argmax: ArgmaxStage,
    publisher: MaskPublisher,
    hover: ClassLookup,
    converted: Option<ConvertedImage>,
    pending: Option<PendingConversion>,
    stage: Stage,
    in_flight: bool,
    frame_counter: u64,
    frame_skip: u32,
    input_size: u32,
    adaptive: bool,
    mirror: Mirror,
    cancel: CancellationToken,
    paint: PaintSettings,
    stats: FrameStats,
    shut_down: bool,
}

impl SegmentationPipeline {
    pub fn builder() -> PipelineBuilder {
        PipelineBuilder::new()
    }

    pub fn tick(&mut self, gpu: &mut GpuContext) {
        if self.shut_down {
            return;
        }
        if self.in_flight {
            self.resume(gpu);
            return;
        }
        if self.cancel.is_cancelled() {
            trace!("pipeline cancelled, ignoring tick");
            return;
        }
        if !self.source.is_tracking() || !self.inference.is_ready() {
            trace!("not tracking or backend not ready");
            return;
        }

        self.frame_counter += 1;
        if self.frame_counter % (u64::from(self.frame_skip) + 1) != 0 {
            return;
        }

        self.stage = Stage::Acquiring;
        let Some(frame) = self.source.try_acquire_latest() else {
            debug!(tick = self.frame_counter, "no frame available");
            self.stage = Stage::Idle;
            return;
        };
        self.in_flight = true;
        self.stats.acquired += 1;
        if self.cancel.is_cancelled() {
            frame.dispose();
            self.finish(Err(FrameError::Cancelled));
            return;
        }

        let size = if self.adaptive {
            self.input_size.min(frame.width().min(frame.height())).max(1)
        } else {
            self.input_size
        };
        let params =
            ConversionParams::centered_square(frame.width(), frame.height(), size, self.mirror);
        trace!(frame = frame.sequence(), ?params, "frame acquired");
        self.pending = Some(PendingConversion::start(
            self.converter.as_mut(),
            frame,
            &params,
        ));
        self.stage = Stage::Converting;
        self.resume(gpu);
    }

    fn resume(&mut self, gpu: &mut GpuContext) {
        let Some(pending) = self.pending.take() else {
            warn!(stage = ?self.stage, "in flight without a pending conversion");
            self.finish(Err(FrameError::Cancelled));
            return;
        };
        match pending.poll(self.converter.as_mut(), &self.cancel) {
            ConvertPoll::Pending(p) => self.pending = Some(p),
            ConvertPoll::Cancelled => self.finish(Err(FrameError::Cancelled)),
            ConvertPoll::Failed(e) => self.finish(Err(FrameError::ConversionFailed(e))),
            ConvertPoll::Ready(image) => {
                let result = self.process(gpu, &image);
                self.finish(result);
            }
        }
    }

    fn process(&mut self, gpu: &mut GpuContext, image: &RgbaImage) -> Result<(), FrameError> {
        let converted =
            ConvertedImage::ensure(&mut self.converted, gpu, image.width(), image.height());
        converted.blit(gpu, image)?;
        checkpoint(&self.cancel)?;

        self.stage = Stage::Scheduling;
        let scores = self.inference.run(converted)?;
        checkpoint(&self.cancel)?;

        self.stage = Stage::PostProcessing;
        self.argmax.process(gpu, scores, &mut self.publisher)?;
        self.stage = Stage::Published;
        Ok(())
    }

    fn finish(&mut self, result: Result<(), FrameError>) {
        match result {
            Ok(()) => self.stats.published += 1,
            Err(FrameError::Cancelled) => {
                self.stats.cancelled += 1;
                debug!(stage = ?self.stage, "frame cancelled");
            }
            Err(e) => {
                self.stats.dropped += 1;
                error!(stage = ?self.stage, "frame dropped: {e}");
            }
        }
        self.in_flight = false;
        self.stage = Stage::Idle;
    }

    /// Cancels any frame in flight and releases every resource the pipeline
    /// holds. Further ticks do nothing.
    pub fn shutdown(&mut self, gpu: &mut GpuContext) {
        if self.shut_down {
            return;
        }
        self.cancel.cancel();
        if let Some(pending) = self.pending.take() {
            pending.abort(self.converter.as_mut());
            self.stats.cancelled += 1;
        }
        self.in_flight = false;
        self.stage = Stage::Idle;
        self.hover.cancel(gpu);
        if let Some(converted) = self.converted.take() {
            converted.release(gpu);
        }
        self.publisher.release(gpu);
        self.inference.shutdown();
        self.shut_down = true;
        info!(stats = ?self.stats, pool = ?gpu.pool.stats(), "pipeline shut down");
    }

    pub fn current_mask(&self) -> Option<&ClassMask> {
        self.publisher.current_mask()
    }

    pub fn is_ready(&self) -> bool {
        self.publisher.is_ready()
    }

    pub fn publisher(&self) -> &MaskPublisher {
        &self.publisher
    }

    pub fn converted_image(&self) -> Option<&ConvertedImage> {
        self.converted.as_ref()
    }

    pub fn set_frame_skip(&mut self, skip: u32) {
        debug!(skip, "frame skip updated");
        self.frame_skip = skip;
    }

    pub fn frame_skip(&self) -> u32 {
        self.frame_skip
    }

    pub fn set_paint_color(&mut self, color: PaintColor) {
        self.paint.set_paint_color(color);
    }

    pub fn set_smoothing_iterations(&mut self, iterations: u32) {
        self.argmax.set_smoothing_iterations(iterations);
    }

    pub fn smoothing_iterations(&self) -> u32 {
        self.argmax.smoothing_iterations()
    }

    pub fn input_size(&self) -> u32 {
        self.input_size
    }

    /// Switches preset. Takes effect from the next acquired frame.
    pub fn apply_quality(&mut self, mode: QualityMode) {
        if let Some(size) = mode.input_size() {
            self.input_size = size;
        }
        self.adaptive = mode.adaptive_resolution();
        self.argmax.set_smoothing_iterations(mode.smoothing_iterations());
        debug!(%mode, input = self.input_size, "quality mode applied");
    }

    pub fn paint(&self) -> &PaintSettings {
        &self.paint
    }

    pub fn paint_mut(&mut self) -> &mut PaintSettings {
        &mut self.paint
    }

    /// Starts a lookup of the class under a screen position. Returns `false`
    /// when a lookup is already in progress or no mask is published yet.
    pub fn class_at(&mut self, gpu: &mut GpuContext, x: f32, y: f32, viewport: Viewport) -> bool {
        self.hover
            .request(gpu, self.publisher.current_mask(), x, y, viewport)
    }

    /// Delivers the result of the lookup started by
    /// [`SegmentationPipeline::class_at`] once its readback completes.
    pub fn poll_class_at(&mut self, gpu: &mut GpuContext) -> Option<Result<ClassHit, ReadbackError>> {
        self.hover.poll(gpu)
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    pub fn in_flight(&self) -> bool {
        self.in_flight
    }

    pub fn frame_counter(&self) -> u64 {
        self.frame_counter
    }

    pub fn stats(&self) -> FrameStats {
        self.stats
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down
    }
}

/// Assembles a pipeline from explicitly injected collaborators.
pub struct PipelineBuilder {
    source: Option<Box<dyn FrameSource>>,
    converter: Option<Box<dyn ImageConverter>>,
    backend: Option<Box<dyn ComputeBackend>>,
    model: Option<ModelSource>,
    backend_kind: BackendKind,
    normalization: Normalization,
    frame_skip: u32,
    input_size: u32,
    adaptive: bool,
    smoothing_iterations: u32,
    mirror: Mirror,
    paint_color: PaintColor,
    cancel: CancellationToken,
}

impl Default for PipelineBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl PipelineBuilder {
    pub fn new() -> Self {
        Self::from_config(&PipelineConfig::default())
    }

    pub fn from_config(config: &PipelineConfig) -> Self {
        Self {
            source: None,
            converter: None,
            backend: None,
            model: None,
            backend_kind: BackendKind::Cpu,
            normalization: config.normalization,
            frame_skip: config.frame_skip,
            input_size: config.input_size,
            adaptive: config.quality.adaptive_resolution(),
            smoothing_iterations: config.smoothing_iterations,
            mirror: config.mirror,
            paint_color: config.paint_color,
            cancel: CancellationToken::new(),
        }
    }

    pub fn frame_source(mut self, source: impl FrameSource + 'static) -> Self {
        self.source = Some(Box::new(source));
        self
    }

    pub fn converter(mut self, converter: impl ImageConverter + 'static) -> Self {
        self.converter = Some(Box::new(converter));
        self
    }

    pub fn backend(mut self, backend: impl ComputeBackend + 'static) -> Self {
        self.backend = Some(Box::new(backend));
        self
    }

    pub fn model(mut self, model: ModelSource) -> Self {
        self.model = Some(model);
        self
    }

    pub fn backend_kind(mut self, kind: BackendKind) -> Self {
        self.backend_kind = kind;
        self
    }

    pub fn normalization(mut self, normalization: Normalization) -> Self {
        self.normalization = normalization;
        self
    }

    pub fn frame_skip(mut self, skip: u32) -> Self {
        self.frame_skip = skip;
        self
    }

    pub fn input_size(mut self, size: u32) -> Self {
        self.input_size = size;
        self
    }

    /// Lets the input size drop to the camera's shorter side.
    pub fn adaptive_resolution(mut self, adaptive: bool) -> Self {
        self.adaptive = adaptive;
        self
    }

    /// Median passes run over every mask before it is published.
    pub fn smoothing_iterations(mut self, iterations: u32) -> Self {
        self.smoothing_iterations = iterations;
        self
    }

    pub fn mirror(mut self, mirror: Mirror) -> Self {
        self.mirror = mirror;
        self
    }

    pub fn paint_color(mut self, color: PaintColor) -> Self {
        self.paint_color = color;
        self
    }

    /// Shares an externally owned cancellation token with the pipeline.
    pub fn cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn build(self) -> Result<SegmentationPipeline, PipelineError> {
        let source = self.source.ok_or(PipelineError::MissingFrameSource)?;
        let converter = self.converter.ok_or(PipelineError::MissingConverter)?;
        let backend = self.backend.ok_or(PipelineError::MissingBackend)?;
        let model = self.model.ok_or(PipelineError::MissingModel)?;
        if self.input_size == 0 {
            return Err(PipelineError::Model("input size must be positive".into()));
        }
        let inference =
            InferenceDriver::new(backend, &model, self.backend_kind, self.normalization)?;
        info!(
            skip = self.frame_skip,
            input = self.input_size,
            smoothing = self.smoothing_iterations,
            mirror = ?self.mirror,
            "segmentation pipeline built"
        );
        Ok(SegmentationPipeline {
            source,
            converter,
            inference,
            argmax: ArgmaxStage::with_smoothing(self.smoothing_iterations),
            publisher: MaskPublisher::new(),
            hover: ClassLookup::new(),
            converted: None,
            pending: None,
            stage: Stage::Idle,
            in_flight: false,
            frame_counter: 0,
            frame_skip: self.frame_skip,
            input_size: self.input_size,
            adaptive: self.adaptive,
            mirror: self.mirror,
            cancel: self.cancel,
            paint: PaintSettings::new(self.paint_color),
            stats: FrameStats::default(),
            shut_down: false,
        })
    }
}
