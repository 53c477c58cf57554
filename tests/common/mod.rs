#![allow(dead_code)]

use candle_core::{Device, Tensor};
use image::RgbaImage;
use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::rc::Rc;
use surface_segmenter::convert::{
    convert_frame, ConversionParams, ConversionRequest, ConversionStatus, ImageConverter,
};
use surface_segmenter::device::{
    ComputeDispatch, Kernel, ReadbackStatus, ReadbackTicket, ThreadGroups,
};
use surface_segmenter::error::{BackendError, DispatchError, ReadbackError};
use surface_segmenter::frame::{FrameHandle, FrameImage, FrameSource, PixelFormat};
use surface_segmenter::inference::{
    BackendKind, ComputeBackend, InputTensor, ModelHandle, ModelSource, ScoreTensor, SessionHandle,
};
use surface_segmenter::pipeline::{CancellationToken, PipelineBuilder, SegmentationPipeline};
use surface_segmenter::pool::{Resource, ResourceId};
use surface_segmenter::{CpuDevice, GpuContext};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelPoint {
    /// Right after the source hands out a frame.
    Acquire,
    /// When the converter reports the conversion ready.
    ConversionReady,
    /// While the backend schedules inference.
    Schedule,
}

/// Knobs shared by the fakes plus a record of everything they handed out.
pub struct Shared {
    pub frame_size: Cell<(u32, u32)>,
    pub frames_available: Cell<bool>,
    pub tracking: Cell<bool>,
    pub backend_ready: Cell<bool>,
    pub fail_load: Cell<bool>,
    pub converter_latency: Cell<u32>,
    pub output_shape: Cell<(usize, usize, usize)>,
    /// Frame sequences whose conversion fails.
    pub fail_conversion: RefCell<HashSet<u64>>,
    /// Inference runs (1-based) that produce no output.
    pub null_output: RefCell<HashSet<u64>>,
    pub fail_schedule: RefCell<HashSet<u64>>,
    pub bad_shape: RefCell<HashSet<u64>>,
    pub cancel_at: RefCell<Option<(CancelPoint, CancellationToken)>>,

    next_frame: Cell<u64>,
    runs: Cell<u64>,
    frames: RefCell<BTreeMap<u64, u32>>,
    scores: RefCell<BTreeMap<u64, u32>>,
    conversions: RefCell<BTreeMap<u64, u32>>,
    pub sessions_disposed: Cell<u32>,
    pub models_disposed: Cell<u32>,
}

impl Default for Shared {
    fn default() -> Self {
        Self {
            frame_size: Cell::new((8, 6)),
            frames_available: Cell::new(true),
            tracking: Cell::new(true),
            backend_ready: Cell::new(true),
            fail_load: Cell::new(false),
            converter_latency: Cell::new(0),
            output_shape: Cell::new((3, 2, 2)),
            fail_conversion: RefCell::default(),
            null_output: RefCell::default(),
            fail_schedule: RefCell::default(),
            bad_shape: RefCell::default(),
            cancel_at: RefCell::new(None),
            next_frame: Cell::new(0),
            runs: Cell::new(0),
            frames: RefCell::default(),
            scores: RefCell::default(),
            conversions: RefCell::default(),
            sessions_disposed: Cell::new(0),
            models_disposed: Cell::new(0),
        }
    }
}

impl Shared {
    pub fn new() -> Rc<Self> {
        Rc::new(Self::default())
    }

    fn trigger(&self, point: CancelPoint) {
        if let Some((at, token)) = &*self.cancel_at.borrow() {
            if *at == point {
                token.cancel();
            }
        }
    }

    pub fn frames_acquired(&self) -> usize {
        self.frames.borrow().len()
    }

    /// Frames handed out and not yet released.
    pub fn frames_outstanding(&self) -> usize {
        self.frames.borrow().values().filter(|&&n| n == 0).count()
    }

    pub fn scores_issued(&self) -> usize {
        self.scores.borrow().len()
    }

    pub fn scores_outstanding(&self) -> usize {
        self.scores.borrow().values().filter(|&&n| n == 0).count()
    }

    pub fn conversions_begun(&self) -> usize {
        self.conversions.borrow().len()
    }

    pub fn runs(&self) -> u64 {
        self.runs.get()
    }

    /// Asserts every frame, score tensor and conversion request was released
    /// exactly once.
    pub fn assert_all_released_once(&self) {
        for (kind, ledger) in [
            ("frame", &self.frames),
            ("score tensor", &self.scores),
            ("conversion", &self.conversions),
        ] {
            for (id, count) in ledger.borrow().iter() {
                assert_eq!(*count, 1, "{kind} {id} released {count} times");
            }
        }
    }
}

fn bump(ledger: &RefCell<BTreeMap<u64, u32>>, id: u64) {
    *ledger.borrow_mut().entry(id).or_default() += 1;
}

pub struct FakeSource(pub Rc<Shared>);

impl FrameSource for FakeSource {
    fn try_acquire_latest(&mut self) -> Option<FrameHandle> {
        let shared = &self.0;
        if !shared.frames_available.get() {
            return None;
        }
        let seq = shared.next_frame.get() + 1;
        shared.next_frame.set(seq);
        let (w, h) = shared.frame_size.get();
        let data: Vec<u8> = (0..w * h * 3).map(|i| (i % 251) as u8).collect();
        let image = FrameImage::new(w, h, PixelFormat::Rgb8, data);
        shared.frames.borrow_mut().insert(seq, 0);
        let ledger = shared.clone();
        let handle = FrameHandle::with_release(image, seq, move || bump(&ledger.frames, seq));
        shared.trigger(CancelPoint::Acquire);
        Some(handle)
    }

    fn is_tracking(&self) -> bool {
        self.0.tracking.get()
    }
}

struct Job {
    image: FrameImage,
    params: ConversionParams,
    frame: u64,
    polls_left: u32,
    output: Option<RgbaImage>,
}

/// Converter that reports ready after a scripted number of pending polls.
pub struct FakeConverter {
    shared: Rc<Shared>,
    jobs: HashMap<u64, Job>,
    next_id: u64,
}

impl FakeConverter {
    pub fn new(shared: Rc<Shared>) -> Self {
        Self {
            shared,
            jobs: HashMap::new(),
            next_id: 0,
        }
    }
}

impl ImageConverter for FakeConverter {
    fn begin_convert(
        &mut self,
        frame: &FrameHandle,
        params: &ConversionParams,
    ) -> ConversionRequest {
        self.next_id += 1;
        self.shared.conversions.borrow_mut().insert(self.next_id, 0);
        self.jobs.insert(
            self.next_id,
            Job {
                image: frame.image().clone(),
                params: *params,
                frame: frame.sequence(),
                polls_left: self.shared.converter_latency.get(),
                output: None,
            },
        );
        ConversionRequest::new(self.next_id)
    }

    fn poll(&mut self, request: &ConversionRequest) -> ConversionStatus {
        let Some(job) = self.jobs.get_mut(&request.id()) else {
            return ConversionStatus::Failed("unknown request".into());
        };
        if job.output.is_some() {
            return ConversionStatus::Ready;
        }
        if self.shared.fail_conversion.borrow().contains(&job.frame) {
            return ConversionStatus::Failed(format!("scripted failure of frame {}", job.frame));
        }
        if job.polls_left > 0 {
            job.polls_left -= 1;
            return ConversionStatus::Pending;
        }
        match convert_frame(&job.image, &job.params) {
            Ok(out) => {
                job.output = Some(out);
                self.shared.trigger(CancelPoint::ConversionReady);
                ConversionStatus::Ready
            }
            Err(e) => ConversionStatus::Failed(e),
        }
    }

    fn take_output(&mut self, request: &ConversionRequest) -> Option<RgbaImage> {
        self.jobs.get_mut(&request.id())?.output.take()
    }

    fn dispose(&mut self, request: ConversionRequest) {
        self.jobs.remove(&request.id());
        bump(&self.shared.conversions, request.id());
    }
}

/// Scores where class `run % classes` wins every pixel.
pub fn winning_scores(run: u64, (classes, height, width): (usize, usize, usize)) -> Vec<f32> {
    let winner = run as usize % classes;
    let plane = height * width;
    (0..classes * plane)
        .map(|i| if i / plane == winner { 1.0 } else { 0.0 })
        .collect()
}

pub struct FakeBackend {
    shared: Rc<Shared>,
    pending: Option<u64>,
    pub last_input: Rc<RefCell<Option<Vec<usize>>>>,
}

impl FakeBackend {
    pub fn new(shared: Rc<Shared>) -> Self {
        Self {
            shared,
            pending: None,
            last_input: Rc::default(),
        }
    }
}

impl ComputeBackend for FakeBackend {
    fn load(&mut self, _model: &ModelSource) -> Result<ModelHandle, BackendError> {
        if self.shared.fail_load.get() {
            return Err(BackendError::Load("scripted load failure".into()));
        }
        Ok(ModelHandle(1))
    }

    fn create_session(
        &mut self,
        _model: ModelHandle,
        _kind: BackendKind,
    ) -> Result<SessionHandle, BackendError> {
        Ok(SessionHandle(1))
    }

    fn is_ready(&self, _session: SessionHandle) -> bool {
        self.shared.backend_ready.get()
    }

    fn schedule(&mut self, _session: SessionHandle, input: &InputTensor) -> Result<(), BackendError> {
        let run = self.shared.runs.get() + 1;
        self.shared.runs.set(run);
        *self.last_input.borrow_mut() = Some(input.dims().to_vec());
        self.shared.trigger(CancelPoint::Schedule);
        if self.shared.fail_schedule.borrow().contains(&run) {
            return Err(BackendError::Execution(format!("scripted failure of run {run}")));
        }
        self.pending = Some(run);
        Ok(())
    }

    fn peek_output(&mut self, _session: SessionHandle) -> Option<ScoreTensor> {
        let run = self.pending.take()?;
        if self.shared.null_output.borrow().contains(&run) {
            return None;
        }
        let tensor = if self.shared.bad_shape.borrow().contains(&run) {
            Tensor::from_vec(vec![0f32; 4], (2, 2), &Device::Cpu)
        } else {
            let shape = self.shared.output_shape.get();
            Tensor::from_vec(winning_scores(run, shape), shape, &Device::Cpu)
        };
        let tensor = tensor.ok()?;
        self.shared.scores.borrow_mut().insert(run, 0);
        let ledger = self.shared.clone();
        Some(ScoreTensor::with_release(tensor, move || {
            bump(&ledger.scores, run)
        }))
    }

    fn dispose_session(&mut self, _session: SessionHandle) {
        self.shared
            .sessions_disposed
            .set(self.shared.sessions_disposed.get() + 1);
    }

    fn dispose_model(&mut self, _model: ModelHandle) {
        self.shared
            .models_disposed
            .set(self.shared.models_disposed.get() + 1);
    }
}

/// A builder wired to the fakes with no frame skipping and a 4x4 network
/// input.
pub fn builder(shared: &Rc<Shared>) -> PipelineBuilder {
    PipelineBuilder::new()
        .frame_source(FakeSource(shared.clone()))
        .converter(FakeConverter::new(shared.clone()))
        .backend(FakeBackend::new(shared.clone()))
        .model(ModelSource::File("model.onnx".into()))
        .frame_skip(0)
        .input_size(4)
        .adaptive_resolution(false)
        .smoothing_iterations(0)
}

pub fn pipeline(shared: &Rc<Shared>) -> SegmentationPipeline {
    builder(shared).build().unwrap()
}

pub fn gpu() -> GpuContext {
    GpuContext::new(CpuDevice::new())
}

/// Polls a readback of `resource` until it settles.
pub fn read_back(gpu: &mut GpuContext, resource: &Resource) -> Vec<f32> {
    let ticket = gpu.device.begin_readback(resource).unwrap();
    for _ in 0..100 {
        match gpu.device.poll_readback(&ticket) {
            ReadbackStatus::Pending => continue,
            ReadbackStatus::Ready(values) => return values,
            ReadbackStatus::Failed(e) => panic!("readback failed: {e}"),
        }
    }
    panic!("readback never completed");
}

/// Mask contents read back from the device.
pub fn mask_values(gpu: &mut GpuContext, pipeline: &SegmentationPipeline) -> Option<Vec<f32>> {
    let mask = pipeline.current_mask()?;
    Some(read_back(gpu, mask.resource()))
}

/// Failure and cancellation points for [`ScriptedDevice`].
#[derive(Clone, Default)]
pub struct DeviceScript {
    /// Dispatches (1-based, counted across the device's lifetime) that fail.
    pub fail: Rc<RefCell<HashSet<u64>>>,
    /// Cancelled as soon as the next dispatch is issued.
    pub cancel_on_dispatch: Rc<RefCell<Option<CancellationToken>>>,
    pub dispatches: Rc<Cell<u64>>,
}

/// A [`CpuDevice`] whose dispatches can be made to fail or to trigger a
/// cancellation mid-frame.
pub struct ScriptedDevice {
    inner: CpuDevice,
    script: DeviceScript,
}

impl ComputeDispatch for ScriptedDevice {
    fn write(&mut self, target: &Resource, data: &[u8]) -> Result<(), DispatchError> {
        self.inner.write(target, data)
    }

    fn dispatch(
        &mut self,
        kernel: Kernel,
        bindings: &[&Resource],
        groups: ThreadGroups,
    ) -> Result<(), DispatchError> {
        let n = self.script.dispatches.get() + 1;
        self.script.dispatches.set(n);
        if let Some(token) = self.script.cancel_on_dispatch.borrow_mut().take() {
            token.cancel();
        }
        if self.script.fail.borrow().contains(&n) {
            return Err(DispatchError::Device(format!("scripted failure of {}", kernel.name())));
        }
        self.inner.dispatch(kernel, bindings, groups)
    }

    fn begin_readback(&mut self, source: &Resource) -> Result<ReadbackTicket, ReadbackError> {
        self.inner.begin_readback(source)
    }

    fn poll_readback(&mut self, ticket: &ReadbackTicket) -> ReadbackStatus {
        self.inner.poll_readback(ticket)
    }

    fn cancel_readback(&mut self, ticket: ReadbackTicket) {
        self.inner.cancel_readback(ticket)
    }

    fn free(&mut self, id: ResourceId) {
        self.inner.free(id)
    }
}

pub fn scripted_gpu() -> (GpuContext, DeviceScript) {
    let script = DeviceScript::default();
    let device = ScriptedDevice {
        inner: CpuDevice::new(),
        script: script.clone(),
    };
    (GpuContext::new(device), script)
}
