use crate::device::GpuContext;
use crate::error::DispatchError;
use crate::frame::{FrameHandle, FrameImage, PixelFormat};
use crate::pipeline::CancellationToken;
use crate::pool::{Resource, ResourceKind, TextureFormat};
use image::imageops::FilterType;
use image::{DynamicImage, GrayImage, RgbImage, RgbaImage};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::mpsc;
use std::thread::JoinHandle;
use tracing::{debug, error, trace};

#[derive(Serialize, Deserialize, Debug, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Mirror {
    #[default]
    None,
    Horizontal,
    Vertical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CropRect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

/// How a camera frame becomes network input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConversionParams {
    pub crop: CropRect,
    pub target_width: u32,
    pub target_height: u32,
    pub mirror: Mirror,
}

impl ConversionParams {
    /// Centered square crop of side `min(width, height)` scaled to
    /// `size x size`.
    pub fn centered_square(width: u32, height: u32, size: u32, mirror: Mirror) -> Self {
        let side = width.min(height);
        Self {
            crop: CropRect {
                x: (width - side) / 2,
                y: (height - side) / 2,
                width: side,
                height: side,
            },
            target_width: size,
            target_height: size,
            mirror,
        }
    }
}

fn to_dynamic(frame: &FrameImage) -> Option<DynamicImage> {
    let data = frame.data.to_vec();
    match frame.format {
        PixelFormat::Rgb8 => {
            RgbImage::from_raw(frame.width, frame.height, data).map(DynamicImage::ImageRgb8)
        }
        PixelFormat::Rgba8 => {
            RgbaImage::from_raw(frame.width, frame.height, data).map(DynamicImage::ImageRgba8)
        }
        PixelFormat::Luma8 => {
            GrayImage::from_raw(frame.width, frame.height, data).map(DynamicImage::ImageLuma8)
        }
    }
}

/// Crops, scales and mirrors `frame` into an RGBA image.
pub fn convert_frame(frame: &FrameImage, params: &ConversionParams) -> Result<RgbaImage, String> {
    let crop = params.crop;
    if crop.width == 0
        || crop.height == 0
        || crop.x.checked_add(crop.width).map_or(true, |end| end > frame.width)
        || crop.y.checked_add(crop.height).map_or(true, |end| end > frame.height)
    {
        return Err(format!(
            "crop {crop:?} outside {}x{} frame",
            frame.width, frame.height
        ));
    }
    if params.target_width == 0 || params.target_height == 0 {
        return Err("empty conversion target".into());
    }
    let img = to_dynamic(frame).ok_or_else(|| {
        format!(
            "{} byte buffer does not hold a {}x{} {:?} frame",
            frame.data.len(),
            frame.width,
            frame.height,
            frame.format
        )
    })?;
    let img = img
        .crop_imm(crop.x, crop.y, crop.width, crop.height)
        .resize_exact(params.target_width, params.target_height, FilterType::Triangle);
    let img = match params.mirror {
        Mirror::None => img,
        Mirror::Horizontal => img.fliph(),
        Mirror::Vertical => img.flipv(),
    };
    Ok(img.into_rgba8())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConversionStatus {
    Pending,
    Ready,
    Failed(String),
}

/// Ticket for one in-progress conversion.
#[derive(Debug, PartialEq, Eq, Hash)]
pub struct ConversionRequest(u64);

impl ConversionRequest {
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    pub fn id(&self) -> u64 {
        self.0
    }
}

/// Converts frames without blocking the caller; completion is polled.
pub trait ImageConverter {
    fn begin_convert(&mut self, frame: &FrameHandle, params: &ConversionParams)
        -> ConversionRequest;

    fn poll(&mut self, request: &ConversionRequest) -> ConversionStatus;

    /// Takes the pixels of a request that polled `Ready`.
    fn take_output(&mut self, request: &ConversionRequest) -> Option<RgbaImage>;

    fn dispose(&mut self, request: ConversionRequest);
}

enum Slot {
    Queued(FrameImage, ConversionParams),
    Pending,
    Ready(RgbaImage),
    Failed(String),
}

/// Converts on the first poll after the request. Used where a worker thread
/// would only add noise, such as offline replay and tests.
#[derive(Default)]
pub struct InlineConverter {
    slots: HashMap<u64, Slot>,
    next_id: u64,
}

impl InlineConverter {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ImageConverter for InlineConverter {
    fn begin_convert(
        &mut self,
        frame: &FrameHandle,
        params: &ConversionParams,
    ) -> ConversionRequest {
        self.next_id += 1;
        self.slots
            .insert(self.next_id, Slot::Queued(frame.image().clone(), *params));
        ConversionRequest(self.next_id)
    }

    fn poll(&mut self, request: &ConversionRequest) -> ConversionStatus {
        let Some(slot) = self.slots.get_mut(&request.0) else {
            return ConversionStatus::Failed(format!("unknown conversion {}", request.0));
        };
        if let Slot::Queued(image, params) = slot {
            *slot = match convert_frame(image, params) {
                Ok(out) => Slot::Ready(out),
                Err(e) => Slot::Failed(e),
            };
        }
        slot_status(slot)
    }

    fn take_output(&mut self, request: &ConversionRequest) -> Option<RgbaImage> {
        take_ready(&mut self.slots, request)
    }

    fn dispose(&mut self, request: ConversionRequest) {
        self.slots.remove(&request.0);
    }
}

fn slot_status(slot: &Slot) -> ConversionStatus {
    match slot {
        Slot::Queued(..) | Slot::Pending => ConversionStatus::Pending,
        Slot::Ready(_) => ConversionStatus::Ready,
        Slot::Failed(e) => ConversionStatus::Failed(e.clone()),
    }
}

fn take_ready(slots: &mut HashMap<u64, Slot>, request: &ConversionRequest) -> Option<RgbaImage> {
    match slots.remove(&request.0)? {
        Slot::Ready(image) => Some(image),
        other => {
            slots.insert(request.0, other);
            None
        }
    }
}

struct Job {
    id: u64,
    image: FrameImage,
    params: ConversionParams,
}

/// Runs conversions on a dedicated worker thread. Results of disposed
/// requests are discarded when they arrive.
pub struct ThreadedConverter {
    jobs: Option<mpsc::Sender<Job>>,
    results: mpsc::Receiver<(u64, Result<RgbaImage, String>)>,
    slots: HashMap<u64, Slot>,
    next_id: u64,
    worker: Option<JoinHandle<()>>,
}

impl ThreadedConverter {
    pub fn spawn() -> Self {
        let (job_tx, job_rx) = mpsc::channel::<Job>();
        let (result_tx, result_rx) = mpsc::channel();
        let worker = std::thread::spawn(move || {
            debug!("conversion thread started");
            for job in job_rx {
                let out = convert_frame(&job.image, &job.params);
                if result_tx.send((job.id, out)).is_err() {
                    break;
                }
            }
            debug!("conversion thread stopped");
        });
        Self {
            jobs: Some(job_tx),
            results: result_rx,
            slots: HashMap::new(),
            next_id: 0,
            worker: Some(worker),
        }
    }

    fn drain(&mut self) {
        while let Ok((id, out)) = self.results.try_recv() {
            match self.slots.get_mut(&id) {
                Some(slot) => {
                    *slot = match out {
                        Ok(image) => Slot::Ready(image),
                        Err(e) => Slot::Failed(e),
                    }
                }
                None => trace!(id, "dropping result of disposed conversion"),
            }
        }
    }
}

impl ImageConverter for ThreadedConverter {
    fn begin_convert(
        &mut self,
        frame: &FrameHandle,
        params: &ConversionParams,
    ) -> ConversionRequest {
        self.next_id += 1;
        let id = self.next_id;
        let job = Job {
            id,
            image: frame.image().clone(),
            params: *params,
        };
        let sent = self.jobs.as_ref().is_some_and(|tx| tx.send(job).is_ok());
        let slot = if sent {
            Slot::Pending
        } else {
            error!("conversion thread is gone");
            Slot::Failed("conversion thread is gone".into())
        };
        self.slots.insert(id, slot);
        ConversionRequest(id)
    }

    fn poll(&mut self, request: &ConversionRequest) -> ConversionStatus {
        self.drain();
        match self.slots.get(&request.0) {
            Some(slot) => slot_status(slot),
            None => ConversionStatus::Failed(format!("unknown conversion {}", request.0)),
        }
    }

    fn take_output(&mut self, request: &ConversionRequest) -> Option<RgbaImage> {
        take_ready(&mut self.slots, request)
    }

    fn dispose(&mut self, request: ConversionRequest) {
        self.slots.remove(&request.0);
    }
}

impl Drop for ThreadedConverter {
    fn drop(&mut self) {
        self.jobs.take();
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

/// Outcome of polling a conversion in flight.
pub enum ConvertPoll {
    Pending(PendingConversion),
    Ready(RgbaImage),
    Cancelled,
    Failed(String),
}

/// A frame and its conversion request. Every way out of this type disposes
/// both exactly once.
pub struct PendingConversion {
    frame: FrameHandle,
    request: ConversionRequest,
}

impl PendingConversion {
    pub fn start(
        converter: &mut dyn ImageConverter,
        frame: FrameHandle,
        params: &ConversionParams,
    ) -> Self {
        let request = converter.begin_convert(&frame, params);
        trace!(frame = frame.sequence(), request = request.id(), "conversion started");
        Self { frame, request }
    }

    pub fn frame_sequence(&self) -> u64 {
        self.frame.sequence()
    }

    /// One suspension point: checks `cancel` first, then the converter.
    pub fn poll(self, converter: &mut dyn ImageConverter, cancel: &CancellationToken) -> ConvertPoll {
        if cancel.is_cancelled() {
            debug!(frame = self.frame.sequence(), "conversion cancelled");
            self.abort(converter);
            return ConvertPoll::Cancelled;
        }
        match converter.poll(&self.request) {
            ConversionStatus::Pending => ConvertPoll::Pending(self),
            ConversionStatus::Ready => {
                let output = converter.take_output(&self.request);
                self.abort(converter);
                match output {
                    Some(image) => ConvertPoll::Ready(image),
                    None => ConvertPoll::Failed("converter reported ready without output".into()),
                }
            }
            ConversionStatus::Failed(e) => {
                self.abort(converter);
                ConvertPoll::Failed(e)
            }
        }
    }

    /// Releases the frame and the request without producing output.
    pub fn abort(self, converter: &mut dyn ImageConverter) {
        let Self { frame, request } = self;
        converter.dispose(request);
        frame.dispose();
    }
}

/// Persistent network-resolution image. Overwritten in place every frame and
/// only reallocated when the resolution changes.
#[derive(Debug)]
pub struct ConvertedImage {
    resource: Resource,
    pixels: RgbaImage,
}

impl ConvertedImage {
    /// Returns the image in `slot`, allocating or resizing it to
    /// `width x height` first when needed.
    pub fn ensure<'a>(
        slot: &'a mut Option<ConvertedImage>,
        gpu: &mut GpuContext,
        width: u32,
        height: u32,
    ) -> &'a mut ConvertedImage {
        if slot
            .as_ref()
            .is_some_and(|img| img.pixels.dimensions() != (width, height))
        {
            if let Some(old) = slot.take() {
                debug!(from = ?old.pixels.dimensions(), to = ?(width, height), "resizing converted image");
                gpu.release(old.resource);
            }
        }
        slot.get_or_insert_with(|| ConvertedImage {
            resource: gpu.acquire(ResourceKind::Image {
                width,
                height,
                format: TextureFormat::Rgba8,
            }),
            pixels: RgbaImage::new(width, height),
        })
    }

    /// Copies `output` into the persistent image and uploads it.
    pub fn blit(&mut self, gpu: &mut GpuContext, output: &RgbaImage) -> Result<(), DispatchError> {
        self.pixels.copy_from_slice(output.as_raw());
        gpu.device.write(&self.resource, self.pixels.as_raw())
    }

    pub fn pixels(&self) -> &RgbaImage {
        &self.pixels
    }

    pub fn resource(&self) -> &Resource {
        &self.resource
    }

    pub fn width(&self) -> u32 {
        self.pixels.width()
    }

    pub fn height(&self) -> u32 {
        self.pixels.height()
    }

    pub fn release(self, gpu: &mut GpuContext) {
        gpu.release(self.resource);
    }
}
