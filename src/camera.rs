use crate::error::PipelineError;
use crate::frame::{FrameHandle, FrameImage, FrameSource};
use nokhwa::{
    pixel_format::RgbFormat,
    utils::{CameraFormat, CameraIndex, FrameFormat, RequestedFormat, RequestedFormatType},
    Camera,
};
use std::sync::mpsc;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, Mutex,
};
use std::thread::JoinHandle;
use tracing::{debug, error, info};

fn open_camera(index: u32) -> Option<Camera> {
    for (w, h) in [(1280, 720), (640, 480)] {
        for fmt in [FrameFormat::RAWRGB, FrameFormat::MJPEG, FrameFormat::YUYV] {
            let req = RequestedFormat::new::<RgbFormat>(RequestedFormatType::Closest(
                CameraFormat::new_from(w, h, fmt, 30),
            ));
            if let Ok(cam) = Camera::new(CameraIndex::Index(index), req) {
                return Some(cam);
            }
        }
    }
    let fallback = RequestedFormat::new::<RgbFormat>(RequestedFormatType::None);
    Camera::new(CameraIndex::Index(index), fallback).ok()
}

/// Live camera source. A capture thread keeps only the newest decoded frame;
/// [`FrameSource::try_acquire_latest`] takes it without waiting.
pub struct CameraSource {
    latest: Arc<Mutex<Option<FrameImage>>>,
    streaming: Arc<AtomicBool>,
    running: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
    sequence: u64,
}

impl CameraSource {
    /// Opens camera `index` and starts streaming. Fails if the device cannot
    /// be opened.
    pub fn open(index: u32) -> Result<Self, PipelineError> {
        let latest = Arc::new(Mutex::new(None));
        let streaming = Arc::new(AtomicBool::new(false));
        let running = Arc::new(AtomicBool::new(true));
        let (opened_tx, opened_rx) = mpsc::channel::<Result<(), String>>();

        let slot = latest.clone();
        let stream_flag = streaming.clone();
        let run_flag = running.clone();
        let worker = std::thread::spawn(move || {
            let Some(mut cam) = open_camera(index) else {
                let _ = opened_tx.send(Err(format!("failed to open camera {index}")));
                return;
            };
            if let Err(e) = cam.open_stream() {
                let _ = opened_tx.send(Err(format!("failed to open camera stream: {e}")));
                return;
            }
            debug!(format = ?cam.camera_format(), "camera stream opened");
            stream_flag.store(true, Ordering::Relaxed);
            let _ = opened_tx.send(Ok(()));

            while run_flag.load(Ordering::Relaxed) {
                let frame = match cam.frame() {
                    Ok(f) => f,
                    Err(e) => {
                        error!("failed to capture frame: {e}");
                        continue;
                    }
                };
                let img = match frame.decode_image::<RgbFormat>() {
                    Ok(i) => i,
                    Err(e) => {
                        error!("failed to decode frame: {e}");
                        continue;
                    }
                };
                let (width, height) = (img.width(), img.height());
                let image = FrameImage::new(
                    width,
                    height,
                    crate::frame::PixelFormat::Rgb8,
                    img.into_raw(),
                );
                if let Ok(mut latest) = slot.lock() {
                    *latest = Some(image);
                }
            }
            stream_flag.store(false, Ordering::Relaxed);
            if let Err(e) = cam.stop_stream() {
                error!("failed to stop camera stream: {e}");
            }
        });

        match opened_rx.recv() {
            Ok(Ok(())) => {
                info!(index, "camera ready");
                Ok(Self {
                    latest,
                    streaming,
                    running,
                    worker: Some(worker),
                    sequence: 0,
                })
            }
            Ok(Err(e)) => {
                let _ = worker.join();
                Err(PipelineError::Camera(e))
            }
            Err(_) => {
                let _ = worker.join();
                Err(PipelineError::Camera("capture thread exited".into()))
            }
        }
    }
}

impl FrameSource for CameraSource {
    fn try_acquire_latest(&mut self) -> Option<FrameHandle> {
        let image = self.latest.try_lock().ok()?.take()?;
        self.sequence += 1;
        Some(FrameHandle::new(image, self.sequence))
    }

    fn is_tracking(&self) -> bool {
        self.streaming.load(Ordering::Relaxed)
    }
}

impl Drop for CameraSource {
    fn drop(&mut self) {
        self.running.store(false, Ordering::Relaxed);
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}
