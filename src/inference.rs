use crate::convert::ConvertedImage;
use crate::error::{BackendError, FrameError, PipelineError};
use candle_core::{DType, Device, Tensor};
use candle_onnx::{onnx, read_file, simple_eval};
use hf_hub::api::sync::Api;
use image::RgbaImage;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use tracing::{debug, error, info};

/// Where model weights come from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModelSource {
    File(PathBuf),
    HuggingFace { repo: String, file: String },
}

impl ModelSource {
    /// A local file when `path` exists, otherwise `path` fetched from `repo`.
    /// `SURFACE_MODEL` and `SURFACE_MODEL_REPO` override both.
    pub fn locate(path: &Path, repo: &str) -> Self {
        let file = std::env::var("SURFACE_MODEL").unwrap_or_else(|_| path.display().to_string());
        let repo = std::env::var("SURFACE_MODEL_REPO").unwrap_or_else(|_| repo.to_string());
        if Path::new(&file).exists() || repo.is_empty() {
            ModelSource::File(PathBuf::from(file))
        } else {
            ModelSource::HuggingFace { repo, file }
        }
    }

    pub fn resolve(&self) -> Result<PathBuf, PipelineError> {
        match self {
            ModelSource::File(path) => {
                if path.exists() {
                    Ok(path.clone())
                } else {
                    Err(PipelineError::Model(format!(
                        "model file {} not found",
                        path.display()
                    )))
                }
            }
            ModelSource::HuggingFace { repo, file } => {
                debug!(repo, file, "downloading model");
                Api::new()
                    .and_then(|api| api.model(repo.clone()).get(file))
                    .map_err(|e| PipelineError::Model(format!("failed to download model: {e}")))
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ModelHandle(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionHandle(pub u64);

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum BackendKind {
    #[default]
    Cpu,
    Gpu,
}

/// Per-channel input normalisation applied after scaling pixels to `[0, 1]`.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq)]
pub struct Normalization {
    pub mean: [f32; 3],
    pub std: [f32; 3],
}

impl Default for Normalization {
    fn default() -> Self {
        Self {
            mean: [0.485, 0.456, 0.406],
            std: [0.229, 0.224, 0.225],
        }
    }
}

/// `[1, 3, H, W]` network input built from the converted image.
#[derive(Debug)]
pub struct InputTensor {
    tensor: Tensor,
}

impl InputTensor {
    pub fn from_image(
        image: &RgbaImage,
        norm: &Normalization,
        device: &Device,
    ) -> candle_core::Result<Self> {
        let (width, height) = image.dimensions();
        let rgb: Vec<u8> = image
            .pixels()
            .flat_map(|p| [p.0[0], p.0[1], p.0[2]])
            .collect();
        let mean = Tensor::new(norm.mean.as_slice(), device)?.reshape((3, 1, 1))?;
        let std = Tensor::new(norm.std.as_slice(), device)?.reshape((3, 1, 1))?;
        let tensor = Tensor::from_vec(rgb, (height as usize, width as usize, 3), device)?
            .permute((2, 0, 1))?
            .to_dtype(DType::F32)?
            .affine(1.0 / 255.0, 0.0)?
            .broadcast_sub(&mean)?
            .broadcast_div(&std)?
            .unsqueeze(0)?;
        Ok(Self { tensor })
    }

    pub fn tensor(&self) -> &Tensor {
        &self.tensor
    }

    pub fn dims(&self) -> &[usize] {
        self.tensor.dims()
    }

    pub fn dispose(self) {}
}

/// Raw per-class scores returned by one inference. The release hook runs
/// exactly once, when the tensor is disposed or dropped.
pub struct ScoreTensor {
    tensor: Tensor,
    release: Option<Box<dyn FnOnce()>>,
}

impl ScoreTensor {
    pub fn new(tensor: Tensor) -> Self {
        Self {
            tensor,
            release: None,
        }
    }

    pub fn with_release(tensor: Tensor, release: impl FnOnce() + 'static) -> Self {
        Self {
            tensor,
            release: Some(Box::new(release)),
        }
    }

    /// Builds a `[classes, height, width]` tensor on the CPU.
    pub fn from_vec(
        data: Vec<f32>,
        (classes, height, width): (usize, usize, usize),
    ) -> candle_core::Result<Self> {
        Tensor::from_vec(data, (classes, height, width), &Device::Cpu).map(Self::new)
    }

    pub fn tensor(&self) -> &Tensor {
        &self.tensor
    }

    /// `(classes, height, width)`, ignoring a leading batch dimension of one.
    pub fn shape(&self) -> Result<(usize, usize, usize), FrameError> {
        match *self.tensor.dims() {
            [1, c, h, w] | [c, h, w] => Ok((c, h, w)),
            ref dims => Err(FrameError::Shape(format!(
                "expected [1, C, H, W] or [C, H, W], got {dims:?}"
            ))),
        }
    }

    /// Copies the scores out in channel-major order.
    pub fn to_vec(&self) -> Result<Vec<f32>, FrameError> {
        Ok(self
            .tensor
            .to_dtype(DType::F32)?
            .contiguous()?
            .flatten_all()?
            .to_vec1::<f32>()?)
    }

    pub fn dispose(self) {}
}

impl Drop for ScoreTensor {
    fn drop(&mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

impl fmt::Debug for ScoreTensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScoreTensor")
            .field("dims", &self.tensor.dims())
            .finish()
    }
}

/// Neural-network executor. Submission does not wait for results; the latest
/// output is fetched with [`ComputeBackend::peek_output`].
pub trait ComputeBackend {
    fn load(&mut self, model: &ModelSource) -> Result<ModelHandle, BackendError>;

    fn create_session(
        &mut self,
        model: ModelHandle,
        kind: BackendKind,
    ) -> Result<SessionHandle, BackendError>;

    fn is_ready(&self, session: SessionHandle) -> bool {
        let _ = session;
        true
    }

    fn schedule(&mut self, session: SessionHandle, input: &InputTensor) -> Result<(), BackendError>;

    /// Takes the most recent output, or `None` if the backend produced none.
    fn peek_output(&mut self, session: SessionHandle) -> Option<ScoreTensor>;

    fn dispose_session(&mut self, session: SessionHandle);

    fn dispose_model(&mut self, model: ModelHandle);
}

/// Owns the backend session and the single live input tensor.
pub struct InferenceDriver {
    backend: Box<dyn ComputeBackend>,
    model: ModelHandle,
    session: SessionHandle,
    input: Option<InputTensor>,
    normalization: Normalization,
    device: Device,
    disposed: bool,
}

impl InferenceDriver {
    pub fn new(
        mut backend: Box<dyn ComputeBackend>,
        source: &ModelSource,
        kind: BackendKind,
        normalization: Normalization,
    ) -> Result<Self, PipelineError> {
        let model = backend.load(source)?;
        let session = match backend.create_session(model, kind) {
            Ok(s) => s,
            Err(e) => {
                backend.dispose_model(model);
                return Err(e.into());
            }
        };
        info!(?kind, "inference session ready");
        Ok(Self {
            backend,
            model,
            session,
            input: None,
            normalization,
            device: Device::Cpu,
            disposed: false,
        })
    }

    pub fn is_ready(&self) -> bool {
        !self.disposed && self.backend.is_ready(self.session)
    }

    pub fn has_input(&self) -> bool {
        self.input.is_some()
    }

    /// Replaces the input tensor, schedules it and fetches the scores.
    pub fn run(&mut self, image: &ConvertedImage) -> Result<ScoreTensor, FrameError> {
        if let Some(previous) = self.input.take() {
            previous.dispose();
        }
        let input = self.input.insert(InputTensor::from_image(
            image.pixels(),
            &self.normalization,
            &self.device,
        )?);
        self.backend.schedule(self.session, input)?;
        self.backend.peek_output(self.session).ok_or_else(|| {
            error!("inference backend returned no output");
            FrameError::NoOutput
        })
    }

    pub fn shutdown(&mut self) {
        if self.disposed {
            return;
        }
        if let Some(input) = self.input.take() {
            input.dispose();
        }
        self.backend.dispose_session(self.session);
        self.backend.dispose_model(self.model);
        self.disposed = true;
        debug!("inference session disposed");
    }
}

struct LoadedModel {
    proto: onnx::ModelProto,
    input_name: String,
    output_name: String,
}

struct Session {
    model: u64,
    device: Device,
    output: Option<Tensor>,
}

/// ONNX models evaluated with candle. `schedule` runs the graph to completion
/// before returning.
#[derive(Default)]
pub struct CandleBackend {
    models: HashMap<u64, LoadedModel>,
    sessions: HashMap<u64, Session>,
    next_id: u64,
}

impl CandleBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn next(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }
}

impl ComputeBackend for CandleBackend {
    fn load(&mut self, model: &ModelSource) -> Result<ModelHandle, BackendError> {
        let path = model
            .resolve()
            .map_err(|e| BackendError::Load(e.to_string()))?;
        let proto = read_file(&path).map_err(|e| BackendError::Load(e.to_string()))?;
        let graph = proto
            .graph
            .as_ref()
            .ok_or_else(|| BackendError::Load("model graph missing".into()))?;
        let input_name = graph
            .input
            .first()
            .map(|i| i.name.clone())
            .ok_or_else(|| BackendError::Load("model has no inputs".into()))?;
        let output_name = graph
            .output
            .first()
            .map(|o| o.name.clone())
            .ok_or_else(|| BackendError::Load("model has no outputs".into()))?;
        info!(path = %path.display(), input = %input_name, output = %output_name, "model loaded");
        let id = self.next();
        self.models.insert(
            id,
            LoadedModel {
                proto,
                input_name,
                output_name,
            },
        );
        Ok(ModelHandle(id))
    }

    fn create_session(
        &mut self,
        model: ModelHandle,
        kind: BackendKind,
    ) -> Result<SessionHandle, BackendError> {
        if !self.models.contains_key(&model.0) {
            return Err(BackendError::UnknownModel(model.0));
        }
        let device = match kind {
            BackendKind::Cpu => Device::Cpu,
            BackendKind::Gpu => Device::cuda_if_available(0)?,
        };
        let id = self.next();
        self.sessions.insert(
            id,
            Session {
                model: model.0,
                device,
                output: None,
            },
        );
        Ok(SessionHandle(id))
    }

    fn schedule(&mut self, session: SessionHandle, input: &InputTensor) -> Result<(), BackendError> {
        let state = self
            .sessions
            .get_mut(&session.0)
            .ok_or(BackendError::UnknownSession(session.0))?;
        let model = self
            .models
            .get(&state.model)
            .ok_or(BackendError::UnknownModel(state.model))?;
        let mut inputs = HashMap::new();
        inputs.insert(
            model.input_name.clone(),
            input.tensor().to_device(&state.device)?,
        );
        let mut outputs = simple_eval(&model.proto, inputs)
            .map_err(|e| BackendError::Execution(e.to_string()))?;
        state.output = outputs.remove(&model.output_name);
        if state.output.is_none() {
            error!(output = %model.output_name, "model output missing");
        }
        Ok(())
    }

    fn peek_output(&mut self, session: SessionHandle) -> Option<ScoreTensor> {
        self.sessions
            .get_mut(&session.0)?
            .output
            .take()
            .map(ScoreTensor::new)
    }

    fn dispose_session(&mut self, session: SessionHandle) {
        self.sessions.remove(&session.0);
    }

    fn dispose_model(&mut self, model: ModelHandle) {
        self.models.remove(&model.0);
        self.sessions.retain(|_, s| s.model != model.0);
    }
}
