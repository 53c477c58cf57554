use thiserror::Error;

/// Errors raised while assembling a pipeline. The host should disable the
/// feature when it sees one of these; no per-frame work is attempted.
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("no frame source configured")]
    MissingFrameSource,

    #[error("no image converter configured")]
    MissingConverter,

    #[error("no compute backend configured")]
    MissingBackend,

    #[error("no model configured")]
    MissingModel,

    #[error("model error: {0}")]
    Model(String),

    #[error("camera error: {0}")]
    Camera(String),

    #[error("backend error: {0}")]
    Backend(#[from] BackendError),
}

/// Errors reported by a compute backend.
#[derive(Error, Debug)]
pub enum BackendError {
    #[error("failed to load model: {0}")]
    Load(String),

    #[error("unknown model handle {0}")]
    UnknownModel(u64),

    #[error("unknown session handle {0}")]
    UnknownSession(u64),

    #[error("inference failed: {0}")]
    Execution(String),

    #[error("tensor error: {0}")]
    Tensor(#[from] candle_core::Error),
}

/// Errors reported by a compute device when a dispatch is rejected.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DispatchError {
    #[error("kernel {kernel} expects {expected} bindings, got {actual}")]
    BindingCount {
        kernel: &'static str,
        expected: usize,
        actual: usize,
    },

    #[error("binding {slot} holds {actual} elements, kernel needs {expected}")]
    BindingSize {
        slot: usize,
        expected: usize,
        actual: usize,
    },

    #[error("write of {len} bytes exceeds resource capacity {capacity}")]
    Overflow { len: usize, capacity: usize },

    #[error("device error: {0}")]
    Device(String),
}

/// Errors surfaced by a GPU-to-CPU readback.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ReadbackError {
    #[error("readback failed: {0}")]
    Failed(String),

    #[error("unknown readback ticket {0}")]
    UnknownTicket(u64),
}

/// Per-frame failures. These never escape the frame boundary: the pipeline
/// logs them, drops the frame and keeps the previous mask.
#[derive(Error, Debug)]
pub enum FrameError {
    #[error("backend returned no output")]
    NoOutput,

    #[error("frame conversion failed: {0}")]
    ConversionFailed(String),

    #[error("frame cancelled")]
    Cancelled,

    #[error("unexpected tensor shape: {0}")]
    Shape(String),

    #[error("tensor error: {0}")]
    Tensor(#[from] candle_core::Error),

    #[error("dispatch error: {0}")]
    Dispatch(#[from] DispatchError),

    #[error("backend error: {0}")]
    Backend(#[from] BackendError),
}
