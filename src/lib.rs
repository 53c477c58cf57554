pub mod camera;
pub mod classes;
pub mod cli;
pub mod config;
pub mod convert;
pub mod device;
pub mod error;
pub mod frame;
pub mod hover;
pub mod inference;
pub mod mask;
pub mod paint;
pub mod pipeline;
pub mod pool;
pub mod postprocess;
pub mod quality;
pub mod runner;
#[cfg(feature = "gpu")]
pub mod wgpu_device;

pub use cli::{execute, run_cli, Cli, Commands, ConfigSubcommand};
pub use config::{current_frame_skip, load_config, save_config, PipelineConfig};
pub use device::{CpuDevice, GpuContext};
pub use error::{FrameError, PipelineError};
pub use pipeline::{CancellationToken, PipelineBuilder, SegmentationPipeline, Stage};
pub use quality::QualityMode;
