use crate::convert::Mirror;
use crate::inference::Normalization;
use crate::paint::PaintColor;
use crate::quality::QualityMode;
use serde::{Deserialize, Serialize};
use std::{env, fs, path::PathBuf};
use tracing::{debug, error};

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct PipelineConfig {
    pub frame_skip: u32,
    pub input_size: u32,
    pub quality: QualityMode,
    pub smoothing_iterations: u32,
    pub mirror: Mirror,
    pub normalization: Normalization,
    pub paint_color: PaintColor,
    pub tick_hz: f32,
    pub model: PathBuf,
    pub model_repo: String,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            frame_skip: 1,
            input_size: 512,
            quality: QualityMode::Balanced,
            smoothing_iterations: QualityMode::Balanced.smoothing_iterations(),
            mirror: Mirror::None,
            normalization: Normalization::default(),
            paint_color: PaintColor::GRAY,
            tick_hz: 30.0,
            model: PathBuf::from("segformer-b0-ade-512.onnx"),
            model_repo: String::new(),
        }
    }
}

pub fn config_path() -> PathBuf {
    env::var_os("SURFACE_STATE_PATH")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("state.json"))
}

pub fn load_config() -> PipelineConfig {
    let path = config_path();
    if let Ok(data) = fs::read(&path) {
        match serde_json::from_slice(&data) {
            Ok(cfg) => return cfg,
            Err(e) => debug!(path = %path.display(), "ignoring unreadable config: {e}"),
        }
    }
    PipelineConfig::default()
}

pub fn save_config(cfg: &PipelineConfig) {
    let path = config_path();
    if let Some(parent) = path.parent() {
        let _ = fs::create_dir_all(parent);
    }
    match serde_json::to_vec_pretty(cfg) {
        Ok(data) => {
            if let Err(e) = fs::write(&path, data) {
                error!("failed to write config: {e}");
            }
        }
        Err(e) => error!("failed to encode config: {e}"),
    }
}

/// Returns the persisted frame skip interval.
pub fn current_frame_skip() -> u32 {
    load_config().frame_skip
}
