use crate::config::PipelineConfig;
use serde::{Deserialize, Serialize};
use std::fmt;
use sysinfo::{CpuRefreshKind, MemoryRefreshKind, RefreshKind, System};
use tracing::debug;

/// Accuracy/latency trade-off presets.
#[derive(
    Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum,
)]
#[serde(rename_all = "kebab-case")]
pub enum QualityMode {
    /// Full 512 input, no smoothing, resolution never lowered.
    MaxAccuracy,
    /// Keeps the configured input size, two median passes.
    #[default]
    Balanced,
    /// 256 input, one median pass.
    Performance,
}

impl QualityMode {
    /// Network input size the preset forces, if any.
    pub fn input_size(self) -> Option<u32> {
        match self {
            QualityMode::MaxAccuracy => Some(512),
            QualityMode::Balanced => None,
            QualityMode::Performance => Some(256),
        }
    }

    pub fn smoothing_iterations(self) -> u32 {
        match self {
            QualityMode::MaxAccuracy => 0,
            QualityMode::Balanced => 2,
            QualityMode::Performance => 1,
        }
    }

    /// Whether the input size may be lowered to fit the device and camera.
    pub fn adaptive_resolution(self) -> bool {
        !matches!(self, QualityMode::MaxAccuracy)
    }

    /// Writes the preset into `cfg`.
    pub fn apply(self, cfg: &mut PipelineConfig) {
        cfg.quality = self;
        if let Some(size) = self.input_size() {
            cfg.input_size = size;
        }
        cfg.smoothing_iterations = self.smoothing_iterations();
    }
}

impl fmt::Display for QualityMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            QualityMode::MaxAccuracy => "max-accuracy",
            QualityMode::Balanced => "balanced",
            QualityMode::Performance => "performance",
        })
    }
}

/// Host capacity used to cap the input size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceProfile {
    pub cores: usize,
    pub memory_mb: u64,
}

impl DeviceProfile {
    pub fn detect() -> Self {
        let sys = System::new_with_specifics(
            RefreshKind::nothing()
                .with_cpu(CpuRefreshKind::nothing())
                .with_memory(MemoryRefreshKind::nothing().with_ram()),
        );
        let profile = Self {
            cores: sys.cpus().len(),
            memory_mb: sys.total_memory() / (1024 * 1024),
        };
        debug!(?profile, "device profile");
        profile
    }

    /// Largest input size this device is expected to sustain.
    pub fn max_input_size(&self) -> u32 {
        match (self.cores, self.memory_mb) {
            (c, m) if c >= 6 && m >= 4000 => 512,
            (c, m) if c >= 4 && m >= 3000 => 384,
            _ => 256,
        }
    }
}

/// The input size to run with: the configured one, capped by the device when
/// the quality mode allows adapting.
pub fn effective_input_size(cfg: &PipelineConfig, profile: &DeviceProfile) -> u32 {
    if cfg.quality.adaptive_resolution() {
        cfg.input_size.min(profile.max_input_size())
    } else {
        cfg.input_size
    }
}
