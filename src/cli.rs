use crate::config::{config_path, load_config, save_config};
use crate::paint::PaintColor;
use crate::quality::QualityMode;
use crate::runner::{run, RunOptions};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "surface-segmenter",
    version,
    about = "Real-time surface segmentation for AR painting"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the segmentation pipeline
    Run {
        /// Replay images from a directory instead of the camera
        #[arg(short, long)]
        dir: Option<PathBuf>,
        /// ONNX segmentation model
        #[arg(short, long)]
        model: Option<PathBuf>,
        /// Stop after this many ticks
        #[arg(short, long)]
        ticks: Option<u64>,
        /// Frames to skip between acquisitions
        #[arg(short, long)]
        skip: Option<u32>,
        /// Use the GPU for inference and post-processing
        #[arg(long)]
        gpu: bool,
    },
    /// Show or edit the persisted configuration
    Config {
        #[command(subcommand)]
        action: ConfigSubcommand,
    },
}

#[derive(Subcommand)]
pub enum ConfigSubcommand {
    /// Print the configuration
    Show,
    /// Set the frame skip interval
    Skip { skip: u32 },
    /// Set the paint color (#RRGGBB)
    Color { color: PaintColor },
    /// Set the square network input size
    Size {
        #[arg(value_parser = clap::value_parser!(u32).range(1..))]
        size: u32,
    },
    /// Apply a quality preset (input size and mask smoothing)
    Quality {
        #[arg(value_enum)]
        mode: QualityMode,
    },
}

pub fn run_cli() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();
    let cli = Cli::parse();
    execute(cli);
}

pub fn execute(cli: Cli) {
    match cli.command {
        Commands::Run {
            dir,
            model,
            ticks,
            skip,
            gpu,
        } => {
            let opts = RunOptions {
                dir,
                model,
                ticks,
                skip,
                gpu,
            };
            match run(opts) {
                Ok(stats) => info!(?stats, "done"),
                Err(e) => error!("failed to start pipeline: {e}"),
            }
        }
        Commands::Config { action } => match action {
            ConfigSubcommand::Show => show_config(),
            ConfigSubcommand::Skip { skip } => set_frame_skip(skip),
            ConfigSubcommand::Color { color } => set_paint_color(color),
            ConfigSubcommand::Size { size } => set_input_size(size),
            ConfigSubcommand::Quality { mode } => set_quality(mode),
        },
    }
}

fn show_config() {
    match serde_json::to_string_pretty(&load_config()) {
        Ok(text) => println!("{text}"),
        Err(e) => error!("failed to encode config: {e}"),
    }
}

fn set_frame_skip(skip: u32) {
    let mut cfg = load_config();
    cfg.frame_skip = skip;
    save_config(&cfg);
    info!(path = %config_path().display(), "frame skip set to {skip}");
}

fn set_paint_color(color: PaintColor) {
    let mut cfg = load_config();
    cfg.paint_color = color;
    save_config(&cfg);
    info!("paint color set to {color}");
}

fn set_input_size(size: u32) {
    let mut cfg = load_config();
    cfg.input_size = size;
    save_config(&cfg);
    info!("input size set to {size}");
}

fn set_quality(mode: QualityMode) {
    let mut cfg = load_config();
    mode.apply(&mut cfg);
    save_config(&cfg);
    info!(
        input = cfg.input_size,
        smoothing = cfg.smoothing_iterations,
        "quality set to {mode}"
    );
}
