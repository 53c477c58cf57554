use clap::Parser;
use proptest::prelude::*;
use serial_test::serial;
use surface_segmenter::config::config_path;
use surface_segmenter::paint::PaintColor;
use surface_segmenter::quality::QualityMode;
use surface_segmenter::{
    current_frame_skip, execute, load_config, save_config, Cli, Commands, ConfigSubcommand,
    PipelineConfig,
};
use tempfile::tempdir;

proptest! {
    #[test]
    fn parse_skip(value in 0u32..1000) {
        let args = ["surface-segmenter", "config", "skip", &value.to_string()];
        let cli = Cli::parse_from(args);
        match cli.command {
            Commands::Config { action: ConfigSubcommand::Skip { skip } } => prop_assert_eq!(skip, value),
            _ => prop_assert!(false, "unexpected subcommand"),
        }
    }

    #[test]
    fn parse_run_dir(path in "[a-zA-Z0-9][a-zA-Z0-9/_\\.-]*") {
        let args = ["surface-segmenter", "run", "--dir", &path];
        let cli = Cli::parse_from(args);
        match cli.command {
            Commands::Run { dir, model, ticks, skip, gpu } => {
                prop_assert_eq!(dir, Some(std::path::PathBuf::from(path)));
                prop_assert!(model.is_none());
                prop_assert!(ticks.is_none());
                prop_assert!(skip.is_none());
                prop_assert!(!gpu);
            }
            _ => prop_assert!(false, "unexpected subcommand"),
        }
    }

    #[test]
    fn parse_color(r: u8, g: u8, b: u8) {
        let text = format!("#{r:02x}{g:02x}{b:02x}");
        let args = ["surface-segmenter", "config", "color", &text];
        let cli = Cli::parse_from(args);
        match cli.command {
            Commands::Config { action: ConfigSubcommand::Color { color } } => {
                prop_assert_eq!(color, PaintColor::rgb(r, g, b));
            }
            _ => prop_assert!(false, "unexpected subcommand"),
        }
    }

    #[test]
    #[serial]
    fn execute_sets_skip(value in 0u32..30) {
        let dir = tempdir().unwrap();
        std::env::set_var("SURFACE_STATE_PATH", dir.path().join("state.json"));

        let cli = Cli {
            command: Commands::Config {
                action: ConfigSubcommand::Skip { skip: value },
            },
        };
        execute(cli);

        prop_assert_eq!(current_frame_skip(), value);
        let cfg = load_config();
        prop_assert_eq!(cfg.input_size, PipelineConfig::default().input_size);
    }
}

#[test]
fn parse_run_flags() {
    let args = [
        "surface-segmenter",
        "run",
        "-m",
        "seg.onnx",
        "-t",
        "90",
        "-s",
        "2",
        "--gpu",
    ];
    match Cli::parse_from(args).command {
        Commands::Run {
            dir,
            model,
            ticks,
            skip,
            gpu,
        } => {
            assert!(dir.is_none());
            assert_eq!(model, Some("seg.onnx".into()));
            assert_eq!(ticks, Some(90));
            assert_eq!(skip, Some(2));
            assert!(gpu);
        }
        _ => panic!("unexpected subcommand"),
    }
}

#[test]
fn rejects_bad_values() {
    assert!(Cli::try_parse_from(["surface-segmenter", "config", "size", "0"]).is_err());
    assert!(Cli::try_parse_from(["surface-segmenter", "config", "color", "#12345"]).is_err());
    assert!(Cli::try_parse_from(["surface-segmenter", "config", "color", "#GG0000"]).is_err());
    assert!(Cli::try_parse_from(["surface-segmenter", "config", "skip", "-1"]).is_err());
}

#[test]
#[serial]
fn execute_sets_color_and_size() {
    let dir = tempdir().unwrap();
    std::env::set_var("SURFACE_STATE_PATH", dir.path().join("nested/state.json"));

    execute(Cli::parse_from([
        "surface-segmenter",
        "config",
        "color",
        "#FF8000",
    ]));
    execute(Cli::parse_from(["surface-segmenter", "config", "size", "256"]));

    let cfg = load_config();
    assert_eq!(cfg.paint_color, PaintColor::rgb(0xFF, 0x80, 0x00));
    assert_eq!(cfg.input_size, 256);
    assert_eq!(cfg.frame_skip, 1);
    assert!(config_path().exists());
}

#[test]
#[serial]
fn corrupt_config_falls_back_to_defaults() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("state.json");
    std::fs::write(&path, b"{ not json").unwrap();
    std::env::set_var("SURFACE_STATE_PATH", &path);
    assert_eq!(load_config(), PipelineConfig::default());
}

#[test]
#[serial]
fn partial_config_is_completed_with_defaults() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("state.json");
    std::fs::write(&path, br##"{"frame_skip": 4, "paint_color": "#102030"}"##).unwrap();
    std::env::set_var("SURFACE_STATE_PATH", &path);

    let cfg = load_config();
    assert_eq!(cfg.frame_skip, 4);
    assert_eq!(cfg.paint_color, PaintColor::rgb(0x10, 0x20, 0x30));
    assert_eq!(cfg.tick_hz, PipelineConfig::default().tick_hz);
    assert_eq!(cfg.model, PipelineConfig::default().model);
}

#[test]
#[serial]
fn saved_config_round_trips() {
    let dir = tempdir().unwrap();
    std::env::set_var("SURFACE_STATE_PATH", dir.path().join("state.json"));
    let cfg = PipelineConfig {
        frame_skip: 3,
        model_repo: "org/segformer".into(),
        ..PipelineConfig::default()
    };
    save_config(&cfg);
    assert_eq!(load_config(), cfg);

    let text = std::fs::read_to_string(config_path()).unwrap();
    assert!(text.contains("\"#808080\""));
}

#[test]
fn parse_quality() {
    let cli = Cli::parse_from(["surface-segmenter", "config", "quality", "max-accuracy"]);
    match cli.command {
        Commands::Config {
            action: ConfigSubcommand::Quality { mode },
        } => assert_eq!(mode, QualityMode::MaxAccuracy),
        _ => panic!("unexpected subcommand"),
    }
    assert!(Cli::try_parse_from(["surface-segmenter", "config", "quality", "ultra"]).is_err());
}

#[test]
#[serial]
fn execute_sets_quality() {
    let dir = tempdir().unwrap();
    std::env::set_var("SURFACE_STATE_PATH", dir.path().join("state.json"));

    execute(Cli::parse_from(["surface-segmenter", "config", "quality", "performance"]));
    let cfg = load_config();
    assert_eq!(cfg.quality, QualityMode::Performance);
    assert_eq!(cfg.input_size, 256);
    assert_eq!(cfg.smoothing_iterations, 1);

    execute(Cli::parse_from(["surface-segmenter", "config", "quality", "balanced"]));
    let cfg = load_config();
    assert_eq!(cfg.quality, QualityMode::Balanced);
    assert_eq!(cfg.input_size, 256);
    assert_eq!(cfg.smoothing_iterations, 2);

    let text = std::fs::read_to_string(config_path()).unwrap();
    assert!(text.contains("\"balanced\""));
}
