//! Focus Sensor Agent CLI
//!
//! Camera-posture attention sensor for editor integrations.

use anyhow::Context;
use clap::{Parser, Subcommand};
use focus_sensor_agent::{
    agent::{run_background, Agent},
    capture::{JsonLinesSource, NoopSource, SampleSource, StaticCameras},
    config::Config,
    core::{JsonProfileStore, ProfileStore},
    pipeline::run_capture_loop,
    server, TransparencyLog, PRIVACY_DECLARATION, VERSION,
};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser)]
#[command(name = "focus-sensor")]
#[command(version = VERSION)]
#[command(about = "Camera-posture attention sensor (FOCUS/REVIEW)", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the sensor and the WebSocket server
    Start {
        /// WebSocket port (defaults to the configured one)
        #[arg(long)]
        port: Option<u16>,

        /// Camera index to open at startup
        #[arg(long)]
        camera: Option<u32>,

        /// Target frame rate, clamped to the configured bounds
        #[arg(long)]
        fps: Option<f64>,

        /// Feature stream: `stdin`, a JSON-lines file path, or `none`
        #[arg(long, default_value = "stdin")]
        source: String,

        /// Detector command to run; its stdout replaces `--source` and its
        /// stdin receives QoS settings
        #[arg(long)]
        detector: Option<String>,
    },

    /// Show configuration paths, calibration and cumulative statistics
    Status,

    /// Display privacy declaration
    Privacy,

    /// Show configuration
    Config,

    /// Inspect or reset the stored calibration profile
    Calibration {
        /// Delete the stored profile so defaults apply on next start
        #[arg(long)]
        reset: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Start {
            port,
            camera,
            fps,
            source,
            detector,
        } => {
            let source = match detector {
                Some(command) => SourceArg::Detector(command),
                None => SourceArg::parse(&source),
            };
            cmd_start(port, camera, fps, source).await
        }
        Commands::Status => {
            cmd_status();
            Ok(())
        }
        Commands::Privacy => {
            cmd_privacy();
            Ok(())
        }
        Commands::Config => {
            cmd_config();
            Ok(())
        }
        Commands::Calibration { reset } => cmd_calibration(reset),
    }
}

/// Where feature samples come from.
enum SourceArg {
    Stdin,
    File(PathBuf),
    Detector(String),
    None,
}

impl SourceArg {
    fn parse(value: &str) -> Self {
        match value {
            "stdin" | "-" => SourceArg::Stdin,
            "none" => SourceArg::None,
            path => SourceArg::File(PathBuf::from(path)),
        }
    }
}

async fn cmd_start(
    port: Option<u16>,
    camera: Option<u32>,
    fps: Option<f64>,
    source: SourceArg,
) -> anyhow::Result<()> {
    println!("Focus Sensor Agent v{VERSION}");
    println!();

    let mut config = match Config::load() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Warning: Could not load config, using defaults: {e}");
            Config::default()
        }
    };
    if let Some(port) = port {
        config.port = port;
    }
    if let Some(camera) = camera {
        config.camera = camera;
    }
    if let Some(fps) = fps.filter(|f| f.is_finite()) {
        config.qos.target_fps = fps.clamp(config.qos.fps_min, config.qos.fps_max);
    }
    if let Err(e) = config.ensure_directories() {
        eprintln!("Warning: Could not create directories: {e}");
    }

    let store = JsonProfileStore::new(Config::calibration_path());
    let cameras = StaticCameras::new(config.cameras.clone());
    let transparency = Arc::new(TransparencyLog::with_persistence(config.stats_path()));
    let port = config.port;
    let camera = config.camera;
    let target_fps = config.qos.target_fps;

    let agent = Arc::new(Agent::new(
        config,
        Box::new(store),
        Box::new(cameras),
        transparency.clone(),
    ));

    let source: Box<dyn SampleSource> = match source {
        SourceArg::Stdin => Box::new(JsonLinesSource::stdin(camera, agent.clock())),
        SourceArg::File(path) => Box::new(
            JsonLinesSource::from_path(&path, camera, agent.clock())
                .with_context(|| format!("opening sample stream {}", path.display()))?,
        ),
        SourceArg::Detector(command) => Box::new(
            JsonLinesSource::spawn_detector(&command, camera, agent.clock())
                .with_context(|| format!("starting detector `{command}`"))?,
        ),
        SourceArg::None => Box::new(NoopSource::new(camera)),
    };

    let profile = agent.profile();
    println!("Starting sensor...");
    println!("  Camera: {camera}");
    println!("  Target FPS: {target_fps}");
    println!(
        "  Thresholds: {:.3} / {:.3} ({})",
        profile.threshold_low,
        profile.threshold_high,
        if profile.is_calibrated() {
            "calibrated"
        } else {
            "defaults"
        }
    );

    let capture_agent = agent.clone();
    let capture = std::thread::Builder::new()
        .name("capture".to_string())
        .spawn(move || run_capture_loop(capture_agent, source))
        .context("spawning capture thread")?;
    let background = tokio::spawn(run_background(agent.clone()));

    let (addr, server_handle) = server::run(agent.clone(), port).await?;
    println!("  Listening on ws://{addr}");
    println!();
    println!("Press Ctrl+C to stop");
    println!();

    let handler_agent = agent.clone();
    if let Err(e) = ctrlc::set_handler(move || handler_agent.request_shutdown()) {
        tracing::warn!("Could not install Ctrl+C handler: {}", e);
    }

    let mut shutdown = agent.shutdown_signal();
    let _ = shutdown.wait_for(|stop| *stop).await;

    println!();
    println!("Stopping sensor...");
    if let Err(e) = server_handle.await {
        tracing::error!("Server task failed: {}", e);
    }
    if let Err(e) = background.await {
        tracing::error!("Background task failed: {}", e);
    }
    match tokio::task::spawn_blocking(move || capture.join()).await {
        Ok(Ok(())) => {}
        _ => tracing::error!("Capture thread did not exit cleanly"),
    }

    if let Err(e) = transparency.save() {
        eprintln!("Warning: Could not save transparency log: {e}");
    }

    println!();
    println!("{}", transparency.summary());
    Ok(())
}

fn cmd_status() {
    let config = Config::load().unwrap_or_default();

    println!("Focus Sensor Agent Status");
    println!("=========================");
    println!();

    println!("Configuration:");
    println!("  Port: {}", config.port);
    println!("  Camera: {}", config.camera);
    println!("  Target FPS: {}", config.qos.target_fps);
    println!();

    print_calibration(&JsonProfileStore::new(Config::calibration_path()));
    println!();

    // Load and show transparency stats if available
    let stats_path = config.stats_path();
    if stats_path.exists() {
        if let Ok(content) = std::fs::read_to_string(&stats_path) {
            if let Ok(stats) = serde_json::from_str::<serde_json::Value>(&content) {
                println!("Cumulative Statistics:");
                if let Some(frames) = stats.get("frames_processed") {
                    println!("  Frames processed: {frames}");
                }
                if let Some(failed) = stats.get("frames_failed") {
                    println!("  Failed acquisitions: {failed}");
                }
                if let Some(changes) = stats.get("state_changes") {
                    println!("  Mode changes: {changes}");
                }
                if let Some(saved) = stats.get("calibrations_saved") {
                    println!("  Calibrations saved: {saved}");
                }
            }
        }
    } else {
        println!("No previous session data found.");
    }
}

fn print_calibration(store: &JsonProfileStore) {
    println!("Calibration ({}):", store.path().display());
    match store.load() {
        Ok(Some(profile)) => {
            if let Some(created) = profile.created_at {
                println!("  Created: {}", created.format("%Y-%m-%d %H:%M:%S UTC"));
            }
            if let (Some(review), Some(focus)) = (&profile.review, &profile.focus) {
                println!(
                    "  REVIEW: mean {:.3}, std {:.3}, n {}",
                    review.mean, review.std, review.n
                );
                println!(
                    "  FOCUS:  mean {:.3}, std {:.3}, n {}",
                    focus.mean, focus.std, focus.n
                );
            }
            println!(
                "  Thresholds: {:.3} / {:.3}, dwell {} ms",
                profile.threshold_low, profile.threshold_high, profile.required_dwell_ms
            );
        }
        Ok(None) => println!("  Not calibrated, defaults apply."),
        Err(e) => println!("  Unreadable ({e}), defaults apply."),
    }
}

fn cmd_privacy() {
    println!("{PRIVACY_DECLARATION}");
}

fn cmd_config() {
    let config = Config::load().unwrap_or_default();

    println!("Configuration");
    println!("=============");
    println!();
    println!("Config file: {:?}", Config::config_path());
    println!();
    println!(
        "{}",
        serde_json::to_string_pretty(&config).unwrap_or_else(|_| "Error".to_string())
    );
}

fn cmd_calibration(reset: bool) -> anyhow::Result<()> {
    let store = JsonProfileStore::new(Config::calibration_path());
    if !reset {
        print_calibration(&store);
        return Ok(());
    }

    match std::fs::remove_file(store.path()) {
        Ok(()) => println!("Calibration profile removed."),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            println!("No calibration profile stored.")
        }
        Err(e) => {
            return Err(e).with_context(|| format!("removing {}", store.path().display()));
        }
    }
    Ok(())
}
