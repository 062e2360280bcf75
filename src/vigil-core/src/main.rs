//! Vigil - multi-camera person detection and recording CLI

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use vigil_core::colored_logger::init_logger;
use vigil_core::config::Config;
use vigil_core::orchestrator::Orchestrator;
use vigil_core::sinks::{JsonlEventSink, LogStatusSink};
use vigil_detect::{Detector, HttpDetector, NullDetector};
use vigil_processing::{available_encoders, check_ffmpeg, ClipExtraction, ContinuousRecorder, Unavailable};

#[derive(Parser)]
#[command(name = "vigil")]
#[command(about = "Multi-camera person detection with continuous recording")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file path
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run detection and recording for every configured camera
    Run,

    /// Check dependencies (FFmpeg, encoders)
    Check,

    /// List recorded segments of a camera
    Segments {
        #[arg(long)]
        camera: String,
    },

    /// Cut a clip from the recording buffer
    Extract {
        #[arg(long)]
        camera: String,

        /// Window start (RFC 3339)
        #[arg(long, value_parser = parse_time)]
        start: DateTime<Utc>,

        /// Window end (RFC 3339)
        #[arg(long, value_parser = parse_time)]
        end: DateTime<Utc>,

        #[arg(short, long)]
        output: PathBuf,

        /// Playback speed multiplier
        #[arg(long, default_value = "1.0")]
        speed: f32,
    },
}

fn parse_time(value: &str) -> Result<DateTime<Utc>, String> {
    DateTime::parse_from_rfc3339(value)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| format!("invalid RFC 3339 time {:?}: {}", value, e))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logger(cli.verbose)?;

    let config = load_config(cli.config)?;

    match cli.command {
        Commands::Run => cmd_run(config).await,
        Commands::Check => cmd_check(config).await,
        Commands::Segments { camera } => cmd_segments(config, &camera),
        Commands::Extract { camera, start, end, output, speed } => {
            cmd_extract(config, &camera, start, end, output, speed).await
        }
    }
}

/// Explicit path, else `<config dir>/Vigil/vigil.toml` if present, else defaults
fn load_config(path: Option<PathBuf>) -> Result<Config> {
    if let Some(path) = path {
        return Config::from_file(&path);
    }

    let default_path = dirs::config_dir().map(|d| d.join("Vigil").join("vigil.toml"));
    match default_path {
        Some(path) if path.exists() => {
            info!("using config {}", path.display());
            Config::from_file(&path)
        }
        _ => {
            warn!("no config file found, using defaults");
            Ok(Config::default())
        }
    }
}

async fn cmd_run(config: Config) -> Result<()> {
    if !check_ffmpeg(&config.general.ffmpeg).await {
        anyhow::bail!("ffmpeg not found at {:?} - please install FFmpeg", config.general.ffmpeg);
    }

    let detector: Arc<dyn Detector> = match &config.inference.endpoint {
        Some(endpoint) => {
            let timeout = Duration::from_secs(config.inference.timeout_secs);
            let detector = HttpDetector::new(endpoint.clone(), timeout)
                .context("failed to create inference client")?;
            info!("inference endpoint: {}", endpoint);
            Arc::new(detector)
        }
        None => {
            warn!("no inference endpoint configured, running recorder-only");
            Arc::new(NullDetector)
        }
    };

    let events = JsonlEventSink::new(config.event_log())?;
    info!("event log: {}", events.path().display());

    let orchestrator = Orchestrator::new(config, detector, Arc::new(events), Arc::new(LogStatusSink));
    orchestrator.run().await
}

async fn cmd_check(config: Config) -> Result<()> {
    println!("checking dependencies...\n");

    let ffmpeg = &config.general.ffmpeg;
    let ffmpeg_ok = check_ffmpeg(ffmpeg).await;
    println!("  ffmpeg: {}", if ffmpeg_ok { "OK" } else { "NOT FOUND" });

    if ffmpeg_ok {
        match available_encoders(ffmpeg).await {
            Ok(encoders) => {
                let names: Vec<&str> = encoders.iter().map(|e| e.as_str()).collect();
                println!("  clip encoders: {}", names.join(", "));
            }
            Err(e) => println!("  clip encoders: unknown ({})", e),
        }
    }

    match &config.inference.endpoint {
        Some(endpoint) => println!("  inference: {}", endpoint),
        None => println!("  inference: not configured (recorder-only)"),
    }
    println!("  cameras: {} configured", config.cameras.len());

    println!();

    if !ffmpeg_ok {
        println!("WARNING: FFmpeg is required for capture and recording.");
        println!("Please install FFmpeg and ensure it's in your PATH.");
    } else {
        println!("all checks passed!");
    }

    Ok(())
}

fn cmd_segments(config: Config, camera: &str) -> Result<()> {
    let recorder = ContinuousRecorder::new(config.recorder_config());
    let segments = recorder
        .segments(camera)
        .with_context(|| format!("failed to list segments for {}", camera))?;

    if segments.is_empty() {
        println!("no segments for {} in {}", camera, recorder.camera_dir(camera).display());
        return Ok(());
    }

    let mut total = 0u64;
    for segment in &segments {
        let size = std::fs::metadata(&segment.path).map(|m| m.len()).unwrap_or(0);
        total += size;
        println!(
            "{}  {}  {:>8.1} MB",
            segment.start.format("%Y-%m-%d %H:%M:%S"),
            segment.path.display(),
            size as f64 / 1_048_576.0
        );
    }
    println!("\n{} segment(s), {:.1} MB", segments.len(), total as f64 / 1_048_576.0);
    Ok(())
}

async fn cmd_extract(
    config: Config,
    camera: &str,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    output: PathBuf,
    speed: f32,
) -> Result<()> {
    let recorder = ContinuousRecorder::new(config.recorder_config());

    match recorder.extract_clip(camera, start, end, &output, speed).await? {
        ClipExtraction::Extracted { path, segments } => {
            println!("wrote {} from {} segment(s)", path.display(), segments);
        }
        ClipExtraction::Unavailable(Unavailable::NoSegments) => {
            println!("unavailable: no recording covers that window");
        }
        ClipExtraction::Unavailable(Unavailable::SegmentOpen { ready_at }) => {
            println!("unavailable: recording still being written, retry after {}", ready_at.to_rfc3339());
        }
    }
    Ok(())
}
