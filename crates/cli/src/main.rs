use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::process;
use std::sync::Arc;
use std::time::{Duration, Instant};

use clap::{Parser, Subcommand};
use crossbeam_channel::RecvTimeoutError;

use landmark_stream_core::capture::domain::frame_source::FrameSource;
use landmark_stream_core::capture::infrastructure::ffmpeg_camera_source::FfmpegCameraProvider;
use landmark_stream_core::capture::infrastructure::image_file_source::ImageFileSource;
use landmark_stream_core::detection::domain::engine_factory::EngineFactory;
use landmark_stream_core::detection::infrastructure::onnx_engine_factory::OnnxEngineFactory;
use landmark_stream_core::pipeline::dispatch::detect_once;
use landmark_stream_core::pipeline::lifecycle_controller::{LifecycleController, PipelineState};
use landmark_stream_core::pipeline::presentation::{ChannelPresentationSink, LandmarkUpdate};
use landmark_stream_core::shared::config::{LandmarkerConfig, RunningMode};
use landmark_stream_core::shared::frame::Rotation;

const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Live face landmark coordinates from a camera.
#[derive(Parser)]
#[command(name = "landmark-stream")]
struct Cli {
    /// JSON config file; flags below override its values.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Minimum face detection score (0.0-1.0).
    #[arg(long, global = true)]
    min_detection_confidence: Option<f32>,

    /// Minimum face presence score (0.0-1.0).
    #[arg(long, global = true)]
    min_presence_confidence: Option<f32>,

    /// Minimum score to keep tracking a face without re-detecting (0.0-1.0).
    #[arg(long, global = true)]
    min_tracking_confidence: Option<f32>,

    /// Directory holding the model files.
    #[arg(long, global = true)]
    models_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Stream coordinates as JSON lines until the duration elapses or the
    /// source ends.
    Stream {
        /// Camera device (/dev/videoN or an index) or a video file to replay.
        #[arg(long)]
        device: Option<String>,

        #[arg(long)]
        width: Option<u32>,

        #[arg(long)]
        height: Option<u32>,

        #[arg(long)]
        fps: Option<u32>,

        /// Clockwise rotation to make frames upright (0, 90, 180, 270).
        #[arg(long)]
        rotation: Option<u32>,

        /// Inference mode: streaming or single-shot.
        #[arg(long, value_parser = parse_mode)]
        mode: Option<RunningMode>,

        /// Stop after this many seconds.
        #[arg(long)]
        duration: Option<f64>,

        /// Print the pipeline counters as JSON to stderr at exit.
        #[arg(long)]
        stats: bool,
    },
    /// Analyze one image file and print its coordinates as JSON.
    Detect {
        image: PathBuf,

        /// Clockwise rotation to make the image upright (0, 90, 180, 270).
        #[arg(long, default_value = "0")]
        rotation: u32,
    },
}

fn main() {
    env_logger::init();

    if let Err(e) = run() {
        eprintln!("Error: {e}");
        process::exit(1);
    }
}

fn run() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let mut config = load_config(&cli)?;

    match cli.command {
        Command::Stream {
            device,
            width,
            height,
            fps,
            rotation,
            mode,
            duration,
            stats,
        } => {
            if let Some(device) = device {
                config.camera.device = device;
            }
            if let Some(width) = width {
                config.camera.width = width;
            }
            if let Some(height) = height {
                config.camera.height = height;
            }
            if let Some(fps) = fps {
                config.camera.fps = fps;
            }
            if let Some(rotation) = rotation {
                config.camera.rotation = rotation;
            }
            if let Some(mode) = mode {
                config.mode = mode;
            }
            validate(duration)?;
            config.validate()?;
            run_stream(config, duration, stats)
        }
        Command::Detect { image, rotation } => {
            config.mode = RunningMode::SingleShot;
            config.validate()?;
            let rotation = Rotation::from_degrees(rotation)
                .ok_or_else(|| format!("Rotation must be a multiple of 90, got {rotation}"))?;
            run_detect(&config, &image, rotation)
        }
    }
}

fn load_config(cli: &Cli) -> Result<LandmarkerConfig, Box<dyn std::error::Error>> {
    let mut config = match &cli.config {
        Some(path) => {
            log::info!("Loading config from {}", path.display());
            LandmarkerConfig::load(path)?
        }
        None => LandmarkerConfig::default(),
    };
    if let Some(v) = cli.min_detection_confidence {
        config.min_detection_confidence = v;
    }
    if let Some(v) = cli.min_presence_confidence {
        config.min_presence_confidence = v;
    }
    if let Some(v) = cli.min_tracking_confidence {
        config.min_tracking_confidence = v;
    }
    if let Some(dir) = &cli.models_dir {
        config.models.bundled_dir = Some(dir.clone());
    }
    Ok(config)
}

fn run_stream(
    config: LandmarkerConfig,
    duration: Option<f64>,
    print_stats: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let (sink, updates) = ChannelPresentationSink::channel(config.presentation_capacity);
    let provider = FfmpegCameraProvider::new(config.camera.clone());
    let controller = LifecycleController::new(
        config,
        Arc::new(OnnxEngineFactory::new()),
        Arc::new(provider),
        Arc::new(sink),
    );

    controller.start()?;
    let deadline = duration.map(|secs| Instant::now() + Duration::from_secs_f64(secs));

    let stdout = io::stdout();
    let mut out = stdout.lock();
    loop {
        if deadline.is_some_and(|d| Instant::now() >= d) {
            break;
        }
        match updates.recv_timeout(POLL_INTERVAL) {
            Ok(update) => write_update(&mut out, &update)?,
            Err(RecvTimeoutError::Timeout) => {
                if controller.state() == PipelineState::Stopped {
                    break;
                }
            }
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }

    controller.stop();
    // published before stop() returned
    for update in updates.try_iter() {
        write_update(&mut out, &update)?;
    }
    out.flush()?;

    if print_stats {
        eprintln!(
            "{}",
            serde_json::to_string_pretty(&controller.stats().snapshot())?
        );
    }
    Ok(())
}

fn run_detect(
    config: &LandmarkerConfig,
    image: &Path,
    rotation: Rotation,
) -> Result<(), Box<dyn std::error::Error>> {
    let mut source = ImageFileSource::open(image, rotation)?;
    let frame = source.next_frame().ok_or("Image produced no frame")??;

    let mut engine = OnnxEngineFactory::new().create(config)?;
    let timestamp = frame.timestamp();
    let update = match detect_once(engine.as_mut(), frame)? {
        Some(result) => LandmarkUpdate::Detected(result),
        None => LandmarkUpdate::NoFace { timestamp },
    };
    source.close()?;

    println!("{}", serde_json::to_string_pretty(&update)?);
    Ok(())
}

fn write_update(out: &mut impl Write, update: &LandmarkUpdate) -> io::Result<()> {
    serde_json::to_writer(&mut *out, update)?;
    writeln!(out)
}

fn validate(duration: Option<f64>) -> Result<(), Box<dyn std::error::Error>> {
    if let Some(secs) = duration {
        if !(secs.is_finite() && secs > 0.0) {
            return Err(format!("Duration must be a positive number of seconds, got {secs}").into());
        }
    }
    Ok(())
}

fn parse_mode(value: &str) -> Result<RunningMode, String> {
    match value {
        "streaming" => Ok(RunningMode::Streaming),
        "single-shot" => Ok(RunningMode::SingleShot),
        other => Err(format!(
            "Mode must be 'streaming' or 'single-shot', got '{other}'"
        )),
    }
}
