use anyhow::{anyhow, bail, Context};
use clap::{value_parser, Arg, ArgAction, ArgMatches, Command};
use std::path::PathBuf;
use std::time::Duration;
use watermark_recorder::capture::{CameraFacing, CaptureSource, SyntheticCamera};
use watermark_recorder::commands::recording;
use watermark_recorder::compositor::WatermarkMode;
use watermark_recorder::encoder::ffmpeg::tool_available;
use watermark_recorder::recorder::{MediaBackend, RecorderConfig};
use watermark_recorder::{RecorderState, SessionController};

fn cli() -> Command {
    let command = Command::new("watermark-recorder")
        .version(env!("CARGO_PKG_VERSION"))
        .author(env!("CARGO_PKG_AUTHORS"))
        .about(env!("CARGO_PKG_DESCRIPTION"))
        .arg(
            Arg::new("watermark")
                .long("watermark")
                .value_name("PNG")
                .help("Watermark image")
                .value_parser(value_parser!(PathBuf)),
        )
        .arg(
            Arg::new("mode")
                .long("mode")
                .value_name("MODE")
                .help("Watermark placement")
                .value_parser(["corner", "fullscreen"])
                .default_value("corner"),
        )
        .arg(
            Arg::new("output-dir")
                .long("output-dir")
                .value_name("DIR")
                .help("Directory for segments, recordings and snapshots")
                .value_parser(value_parser!(PathBuf)),
        )
        .arg(
            Arg::new("seconds")
                .long("seconds")
                .value_name("SECONDS")
                .help("Recorded time, pauses excluded")
                .value_parser(value_parser!(f64))
                .default_value("3"),
        )
        .arg(
            Arg::new("pause-at")
                .long("pause-at")
                .value_name("SECONDS")
                .help("Pause after this much recorded time")
                .value_parser(value_parser!(f64)),
        )
        .arg(
            Arg::new("resume-after")
                .long("resume-after")
                .value_name("SECONDS")
                .help("How long to stay paused")
                .value_parser(value_parser!(f64))
                .default_value("1"),
        )
        .arg(
            Arg::new("config")
                .long("config")
                .value_name("JSON")
                .help("Recorder configuration file")
                .value_parser(value_parser!(PathBuf)),
        )
        .arg(
            Arg::new("rotation")
                .long("rotation")
                .value_name("DEGREES")
                .help("Device rotation: 0, 90, 180 or 270")
                .value_parser(value_parser!(i32))
                .default_value("0"),
        )
        .arg(
            Arg::new("front")
                .long("front")
                .help("Treat the camera as front-facing")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("dry-run")
                .long("dry-run")
                .help("Write JSON manifests instead of encoding with ffmpeg")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("snapshot")
                .long("snapshot")
                .help("Save a watermarked PNG of the last frame before stopping")
                .action(ArgAction::SetTrue),
        );

    #[cfg(feature = "native-capture")]
    let command = command.arg(
        Arg::new("camera")
            .long("camera")
            .value_name("DEVICE")
            .help("Record from a camera (index or name) instead of the test pattern")
            .num_args(0..=1)
            .default_missing_value("0"),
    );

    command
}

fn capture_source(matches: &ArgMatches, fps: u32, facing: CameraFacing) -> Box<dyn CaptureSource> {
    #[cfg(feature = "native-capture")]
    if let Some(device) = matches.get_one::<String>("camera") {
        return Box::new(watermark_recorder::capture::native::NativeCameraSource::new(
            Some(device.clone()),
            facing,
        ));
    }
    #[cfg(not(feature = "native-capture"))]
    let _ = matches;

    Box::new(SyntheticCamera::new(1280, 720, fps, facing))
}

fn secs(matches: &ArgMatches, id: &str) -> anyhow::Result<Option<Duration>> {
    matches
        .get_one::<f64>(id)
        .map(|s| Duration::try_from_secs_f64(*s).with_context(|| format!("invalid --{}: {}", id, s)))
        .transpose()
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    watermark_recorder::init_tracing();
    let matches = cli().get_matches();

    let mut config = match matches.get_one::<PathBuf>("config") {
        Some(path) => RecorderConfig::load(path)
            .with_context(|| format!("failed to load config {}", path.display()))?,
        None => RecorderConfig::default(),
    };
    if let Some(dir) = matches.get_one::<PathBuf>("output-dir") {
        config.output_dir = dir.clone();
    }
    if matches.get_flag("dry-run") {
        config.backend = MediaBackend::Manifest;
    } else if config.backend == MediaBackend::Ffmpeg && !tool_available(&config.tools.ffmpeg) {
        bail!(
            "ffmpeg not found at {}; install it, set tools.ffmpeg in the config, or use --dry-run",
            config.tools.ffmpeg.display()
        );
    }

    let facing = if matches.get_flag("front") {
        CameraFacing::Front
    } else {
        CameraFacing::Back
    };
    let source = capture_source(&matches, config.encoder.fps, facing);
    let state = RecorderState::new(SessionController::from_config(config, source));

    if let Some(path) = matches.get_one::<PathBuf>("watermark") {
        let mode = match matches.get_one::<String>("mode").map(String::as_str) {
            Some("fullscreen") => WatermarkMode::Fullscreen,
            _ => WatermarkMode::Corner,
        };
        let bytes = tokio::fs::read(path)
            .await
            .with_context(|| format!("failed to read watermark {}", path.display()))?;
        recording::set_watermark(&state, Some(bytes), mode)
            .await
            .map_err(|e| anyhow!("{}: {}", e.code, e.message))?;
    }

    let rotation = matches.get_one::<i32>("rotation").copied().unwrap_or(0);
    recording::set_device_rotation(&state, rotation)
        .await
        .map_err(|e| anyhow!("{}: {}", e.code, e.message))?;
    recording::open_capture(&state)
        .await
        .map_err(|e| anyhow!("{}: {}", e.code, e.message))?;

    if !recording::start_recording(&state).await {
        recording::dispose(&state).await;
        bail!("recording did not start");
    }

    let total = secs(&matches, "seconds")?.unwrap_or(Duration::from_secs(3));
    match secs(&matches, "pause-at")? {
        Some(pause_at) if pause_at < total => {
            let paused_for = secs(&matches, "resume-after")?.unwrap_or(Duration::from_secs(1));
            tokio::time::sleep(pause_at).await;
            recording::pause_recording(&state).await;
            tokio::time::sleep(paused_for).await;
            recording::resume_recording(&state).await;
            tokio::time::sleep(total - pause_at).await;
        }
        _ => tokio::time::sleep(total).await,
    }

    if matches.get_flag("snapshot") {
        match recording::capture_snapshot(&state).await {
            Some(path) => println!("snapshot: {}", path.display()),
            None => tracing::warn!("No frame captured, snapshot skipped"),
        }
    }

    let output = recording::stop_recording(&state).await;
    recording::dispose(&state).await;

    match output {
        Some(path) => {
            println!("{}", path.display());
            Ok(())
        }
        None => bail!("recording produced no output"),
    }
}
