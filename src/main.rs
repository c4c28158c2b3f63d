//! VR360 Studio - Native VR/360 Production & Streaming Studio
//!
//! Headless driver: renders a test pattern (or a configured source),
//! stitches and upscales it, and fans every frame out to the configured
//! encoders and virtual cameras at a fixed tick rate.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context as _, Result};
use log::{info, warn};
use parking_lot::Mutex;

use vr360_studio::app::Settings;
use vr360_studio::media::{EquirectStitcher, FfmpegEncoder, FileSink, MaxineSuperRes, V4l2VirtualCam};
use vr360_studio::pipeline::{
    EncoderAdapter, FrameRouter, RenderConfig, RenderEngine, SharedEncoder, SharedRenderEngine,
    SharedStitcher, SharedSuperRes, SharedVirtualCam, Stitcher, SuperResAdapter, VirtualCamOutput,
};
use vr360_studio::render::HeadlessRenderEngine;
use vr360_studio::utils::{self, FrameTimer};

struct Args {
    /// Number of ticks to run; 0 runs until interrupted
    frames: u64,
    /// Log to the console instead of the studio log file
    console: bool,
    /// Explicit settings path
    settings: Option<PathBuf>,
}

fn parse_args() -> Result<Args> {
    let mut args = Args {
        frames: 300,
        console: false,
        settings: None,
    };

    let mut iter = std::env::args().skip(1);
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--frames" => {
                let value = iter.next().context("--frames needs a value")?;
                args.frames = value.parse().context("--frames must be a number")?;
            }
            "--settings" => {
                let value = iter.next().context("--settings needs a path")?;
                args.settings = Some(PathBuf::from(value));
            }
            "--console" => args.console = true,
            "--help" | "-h" => {
                println!(
                    "vr360-studio [--frames N] [--settings PATH] [--console]\n\
                     \n\
                     --frames N      run N ticks then drain and exit (0 = run forever)\n\
                     --settings PATH load settings from PATH instead of the config dir\n\
                     --console       log to the console instead of the studio log file"
                );
                std::process::exit(0);
            }
            other => anyhow::bail!("unknown argument: {other}"),
        }
    }
    Ok(args)
}

/// Build the router and its sinks from settings. Adapters whose
/// initialization fails are logged and left unregistered; the show goes on
/// without them.
fn build_studio(settings: &Settings) -> Result<(FrameRouter, Vec<SharedEncoder>)> {
    let (width, height) = settings.resolution_tuple();

    let mut engine = HeadlessRenderEngine::new();
    engine.initialize(&RenderConfig {
        width,
        height,
        ..RenderConfig::default()
    })?;
    let engine: SharedRenderEngine = Arc::new(Mutex::new(engine));
    let mut router = FrameRouter::new(engine);

    if settings.stitch_enabled {
        let mut stitcher = EquirectStitcher::new();
        match stitcher.initialize(width, height) {
            Ok(()) => {
                let stitcher: SharedStitcher = Arc::new(Mutex::new(stitcher));
                router.set_stitcher(Some((stitcher, settings.stitch_config())));
            }
            Err(e) => warn!("stitcher unavailable: {e:#}"),
        }
    }

    if settings.superres_enabled {
        let mut superres = MaxineSuperRes::new();
        match superres.initialize(width, height) {
            Ok(()) => {
                let superres: SharedSuperRes = Arc::new(Mutex::new(superres));
                router.set_superres(Some((superres, settings.superres_config())));
            }
            Err(e) => warn!("super-resolution unavailable: {e:#}"),
        }
    }

    let mut encoders = Vec::new();
    if let Some(output_dir) = &settings.output_dir {
        utils::ensure_dir(output_dir)?;
        let path = output_dir.join(format!(
            "studio-{}.{}",
            std::process::id(),
            bitstream_ext(&settings.codec)
        ));
        match FileSink::create(path) {
            Ok(sink) => {
                let mut encoder = FfmpegEncoder::new(Box::new(sink));
                match encoder.initialize(&settings.encoder_config()) {
                    Ok(()) => {
                        let encoder: SharedEncoder = Arc::new(Mutex::new(encoder));
                        router.add_encoder(encoder.clone());
                        encoders.push(encoder);
                    }
                    Err(e) => warn!("file encoder unavailable: {e:#}"),
                }
            }
            Err(e) => warn!("file encoder unavailable: {e:#}"),
        }
    }

    let (sink_width, sink_height) = settings.post_transform_resolution();
    for config in &settings.virtual_cams {
        if (config.width, config.height) != (sink_width, sink_height) {
            warn!(
                "virtual cam {} is {}x{} but the pipeline outputs {}x{}; skipping",
                config.device_path, config.width, config.height, sink_width, sink_height
            );
            continue;
        }
        let mut cam = V4l2VirtualCam::new();
        match cam.initialize(config) {
            Ok(()) => {
                let cam: SharedVirtualCam = Arc::new(Mutex::new(cam));
                router.add_virtual_cam(cam);
            }
            Err(e) => warn!("virtual cam {} unavailable: {e:#}", config.device_path),
        }
    }

    Ok((router, encoders))
}

fn bitstream_ext(codec: &str) -> &'static str {
    match codec {
        "h265" | "hevc" => "h265",
        "av1" => "av1",
        _ => "h264",
    }
}

fn main() -> Result<()> {
    let args = parse_args()?;

    if args.console {
        utils::init_console_logging();
    } else if let Err(e) = utils::init_logging() {
        eprintln!("failed to initialize logging: {e}");
    }

    let settings = match &args.settings {
        Some(path) => Settings::load_from(path)
            .with_context(|| format!("failed to load settings from {}", path.display()))?,
        None => Settings::load().unwrap_or_else(|e| {
            warn!("failed to load settings, using defaults: {e:#}");
            Settings::default()
        }),
    };

    info!(
        "starting studio: {} @ {} fps, codec {}",
        settings.resolution, settings.fps, settings.codec
    );

    let (mut router, encoders) = build_studio(&settings)?;
    info!(
        "pipeline ready: {} encoder(s), {} virtual cam(s)",
        router.encoder_count(),
        router.virtual_cam_count()
    );

    let frame_budget = Duration::from_secs_f64(1.0 / settings.fps.max(1) as f64);
    let mut timer = FrameTimer::new();
    let mut ticks: u64 = 0;

    loop {
        let tick_start = std::time::Instant::now();
        router.process_frame(None);
        timer.tick();
        ticks += 1;

        if ticks % 120 == 0 {
            let stats = router.stats();
            info!(
                "tick {ticks}: {:.1} fps, {:.2} ms/frame, {} dropped, {} encode failures",
                timer.fps(),
                timer.avg_frame_time_ms(),
                stats.frames_dropped,
                stats.encode_failures
            );
        }

        if args.frames != 0 && ticks >= args.frames {
            break;
        }

        // Pace to the target tick rate; overruns are simply late, never
        // queued.
        let elapsed = tick_start.elapsed();
        if elapsed < frame_budget {
            std::thread::sleep(frame_budget - elapsed);
        }
    }

    // Drain and release everything the router fans out to.
    for encoder in &encoders {
        let mut encoder = encoder.lock();
        if let Err(e) = encoder.flush() {
            warn!("encoder flush failed: {e:#}");
        }
        encoder.shutdown();
    }

    let stats = router.stats();
    info!(
        "studio stopped after {} ticks ({} dropped, {} encode / {} vcam failures)",
        stats.ticks, stats.frames_dropped, stats.encode_failures, stats.vcam_failures
    );
    Ok(())
}
