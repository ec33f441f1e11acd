//! GhostGrab CLI
//!
//! Command-line interface for testing and using GhostGrab.

use clap::{Parser, Subcommand, ValueEnum};
use ghostgrab::{
    backend::ffmpeg::get_info,
    config::{EncoderPreset, H264Profile},
    Config, EncodedFrame, EncoderBackend, FfmpegBackend, Flow, FrameProducer, SystemClock,
};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Encoder backend for CLI
#[derive(Debug, Clone, Copy, ValueEnum, Default)]
enum Backend {
    /// Auto-select best available (NVENC > x264)
    #[default]
    Auto,
    /// Force NVIDIA NVENC hardware encoding
    Nvenc,
    /// Force CPU software encoding (x264)
    Cpu,
}

impl From<Backend> for EncoderBackend {
    fn from(b: Backend) -> Self {
        match b {
            Backend::Auto => EncoderBackend::Auto,
            Backend::Nvenc => EncoderBackend::Nvenc,
            Backend::Cpu => EncoderBackend::Software,
        }
    }
}

/// H.264 profile for CLI
#[derive(Debug, Clone, Copy, ValueEnum)]
enum Profile {
    Baseline,
    Main,
    High,
    High444,
}

impl From<Profile> for H264Profile {
    fn from(p: Profile) -> Self {
        match p {
            Profile::Baseline => H264Profile::Baseline,
            Profile::Main => H264Profile::Main,
            Profile::High => H264Profile::High,
            Profile::High444 => H264Profile::High444,
        }
    }
}

/// Encoder preset for CLI
#[derive(Debug, Clone, Copy, ValueEnum)]
enum Preset {
    /// Lowest latency
    Hp,
    /// Low latency, higher quality
    Hq,
}

impl From<Preset> for EncoderPreset {
    fn from(p: Preset) -> Self {
        match p {
            Preset::Hp => EncoderPreset::LowLatencyHp,
            Preset::Hq => EncoderPreset::LowLatencyHq,
        }
    }
}

#[derive(Parser)]
#[command(name = "ghostgrab")]
#[command(about = "Paced live screen capture with H.264 encoding")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show encoder availability
    Info,

    /// Capture frames into an H.264 byte-stream file
    Capture {
        /// Output file path
        #[arg(short, long, default_value = "capture.h264")]
        output: PathBuf,

        /// Stop after this many frames (default: until Ctrl+C)
        #[arg(short = 'n', long)]
        frames: Option<u64>,

        /// Framerate
        #[arg(short, long)]
        fps: Option<f64>,

        /// Bitrate in kbps
        #[arg(short, long)]
        bitrate: Option<u32>,

        /// Display to capture (e.g. "synthetic:1280x720")
        #[arg(short, long)]
        display: Option<String>,

        /// Hide the mouse pointer
        #[arg(long)]
        no_pointer: bool,

        /// Delay before the first frame, in milliseconds
        #[arg(long)]
        startup_delay: Option<u64>,

        /// H.264 profile
        #[arg(long, value_enum)]
        profile: Option<Profile>,

        /// Encoder preset (hp, hq)
        #[arg(long, value_enum)]
        preset: Option<Preset>,

        /// Keyframe interval in frames (default: keyframes only at start)
        #[arg(long)]
        gop: Option<u32>,

        /// Configuration file (TOML)
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Encoder backend (auto, nvenc, cpu)
        #[arg(short, long, value_enum, default_value = "auto")]
        encoder: Backend,
    },

    /// Print the default configuration
    Config,
}

/// Capture options from the command line
struct CaptureArgs {
    output: PathBuf,
    frames: Option<u64>,
    fps: Option<f64>,
    bitrate: Option<u32>,
    display: Option<String>,
    no_pointer: bool,
    startup_delay: Option<u64>,
    profile: Option<Profile>,
    preset: Option<Preset>,
    gop: Option<u32>,
    config: Option<PathBuf>,
    encoder: Backend,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("ghostgrab=info".parse()?),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Info => cmd_info(),
        Commands::Capture {
            output,
            frames,
            fps,
            bitrate,
            display,
            no_pointer,
            startup_delay,
            profile,
            preset,
            gop,
            config,
            encoder,
        } => {
            cmd_capture(CaptureArgs {
                output,
                frames,
                fps,
                bitrate,
                display,
                no_pointer,
                startup_delay,
                profile,
                preset,
                gop,
                config,
                encoder,
            })
            .await
        }
        Commands::Config => cmd_config(),
    }
}

fn cmd_info() -> anyhow::Result<()> {
    println!("GhostGrab {}", ghostgrab::VERSION);
    println!("=============\n");

    let info = get_info();

    println!("=== NVIDIA NVENC ===");
    println!("Available: {}", if info.nvenc { "Yes" } else { "No" });
    if let Some(gpu) = &info.gpu_name {
        println!("GPU: {}", gpu);
    }
    if let Some(driver) = &info.driver_version {
        println!("Driver: {}", driver);
    }

    println!("\n=== CPU Software Encoder ===");
    println!("H.264 (x264): {}", if info.x264 { "Yes" } else { "No" });

    println!("\n=== Summary ===");
    match info.preferred() {
        Some(name) => println!("Capture will encode with {}", name),
        None => println!("No H.264 encoder available"),
    }

    Ok(())
}

fn load_config(args: &CaptureArgs) -> anyhow::Result<Config> {
    let mut config = match &args.config {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };

    if let Some(fps) = args.fps {
        config.source = config.source.with_fps(fps);
    }
    if let Some(kbps) = args.bitrate {
        config.source = config.source.with_bitrate(kbps.saturating_mul(1000));
    }
    if let Some(display) = &args.display {
        config.source = config.source.with_display(display.clone());
    }
    if args.no_pointer {
        config.source = config.source.with_show_pointer(false);
    }
    if let Some(ms) = args.startup_delay {
        config.pacing = config.pacing.with_startup_delay(Duration::from_millis(ms));
    }
    if let Some(profile) = args.profile {
        config.encoder = config.encoder.with_profile(profile.into());
    }
    if let Some(preset) = args.preset {
        config.encoder = config.encoder.with_preset(preset.into());
    }
    if let Some(gop) = args.gop {
        config.encoder = config.encoder.with_gop_size(gop);
    }

    config.validate()?;
    Ok(config)
}

async fn cmd_capture(args: CaptureArgs) -> anyhow::Result<()> {
    let config = load_config(&args)?;
    let limit = args.frames;

    println!("Configuration:");
    println!(
        "  Display: {}",
        config.source.display_name.as_deref().unwrap_or("default")
    );
    println!("  Bitrate: {} kbps", config.source.bitrate / 1000);
    println!("  FPS: {}", config.source.framerate);
    println!(
        "  Encoder: {} profile, {:?}",
        config.encoder.profile.as_str(),
        config.encoder.preset
    );
    println!("  Startup delay: {:?}", config.pacing.startup_delay());
    println!("  Output: {}", args.output.display());
    println!();

    let mut producer = FrameProducer::builder()
        .config(config)
        .backend(FfmpegBackend::factory(args.encoder.into()))
        .clock(Arc::new(SystemClock::new()))
        .build()?;
    producer.start()?;
    let handle = producer.handle();

    // Frames go to a writer thread so file I/O never delays pacing
    let (tx, rx) = crossbeam_channel::bounded::<EncodedFrame>(32);
    let file = File::create(&args.output)?;
    let writer = std::thread::Builder::new()
        .name("ghostgrab-writer".into())
        .spawn(move || -> std::io::Result<u64> {
            let mut out = BufWriter::new(file);
            let mut written = 0u64;
            for frame in rx {
                out.write_all(&frame.data)?;
                written += frame.size() as u64;
            }
            out.flush()?;
            Ok(written)
        })?;

    println!("Capture started. Press Ctrl+C to stop.\n");
    let start = Instant::now();

    let mut pull = tokio::task::spawn_blocking(move || -> ghostgrab::Result<FrameProducer> {
        loop {
            if limit.is_some_and(|n| producer.stats().frames_produced >= n) {
                break;
            }
            match producer.produce() {
                Ok(frame) => {
                    if tx.send(frame).is_err() {
                        tracing::error!("Writer thread exited");
                        break;
                    }
                }
                Err(e) => match e.flow() {
                    Flow::Flushing => break,
                    Flow::NotReady if e.is_recoverable() => {
                        tracing::warn!("Skipping frame: {}", e);
                    }
                    _ => {
                        producer.stop()?;
                        return Err(e);
                    }
                },
            }
        }
        producer.stop()?;
        Ok(producer)
    });

    let producer = tokio::select! {
        result = &mut pull => result??,
        _ = tokio::signal::ctrl_c() => {
            println!("\nStopping...");
            handle.unlock();
            pull.await??
        }
    };

    let written = writer
        .join()
        .map_err(|_| anyhow::anyhow!("writer thread panicked"))??;
    let elapsed = start.elapsed();
    let stats = producer.stats();

    println!("\nStatistics:");
    println!("  Frames produced: {}", stats.frames_produced);
    println!("  Keyframes: {}", stats.keyframes);
    println!("  Failed frames: {}", stats.failed_frames);
    println!("  Session rebuilds: {}", stats.rebuilds);
    println!("  Bytes written: {}", written);
    if elapsed.as_secs_f64() > 0.0 {
        println!(
            "  Avg bitrate: {:.0} kbps",
            written as f64 * 8.0 / elapsed.as_secs_f64() / 1000.0
        );
    }

    Ok(())
}

fn cmd_config() -> anyhow::Result<()> {
    print!("{}", Config::default().to_toml_string()?);
    Ok(())
}
