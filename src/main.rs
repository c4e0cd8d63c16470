use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use hlscam::pipeline::{self, PipelineConfig, Registry, SessionState};
use hlscam::video::format::{PixelFormat, Resolution};
use hlscam::video::locate;

/// Log level for the application
#[derive(Debug, Clone, Copy, Default, ValueEnum)]
enum LogLevel {
    Error,
    Warn,
    #[default]
    Info,
    Debug,
    Trace,
}

/// hlscam command line arguments
#[derive(Parser, Debug)]
#[command(name = "hlscam")]
#[command(version, about = "V4L2 capture to HLS segments", long_about = None)]
struct CliArgs {
    /// Capture device name (substring match against the v4l2 card name)
    #[arg(short = 'd', long, value_name = "NAME", conflicts_with = "device_path")]
    device: Option<String>,

    /// Capture device node (bypasses name lookup)
    #[arg(long, value_name = "PATH")]
    device_path: Option<PathBuf>,

    /// Output directory for segments and the playlist
    #[arg(short = 'o', long, value_name = "DIR", default_value = ".")]
    output: PathBuf,

    /// List available capture devices and exit
    #[arg(long)]
    list_devices: bool,

    /// Capture width
    #[arg(long, default_value_t = 1920)]
    width: u32,

    /// Capture height
    #[arg(long, default_value_t = 1080)]
    height: u32,

    /// Capture pixel format (yuyv, uyvy, nv12, yuv420)
    #[arg(long, default_value = "yuyv")]
    format: PixelFormat,

    /// Capture frame rate
    #[arg(long, default_value_t = 60)]
    fps: u32,

    /// Encoder bitrate in kbit/s
    #[arg(long, default_value_t = 4000)]
    bitrate_kbps: u32,

    /// Keyframe interval in frames
    #[arg(long, default_value_t = 60)]
    gop: u32,

    /// Target segment length in seconds
    #[arg(long, default_value_t = 10)]
    segment_seconds: u32,

    /// Number of segments kept in the playlist
    #[arg(long, default_value_t = 6)]
    window: usize,

    /// Capture buffer count
    #[arg(long, default_value_t = 4)]
    buffers: u32,

    /// Capture timeout in milliseconds
    #[arg(long, default_value_t = 2000)]
    timeout_ms: u64,

    /// Log level (error, warn, info, debug, trace)
    #[arg(short = 'l', long, value_name = "LEVEL", default_value = "info")]
    log_level: LogLevel,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = CliArgs::parse();
    init_logging(args.log_level);

    tracing::info!("Starting hlscam v{}", env!("CARGO_PKG_VERSION"));

    if args.list_devices {
        let devices = locate::enumerate_devices()?;
        if devices.is_empty() {
            println!("no capture devices found");
        }
        for dev in devices {
            println!("{}\t{}", dev.path.display(), dev.name);
        }
        return Ok(());
    }

    let device_path = match (&args.device_path, &args.device) {
        (Some(path), _) => path.clone(),
        (None, Some(name)) => locate::locate_device(name)?.path,
        (None, None) => anyhow::bail!("either --device or --device-path is required"),
    };

    let config = PipelineConfig {
        device_path,
        output_dir: args.output,
        resolution: Resolution::new(args.width, args.height),
        format: args.format,
        fps: args.fps,
        bitrate_kbps: args.bitrate_kbps,
        gop: args.gop,
        segment_seconds: args.segment_seconds,
        window: args.window,
        buffer_count: args.buffers,
        timeout: Duration::from_millis(args.timeout_ms),
    };

    pipeline::initialize();

    let registry = Arc::new(Registry::new());
    let session = registry.start(config).await?;

    let shutdown_signal = async {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install CTRL+C handler");
        tracing::info!("Shutdown signal received");
    };

    tokio::select! {
        _ = shutdown_signal => {
            registry.stop_all().await;
        }
        state = session.wait() => {
            if state == SessionState::Failed {
                anyhow::bail!("session ended with an error");
            }
        }
    }

    tracing::info!("Shutdown complete");
    Ok(())
}

/// Initialize logging with tracing
fn init_logging(level: LogLevel) {
    let filter = match level {
        LogLevel::Error => "hlscam=error",
        LogLevel::Warn => "hlscam=warn",
        LogLevel::Info => "hlscam=info",
        LogLevel::Debug => "hlscam=debug",
        LogLevel::Trace => "hlscam=trace",
    };

    // Environment variable takes highest priority
    let env_filter =
        tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into());

    if let Err(err) = tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .try_init()
    {
        eprintln!("failed to initialize tracing: {}", err);
    }
}
