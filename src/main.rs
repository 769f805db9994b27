//! vidrelay: capture one camera and fan it out to a preview window and an RTSP stream

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use vidrelay::capture::synthetic::SYNTHETIC_DEVICE;
use vidrelay::capture::{DeviceProvider, DeviceRegistry, PixelFormat, SyntheticProvider, V4l2Provider};
use vidrelay::sink::{self, DisplaySurface, Overlay};
use vidrelay::{Config, Supervisor, SupervisorConfig};

#[derive(Parser)]
#[command(name = "vidrelay", version, about = "Video capture and distribution pipeline")]
struct Cli {
    /// TOML configuration file
    #[arg(long, global = true, env = "VIDRELAY_CONFIG")]
    config: Option<PathBuf>,

    /// Log filter, RUST_LOG syntax
    #[arg(long, global = true, env = "RUST_LOG", default_value = "vidrelay=info")]
    log: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// List capture devices and the formats they offer
    Devices {
        /// List the synthetic camera instead of V4L2 devices
        #[arg(long)]
        synthetic: bool,
    },
    /// Capture and distribute until Ctrl-C or the window is closed
    Run(RunArgs),
}

#[derive(Args)]
struct RunArgs {
    #[arg(long)]
    device: Option<String>,
    /// Pixel format (MJPG, YUYV, RGB3, ...)
    #[arg(long)]
    format: Option<PixelFormat>,
    #[arg(long)]
    width: Option<u32>,
    #[arg(long)]
    height: Option<u32>,
    #[arg(long)]
    fps: Option<u32>,
    /// Publish to this RTSP server
    #[arg(long)]
    rtsp: Option<String>,
    #[arg(long)]
    no_display: bool,
    /// Mirror the preview top to bottom
    #[arg(long)]
    flip: bool,
    /// Run the random-box detector and draw its boxes on the preview
    #[arg(long)]
    detect: bool,
    /// Use the synthetic test-pattern camera
    #[arg(long)]
    synthetic: bool,
}

impl RunArgs {
    fn apply(&self, config: &mut Config) {
        if self.synthetic {
            config.capture.device = SYNTHETIC_DEVICE.into();
            config.capture.format = PixelFormat::Yuyv;
        }
        if let Some(device) = &self.device {
            config.capture.device = device.clone();
        }
        if let Some(format) = self.format {
            config.capture.format = format;
        }
        if let Some(width) = self.width {
            config.capture.width = width;
        }
        if let Some(height) = self.height {
            config.capture.height = height;
        }
        if let Some(fps) = self.fps {
            config.capture.fps = fps;
        }
        if let Some(location) = &self.rtsp {
            config.network.enabled = true;
            config.network.location = location.clone();
        }
        if self.no_display {
            config.display.enabled = false;
        }
        if self.flip {
            config.display.flip_vertical = true;
        }
        if self.detect {
            config.detection.enabled = true;
        }
    }
}

fn provider(synthetic: bool, config: &Config) -> Arc<dyn DeviceProvider> {
    if synthetic {
        Arc::new(SyntheticProvider::camera())
    } else {
        Arc::new(V4l2Provider::new(config.capture.buffer_count))
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize error handling and logging
    color_eyre::install()?;
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::try_new(&cli.log)?)
        .with_timer(tracing_subscriber::fmt::time::uptime())
        .init();

    let mut config = Config::load(cli.config.as_deref())?;

    match cli.command {
        Command::Devices { synthetic } => list_devices(DeviceRegistry::new(provider(synthetic, &config))),
        Command::Run(args) => {
            args.apply(&mut config);
            run(config, args.synthetic).await
        }
    }
}

fn list_devices(registry: DeviceRegistry) -> Result<()> {
    let devices = registry.enumerate();
    if devices.is_empty() {
        println!("No capture devices found");
        return Ok(());
    }
    for device in devices {
        println!("{} - {} ({})", device.id, device.name, device.driver);
        for format in &device.formats {
            println!("    {format}");
        }
    }
    Ok(())
}

async fn run(config: Config, synthetic: bool) -> Result<()> {
    info!("vidrelay launching...");

    let registry = DeviceRegistry::new(provider(synthetic, &config));
    let sinks = sink::compose(&config);
    let (surface, overlay) = (sinks.surface, sinks.overlay);
    let supervisor = Arc::new(Supervisor::new(
        registry,
        sinks.sinks,
        SupervisorConfig::from_config(&config),
    ));

    let format = config.format_spec();
    info!(device = %config.capture.device, %format, "Using capture device");
    supervisor
        .start(&config.capture.device, format)
        .await
        .map_err(|e| eyre!("failed to start pipeline: {e}"))?;

    let stop = CancellationToken::new();
    {
        let stop = stop.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Interrupt received");
            }
            stop.cancel();
        });
    }

    let reporter = {
        let supervisor = supervisor.clone();
        let stop = stop.clone();
        tokio::spawn(async move { report_status(&supervisor, stop).await })
    };

    present(&config, &supervisor, surface, overlay, stop.clone())?;
    stop.cancelled().await;

    if let Err(e) = reporter.await {
        warn!("Status reporter failed: {}", e);
    }
    supervisor.stop().await;
    info!("vidrelay shutting down");
    Ok(())
}

async fn report_status(supervisor: &Supervisor, stop: CancellationToken) {
    let mut ticker = tokio::time::interval(Duration::from_secs(5));
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = stop.cancelled() => return,
            _ = ticker.tick() => {}
        }
        let status = supervisor.status();
        info!(
            state = ?status.state,
            frames = status.frames_captured,
            device_drops = status.device_frame_drops,
            retries = status.retries,
            "Pipeline status"
        );
        for sink in &status.sinks {
            info!(
                sink = %sink.name,
                delivered = sink.delivered,
                dropped = sink.dropped,
                interrupted = sink.interrupted,
                "Sink status"
            );
        }
        if let Some(error) = &status.last_error {
            warn!(%error, "Last pipeline error");
        }
        if let Some(error) = &status.last_retry_error {
            warn!(%error, "Last failed recovery attempt");
        }
    }
}

/// Show the preview window on this thread until it closes or `stop` fires.
///
/// Space toggles capture on and off.
#[cfg(feature = "sdl-window")]
fn present(
    config: &Config,
    supervisor: &Supervisor,
    surface: Option<DisplaySurface>,
    overlay: Option<Overlay>,
    stop: CancellationToken,
) -> Result<()> {
    let Some(surface) = surface else {
        return Ok(());
    };
    let runtime = tokio::runtime::Handle::current();
    let device = config.capture.device.clone();
    let format = config.format_spec();
    let on_toggle = || match runtime.block_on(supervisor.toggle(&device, format)) {
        Ok(state) => info!(?state, "Capture toggled"),
        Err(e) => warn!("Failed to toggle capture: {}", e),
    };

    tokio::task::block_in_place(|| {
        let sdl_context = sdl2::init().map_err(|e| eyre!(e))?;
        let mut window = vidrelay::display::PreviewWindow::new(&sdl_context, &config.display)?;
        window.run(&sdl_context, surface, overlay, stop, on_toggle)
    })
}

#[cfg(not(feature = "sdl-window"))]
fn present(
    _config: &Config,
    _supervisor: &Supervisor,
    surface: Option<DisplaySurface>,
    _overlay: Option<Overlay>,
    _stop: CancellationToken,
) -> Result<()> {
    if surface.is_some() {
        info!("Built without sdl-window, running headless");
    }
    Ok(())
}
