//! vdisplay - virtual display adapter
//!
//! ```text
//! vdisplay serve --mode 1280x720          → adapter with a test pattern
//! vdisplay serve --source x11 --display :0 → adapter mirroring an X screen
//! vdisplay view                            → window bound to the adapter
//! vdisplay grab --output frame.raw         → one full frame, raw pixels
//! ```

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use vdisplay::host::Headless;
use vdisplay::server::{Server, DEFAULT_SOCKET};
use vdisplay::source::{self, FrameSource, TestPattern, X11Capture};
use vdisplay::{client, viewer, DeviceManager, DriverConfig, Mode, PixelFormat};

#[derive(Parser)]
#[command(name = "vdisplay")]
#[command(about = "Virtual display adapter with a single user-space consumer")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum SourceKind {
    /// Synthetic animation
    Pattern,
    /// Copy of a running X display
    X11,
}

#[derive(Subcommand)]
enum Commands {
    /// Create an adapter, feed it from a producer and serve its control socket
    Serve {
        #[arg(short, long, default_value = DEFAULT_SOCKET)]
        socket: PathBuf,

        /// Initial mode, WIDTHxHEIGHT[@REFRESH]
        #[arg(short, long, default_value = "1280x720")]
        mode: Mode,

        #[arg(long, value_enum, default_value = "pattern")]
        source: SourceKind,

        /// X display to capture with --source x11
        #[arg(short, long, default_value = ":0")]
        display: String,

        /// Extra uid granted render access (repeatable)
        #[arg(long = "allow-uid")]
        allow_uid: Vec<u32>,

        /// Register the legacy framebuffer-compat layer
        #[arg(long)]
        legacy_fbdev: bool,
    },

    /// Bind to a served adapter and show it in a window
    View {
        #[arg(short, long, default_value = DEFAULT_SOCKET)]
        socket: PathBuf,

        #[arg(short, long, default_value = "1280x720")]
        mode: Mode,
    },

    /// Bind, grab one full frame and write its raw pixels
    Grab {
        #[arg(short, long, default_value = DEFAULT_SOCKET)]
        socket: PathBuf,

        #[arg(short, long, default_value = "1280x720")]
        mode: Mode,

        /// Output file, stdout when omitted
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("vdisplay=info".parse()?)
                .add_directive("x11rb=warn".parse()?),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Serve {
            socket,
            mode,
            source,
            display,
            allow_uid,
            legacy_fbdev,
        } => run_serve(socket, mode, source, &display, allow_uid, legacy_fbdev).await,
        Commands::View { socket, mode } => viewer::run_viewer(&socket, mode).await,
        Commands::Grab {
            socket,
            mode,
            output,
        } => run_grab(socket, mode, output).await,
    }
}

async fn run_serve(
    socket: PathBuf,
    mode: Mode,
    kind: SourceKind,
    x_display: &str,
    allow_uid: Vec<u32>,
    legacy_fbdev: bool,
) -> Result<()> {
    let config = DriverConfig::default().with_legacy_fbdev(legacy_fbdev);
    let manager = Arc::new(DeviceManager::new(Arc::new(config), Arc::new(Headless)));
    let display = manager.create("vdisplay.0")?;

    let producer: Box<dyn FrameSource> = match kind {
        SourceKind::Pattern => Box::new(TestPattern::new()),
        SourceKind::X11 => Box::new(X11Capture::connect(x_display)?),
    };
    display.set_mode(mode, PixelFormat::Xrgb8888)?;

    let interval = Duration::from_millis(1000 / mode.refresh.clamp(1, 240) as u64);
    let producer = tokio::spawn(source::run_source(Arc::clone(&display), producer, interval));

    let server = Server::bind(&socket, Arc::clone(&manager), display.index(), allow_uid)?;
    eprintln!("vdisplay ready - {} on {}", mode, server.path().display());
    eprintln!("view with: vdisplay view --socket {}", server.path().display());

    server
        .serve_until(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;

    manager.remove_all();
    producer.await??;
    Ok(())
}

async fn run_grab(socket: PathBuf, mode: Mode, output: Option<PathBuf>) -> Result<()> {
    let update = client::grab_once(&socket, mode, PixelFormat::Xrgb8888).await?;
    eprintln!(
        "grabbed {} {:?} stride {} ({} bytes)",
        update.mode,
        update.format,
        update.stride,
        update.pixels.len()
    );
    match output {
        Some(path) => std::fs::write(&path, &update.pixels)
            .with_context(|| format!("failed to write {}", path.display()))?,
        None => {
            use std::io::Write;
            std::io::stdout().write_all(&update.pixels)?;
        }
    }
    Ok(())
}
