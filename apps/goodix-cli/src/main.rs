use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use anyhow::{Context, bail};
use clap::Parser;
use goodix_core::model::goodix511;
use goodix_core::{
    DeviceEvent, DeviceObserver, DeviceSession, Goodix511, Image, NusbTransport, SessionConfig,
    TracingObserver,
};
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(author, version, about = "Goodix TLS fingerprint sensor capture tool", long_about = None)]
struct Args {
    /// Path to the MCU configuration blob uploaded during activation
    #[arg(long)]
    mcu_config: PathBuf,

    /// Path to a session configuration file (TOML)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Directory the captured PGM images are written to
    #[arg(long, default_value = ".")]
    output: PathBuf,

    /// Number of images to capture
    #[arg(long, default_value_t = 1)]
    scans: u32,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

/// Logs every event and keeps what the capture loop needs.
#[derive(Default)]
struct CaptureObserver {
    images: Mutex<Vec<Image>>,
    failure: Mutex<Option<String>>,
}

impl CaptureObserver {
    fn take_image(&self) -> Option<Image> {
        self.images.lock().ok()?.pop()
    }

    fn take_failure(&self) -> String {
        self.failure
            .lock()
            .ok()
            .and_then(|mut failure| failure.take())
            .unwrap_or_else(|| "no reason reported".to_string())
    }
}

impl DeviceObserver for CaptureObserver {
    fn on_event(&self, event: &DeviceEvent) {
        TracingObserver.on_event(event);
        match event {
            DeviceEvent::ImageCaptured(image) => {
                if let Ok(mut images) = self.images.lock() {
                    images.push(image.clone());
                }
            }
            DeviceEvent::ActivationFailed { message } | DeviceEvent::SessionError { message } => {
                if let Ok(mut failure) = self.failure.lock() {
                    *failure = Some(message.clone());
                }
            }
            _ => {}
        }
    }
}

fn run(args: &Args) -> anyhow::Result<()> {
    let config = match &args.config {
        Some(path) => SessionConfig::load_from_file(path)
            .with_context(|| format!("failed to load config '{}'", path.display()))?,
        None => SessionConfig::default(),
    };
    let blob = std::fs::read(&args.mcu_config)
        .with_context(|| format!("failed to read MCU config '{}'", args.mcu_config.display()))?;

    let transport = NusbTransport::open(&goodix511::USB_PROFILE, config.usb_timeout())?;
    let observer = Arc::new(CaptureObserver::default());
    let mut session = DeviceSession::with_observer(
        transport,
        Box::new(Goodix511::new(blob)),
        config,
        observer.clone(),
    );

    session.activate()?;
    session.run_until_idle()?;
    if !session.is_activated() {
        bail!("activation failed: {}", observer.take_failure());
    }

    std::fs::create_dir_all(&args.output)
        .with_context(|| format!("failed to create '{}'", args.output.display()))?;

    for n in 1..=args.scans {
        info!(scan = n, total = args.scans, "Place a finger on the sensor");
        session.start_scan()?;
        session.run_until_idle()?;

        let Some(image) = observer.take_image() else {
            bail!("scan {} failed: {}", n, observer.take_failure());
        };
        let path = args.output.join(format!("goodix-{n:03}.pgm"));
        image.save_pgm(&path)?;
        info!(path = %path.display(), "Image saved");
    }

    session.deactivate();
    Ok(())
}

fn main() {
    let args = Args::parse();

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::builder()
                .with_default_directive(if args.verbose {
                    tracing::Level::DEBUG.into()
                } else {
                    tracing::Level::INFO.into()
                })
                .from_env_lossy(),
        )
        .with_writer(std::io::stderr)
        .finish();

    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("setting default subscriber failed: {e}");
    }

    info!("Starting goodix capture tool (nusb backend)...");

    if let Err(e) = run(&args) {
        error!("Error: {:#}", e);
        std::process::exit(1);
    }
}
