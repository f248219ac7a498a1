//! sentryd - Spray Sentry daemon
//!
//! This daemon:
//! 1. Captures frames from the configured camera (or a synthetic scene)
//! 2. Runs the selected detector on each new frame
//! 3. Fires the relay when a targeted object reaches the configured line
//! 4. Serves the local control API
//!
//! Stopping (Ctrl-C) waits for any relay sequence in flight so the valve is
//! always switched off.

use anyhow::{anyhow, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::{mpsc, Arc};

use spray_sentry::{
    api::{ApiConfig, ApiServer},
    detect::{BackendRegistry, StubBackend},
    ActuationController, CaptureWorker, CrossingEvaluator, DetectionLoop, FrameSlot, SentryConfig,
    SharedConfig, SnapshotCell,
};

/// Steps the demo walker takes to cross the frame.
const WALKER_STEPS: u32 = 40;

#[derive(Parser, Debug)]
#[command(author, version, about = "Detect objects crossing a line and pulse a relay")]
struct Args {
    /// JSON or TOML config file.
    #[arg(long, env = "SPRAY_CONFIG", value_name = "PATH")]
    config: Option<PathBuf>,

    /// Control API bind address.
    #[arg(long)]
    api_addr: Option<String>,

    /// Start detection immediately instead of waiting for /start_detection.
    #[arg(long)]
    autostart: bool,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => SentryConfig::load_from(path)?,
        None => SentryConfig::load()?,
    };
    if let Some(addr) = args.api_addr {
        config.api_addr = addr;
    }
    log::info!(
        "sentryd {} starting: source={}, backend={}, cooldown={:.1}s, hold={:.1}s, threshold={}px",
        env!("CARGO_PKG_VERSION"),
        config.source.url,
        config.detector.backend,
        config.actuation.cooldown.as_secs_f32(),
        config.actuation.hold.as_secs_f32(),
        config.threshold_px
    );
    if config.runtime.endpoint().is_none() {
        log::warn!("no relay endpoint configured; set one via /set_esp_ip or SPRAY_ESP32_IP");
    }

    let slot = Arc::new(FrameSlot::new());
    let producer = spray_sentry::open_producer(&config.source)?;
    let capture = CaptureWorker::spawn(producer, slot.clone())?;

    let registry = build_registry(&config)?;
    let detector = registry.resolve(Some(&config.detector.backend))?;

    let actuator = Arc::new(ActuationController::with_http_relay(config.actuation));
    let detection = Arc::new(DetectionLoop::new(
        slot,
        detector,
        Arc::new(SharedConfig::new(config.runtime.clone())),
        actuator.clone(),
        Arc::new(SnapshotCell::new()),
        CrossingEvaluator::new(config.threshold_px),
    ));

    let api_handle = ApiServer::new(
        ApiConfig {
            addr: config.api_addr.clone(),
        },
        detection.clone(),
    )
    .spawn()?;

    if args.autostart {
        detection.start()?;
    } else {
        log::info!("detection idle; GET /start_detection on {} to begin", api_handle.addr);
    }

    let (tx, rx) = mpsc::channel();
    ctrlc::set_handler(move || {
        let _ = tx.send(());
    })
    .map_err(|err| anyhow!("error setting Ctrl-C handler: {}", err))?;

    log::info!("sentryd waiting for shutdown signal (Ctrl-C)...");
    let _ = rx.recv();
    log::info!("shutdown signal received, stopping...");

    detection.shutdown()?;
    api_handle.stop()?;
    capture.stop()?;
    actuator.join_in_flight()?;
    log::info!(
        "sentryd stopped after {} relay sequences",
        actuator.sequences_started()
    );
    Ok(())
}

fn build_registry(config: &SentryConfig) -> Result<BackendRegistry> {
    let mut registry = BackendRegistry::new();
    let walker_label = config
        .runtime
        .detect_objects()
        .iter()
        .next()
        .map(String::as_str)
        .unwrap_or("cat");
    registry.register(StubBackend::walker(walker_label, WALKER_STEPS));

    #[cfg(feature = "backend-tract")]
    {
        if let Some(path) = &config.detector.model_path {
            let backend =
                spray_sentry::detect::TractBackend::new(path, config.detector.input_size)?;
            registry.register(backend);
        }
    }
    #[cfg(not(feature = "backend-tract"))]
    {
        if config.detector.model_path.is_some() {
            log::warn!("model_path is set but this build lacks the backend-tract feature");
        }
    }

    Ok(registry)
}
