//! Frame ingestion.
//!
//! A `FrameProducer` pulls frames from a camera (or a synthetic scene) and a
//! `CaptureWorker` keeps the newest one in a shared `FrameSlot`. Consumers only
//! ever see the latest frame; older frames are dropped, never queued.
//!
//! Sources:
//! - `stub://...` synthetic scene (always available)
//! - `http(s)://...` MJPEG or single-JPEG camera endpoint (feature: ingest-mjpeg)

#[cfg(feature = "ingest-mjpeg")]
pub mod mjpeg;
pub mod synthetic;

use anyhow::{anyhow, Context, Result};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crate::config::SourceSettings;
use crate::frame::{Frame, FrameSlot};

#[cfg(feature = "ingest-mjpeg")]
pub use mjpeg::MjpegSource;
pub use synthetic::SyntheticSource;

/// Back-off after a failed capture before trying again.
pub const CAPTURE_RETRY_DELAY: Duration = Duration::from_millis(500);

/// A blocking source of frames.
pub trait FrameProducer: Send {
    /// Human-readable description for logs.
    fn describe(&self) -> String;

    /// Open or re-open the underlying stream.
    fn connect(&mut self) -> Result<()>;

    /// Block until the next frame is available. `seq` is assigned by the producer
    /// and strictly increases.
    fn next_frame(&mut self) -> Result<Frame>;

    fn frames_captured(&self) -> u64;
}

/// Pick a producer from the source URL scheme.
pub fn open_producer(settings: &SourceSettings) -> Result<Box<dyn FrameProducer>> {
    let url = settings.url.trim();
    if url.starts_with("stub://") {
        return Ok(Box::new(SyntheticSource::new(settings.clone())));
    }
    let parsed = url::Url::parse(url).with_context(|| format!("parse source url '{}'", url))?;
    match parsed.scheme() {
        "http" | "https" => {
            #[cfg(feature = "ingest-mjpeg")]
            {
                Ok(Box::new(MjpegSource::new(settings.clone())))
            }
            #[cfg(not(feature = "ingest-mjpeg"))]
            {
                anyhow::bail!("http camera sources require the ingest-mjpeg feature")
            }
        }
        other => Err(anyhow!(
            "unsupported source scheme '{}'; expected stub:// or http(s)://",
            other
        )),
    }
}

/// Background thread that feeds a `FrameSlot` from a producer.
pub struct CaptureWorker {
    shutdown: Arc<AtomicBool>,
    errors: Arc<AtomicU64>,
    handle: Option<JoinHandle<()>>,
}

impl CaptureWorker {
    pub fn spawn(mut producer: Box<dyn FrameProducer>, slot: Arc<FrameSlot>) -> Result<Self> {
        let shutdown = Arc::new(AtomicBool::new(false));
        let errors = Arc::new(AtomicU64::new(0));
        let thread_shutdown = Arc::clone(&shutdown);
        let thread_errors = Arc::clone(&errors);
        let handle = std::thread::Builder::new()
            .name("capture".to_string())
            .spawn(move || {
                let source = producer.describe();
                let mut connected = false;
                while !thread_shutdown.load(Ordering::SeqCst) {
                    if !connected {
                        match producer.connect() {
                            Ok(()) => {
                                log::info!("capture connected to {}", source);
                                connected = true;
                            }
                            Err(err) => {
                                thread_errors.fetch_add(1, Ordering::Relaxed);
                                log::warn!("capture connect to {} failed: {:#}", source, err);
                                std::thread::sleep(CAPTURE_RETRY_DELAY);
                                continue;
                            }
                        }
                    }
                    let stored = producer.next_frame().and_then(|frame| slot.store(frame));
                    if let Err(err) = stored {
                        thread_errors.fetch_add(1, Ordering::Relaxed);
                        log::warn!("capture from {} failed: {:#}", source, err);
                        connected = false;
                        std::thread::sleep(CAPTURE_RETRY_DELAY);
                    }
                }
                log::info!(
                    "capture stopped after {} frames from {}",
                    producer.frames_captured(),
                    source
                );
            })
            .context("spawn capture thread")?;
        Ok(Self {
            shutdown,
            errors,
            handle: Some(handle),
        })
    }

    pub fn errors(&self) -> u64 {
        self.errors.load(Ordering::Relaxed)
    }

    /// Signal the thread and wait for it. A producer blocked in a read returns
    /// once its own timeout fires.
    pub fn stop(mut self) -> Result<()> {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            handle
                .join()
                .map_err(|_| anyhow!("capture thread panicked"))?;
        }
        Ok(())
    }
}

impl Drop for CaptureWorker {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }
}

/// Minimum spacing between frames for a target rate. Zero disables decimation.
pub(crate) fn frame_interval(target_fps: u32) -> Duration {
    if target_fps == 0 {
        Duration::ZERO
    } else {
        Duration::from_millis((1000 / target_fps).max(1) as u64)
    }
}
