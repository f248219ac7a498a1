//! Spray Sentry
//!
//! Camera-driven deterrent: watch a frame stream, detect objects, and when a
//! targeted object reaches a user-drawn line, pulse a network relay (e.g. an
//! ESP32 driving a water valve) for a fixed hold time.
//!
//! # Architecture
//!
//! Three activities run concurrently:
//!
//! 1. **Capture**: an `ingest::CaptureWorker` keeps the newest frame in a
//!    `frame::FrameSlot`.
//! 2. **Perception**: `pipeline::DetectionLoop` runs the detector on each new
//!    frame, checks crossings with `geometry::CrossingEvaluator`, and publishes a
//!    `snapshot::DetectionSnapshot`.
//! 3. **Actuation**: `actuate::ActuationController` admits at most one relay
//!    sequence at a time and one per cooldown window, running each on its own
//!    thread.
//!
//! Reconfiguration (`config::SharedConfig`) and status reads go through the
//! `api` module and never block the loop.
//!
//! # Module Structure
//!
//! - `frame`: frame type and the latest-frame slot
//! - `ingest`: frame producers (synthetic, HTTP MJPEG)
//! - `detect`: detector trait, backends, YOLO decoding
//! - `geometry`: line model and point-to-segment distance
//! - `actuate`: trigger gate, relay client, actuation sequences
//! - `pipeline`: the detection loop
//! - `snapshot`: published detection results
//! - `config`: runtime and daemon configuration
//! - `api`: local HTTP control surface

pub mod actuate;
pub mod api;
pub mod config;
pub mod detect;
pub mod frame;
pub mod geometry;
pub mod ingest;
pub mod pipeline;
pub mod snapshot;

pub use actuate::{
    ActuationController, ActuationTiming, HttpRelay, Phase, RelayClient, RelayCommand,
    RelayEndpoint, TriggerOutcome,
};
pub use config::{RuntimeConfig, SentryConfig, SharedConfig};
pub use detect::{BackendRegistry, BoundingBox, Detection, ObjectDetector, SharedDetector};
pub use frame::{Frame, FrameSlot, FrameSource};
pub use geometry::{CrossingEvaluator, Line, Point, Segment};
pub use ingest::{open_producer, CaptureWorker, FrameProducer};
pub use pipeline::{DetectionLoop, StepOutcome, StepReport};
pub use snapshot::{DetectionSnapshot, SnapshotCell};
