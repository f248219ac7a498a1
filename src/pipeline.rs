//! Detection loop: frame → detector → crossing check → relay.
//!
//! One background thread runs `step()` repeatedly while the loop is enabled.
//! `stop()` is cooperative: the flag is checked between iterations, never in
//! the middle of a detector call, and never cancels a relay sequence that has
//! already been accepted.
//!
//! Each `start()` bumps a generation counter. A worker keeps going only while
//! its generation is current, so `stop(); start();` in quick succession cannot
//! leave two workers alive. The detector sits behind a mutex, so even the
//! overlap window between an exiting worker and its replacement never runs two
//! inferences at once.

use anyhow::{anyhow, Context, Result};
use serde::Serialize;
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use crate::actuate::ActuationController;
use crate::config::SharedConfig;
use crate::detect::SharedDetector;
use crate::frame::FrameSource;
use crate::geometry::CrossingEvaluator;
use crate::snapshot::{DetectionSnapshot, SnapshotCell};

/// Wait between polls when no new frame is available.
pub const FRAME_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Result of one perception cycle.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct StepReport {
    pub frame_seq: u64,
    pub detections: usize,
    /// Targeted detections within threshold of the line.
    pub crossings: usize,
    /// Trigger requests the controller accepted.
    pub accepted: usize,
}

#[derive(Clone, Debug, PartialEq)]
pub enum StepOutcome {
    /// No frame yet, or the newest frame was already processed.
    NoFrame,
    Processed(StepReport),
}

/// Shared state the worker thread needs.
struct LoopCore {
    source: Arc<dyn FrameSource>,
    detector: SharedDetector,
    config: Arc<SharedConfig>,
    actuator: Arc<ActuationController>,
    snapshot: Arc<SnapshotCell>,
    evaluator: CrossingEvaluator,
    last_seq: Mutex<Option<u64>>,
}

pub struct DetectionLoop {
    core: Arc<LoopCore>,
    running: Arc<AtomicBool>,
    generation: Arc<AtomicU64>,
    worker: Mutex<Option<JoinHandle<()>>>,
    poll_interval: Duration,
}

impl DetectionLoop {
    pub fn new(
        source: Arc<dyn FrameSource>,
        detector: SharedDetector,
        config: Arc<SharedConfig>,
        actuator: Arc<ActuationController>,
        snapshot: Arc<SnapshotCell>,
        evaluator: CrossingEvaluator,
    ) -> Self {
        Self {
            core: Arc::new(LoopCore {
                source,
                detector,
                config,
                actuator,
                snapshot,
                evaluator,
                last_seq: Mutex::new(None),
            }),
            running: Arc::new(AtomicBool::new(false)),
            generation: Arc::new(AtomicU64::new(0)),
            worker: Mutex::new(None),
            poll_interval: FRAME_POLL_INTERVAL,
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Start the background worker. No-op if already running.
    pub fn start(&self) -> Result<bool> {
        if self
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Ok(false);
        }
        let my_generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;

        let core = Arc::clone(&self.core);
        let running = Arc::clone(&self.running);
        let generation = Arc::clone(&self.generation);
        let poll = self.poll_interval;
        let spawned = std::thread::Builder::new()
            .name("detection".to_string())
            .spawn(move || {
                log::info!("detection started");
                while running.load(Ordering::SeqCst)
                    && generation.load(Ordering::SeqCst) == my_generation
                {
                    let step = panic::catch_unwind(AssertUnwindSafe(|| core.step()))
                        .unwrap_or_else(|payload| {
                            Err(anyhow!("detection step panicked: {}", panic_message(&*payload)))
                        });
                    match step {
                        Ok(StepOutcome::Processed(report)) => {
                            if report.crossings > 0 {
                                log::debug!(
                                    "frame {}: {} detections, {} crossings, {} accepted",
                                    report.frame_seq,
                                    report.detections,
                                    report.crossings,
                                    report.accepted
                                );
                            }
                        }
                        Ok(StepOutcome::NoFrame) => std::thread::sleep(poll),
                        Err(err) => {
                            log::warn!("detection iteration skipped: {:#}", err);
                            std::thread::sleep(poll);
                        }
                    }
                }
                log::info!("detection stopped");
            });

        let handle = match spawned {
            Ok(handle) => handle,
            Err(err) => {
                self.running.store(false, Ordering::SeqCst);
                return Err(err).context("spawn detection thread");
            }
        };
        let mut worker = self
            .worker
            .lock()
            .map_err(|_| anyhow!("detection worker lock poisoned"))?;
        // A previous worker that is still finishing its last iteration exits on its own.
        *worker = Some(handle);
        Ok(true)
    }

    /// Ask the worker to exit after its current iteration. Does not block.
    pub fn stop(&self) -> bool {
        self.running.swap(false, Ordering::SeqCst)
    }

    /// Stop and wait for the worker thread to exit.
    pub fn shutdown(&self) -> Result<()> {
        self.stop();
        let handle = self
            .worker
            .lock()
            .map_err(|_| anyhow!("detection worker lock poisoned"))?
            .take();
        if let Some(handle) = handle {
            handle
                .join()
                .map_err(|_| anyhow!("detection thread panicked"))?;
        }
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Run one perception cycle on the calling thread.
    pub fn step(&self) -> Result<StepOutcome> {
        self.core.step()
    }

    pub fn snapshot(&self) -> Arc<DetectionSnapshot> {
        self.core.snapshot.load()
    }

    pub fn actuator(&self) -> &Arc<ActuationController> {
        &self.core.actuator
    }

    pub fn config(&self) -> &Arc<SharedConfig> {
        &self.core.config
    }
}

impl Drop for DetectionLoop {
    fn drop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
    }
}

impl LoopCore {
    fn step(&self) -> Result<StepOutcome> {
        let Some(frame) = self.source.latest_frame() else {
            return Ok(StepOutcome::NoFrame);
        };
        let config = self.config.snapshot();
        let segment = config
            .line()
            .map(|line| line.to_pixels(frame.width, frame.height));

        let detections = {
            // a backend that panicked mid-frame is still usable for the next one
            let mut detector = match self.detector.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            {
                let mut last = match self.last_seq.lock() {
                    Ok(guard) => guard,
                    Err(poisoned) => poisoned.into_inner(),
                };
                if *last == Some(frame.seq) {
                    return Ok(StepOutcome::NoFrame);
                }
                // consumed even if detection fails; a bad frame is not retried
                *last = Some(frame.seq);
            }
            let name = detector.name();
            detector
                .detect(&frame)
                .with_context(|| format!("detector '{}' failed on frame {}", name, frame.seq))?
        };

        let mut report = StepReport {
            frame_seq: frame.seq,
            detections: detections.len(),
            ..StepReport::default()
        };

        if let Some(segment) = segment {
            for det in detections.iter().filter(|det| config.is_target(&det.label)) {
                let distance = self.evaluator.distance(&segment, &det.bbox);
                if distance >= self.evaluator.threshold_px() {
                    continue;
                }
                report.crossings += 1;
                let cause = format!("{} crossed line at {:.0}px", det.label, distance);
                match self.actuator.trigger(&cause, config.endpoint()) {
                    Ok(outcome) if outcome.is_accepted() => report.accepted += 1,
                    Ok(_) => {}
                    Err(err) => log::warn!("trigger failed ({}): {:#}", cause, err),
                }
            }
        }

        self.snapshot.publish(DetectionSnapshot {
            frame_seq: frame.seq,
            frame_width: frame.width,
            frame_height: frame.height,
            detections,
        });

        Ok(StepOutcome::Processed(report))
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        msg
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg
    } else {
        "non-string panic payload"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actuate::{ActuationTiming, RelayClient, RelayCommand, RelayEndpoint};
    use crate::config::RuntimeConfig;
    use crate::detect::{BoundingBox, Detection, StubBackend};
    use crate::frame::{Frame, FrameSlot};
    use crate::geometry::Line;

    #[derive(Default)]
    struct CountingRelay {
        sent: Mutex<Vec<RelayCommand>>,
    }

    impl RelayClient for CountingRelay {
        fn send(&self, _endpoint: &RelayEndpoint, command: RelayCommand) -> Result<()> {
            self.sent.lock().unwrap().push(command);
            Ok(())
        }
    }

    struct Rig {
        slot: Arc<FrameSlot>,
        relay: Arc<CountingRelay>,
        config: Arc<SharedConfig>,
        pipeline: DetectionLoop,
    }

    fn rig(detector: StubBackend, runtime: RuntimeConfig, cooldown_ms: u64) -> Rig {
        let slot = Arc::new(FrameSlot::new());
        let relay = Arc::new(CountingRelay::default());
        let config = Arc::new(SharedConfig::new(runtime));
        let actuator = Arc::new(ActuationController::new(
            ActuationTiming {
                cooldown: Duration::from_millis(cooldown_ms),
                hold: Duration::from_millis(20),
            },
            relay.clone(),
        ));
        let detector: SharedDetector = Arc::new(Mutex::new(detector));
        let pipeline = DetectionLoop::new(
            slot.clone(),
            detector,
            config.clone(),
            actuator,
            Arc::new(SnapshotCell::new()),
            CrossingEvaluator::default(),
        )
        .with_poll_interval(Duration::from_millis(2));
        Rig {
            slot,
            relay,
            config,
            pipeline,
        }
    }

    /// Horizontal line across the middle of a 640x480 frame (y = 240 px).
    fn mid_line() -> Option<Line> {
        Some(Line::new(0.0, 0.5, 1.0, 0.5))
    }

    /// Box whose bottom edge sits `dy` px below the mid line.
    fn object(label: &str, dy: f32) -> Detection {
        Detection::new(label, 0.9, BoundingBox::new(300.0, 140.0, 340.0, 240.0 + dy))
    }

    fn runtime(objects: &[&str]) -> RuntimeConfig {
        RuntimeConfig::new()
            .with_line(mid_line())
            .with_detect_objects(objects.iter().copied())
            .with_esp32_ip(Some("192.168.4.1".to_string()))
    }

    fn push_frame(rig: &Rig, seq: u64) {
        rig.slot.store(Frame::filled(640, 480, seq, [0, 0, 0]).unwrap()).unwrap();
    }

    fn processed(outcome: StepOutcome) -> StepReport {
        match outcome {
            StepOutcome::Processed(report) => report,
            StepOutcome::NoFrame => panic!("expected a processed frame"),
        }
    }

    #[test]
    fn no_frame_yet_is_reported() {
        let rig = rig(StubBackend::new(), runtime(&["cat"]), 0);
        assert_eq!(rig.pipeline.step().unwrap(), StepOutcome::NoFrame);
    }

    #[test]
    fn same_frame_is_not_processed_twice() {
        let rig = rig(StubBackend::new(), runtime(&["cat"]), 0);
        push_frame(&rig, 1);
        processed(rig.pipeline.step().unwrap());
        assert_eq!(rig.pipeline.step().unwrap(), StepOutcome::NoFrame);
        push_frame(&rig, 2);
        assert_eq!(processed(rig.pipeline.step().unwrap()).frame_seq, 2);
    }

    #[test]
    fn target_near_line_triggers() {
        let rig = rig(StubBackend::fixed(vec![object("cat", 10.0)]), runtime(&["cat"]), 0);
        push_frame(&rig, 1);
        let report = processed(rig.pipeline.step().unwrap());
        assert_eq!(report.crossings, 1);
        assert_eq!(report.accepted, 1);
        rig.pipeline.actuator().join_in_flight().unwrap();
        assert_eq!(
            *rig.relay.sent.lock().unwrap(),
            vec![RelayCommand::On, RelayCommand::Off]
        );
    }

    #[test]
    fn non_target_label_never_triggers() {
        let rig = rig(StubBackend::fixed(vec![object("dog", 0.0)]), runtime(&["cat"]), 0);
        push_frame(&rig, 1);
        let report = processed(rig.pipeline.step().unwrap());
        assert_eq!(report.detections, 1);
        assert_eq!(report.crossings, 0);
        assert_eq!(rig.pipeline.actuator().sequences_started(), 0);
        // still published for status consumers
        assert_eq!(rig.pipeline.snapshot().detections[0].label, "dog");
    }

    #[test]
    fn far_target_does_not_trigger() {
        let rig = rig(StubBackend::fixed(vec![object("cat", 60.0)]), runtime(&["cat"]), 0);
        push_frame(&rig, 1);
        assert_eq!(processed(rig.pipeline.step().unwrap()).crossings, 0);
    }

    #[test]
    fn empty_line_disables_crossing() {
        let runtime = runtime(&["cat"]).with_line(None);
        let rig = rig(StubBackend::fixed(vec![object("cat", 0.0)]), runtime, 0);
        for seq in 1..=5 {
            push_frame(&rig, seq);
            let report = processed(rig.pipeline.step().unwrap());
            assert_eq!(report.crossings, 0);
        }
        assert_eq!(rig.pipeline.actuator().sequences_started(), 0);
        assert_eq!(rig.pipeline.snapshot().detections.len(), 1);
    }

    #[test]
    fn two_crossings_in_one_frame_start_one_sequence() {
        let detector = StubBackend::fixed(vec![object("cat", 5.0), object("cat", -5.0)]);
        let rig = rig(detector, runtime(&["cat"]), 0);
        push_frame(&rig, 1);
        let report = processed(rig.pipeline.step().unwrap());
        assert_eq!(report.crossings, 2);
        assert_eq!(report.accepted, 1);
        rig.pipeline.actuator().join_in_flight().unwrap();
        assert_eq!(rig.relay.sent.lock().unwrap().len(), 2);
    }

    #[test]
    fn detector_error_propagates_and_next_frame_proceeds() {
        let detector = StubBackend::fixed(vec![object("cat", 60.0)]).failing_on(0);
        let rig = rig(detector, runtime(&["cat"]), 0);
        push_frame(&rig, 1);
        assert!(rig.pipeline.step().is_err());
        assert_eq!(rig.pipeline.step().unwrap(), StepOutcome::NoFrame);
        push_frame(&rig, 2);
        assert_eq!(processed(rig.pipeline.step().unwrap()).detections, 1);
    }

    #[test]
    fn reconfiguration_applies_on_next_iteration() {
        let rig = rig(StubBackend::fixed(vec![object("dog", 0.0)]), runtime(&["cat"]), 0);
        push_frame(&rig, 1);
        assert_eq!(processed(rig.pipeline.step().unwrap()).crossings, 0);
        rig.config.set_detect_objects(vec!["dog".to_string()]).unwrap();
        push_frame(&rig, 2);
        assert_eq!(processed(rig.pipeline.step().unwrap()).crossings, 1);
    }

    #[test]
    fn start_is_idempotent_and_stop_is_cooperative() {
        let rig = rig(StubBackend::new(), runtime(&["cat"]), 0);
        assert!(rig.pipeline.start().unwrap());
        assert!(!rig.pipeline.start().unwrap());
        assert!(rig.pipeline.is_running());
        push_frame(&rig, 1);
        wait_for(|| rig.pipeline.snapshot().frame_seq == 1);
        assert!(rig.pipeline.stop());
        assert!(!rig.pipeline.is_running());
        rig.pipeline.shutdown().unwrap();
    }

    #[test]
    fn restart_keeps_cooldown_state() {
        let rig = rig(
            StubBackend::fixed(vec![object("cat", 0.0)]),
            runtime(&["cat"]),
            60_000,
        );
        rig.pipeline.start().unwrap();
        push_frame(&rig, 1);
        wait_for(|| rig.pipeline.snapshot().frame_seq == 1);
        rig.pipeline.stop();
        rig.pipeline.start().unwrap();
        push_frame(&rig, 2);
        wait_for(|| rig.pipeline.snapshot().frame_seq == 2);
        rig.pipeline.shutdown().unwrap();
        rig.pipeline.actuator().join_in_flight().unwrap();
        assert_eq!(rig.pipeline.actuator().sequences_started(), 1);
    }

    #[test]
    fn stop_does_not_cancel_accepted_sequence() {
        let rig = rig(StubBackend::fixed(vec![object("cat", 0.0)]), runtime(&["cat"]), 0);
        rig.pipeline.start().unwrap();
        push_frame(&rig, 1);
        wait_for(|| rig.pipeline.actuator().sequences_started() == 1);
        rig.pipeline.shutdown().unwrap();
        rig.pipeline.actuator().join_in_flight().unwrap();
        assert_eq!(
            *rig.relay.sent.lock().unwrap(),
            vec![RelayCommand::On, RelayCommand::Off]
        );
    }

    /// Panics on its first call, then reports nothing.
    struct PanicsOnce {
        calls: usize,
    }

    impl crate::detect::ObjectDetector for PanicsOnce {
        fn name(&self) -> &'static str {
            "panics-once"
        }

        fn detect(&mut self, _frame: &Frame) -> Result<Vec<Detection>> {
            self.calls += 1;
            if self.calls == 1 {
                panic!("backend blew up");
            }
            Ok(Vec::new())
        }
    }

    #[test]
    fn detector_panic_does_not_kill_worker() {
        let slot = Arc::new(FrameSlot::new());
        let detector: SharedDetector = Arc::new(Mutex::new(PanicsOnce { calls: 0 }));
        let pipeline = DetectionLoop::new(
            slot.clone(),
            detector,
            Arc::new(SharedConfig::new(runtime(&["cat"]))),
            Arc::new(ActuationController::new(
                ActuationTiming {
                    cooldown: Duration::ZERO,
                    hold: Duration::from_millis(10),
                },
                Arc::new(CountingRelay::default()),
            )),
            Arc::new(SnapshotCell::new()),
            CrossingEvaluator::default(),
        )
        .with_poll_interval(Duration::from_millis(2));

        assert!(pipeline.start().unwrap());
        slot.store(Frame::filled(640, 480, 1, [0, 0, 0]).unwrap()).unwrap();
        std::thread::sleep(Duration::from_millis(30));
        slot.store(Frame::filled(640, 480, 2, [0, 0, 0]).unwrap()).unwrap();
        wait_for(|| pipeline.snapshot().frame_seq == 2);
        assert!(pipeline.is_running());

        assert!(pipeline.stop());
        pipeline.shutdown().unwrap();
        assert!(pipeline.start().unwrap());
        pipeline.shutdown().unwrap();
    }

    fn wait_for(cond: impl Fn() -> bool) {
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while !cond() {
            assert!(std::time::Instant::now() < deadline, "condition not met in time");
            std::thread::sleep(Duration::from_millis(2));
        }
    }
}
