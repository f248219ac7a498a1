//! Relay actuation.
//!
//! `ActuationController` turns crossing events into at most one
//! ON → hold → OFF sequence per cooldown window. The decision to accept a
//! request is made by `TriggerGate` under a single lock, so simultaneous
//! requests (two objects crossing in one frame, or a manual test racing the
//! loop) cannot both start a sequence. The accepted sequence runs on its own
//! thread; callers never wait for the hold.

mod gate;
mod relay;

pub use gate::{Phase, TriggerDecision, TriggerGate};
pub use relay::{HttpRelay, RelayClient, RelayCommand, RelayEndpoint, RELAY_TIMEOUT};

use anyhow::{anyhow, Context, Result};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

pub const DEFAULT_COOLDOWN: Duration = Duration::from_secs(10);
pub const DEFAULT_HOLD: Duration = Duration::from_secs(5);

/// What happened to a trigger request.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerOutcome {
    /// A relay sequence is now running.
    Started,
    /// Accepted, but no endpoint is configured; cooldown was still stamped.
    NoEndpoint,
    /// Dropped: a sequence is already in flight.
    Busy,
    /// Dropped: the cooldown since the last accepted request has not elapsed.
    CoolingDown,
}

impl TriggerOutcome {
    pub fn is_accepted(self) -> bool {
        matches!(self, TriggerOutcome::Started | TriggerOutcome::NoEndpoint)
    }
}

/// Cooldown/hold timing for the relay.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ActuationTiming {
    pub cooldown: Duration,
    pub hold: Duration,
}

impl Default for ActuationTiming {
    fn default() -> Self {
        Self {
            cooldown: DEFAULT_COOLDOWN,
            hold: DEFAULT_HOLD,
        }
    }
}

pub struct ActuationController {
    gate: Arc<Mutex<TriggerGate>>,
    hold: Duration,
    relay: Arc<dyn RelayClient>,
    in_flight: Mutex<Option<JoinHandle<()>>>,
    sequences: AtomicU64,
}

impl ActuationController {
    pub fn new(timing: ActuationTiming, relay: Arc<dyn RelayClient>) -> Self {
        Self {
            gate: Arc::new(Mutex::new(TriggerGate::new(timing.cooldown))),
            hold: timing.hold,
            relay,
            in_flight: Mutex::new(None),
            sequences: AtomicU64::new(0),
        }
    }

    /// Controller talking to a real relay over HTTP.
    pub fn with_http_relay(timing: ActuationTiming) -> Self {
        Self::new(timing, Arc::new(HttpRelay::new()))
    }

    /// Request one relay sequence.
    ///
    /// Returns as soon as the request is accepted or dropped. `endpoint` is the
    /// relay captured by the caller; an accepted sequence uses it to the end
    /// even if configuration changes meanwhile.
    pub fn trigger(&self, cause: &str, endpoint: Option<&RelayEndpoint>) -> Result<TriggerOutcome> {
        let mut gate = self
            .gate
            .lock()
            .map_err(|_| anyhow!("trigger gate lock poisoned"))?;

        match gate.try_begin(Instant::now()) {
            TriggerDecision::Accepted => {}
            TriggerDecision::Busy => {
                log::debug!("trigger dropped ({}): relay sequence in flight", cause);
                return Ok(TriggerOutcome::Busy);
            }
            TriggerDecision::CoolingDown { remaining } => {
                log::debug!(
                    "trigger dropped ({}): cooling down, {:.1}s left",
                    cause,
                    remaining.as_secs_f32()
                );
                return Ok(TriggerOutcome::CoolingDown);
            }
        }

        let Some(endpoint) = endpoint.cloned() else {
            gate.finish();
            log::warn!(
                "trigger accepted ({}) but no actuator endpoint is configured",
                cause
            );
            return Ok(TriggerOutcome::NoEndpoint);
        };

        log::info!("trigger accepted ({}): spraying via {}", cause, endpoint);
        let sequence = Sequence {
            gate: Arc::clone(&self.gate),
            relay: Arc::clone(&self.relay),
            endpoint,
            hold: self.hold,
        };
        let spawned = std::thread::Builder::new()
            .name("actuation".to_string())
            .spawn(move || sequence.run());
        let handle = match spawned {
            Ok(handle) => handle,
            Err(err) => {
                gate.finish();
                return Err(err).context("spawn actuation thread");
            }
        };

        self.sequences.fetch_add(1, Ordering::SeqCst);
        // Stored while the gate is still held, so a later sequence cannot be overwritten.
        let mut slot = self
            .in_flight
            .lock()
            .map_err(|_| anyhow!("in-flight slot lock poisoned"))?;
        *slot = Some(handle);
        Ok(TriggerOutcome::Started)
    }

    /// Block until the current sequence (if any) has sent its OFF command.
    pub fn join_in_flight(&self) -> Result<()> {
        let handle = self
            .in_flight
            .lock()
            .map_err(|_| anyhow!("in-flight slot lock poisoned"))?
            .take();
        if let Some(handle) = handle {
            handle
                .join()
                .map_err(|_| anyhow!("actuation thread panicked"))?;
        }
        Ok(())
    }

    pub fn phase(&self) -> Phase {
        match self.gate.lock() {
            Ok(gate) => gate.phase(),
            Err(poisoned) => poisoned.into_inner().phase(),
        }
    }

    pub fn is_idle(&self) -> bool {
        self.phase() == Phase::Idle
    }

    /// Number of relay sequences started since construction.
    pub fn sequences_started(&self) -> u64 {
        self.sequences.load(Ordering::SeqCst)
    }
}

/// One accepted ON → hold → OFF run, executed on the actuation thread.
struct Sequence {
    gate: Arc<Mutex<TriggerGate>>,
    relay: Arc<dyn RelayClient>,
    endpoint: RelayEndpoint,
    hold: Duration,
}

impl Sequence {
    fn run(self) {
        // Returns the gate to Idle however this function exits.
        let _release = GateRelease(Arc::clone(&self.gate));

        self.set_phase(Phase::Activating);
        match self.relay.send(&self.endpoint, RelayCommand::On) {
            Ok(()) => log::info!("relay on ({})", self.endpoint),
            Err(err) => log::warn!("relay on failed ({}): {:#}", self.endpoint, err),
        }

        self.set_phase(Phase::Holding);
        std::thread::sleep(self.hold);

        self.set_phase(Phase::Deactivating);
        match self.relay.send(&self.endpoint, RelayCommand::Off) {
            Ok(()) => log::info!("relay off ({})", self.endpoint),
            Err(err) => log::warn!("relay off failed ({}): {:#}", self.endpoint, err),
        }
    }

    fn set_phase(&self, phase: Phase) {
        match self.gate.lock() {
            Ok(mut gate) => gate.advance(phase),
            Err(poisoned) => poisoned.into_inner().advance(phase),
        }
    }
}

struct GateRelease(Arc<Mutex<TriggerGate>>);

impl Drop for GateRelease {
    fn drop(&mut self) {
        match self.0.lock() {
            Ok(mut gate) => gate.finish(),
            Err(poisoned) => poisoned.into_inner().finish(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Barrier;
    use std::thread;

    #[derive(Default)]
    struct RecordingRelay {
        sent: Mutex<Vec<(String, RelayCommand)>>,
        fail_on: bool,
    }

    impl RecordingRelay {
        fn commands(&self) -> Vec<RelayCommand> {
            self.sent.lock().unwrap().iter().map(|(_, c)| *c).collect()
        }
    }

    impl RelayClient for RecordingRelay {
        fn send(&self, endpoint: &RelayEndpoint, command: RelayCommand) -> Result<()> {
            self.sent
                .lock()
                .unwrap()
                .push((endpoint.host().to_string(), command));
            if self.fail_on && command == RelayCommand::On {
                return Err(anyhow!("connection refused"));
            }
            Ok(())
        }
    }

    fn timing(cooldown_ms: u64, hold_ms: u64) -> ActuationTiming {
        ActuationTiming {
            cooldown: Duration::from_millis(cooldown_ms),
            hold: Duration::from_millis(hold_ms),
        }
    }

    fn endpoint() -> RelayEndpoint {
        RelayEndpoint::parse("192.168.4.1").unwrap()
    }

    #[test]
    fn sequence_sends_on_then_off_and_holds() {
        let relay = Arc::new(RecordingRelay::default());
        let ctl = ActuationController::new(timing(0, 80), relay.clone());
        let started = Instant::now();

        assert_eq!(ctl.trigger("cat", Some(&endpoint())).unwrap(), TriggerOutcome::Started);
        assert!(!ctl.is_idle());
        ctl.join_in_flight().unwrap();

        assert!(started.elapsed() >= Duration::from_millis(80));
        assert!(ctl.is_idle());
        assert_eq!(relay.commands(), vec![RelayCommand::On, RelayCommand::Off]);
    }

    #[test]
    fn off_is_sent_even_when_on_fails() {
        let relay = Arc::new(RecordingRelay {
            fail_on: true,
            ..RecordingRelay::default()
        });
        let ctl = ActuationController::new(timing(0, 10), relay.clone());
        ctl.trigger("cat", Some(&endpoint())).unwrap();
        ctl.join_in_flight().unwrap();
        assert_eq!(relay.commands(), vec![RelayCommand::On, RelayCommand::Off]);
        assert!(ctl.is_idle());
    }

    #[test]
    fn busy_then_cooling_down_then_accepted() {
        let relay = Arc::new(RecordingRelay::default());
        let ctl = ActuationController::new(timing(300, 50), relay.clone());

        assert_eq!(ctl.trigger("a", Some(&endpoint())).unwrap(), TriggerOutcome::Started);
        assert_eq!(ctl.trigger("b", Some(&endpoint())).unwrap(), TriggerOutcome::Busy);
        ctl.join_in_flight().unwrap();
        assert_eq!(ctl.trigger("c", Some(&endpoint())).unwrap(), TriggerOutcome::CoolingDown);

        thread::sleep(Duration::from_millis(320));
        assert_eq!(ctl.trigger("d", Some(&endpoint())).unwrap(), TriggerOutcome::Started);
        ctl.join_in_flight().unwrap();

        assert_eq!(ctl.sequences_started(), 2);
        assert_eq!(relay.commands().len(), 4);
    }

    #[test]
    fn missing_endpoint_still_stamps_cooldown() {
        let relay = Arc::new(RecordingRelay::default());
        let ctl = ActuationController::new(timing(60_000, 10), relay.clone());

        assert_eq!(ctl.trigger("cat", None).unwrap(), TriggerOutcome::NoEndpoint);
        assert!(ctl.is_idle());
        assert_eq!(
            ctl.trigger("cat", Some(&endpoint())).unwrap(),
            TriggerOutcome::CoolingDown
        );
        assert!(relay.commands().is_empty());
        assert_eq!(ctl.sequences_started(), 0);
    }

    #[test]
    fn simultaneous_requests_start_one_sequence() {
        let relay = Arc::new(RecordingRelay::default());
        let ctl = Arc::new(ActuationController::new(timing(0, 100), relay.clone()));
        let barrier = Arc::new(Barrier::new(8));

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let ctl = Arc::clone(&ctl);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    ctl.trigger(&format!("req{}", i), Some(&endpoint())).unwrap()
                })
            })
            .collect();
        let outcomes: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        ctl.join_in_flight().unwrap();

        assert_eq!(outcomes.iter().filter(|o| o.is_accepted()).count(), 1);
        assert_eq!(relay.commands(), vec![RelayCommand::On, RelayCommand::Off]);
    }

    #[test]
    fn in_flight_sequence_keeps_its_endpoint() {
        let relay = Arc::new(RecordingRelay::default());
        let ctl = ActuationController::new(timing(0, 30), relay.clone());
        let mut current = RelayEndpoint::parse("10.0.0.1").unwrap();
        ctl.trigger("cat", Some(&current)).unwrap();
        current = RelayEndpoint::parse("10.0.0.2").unwrap();
        ctl.join_in_flight().unwrap();

        let hosts: Vec<String> = relay.sent.lock().unwrap().iter().map(|(h, _)| h.clone()).collect();
        assert_eq!(hosts, vec!["10.0.0.1", "10.0.0.1"]);
        assert_eq!(current.host(), "10.0.0.2");
    }
}
