use serde::Serialize;
use std::time::{Duration, Instant};

/// Where the relay sequence currently is.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Idle,
    /// ON command being sent.
    Activating,
    Holding,
    /// OFF command being sent.
    Deactivating,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TriggerDecision {
    Accepted,
    Busy,
    CoolingDown { remaining: Duration },
}

/// Cooldown/phase bookkeeping with no clock or I/O of its own.
///
/// Cooldown is measured from the instant the previous request was accepted.
/// A request is accepted only from `Idle`, and acceptance leaves `Idle` in the
/// same call, so holding the gate's lock across `try_begin` is enough to make
/// the check-and-transition atomic.
#[derive(Clone, Debug)]
pub struct TriggerGate {
    cooldown: Duration,
    phase: Phase,
    anchor: Option<Instant>,
}

impl TriggerGate {
    pub fn new(cooldown: Duration) -> Self {
        Self {
            cooldown,
            phase: Phase::Idle,
            anchor: None,
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Instant of the last accepted request.
    pub fn anchor(&self) -> Option<Instant> {
        self.anchor
    }

    pub fn try_begin(&mut self, now: Instant) -> TriggerDecision {
        if self.phase != Phase::Idle {
            return TriggerDecision::Busy;
        }
        if let Some(anchor) = self.anchor {
            let elapsed = now.saturating_duration_since(anchor);
            if elapsed <= self.cooldown && !self.cooldown.is_zero() {
                return TriggerDecision::CoolingDown {
                    remaining: self.cooldown - elapsed,
                };
            }
        }
        self.anchor = Some(now);
        self.phase = Phase::Activating;
        TriggerDecision::Accepted
    }

    /// Move an in-flight sequence to its next phase. Ignored while idle.
    pub fn advance(&mut self, phase: Phase) {
        if self.phase != Phase::Idle && phase != Phase::Idle {
            self.phase = phase;
        }
    }

    /// End the current sequence. The cooldown anchor is left untouched.
    pub fn finish(&mut self) {
        self.phase = Phase::Idle;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const S: fn(u64) -> Duration = Duration::from_secs;

    #[test]
    fn cooldown_ten_hold_five_timeline() {
        let t0 = Instant::now();
        let mut gate = TriggerGate::new(S(10));

        assert_eq!(gate.try_begin(t0), TriggerDecision::Accepted);
        assert_eq!(gate.phase(), Phase::Activating);
        gate.advance(Phase::Holding);

        // t=3: still holding
        assert_eq!(gate.try_begin(t0 + S(3)), TriggerDecision::Busy);

        // t=5: hold over
        gate.advance(Phase::Deactivating);
        gate.finish();
        assert_eq!(gate.phase(), Phase::Idle);

        // t=6: idle but inside the cooldown window
        assert_eq!(
            gate.try_begin(t0 + S(6)),
            TriggerDecision::CoolingDown { remaining: S(4) }
        );

        // t=11: accepted, and the anchor moves
        assert_eq!(gate.try_begin(t0 + S(11)), TriggerDecision::Accepted);
        assert_eq!(gate.anchor(), Some(t0 + S(11)));
    }

    #[test]
    fn rejected_requests_do_not_move_the_anchor() {
        let t0 = Instant::now();
        let mut gate = TriggerGate::new(S(10));
        gate.try_begin(t0);
        gate.finish();
        gate.try_begin(t0 + S(9));
        assert_eq!(gate.anchor(), Some(t0));
        assert_eq!(gate.try_begin(t0 + S(10) + Duration::from_millis(1)), TriggerDecision::Accepted);
    }

    #[test]
    fn cooldown_boundary_is_exclusive() {
        let t0 = Instant::now();
        let mut gate = TriggerGate::new(S(10));
        gate.try_begin(t0);
        gate.finish();
        assert!(matches!(
            gate.try_begin(t0 + S(10)),
            TriggerDecision::CoolingDown { .. }
        ));
    }

    #[test]
    fn zero_cooldown_only_gates_on_phase() {
        let t0 = Instant::now();
        let mut gate = TriggerGate::new(Duration::ZERO);
        assert_eq!(gate.try_begin(t0), TriggerDecision::Accepted);
        assert_eq!(gate.try_begin(t0), TriggerDecision::Busy);
        gate.finish();
        assert_eq!(gate.try_begin(t0), TriggerDecision::Accepted);
    }

    #[test]
    fn advance_is_ignored_while_idle() {
        let mut gate = TriggerGate::new(S(1));
        gate.advance(Phase::Holding);
        assert_eq!(gate.phase(), Phase::Idle);
    }
}
