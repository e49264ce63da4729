use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum AlarmPhase {
    Idle,
    Alarming,
    Cooldown,
}

impl Default for AlarmPhase {
    fn default() -> Self {
        AlarmPhase::Idle
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AlarmTimings {
    pub alarm_duration: Duration,
    /// Measured from the last alarm entry, not from the end of the alarm.
    pub cooldown_period: Duration,
}

impl Default for AlarmTimings {
    fn default() -> Self {
        Self {
            alarm_duration: Duration::from_millis(5000),
            cooldown_period: Duration::from_millis(3000),
        }
    }
}

/// What a single poll result did to the state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Observation {
    NoMatch,
    /// A new alarm entry; `detection_count` was incremented.
    Triggered,
    /// A match inside the cooldown window; nothing changed.
    Suppressed,
}

/// Debounced alarm state. Transition functions take `now` explicitly so the
/// same code drives both the timer-backed controller and direct tests.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AlarmState {
    pub phase: AlarmPhase,
    pub last_alarm_at: Option<Instant>,
    pub detection_count: u64,
}

impl AlarmState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cooldown_elapsed(&self, now: Instant, timings: &AlarmTimings) -> bool {
        self.last_alarm_at
            .map(|at| now.saturating_duration_since(at) >= timings.cooldown_period)
            .unwrap_or(true)
    }

    pub fn alarm_deadline(&self, timings: &AlarmTimings) -> Option<Instant> {
        self.last_alarm_at.map(|at| at + timings.alarm_duration)
    }

    pub fn cooldown_deadline(&self, timings: &AlarmTimings) -> Option<Instant> {
        self.last_alarm_at.map(|at| at + timings.cooldown_period)
    }

    /// Applies one poll result. A match enters `Alarming` whenever the
    /// cooldown anchored at the previous entry has run out, including a
    /// re-entry while the previous alarm is still showing.
    pub fn observe(&mut self, matched: bool, now: Instant, timings: &AlarmTimings) -> Observation {
        if !matched {
            return Observation::NoMatch;
        }

        if !self.cooldown_elapsed(now, timings) {
            return Observation::Suppressed;
        }

        self.phase = AlarmPhase::Alarming;
        self.last_alarm_at = Some(now);
        self.detection_count += 1;
        Observation::Triggered
    }

    /// `Alarming → Cooldown`. Returns whether the phase changed.
    pub fn on_alarm_elapsed(&mut self) -> bool {
        if self.phase != AlarmPhase::Alarming {
            return false;
        }
        self.phase = AlarmPhase::Cooldown;
        true
    }

    /// `Cooldown → Idle` once the cooldown window has run out.
    pub fn on_cooldown_elapsed(&mut self, now: Instant, timings: &AlarmTimings) -> bool {
        if self.phase != AlarmPhase::Cooldown || !self.cooldown_elapsed(now, timings) {
            return false;
        }
        self.phase = AlarmPhase::Idle;
        true
    }

    /// Forced return to `Idle` when the camera stops or switches. The
    /// counter and the cooldown anchor are left alone.
    pub fn force_idle(&mut self) {
        self.phase = AlarmPhase::Idle;
    }

    /// Fresh camera session: counter back to zero, no cooldown carried over.
    pub fn reset_session(&mut self) {
        *self = Self::default();
    }
}
