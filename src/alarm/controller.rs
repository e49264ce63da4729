use std::sync::{
    atomic::{AtomicBool, AtomicU64, Ordering},
    Arc, Mutex,
};

use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use super::state::{AlarmPhase, AlarmState, AlarmTimings, Observation};

// Set to false to silence alarm transition logs
const ENABLE_LOGS: bool = true;

use crate::{log_debug, log_info};

/// Invoked exactly once per entry into `Alarming`.
pub type AlarmCallback = Arc<dyn Fn() + Send + Sync>;

/// What readers of the alarm see.
#[derive(Debug, Clone, Copy, Default, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct AlarmSnapshot {
    pub phase: AlarmPhase,
    pub detection_count: u64,
}

impl From<&AlarmState> for AlarmSnapshot {
    fn from(state: &AlarmState) -> Self {
        Self {
            phase: state.phase,
            detection_count: state.detection_count,
        }
    }
}

/// Single writer of [`AlarmState`]. Owns the alarm and cooldown timers and
/// publishes every change on a `watch` channel.
#[derive(Clone)]
pub struct AlarmController {
    inner: Arc<AlarmInner>,
}

struct AlarmInner {
    timings: AlarmTimings,
    state: Mutex<AlarmState>,
    armed: AtomicBool,
    // Bumped on every (re)schedule and forced reset; stale timers compare
    // against it before touching the state.
    generation: AtomicU64,
    timer: Mutex<Option<JoinHandle<()>>>,
    callback: Mutex<Option<AlarmCallback>>,
    tx: watch::Sender<AlarmSnapshot>,
}

impl AlarmController {
    pub fn new(timings: AlarmTimings) -> Self {
        let (tx, _) = watch::channel(AlarmSnapshot::default());
        Self {
            inner: Arc::new(AlarmInner {
                timings,
                state: Mutex::new(AlarmState::new()),
                armed: AtomicBool::new(false),
                generation: AtomicU64::new(0),
                timer: Mutex::new(None),
                callback: Mutex::new(None),
                tx,
            }),
        }
    }

    pub fn timings(&self) -> AlarmTimings {
        self.inner.timings
    }

    pub fn set_callback(&self, callback: AlarmCallback) {
        *self.inner.callback.lock().unwrap_or_else(|p| p.into_inner()) = Some(callback);
    }

    pub fn subscribe(&self) -> watch::Receiver<AlarmSnapshot> {
        self.inner.tx.subscribe()
    }

    pub fn snapshot(&self) -> AlarmSnapshot {
        *self.inner.tx.borrow()
    }

    pub fn phase(&self) -> AlarmPhase {
        self.snapshot().phase
    }

    /// Accept poll results. Until armed every result is ignored.
    pub fn arm(&self) {
        self.inner.armed.store(true, Ordering::SeqCst);
    }

    pub fn is_armed(&self) -> bool {
        self.inner.armed.load(Ordering::SeqCst)
    }

    /// Feeds one poll result into the state machine.
    pub fn observe(&self, matched: bool) -> Observation {
        if !self.is_armed() {
            return Observation::NoMatch;
        }

        let now = Instant::now();
        let (outcome, snapshot) = {
            let mut state = self.inner.lock_state();
            let outcome = state.observe(matched, now, &self.inner.timings);
            (outcome, AlarmSnapshot::from(&*state))
        };

        match outcome {
            Observation::Triggered => {
                self.schedule_timers();
                self.inner.tx.send_replace(snapshot);
                log_info!("alarm triggered (detection #{})", snapshot.detection_count);

                let callback = self
                    .inner
                    .callback
                    .lock()
                    .unwrap_or_else(|p| p.into_inner())
                    .clone();
                if let Some(callback) = callback {
                    callback();
                }
            }
            Observation::Suppressed => {
                log_debug!("match suppressed inside cooldown window");
            }
            Observation::NoMatch => {}
        }

        outcome
    }

    /// Camera stop or facing switch: disarm, cancel pending timers and
    /// return to `Idle`. The counter is untouched.
    pub fn force_idle(&self) {
        self.inner.armed.store(false, Ordering::SeqCst);
        self.inner.generation.fetch_add(1, Ordering::SeqCst);
        self.inner.abort_timer();

        let snapshot = {
            let mut state = self.inner.lock_state();
            let was = state.phase;
            state.force_idle();
            if was != AlarmPhase::Idle {
                log_info!("alarm forced idle from {:?}", was);
            }
            AlarmSnapshot::from(&*state)
        };
        self.inner.tx.send_replace(snapshot);
    }

    /// New camera session: counter and cooldown anchor start over.
    pub fn reset_session(&self) {
        self.force_idle();
        let snapshot = {
            let mut state = self.inner.lock_state();
            state.reset_session();
            AlarmSnapshot::from(&*state)
        };
        self.inner.tx.send_replace(snapshot);
    }

    fn schedule_timers(&self) {
        let generation = self.inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let inner = Arc::clone(&self.inner);

        let handle = tokio::spawn(async move {
            let timings = inner.timings;
            let Some(alarm_deadline) = inner.lock_state().alarm_deadline(&timings) else {
                return;
            };
            tokio::time::sleep_until(alarm_deadline).await;

            let cooldown_deadline = {
                let mut state = inner.lock_state();
                if inner.generation.load(Ordering::SeqCst) != generation {
                    return;
                }
                state.on_alarm_elapsed();
                state.on_cooldown_elapsed(Instant::now(), &timings);
                inner.tx.send_replace(AlarmSnapshot::from(&*state));
                match state.phase {
                    AlarmPhase::Cooldown => state.cooldown_deadline(&timings),
                    _ => None,
                }
            };

            let Some(deadline) = cooldown_deadline else {
                return;
            };
            tokio::time::sleep_until(deadline).await;

            let mut state = inner.lock_state();
            if inner.generation.load(Ordering::SeqCst) != generation {
                return;
            }
            if state.on_cooldown_elapsed(Instant::now(), &timings) {
                inner.tx.send_replace(AlarmSnapshot::from(&*state));
            }
        });

        let previous = self
            .inner
            .timer
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .replace(handle);
        if let Some(previous) = previous {
            previous.abort();
        }
    }
}

impl AlarmInner {
    fn lock_state(&self) -> std::sync::MutexGuard<'_, AlarmState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn abort_timer(&self) {
        if let Some(handle) = self.timer.lock().unwrap_or_else(|p| p.into_inner()).take() {
            handle.abort();
        }
    }
}
