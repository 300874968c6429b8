//! Jog test orchestration
//!
//! Runs a timed sequence of alternating-direction jog moves and measures how
//! quickly the controller returns to `Idle` after each one. Cadence is
//! self-paced: the next jog is issued only after a Jog → Idle transition is
//! observed (plus a short settling delay), never on a fixed interval, so the
//! measured jog-to-idle time reflects true controller responsiveness rather
//! than an artifact of the poll interval.
//!
//! The orchestrator itself is timer-free; the session event loop feeds it
//! snapshots and clock readings and executes the actions it emits, which is
//! what makes the pacing rules unit-testable with synthetic time.

use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::protocol::{MachineState, MachineStateSnapshot, JOG_SETTLE_DELAY_MS};

/// Parameters for one jog test run.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct JogTestParams {
    /// Wall-clock deadline for the whole run.
    pub duration: Duration,
    /// Relative move distance per jog, mm. Direction alternates each jog, so
    /// net displacement stays bounded near zero.
    pub distance_mm: f64,
    /// Jog feed rate, mm/min.
    pub feed_rate: f64,
}

/// One observed Jog → Idle transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JogTransition {
    /// State before the transition.
    pub from: MachineState,
    /// State after the transition.
    pub to: MachineState,
    /// Time from jog issue to the idle observation, ms.
    pub elapsed_ms: f64,
}

/// Terminal report for a finished (or cancelled) run. Partial data is
/// reported, never discarded: a deadline reached mid-jog still produces a
/// report with whatever transitions were captured.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JogTestReport {
    /// Jog commands issued during the run.
    pub jog_count: u32,
    /// Mean jog-to-idle time over the captured transitions, ms.
    pub average_jog_to_idle_ms: f64,
    /// Worst jog-to-idle time, ms.
    pub max_jog_to_idle_ms: f64,
    /// Every captured transition, in order.
    pub transitions: Vec<JogTransition>,
    /// Total state transitions observed, including ones that were not
    /// jog completions.
    pub state_transitions_observed: u64,
    /// When the run started.
    pub started_at: DateTime<Utc>,
    /// How long the run actually lasted.
    pub elapsed: Duration,
    /// True when the run was cancelled externally rather than stopped by its
    /// deadline.
    pub cancelled: bool,
}

/// What the session loop must do next on behalf of the orchestrator.
#[derive(Debug, Clone, PartialEq)]
pub enum JogAction {
    /// Submit this jog command and write it to the transport.
    SendJog(String),
    /// The run is over; deliver the report and resume the heartbeat.
    Finish(JogTestReport),
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Phase {
    /// Jog issued, waiting to observe the machine go Jog → Idle.
    AwaitingJogCompletion,
    /// Transition observed; holding for the settle delay before the next jog.
    Settling { until: Instant },
}

/// State machine for a single jog test run.
#[derive(Debug)]
pub struct JogTest {
    params: JogTestParams,
    phase: Phase,
    started_at: DateTime<Utc>,
    started_instant: Instant,
    /// Reference point for the current jog's completion latency.
    last_transition_at: Instant,
    jog_count: u32,
    transitions: Vec<JogTransition>,
    state_transitions_observed: u64,
    previous_state: Option<MachineState>,
    settle_delay: Duration,
}

impl JogTest {
    /// Start a run. Returns the machine and the first jog to issue.
    pub fn start(params: JogTestParams, now: Instant) -> (JogTest, JogAction) {
        let mut test = JogTest {
            params,
            phase: Phase::AwaitingJogCompletion,
            started_at: Utc::now(),
            started_instant: now,
            last_transition_at: now,
            jog_count: 0,
            transitions: Vec::new(),
            state_transitions_observed: 0,
            previous_state: None,
            settle_delay: Duration::from_millis(JOG_SETTLE_DELAY_MS),
        };
        let first = test.issue_jog(now);
        (test, first)
    }

    /// Whether the wall-clock deadline has passed.
    pub fn deadline_reached(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.started_instant) >= self.params.duration
    }

    /// The pending settle deadline, when one is armed.
    pub fn settle_deadline(&self) -> Option<Instant> {
        match self.phase {
            Phase::Settling { until } => Some(until),
            Phase::AwaitingJogCompletion => None,
        }
    }

    /// Feed one machine-state snapshot.
    ///
    /// A Jog → Idle transition while awaiting completion records the jog's
    /// latency and arms the settle delay. All other transitions are counted
    /// but do not pace the run.
    pub fn observe(&mut self, snapshot: &MachineStateSnapshot, now: Instant) {
        let previous = self.previous_state.replace(snapshot.state.clone());
        let Some(previous) = previous else {
            return;
        };
        if previous == snapshot.state {
            return;
        }
        self.state_transitions_observed += 1;

        let jog_completed = previous == MachineState::Jog && snapshot.state == MachineState::Idle;
        if jog_completed && self.phase == Phase::AwaitingJogCompletion {
            let elapsed = now.saturating_duration_since(self.last_transition_at);
            self.transitions.push(JogTransition {
                from: previous,
                to: snapshot.state.clone(),
                elapsed_ms: elapsed.as_secs_f64() * 1000.0,
            });
            self.phase = Phase::Settling {
                until: now + self.settle_delay,
            };
        }
    }

    /// Called when the armed settle delay elapses: either the deadline has
    /// passed and the run finishes, or the next jog goes out.
    pub fn on_settle_elapsed(&mut self, now: Instant) -> JogAction {
        if self.deadline_reached(now) {
            return JogAction::Finish(self.build_report(now, false));
        }
        self.issue_jog(now)
    }

    /// Called on every 50 ms poll tick. Returns the terminal report once the
    /// deadline passes, even mid-jog.
    pub fn on_poll_tick(&mut self, now: Instant) -> Option<JogTestReport> {
        if self.deadline_reached(now) {
            return Some(self.build_report(now, false));
        }
        None
    }

    /// External cancellation; identical cleanup to a deadline stop.
    pub fn cancel(&mut self, now: Instant) -> JogTestReport {
        self.build_report(now, true)
    }

    fn issue_jog(&mut self, now: Instant) -> JogAction {
        self.jog_count += 1;
        // Odd jogs move positive, even jogs move back.
        let distance = if self.jog_count % 2 == 1 {
            self.params.distance_mm
        } else {
            -self.params.distance_mm
        };
        self.last_transition_at = now;
        self.phase = Phase::AwaitingJogCompletion;
        JogAction::SendJog(format!(
            "$J=G91 G21 X{:.3} F{:.0}",
            distance, self.params.feed_rate
        ))
    }

    fn build_report(&self, now: Instant, cancelled: bool) -> JogTestReport {
        let count = self.transitions.len();
        let (sum, max) = self
            .transitions
            .iter()
            .fold((0.0_f64, 0.0_f64), |(sum, max), t| {
                (sum + t.elapsed_ms, max.max(t.elapsed_ms))
            });
        JogTestReport {
            jog_count: self.jog_count,
            average_jog_to_idle_ms: if count > 0 { sum / count as f64 } else { 0.0 },
            max_jog_to_idle_ms: max,
            transitions: self.transitions.clone(),
            state_transitions_observed: self.state_transitions_observed,
            started_at: self.started_at,
            elapsed: now.saturating_duration_since(self.started_instant),
            cancelled,
        }
    }
}
