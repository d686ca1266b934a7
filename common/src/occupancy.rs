//! Occupancy state machine.
//!
//! `tick` runs once per control period and performs at most one
//! transition. Entry actions are edge-triggered: they fire on the first
//! tick that starts in a state different from the one the previous tick
//! started in, so a transition's entry action runs one tick later, on the
//! same tick that first evaluates the new state's exit conditions.
//!
//! | state    | on entry     | exit                                        |
//! |----------|--------------|---------------------------------------------|
//! | INIT     |              | always, to the configured initial state     |
//! | OFF      | disable heat | none                                        |
//! | IDLE     | disable heat | recent motion -> TRACKING                   |
//! | TRACKING | enable heat  | motion no longer recent -> IDLE, else       |
//! |          |              | time in state > min activity -> ACTIVE      |
//! | PREWARM  | enable heat  | time in state > prewarm -> ACTIVE           |
//! | ACTIVE   | enable heat  | time since last motion > max idle -> IDLE   |
//! | LOCKED   |              | none                                        |

use std::{sync::Arc, time::Duration};

use tracing::{debug, info, warn, Span};

use crate::{
    config::{duration_ms, format_duration, ControlConfig},
    motion::MotionTracker,
    outlet::{OutletSwitch, Transmitter},
    thermostat::HeatFlag,
    types::{OccupancyState, OccupancyStatus},
};

const RETRY_BACKOFF_MIN_MS: u64 = 1_000;
const RETRY_BACKOFF_MAX_MS: u64 = 60_000;

/// What the occupancy machine drives when it wants heat.
pub trait HeatControl {
    fn enable_heat(&mut self, now_ms: u64);
    fn disable_heat(&mut self, now_ms: u64);

    /// Called every tick so implementations can retry pending commands.
    fn reconcile(&mut self, _now_ms: u64) {}

    /// Unconditional heat off. Called once when the controller stops.
    fn shutdown(&mut self, now_ms: u64);

    /// Logical outlet state when this control owns the outlet.
    fn outlet_on(&self) -> Option<bool> {
        None
    }
}

impl<H: HeatControl + ?Sized> HeatControl for Box<H> {
    fn enable_heat(&mut self, now_ms: u64) {
        (**self).enable_heat(now_ms);
    }

    fn disable_heat(&mut self, now_ms: u64) {
        (**self).disable_heat(now_ms);
    }

    fn reconcile(&mut self, now_ms: u64) {
        (**self).reconcile(now_ms);
    }

    fn shutdown(&mut self, now_ms: u64) {
        (**self).shutdown(now_ms);
    }

    fn outlet_on(&self) -> Option<bool> {
        (**self).outlet_on()
    }
}

/// Thermostat variant: heat requests only toggle the shared flag.
impl HeatControl for HeatFlag {
    fn enable_heat(&mut self, _now_ms: u64) {
        info!("thermostat active");
        self.set(true);
    }

    fn disable_heat(&mut self, _now_ms: u64) {
        info!("thermostat inactive");
        self.set(false);
    }

    fn shutdown(&mut self, now_ms: u64) {
        self.disable_heat(now_ms);
    }
}

/// Switch-only variant: the occupancy machine owns the outlet. Commands
/// that fail to transmit stay pending and are retried with backoff.
pub struct DirectOutlet<T> {
    outlet: OutletSwitch<T>,
    pending: Option<bool>,
    next_retry_ms: u64,
    backoff_ms: u64,
}

impl<T: Transmitter> DirectOutlet<T> {
    pub fn new(outlet: OutletSwitch<T>) -> Self {
        Self {
            outlet,
            pending: None,
            next_retry_ms: 0,
            backoff_ms: RETRY_BACKOFF_MIN_MS,
        }
    }

    pub fn outlet(&self) -> &OutletSwitch<T> {
        &self.outlet
    }

    pub fn pending(&self) -> Option<bool> {
        self.pending
    }

    fn request(&mut self, on: bool, now_ms: u64) {
        if self.outlet.is_on() == on {
            self.pending = None;
            return;
        }
        self.pending = Some(on);
        self.backoff_ms = RETRY_BACKOFF_MIN_MS;
        self.attempt(now_ms);
    }

    fn attempt(&mut self, now_ms: u64) {
        let Some(on) = self.pending else {
            return;
        };
        match self.outlet.set(on) {
            Ok(()) => {
                self.pending = None;
                self.backoff_ms = RETRY_BACKOFF_MIN_MS;
            }
            Err(_) => {
                self.next_retry_ms = now_ms.saturating_add(self.backoff_ms);
                debug!(retry_in_ms = self.backoff_ms, "outlet command pending");
                self.backoff_ms = (self.backoff_ms * 2).min(RETRY_BACKOFF_MAX_MS);
            }
        }
    }
}

impl<T: Transmitter> HeatControl for DirectOutlet<T> {
    fn enable_heat(&mut self, now_ms: u64) {
        info!("heat on");
        self.request(true, now_ms);
    }

    fn disable_heat(&mut self, now_ms: u64) {
        info!("heat off");
        self.request(false, now_ms);
    }

    fn reconcile(&mut self, now_ms: u64) {
        if self.pending.is_some() && now_ms >= self.next_retry_ms {
            self.attempt(now_ms);
        }
    }

    fn shutdown(&mut self, _now_ms: u64) {
        self.pending = None;
        // Failures are logged by the switch.
        let _ = self.outlet.force_off();
    }

    fn outlet_on(&self) -> Option<bool> {
        Some(self.outlet.is_on())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OccupancyTimings {
    pub prewarm_ms: u64,
    pub min_activity_ms: u64,
    pub max_idle_ms: u64,
}

impl From<&ControlConfig> for OccupancyTimings {
    fn from(config: &ControlConfig) -> Self {
        Self {
            prewarm_ms: duration_ms(config.prewarm),
            min_activity_ms: duration_ms(config.min_activity),
            max_idle_ms: duration_ms(config.max_idle),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub from: OccupancyState,
    pub to: OccupancyState,
}

pub struct OccupancyMachine<H> {
    state: OccupancyState,
    previous: OccupancyState,
    initial: OccupancyState,
    timer_ms: u64,
    timings: OccupancyTimings,
    motion: Arc<MotionTracker>,
    heat: H,
    span: Span,
}

impl<H: HeatControl> OccupancyMachine<H> {
    pub fn new(config: &ControlConfig, motion: Arc<MotionTracker>, heat: H, now_ms: u64) -> Self {
        Self {
            state: OccupancyState::Init,
            previous: OccupancyState::Init,
            initial: config.initial_state,
            timer_ms: now_ms,
            timings: OccupancyTimings::from(config),
            motion,
            heat,
            span: tracing::info_span!("occupancy"),
        }
    }

    pub fn state(&self) -> OccupancyState {
        self.state
    }

    pub fn heat(&self) -> &H {
        &self.heat
    }

    pub fn elapsed_ms(&self, now_ms: u64) -> u64 {
        now_ms.saturating_sub(self.timer_ms)
    }

    pub fn status(&self, now_ms: u64) -> OccupancyStatus {
        OccupancyStatus {
            state: self.state.as_str(),
            in_state_ms: self.elapsed_ms(now_ms),
            since_activity_ms: self.motion.idle_ms(now_ms),
            recent_activity: self.motion.recent_activity(now_ms),
        }
    }

    pub fn tick(&mut self, now_ms: u64) -> Option<Transition> {
        let span = self.span.clone();
        let _entered = span.enter();
        let started_in = self.state;
        let entering = self.previous != started_in;

        debug!(
            state = %started_in,
            delta_ms = self.elapsed_ms(now_ms),
            lastactive_ms = self.motion.idle_ms(now_ms),
            "tick"
        );

        let next = match started_in {
            OccupancyState::Init => Some(self.initial),
            OccupancyState::Off => {
                if entering {
                    self.heat.disable_heat(now_ms);
                }
                None
            }
            OccupancyState::Prewarm => {
                if entering {
                    info!(
                        "PREWARM ends in {}",
                        format_duration(Duration::from_millis(self.timings.prewarm_ms))
                    );
                    self.heat.enable_heat(now_ms);
                }
                (self.elapsed_ms(now_ms) > self.timings.prewarm_ms)
                    .then_some(OccupancyState::Active)
            }
            OccupancyState::Idle => {
                if entering {
                    self.heat.disable_heat(now_ms);
                }
                self.motion
                    .recent_activity(now_ms)
                    .then_some(OccupancyState::Tracking)
            }
            OccupancyState::Tracking => {
                if entering {
                    info!(
                        min_activity_ms = self.timings.min_activity_ms,
                        recent_ms = self.motion.recent_window_ms(),
                        "tracking activity"
                    );
                    self.heat.enable_heat(now_ms);
                }
                if !self.motion.recent_activity(now_ms) {
                    Some(OccupancyState::Idle)
                } else if self.elapsed_ms(now_ms) > self.timings.min_activity_ms {
                    Some(OccupancyState::Active)
                } else {
                    None
                }
            }
            OccupancyState::Active => {
                if entering {
                    info!(max_idle_ms = self.timings.max_idle_ms, "room active");
                    self.heat.enable_heat(now_ms);
                }
                (self.motion.idle_ms(now_ms) > self.timings.max_idle_ms)
                    .then_some(OccupancyState::Idle)
            }
            OccupancyState::Locked => {
                if entering {
                    warn!("LOCKED has no control rules, holding current outputs");
                }
                None
            }
        };

        self.heat.reconcile(now_ms);
        let transition = next.map(|to| self.transition(to, now_ms));
        self.previous = started_in;
        transition
    }

    fn transition(&mut self, to: OccupancyState, now_ms: u64) -> Transition {
        let from = self.state;
        self.timer_ms = now_ms;
        self.previous = from;
        self.state = to;
        info!("{from} -> {to}");
        Transition { from, to }
    }

    /// Forces heat off regardless of the current state.
    pub fn shutdown(&mut self, now_ms: u64) {
        let _entered = self.span.enter();
        info!(state = %self.state, "shutting down, heat off");
        self.heat.shutdown(now_ms);
    }

    pub fn into_heat(self) -> H {
        self.heat
    }
}
