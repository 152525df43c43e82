//! Bounce and cooldown gating for physical roll triggers.
//!
//! Two independent windows must both have passed for a trigger to count:
//!
//! - the **debounce** window since the last trigger that passed the bounce
//!   check (contact bounce of the button),
//! - the **cooldown** since the last accepted roll, which is long after a win
//!   and shorter after a loss so the animation can finish.

use crate::config::LinkTimings;
use std::time::Duration;
use tokio::time::Instant;

/// Outcome of the last roll, selecting the active cooldown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RollOutcome {
    Win,
    Lose,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateDecision {
    Accepted,
    /// Dropped as contact bounce.
    Bounced { since_last: Duration },
    /// Dropped because the previous roll is still cooling down.
    CoolingDown { remaining: Duration },
}

#[derive(Debug, Clone)]
pub struct RollGate {
    debounce: Duration,
    win_cooldown: Duration,
    lose_cooldown: Duration,
    current_cooldown: Duration,
    last_accepted_roll_at: Option<Instant>,
    last_command_at: Option<Instant>,
}

impl RollGate {
    pub fn new(timings: &LinkTimings) -> Self {
        Self {
            debounce: timings.debounce(),
            win_cooldown: timings.win_cooldown(),
            lose_cooldown: timings.lose_cooldown(),
            current_cooldown: timings.lose_cooldown(),
            last_accepted_roll_at: None,
            last_command_at: None,
        }
    }

    /// Runs a trigger seen at `now` through both windows, recording it if accepted.
    pub fn evaluate(&mut self, now: Instant) -> GateDecision {
        if let Some(last) = self.last_command_at {
            let since_last = now.saturating_duration_since(last);
            if since_last < self.debounce {
                return GateDecision::Bounced { since_last };
            }
        }
        self.last_command_at = Some(now);

        if let Some(last) = self.last_accepted_roll_at {
            let elapsed = now.saturating_duration_since(last);
            if elapsed < self.current_cooldown {
                return GateDecision::CoolingDown {
                    remaining: self.current_cooldown - elapsed,
                };
            }
        }
        self.last_accepted_roll_at = Some(now);

        GateDecision::Accepted
    }

    pub fn set_outcome(&mut self, outcome: RollOutcome) {
        self.current_cooldown = match outcome {
            RollOutcome::Win => self.win_cooldown,
            RollOutcome::Lose => self.lose_cooldown,
        };
    }

    /// Back to the lose cooldown; timestamps are kept.
    pub fn reset_cooldown(&mut self) {
        self.current_cooldown = self.lose_cooldown;
    }

    pub fn current_cooldown(&self) -> Duration {
        self.current_cooldown
    }
}
