//! Optimistic on/off switch.
//!
//! A press shows the opposite of the last confirmed state straight away. The
//! assumption is dropped either when the host reports the same value, or when
//! the deadline passes, in which case the press is reported as failed.

use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SwitchState {
    Confirmed(bool),
    Pending {
        assumed: bool,
        /// Last value the host confirmed, restored on timeout.
        confirmed: bool,
        deadline: Instant,
    },
}

/// Reported when a pending assumption was never confirmed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub(crate) struct ToggleFailed {
    pub(crate) message: String,
}

#[derive(Debug, Clone)]
pub(crate) struct OptimisticSwitch {
    state: SwitchState,
    timeout: Duration,
}

impl OptimisticSwitch {
    pub(crate) fn new(timeout: Duration) -> Self {
        Self {
            state: SwitchState::Confirmed(false),
            timeout,
        }
    }

    #[cfg(test)]
    pub(crate) fn state(&self) -> SwitchState {
        self.state
    }

    /// What the view should show.
    pub(crate) fn display(&self) -> bool {
        match self.state {
            SwitchState::Confirmed(on) => on,
            SwitchState::Pending { assumed, .. } => assumed,
        }
    }

    pub(crate) fn is_pending(&self) -> bool {
        matches!(self.state, SwitchState::Pending { .. })
    }

    /// Assume the opposite of `real` until `now + timeout`. A second press
    /// re-arms the deadline.
    pub(crate) fn press(&mut self, real: bool, now: Instant) {
        self.state = SwitchState::Pending {
            assumed: !real,
            confirmed: real,
            deadline: now + self.timeout,
        };
    }

    /// Feed the host's current value.
    pub(crate) fn observe(&mut self, real: bool) {
        match self.state {
            SwitchState::Confirmed(_) => self.state = SwitchState::Confirmed(real),
            SwitchState::Pending { assumed, .. } if assumed == real => {
                self.state = SwitchState::Confirmed(real);
            }
            SwitchState::Pending {
                assumed, deadline, ..
            } => {
                self.state = SwitchState::Pending {
                    assumed,
                    confirmed: real,
                    deadline,
                };
            }
        }
    }

    /// Revert a pending assumption whose deadline has passed.
    pub(crate) fn expire(&mut self, now: Instant) -> Option<ToggleFailed> {
        match self.state {
            SwitchState::Pending {
                confirmed,
                deadline,
                ..
            } if now >= deadline => {
                self.state = SwitchState::Confirmed(confirmed);
                Some(ToggleFailed {
                    message: "Toggle operation timed out".to_string(),
                })
            }
            _ => None,
        }
    }

    /// Drop a pending assumption immediately, e.g. after a dispatch error.
    pub(crate) fn revert(&mut self) {
        if let SwitchState::Pending { confirmed, .. } = self.state {
            self.state = SwitchState::Confirmed(confirmed);
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
