//! Agent health as a pure state machine, no I/O in here.
//!
//! ```text
//! Healthy --failure--> Suspect --(threshold consecutive failures)--> Unhealthy
//!    ^                    |                                              |
//!    +------success-------+<-----------------success / probe-------------+
//! ```
use serde::{Deserialize, Serialize};
use std::fmt::Display;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentHealth {
    Healthy,
    /// Failed recently, still gets work
    Suspect,
    /// Gets no work until a probe succeeds
    Unhealthy,
}

impl Display for AgentHealth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AgentHealth::Healthy => write!(f, "healthy"),
            AgentHealth::Suspect => write!(f, "suspect"),
            AgentHealth::Unhealthy => write!(f, "unhealthy"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HealthEvent {
    Succeeded,
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthTransition {
    pub from: AgentHealth,
    pub to: AgentHealth,
    pub consecutive_failures: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthTracker {
    status: AgentHealth,
    consecutive_failures: u32,
    unhealthy_threshold: u32,
    last_error: Option<String>,
}

impl HealthTracker {
    pub fn new(unhealthy_threshold: u32) -> Self {
        Self {
            status: AgentHealth::Healthy,
            consecutive_failures: 0,
            unhealthy_threshold: unhealthy_threshold.max(1),
            last_error: None,
        }
    }

    pub fn status(&self) -> AgentHealth {
        self.status
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    pub fn is_eligible(&self) -> bool {
        self.status != AgentHealth::Unhealthy
    }

    /// Applies the event, returns the transition if the status changed.
    pub fn apply(&mut self, event: HealthEvent) -> Option<HealthTransition> {
        let from = self.status;
        match event {
            HealthEvent::Succeeded => {
                self.consecutive_failures = 0;
                self.status = AgentHealth::Healthy;
            }
            HealthEvent::Failed(error) => {
                self.consecutive_failures = self.consecutive_failures.saturating_add(1);
                self.last_error = Some(error);
                self.status = if self.consecutive_failures >= self.unhealthy_threshold {
                    AgentHealth::Unhealthy
                } else {
                    AgentHealth::Suspect
                };
            }
        }
        (from != self.status).then_some(HealthTransition {
            from,
            to: self.status,
            consecutive_failures: self.consecutive_failures,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fail() -> HealthEvent {
        HealthEvent::Failed("refused".to_string())
    }

    #[test]
    fn one_failure_makes_suspect_and_success_heals() {
        let mut tracker = HealthTracker::new(3);
        let transition = tracker.apply(fail()).unwrap();
        assert_eq!((transition.from, transition.to), (AgentHealth::Healthy, AgentHealth::Suspect));
        assert!(tracker.is_eligible());
        tracker.apply(HealthEvent::Succeeded);
        assert_eq!(tracker.status(), AgentHealth::Healthy);
        assert_eq!(tracker.consecutive_failures(), 0);
    }

    #[test]
    fn threshold_consecutive_failures_make_unhealthy() {
        let mut tracker = HealthTracker::new(3);
        tracker.apply(fail());
        assert_eq!(tracker.apply(fail()), None);
        let transition = tracker.apply(fail()).unwrap();
        assert_eq!(transition.to, AgentHealth::Unhealthy);
        assert_eq!(transition.consecutive_failures, 3);
        assert!(!tracker.is_eligible());
        // Failed probes keep it down
        assert_eq!(tracker.apply(fail()), None);
        let recovered = tracker.apply(HealthEvent::Succeeded).unwrap();
        assert_eq!((recovered.from, recovered.to), (AgentHealth::Unhealthy, AgentHealth::Healthy));
    }

    #[test]
    fn threshold_of_zero_behaves_like_one() {
        let mut tracker = HealthTracker::new(0);
        assert_eq!(tracker.apply(fail()).unwrap().to, AgentHealth::Unhealthy);
        assert_eq!(tracker.last_error(), Some("refused"));
    }
}
